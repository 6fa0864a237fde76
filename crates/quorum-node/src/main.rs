//! QuorumChain node binary: load configuration and keystore, build the
//! environment, run the workers until a shutdown signal arrives.

mod config;
mod env;
mod keystore;
mod miner_registry;
mod sender;
mod shutdown;
mod workers;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::env::NodeEnv;
use crate::shutdown::ShutdownHandler;

#[derive(Parser, Debug)]
#[command(name = "quorum-node", about = "QuorumChain proof-of-stake node")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: PathBuf,

    /// Override the configured data directory.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = match Config::load(&cli.config) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration unusable");
            return ExitCode::FAILURE;
        }
    };
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = data_dir;
    }

    // Storage or keystore failures here are fatal: abort before any
    // networking starts.
    let env = match NodeEnv::build(config) {
        Ok(env) => env,
        Err(e) => {
            error!(error = %e, "node environment failed to start");
            return ExitCode::FAILURE;
        }
    };
    info!(name = %env.config.node.name, height = env.chain.height(), "node started");

    let shutdown = ShutdownHandler::new();
    let handles = workers::spawn_workers(&env, &shutdown);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal listener failed");
    }
    info!("shutting down");
    shutdown.trigger();
    env.chain.shutdown();

    for handle in handles {
        let _ = handle.await;
    }
    // The routine keeps a sender clone alive through the event bus, so the
    // sk-store worker is stopped directly once the loops have drained.
    env.sk_handle.abort();

    info!("node stopped");
    ExitCode::SUCCESS
}
