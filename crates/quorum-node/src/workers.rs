//! The node's worker loops: the proposer loop fed by top-block events and
//! the fork worker that drives dialogue deadlines.

use std::sync::Arc;
use std::time::{Duration, Instant};

use quorum_core::{BlockHeader, ChainEvent, ChainListener};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::env::NodeEnv;
use crate::shutdown::ShutdownHandler;

const FORK_TICK_INTERVAL: Duration = Duration::from_secs(1);
const TOP_FEED_CAPACITY: usize = 64;

/// Bridges chain events into the proposer worker's channel. Uses a
/// non-blocking send so the event bus never stalls on a slow proposer; a
/// dropped tick is caught up by the next block.
struct TopFeed {
    tx: mpsc::Sender<Arc<BlockHeader>>,
}

impl ChainListener for TopFeed {
    fn on_chain_event(&self, event: &ChainEvent) {
        let header = match event {
            ChainEvent::BlockAdded(block) => Arc::new(block.header.clone()),
            ChainEvent::TopRollback(header) => header.clone(),
        };
        if self.tx.try_send(header).is_err() {
            debug!("proposer feed full, top tick dropped");
        }
    }
}

pub fn spawn_workers(env: &NodeEnv, shutdown: &ShutdownHandler) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Proposer worker: one cast attempt per observed top block.
    let (top_tx, mut top_rx) = mpsc::channel(TOP_FEED_CAPACITY);
    env.chain.events().subscribe(Arc::new(TopFeed { tx: top_tx.clone() }));
    // Prime the loop with the current top so a restarted node resumes.
    let _ = top_tx.try_send(env.chain.top_header());

    let proposer = env.proposer.clone();
    let mut shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                top = top_rx.recv() => {
                    let Some(top) = top else { break };
                    match proposer.on_top_block(&top) {
                        Ok(Some(block)) => {
                            debug!(height = block.height(), "cast attempt sent");
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "proposer cycle failed"),
                    }
                }
            }
        }
        debug!("proposer worker stopped");
    }));

    // Fork worker: dialogue deadlines are wall-clock checks, driven here.
    let fork = env.fork.clone();
    let mut shutdown_rx = shutdown.subscribe();
    handles.push(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(FORK_TICK_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => fork.tick(Instant::now()),
            }
        }
        debug!("fork worker stopped");
    }));

    handles
}
