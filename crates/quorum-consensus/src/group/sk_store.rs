//! Single-consumer worker in front of the DKG secret store. Producers
//! enqueue secret upserts and height ticks through a bounded channel; the
//! worker is the only writer, and closing the channel shuts it down.

use std::sync::Arc;

use quorum_crypto::Hash;
use quorum_storage::{SkDb, SkRecord};
use tokio::sync::mpsc;
use tracing::{debug, warn};

const SK_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub enum SkCommand {
    /// Merge secret material for a seed.
    Store { seed: Hash, record: SkRecord },
    /// A new top height was observed; prune expired records.
    Tick { height: u64 },
}

/// Spawn the store worker. Drop the sender to stop it.
pub fn spawn_sk_worker(
    db: Arc<SkDb>,
) -> (mpsc::Sender<SkCommand>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(SK_CHANNEL_CAPACITY);
    let handle = tokio::spawn(async move {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                SkCommand::Store { seed, record } => {
                    if let Err(e) = db.upsert(&seed, record) {
                        warn!(error = %e, "failed to persist group secret");
                    }
                }
                SkCommand::Tick { height } => {
                    if let Err(e) = db.prune(height) {
                        warn!(error = %e, "secret prune failed");
                    }
                }
            }
        }
        debug!("sk store worker stopped");
    });
    (tx, handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_prune_through_channel() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SkDb::open(dir.path()).unwrap());
        let (tx, handle) = spawn_sk_worker(db.clone());

        tx.send(SkCommand::Store {
            seed: [1u8; 32],
            record: SkRecord {
                enc_seckey: Some([5u8; 32]),
                msk: None,
                expire_height: 10,
            },
        })
        .await
        .unwrap();
        tx.send(SkCommand::Tick { height: 100 }).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        // The record expired at height 10 and the tick at 100 pruned it.
        assert!(db.get(&[1u8; 32]).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_stops_on_channel_close() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(SkDb::open(dir.path()).unwrap());
        let (tx, handle) = spawn_sk_worker(db);
        drop(tx);
        handle.await.unwrap();
    }
}
