//! Graceful shutdown coordination: an atomic flag queried by hot paths plus
//! a broadcast channel the worker loops select on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

pub type ShutdownReceiver = broadcast::Receiver<()>;

pub struct ShutdownHandler {
    flag: Arc<AtomicBool>,
    sender: broadcast::Sender<()>,
}

impl Default for ShutdownHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandler {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1);
        Self { flag: Arc::new(AtomicBool::new(false)), sender }
    }

    pub fn subscribe(&self) -> ShutdownReceiver {
        self.sender.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        if self.flag.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown signal raised");
        let _ = self.sender.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_reaches_subscribers() {
        let handler = ShutdownHandler::new();
        let mut rx = handler.subscribe();
        assert!(!handler.is_shutting_down());
        handler.trigger();
        assert!(handler.is_shutting_down());
        rx.recv().await.unwrap();
        // A second trigger is a no-op.
        handler.trigger();
    }
}
