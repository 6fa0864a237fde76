use std::sync::Arc;

use parking_lot::RwLock;

use crate::block::{Block, BlockHeader};

/// Events fired by the chain after a mutation has become durable.
#[derive(Debug, Clone)]
pub enum ChainEvent {
    /// A block was committed and the top pointer swapped.
    BlockAdded(Arc<Block>),
    /// The top changed without a commit at the tip (fork reset).
    TopRollback(Arc<BlockHeader>),
}

pub trait ChainListener: Send + Sync {
    fn on_chain_event(&self, event: &ChainEvent);
}

/// Append-only event bus owned by the chain.
///
/// Subscribers are called synchronously in subscription order, strictly after
/// the block is durable and the top pointer has been swapped. Registration
/// happens at boot; there is no unsubscribe.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, listener: Arc<dyn ChainListener>) {
        self.listeners.write().push(listener);
    }

    pub fn publish(&self, event: &ChainEvent) {
        let listeners = self.listeners.read().clone();
        for l in listeners {
            l.on_chain_event(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Recorder {
        order: Arc<AtomicUsize>,
        seen: AtomicUsize,
        expect: usize,
    }

    impl ChainListener for Recorder {
        fn on_chain_event(&self, _event: &ChainEvent) {
            let at = self.order.fetch_add(1, Ordering::SeqCst);
            assert_eq!(at, self.expect);
            self.seen.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_subscription_order_preserved() {
        let bus = EventBus::new();
        let order = Arc::new(AtomicUsize::new(0));
        let first = Arc::new(Recorder {
            order: order.clone(),
            seen: AtomicUsize::new(0),
            expect: 0,
        });
        let second = Arc::new(Recorder {
            order: order.clone(),
            seen: AtomicUsize::new(0),
            expect: 1,
        });
        bus.subscribe(first.clone());
        bus.subscribe(second.clone());

        let header = crate::block::BlockHeader {
            height: 1,
            cur_time: 0,
            prev_hash: [0u8; 32],
            random: [0u8; 32],
            proof: vec![],
            castor: crate::types::Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: [0u8; 32],
            signature: vec![],
        };
        bus.publish(&ChainEvent::TopRollback(Arc::new(header)));
        assert_eq!(first.seen.load(Ordering::SeqCst), 1);
        assert_eq!(second.seen.load(Ordering::SeqCst), 1);
    }
}
