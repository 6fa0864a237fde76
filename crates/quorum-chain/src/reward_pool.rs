use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use quorum_core::types::Hash;
use quorum_core::{RewardPayload, Transaction, TxKind};

/// Reward transactions awaiting inclusion, indexed both by tx hash and by
/// the block hash they reward. A block hash is rewarded at most once.
pub struct RewardPool {
    pool: Mutex<LruCache<Hash, Transaction>>,
    block_index: Mutex<LruCache<Hash, Hash>>,
}

impl RewardPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            pool: Mutex::new(LruCache::new(NonZeroUsize::new(size * 10).unwrap())),
            block_index: Mutex::new(LruCache::new(NonZeroUsize::new(size).unwrap())),
        }
    }

    fn reward_block_hash(tx: &Transaction) -> Option<Hash> {
        if tx.kind != TxKind::Reward {
            return None;
        }
        rmp_serde::from_slice::<RewardPayload>(&tx.data)
            .ok()
            .map(|p| p.block_hash)
    }

    /// Admit a reward transaction. Returns false for duplicates and for a
    /// second reward targeting the same block.
    pub fn add(&self, tx: Transaction) -> bool {
        let block_hash = match Self::reward_block_hash(&tx) {
            Some(h) => h,
            None => return false,
        };
        let tx_hash = tx.hash();
        let mut pool = self.pool.lock();
        let mut index = self.block_index.lock();
        if pool.contains(&tx_hash) || index.contains(&block_hash) {
            return false;
        }
        pool.put(tx_hash, tx);
        index.put(block_hash, tx_hash);
        true
    }

    pub fn get(&self, tx_hash: &Hash) -> Option<Transaction> {
        self.pool.lock().get(tx_hash).cloned()
    }

    pub fn contains(&self, tx_hash: &Hash) -> bool {
        self.pool.lock().contains(tx_hash)
    }

    pub fn has_reward_for(&self, block_hash: &Hash) -> bool {
        self.block_index.lock().contains(block_hash)
    }

    /// Drop the reward for `block_hash`, e.g. once it is on chain.
    pub fn remove_by_block_hash(&self, block_hash: &Hash) -> bool {
        let mut index = self.block_index.lock();
        match index.pop(block_hash) {
            Some(tx_hash) => {
                self.pool.lock().pop(&tx_hash);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.pool.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;

    fn reward_tx(block_hash: Hash, value: u64) -> Transaction {
        let payload = RewardPayload {
            block_hash,
            group_seed: [1u8; 32],
            target_ids: vec![Address::zero()],
            value,
            group_sign: vec![],
        };
        Transaction {
            kind: TxKind::Reward,
            source: Address::zero(),
            target: None,
            value,
            nonce: 0,
            data: rmp_serde::to_vec(&payload).unwrap(),
        }
    }

    #[test]
    fn test_one_reward_per_block() {
        let pool = RewardPool::new(8);
        assert!(pool.add(reward_tx([1u8; 32], 10)));
        // Different tx, same rewarded block.
        assert!(!pool.add(reward_tx([1u8; 32], 20)));
        assert!(pool.has_reward_for(&[1u8; 32]));
    }

    #[test]
    fn test_remove_by_block_hash() {
        let pool = RewardPool::new(8);
        let tx = reward_tx([2u8; 32], 10);
        let tx_hash = tx.hash();
        pool.add(tx);
        assert!(pool.remove_by_block_hash(&[2u8; 32]));
        assert!(!pool.contains(&tx_hash));
        assert!(pool.is_empty());
    }

    #[test]
    fn test_non_reward_rejected() {
        let pool = RewardPool::new(8);
        let tx = Transaction {
            kind: TxKind::Transfer,
            source: Address::zero(),
            target: None,
            value: 1,
            nonce: 0,
            data: vec![],
        };
        assert!(!pool.add(tx));
    }
}
