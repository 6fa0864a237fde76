use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;
use quorum_core::types::Hash;
use quorum_core::Transaction;

const DEFAULT_POOL_SIZE: usize = 4096;

/// Transaction pool: thread-safe, one lock per operation, bounded by LRU
/// size. Group DKG packets enter the chain through here as transactions.
pub struct TxPool {
    txs: Mutex<LruCache<Hash, Transaction>>,
}

impl Default for TxPool {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_POOL_SIZE)
    }
}

impl TxPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            txs: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
        }
    }

    /// Admit a transaction. Returns false for duplicates.
    pub fn add(&self, tx: Transaction) -> bool {
        let hash = tx.hash();
        let mut txs = self.txs.lock();
        if txs.contains(&hash) {
            return false;
        }
        txs.put(hash, tx);
        true
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.txs.lock().contains(hash)
    }

    /// Drain up to `max` transactions for a block under construction.
    pub fn take(&self, max: usize) -> Vec<Transaction> {
        let mut txs = self.txs.lock();
        let mut out = Vec::with_capacity(max.min(txs.len()));
        while out.len() < max {
            match txs.pop_lru() {
                Some((_, tx)) => out.push(tx),
                None => break,
            }
        }
        out
    }

    /// Remove transactions included in a committed block.
    pub fn remove_committed(&self, hashes: impl IntoIterator<Item = Hash>) {
        let mut txs = self.txs.lock();
        for hash in hashes {
            txs.pop(&hash);
        }
    }

    pub fn len(&self) -> usize {
        self.txs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;
    use quorum_core::TxKind;

    fn tx(nonce: u64) -> Transaction {
        Transaction {
            kind: TxKind::Transfer,
            source: Address::zero(),
            target: None,
            value: 1,
            nonce,
            data: vec![],
        }
    }

    #[test]
    fn test_add_dedup_take() {
        let pool = TxPool::with_capacity(10);
        assert!(pool.add(tx(1)));
        assert!(!pool.add(tx(1)));
        assert!(pool.add(tx(2)));
        assert_eq!(pool.len(), 2);

        let taken = pool.take(5);
        assert_eq!(taken.len(), 2);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_bounded_by_lru() {
        let pool = TxPool::with_capacity(2);
        pool.add(tx(1));
        pool.add(tx(2));
        pool.add(tx(3));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(&tx(1).hash()));
    }
}
