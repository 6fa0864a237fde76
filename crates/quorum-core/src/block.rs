use quorum_crypto::{keccak256, keccak_concat};
use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;
use crate::types::{Address, Hash};

/// Block header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u64,
    /// Proposal time, unix seconds.
    pub cur_time: u64,
    pub prev_hash: Hash,
    /// Beacon randomness: derived from the parent's random and the
    /// proposer's VRF output.
    pub random: Hash,
    /// VRF proof of proposer eligibility.
    pub proof: Vec<u8>,
    /// Proposer id.
    pub castor: Address,
    /// Seed of the verify group that signs this block.
    pub group_seed: Hash,
    /// Cumulative chain weight.
    pub total_qn: u64,
    pub tx_root: Hash,
    /// Threshold signature of the signing group; empty until aggregated.
    pub signature: Vec<u8>,
}

impl BlockHeader {
    /// Block hash over all fields except the group signature, so the hash is
    /// stable before and after aggregation.
    pub fn hash(&self) -> Hash {
        keccak_concat(&[
            &self.height.to_le_bytes(),
            &self.cur_time.to_le_bytes(),
            &self.prev_hash,
            &self.random,
            &(self.proof.len() as u32).to_le_bytes(),
            &self.proof,
            self.castor.as_ref(),
            &self.group_seed,
            &self.total_qn.to_le_bytes(),
            &self.tx_root,
        ])
    }

    /// Heaviest-chain rule: larger total quality number wins, ties go to the
    /// smaller block hash.
    pub fn heavier_than(&self, other: &BlockHeader) -> bool {
        if self.total_qn != other.total_qn {
            return self.total_qn > other.total_qn;
        }
        self.hash() < other.hash()
    }

    pub fn validate(&self) -> crate::Result<()> {
        if self.height > 0 && self.prev_hash == crate::types::EMPTY_HASH {
            return Err(crate::CoreError::InvalidBlock(
                "non-genesis block without parent".to_string(),
            ));
        }
        if self.proof.len() > 256 {
            return Err(crate::CoreError::InvalidBlock(format!(
                "oversized proof: {}",
                self.proof.len()
            )));
        }
        Ok(())
    }
}

/// Block structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

impl Block {
    pub fn new(header: BlockHeader, transactions: Vec<Transaction>) -> Self {
        Self { header, transactions }
    }

    pub fn hash(&self) -> Hash {
        self.header.hash()
    }

    pub fn height(&self) -> u64 {
        self.header.height
    }

    /// Root of the transaction list: hash over the ordered tx hashes.
    pub fn compute_tx_root(transactions: &[Transaction]) -> Hash {
        let mut data = Vec::with_capacity(transactions.len() * 32);
        for tx in transactions {
            data.extend_from_slice(&tx.hash());
        }
        keccak256(&data)
    }

    pub fn validate(&self) -> crate::Result<()> {
        self.header.validate()?;
        if Self::compute_tx_root(&self.transactions) != self.header.tx_root {
            return Err(crate::CoreError::InvalidBlock("tx root mismatch".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(height: u64, total_qn: u64) -> BlockHeader {
        BlockHeader {
            height,
            cur_time: 1000 + height,
            prev_hash: [1u8; 32],
            random: [2u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [3u8; 32],
            total_qn,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        }
    }

    #[test]
    fn test_hash_ignores_signature() {
        let mut h = header(5, 10);
        let before = h.hash();
        h.signature = vec![0xab; 48];
        assert_eq!(before, h.hash());
    }

    #[test]
    fn test_heavier_than_prefers_total_qn() {
        let a = header(5, 11);
        let b = header(5, 10);
        assert!(a.heavier_than(&b));
        assert!(!b.heavier_than(&a));
    }

    #[test]
    fn test_heavier_than_tie_breaks_on_hash() {
        let a = header(5, 10);
        let b = header(6, 10);
        assert_eq!(a.heavier_than(&b), a.hash() < b.hash());
    }

    #[test]
    fn test_tx_root_checked() {
        let mut b = Block::new(header(1, 1), vec![]);
        assert!(b.validate().is_ok());
        b.header.tx_root = [9u8; 32];
        assert!(b.validate().is_err());
    }
}
