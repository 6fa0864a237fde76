//! On-chain storage of DKG packets.
//!
//! Packets ride the chain as group transactions; applying a block turns them
//! into flat state entries at the address of the era seed, keyed
//! `version(1B) ‖ dataType(1B) ‖ sender(20B)`. Reads consult the durable
//! state, which is what makes every phase of the create routine idempotent
//! across restarts.

use std::sync::Arc;

use quorum_core::types::{Address, Hash};
use quorum_core::{Block, EncryptedPiecePacket, MpkPacket, OriginPiecePacket, Transaction, TxKind};
use quorum_storage::chain_db::StateOp;
use quorum_storage::ChainDb;
use tracing::warn;

use crate::error::Result;

const DATA_VERSION: u8 = 1;
const DATA_TYPE_PIECE: u8 = 1;
const DATA_TYPE_MPK: u8 = 2;
const DATA_TYPE_ORIGIN: u8 = 3;

/// Marker key at a seed's address; its presence triggers the origin-reveal
/// phase for that era.
const ORIGIN_PIECE_REQUIRED_KEY: &[u8] = b"originPieceRequired";

fn packet_key(seed: &Hash, data_type: u8, sender: &Address) -> Vec<u8> {
    let mut key = Vec::with_capacity(42);
    key.extend_from_slice(Address::from_hash(seed).as_ref());
    key.push(DATA_VERSION);
    key.push(data_type);
    key.extend_from_slice(sender.as_ref());
    key
}

fn type_prefix(seed: &Hash, data_type: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(22);
    key.extend_from_slice(Address::from_hash(seed).as_ref());
    key.push(DATA_VERSION);
    key.push(data_type);
    key
}

fn flag_key(seed: &Hash) -> Vec<u8> {
    let mut key = Vec::with_capacity(20 + ORIGIN_PIECE_REQUIRED_KEY.len());
    key.extend_from_slice(Address::from_hash(seed).as_ref());
    key.extend_from_slice(ORIGIN_PIECE_REQUIRED_KEY);
    key
}

/// Reader/applier of the on-chain group packet state.
#[derive(Clone)]
pub struct GroupStore {
    db: Arc<ChainDb>,
}

impl GroupStore {
    pub fn new(db: Arc<ChainDb>) -> Self {
        Self { db }
    }

    /// State mutations produced by the group transactions of `block`.
    /// First write per key wins; later duplicates are dropped with a warning
    /// (protocol deviation by the sender).
    pub fn apply_block(&self, block: &Block) -> Result<Vec<StateOp>> {
        let mut ops = Vec::new();
        for tx in &block.transactions {
            if let Some(op) = self.apply_tx(tx)? {
                ops.push(op);
            }
        }
        Ok(ops)
    }

    fn apply_tx(&self, tx: &Transaction) -> Result<Option<StateOp>> {
        let key = match tx.kind {
            TxKind::GroupPiece => {
                let packet: EncryptedPiecePacket = match rmp_serde::from_slice(&tx.data) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed piece packet dropped");
                        return Ok(None);
                    }
                };
                if packet.sender != tx.source {
                    warn!(sender = %packet.sender, "piece sender mismatch, dropped");
                    return Ok(None);
                }
                packet_key(&packet.seed, DATA_TYPE_PIECE, &packet.sender)
            }
            TxKind::GroupMpk => {
                let packet: MpkPacket = match rmp_serde::from_slice(&tx.data) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed mpk packet dropped");
                        return Ok(None);
                    }
                };
                if packet.sender != tx.source {
                    warn!(sender = %packet.sender, "mpk sender mismatch, dropped");
                    return Ok(None);
                }
                packet_key(&packet.seed, DATA_TYPE_MPK, &packet.sender)
            }
            TxKind::GroupOrigin => {
                let packet: OriginPiecePacket = match rmp_serde::from_slice(&tx.data) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(error = %e, "malformed origin packet dropped");
                        return Ok(None);
                    }
                };
                if packet.sender != tx.source {
                    warn!(sender = %packet.sender, "origin sender mismatch, dropped");
                    return Ok(None);
                }
                packet_key(&packet.seed, DATA_TYPE_ORIGIN, &packet.sender)
            }
            _ => return Ok(None),
        };
        if self.db.state_get(&key)?.is_some() {
            return Ok(None);
        }
        Ok(Some((key, Some(tx.data.clone()))))
    }

    /// Deletion ops undoing the group transactions of a removed block.
    pub fn rollback_block(&self, block: &Block) -> Vec<StateOp> {
        let mut ops = Vec::new();
        for tx in &block.transactions {
            let key = match tx.kind {
                TxKind::GroupPiece => rmp_serde::from_slice::<EncryptedPiecePacket>(&tx.data)
                    .ok()
                    .map(|p| packet_key(&p.seed, DATA_TYPE_PIECE, &p.sender)),
                TxKind::GroupMpk => rmp_serde::from_slice::<MpkPacket>(&tx.data)
                    .ok()
                    .map(|p| packet_key(&p.seed, DATA_TYPE_MPK, &p.sender)),
                TxKind::GroupOrigin => rmp_serde::from_slice::<OriginPiecePacket>(&tx.data)
                    .ok()
                    .map(|p| packet_key(&p.seed, DATA_TYPE_ORIGIN, &p.sender)),
                _ => None,
            };
            if let Some(key) = key {
                ops.push((key, None));
            }
        }
        ops
    }

    /// All uploaded encrypted share pieces for the seed, in sender key order.
    pub fn pieces(&self, seed: &Hash) -> Result<Vec<EncryptedPiecePacket>> {
        let rows = self.db.state_prefix(&type_prefix(seed, DATA_TYPE_PIECE))?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            match rmp_serde::from_slice(&value) {
                Ok(p) => out.push(p),
                Err(e) => warn!(error = %e, "corrupt piece row skipped"),
            }
        }
        Ok(out)
    }

    pub fn mpks(&self, seed: &Hash) -> Result<Vec<MpkPacket>> {
        let rows = self.db.state_prefix(&type_prefix(seed, DATA_TYPE_MPK))?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            match rmp_serde::from_slice(&value) {
                Ok(p) => out.push(p),
                Err(e) => warn!(error = %e, "corrupt mpk row skipped"),
            }
        }
        Ok(out)
    }

    pub fn origins(&self, seed: &Hash) -> Result<Vec<OriginPiecePacket>> {
        let rows = self.db.state_prefix(&type_prefix(seed, DATA_TYPE_ORIGIN))?;
        let mut out = Vec::with_capacity(rows.len());
        for (_, value) in rows {
            match rmp_serde::from_slice(&value) {
                Ok(p) => out.push(p),
                Err(e) => warn!(error = %e, "corrupt origin row skipped"),
            }
        }
        Ok(out)
    }

    pub fn has_sent_piece(&self, seed: &Hash, sender: &Address) -> Result<bool> {
        Ok(self.db.state_get(&packet_key(seed, DATA_TYPE_PIECE, sender))?.is_some())
    }

    pub fn has_sent_mpk(&self, seed: &Hash, sender: &Address) -> Result<bool> {
        Ok(self.db.state_get(&packet_key(seed, DATA_TYPE_MPK, sender))?.is_some())
    }

    pub fn has_sent_origin(&self, seed: &Hash, sender: &Address) -> Result<bool> {
        Ok(self.db.state_get(&packet_key(seed, DATA_TYPE_ORIGIN, sender))?.is_some())
    }

    pub fn is_origin_required(&self, seed: &Hash) -> Result<bool> {
        Ok(self.db.state_get(&flag_key(seed))?.is_some())
    }

    /// State op raising the origin-reveal flag for an era. Written by the
    /// dispute path; exposed for it and for tests.
    pub fn require_origin_op(seed: &Hash) -> StateOp {
        (flag_key(seed), Some(vec![1]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece_tx(seed: Hash, sender: Address) -> Transaction {
        let packet = EncryptedPiecePacket {
            seed,
            sender,
            pubkey0: vec![1],
            enc_pubkey: vec![2],
            pieces: vec![[0u8; 32]],
        };
        Transaction {
            kind: TxKind::GroupPiece,
            source: sender,
            target: None,
            value: 0,
            nonce: 0,
            data: rmp_serde::to_vec(&packet).unwrap(),
        }
    }

    fn store() -> (tempfile::TempDir, GroupStore, Arc<ChainDb>) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChainDb::open(dir.path()).unwrap());
        (dir, GroupStore::new(db.clone()), db)
    }

    fn commit_state(db: &ChainDb, ops: &[StateOp]) {
        // Write state rows directly through a throwaway block commit.
        let header = quorum_core::BlockHeader {
            height: 1,
            cur_time: 0,
            prev_hash: [1u8; 32],
            random: [0u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        };
        db.commit_block(&Block::new(header, vec![]), ops).unwrap();
    }

    #[test]
    fn test_apply_and_read_back() {
        let (_dir, store, db) = store();
        let seed = [7u8; 32];
        let sender = Address::new([1u8; 20]);

        let block = Block::new(
            quorum_core::BlockHeader {
                height: 1,
                cur_time: 0,
                prev_hash: [1u8; 32],
                random: [0u8; 32],
                proof: vec![],
                castor: sender,
                group_seed: [0u8; 32],
                total_qn: 0,
                tx_root: [0u8; 32],
                signature: vec![],
            },
            vec![piece_tx(seed, sender)],
        );
        let ops = store.apply_block(&block).unwrap();
        assert_eq!(ops.len(), 1);
        commit_state(&db, &ops);

        assert!(store.has_sent_piece(&seed, &sender).unwrap());
        assert!(!store.has_sent_mpk(&seed, &sender).unwrap());
        assert_eq!(store.pieces(&seed).unwrap().len(), 1);
        // Re-applying the same packet produces no new ops.
        assert!(store.apply_block(&block).unwrap().is_empty());
    }

    #[test]
    fn test_sender_mismatch_dropped() {
        let (_dir, store, _db) = store();
        let mut tx = piece_tx([7u8; 32], Address::new([1u8; 20]));
        tx.source = Address::new([2u8; 20]);
        assert!(store.apply_tx(&tx).unwrap().is_none());
    }

    #[test]
    fn test_origin_required_flag() {
        let (_dir, store, db) = store();
        let seed = [9u8; 32];
        assert!(!store.is_origin_required(&seed).unwrap());
        commit_state(&db, &[GroupStore::require_origin_op(&seed)]);
        assert!(store.is_origin_required(&seed).unwrap());
    }
}
