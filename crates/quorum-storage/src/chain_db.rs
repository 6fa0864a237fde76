use std::path::Path;
use std::sync::Arc;

use quorum_core::{Block, BlockHeader, Transaction, VerifyGroup};
use quorum_crypto::Hash;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};

use crate::error::{Result, StorageError};

/// Column family names
const CF_BLOCKS: &str = "blocks";
const CF_HEADERS: &str = "headers";
const CF_HEIGHT_TO_HASH: &str = "height_to_hash";
const CF_TRANSACTIONS: &str = "transactions";
const CF_STATE: &str = "state";
const CF_GROUPS: &str = "groups";
const CF_META: &str = "meta";

const META_TOP: &[u8] = b"top";
const META_CHECKPOINT: &[u8] = b"checkpoint";
const META_TOP_GROUP: &[u8] = b"top_group";

/// A state mutation applied atomically with a block commit.
/// `None` deletes the key.
pub type StateOp = (Vec<u8>, Option<Vec<u8>>);

/// Chain database: blocks, headers, the height index, transaction bodies,
/// the flat on-chain state (DKG packets live here) and the group registry.
pub struct ChainDb {
    db: Arc<DB>,
}

impl ChainDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        opts.set_max_open_files(10000);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let cfs = vec![
            ColumnFamilyDescriptor::new(CF_BLOCKS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HEADERS, Options::default()),
            ColumnFamilyDescriptor::new(CF_HEIGHT_TO_HASH, Options::default()),
            ColumnFamilyDescriptor::new(CF_TRANSACTIONS, Options::default()),
            ColumnFamilyDescriptor::new(CF_STATE, Options::default()),
            ColumnFamilyDescriptor::new(CF_GROUPS, Options::default()),
            ColumnFamilyDescriptor::new(CF_META, Options::default()),
        ];

        let db = DB::open_cf_descriptors(&opts, path, cfs)?;
        Ok(Self { db: Arc::new(db) })
    }

    fn cf(&self, name: &'static str) -> Result<&rocksdb::ColumnFamily> {
        self.db.cf_handle(name).ok_or(StorageError::ColumnFamily(name))
    }

    /// Commit one block durably: block body, header, height index,
    /// transaction bodies, accompanying state mutations and the top pointer,
    /// all in a single write batch.
    pub fn commit_block(&self, block: &Block, state_ops: &[StateOp]) -> Result<()> {
        let hash = block.hash();
        let mut batch = WriteBatch::default();

        batch.put_cf(self.cf(CF_BLOCKS)?, hash, bincode::serialize(block)?);
        batch.put_cf(self.cf(CF_HEADERS)?, hash, bincode::serialize(&block.header)?);
        batch.put_cf(
            self.cf(CF_HEIGHT_TO_HASH)?,
            block.header.height.to_be_bytes(),
            hash,
        );
        for tx in &block.transactions {
            batch.put_cf(self.cf(CF_TRANSACTIONS)?, tx.hash(), bincode::serialize(tx)?);
        }
        for (key, value) in state_ops {
            match value {
                Some(v) => batch.put_cf(self.cf(CF_STATE)?, key, v),
                None => batch.delete_cf(self.cf(CF_STATE)?, key),
            }
        }
        batch.put_cf(self.cf(CF_META)?, META_TOP, hash);

        self.db.write(batch)?;
        Ok(())
    }

    /// Remove blocks above `ancestor` and repoint the top, in one batch.
    /// State written by the removed blocks is rolled back by the caller
    /// through `state_ops`.
    pub fn rewind_to(
        &self,
        ancestor: &BlockHeader,
        removed: &[Block],
        state_ops: &[StateOp],
    ) -> Result<()> {
        let mut batch = WriteBatch::default();
        for block in removed {
            let hash = block.hash();
            batch.delete_cf(self.cf(CF_BLOCKS)?, hash);
            batch.delete_cf(self.cf(CF_HEADERS)?, hash);
            batch.delete_cf(self.cf(CF_HEIGHT_TO_HASH)?, block.header.height.to_be_bytes());
            for tx in &block.transactions {
                batch.delete_cf(self.cf(CF_TRANSACTIONS)?, tx.hash());
            }
        }
        for (key, value) in state_ops {
            match value {
                Some(v) => batch.put_cf(self.cf(CF_STATE)?, key, v),
                None => batch.delete_cf(self.cf(CF_STATE)?, key),
            }
        }
        batch.put_cf(self.cf(CF_META)?, META_TOP, ancestor.hash());
        self.db.write(batch)?;
        Ok(())
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Result<Option<Block>> {
        match self.db.get_cf(self.cf(CF_BLOCKS)?, hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Result<Option<BlockHeader>> {
        match self.db.get_cf(self.cf(CF_HEADERS)?, hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn hash_by_height(&self, height: u64) -> Result<Option<Hash>> {
        match self.db.get_cf(self.cf(CF_HEIGHT_TO_HASH)?, height.to_be_bytes())? {
            Some(bytes) => {
                let hash: Hash = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted(format!("height {height}")))?;
                Ok(Some(hash))
            }
            None => Ok(None),
        }
    }

    pub fn transaction(&self, hash: &Hash) -> Result<Option<Transaction>> {
        match self.db.get_cf(self.cf(CF_TRANSACTIONS)?, hash)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Highest indexed height at or below `height`, walking the height index
    /// backwards.
    pub fn height_floor(&self, height: u64) -> Result<Option<u64>> {
        let cf = self.cf(CF_HEIGHT_TO_HASH)?;
        let key = height.to_be_bytes();
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(&key, Direction::Reverse));
        match iter.next() {
            Some(entry) => {
                let (k, _) = entry?;
                let arr: [u8; 8] = k
                    .as_ref()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("height index".to_string()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }

    pub fn state_get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get_cf(self.cf(CF_STATE)?, key)?)
    }

    /// All state entries whose key starts with `prefix`, in key order.
    pub fn state_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let cf = self.cf(CF_STATE)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        for entry in iter {
            let (k, v) = entry?;
            if !k.starts_with(prefix) {
                break;
            }
            out.push((k.to_vec(), v.to_vec()));
        }
        Ok(out)
    }

    // Group rows are keyed `s ++ seed`, the creation-order index `h ++ height`,
    // so the two key spaces cannot collide inside the column family.
    fn group_key(seed: &Hash) -> Vec<u8> {
        let mut key = Vec::with_capacity(33);
        key.push(b's');
        key.extend_from_slice(seed);
        key
    }

    pub fn put_group(&self, group: &VerifyGroup) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.put_cf(
            self.cf(CF_GROUPS)?,
            Self::group_key(&group.seed),
            bincode::serialize(group)?,
        );
        let mut idx_key = Vec::with_capacity(9);
        idx_key.push(b'h');
        idx_key.extend_from_slice(&group.group_height.to_be_bytes());
        batch.put_cf(self.cf(CF_GROUPS)?, idx_key, group.seed);
        batch.put_cf(self.cf(CF_META)?, META_TOP_GROUP, group.seed);
        self.db.write(batch)?;
        Ok(())
    }

    pub fn group_by_seed(&self, seed: &Hash) -> Result<Option<VerifyGroup>> {
        match self.db.get_cf(self.cf(CF_GROUPS)?, Self::group_key(seed))? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All groups in creation order (group height ascending).
    pub fn groups_in_order(&self) -> Result<Vec<VerifyGroup>> {
        let cf = self.cf(CF_GROUPS)?;
        let mut out = Vec::new();
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(b"h", Direction::Forward));
        for entry in iter {
            let (k, v) = entry?;
            if k.first() != Some(&b'h') || k.len() != 9 {
                break;
            }
            let seed: Hash = v
                .as_ref()
                .try_into()
                .map_err(|_| StorageError::Corrupted("group index".to_string()))?;
            if let Some(g) = self.group_by_seed(&seed)? {
                out.push(g);
            }
        }
        Ok(out)
    }

    pub fn top_group_seed(&self) -> Result<Option<Hash>> {
        match self.db.get_cf(self.cf(CF_META)?, META_TOP_GROUP)? {
            Some(bytes) => Ok(Some(bytes.as_slice().try_into().map_err(|_| {
                StorageError::Corrupted("top group".to_string())
            })?)),
            None => Ok(None),
        }
    }

    pub fn top_hash(&self) -> Result<Option<Hash>> {
        match self.db.get_cf(self.cf(CF_META)?, META_TOP)? {
            Some(bytes) => Ok(Some(bytes.as_slice().try_into().map_err(|_| {
                StorageError::Corrupted("top pointer".to_string())
            })?)),
            None => Ok(None),
        }
    }

    pub fn put_checkpoint(&self, height: u64) -> Result<()> {
        self.db
            .put_cf(self.cf(CF_META)?, META_CHECKPOINT, height.to_be_bytes())?;
        Ok(())
    }

    pub fn checkpoint(&self) -> Result<Option<u64>> {
        match self.db.get_cf(self.cf(CF_META)?, META_CHECKPOINT)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| StorageError::Corrupted("checkpoint".to_string()))?;
                Ok(Some(u64::from_be_bytes(arr)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;

    fn block(height: u64, prev_hash: Hash) -> Block {
        let header = BlockHeader {
            height,
            cur_time: 1000 + height,
            prev_hash,
            random: [height as u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: height,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        };
        Block::new(header, vec![])
    }

    #[test]
    fn test_commit_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();

        let b = block(1, [0u8; 32]);
        let hash = b.hash();
        db.commit_block(&b, &[(b"k1".to_vec(), Some(b"v1".to_vec()))]).unwrap();

        assert_eq!(db.top_hash().unwrap(), Some(hash));
        assert_eq!(db.hash_by_height(1).unwrap(), Some(hash));
        assert!(db.block_by_hash(&hash).unwrap().is_some());
        assert_eq!(db.state_get(b"k1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_rewind_removes_blocks_and_rolls_back_state() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();

        let b1 = block(1, [0u8; 32]);
        db.commit_block(&b1, &[]).unwrap();
        let b2 = block(2, b1.hash());
        db.commit_block(&b2, &[(b"k".to_vec(), Some(b"v".to_vec()))]).unwrap();

        db.rewind_to(&b1.header, &[b2.clone()], &[(b"k".to_vec(), None)]).unwrap();
        assert_eq!(db.top_hash().unwrap(), Some(b1.hash()));
        assert!(db.block_by_hash(&b2.hash()).unwrap().is_none());
        assert_eq!(db.hash_by_height(2).unwrap(), None);
        assert_eq!(db.state_get(b"k").unwrap(), None);
    }

    #[test]
    fn test_height_floor() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();

        let b1 = block(1, [0u8; 32]);
        db.commit_block(&b1, &[]).unwrap();
        let b5 = block(5, b1.hash());
        db.commit_block(&b5, &[]).unwrap();

        assert_eq!(db.height_floor(4).unwrap(), Some(1));
        assert_eq!(db.height_floor(5).unwrap(), Some(5));
        assert_eq!(db.height_floor(0).unwrap(), None);
    }

    #[test]
    fn test_group_registry_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = ChainDb::open(dir.path()).unwrap();

        for i in 0..3u64 {
            let g = VerifyGroup {
                seed: [i as u8 + 1; 32],
                work_height: 100 * i,
                dismiss_height: 100 * i + 1000,
                group_height: i,
                threshold: 3,
                pubkey: vec![],
                members: vec![],
                pre_seed: [0u8; 32],
            };
            db.put_group(&g).unwrap();
        }
        let groups = db.groups_in_order().unwrap();
        assert_eq!(groups.len(), 3);
        assert!(groups.windows(2).all(|w| w[0].group_height < w[1].group_height));
        assert_eq!(db.top_group_seed().unwrap(), Some([3u8; 32]));
    }
}
