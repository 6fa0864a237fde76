use std::path::Path;
use std::sync::Arc;

use quorum_crypto::Hash;
use rocksdb::{IteratorMode, Options, DB};
use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroize;

use crate::error::{Result, StorageError};

/// Durable per-seed DKG secrets of the local miner: the ephemeral encryption
/// key of round 1 and the master secret share of round 2. Records are kept
/// until the group created from the seed is dismissed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SkRecord {
    pub enc_seckey: Option<[u8; 32]>,
    pub msk: Option<[u8; 32]>,
    /// Height after which the record may be pruned (group dismiss height).
    pub expire_height: u64,
}

impl Drop for SkRecord {
    fn drop(&mut self) {
        if let Some(mut sk) = self.enc_seckey.take() {
            sk.zeroize();
        }
        if let Some(mut sk) = self.msk.take() {
            sk.zeroize();
        }
    }
}

/// One secret-store database file per configured instance index.
pub struct SkDb {
    db: Arc<DB>,
}

impl SkDb {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Merge new secret material into the record for `seed`. Present fields
    /// overwrite, absent fields keep the stored value, and the expiry is
    /// extended monotonically.
    pub fn upsert(&self, seed: &Hash, update: SkRecord) -> Result<()> {
        let mut record = self.get(seed)?.unwrap_or_default();
        if update.enc_seckey.is_some() {
            record.enc_seckey = update.enc_seckey;
        }
        if update.msk.is_some() {
            record.msk = update.msk;
        }
        record.expire_height = record.expire_height.max(update.expire_height);
        self.db.put(seed, bincode::serialize(&record)?)?;
        Ok(())
    }

    pub fn get(&self, seed: &Hash) -> Result<Option<SkRecord>> {
        match self.db.get(seed)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete all records expired at `height`. Returns the number pruned.
    pub fn prune(&self, height: u64) -> Result<usize> {
        let mut pruned = 0usize;
        for entry in self.db.iterator(IteratorMode::Start) {
            let (key, value) = entry?;
            let record: SkRecord = bincode::deserialize(&value)
                .map_err(|_| StorageError::Corrupted(hex::encode(&key)))?;
            if record.expire_height <= height {
                self.db.delete(&key)?;
                pruned += 1;
            }
        }
        if pruned > 0 {
            debug!(pruned, height, "pruned expired group secrets");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_merges_fields() {
        let dir = tempfile::tempdir().unwrap();
        let db = SkDb::open(dir.path()).unwrap();
        let seed = [1u8; 32];

        db.upsert(
            &seed,
            SkRecord { enc_seckey: Some([2u8; 32]), msk: None, expire_height: 100 },
        )
        .unwrap();
        db.upsert(
            &seed,
            SkRecord { enc_seckey: None, msk: Some([3u8; 32]), expire_height: 100 },
        )
        .unwrap();

        let rec = db.get(&seed).unwrap().unwrap();
        assert_eq!(rec.enc_seckey, Some([2u8; 32]));
        assert_eq!(rec.msk, Some([3u8; 32]));
    }

    #[test]
    fn test_prune_by_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let db = SkDb::open(dir.path()).unwrap();

        db.upsert(
            &[1u8; 32],
            SkRecord { enc_seckey: Some([1u8; 32]), msk: None, expire_height: 50 },
        )
        .unwrap();
        db.upsert(
            &[2u8; 32],
            SkRecord { enc_seckey: Some([1u8; 32]), msk: None, expire_height: 500 },
        )
        .unwrap();

        assert_eq!(db.prune(100).unwrap(), 1);
        assert!(db.get(&[1u8; 32]).unwrap().is_none());
        assert!(db.get(&[2u8; 32]).unwrap().is_some());
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let seed = [9u8; 32];
        {
            let db = SkDb::open(dir.path()).unwrap();
            db.upsert(
                &seed,
                SkRecord { enc_seckey: Some([7u8; 32]), msk: None, expire_height: 10 },
            )
            .unwrap();
        }
        let db = SkDb::open(dir.path()).unwrap();
        assert_eq!(db.get(&seed).unwrap().unwrap().enc_seckey, Some([7u8; 32]));
    }
}
