use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use quorum_core::types::{Hash, EMPTY_HASH};
use quorum_core::{Block, BlockHeader, ChainEvent, EventBus, VerifyGroup};
use quorum_storage::chain_db::StateOp;
use quorum_storage::ChainDb;
use tracing::{debug, info, warn};

use crate::checkpoint::CpChecker;
use crate::error::{ChainError, Result};
use crate::group_store::GroupStore;

const BLOCK_CACHE_SIZE: usize = 256;

/// Consensus-side verification of an incoming block: threshold signature of
/// the selected group plus the proposer's VRF proof. Registered by the
/// consensus layer at boot.
pub trait BlockVerifier: Send + Sync {
    fn verify_block(&self, header: &BlockHeader, prev: &BlockHeader) -> Result<()>;
}

/// Group formation hook. Called after every commit; returns a freshly formed
/// group when the committed height closes a DKG era.
pub trait GroupCreateChecker: Send + Sync {
    fn try_create_group(&self, height: u64) -> Option<VerifyGroup>;
}

struct ChainTop {
    header: Arc<BlockHeader>,
}

/// The block chain: single writer behind a `RwLock`, many readers.
///
/// A commit is durable (one write batch) before the top pointer is swapped,
/// and event-bus subscribers run strictly after the swap. Fork resets go
/// through [`BlockChain::reset_top`], which takes the same write lock, so
/// reset and block addition are mutually exclusive.
pub struct BlockChain {
    db: Arc<ChainDb>,
    group_store: GroupStore,
    top: RwLock<ChainTop>,
    events: EventBus,
    cp: CpChecker,
    running: AtomicBool,
    verifier: RwLock<Option<Arc<dyn BlockVerifier>>>,
    group_checker: RwLock<Option<Arc<dyn GroupCreateChecker>>>,
    block_cache: Mutex<LruCache<Hash, Arc<Block>>>,
}

impl BlockChain {
    /// Open the chain, committing `genesis` if the database is empty.
    pub fn new(db: Arc<ChainDb>, cp: CpChecker, genesis: Block) -> Result<Arc<Self>> {
        let group_store = GroupStore::new(db.clone());
        let top_header = match db.top_hash()? {
            Some(hash) => db
                .header_by_hash(&hash)?
                .ok_or(ChainError::BlockNotFound(hash))?,
            None => {
                info!(hash = %hex::encode(genesis.hash()), "committing genesis block");
                db.commit_block(&genesis, &[])?;
                genesis.header.clone()
            }
        };
        cp.rebuild_votes(top_header.height);
        info!(height = top_header.height, "chain opened");
        Ok(Arc::new(Self {
            db,
            group_store,
            top: RwLock::new(ChainTop { header: Arc::new(top_header) }),
            events: EventBus::new(),
            cp,
            running: AtomicBool::new(true),
            verifier: RwLock::new(None),
            group_checker: RwLock::new(None),
            block_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(BLOCK_CACHE_SIZE).unwrap(),
            )),
        }))
    }

    pub fn set_verifier(&self, verifier: Arc<dyn BlockVerifier>) {
        *self.verifier.write() = Some(verifier);
    }

    pub fn set_group_checker(&self, checker: Arc<dyn GroupCreateChecker>) {
        *self.group_checker.write() = Some(checker);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn group_store(&self) -> &GroupStore {
        &self.group_store
    }

    pub fn checkpoint(&self) -> &CpChecker {
        &self.cp
    }

    /// Flip the shutdown flag; all further mutations fail fast.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ChainError::ShuttingDown);
        }
        Ok(())
    }

    // ── queries ─────────────────────────────────────────────────────────

    pub fn top_header(&self) -> Arc<BlockHeader> {
        self.top.read().header.clone()
    }

    pub fn height(&self) -> u64 {
        self.top.read().header.height
    }

    pub fn has_block(&self, hash: &Hash) -> bool {
        if self.block_cache.lock().contains(hash) {
            return true;
        }
        matches!(self.db.header_by_hash(hash), Ok(Some(_)))
    }

    pub fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        self.db.header_by_hash(hash).ok().flatten()
    }

    pub fn block_by_hash(&self, hash: &Hash) -> Option<Arc<Block>> {
        if let Some(b) = self.block_cache.lock().get(hash) {
            return Some(b.clone());
        }
        let block = self.db.block_by_hash(hash).ok().flatten()?;
        let block = Arc::new(block);
        self.block_cache.lock().put(*hash, block.clone());
        Some(block)
    }

    pub fn header_by_height(&self, height: u64) -> Option<BlockHeader> {
        let hash = self.db.hash_by_height(height).ok().flatten()?;
        self.header_by_hash(&hash)
    }

    /// Header at the highest existing height at or below `height`.
    pub fn header_by_height_floor(&self, height: u64) -> Option<BlockHeader> {
        let floor = self.db.height_floor(height).ok().flatten()?;
        self.header_by_height(floor)
    }

    /// Whether `hash` sits on the canonical chain (height index agrees).
    pub fn is_canonical(&self, header: &BlockHeader) -> bool {
        self.db
            .hash_by_height(header.height)
            .ok()
            .flatten()
            .map(|h| h == header.hash())
            .unwrap_or(false)
    }

    /// Blocks in `[begin, end)`, skipping missing heights.
    pub fn blocks_between(&self, begin: u64, end: u64) -> Vec<Block> {
        let mut out = Vec::new();
        for h in begin..end {
            if let Some(hash) = self.db.hash_by_height(h).ok().flatten() {
                if let Some(block) = self.db.block_by_hash(&hash).ok().flatten() {
                    out.push(block);
                }
            }
        }
        out
    }

    pub fn groups_in_order(&self) -> Vec<VerifyGroup> {
        self.db.groups_in_order().unwrap_or_default()
    }

    pub fn group_by_seed(&self, seed: &Hash) -> Option<VerifyGroup> {
        self.db.group_by_seed(seed).ok().flatten()
    }

    // ── mutations ───────────────────────────────────────────────────────

    /// Append a block at the chain tip.
    ///
    /// Validation order: structural checks, duplicate/parent lookup, then the
    /// registered consensus verifier. On success the block and its state
    /// effects are committed in one batch, the top pointer is swapped, and
    /// listeners run in subscription order.
    pub fn add_block(&self, block: Block) -> Result<()> {
        self.ensure_running()?;
        block.validate()?;

        let hash = block.hash();
        let formed_group;
        {
            let mut top = self.top.write();
            self.ensure_running()?;

            if self.has_block(&hash) {
                return Err(ChainError::DuplicateBlock(hash));
            }
            let prev = top.header.clone();
            if block.header.prev_hash != prev.hash() {
                return if self.header_by_hash(&block.header.prev_hash).is_some() {
                    Err(ChainError::NotOnTop)
                } else {
                    Err(ChainError::OrphanBlock(block.header.prev_hash))
                };
            }
            if block.header.height <= prev.height {
                return Err(ChainError::InvalidBlock(format!(
                    "height {} not above top {}",
                    block.header.height, prev.height
                )));
            }
            if let Some(verifier) = self.verifier.read().clone() {
                verifier.verify_block(&block.header, &prev)?;
            }

            let state_ops: Vec<StateOp> = self.group_store.apply_block(&block)?;
            self.db.commit_block(&block, &state_ops)?;
            self.cp.update_votes(&block.header);

            top.header = Arc::new(block.header.clone());
            debug!(height = block.header.height, hash = %hex::encode(hash), "block committed");

            formed_group = self
                .group_checker
                .read()
                .clone()
                .and_then(|c| c.try_create_group(block.header.height));
            if let Some(group) = &formed_group {
                self.db.put_group(group)?;
                info!(seed = %hex::encode(group.seed), members = group.members.len(),
                    work = group.work_height, "verify group formed");
            }
        }

        let block = Arc::new(block);
        self.block_cache.lock().put(hash, block.clone());
        self.events.publish(&ChainEvent::BlockAdded(block));
        Ok(())
    }

    /// Reset the top to `ancestor`, removing every block above it.
    ///
    /// Refused when the reset would rewrite history at or below the latest
    /// checkpoint, regardless of the competing chain's weight. Returns the
    /// removed blocks, newest first, so the caller can restore them if a
    /// subsequent replay fails.
    pub fn reset_top(&self, ancestor: &BlockHeader) -> Result<Vec<Block>> {
        self.ensure_running()?;
        let cp_height = self.cp.latest();
        if ancestor.height < cp_height {
            return Err(ChainError::CheckpointViolation(cp_height));
        }

        let removed;
        {
            let mut top = self.top.write();
            self.ensure_running()?;

            let ancestor_hash = ancestor.hash();
            if !self.is_canonical(ancestor) {
                return Err(ChainError::BlockNotFound(ancestor_hash));
            }

            let mut walk = top.header.as_ref().clone();
            let mut blocks = Vec::new();
            while walk.hash() != ancestor_hash {
                if walk.height == 0 || walk.prev_hash == EMPTY_HASH {
                    return Err(ChainError::ForkRejected(
                        "ancestor not on local chain".to_string(),
                    ));
                }
                let block = self
                    .db
                    .block_by_hash(&walk.hash())?
                    .ok_or(ChainError::BlockNotFound(walk.hash()))?;
                walk = self
                    .db
                    .header_by_hash(&walk.prev_hash)?
                    .ok_or(ChainError::BlockNotFound(walk.prev_hash))?;
                blocks.push(block);
            }

            let mut state_ops: Vec<StateOp> = Vec::new();
            for block in &blocks {
                state_ops.extend(self.group_store.rollback_block(block));
            }
            self.db.rewind_to(ancestor, &blocks, &state_ops)?;
            self.cp.rewind(ancestor.height);

            let mut cache = self.block_cache.lock();
            for block in &blocks {
                cache.pop(&block.hash());
            }
            top.header = Arc::new(ancestor.clone());
            removed = blocks;
            warn!(height = ancestor.height, removed = removed.len(), "chain top reset");
        }

        self.events
            .publish(&ChainEvent::TopRollback(Arc::new(ancestor.clone())));
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::constants::ConsensusParams;
    use quorum_core::types::Address;

    pub(crate) fn make_block(prev: &BlockHeader, height: u64, qn: u64) -> Block {
        let header = BlockHeader {
            height,
            cur_time: 1000 + height,
            prev_hash: prev.hash(),
            random: [height as u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: prev.total_qn + qn,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        };
        Block::new(header, vec![])
    }

    pub(crate) fn genesis() -> Block {
        let header = BlockHeader {
            height: 0,
            cur_time: 1000,
            prev_hash: EMPTY_HASH,
            random: [7u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        };
        Block::new(header, vec![])
    }

    pub(crate) fn open_chain(dir: &std::path::Path) -> Arc<BlockChain> {
        let db = Arc::new(ChainDb::open(dir).unwrap());
        let cp = CpChecker::new(ConsensusParams::default(), db.clone());
        BlockChain::new(db, cp, genesis()).unwrap()
    }

    #[test]
    fn test_add_blocks_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());

        let b1 = make_block(&chain.top_header(), 1, 1);
        chain.add_block(b1.clone()).unwrap();
        let b2 = make_block(&chain.top_header(), 2, 1);
        chain.add_block(b2.clone()).unwrap();

        assert_eq!(chain.height(), 2);
        assert_eq!(chain.top_header().hash(), b2.hash());
        assert!(chain.has_block(&b1.hash()));
        assert_eq!(chain.header_by_height(1).unwrap().hash(), b1.hash());
        assert_eq!(chain.header_by_height_floor(5).unwrap().hash(), b2.hash());
    }

    #[test]
    fn test_rejects_duplicates_and_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());

        let b1 = make_block(&chain.top_header(), 1, 1);
        chain.add_block(b1.clone()).unwrap();
        assert!(matches!(
            chain.add_block(b1.clone()),
            Err(ChainError::DuplicateBlock(_))
        ));

        let mut orphan = make_block(&b1.header, 5, 1);
        orphan.header.prev_hash = [9u8; 32];
        orphan.header.tx_root = Block::compute_tx_root(&[]);
        assert!(matches!(
            chain.add_block(orphan),
            Err(ChainError::OrphanBlock(_))
        ));
    }

    #[test]
    fn test_reset_top_removes_blocks() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());

        let b1 = make_block(&chain.top_header(), 1, 1);
        chain.add_block(b1.clone()).unwrap();
        let b2 = make_block(&chain.top_header(), 2, 1);
        chain.add_block(b2.clone()).unwrap();
        let b3 = make_block(&chain.top_header(), 3, 1);
        chain.add_block(b3.clone()).unwrap();

        let removed = chain.reset_top(&b1.header).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(chain.height(), 1);
        assert!(!chain.has_block(&b3.hash()));
        assert!(chain.header_by_height(2).is_none());
    }

    #[test]
    fn test_shutdown_blocks_mutations() {
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());
        let b1 = make_block(&chain.top_header(), 1, 1);
        chain.shutdown();
        assert!(matches!(chain.add_block(b1), Err(ChainError::ShuttingDown)));
    }

    #[test]
    fn test_gap_heights_allowed() {
        // Groups may skip heights; the next block jumps the gap.
        let dir = tempfile::tempdir().unwrap();
        let chain = open_chain(dir.path());
        let b = make_block(&chain.top_header(), 5, 1);
        chain.add_block(b).unwrap();
        assert_eq!(chain.height(), 5);
        assert!(chain.header_by_height(3).is_none());
        assert_eq!(chain.header_by_height_floor(3).unwrap().height, 0);
    }
}
