//! Checkpoint checker.
//!
//! Every accepted header is a vote for its epoch boundary: the group that
//! signed it committed to the chain prefix below that boundary. Once two
//! thirds of an epoch's expected slots have voted, the boundary becomes the
//! latest irreversible height. Commits are monotonic and persisted; the fork
//! processor refuses any reset below the committed height.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;
use quorum_core::constants::ConsensusParams;
use quorum_core::BlockHeader;
use quorum_storage::ChainDb;
use tracing::{info, warn};

struct VoteState {
    /// epoch start -> distinct voted heights inside that epoch
    votes: BTreeMap<u64, BTreeSet<u64>>,
    committed: u64,
}

pub struct CpChecker {
    params: ConsensusParams,
    db: Arc<ChainDb>,
    state: RwLock<VoteState>,
}

impl CpChecker {
    pub fn new(params: ConsensusParams, db: Arc<ChainDb>) -> Self {
        let committed = db.checkpoint().ok().flatten().unwrap_or(0);
        Self {
            params,
            db,
            state: RwLock::new(VoteState { votes: BTreeMap::new(), committed }),
        }
    }

    /// Votes needed to commit an epoch boundary: two thirds of its slots.
    fn required(&self) -> usize {
        (self.params.epoch as usize * 2).div_ceil(3)
    }

    /// Re-count the votes of the epoch containing `top_height` from the
    /// height index. Called once at boot so a restart mid-epoch does not
    /// under-count.
    pub fn rebuild_votes(&self, top_height: u64) {
        let epoch_start = self.params.epoch_start(top_height);
        let mut voted = BTreeSet::new();
        for h in epoch_start..=top_height {
            if let Ok(Some(_)) = self.db.hash_by_height(h) {
                voted.insert(h);
            }
        }
        if !voted.is_empty() {
            self.state.write().votes.insert(epoch_start, voted);
        }
    }

    /// Record the vote carried by an accepted header and commit the epoch
    /// boundary when its quorum is reached.
    pub fn update_votes(&self, header: &BlockHeader) {
        let epoch_start = self.params.epoch_start(header.height);
        let mut state = self.state.write();
        let voted = state.votes.entry(epoch_start).or_default();
        voted.insert(header.height);

        if voted.len() >= self.required() && epoch_start > state.committed {
            state.committed = epoch_start;
            if let Err(e) = self.db.put_checkpoint(epoch_start) {
                warn!(error = %e, "failed to persist checkpoint");
            }
            // Earlier epochs can no longer commit anything newer.
            state.votes = state.votes.split_off(&epoch_start);
            info!(height = epoch_start, "checkpoint committed");
        }
    }

    /// The latest irreversible height.
    pub fn latest(&self) -> u64 {
        self.state.read().committed
    }

    /// Drop votes above `height` after a fork reset. The committed
    /// checkpoint itself is never rolled back.
    pub fn rewind(&self, height: u64) {
        let mut state = self.state.write();
        for voted in state.votes.values_mut() {
            voted.retain(|h| *h <= height);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;
    use quorum_core::Block;

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            cur_time: 0,
            prev_hash: [0u8; 32],
            random: [0u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: Block::compute_tx_root(&[]),
            signature: vec![],
        }
    }

    fn checker(epoch: u64) -> (tempfile::TempDir, CpChecker) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChainDb::open(dir.path()).unwrap());
        let params = ConsensusParams { epoch, ..Default::default() };
        (dir, CpChecker::new(params, db))
    }

    #[test]
    fn test_commits_at_two_thirds() {
        let (_dir, cp) = checker(30); // requires 20 votes
        for h in 30..49 {
            cp.update_votes(&header(h));
        }
        assert_eq!(cp.latest(), 0);
        cp.update_votes(&header(49));
        assert_eq!(cp.latest(), 30);
    }

    #[test]
    fn test_monotonic_commits() {
        let (_dir, cp) = checker(30);
        for h in 60..80 {
            cp.update_votes(&header(h));
        }
        assert_eq!(cp.latest(), 60);
        // Stale votes for an older epoch must not move the checkpoint back.
        for h in 30..50 {
            cp.update_votes(&header(h));
        }
        assert_eq!(cp.latest(), 60);
    }

    #[test]
    fn test_rewind_drops_votes() {
        let (_dir, cp) = checker(30);
        for h in 30..45 {
            cp.update_votes(&header(h));
        }
        cp.rewind(34);
        for h in 35..49 {
            cp.update_votes(&header(h));
        }
        // 5 surviving + 14 new = 19 < 20, still uncommitted.
        assert_eq!(cp.latest(), 0);
        cp.update_votes(&header(49));
        assert_eq!(cp.latest(), 30);
    }

    #[test]
    fn test_persisted_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(ChainDb::open(dir.path()).unwrap());
        let params = ConsensusParams { epoch: 30, ..Default::default() };
        {
            let cp = CpChecker::new(params.clone(), db.clone());
            for h in 30..50 {
                cp.update_votes(&header(h));
            }
            assert_eq!(cp.latest(), 30);
        }
        let cp = CpChecker::new(params, db);
        assert_eq!(cp.latest(), 30);
    }
}
