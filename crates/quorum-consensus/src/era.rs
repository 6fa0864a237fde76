//! The era clock: maps a block height to its DKG era and the three phase
//! windows that gate the group-creation routine.

use quorum_core::constants::ConsensusParams;
use quorum_core::types::Hash;
use quorum_core::BlockHeader;

/// Half-open height range `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeightRange {
    pub begin: u64,
    pub end: u64,
}

impl HeightRange {
    pub fn contains(&self, height: u64) -> bool {
        self.begin <= height && height < self.end
    }
}

impl std::fmt::Display for HeightRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.begin, self.end)
    }
}

// Phase window boundaries, in percent of the epoch after the seed height.
// Piece distribution, mpk publication and the optional origin reveal occupy
// the second quarter of the epoch; the group starts work at the half mark.
const PIECE_BEGIN_PCT: u64 = 15;
const MPK_BEGIN_PCT: u64 = 30;
const ORI_BEGIN_PCT: u64 = 40;
const ERA_END_PCT: u64 = 50;

/// One DKG era, pinned to its seed block.
///
/// Two eras are the same only when both the seed height and the actual seed
/// block hash match: a fork that replaces the seed block forces a rebuild of
/// all in-flight DKG state.
#[derive(Debug, Clone)]
pub struct Era {
    pub seed_height: u64,
    pub seed_block: Option<BlockHeader>,
    pub piece_range: HeightRange,
    pub mpk_range: HeightRange,
    pub ori_piece_range: HeightRange,
    pub end_height: u64,
}

impl Era {
    /// Era anchor for a height: the epoch start at or below it.
    pub fn seed_height_for(height: u64, params: &ConsensusParams) -> u64 {
        params.epoch_start(height)
    }

    pub fn new(seed_height: u64, seed_block: Option<BlockHeader>, params: &ConsensusParams) -> Self {
        let pct = |p: u64| seed_height + params.epoch * p / 100;
        Self {
            seed_height,
            seed_block,
            piece_range: HeightRange { begin: pct(PIECE_BEGIN_PCT), end: pct(MPK_BEGIN_PCT) },
            mpk_range: HeightRange { begin: pct(MPK_BEGIN_PCT), end: pct(ORI_BEGIN_PCT) },
            ori_piece_range: HeightRange { begin: pct(ORI_BEGIN_PCT), end: pct(ERA_END_PCT) },
            end_height: pct(ERA_END_PCT),
        }
    }

    pub fn seed_exists(&self) -> bool {
        self.seed_block.is_some()
    }

    /// The era seed: hash of the seed block. Identifies the era and the
    /// group it creates.
    pub fn seed(&self) -> Option<Hash> {
        self.seed_block.as_ref().map(|b| b.hash())
    }

    pub fn seed_random(&self) -> Option<Hash> {
        self.seed_block.as_ref().map(|b| b.random)
    }

    pub fn same_era(&self, seed_height: u64, seed_block: Option<&BlockHeader>) -> bool {
        if self.seed_height != seed_height {
            return false;
        }
        match (&self.seed_block, seed_block) {
            (Some(a), Some(b)) => a.hash() == b.hash(),
            (None, None) => true,
            _ => false,
        }
    }

    /// Height at which the group formed in this era starts to work.
    pub fn work_height(&self) -> u64 {
        self.end_height
    }

    pub fn dismiss_height(&self, params: &ConsensusParams) -> u64 {
        self.work_height() + params.group_life_epochs * params.epoch
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;

    fn params() -> ConsensusParams {
        ConsensusParams { epoch: 200, ..Default::default() }
    }

    fn header(height: u64) -> BlockHeader {
        BlockHeader {
            height,
            cur_time: 0,
            prev_hash: [0u8; 32],
            random: [1u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 0,
            tx_root: [0u8; 32],
            signature: vec![],
        }
    }

    #[test]
    fn test_phase_windows() {
        let p = params();
        let era = Era::new(200, Some(header(200)), &p);
        assert_eq!(era.piece_range, HeightRange { begin: 230, end: 260 });
        assert_eq!(era.mpk_range, HeightRange { begin: 260, end: 280 });
        assert_eq!(era.ori_piece_range, HeightRange { begin: 280, end: 300 });
        assert_eq!(era.work_height(), 300);
        assert_eq!(era.dismiss_height(&p), 300 + 5 * 200);
    }

    #[test]
    fn test_seed_height_for() {
        let p = params();
        assert_eq!(Era::seed_height_for(230, &p), 200);
        assert_eq!(Era::seed_height_for(399, &p), 200);
        assert_eq!(Era::seed_height_for(400, &p), 400);
    }

    #[test]
    fn test_same_era_requires_same_seed_block() {
        let p = params();
        let a = Era::new(200, Some(header(200)), &p);
        assert!(a.same_era(200, Some(&header(200))));
        let mut replaced = header(200);
        replaced.random = [9u8; 32]; // fork replaced the seed block
        assert!(!a.same_era(200, Some(&replaced)));
        assert!(!a.same_era(400, Some(&header(400))));
    }

    #[test]
    fn test_range_contains() {
        let r = HeightRange { begin: 230, end: 260 };
        assert!(!r.contains(229));
        assert!(r.contains(230));
        assert!(r.contains(259));
        assert!(!r.contains(260));
    }
}
