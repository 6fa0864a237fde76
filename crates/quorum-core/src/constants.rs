//! Consensus constants and tunable parameters.

use serde::{Deserialize, Serialize};

/// BLS threshold, a percentage that divides by 100: `T = ceil(M * 51 / 100)`.
pub const THRESHOLD_PERCENT: u64 = 51;

/// Minimum ratio of received share pieces to candidate count before the mpk
/// phase may run, as a percentage.
pub const RECV_PIECE_MIN_PERCENT: u64 = 80;

/// Maximum number of lived groups one miner may participate in.
pub const MEMBER_MAX_JOIN_GROUPS: usize = 5;

/// Proposer difficulty multiplier applied to the stake-proportional VRF
/// threshold.
pub const PROPOSER_DIFFICULTY: u64 = 4;

/// Upper bound of cast slots tracked per height (spam defence).
pub const MAX_SLOTS_PER_HEIGHT: usize = 5;

/// Verify contexts older than `top - VERIFY_WINDOW` are garbage collected.
pub const VERIFY_WINDOW: u64 = 20;

/// Maximum fork depth resolvable through the slice dialogue.
pub const SHORT_FORK: u64 = 100;

/// Number of locator hashes sent in the fork ancestor exchange.
pub const FORK_PIECE_COUNT: usize = 16;

/// Per-step deadline of the fork dialogue, in seconds.
pub const FORK_STEP_TIMEOUT_SECS: u64 = 10;

/// Cooldown applied to a peer after a fork dialogue timeout, in seconds.
pub const FORK_PEER_COOLDOWN_SECS: u64 = 60;

/// Runtime consensus parameters, fixed across the network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusParams {
    /// Blocks per epoch; also the era length of one DKG round.
    pub epoch: u64,
    /// Minimum group size; below this an era produces no group.
    pub group_min: usize,
    /// Maximum group size.
    pub group_max: usize,
    /// Seconds a group has to cast one block.
    pub max_group_cast_time: u64,
    /// Group lifetime in epochs: `dismiss = work + group_life_epochs * epoch`.
    pub group_life_epochs: u64,
}

impl Default for ConsensusParams {
    fn default() -> Self {
        Self {
            epoch: 200,
            group_min: 3,
            group_max: 100,
            max_group_cast_time: 3,
            group_life_epochs: 5,
        }
    }
}

impl ConsensusParams {
    /// Epoch start at or below `height`.
    pub fn epoch_start(&self, height: u64) -> u64 {
        height / self.epoch * self.epoch
    }

    /// BLS threshold for a group of `members` miners.
    pub fn threshold(members: usize) -> usize {
        (members * THRESHOLD_PERCENT as usize).div_ceil(100)
    }

    /// Minimum number of share pieces required before mpk aggregation.
    pub fn pieces_required(candidates: usize) -> usize {
        (candidates * RECV_PIECE_MIN_PERCENT as usize).div_ceil(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold() {
        assert_eq!(ConsensusParams::threshold(7), 4); // ceil(7 * 0.51)
        assert_eq!(ConsensusParams::threshold(5), 3);
        assert_eq!(ConsensusParams::threshold(100), 51);
    }

    #[test]
    fn test_pieces_required() {
        assert_eq!(ConsensusParams::pieces_required(5), 4); // ceil(5 * 0.8)
        assert_eq!(ConsensusParams::pieces_required(10), 8);
    }

    #[test]
    fn test_epoch_start() {
        let p = ConsensusParams::default();
        assert_eq!(p.epoch_start(0), 0);
        assert_eq!(p.epoch_start(199), 0);
        assert_eq!(p.epoch_start(200), 200);
        assert_eq!(p.epoch_start(399), 200);
    }
}
