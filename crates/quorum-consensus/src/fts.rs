//! Follow-the-Satoshi candidate selection: stake-weighted sampling without
//! replacement, deterministic in the beacon randomness.

use quorum_core::MinerInfo;
use quorum_crypto::SeededRng;

pub struct CandidateSelector {
    cands: Vec<MinerInfo>,
    remaining_stake: u64,
    rng: SeededRng,
}

impl CandidateSelector {
    /// Candidates keep their insertion order, which is the stable order of
    /// the verifier set at the seed height; zero-stake entries are skipped.
    pub fn new(cands: Vec<MinerInfo>, random: &[u8]) -> Self {
        let mut kept = Vec::with_capacity(cands.len());
        let mut stake = 0u64;
        for c in cands {
            if c.stake == 0 {
                continue;
            }
            stake = stake.saturating_add(c.stake);
            kept.push(c);
        }
        Self {
            cands: kept,
            remaining_stake: stake,
            rng: SeededRng::from_bytes(random),
        }
    }

    /// Select `num` distinct candidates. Draw `i` reduces `H(R ‖ i)` modulo
    /// the remaining stake and walks the cumulative-stake list; the winner is
    /// removed and its stake subtracted, so later draws renormalise.
    pub fn fts(mut self, num: usize) -> Vec<MinerInfo> {
        let num = num.min(self.cands.len());
        let mut result = Vec::with_capacity(num);
        while result.len() < num && self.remaining_stake > 0 {
            let r = self.rng.derive(result.len() as u64).modulo_u64(self.remaining_stake);
            let mut cumulative = 0u64;
            let mut picked = None;
            for (i, c) in self.cands.iter().enumerate() {
                if cumulative + c.stake > r {
                    picked = Some(i);
                    break;
                }
                cumulative += c.stake;
            }
            // The draw is < remaining stake, so a winner always exists.
            let i = picked.expect("cumulative stake covers the draw");
            let c = self.cands.remove(i);
            self.remaining_stake -= c.stake;
            result.push(c);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::types::Address;
    use quorum_core::{MinerKind, MinerStatus};

    fn miner(tag: u8, stake: u64) -> MinerInfo {
        MinerInfo {
            id: Address::new([tag; 20]),
            pubkey: vec![tag],
            vrf_pubkey: vec![tag],
            stake,
            kind: MinerKind::Verifier,
            status: MinerStatus::Active,
            apply_height: 0,
        }
    }

    fn cands() -> Vec<MinerInfo> {
        vec![miner(b'A', 10), miner(b'B', 20), miner(b'C', 30), miner(b'D', 40)]
    }

    #[test]
    fn test_selection_is_deterministic() {
        let mut random = [0u8; 32];
        random[31] = 1;

        let first: Vec<Address> = CandidateSelector::new(cands(), &random)
            .fts(3)
            .into_iter()
            .map(|m| m.id)
            .collect();
        let second: Vec<Address> = CandidateSelector::new(cands(), &random)
            .fts(3)
            .into_iter()
            .map(|m| m.id)
            .collect();

        assert_eq!(first.len(), 3);
        assert_eq!(first, second);
    }

    #[test]
    fn test_selection_distinct_and_bounded() {
        let selected = CandidateSelector::new(cands(), &[7u8; 32]).fts(10);
        assert_eq!(selected.len(), 4);
        let mut ids: Vec<_> = selected.iter().map(|m| m.id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 4);
    }

    #[test]
    fn test_zero_stake_never_selected() {
        let mut list = cands();
        list.push(miner(b'Z', 0));
        let selected = CandidateSelector::new(list, &[3u8; 32]).fts(10);
        assert!(selected.iter().all(|m| m.id != Address::new([b'Z'; 20])));
    }

    proptest::proptest! {
        #[test]
        fn prop_identical_inputs_identical_outputs(
            random: [u8; 32],
            stakes in proptest::collection::vec(1u64..1000, 1..20),
            n in 1usize..20,
        ) {
            let build = || {
                stakes
                    .iter()
                    .enumerate()
                    .map(|(i, s)| miner(i as u8, *s))
                    .collect::<Vec<_>>()
            };
            let a: Vec<Address> = CandidateSelector::new(build(), &random)
                .fts(n).into_iter().map(|m| m.id).collect();
            let b: Vec<Address> = CandidateSelector::new(build(), &random)
                .fts(n).into_iter().map(|m| m.id).collect();
            proptest::prop_assert_eq!(&a, &b);

            let mut dedup = a.clone();
            dedup.sort();
            dedup.dedup();
            proptest::prop_assert_eq!(dedup.len(), a.len());
        }
    }
}
