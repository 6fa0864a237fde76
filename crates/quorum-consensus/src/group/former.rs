//! Group formation at era end.
//!
//! Once the origin window closes, the chain derives the new verify group
//! from what actually landed on chain: membership is the set of candidates
//! whose piece AND mpk packets were accepted, and the collective public key
//! is the Lagrange interpolation of their mpk contributions at zero. A
//! candidate that dealt pieces but never published an mpk is excluded.
//!
//! The former runs inside the commit path (behind the chain write lock), so
//! it reads only the database, never chain methods that take locks.

use std::sync::Arc;

use quorum_core::constants::{ConsensusParams, MEMBER_MAX_JOIN_GROUPS};
use quorum_core::types::{Address, Hash};
use quorum_core::{GroupMember, MinerInfo, VerifyGroup};
use quorum_chain::{GroupCreateChecker, GroupStore};
use quorum_crypto::bls;
use quorum_storage::ChainDb;
use tracing::{debug, warn};

use crate::era::Era;
use crate::fts::CandidateSelector;
use crate::traits::{JoinedGroupFilter, MinerReader};

pub struct GroupFormer {
    params: ConsensusParams,
    db: Arc<ChainDb>,
    store: GroupStore,
    miner_reader: Arc<dyn MinerReader>,
    group_filter: Arc<dyn JoinedGroupFilter>,
}

impl GroupFormer {
    pub fn new(
        params: ConsensusParams,
        db: Arc<ChainDb>,
        miner_reader: Arc<dyn MinerReader>,
        group_filter: Arc<dyn JoinedGroupFilter>,
    ) -> Self {
        let store = GroupStore::new(db.clone());
        Self { params, db, store, miner_reader, group_filter }
    }

    fn seed_header(&self, seed_height: u64) -> Option<quorum_core::BlockHeader> {
        let hash = self.db.hash_by_height(seed_height).ok().flatten()?;
        self.db.header_by_hash(&hash).ok().flatten()
    }

    /// Re-derive the era's candidate list with the routine's determinism.
    fn candidates(&self, era: &Era) -> Option<Vec<MinerInfo>> {
        let seed_height = era.seed_height;
        let verifiers = self.miner_reader.verifiers_at(seed_height);
        let available: Vec<MinerInfo> = verifiers
            .into_iter()
            .filter(|m| {
                self.group_filter.joined_lived_groups(&m.id, seed_height)
                    < MEMBER_MAX_JOIN_GROUPS
            })
            .collect();
        let count = available.len().min(self.params.group_max);
        if count < self.params.group_min {
            return None;
        }
        let random = era.seed_random()?;
        Some(CandidateSelector::new(available, &random).fts(count))
    }

    fn build(&self, era: &Era, seed: Hash) -> Option<VerifyGroup> {
        let cands = self.candidates(era)?;

        let pieces = self.store.pieces(&seed).ok()?;
        let need = ConsensusParams::pieces_required(cands.len());
        if pieces.len() < need {
            debug!(pieces = pieces.len(), need, "era aborted: pieces short");
            return None;
        }
        let piece_senders: Vec<Address> = pieces.iter().map(|p| p.sender).collect();

        let threshold = ConsensusParams::threshold(cands.len());
        let mut members = Vec::new();
        let mut mpk_points = Vec::new();
        for mpk in self.store.mpks(&seed).ok()? {
            let Some(index) = cands.iter().position(|c| c.id == mpk.sender) else {
                warn!(sender = %mpk.sender, "mpk from non-candidate ignored");
                continue;
            };
            if !piece_senders.contains(&mpk.sender) {
                warn!(sender = %mpk.sender, "mpk without piece ignored");
                continue;
            }
            let Ok(pk) = bls::Pubkey::from_bytes(&mpk.mpk) else {
                warn!(sender = %mpk.sender, "mpk key unparsable, ignored");
                continue;
            };
            let Ok(sig) = bls::Signature::from_bytes(&mpk.sign) else {
                warn!(sender = %mpk.sender, "mpk signature unparsable, ignored");
                continue;
            };
            // Proof of possession: the seed signed by the master share.
            if !sig.verify(&seed, &pk) {
                warn!(sender = %mpk.sender, "mpk proof of possession failed, ignored");
                continue;
            }
            let share_index = index as u64 + 1;
            mpk_points.push((share_index, pk));
            members.push(GroupMember { id: mpk.sender, pubkey: mpk.mpk.clone(), share_index });
        }

        if members.len() < threshold || members.len() < self.params.group_min {
            debug!(members = members.len(), threshold, "era aborted: mpk short");
            return None;
        }

        let group_pubkey = match bls::recover_pubkey(&mpk_points, threshold) {
            Ok(pk) => pk,
            Err(e) => {
                warn!(error = %e, "group pubkey recovery failed");
                return None;
            }
        };

        let (pre_seed, group_height) = match self.db.top_group_seed().ok().flatten() {
            Some(top_seed) => {
                let height = self
                    .db
                    .group_by_seed(&top_seed)
                    .ok()
                    .flatten()
                    .map(|g| g.group_height + 1)
                    .unwrap_or(0);
                (top_seed, height)
            }
            None => ([0u8; 32], 0),
        };

        Some(VerifyGroup {
            seed,
            work_height: era.work_height(),
            dismiss_height: era.dismiss_height(&self.params),
            group_height,
            threshold: ConsensusParams::threshold(members.len()) as u32,
            pubkey: group_pubkey.to_vec(),
            members,
            pre_seed,
        })
    }
}

impl GroupCreateChecker for GroupFormer {
    fn try_create_group(&self, height: u64) -> Option<VerifyGroup> {
        let seed_height = Era::seed_height_for(height, &self.params);
        let seed_block = self.seed_header(seed_height)?;
        let era = Era::new(seed_height, Some(seed_block), &self.params);
        if height < era.end_height {
            return None;
        }
        let seed = era.seed()?;
        if self.db.group_by_seed(&seed).ok()?.is_some() {
            return None;
        }
        self.build(&era, seed)
    }
}

/// Joined-group pressure measured against the on-chain registry.
pub struct RegistryGroupFilter {
    db: Arc<ChainDb>,
}

impl RegistryGroupFilter {
    pub fn new(db: Arc<ChainDb>) -> Self {
        Self { db }
    }
}

impl JoinedGroupFilter for RegistryGroupFilter {
    fn joined_lived_groups(&self, id: &Address, height: u64) -> usize {
        self.db
            .groups_in_order()
            .unwrap_or_default()
            .iter()
            .filter(|g| g.lived_at(height) && g.has_member(id))
            .count()
    }
}
