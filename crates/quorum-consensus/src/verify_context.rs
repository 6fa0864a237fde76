//! Per-height verify contexts: the in-flight block proposals of the working
//! group, their partial signatures, and threshold aggregation.

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use quorum_core::constants::{MAX_SLOTS_PER_HEIGHT, VERIFY_WINDOW};
use quorum_core::types::{Address, Hash};
use quorum_core::{Block, BlockHeader, VerifyGroup};
use quorum_crypto::bls;
use tracing::{debug, warn};

use crate::error::{ConsensusError, Result};

const HEIGHT_CTX_CACHE: usize = 20;
const HASH_CTX_CACHE: usize = 200;
const RECENT_CASTED_CACHE: usize = 200;
const PROPOSED_CACHE: usize = 20;
const PENDING_VERIFY_CACHE: usize = 200;

/// Chain lookups the context table needs for prev-hash conflict resolution.
pub trait HeaderReader: Send + Sync {
    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Collecting,
    Aggregated,
    Broadcast,
}

/// One proposed block and the partial signatures gathered for it.
pub struct CastSlot {
    pub header: BlockHeader,
    partials: HashMap<Address, (u64, bls::Signature)>,
    pub status: SlotStatus,
    pub group_sign: Option<bls::Signature>,
}

impl CastSlot {
    fn new(header: BlockHeader) -> Self {
        Self { header, partials: HashMap::new(), status: SlotStatus::Collecting, group_sign: None }
    }

    pub fn sign_count(&self) -> usize {
        self.partials.len()
    }
}

/// Outcome of feeding one verify message into a slot.
#[derive(Debug)]
pub enum VerifyOutcome {
    /// Signature accepted, threshold not yet reached.
    Accepted { count: usize },
    /// Threshold reached: the recovered group signature.
    Aggregated { signature: bls::Signature },
    /// Slot already aggregated; the message is a no-op.
    AlreadyAggregated,
}

/// Verify context for one (height, prev hash) pair.
pub struct VerifyContext {
    pub group: Arc<VerifyGroup>,
    pub cast_height: u64,
    pub prev: BlockHeader,
    pub expire_time: u64,
    slots: Mutex<Vec<CastSlot>>,
    signed_max_qn: AtomicU64,
}

impl VerifyContext {
    pub fn new(group: Arc<VerifyGroup>, cast_height: u64, expire_time: u64, prev: BlockHeader) -> Self {
        Self {
            group,
            cast_height,
            prev,
            expire_time,
            slots: Mutex::new(Vec::new()),
            signed_max_qn: AtomicU64::new(0),
        }
    }

    pub fn expired(&self, now: u64) -> bool {
        now >= self.expire_time
    }

    pub fn should_remove(&self, top_height: u64) -> bool {
        self.cast_height + VERIFY_WINDOW < top_height
    }

    pub fn signed_max_qn(&self) -> u64 {
        self.signed_max_qn.load(Ordering::Relaxed)
    }

    pub fn slot_hashes(&self) -> Vec<Hash> {
        self.slots.lock().iter().map(|s| s.header.hash()).collect()
    }

    /// Track a new proposal. Bounded to [`MAX_SLOTS_PER_HEIGHT`] slots;
    /// duplicates by hash are ignored.
    pub fn add_proposal(&self, header: BlockHeader) -> Result<()> {
        if header.height != self.cast_height {
            return Err(ConsensusError::InvalidProposal(format!(
                "height {} vs context {}",
                header.height, self.cast_height
            )));
        }
        if header.prev_hash != self.prev.hash() {
            return Err(ConsensusError::InvalidProposal("prev hash mismatch".to_string()));
        }
        let mut slots = self.slots.lock();
        let hash = header.hash();
        if slots.iter().any(|s| s.header.hash() == hash) {
            return Ok(());
        }
        if slots.len() >= MAX_SLOTS_PER_HEIGHT {
            return Err(ConsensusError::SlotLimit);
        }
        slots.push(CastSlot::new(header));
        Ok(())
    }

    /// Feed one partial signature. Verifies it against the member's master
    /// public key share, dedupes per member, and aggregates by Lagrange
    /// interpolation once the group threshold is reached. The recovered
    /// signature is checked against the group public key before the slot
    /// flips to `Aggregated`.
    pub fn add_verify_msg(
        &self,
        block_hash: &Hash,
        member_id: &Address,
        sign: &[u8],
    ) -> Result<VerifyOutcome> {
        let member = self
            .group
            .member(member_id)
            .ok_or(ConsensusError::NotGroupMember(self.group.seed))?
            .clone();

        let mut slots = self.slots.lock();
        let slot = slots
            .iter_mut()
            .find(|s| s.header.hash() == *block_hash)
            .ok_or(ConsensusError::NoContext(*block_hash))?;

        if slot.status != SlotStatus::Collecting {
            return Ok(VerifyOutcome::AlreadyAggregated);
        }
        if slot.partials.contains_key(member_id) {
            return Err(ConsensusError::DuplicateVerifyMsg);
        }

        let signature = bls::Signature::from_bytes(sign)?;
        let member_pk = bls::Pubkey::from_bytes(&member.pubkey)?;
        if !signature.verify(block_hash, &member_pk) {
            return Err(ConsensusError::InvalidProposal(
                "partial signature invalid".to_string(),
            ));
        }
        slot.partials.insert(*member_id, (member.share_index, signature));

        let threshold = self.group.threshold_count();
        if slot.partials.len() < threshold {
            return Ok(VerifyOutcome::Accepted { count: slot.partials.len() });
        }

        let parts: Vec<(u64, bls::Signature)> =
            slot.partials.values().map(|(idx, sig)| (*idx, *sig)).collect();
        let group_sign = bls::recover_signature(&parts, threshold)?;
        let group_pk = bls::Pubkey::from_bytes(&self.group.pubkey)?;
        if !group_sign.verify(block_hash, &group_pk) {
            warn!(seed = %hex::encode(self.group.seed), "recovered group signature invalid");
            return Err(ConsensusError::InvalidProposal(
                "recovered group signature invalid".to_string(),
            ));
        }
        slot.status = SlotStatus::Aggregated;
        slot.group_sign = Some(group_sign);
        self.signed_max_qn.fetch_max(slot.header.total_qn, Ordering::Relaxed);
        debug!(height = self.cast_height, "slot aggregated");
        Ok(VerifyOutcome::Aggregated { signature: group_sign })
    }

    /// Best aggregated slot: maximum total quality number, ties broken by
    /// the lexicographically smallest block hash.
    pub fn pick_winning_slot(&self) -> Option<(BlockHeader, bls::Signature)> {
        let slots = self.slots.lock();
        slots
            .iter()
            .filter(|s| s.status != SlotStatus::Collecting)
            .max_by(|a, b| {
                a.header
                    .total_qn
                    .cmp(&b.header.total_qn)
                    .then_with(|| b.header.hash().cmp(&a.header.hash()))
            })
            .map(|s| (s.header.clone(), s.group_sign.expect("aggregated slot has sign")))
    }

    pub fn mark_broadcast(&self, block_hash: &Hash) {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.iter_mut().find(|s| s.header.hash() == *block_hash) {
            if slot.status == SlotStatus::Aggregated {
                slot.status = SlotStatus::Broadcast;
            }
        }
    }

    pub fn slot_status(&self, block_hash: &Hash) -> Option<SlotStatus> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.header.hash() == *block_hash)
            .map(|s| s.status)
    }

    /// Members whose partial signatures were accepted for the slot.
    pub fn slot_signers(&self, block_hash: &Hash) -> Vec<Address> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.header.hash() == *block_hash)
            .map(|s| s.partials.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn group_sign_of(&self, block_hash: &Hash) -> Option<bls::Signature> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.header.hash() == *block_hash)
            .and_then(|s| s.group_sign)
    }
}

/// A block proposed locally, kept for body re-requests with a bounded
/// response quota.
pub struct ProposedBlock {
    pub block: Block,
    max_responses: usize,
    responded: Mutex<HashSet<String>>,
}

impl ProposedBlock {
    pub fn new(block: Block, group_size: usize) -> Self {
        // Serve at most a third of the group; the rest shares the body
        // among themselves.
        let max_responses = group_size.div_ceil(3);
        Self { block, max_responses, responded: Mutex::new(HashSet::new()) }
    }

    /// Whether a body response is still owed to `peer`.
    pub fn may_respond(&self, peer: &str) -> bool {
        let mut responded = self.responded.lock();
        if responded.contains(peer) {
            return false;
        }
        if responded.len() >= self.max_responses {
            return false;
        }
        responded.insert(peer.to_string());
        true
    }
}

/// The context table: per-height verify contexts plus the satellite caches
/// of the cast workflow. All caches are LRU-bounded with internal locks.
pub struct CastContexts {
    by_height: Mutex<LruCache<u64, Arc<VerifyContext>>>,
    by_hash: Mutex<LruCache<Hash, Arc<VerifyContext>>>,
    recent_casted: Mutex<LruCache<(u64, Hash), ()>>,
    proposed: Mutex<LruCache<Hash, Arc<ProposedBlock>>>,
    pending_verify: Mutex<LruCache<Hash, Vec<(Address, Vec<u8>)>>>,
}

impl Default for CastContexts {
    fn default() -> Self {
        Self::new()
    }
}

impl CastContexts {
    pub fn new() -> Self {
        let cap = |n: usize| NonZeroUsize::new(n).unwrap();
        Self {
            by_height: Mutex::new(LruCache::new(cap(HEIGHT_CTX_CACHE))),
            by_hash: Mutex::new(LruCache::new(cap(HASH_CTX_CACHE))),
            recent_casted: Mutex::new(LruCache::new(cap(RECENT_CASTED_CACHE))),
            proposed: Mutex::new(LruCache::new(cap(PROPOSED_CACHE))),
            pending_verify: Mutex::new(LruCache::new(cap(PENDING_VERIFY_CACHE))),
        }
    }

    /// Context for `(height, prev)` creating it when absent.
    ///
    /// When a context already exists with a different prev hash, the higher
    /// prev wins: a prev that vanished from the chain (fork adjustment)
    /// forfeits its context, a proposal whose prev is unknown is discarded.
    pub fn get_or_create(
        &self,
        reader: &dyn HeaderReader,
        group: Arc<VerifyGroup>,
        height: u64,
        expire_time: u64,
        prev: &BlockHeader,
    ) -> Option<Arc<VerifyContext>> {
        let mut by_height = self.by_height.lock();
        let existing = by_height.get(&height).cloned();
        let ctx = match existing {
            None => {
                let ctx = Arc::new(VerifyContext::new(group, height, expire_time, prev.clone()));
                by_height.put(height, ctx.clone());
                ctx
            }
            Some(ctx) if ctx.prev.hash() == prev.hash() => ctx,
            Some(ctx) => {
                let old_prev_live = reader.header_by_hash(&ctx.prev.hash()).is_some();
                let new_prev_live = reader.header_by_hash(&prev.hash()).is_some();
                if !new_prev_live {
                    debug!(height, "discarding proposal: its prev no longer exists");
                    return None;
                }
                if !old_prev_live || ctx.prev.height < prev.height {
                    let fresh =
                        Arc::new(VerifyContext::new(group, height, expire_time, prev.clone()));
                    by_height.put(height, fresh.clone());
                    fresh
                } else {
                    ctx
                }
            }
        };
        Some(ctx)
    }

    pub fn by_height(&self, height: u64) -> Option<Arc<VerifyContext>> {
        self.by_height.lock().get(&height).cloned()
    }

    pub fn attach_hash(&self, block_hash: Hash, ctx: Arc<VerifyContext>) {
        self.by_hash.lock().put(block_hash, ctx);
    }

    pub fn by_block_hash(&self, block_hash: &Hash) -> Option<Arc<VerifyContext>> {
        self.by_hash.lock().get(block_hash).cloned()
    }

    /// Drop contexts that fell out of the verify window.
    pub fn clean_below(&self, top_height: u64) {
        let mut by_height = self.by_height.lock();
        let stale: Vec<(u64, Arc<VerifyContext>)> = by_height
            .iter()
            .filter(|(_, ctx)| ctx.should_remove(top_height))
            .map(|(h, ctx)| (*h, ctx.clone()))
            .collect();
        if stale.is_empty() {
            return;
        }
        let mut by_hash = self.by_hash.lock();
        for (h, ctx) in stale {
            for hash in ctx.slot_hashes() {
                by_hash.pop(&hash);
            }
            by_height.pop(&h);
        }
    }

    // ── recent-casted guard (keyed by height AND prev hash, so a fork does
    // not block a legitimate re-cast on the new chain) ──────────────────

    pub fn is_recent_casted(&self, height: u64, prev_hash: &Hash) -> bool {
        self.recent_casted.lock().contains(&(height, *prev_hash))
    }

    pub fn mark_casted(&self, height: u64, prev_hash: &Hash) {
        self.recent_casted.lock().put((height, *prev_hash), ());
    }

    // ── proposed block bodies ───────────────────────────────────────────

    pub fn add_proposed(&self, block: Block, group_size: usize) {
        let hash = block.hash();
        self.proposed
            .lock()
            .put(hash, Arc::new(ProposedBlock::new(block, group_size)));
    }

    pub fn proposed(&self, hash: &Hash) -> Option<Arc<ProposedBlock>> {
        self.proposed.lock().get(hash).cloned()
    }

    pub fn remove_proposed(&self, hash: &Hash) {
        self.proposed.lock().pop(hash);
    }

    // ── early verify messages (context not yet created) ─────────────────

    pub fn buffer_verify_msg(&self, block_hash: Hash, member: Address, sign: Vec<u8>) {
        let mut pending = self.pending_verify.lock();
        match pending.get_mut(&block_hash) {
            Some(msgs) => msgs.push((member, sign)),
            None => {
                pending.put(block_hash, vec![(member, sign)]);
            }
        }
    }

    pub fn take_buffered(&self, block_hash: &Hash) -> Vec<(Address, Vec<u8>)> {
        self.pending_verify.lock().pop(block_hash).unwrap_or_default()
    }
}

/// Expiry of a cast round: the parent's time plus one cast window per height
/// crossed. Height 1 gets extra slack so a node that starts out of sync does
/// not expire its first round prematurely.
pub fn cast_expire_time(
    prev_time: u64,
    delta_height: u64,
    cast_height: u64,
    max_group_cast_time: u64,
) -> u64 {
    let extra = if cast_height == 1 { 2 } else { 0 };
    prev_time + (delta_height + extra) * max_group_cast_time
}

#[cfg(test)]
mod tests {
    use super::*;
    use quorum_core::constants::ConsensusParams;
    use quorum_core::GroupMember;

    /// A fully dealt group of `n` members with threshold per protocol rule.
    /// Returns the group and each member's (id, master secret share).
    fn build_group(n: usize) -> (Arc<VerifyGroup>, Vec<(Address, bls::Seckey)>) {
        let threshold = ConsensusParams::threshold(n);
        let dealers: Vec<bls::SharePolynomial> = (0..n)
            .map(|i| bls::SharePolynomial::from_seed(&[i as u8 + 1; 32], threshold))
            .collect();

        let mut members = Vec::with_capacity(n);
        let mut secrets = Vec::with_capacity(n);
        let mut mpk_points = Vec::with_capacity(n);
        for i in 0..n {
            let x = i as u64 + 1;
            let shares: Vec<bls::Seckey> =
                dealers.iter().map(|d| d.share_at(x).unwrap()).collect();
            let msk = bls::Seckey::aggregate(&shares).unwrap();
            let id = Address::new([i as u8 + 1; 20]);
            let mpk = msk.pubkey();
            mpk_points.push((x, mpk));
            members.push(GroupMember { id, pubkey: mpk.to_vec(), share_index: x });
            secrets.push((id, msk));
        }
        let gpk = bls::recover_pubkey(&mpk_points, threshold).unwrap();
        let group = Arc::new(VerifyGroup {
            seed: [9u8; 32],
            work_height: 10,
            dismiss_height: 1010,
            group_height: 0,
            threshold: threshold as u32,
            pubkey: gpk.to_vec(),
            members,
            pre_seed: [0u8; 32],
        });
        (group, secrets)
    }

    fn header(height: u64, prev: &BlockHeader) -> BlockHeader {
        BlockHeader {
            height,
            cur_time: 2000,
            prev_hash: prev.hash(),
            random: [4u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [9u8; 32],
            total_qn: prev.total_qn + 1,
            tx_root: [0u8; 32],
            signature: vec![],
        }
    }

    fn prev_header() -> BlockHeader {
        BlockHeader {
            height: 11,
            cur_time: 1000,
            prev_hash: [1u8; 32],
            random: [2u8; 32],
            proof: vec![],
            castor: Address::zero(),
            group_seed: [0u8; 32],
            total_qn: 5,
            tx_root: [0u8; 32],
            signature: vec![],
        }
    }

    #[test]
    fn test_threshold_aggregation_lifecycle() {
        // Group of 7: threshold is ceil(7 * 0.51) = 4. Three signatures keep
        // the slot collecting, the fourth aggregates, a fifth is a no-op.
        let (group, secrets) = build_group(7);
        assert_eq!(group.threshold_count(), 4);

        let prev = prev_header();
        let ctx = VerifyContext::new(group.clone(), 12, 9999, prev.clone());
        let bh = header(12, &prev);
        let hash = bh.hash();
        ctx.add_proposal(bh).unwrap();

        for (i, (id, msk)) in secrets.iter().take(3).enumerate() {
            let sig = msk.sign(&hash);
            match ctx.add_verify_msg(&hash, id, &sig.to_bytes()).unwrap() {
                VerifyOutcome::Accepted { count } => assert_eq!(count, i + 1),
                other => panic!("unexpected outcome {other:?}"),
            }
            assert_eq!(ctx.slot_status(&hash), Some(SlotStatus::Collecting));
        }

        let (id4, msk4) = &secrets[3];
        let sig4 = msk4.sign(&hash);
        let group_sign = match ctx.add_verify_msg(&hash, id4, &sig4.to_bytes()).unwrap() {
            VerifyOutcome::Aggregated { signature } => signature,
            other => panic!("expected aggregation, got {other:?}"),
        };
        assert_eq!(ctx.slot_status(&hash), Some(SlotStatus::Aggregated));

        let gpk = bls::Pubkey::from_bytes(&group.pubkey).unwrap();
        assert!(group_sign.verify(&hash, &gpk));

        let (id5, msk5) = &secrets[4];
        let sig5 = msk5.sign(&hash);
        assert!(matches!(
            ctx.add_verify_msg(&hash, id5, &sig5.to_bytes()).unwrap(),
            VerifyOutcome::AlreadyAggregated
        ));
    }

    #[test]
    fn test_duplicate_member_rejected() {
        let (group, secrets) = build_group(5);
        let prev = prev_header();
        let ctx = VerifyContext::new(group, 12, 9999, prev.clone());
        let bh = header(12, &prev);
        let hash = bh.hash();
        ctx.add_proposal(bh).unwrap();

        let (id, msk) = &secrets[0];
        let sig = msk.sign(&hash);
        ctx.add_verify_msg(&hash, id, &sig.to_bytes()).unwrap();
        assert!(matches!(
            ctx.add_verify_msg(&hash, id, &sig.to_bytes()),
            Err(ConsensusError::DuplicateVerifyMsg)
        ));
    }

    #[test]
    fn test_non_member_rejected() {
        let (group, secrets) = build_group(5);
        let prev = prev_header();
        let ctx = VerifyContext::new(group, 12, 9999, prev.clone());
        let bh = header(12, &prev);
        let hash = bh.hash();
        ctx.add_proposal(bh).unwrap();

        let stranger = Address::new([99u8; 20]);
        let sig = secrets[0].1.sign(&hash);
        assert!(matches!(
            ctx.add_verify_msg(&hash, &stranger, &sig.to_bytes()),
            Err(ConsensusError::NotGroupMember(_))
        ));
    }

    #[test]
    fn test_slot_cap() {
        let (group, _) = build_group(5);
        let prev = prev_header();
        let ctx = VerifyContext::new(group, 12, 9999, prev.clone());
        for i in 0..MAX_SLOTS_PER_HEIGHT {
            let mut bh = header(12, &prev);
            bh.total_qn += i as u64;
            ctx.add_proposal(bh).unwrap();
        }
        let mut extra = header(12, &prev);
        extra.total_qn += 100;
        assert!(matches!(ctx.add_proposal(extra), Err(ConsensusError::SlotLimit)));
    }

    #[test]
    fn test_winning_slot_prefers_weight_then_hash() {
        let (group, secrets) = build_group(3); // threshold 2
        let prev = prev_header();
        let ctx = VerifyContext::new(group, 12, 9999, prev.clone());

        let mut a = header(12, &prev);
        a.total_qn = 7;
        let mut b = header(12, &prev);
        b.total_qn = 9;
        let (ha, hb) = (a.hash(), b.hash());
        ctx.add_proposal(a).unwrap();
        ctx.add_proposal(b.clone()).unwrap();

        for (id, msk) in secrets.iter().take(2) {
            ctx.add_verify_msg(&ha, id, &msk.sign(&ha).to_bytes()).unwrap();
            ctx.add_verify_msg(&hb, id, &msk.sign(&hb).to_bytes()).unwrap();
        }
        let (winner, _) = ctx.pick_winning_slot().unwrap();
        assert_eq!(winner.hash(), hb);
        assert_eq!(winner.total_qn, 9);
    }

    #[test]
    fn test_expiry_formula() {
        assert_eq!(cast_expire_time(1000, 1, 5, 3), 1003);
        assert_eq!(cast_expire_time(1000, 2, 5, 3), 1006);
        // Bootstrap tolerance at height 1.
        assert_eq!(cast_expire_time(1000, 1, 1, 3), 1009);
    }

    #[test]
    fn test_get_or_create_replaces_dead_prev() {
        struct OneHeader(BlockHeader);
        impl HeaderReader for OneHeader {
            fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
                (self.0.hash() == *hash).then(|| self.0.clone())
            }
        }

        let (group, _) = build_group(3);
        let contexts = CastContexts::new();
        let old_prev = prev_header();
        let mut new_prev = prev_header();
        new_prev.random = [8u8; 32];
        new_prev.total_qn = 9;

        // Only the new prev exists on chain.
        let reader = OneHeader(new_prev.clone());
        let first = contexts
            .get_or_create(&reader, group.clone(), 12, 9999, &old_prev)
            .unwrap();
        assert_eq!(first.prev.hash(), old_prev.hash());

        let second = contexts
            .get_or_create(&reader, group, 12, 9999, &new_prev)
            .unwrap();
        assert_eq!(second.prev.hash(), new_prev.hash());
        assert_eq!(contexts.by_height(12).unwrap().prev.hash(), new_prev.hash());
    }

    #[test]
    fn test_recent_casted_keyed_by_prev() {
        let contexts = CastContexts::new();
        contexts.mark_casted(5, &[1u8; 32]);
        assert!(contexts.is_recent_casted(5, &[1u8; 32]));
        // A different prev at the same height is a fresh cast.
        assert!(!contexts.is_recent_casted(5, &[2u8; 32]));
    }

    #[test]
    fn test_proposed_response_quota() {
        let block = Block::new(prev_header(), vec![]);
        let pb = ProposedBlock::new(block, 7); // quota ceil(7/3) = 3
        assert!(pb.may_respond("peer-1"));
        assert!(!pb.may_respond("peer-1"));
        assert!(pb.may_respond("peer-2"));
        assert!(pb.may_respond("peer-3"));
        assert!(!pb.may_respond("peer-4"));
    }
}
