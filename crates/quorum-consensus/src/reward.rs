//! Reward-transaction signing: after a block finalises, the proposer builds
//! a reward skeleton naming the contributing verifiers; group members return
//! partial signatures, and at threshold the recovered group signature turns
//! the skeleton into a pool-admissible reward transaction.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use quorum_core::types::{Address, Hash};
use quorum_core::{RewardPayload, Transaction, TxKind, VerifyGroup};
use quorum_chain::{BlockChain, RewardPool, TxPool};
use quorum_crypto::bls;
use quorum_network::messages::{CastRewardSignGot, CastRewardSignReq};
use quorum_network::{MsgSender, WireMessage};
use quorum_storage::SkDb;
use tracing::{debug, info, warn};

use crate::error::{ConsensusError, Result};
use crate::traits::MinerReader;

/// Reward issued per finalised block, split across the signing members.
/// The full economics table is outside the consensus core.
pub const REWARD_PER_BLOCK: u64 = 50;

const PENDING_CACHE: usize = 64;

struct PendingReward {
    payload: RewardPayload,
    group: Arc<VerifyGroup>,
    parts: HashMap<Address, (u64, bls::Signature)>,
}

pub struct RewardSigner {
    chain: Arc<BlockChain>,
    sk_db: Arc<SkDb>,
    miner_reader: Arc<dyn MinerReader>,
    sender: Arc<dyn MsgSender>,
    reward_pool: Arc<RewardPool>,
    tx_pool: Arc<TxPool>,
    pending: Mutex<LruCache<Hash, PendingReward>>,
}

impl RewardSigner {
    pub fn new(
        chain: Arc<BlockChain>,
        sk_db: Arc<SkDb>,
        miner_reader: Arc<dyn MinerReader>,
        sender: Arc<dyn MsgSender>,
        reward_pool: Arc<RewardPool>,
        tx_pool: Arc<TxPool>,
    ) -> Self {
        Self {
            chain,
            sk_db,
            miner_reader,
            sender,
            reward_pool,
            tx_pool,
            pending: Mutex::new(LruCache::new(NonZeroUsize::new(PENDING_CACHE).unwrap())),
        }
    }

    /// Proposer side: open a signing round for `block_hash`, paying the
    /// members that contributed partial block signatures.
    pub fn request_signatures(
        &self,
        group: Arc<VerifyGroup>,
        block_hash: Hash,
        signers: Vec<Address>,
    ) -> Result<()> {
        if self.reward_pool.has_reward_for(&block_hash) {
            return Ok(());
        }
        let payload = RewardPayload {
            block_hash,
            group_seed: group.seed,
            target_ids: signers,
            value: REWARD_PER_BLOCK,
            group_sign: vec![],
        };
        self.pending.lock().put(
            block_hash,
            PendingReward { payload: payload.clone(), group, parts: HashMap::new() },
        );

        // Contribute our own partial before asking the group.
        if let Some(got) = self.sign_payload(&payload)? {
            self.accept_partial(got)?;
        }
        self.sender
            .broadcast_group(WireMessage::CastRewardSignReq(CastRewardSignReq {
                reward: payload,
            }))
            .map_err(|e| ConsensusError::Send(e.to_string()))?;
        Ok(())
    }

    /// Produce this miner's partial reward signature, if it belongs to the
    /// group and holds a master share.
    fn sign_payload(&self, payload: &RewardPayload) -> Result<Option<CastRewardSignGot>> {
        let miner = self.miner_reader.self_miner();
        let Some(group) = self.chain.group_by_seed(&payload.group_seed) else {
            return Ok(None);
        };
        if !group.has_member(&miner.id()) {
            return Ok(None);
        }
        let Some(msk_bytes) = self.sk_db.get(&group.seed)?.and_then(|r| r.msk) else {
            warn!(seed = %hex::encode(group.seed), "no master share for reward signing");
            return Ok(None);
        };
        let msk = bls::Seckey::from_bytes(&msk_bytes)?;
        let sign = msk.sign(&payload.signed_data());
        Ok(Some(CastRewardSignGot {
            block_hash: payload.block_hash,
            member: miner.id(),
            sign: sign.to_vec(),
        }))
    }

    /// Verifier side: sign a reward skeleton for a block we have on chain.
    pub fn on_sign_req(&self, source: &str, msg: CastRewardSignReq) -> Result<()> {
        if !self.chain.has_block(&msg.reward.block_hash) {
            debug!("reward request for unknown block, ignored");
            return Ok(());
        }
        if let Some(got) = self.sign_payload(&msg.reward)? {
            self.sender
                .send(source, WireMessage::CastRewardSignGot(got))
                .map_err(|e| ConsensusError::Send(e.to_string()))?;
        }
        Ok(())
    }

    /// Proposer side: accumulate a partial; at threshold, recover the group
    /// signature and admit the finished reward transaction.
    pub fn on_sign_got(&self, msg: CastRewardSignGot) -> Result<()> {
        self.accept_partial(msg)
    }

    fn accept_partial(&self, msg: CastRewardSignGot) -> Result<()> {
        let mut pending = self.pending.lock();
        let Some(entry) = pending.get_mut(&msg.block_hash) else {
            return Ok(());
        };
        let Some(member) = entry.group.member(&msg.member).cloned() else {
            warn!(member = %msg.member, "reward partial from non-member dropped");
            return Ok(());
        };
        if entry.parts.contains_key(&msg.member) {
            return Ok(());
        }

        let signature = bls::Signature::from_bytes(&msg.sign)?;
        let member_pk = bls::Pubkey::from_bytes(&member.pubkey)?;
        if !signature.verify(&entry.payload.signed_data(), &member_pk) {
            warn!(member = %msg.member, "invalid reward partial dropped");
            return Ok(());
        }
        entry.parts.insert(msg.member, (member.share_index, signature));

        let threshold = entry.group.threshold_count();
        if entry.parts.len() < threshold {
            return Ok(());
        }

        let parts: Vec<(u64, bls::Signature)> =
            entry.parts.values().map(|(i, s)| (*i, *s)).collect();
        let group_sign = bls::recover_signature(&parts, threshold)?;
        let group_pk = bls::Pubkey::from_bytes(&entry.group.pubkey)?;
        if !group_sign.verify(&entry.payload.signed_data(), &group_pk) {
            warn!("recovered reward signature invalid");
            return Ok(());
        }

        let mut payload = entry.payload.clone();
        payload.group_sign = group_sign.to_vec();
        let block_hash = payload.block_hash;
        let tx = Transaction {
            kind: TxKind::Reward,
            source: self.miner_reader.self_miner().id(),
            target: None,
            value: payload.value,
            nonce: 0,
            data: rmp_serde::to_vec(&payload)
                .map_err(|e| ConsensusError::Send(e.to_string()))?,
        };
        pending.pop(&block_hash);
        drop(pending);

        info!(block = %hex::encode(block_hash), "reward transaction signed");
        self.reward_pool.add(tx.clone());
        self.tx_pool.add(tx);
        Ok(())
    }
}
