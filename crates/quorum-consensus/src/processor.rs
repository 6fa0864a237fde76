//! The message processor: the verifier-side workflow of the cast protocol,
//! block verification for the chain, and routing of reward and fork traffic.

use std::sync::Arc;

use quorum_core::constants::{ConsensusParams, PROPOSER_DIFFICULTY};
use quorum_core::types::Hash;
use quorum_core::{BlockHeader, ChainEvent, ChainListener, VerifyGroup};
use quorum_chain::{BlockChain, BlockVerifier, ChainError, ForkProcessor};
use quorum_crypto::bls;
use quorum_crypto::vrf::{self, VrfProof};
use quorum_crypto::keccak_concat;
use quorum_network::messages::*;
use quorum_network::{MessageHandler, MsgSender, NetworkError, WireMessage};
use quorum_storage::SkDb;
use tracing::{debug, info, warn};

use crate::error::{ConsensusError, Result};
use crate::proposer::unix_now;
use crate::reward::RewardSigner;
use crate::selector::{GroupReader, GroupSelector};
use crate::traits::MinerReader;
use crate::verify_context::{
    cast_expire_time, CastContexts, HeaderReader, VerifyContext, VerifyOutcome,
};

/// Read-only chain surface shared by the selector and the context table.
/// Uses only database-level queries, so it is safe from any lock context.
pub struct ChainReaderAdapter {
    chain: Arc<BlockChain>,
}

impl ChainReaderAdapter {
    pub fn new(chain: Arc<BlockChain>) -> Self {
        Self { chain }
    }
}

impl GroupReader for ChainReaderAdapter {
    fn all_groups(&self) -> Vec<VerifyGroup> {
        self.chain.groups_in_order()
    }
    fn has_height(&self, height: u64) -> bool {
        self.chain.header_by_height(height).is_some()
    }
    fn floor_header(&self, height: u64) -> Option<BlockHeader> {
        self.chain.header_by_height_floor(height)
    }
    fn checkpoint_height(&self) -> u64 {
        self.chain.checkpoint().latest()
    }
}

impl HeaderReader for ChainReaderAdapter {
    fn header_by_hash(&self, hash: &Hash) -> Option<BlockHeader> {
        self.chain.header_by_hash(hash)
    }
}

fn to_net(e: ConsensusError) -> NetworkError {
    NetworkError::Handler(e.to_string())
}

/// Time-derived height delta for the expiry rule: at height one the node may
/// still be syncing, so elapsed wall time stands in for the height gap.
fn delta_height(header: &BlockHeader, prev: &BlockHeader, max_cast_time: u64) -> u64 {
    if header.height == 1 {
        unix_now().saturating_sub(prev.cur_time) / max_cast_time.max(1) + 1
    } else {
        header.height - prev.height
    }
}

pub struct ConsensusProcessor {
    params: ConsensusParams,
    chain: Arc<BlockChain>,
    sk_db: Arc<SkDb>,
    contexts: Arc<CastContexts>,
    selector: Arc<GroupSelector>,
    adapter: Arc<ChainReaderAdapter>,
    miner_reader: Arc<dyn MinerReader>,
    sender: Arc<dyn MsgSender>,
    fork: Arc<ForkProcessor>,
    reward: Arc<RewardSigner>,
}

impl ConsensusProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ConsensusParams,
        chain: Arc<BlockChain>,
        sk_db: Arc<SkDb>,
        contexts: Arc<CastContexts>,
        selector: Arc<GroupSelector>,
        miner_reader: Arc<dyn MinerReader>,
        sender: Arc<dyn MsgSender>,
        fork: Arc<ForkProcessor>,
        reward: Arc<RewardSigner>,
    ) -> Arc<Self> {
        let adapter = Arc::new(ChainReaderAdapter::new(chain.clone()));
        Arc::new(Self {
            params,
            chain,
            sk_db,
            contexts,
            selector,
            adapter,
            miner_reader,
            sender,
            fork,
            reward,
        })
    }

    /// Validate the proposer's claim on (height, parent): VRF proof, stake
    /// threshold, beacon continuity and chain weight.
    fn verify_proposal(&self, header: &BlockHeader, prev: &BlockHeader) -> Result<()> {
        let castor = self
            .miner_reader
            .miner_by_id(&header.castor)
            .ok_or_else(|| ConsensusError::InvalidProposal("unknown castor".to_string()))?;
        if !castor.can_propose() {
            return Err(ConsensusError::InvalidProposal(
                "castor may not propose".to_string(),
            ));
        }

        let proof = VrfProof::from_bytes(&header.proof)
            .map_err(|_| ConsensusError::InvalidProposal("malformed vrf proof".to_string()))?;
        let mut alpha = [0u8; 40];
        alpha[..32].copy_from_slice(&prev.random);
        alpha[32..].copy_from_slice(&header.height.to_be_bytes());
        let output = vrf::vrf_verify(&castor.vrf_pubkey, &alpha, &proof)
            .map_err(|_| ConsensusError::InvalidProposal("vrf proof invalid".to_string()))?;

        let total_stake: u64 = self
            .miner_reader
            .proposers_at(header.height)
            .iter()
            .map(|m| m.stake)
            .sum();
        let threshold = vrf::proposer_threshold(castor.stake, total_stake, PROPOSER_DIFFICULTY);
        if !vrf::output_below_threshold(&output, threshold) {
            return Err(ConsensusError::InvalidProposal(
                "vrf output over stake threshold".to_string(),
            ));
        }

        if header.random != keccak_concat(&[&prev.random, &output]) {
            return Err(ConsensusError::InvalidProposal(
                "beacon randomness mismatch".to_string(),
            ));
        }
        if header.total_qn != prev.total_qn + vrf::quality_number(&output) {
            return Err(ConsensusError::InvalidProposal(
                "total quality number mismatch".to_string(),
            ));
        }
        Ok(())
    }

    fn feed_verify(
        &self,
        ctx: &Arc<VerifyContext>,
        block_hash: &Hash,
        member: &quorum_core::types::Address,
        sign: &[u8],
        source: &str,
    ) {
        match ctx.add_verify_msg(block_hash, member, sign) {
            Ok(VerifyOutcome::Aggregated { signature }) => {
                self.finalize(ctx, block_hash, signature, source);
            }
            Ok(VerifyOutcome::Accepted { count }) => {
                debug!(count, "verify message accepted");
            }
            Ok(VerifyOutcome::AlreadyAggregated) => {}
            Err(ConsensusError::DuplicateVerifyMsg) => {}
            Err(e) => debug!(error = %e, "verify message dropped"),
        }
    }

    /// A slot reached threshold: attach the group signature and commit, or
    /// fetch the body first if only the header is known here.
    fn finalize(
        &self,
        ctx: &Arc<VerifyContext>,
        block_hash: &Hash,
        group_sign: bls::Signature,
        source: &str,
    ) {
        let Some(proposed) = self.contexts.proposed(block_hash) else {
            debug!("aggregated without body, requesting proposal block");
            if let Err(e) = self.sender.send(
                source,
                WireMessage::ReqProposalBlock(ReqProposalBlock { hash: *block_hash }),
            ) {
                warn!(error = %e, "proposal body request failed");
            }
            return;
        };

        let mut block = proposed.block.clone();
        block.header.signature = group_sign.to_vec();
        let signers = ctx.slot_signers(block_hash);
        match self.chain.add_block(block) {
            Ok(()) => {
                ctx.mark_broadcast(block_hash);
                info!(height = ctx.cast_height, "block finalised by group threshold");
                if let Err(e) =
                    self.reward
                        .request_signatures(ctx.group.clone(), *block_hash, signers)
                {
                    warn!(error = %e, "reward signing round failed to start");
                }
            }
            Err(ChainError::DuplicateBlock(_)) => {}
            Err(e) => warn!(error = %e, "finalised block rejected by chain"),
        }
    }
}

impl MessageHandler for ConsensusProcessor {
    fn on_cast_verify(&self, source: &str, msg: CastVerifyMsg) -> quorum_network::Result<()> {
        let header = msg.header;
        let hash = header.hash();
        let Some(prev) = self.chain.header_by_hash(&header.prev_hash) else {
            debug!("cast for unknown parent, dropped");
            return Ok(());
        };
        if msg.prev_random != prev.random {
            warn!(source, "cast message parent randomness mismatch");
            return Ok(());
        }
        self.verify_proposal(&header, &prev).map_err(to_net)?;

        let Some(picked) = self.selector.select(&prev, header.height) else {
            debug!("no active group for cast height, dropped");
            return Ok(());
        };
        if picked.seed != header.group_seed {
            warn!(source, "cast addressed to the wrong group");
            return Ok(());
        }
        let miner = self.miner_reader.self_miner();
        if !picked.has_member(&miner.id()) {
            return Ok(());
        }

        let expire = cast_expire_time(
            prev.cur_time,
            delta_height(&header, &prev, self.params.max_group_cast_time),
            header.height,
            self.params.max_group_cast_time,
        );
        if unix_now() >= expire {
            debug!(height = header.height, "cast round already expired");
            return Ok(());
        }

        let group = Arc::new(picked);
        let Some(ctx) = self.contexts.get_or_create(
            self.adapter.as_ref(),
            group.clone(),
            header.height,
            expire,
            &prev,
        ) else {
            return Ok(());
        };
        if let Err(e) = ctx.add_proposal(header.clone()) {
            debug!(error = %e, "proposal not slotted");
            return Ok(());
        }
        self.contexts.attach_hash(hash, ctx.clone());

        // Sign with our master secret share and fan the partial out.
        let Some(msk_bytes) = self
            .sk_db
            .get(&group.seed)
            .map_err(|e| to_net(e.into()))?
            .and_then(|r| r.msk)
        else {
            warn!(seed = %hex::encode(group.seed), "no master share, cannot verify cast");
            return Ok(());
        };
        let msk = bls::Seckey::from_bytes(&msk_bytes).map_err(|e| to_net(e.into()))?;
        let sign = msk.sign(&hash);

        self.feed_verify(&ctx, &hash, &miner.id(), &sign.to_bytes(), source);
        for (member, buffered_sign) in self.contexts.take_buffered(&hash) {
            self.feed_verify(&ctx, &hash, &member, &buffered_sign, source);
        }

        self.sender
            .broadcast_group(WireMessage::VerifiedCast(VerifiedCastMsg {
                block_hash: hash,
                member: miner.id(),
                sign: sign.to_vec(),
            }))?;
        Ok(())
    }

    fn on_verified_cast(&self, source: &str, msg: VerifiedCastMsg) -> quorum_network::Result<()> {
        let Some(ctx) = self.contexts.by_block_hash(&msg.block_hash) else {
            // The proposal may still be in flight; park the signature.
            self.contexts
                .buffer_verify_msg(msg.block_hash, msg.member, msg.sign);
            return Ok(());
        };
        self.feed_verify(&ctx, &msg.block_hash, &msg.member, &msg.sign, source);
        Ok(())
    }

    fn on_reward_sign_req(
        &self,
        source: &str,
        msg: CastRewardSignReq,
    ) -> quorum_network::Result<()> {
        self.reward.on_sign_req(source, msg).map_err(to_net)
    }

    fn on_reward_sign_got(
        &self,
        _source: &str,
        msg: CastRewardSignGot,
    ) -> quorum_network::Result<()> {
        self.reward.on_sign_got(msg).map_err(to_net)
    }

    fn on_req_proposal_block(
        &self,
        source: &str,
        msg: ReqProposalBlock,
    ) -> quorum_network::Result<()> {
        let Some(proposed) = self.contexts.proposed(&msg.hash) else {
            return Ok(());
        };
        if !proposed.may_respond(source) {
            debug!(source, "proposal body quota exhausted");
            return Ok(());
        }
        self.sender.send(
            source,
            WireMessage::ResponseProposalBlock(ResponseProposalBlock {
                hash: msg.hash,
                block: Some(proposed.block.clone()),
            }),
        )?;
        Ok(())
    }

    fn on_response_proposal_block(
        &self,
        _source: &str,
        msg: ResponseProposalBlock,
    ) -> quorum_network::Result<()> {
        let Some(mut block) = msg.block else { return Ok(()) };
        if block.hash() != msg.hash {
            warn!("proposal body does not match requested hash");
            return Ok(());
        }
        let Some(ctx) = self.contexts.by_block_hash(&msg.hash) else {
            return Ok(());
        };
        let Some(group_sign) = ctx.group_sign_of(&msg.hash) else {
            debug!("body arrived before aggregation, dropped");
            return Ok(());
        };
        block.header.signature = group_sign.to_vec();
        match self.chain.add_block(block) {
            Ok(()) => ctx.mark_broadcast(&msg.hash),
            Err(ChainError::DuplicateBlock(_)) => {}
            Err(e) => warn!(error = %e, "fetched block rejected"),
        }
        Ok(())
    }

    fn on_find_ancestor_req(
        &self,
        source: &str,
        msg: ForkFindAncestorReq,
    ) -> quorum_network::Result<()> {
        self.fork
            .on_find_ancestor_req(source, msg)
            .map_err(|e| NetworkError::Handler(e.to_string()))
    }

    fn on_find_ancestor_response(
        &self,
        source: &str,
        msg: ForkFindAncestorResponse,
    ) -> quorum_network::Result<()> {
        self.fork
            .on_find_ancestor_response(source, msg)
            .map_err(|e| NetworkError::Handler(e.to_string()))
    }

    fn on_chain_slice_req(
        &self,
        source: &str,
        msg: ForkChainSliceReq,
    ) -> quorum_network::Result<()> {
        self.fork
            .on_chain_slice_req(source, msg)
            .map_err(|e| NetworkError::Handler(e.to_string()))
    }

    fn on_chain_slice_response(
        &self,
        source: &str,
        msg: ForkChainSliceResponse,
    ) -> quorum_network::Result<()> {
        self.fork
            .on_chain_slice_response(source, msg)
            .map_err(|e| NetworkError::Handler(e.to_string()))
    }
}

/// Verification the chain runs before committing any block: group threshold
/// signature plus the proposer claim. Blocks before the first group forms
/// carry no signature and pass on the proposer checks alone.
impl BlockVerifier for ConsensusProcessor {
    fn verify_block(
        &self,
        header: &BlockHeader,
        prev: &BlockHeader,
    ) -> quorum_chain::Result<()> {
        if header.height == 0 {
            return Ok(());
        }
        self.verify_proposal(header, prev)
            .map_err(|e| ChainError::GroupVerification(e.to_string()))?;

        let Some(group) = self.selector.select(prev, header.height) else {
            // Bootstrap: no lived groups yet.
            return Ok(());
        };
        if group.seed != header.group_seed {
            return Err(ChainError::GroupVerification(
                "block signed by non-selected group".to_string(),
            ));
        }
        let sig = bls::Signature::from_bytes(&header.signature)
            .map_err(|e| ChainError::GroupVerification(e.to_string()))?;
        let pk = bls::Pubkey::from_bytes(&group.pubkey)
            .map_err(|e| ChainError::GroupVerification(e.to_string()))?;
        if !sig.verify(&header.hash(), &pk) {
            return Err(ChainError::GroupVerification(
                "group threshold signature invalid".to_string(),
            ));
        }
        Ok(())
    }
}

/// Post-commit housekeeping: contexts outside the verify window and bodies
/// of committed proposals are dropped.
impl ChainListener for ConsensusProcessor {
    fn on_chain_event(&self, event: &ChainEvent) {
        if let ChainEvent::BlockAdded(block) = event {
            self.contexts.clean_below(block.header.height);
            self.contexts.remove_proposed(&block.hash());
        }
    }
}
