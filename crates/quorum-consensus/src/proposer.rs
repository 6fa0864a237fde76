//! The proposer role: VRF-gated block construction on every new top block.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use quorum_core::constants::PROPOSER_DIFFICULTY;
use quorum_core::{Block, BlockHeader};
use quorum_chain::TxPool;
use quorum_crypto::keccak_concat;
use quorum_crypto::vrf;
use quorum_network::messages::CastVerifyMsg;
use quorum_network::{MsgSender, WireMessage};
use tracing::{debug, info};

use crate::error::{ConsensusError, Result};
use crate::selector::GroupSelector;
use crate::traits::MinerReader;
use crate::verify_context::CastContexts;

/// Transactions packed into one proposed block at most.
const MAX_TXS_PER_BLOCK: usize = 1000;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub struct Proposer {
    contexts: Arc<CastContexts>,
    selector: Arc<GroupSelector>,
    miner_reader: Arc<dyn MinerReader>,
    sender: Arc<dyn MsgSender>,
    tx_pool: Arc<TxPool>,
}

impl Proposer {
    pub fn new(
        contexts: Arc<CastContexts>,
        selector: Arc<GroupSelector>,
        miner_reader: Arc<dyn MinerReader>,
        sender: Arc<dyn MsgSender>,
        tx_pool: Arc<TxPool>,
    ) -> Self {
        Self { contexts, selector, miner_reader, sender, tx_pool }
    }

    /// Attempt to cast at `top.height + 1`. Returns the proposed block when
    /// the local miner won the VRF draw, `None` when it simply is not
    /// eligible this round.
    pub fn on_top_block(&self, top: &BlockHeader) -> Result<Option<Block>> {
        let miner = self.miner_reader.self_miner();
        if !miner.info.can_propose() {
            return Ok(None);
        }
        let height = top.height + 1;
        let prev_hash = top.hash();

        // One cast per (height, prev): a fork to a new parent re-opens the
        // height, a repeat on the same parent does not.
        if self.contexts.is_recent_casted(height, &prev_hash) {
            return Ok(None);
        }

        let group = match self.selector.select(top, height) {
            Some(g) => g,
            None => {
                debug!(height, "no active verify group, not proposing");
                return Ok(None);
            }
        };

        let total_stake: u64 = self
            .miner_reader
            .proposers_at(height)
            .iter()
            .map(|m| m.stake)
            .sum();
        let mut alpha = [0u8; 40];
        alpha[..32].copy_from_slice(&top.random);
        alpha[32..].copy_from_slice(&height.to_be_bytes());
        let (output, proof) = miner.vrf.prove(&alpha);

        let threshold =
            vrf::proposer_threshold(miner.info.stake, total_stake, PROPOSER_DIFFICULTY);
        if !vrf::output_below_threshold(&output, threshold) {
            return Ok(None);
        }

        let transactions = self.tx_pool.take(MAX_TXS_PER_BLOCK);
        let header = BlockHeader {
            height,
            cur_time: unix_now(),
            prev_hash,
            random: keccak_concat(&[&top.random, &output]),
            proof: proof.to_bytes().to_vec(),
            castor: miner.id(),
            group_seed: group.seed,
            total_qn: top.total_qn + vrf::quality_number(&output),
            tx_root: Block::compute_tx_root(&transactions),
            signature: vec![],
        };
        let block = Block::new(header.clone(), transactions);

        self.contexts.add_proposed(block.clone(), group.members.len());
        self.contexts.mark_casted(height, &prev_hash);

        info!(height, qn = header.total_qn, "casting block to verify group");
        self.sender
            .broadcast_group(WireMessage::CastVerify(CastVerifyMsg {
                header,
                prev_random: top.random,
            }))
            .map_err(|e| ConsensusError::Send(e.to_string()))?;
        Ok(Some(block))
    }
}
