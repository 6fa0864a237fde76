//! Fork processor.
//!
//! When a peer announces a heavier top, a three-phase dialogue runs: locator
//! hashes walking back from our top with geometric strides find the highest
//! common ancestor, a bounded slice of the peer's chain is fetched, and the
//! local top is atomically reset and replayed. A pre-image of the removed
//! blocks is kept so a failed replay restores the original chain. Forks that
//! would rewrite checkpointed history are refused regardless of weight.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use quorum_core::constants::{
    FORK_PEER_COOLDOWN_SECS, FORK_PIECE_COUNT, FORK_STEP_TIMEOUT_SECS, SHORT_FORK,
};
use quorum_core::types::Hash;
use quorum_core::BlockHeader;
use quorum_network::messages::{
    ForkChainSliceReq, ForkChainSliceResponse, ForkFindAncestorReq, ForkFindAncestorResponse,
};
use quorum_network::{MsgSender, WireMessage};
use tracing::{debug, info, warn};

use crate::chain::BlockChain;
use crate::error::{ChainError, Result};

struct Dialogue {
    peer: String,
    peer_top: BlockHeader,
    ancestor: Option<BlockHeader>,
    deadline: Instant,
}

pub struct ForkProcessor {
    chain: Arc<BlockChain>,
    sender: Arc<dyn MsgSender>,
    dialogue: Mutex<Option<Dialogue>>,
    cooldown: Mutex<HashMap<String, Instant>>,
}

impl ForkProcessor {
    pub fn new(chain: Arc<BlockChain>, sender: Arc<dyn MsgSender>) -> Self {
        Self {
            chain,
            sender,
            dialogue: Mutex::new(None),
            cooldown: Mutex::new(HashMap::new()),
        }
    }

    /// Locator hashes walking back from the top with geometric strides.
    fn locator_pieces(&self) -> Vec<Hash> {
        let top = self.chain.top_header();
        let mut pieces = Vec::with_capacity(FORK_PIECE_COUNT);
        let mut stride = 1u64;
        let mut height = top.height;
        while pieces.len() < FORK_PIECE_COUNT {
            if let Some(h) = self.chain.header_by_height_floor(height) {
                let hash = h.hash();
                if pieces.last() != Some(&hash) {
                    pieces.push(hash);
                }
            }
            if height == 0 {
                break;
            }
            height = height.saturating_sub(stride);
            stride = stride.saturating_mul(2);
        }
        pieces
    }

    /// Entry point: a peer announced `peer_top`. Starts the ancestor-finding
    /// dialogue when the peer's chain is heavier and the peer is not cooling
    /// down.
    pub fn try_process(&self, peer: &str, peer_top: BlockHeader) -> Result<()> {
        let local_top = self.chain.top_header();
        if !peer_top.heavier_than(&local_top) {
            return Ok(());
        }
        let now = Instant::now();
        if let Some(until) = self.cooldown.lock().get(peer) {
            if *until > now {
                debug!(peer, "peer cooling down, fork ignored");
                return Ok(());
            }
        }
        {
            let mut dialogue = self.dialogue.lock();
            match dialogue.as_ref() {
                Some(d) if d.deadline > now => return Ok(()), // one dialogue at a time
                _ => {}
            }
            *dialogue = Some(Dialogue {
                peer: peer.to_string(),
                peer_top: peer_top.clone(),
                ancestor: None,
                deadline: now + Duration::from_secs(FORK_STEP_TIMEOUT_SECS),
            });
        }
        info!(peer, peer_height = peer_top.height, peer_qn = peer_top.total_qn,
            local_qn = local_top.total_qn, "starting fork dialogue");
        let req = ForkFindAncestorReq {
            pieces: self.locator_pieces(),
            top_height: local_top.height,
        };
        self.sender
            .send(peer, WireMessage::ForkFindAncestorReq(req))?;
        Ok(())
    }

    /// Responder side: return the highest locator hash on our canonical chain.
    pub fn on_find_ancestor_req(&self, source: &str, msg: ForkFindAncestorReq) -> Result<()> {
        let ancestor = msg.pieces.iter().find_map(|hash| {
            let header = self.chain.header_by_hash(hash)?;
            self.chain.is_canonical(&header).then_some(*hash)
        });
        let response = ForkFindAncestorResponse {
            ancestor,
            top: self.chain.top_header().as_ref().clone(),
        };
        self.sender
            .send(source, WireMessage::ForkFindAncestorResponse(response))?;
        Ok(())
    }

    pub fn on_find_ancestor_response(
        &self,
        source: &str,
        msg: ForkFindAncestorResponse,
    ) -> Result<()> {
        let (peer, slice_req) = {
            let mut dialogue = self.dialogue.lock();
            let d = match dialogue.as_mut() {
                Some(d) if d.peer == source => d,
                _ => {
                    debug!(source, "unsolicited ancestor response dropped");
                    return Ok(());
                }
            };

            let ancestor_hash = match msg.ancestor {
                Some(h) => h,
                None => {
                    warn!(source, "no common ancestor with peer");
                    *dialogue = None;
                    self.punish(source);
                    return Ok(());
                }
            };
            let ancestor = match self.chain.header_by_hash(&ancestor_hash) {
                Some(h) if self.chain.is_canonical(&h) => h,
                _ => {
                    warn!(source, "peer ancestor unknown locally");
                    *dialogue = None;
                    return Ok(());
                }
            };

            let cp = self.chain.checkpoint().latest();
            if ancestor.height < cp {
                warn!(source, ancestor = ancestor.height, checkpoint = cp,
                    "fork crosses checkpoint, rejected");
                *dialogue = None;
                return Err(ChainError::CheckpointViolation(cp));
            }
            let local_top = self.chain.top_header();
            let depth = local_top.height.saturating_sub(ancestor.height);
            if depth > SHORT_FORK {
                warn!(source, depth, "fork too deep, rejected");
                *dialogue = None;
                self.punish(source);
                return Ok(());
            }

            let begin = ancestor.height + 1;
            let end = msg.top.height + 1;
            d.ancestor = Some(ancestor);
            d.peer_top = msg.top;
            d.deadline = Instant::now() + Duration::from_secs(FORK_STEP_TIMEOUT_SECS);
            (d.peer.clone(), ForkChainSliceReq { begin, end })
        };
        self.sender
            .send(&peer, WireMessage::ForkChainSliceReq(slice_req))?;
        Ok(())
    }

    pub fn on_chain_slice_req(&self, source: &str, msg: ForkChainSliceReq) -> Result<()> {
        // Bound the served range: a legitimate short fork never needs more.
        let end = msg.end.min(msg.begin.saturating_add(SHORT_FORK + 1));
        let blocks = self.chain.blocks_between(msg.begin, end);
        self.sender.send(
            source,
            WireMessage::ForkChainSliceResponse(ForkChainSliceResponse { blocks }),
        )?;
        Ok(())
    }

    /// Apply phase: reset to the ancestor and replay the peer's slice.
    /// Any verification failure restores the pre-image.
    pub fn on_chain_slice_response(
        &self,
        source: &str,
        msg: ForkChainSliceResponse,
    ) -> Result<()> {
        let ancestor = {
            let mut dialogue = self.dialogue.lock();
            match dialogue.take() {
                Some(d) if d.peer == source && d.ancestor.is_some() => d.ancestor.unwrap(),
                other => {
                    *dialogue = other;
                    debug!(source, "unsolicited chain slice dropped");
                    return Ok(());
                }
            }
        };

        if msg.blocks.is_empty() {
            self.punish(source);
            return Err(ChainError::ForkRejected("empty chain slice".to_string()));
        }
        // Linkage and weight checks before touching the chain.
        let mut prev_hash = ancestor.hash();
        for block in &msg.blocks {
            if block.header.prev_hash != prev_hash {
                self.punish(source);
                return Err(ChainError::ForkRejected("broken slice linkage".to_string()));
            }
            prev_hash = block.hash();
        }
        let local_top = self.chain.top_header();
        let peer_tip = &msg.blocks.last().unwrap().header;
        if !peer_tip.heavier_than(&local_top) {
            return Err(ChainError::ForkRejected(
                "peer chain no longer heavier".to_string(),
            ));
        }

        let removed = self.chain.reset_top(&ancestor)?;
        for block in msg.blocks {
            let height = block.header.height;
            if let Err(e) = self.chain.add_block(block) {
                warn!(height, error = %e, "fork replay failed, restoring pre-image");
                self.restore(&ancestor, removed);
                self.punish(source);
                return Err(e);
            }
        }
        info!(source, height = self.chain.height(), "fork adopted peer chain");
        Ok(())
    }

    /// Abort an expired dialogue and put the peer on cooldown. Driven by the
    /// fork worker's clock, not by timers.
    pub fn tick(&self, now: Instant) {
        let expired_peer = {
            let mut dialogue = self.dialogue.lock();
            match dialogue.as_ref() {
                Some(d) if d.deadline <= now => {
                    let peer = d.peer.clone();
                    *dialogue = None;
                    Some(peer)
                }
                _ => None,
            }
        };
        if let Some(peer) = expired_peer {
            warn!(peer, "fork dialogue timed out");
            self.punish(&peer);
        }
    }

    fn punish(&self, peer: &str) {
        self.cooldown.lock().insert(
            peer.to_string(),
            Instant::now() + Duration::from_secs(FORK_PEER_COOLDOWN_SECS),
        );
    }

    fn restore(&self, ancestor: &BlockHeader, removed: Vec<quorum_core::Block>) {
        if self.chain.reset_top(ancestor).is_err() {
            warn!("pre-image restore: reset failed");
            return;
        }
        // `removed` is newest-first; replay oldest-first.
        for block in removed.into_iter().rev() {
            if let Err(e) = self.chain.add_block(block) {
                warn!(error = %e, "pre-image restore incomplete");
                break;
            }
        }
    }
}
