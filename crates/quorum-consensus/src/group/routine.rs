//! The group-creation routine: one threshold-DKG round per era, driven by
//! accepted top blocks.
//!
//! Every phase check is advisory and idempotent. The on-chain packet store
//! is consulted before anything is sent, so a restarted node never re-deals
//! and a missed window simply forfeits membership for the era. The routine
//! lock serialises the phase dispatch only; it never nests inside the chain
//! write lock because it runs from the post-commit event bus.

use std::sync::Arc;

use parking_lot::Mutex;
use quorum_core::constants::{ConsensusParams, MEMBER_MAX_JOIN_GROUPS};
use quorum_core::types::Hash;
use quorum_core::{
    BlockHeader, ChainEvent, ChainListener, EncryptedPiecePacket, MinerInfo, MpkPacket,
    OriginPiecePacket,
};
use quorum_chain::{BlockChain, GroupStore};
use quorum_crypto::bls;
use quorum_crypto::sha_concat;
use quorum_storage::{SkDb, SkRecord};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::era::Era;
use crate::error::{ConsensusError, Result};
use crate::fts::CandidateSelector;
use crate::group::sk_store::SkCommand;
use crate::traits::{GroupPacketSender, JoinedGroupFilter, MinerReader};

/// Per-era working state, replaced atomically when the era changes.
pub struct CreateContext {
    pub era: Era,
    pub cands: Vec<MinerInfo>,
    pub selected: bool,
    sent_piece: bool,
    sent_mpk: bool,
    sent_origin: bool,
}

impl CreateContext {
    fn new(era: Era) -> Self {
        Self {
            era,
            cands: Vec::new(),
            selected: false,
            sent_piece: false,
            sent_mpk: false,
            sent_origin: false,
        }
    }

    fn my_index(&self, id: &quorum_core::types::Address) -> Option<usize> {
        self.cands.iter().position(|c| c.id == *id)
    }
}

pub struct CreateRoutine {
    params: ConsensusParams,
    chain: Arc<BlockChain>,
    store: GroupStore,
    miner_reader: Arc<dyn MinerReader>,
    packet_sender: Arc<dyn GroupPacketSender>,
    group_filter: Arc<dyn JoinedGroupFilter>,
    sk_tx: mpsc::Sender<SkCommand>,
    sk_db: Arc<SkDb>,
    ctx: Mutex<Option<CreateContext>>,
}

impl CreateRoutine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        params: ConsensusParams,
        chain: Arc<BlockChain>,
        miner_reader: Arc<dyn MinerReader>,
        packet_sender: Arc<dyn GroupPacketSender>,
        group_filter: Arc<dyn JoinedGroupFilter>,
        sk_tx: mpsc::Sender<SkCommand>,
        sk_db: Arc<SkDb>,
    ) -> Arc<Self> {
        let store = chain.group_store().clone();
        let routine = Arc::new(Self {
            params,
            chain,
            store,
            miner_reader,
            packet_sender,
            group_filter,
            sk_tx,
            sk_db,
            ctx: Mutex::new(None),
        });
        let top = routine.chain.top_header();
        routine.update_context(&top);
        routine
    }

    /// Drive the state machine with a new top block. Phase failures are
    /// logged and swallowed: they forfeit this cycle, never crash the node.
    pub fn on_new_top(&self, bh: &BlockHeader) {
        if self
            .sk_tx
            .try_send(SkCommand::Tick { height: bh.height })
            .is_err()
        {
            debug!("sk store busy, tick dropped");
        }

        self.update_context(bh);

        match self.check_and_send_piece(bh) {
            Err(e) => error!(height = bh.height, error = %e, "piece phase failed"),
            Ok(true) => debug!(height = bh.height, "sent encrypted piece packet"),
            Ok(false) => {}
        }
        match self.check_and_send_mpk(bh) {
            Err(e) => error!(height = bh.height, error = %e, "mpk phase failed"),
            Ok(true) => debug!(height = bh.height, "sent mpk packet"),
            Ok(false) => {}
        }
        match self.check_and_send_origin(bh) {
            Err(e) => error!(height = bh.height, error = %e, "origin phase failed"),
            Ok(true) => debug!(height = bh.height, "sent origin piece packet"),
            Ok(false) => {}
        }
    }

    /// Rebuild the era context when the seed moved, or when a fork replaced
    /// the seed block (same height, different hash).
    fn update_context(&self, bh: &BlockHeader) {
        let mut guard = self.ctx.lock();

        let seed_height = Era::seed_height_for(bh.height, &self.params);
        let seed_block = self.chain.header_by_height(seed_height);
        if let Some(ctx) = guard.as_ref() {
            if ctx.era.same_era(seed_height, seed_block.as_ref()) {
                return;
            }
        }

        let era = Era::new(seed_height, seed_block, &self.params);
        debug!(seed_height, piece = %era.piece_range, mpk = %era.mpk_range,
            origin = %era.ori_piece_range, "new create context");
        let mut ctx = CreateContext::new(era);
        if let Err(e) = self.select_candidates(&mut ctx) {
            debug!(seed_height, error = %e, "candidate selection skipped");
        }
        *guard = Some(ctx);
    }

    fn select_candidates(&self, ctx: &mut CreateContext) -> Result<()> {
        let era = &ctx.era;
        if !era.seed_exists() {
            return Err(ConsensusError::SeedMissing(era.seed_height));
        }
        let seed_height = era.seed_height;
        let all_verifiers = self.miner_reader.verifiers_at(seed_height);
        if all_verifiers.len() < self.params.group_min {
            return Err(ConsensusError::NotEnoughCandidates(all_verifiers.len()));
        }

        // Miners saturated with lived groups sit this era out.
        let available: Vec<MinerInfo> = all_verifiers
            .into_iter()
            .filter(|m| {
                self.group_filter.joined_lived_groups(&m.id, seed_height)
                    < MEMBER_MAX_JOIN_GROUPS
            })
            .collect();
        let count = available.len().min(self.params.group_max);
        if count < self.params.group_min {
            return Err(ConsensusError::NotEnoughCandidates(available.len()));
        }

        let random = era.seed_random().expect("seed exists");
        let selected = CandidateSelector::new(available, &random).fts(count);

        let my_id = self.miner_reader.self_miner().id();
        ctx.selected = selected.iter().any(|m| m.id == my_id);
        ctx.cands = selected;
        debug!(
            seed_height,
            candidates = ctx.cands.len(),
            selected = ctx.selected,
            "candidates selected"
        );
        Ok(())
    }

    /// Deterministic per-era share polynomial, derived from the miner's
    /// secret seed and the era seed. Regenerable for the origin reveal.
    fn share_polynomial(&self, seed: &Hash, threshold: usize) -> bls::SharePolynomial {
        let miner = self.miner_reader.self_miner();
        bls::SharePolynomial::from_seed(&sha_concat(&[&miner.secret_seed, seed]), threshold)
    }

    fn check_and_send_piece(&self, bh: &BlockHeader) -> Result<bool> {
        let mut guard = self.ctx.lock();
        let Some(ctx) = guard.as_mut() else { return Ok(false) };
        let era = &ctx.era;
        if !era.seed_exists() {
            return Err(ConsensusError::SeedMissing(era.seed_height));
        }
        if !era.piece_range.contains(bh.height) || !ctx.selected {
            return Ok(false);
        }
        let miner = self.miner_reader.self_miner();
        if !miner.info.can_join_group() {
            return Err(ConsensusError::CannotJoinGroup);
        }
        let seed = era.seed().expect("seed exists");
        if ctx.sent_piece || self.store.has_sent_piece(&seed, &miner.id())? {
            return Ok(false);
        }

        let threshold = ConsensusParams::threshold(ctx.cands.len());
        let poly = self.share_polynomial(&seed, threshold);
        let enc_sk = bls::Seckey::random();

        let mut pieces = Vec::with_capacity(ctx.cands.len());
        for (j, cand) in ctx.cands.iter().enumerate() {
            let index = j as u64 + 1;
            let share = poly.share_at(index)?;
            let peer_pk = bls::Pubkey::from_bytes(&cand.pubkey)?;
            pieces.push(bls::encrypt_share(&enc_sk, &peer_pk, index, &share.to_bytes())?);
        }

        // Secrets go to the durable store before the packet leaves.
        self.sk_tx
            .try_send(SkCommand::Store {
                seed,
                record: SkRecord {
                    enc_seckey: Some(enc_sk.to_bytes()),
                    msk: None,
                    expire_height: era.dismiss_height(&self.params),
                },
            })
            .map_err(|e| ConsensusError::Send(e.to_string()))?;

        let packet = EncryptedPiecePacket {
            seed,
            sender: miner.id(),
            pubkey0: poly.commitment0().to_vec(),
            enc_pubkey: enc_sk.pubkey().to_vec(),
            pieces,
        };
        self.packet_sender.send_piece(packet)?;
        ctx.sent_piece = true;
        Ok(true)
    }

    fn check_and_send_mpk(&self, bh: &BlockHeader) -> Result<bool> {
        let mut guard = self.ctx.lock();
        let Some(ctx) = guard.as_mut() else { return Ok(false) };
        let era = &ctx.era;
        if !era.seed_exists() {
            return Err(ConsensusError::SeedMissing(era.seed_height));
        }
        if !era.mpk_range.contains(bh.height) || !ctx.selected {
            return Ok(false);
        }
        let miner = self.miner_reader.self_miner();
        if !miner.info.can_join_group() {
            return Err(ConsensusError::CannotJoinGroup);
        }
        let seed = era.seed().expect("seed exists");
        if ctx.sent_mpk || self.store.has_sent_mpk(&seed, &miner.id())? {
            return Ok(false);
        }
        if !ctx.sent_piece && !self.store.has_sent_piece(&seed, &miner.id())? {
            return Err(ConsensusError::PhasePrereq(
                "piece packet never sent for this era".to_string(),
            ));
        }

        let packets = self.store.pieces(&seed)?;
        let need = ConsensusParams::pieces_required(ctx.cands.len());
        if packets.len() < need {
            return Err(ConsensusError::PiecesNotEnough { got: packets.len(), need });
        }

        let my_index = ctx
            .my_index(&miner.id())
            .ok_or(ConsensusError::NotGroupMember(seed))?;
        let x = my_index as u64 + 1;

        // Fold every dealer's piece addressed to us into the master share.
        let mut shares = Vec::with_capacity(packets.len());
        for pkt in &packets {
            let Some(cipher) = pkt.pieces.get(my_index) else {
                warn!(sender = %pkt.sender, "piece packet too short, skipped");
                continue;
            };
            let enc_pub = bls::Pubkey::from_bytes(&pkt.enc_pubkey)?;
            let plain = bls::decrypt_share(&miner.seckey, &enc_pub, x, cipher)?;
            shares.push(bls::Seckey::from_bytes(&plain)?);
        }
        if shares.len() < need {
            return Err(ConsensusError::PiecesNotEnough { got: shares.len(), need });
        }
        let msk = bls::Seckey::aggregate(&shares)?;

        self.sk_tx
            .try_send(SkCommand::Store {
                seed,
                record: SkRecord {
                    enc_seckey: None,
                    msk: Some(msk.to_bytes()),
                    expire_height: era.dismiss_height(&self.params),
                },
            })
            .map_err(|e| ConsensusError::Send(e.to_string()))?;

        let packet = MpkPacket {
            seed,
            sender: miner.id(),
            mpk: msk.pubkey().to_vec(),
            sign: msk.sign(&seed).to_vec(),
        };
        self.packet_sender.send_mpk(packet)?;
        ctx.sent_mpk = true;
        Ok(true)
    }

    fn check_and_send_origin(&self, bh: &BlockHeader) -> Result<bool> {
        let mut guard = self.ctx.lock();
        let Some(ctx) = guard.as_mut() else { return Ok(false) };
        let era = &ctx.era;
        if !era.seed_exists() {
            return Err(ConsensusError::SeedMissing(era.seed_height));
        }
        if !era.ori_piece_range.contains(bh.height) || !ctx.selected {
            return Ok(false);
        }
        let miner = self.miner_reader.self_miner();
        if !miner.info.can_join_group() {
            return Err(ConsensusError::CannotJoinGroup);
        }
        let seed = era.seed().expect("seed exists");

        // The reveal runs only when the chain flags a dispute.
        if !self.store.is_origin_required(&seed)? {
            return Ok(false);
        }
        let id = miner.id();
        if !self.store.has_sent_piece(&seed, &id)? {
            return Err(ConsensusError::PhasePrereq(
                "origin reveal without piece".to_string(),
            ));
        }
        if !self.store.has_sent_mpk(&seed, &id)? {
            return Err(ConsensusError::PhasePrereq(
                "origin reveal without mpk".to_string(),
            ));
        }
        if ctx.sent_origin || self.store.has_sent_origin(&seed, &id)? {
            return Ok(false);
        }

        let record = self
            .sk_db
            .get(&seed)?
            .filter(|r| r.enc_seckey.is_some())
            .ok_or(ConsensusError::MissingSecret(seed))?;

        let threshold = ConsensusParams::threshold(ctx.cands.len());
        let poly = self.share_polynomial(&seed, threshold);
        let mut pieces = Vec::with_capacity(ctx.cands.len());
        for j in 0..ctx.cands.len() {
            pieces.push(poly.share_at(j as u64 + 1)?.to_bytes());
        }

        let packet = OriginPiecePacket {
            seed,
            sender: id,
            enc_seckey: record.enc_seckey.expect("filtered above").to_vec(),
            pieces,
        };
        self.packet_sender.send_origin(packet)?;
        ctx.sent_origin = true;
        Ok(true)
    }

    /// Snapshot of the current era state, for observability and tests.
    pub fn current_era(&self) -> Option<Era> {
        self.ctx.lock().as_ref().map(|c| c.era.clone())
    }

    pub fn is_selected(&self) -> bool {
        self.ctx.lock().as_ref().map(|c| c.selected).unwrap_or(false)
    }

    pub fn candidates(&self) -> Vec<MinerInfo> {
        self.ctx
            .lock()
            .as_ref()
            .map(|c| c.cands.clone())
            .unwrap_or_default()
    }
}

impl ChainListener for CreateRoutine {
    fn on_chain_event(&self, event: &ChainEvent) {
        match event {
            ChainEvent::BlockAdded(block) => self.on_new_top(&block.header),
            ChainEvent::TopRollback(header) => self.on_new_top(header),
        }
    }
}
