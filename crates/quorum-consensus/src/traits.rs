//! The capabilities the consensus engine requires from its host. Each is a
//! small explicit trait; the node wires concrete implementations at boot.

use std::sync::Arc;

use quorum_core::types::Address;
use quorum_core::{EncryptedPiecePacket, MinerInfo, MpkPacket, OriginPiecePacket, SelfMinerInfo};

use crate::error::Result;

/// Read access to the miner registry at a given chain state.
pub trait MinerReader: Send + Sync {
    fn self_miner(&self) -> Arc<SelfMinerInfo>;
    /// Latest record of a verifier miner.
    fn miner_by_id(&self, id: &Address) -> Option<MinerInfo>;
    /// Miners allowed to join a group at `height` (active verifiers).
    fn verifiers_at(&self, height: u64) -> Vec<MinerInfo>;
    /// Miners allowed to propose at `height` (active proposers).
    fn proposers_at(&self, height: u64) -> Vec<MinerInfo>;
}

/// Outbound path for DKG packets. Packets travel as group transactions and
/// surface in the on-chain packet store once a block carries them.
pub trait GroupPacketSender: Send + Sync {
    fn send_piece(&self, packet: EncryptedPiecePacket) -> Result<()>;
    fn send_mpk(&self, packet: MpkPacket) -> Result<()>;
    fn send_origin(&self, packet: OriginPiecePacket) -> Result<()>;
}

/// Membership pressure limit: how many lived groups a miner already sits in.
pub trait JoinedGroupFilter: Send + Sync {
    fn joined_lived_groups(&self, id: &Address, height: u64) -> usize;
}
