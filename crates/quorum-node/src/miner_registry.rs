use std::sync::Arc;

use quorum_consensus::{GroupPacketSender, MinerReader};
use quorum_core::types::Address;
use quorum_core::{
    EncryptedPiecePacket, MinerInfo, MinerStatus, MpkPacket, OriginPiecePacket, SelfMinerInfo,
    Transaction, TxKind,
};
use quorum_chain::TxPool;
use quorum_crypto::keccak256;

use crate::config::PeerMiner;

/// Miner registry assembled from configuration: the local identity plus the
/// peers named in the config file.
pub struct MinerRegistry {
    self_miner: Arc<SelfMinerInfo>,
    peers: Vec<MinerInfo>,
}

impl MinerRegistry {
    pub fn from_config(
        self_miner: Arc<SelfMinerInfo>,
        peers: &[PeerMiner],
    ) -> anyhow::Result<Self> {
        let mut out = Vec::with_capacity(peers.len());
        for peer in peers {
            let pubkey = hex::decode(&peer.pubkey)
                .map_err(|e| anyhow::anyhow!("peer pubkey not hex: {e}"))?;
            let vrf_pubkey = hex::decode(&peer.vrf_pubkey)
                .map_err(|e| anyhow::anyhow!("peer vrf pubkey not hex: {e}"))?;
            let id = Address::from_hash(&keccak256(&pubkey));
            out.push(MinerInfo {
                id,
                pubkey,
                vrf_pubkey,
                stake: peer.stake,
                kind: peer.kind,
                status: MinerStatus::Active,
                apply_height: 0,
            });
        }
        Ok(Self { self_miner, peers: out })
    }

    fn all(&self) -> impl Iterator<Item = &MinerInfo> {
        std::iter::once(&self.self_miner.info).chain(self.peers.iter())
    }
}

impl MinerReader for MinerRegistry {
    fn self_miner(&self) -> Arc<SelfMinerInfo> {
        self.self_miner.clone()
    }

    fn miner_by_id(&self, id: &Address) -> Option<MinerInfo> {
        self.all().find(|m| m.id == *id).cloned()
    }

    fn verifiers_at(&self, _height: u64) -> Vec<MinerInfo> {
        self.all().filter(|m| m.can_join_group()).cloned().collect()
    }

    fn proposers_at(&self, _height: u64) -> Vec<MinerInfo> {
        self.all().filter(|m| m.can_propose()).cloned().collect()
    }
}

/// DKG packets ride the chain as transactions; sending one means admitting
/// it to the pool for the next proposed block to pick up.
pub struct TxPacketSender {
    tx_pool: Arc<TxPool>,
}

impl TxPacketSender {
    pub fn new(tx_pool: Arc<TxPool>) -> Self {
        Self { tx_pool }
    }

    fn admit(&self, kind: TxKind, source: Address, data: Vec<u8>) {
        self.tx_pool.add(Transaction {
            kind,
            source,
            target: None,
            value: 0,
            nonce: 0,
            data,
        });
    }
}

impl GroupPacketSender for TxPacketSender {
    fn send_piece(&self, packet: EncryptedPiecePacket) -> quorum_consensus::Result<()> {
        let data = rmp_serde::to_vec(&packet)
            .map_err(|e| quorum_consensus::ConsensusError::Send(e.to_string()))?;
        self.admit(TxKind::GroupPiece, packet.sender, data);
        Ok(())
    }

    fn send_mpk(&self, packet: MpkPacket) -> quorum_consensus::Result<()> {
        let data = rmp_serde::to_vec(&packet)
            .map_err(|e| quorum_consensus::ConsensusError::Send(e.to_string()))?;
        self.admit(TxKind::GroupMpk, packet.sender, data);
        Ok(())
    }

    fn send_origin(&self, packet: OriginPiecePacket) -> quorum_consensus::Result<()> {
        let data = rmp_serde::to_vec(&packet)
            .map_err(|e| quorum_consensus::ConsensusError::Send(e.to_string()))?;
        self.admit(TxKind::GroupOrigin, packet.sender, data);
        Ok(())
    }
}
