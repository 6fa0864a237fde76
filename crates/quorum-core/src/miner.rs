use quorum_crypto::bls::Seckey;
use quorum_crypto::vrf::VrfKeypair;
use quorum_crypto::{keccak256, sha256, sha_concat};
use serde::{Deserialize, Serialize};

use crate::types::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinerKind {
    Proposer,
    Verifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MinerStatus {
    Active,
    Frozen,
    Aborted,
}

/// The important infos for one miner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerInfo {
    pub id: Address,
    /// BLS public key (compressed G2).
    pub pubkey: Vec<u8>,
    /// VRF public key (compressed G2 of the election key).
    pub vrf_pubkey: Vec<u8>,
    pub stake: u64,
    pub kind: MinerKind,
    pub status: MinerStatus,
    pub apply_height: u64,
}

impl MinerInfo {
    pub fn is_active(&self) -> bool {
        self.status == MinerStatus::Active
    }

    /// Whether this miner may cast blocks.
    pub fn can_propose(&self) -> bool {
        self.kind == MinerKind::Proposer && self.is_active()
    }

    /// Whether this miner may join verify groups.
    pub fn can_join_group(&self) -> bool {
        self.kind == MinerKind::Verifier && self.is_active()
    }
}

/// `MinerInfo` plus the local secret material. Built once from the keystore
/// at boot and never mutated.
pub struct SelfMinerInfo {
    pub info: MinerInfo,
    pub seckey: Seckey,
    pub vrf: VrfKeypair,
    /// Private random seed used to derive per-era secrets.
    pub secret_seed: [u8; 32],
}

impl SelfMinerInfo {
    /// Derive the full identity from raw keystore bytes. The VRF key pair
    /// gets its own seed so election and block signing never share keys.
    pub fn from_raw_key(raw: &[u8; 32], kind: MinerKind, stake: u64) -> Self {
        let secret_seed = sha256(raw);
        let seckey = Seckey::from_seed(&secret_seed);
        let pubkey = seckey.pubkey();
        let id = Address::from_hash(&keccak256(&pubkey.to_bytes()));
        let vrf = VrfKeypair::from_seed(&sha_concat(&[&secret_seed, b"vrf"]));
        let info = MinerInfo {
            id,
            pubkey: pubkey.to_vec(),
            vrf_pubkey: vrf.public_key_bytes(),
            stake,
            kind,
            status: MinerStatus::Active,
            apply_height: 0,
        };
        Self { info, seckey, vrf, secret_seed }
    }

    pub fn id(&self) -> Address {
        self.info.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_is_deterministic() {
        let a = SelfMinerInfo::from_raw_key(&[7u8; 32], MinerKind::Verifier, 10);
        let b = SelfMinerInfo::from_raw_key(&[7u8; 32], MinerKind::Verifier, 10);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.info.pubkey, b.info.pubkey);
        assert_eq!(a.info.vrf_pubkey, b.info.vrf_pubkey);
    }

    #[test]
    fn test_predicates() {
        let mut m = SelfMinerInfo::from_raw_key(&[1u8; 32], MinerKind::Verifier, 10).info;
        assert!(m.can_join_group());
        assert!(!m.can_propose());
        m.status = MinerStatus::Frozen;
        assert!(!m.can_join_group());
    }
}
