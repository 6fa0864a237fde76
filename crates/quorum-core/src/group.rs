use serde::{Deserialize, Serialize};

use crate::constants::ConsensusParams;
use crate::types::{Address, Hash};

/// One member of a verify group.
///
/// `share_index` is the Shamir x coordinate assigned during the DKG: the
/// member's position in the era's candidate list plus one. Partial signature
/// recovery interpolates over these indices, so membership can be a strict
/// subset of the candidates without breaking the polynomial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub id: Address,
    /// Master public key share (compressed G2).
    pub pubkey: Vec<u8>,
    pub share_index: u64,
}

/// A formed verify group. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyGroup {
    /// Seed block hash of the era that created the group; unique id.
    pub seed: Hash,
    pub work_height: u64,
    pub dismiss_height: u64,
    /// Position in the group chain (creation order).
    pub group_height: u64,
    pub threshold: u32,
    /// Collective BLS public key (compressed G2).
    pub pubkey: Vec<u8>,
    pub members: Vec<GroupMember>,
    pub pre_seed: Hash,
}

impl VerifyGroup {
    pub fn lived_at(&self, height: u64) -> bool {
        self.dismiss_height > height
    }

    pub fn activated_at(&self, height: u64) -> bool {
        self.work_height <= height && self.lived_at(height)
    }

    pub fn has_member(&self, id: &Address) -> bool {
        self.members.iter().any(|m| m.id == *id)
    }

    pub fn member(&self, id: &Address) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.id == *id)
    }

    pub fn threshold_count(&self) -> usize {
        self.threshold as usize
    }

    pub fn expected_threshold(members: usize) -> u32 {
        ConsensusParams::threshold(members) as u32
    }
}

/// DKG round 1 packet: the dealer's encrypted share pieces, one per
/// candidate, plus its commitment to the group key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPiecePacket {
    pub seed: Hash,
    pub sender: Address,
    /// Commitment to the dealer's zero coefficient, g^{a0}.
    pub pubkey0: Vec<u8>,
    /// Ephemeral encryption public key, g^{encSk}.
    pub enc_pubkey: Vec<u8>,
    /// Encrypted 32-byte share per candidate, in candidate order.
    pub pieces: Vec<[u8; 32]>,
}

/// DKG round 2 packet: the sender's master public key share and a proof of
/// possession (signature over the seed by the master secret share).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpkPacket {
    pub seed: Hash,
    pub sender: Address,
    pub mpk: Vec<u8>,
    pub sign: Vec<u8>,
}

/// DKG round 3 packet: plaintext reveal for dispute adjudication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OriginPiecePacket {
    pub seed: Hash,
    pub sender: Address,
    pub enc_seckey: Vec<u8>,
    pub pieces: Vec<[u8; 32]>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(work: u64, dismiss: u64) -> VerifyGroup {
        VerifyGroup {
            seed: [1u8; 32],
            work_height: work,
            dismiss_height: dismiss,
            group_height: 0,
            threshold: 3,
            pubkey: vec![],
            members: vec![],
            pre_seed: [0u8; 32],
        }
    }

    #[test]
    fn test_activation_window() {
        let g = group(300, 1300);
        assert!(!g.activated_at(299));
        assert!(g.activated_at(300));
        assert!(g.activated_at(1299));
        assert!(!g.activated_at(1300));
        assert!(g.lived_at(299));
    }
}
