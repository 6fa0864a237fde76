use quorum_crypto::keccak256;
use serde::{Deserialize, Serialize};

use crate::types::{Address, Hash};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxKind {
    Transfer,
    /// Group reward issuance, carrying a [`RewardPayload`].
    Reward,
    /// DKG round 1: encrypted share piece packet.
    GroupPiece,
    /// DKG round 2: master-public-key packet.
    GroupMpk,
    /// DKG round 3: origin (plaintext) share reveal.
    GroupOrigin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub kind: TxKind,
    pub source: Address,
    pub target: Option<Address>,
    pub value: u64,
    pub nonce: u64,
    pub data: Vec<u8>,
}

impl Transaction {
    pub fn hash(&self) -> Hash {
        let bytes = bincode::serialize(self).expect("tx serialization is infallible");
        keccak256(&bytes)
    }

    pub fn is_group_packet(&self) -> bool {
        matches!(self.kind, TxKind::GroupPiece | TxKind::GroupMpk | TxKind::GroupOrigin)
    }
}

/// Body of a reward transaction: one per finalised block, paying the
/// verifiers that contributed partial signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RewardPayload {
    pub block_hash: Hash,
    pub group_seed: Hash,
    pub target_ids: Vec<Address>,
    pub value: u64,
    /// Threshold signature of the group over the payout.
    pub group_sign: Vec<u8>,
}

impl RewardPayload {
    pub fn signed_data(&self) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&self.block_hash);
        data.extend_from_slice(&self.group_seed);
        for id in &self.target_ids {
            data.extend_from_slice(id.as_ref());
        }
        data.extend_from_slice(&self.value.to_le_bytes());
        data
    }
}
