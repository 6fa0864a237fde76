use quorum_core::{Block, BlockHeader, RewardPayload};
use quorum_core::types::{Address, Hash};
use serde::{Deserialize, Serialize};

/// Proposer → group: a freshly cast block header (the VRF proof travels
/// inside the header).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastVerifyMsg {
    pub header: BlockHeader,
    /// Proposer's signature share is not included; verifiers sign the header
    /// hash themselves after validating eligibility.
    pub prev_random: Hash,
}

/// Verifier → group: one partial BLS signature over the header hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedCastMsg {
    pub block_hash: Hash,
    pub member: Address,
    pub sign: Vec<u8>,
}

/// Proposer → verifiers: a reward-tx skeleton awaiting partial signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastRewardSignReq {
    pub reward: RewardPayload,
}

/// Verifier → proposer: partial signature over the reward payout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CastRewardSignGot {
    pub block_hash: Hash,
    pub member: Address,
    pub sign: Vec<u8>,
}

/// On-demand full-body fetch for a known header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReqProposalBlock {
    pub hash: Hash,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseProposalBlock {
    pub hash: Hash,
    pub block: Option<Block>,
}

/// Fork dialogue step 1: locator hashes walking back from the local top with
/// geometric strides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkFindAncestorReq {
    pub pieces: Vec<Hash>,
    pub top_height: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkFindAncestorResponse {
    /// Highest locator hash the peer also has on its chain.
    pub ancestor: Option<Hash>,
    pub top: BlockHeader,
}

/// Fork dialogue step 2: request the `[begin, end)` block range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkChainSliceReq {
    pub begin: u64,
    pub end: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForkChainSliceResponse {
    pub blocks: Vec<Block>,
}

/// All messages of the consensus wire protocol.
#[derive(Debug, Clone)]
pub enum WireMessage {
    CastVerify(CastVerifyMsg),
    VerifiedCast(VerifiedCastMsg),
    CastRewardSignReq(CastRewardSignReq),
    CastRewardSignGot(CastRewardSignGot),
    ReqProposalBlock(ReqProposalBlock),
    ResponseProposalBlock(ResponseProposalBlock),
    ForkFindAncestorReq(ForkFindAncestorReq),
    ForkFindAncestorResponse(ForkFindAncestorResponse),
    ForkChainSliceReq(ForkChainSliceReq),
    ForkChainSliceResponse(ForkChainSliceResponse),
}

impl WireMessage {
    pub fn code(&self) -> u8 {
        match self {
            Self::CastVerify(_) => 1,
            Self::VerifiedCast(_) => 2,
            Self::CastRewardSignReq(_) => 3,
            Self::CastRewardSignGot(_) => 4,
            Self::ReqProposalBlock(_) => 5,
            Self::ResponseProposalBlock(_) => 6,
            Self::ForkFindAncestorReq(_) => 7,
            Self::ForkFindAncestorResponse(_) => 8,
            Self::ForkChainSliceReq(_) => 9,
            Self::ForkChainSliceResponse(_) => 10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CastVerify(_) => "CastVerify",
            Self::VerifiedCast(_) => "VerifiedCast",
            Self::CastRewardSignReq(_) => "CastRewardSignReq",
            Self::CastRewardSignGot(_) => "CastRewardSignGot",
            Self::ReqProposalBlock(_) => "ReqProposalBlock",
            Self::ResponseProposalBlock(_) => "ResponseProposalBlock",
            Self::ForkFindAncestorReq(_) => "ForkFindAncestorReq",
            Self::ForkFindAncestorResponse(_) => "ForkFindAncestorResponse",
            Self::ForkChainSliceReq(_) => "ForkChainSliceReq",
            Self::ForkChainSliceResponse(_) => "ForkChainSliceResponse",
        }
    }
}
