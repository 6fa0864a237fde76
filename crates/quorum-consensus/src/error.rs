use quorum_core::types::Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsensusError {
    #[error("Era seed block does not exist at height {0}")]
    SeedMissing(u64),

    #[error("Not enough candidates: {0}")]
    NotEnoughCandidates(usize),

    #[error("Miner may not join a group")]
    CannotJoinGroup,

    #[error("Received pieces not enough: got {got}, need {need}")]
    PiecesNotEnough { got: usize, need: usize },

    #[error("Missing local secret for seed {}", hex::encode(.0))]
    MissingSecret(Hash),

    #[error("Group not found: {}", hex::encode(.0))]
    GroupNotFound(Hash),

    #[error("Not a member of group {}", hex::encode(.0))]
    NotGroupMember(Hash),

    #[error("Wrong group selected for this height: {0}")]
    WrongGroup(String),

    #[error("No verify context for block {}", hex::encode(.0))]
    NoContext(Hash),

    #[error("Duplicate verify message from member")]
    DuplicateVerifyMsg,

    #[error("Cast slot limit reached")]
    SlotLimit,

    #[error("Proposal invalid: {0}")]
    InvalidProposal(String),

    #[error("Phase prerequisite unmet: {0}")]
    PhasePrereq(String),

    #[error("Context expired")]
    ContextExpired,

    #[error("Crypto error: {0}")]
    Crypto(#[from] quorum_crypto::CryptoError),

    #[error("Chain error: {0}")]
    Chain(#[from] quorum_chain::ChainError),

    #[error("Storage error: {0}")]
    Storage(#[from] quorum_storage::StorageError),

    #[error("Send error: {0}")]
    Send(String),
}

pub type Result<T> = std::result::Result<T, ConsensusError>;
