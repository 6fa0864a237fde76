use quorum_core::types::Hash;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("Chain is shutting down")]
    ShuttingDown,

    #[error("Block not found: {}", hex::encode(.0))]
    BlockNotFound(Hash),

    #[error("Duplicate block: {}", hex::encode(.0))]
    DuplicateBlock(Hash),

    #[error("Block parent is not the chain top")]
    NotOnTop,

    #[error("Orphan block: missing parent {}", hex::encode(.0))]
    OrphanBlock(Hash),

    #[error("Invalid block: {0}")]
    InvalidBlock(String),

    #[error("Group verification failed: {0}")]
    GroupVerification(String),

    #[error("Fork rejected: {0}")]
    ForkRejected(String),

    #[error("Fork would rewrite checkpointed history at {0}")]
    CheckpointViolation(u64),

    #[error("Storage error: {0}")]
    Storage(#[from] quorum_storage::StorageError),

    #[error("Core error: {0}")]
    Core(#[from] quorum_core::CoreError),

    #[error("Network error: {0}")]
    Network(#[from] quorum_network::NetworkError),
}

pub type Result<T> = std::result::Result<T, ChainError>;
