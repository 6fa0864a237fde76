//! The block chain and its satellites: single-writer commit pipeline with an
//! event bus, the on-chain DKG packet store, the checkpoint checker, the fork
//! processor and the transaction/reward pools.

pub mod chain;
pub mod checkpoint;
pub mod error;
pub mod fork;
pub mod group_store;
pub mod reward_pool;
pub mod tx_pool;

pub use chain::{BlockChain, BlockVerifier, GroupCreateChecker};
pub use checkpoint::CpChecker;
pub use error::{ChainError, Result};
pub use fork::ForkProcessor;
pub use group_store::GroupStore;
pub use reward_pool::RewardPool;
pub use tx_pool::TxPool;
