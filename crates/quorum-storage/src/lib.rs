//! Persistent storage: the chain database (blocks, headers, height index,
//! on-chain group state) and the per-instance DKG secret-key store.

pub mod chain_db;
pub mod error;
pub mod sk_db;

pub use chain_db::ChainDb;
pub use error::{Result, StorageError};
pub use sk_db::{SkDb, SkRecord};
