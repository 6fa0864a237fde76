//! Core types shared across the node: blocks, miners, verify groups,
//! DKG packets, consensus parameters and the chain event bus.

pub mod block;
pub mod constants;
pub mod error;
pub mod events;
pub mod group;
pub mod miner;
pub mod transaction;
pub mod types;

pub use block::{Block, BlockHeader};
pub use error::{CoreError, Result};
pub use events::{ChainEvent, ChainListener, EventBus};
pub use group::{EncryptedPiecePacket, GroupMember, MpkPacket, OriginPiecePacket, VerifyGroup};
pub use miner::{MinerInfo, MinerKind, MinerStatus, SelfMinerInfo};
pub use transaction::{RewardPayload, Transaction, TxKind};
pub use types::{Address, Hash};
