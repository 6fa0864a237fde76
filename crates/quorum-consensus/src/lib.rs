//! The group consensus engine.
//!
//! Two subsystems cooperate here. The group-creation routine drives one
//! threshold-BLS DKG per era, producing verify groups with a collective
//! public key. The cast/verify machinery elects proposers by VRF, collects
//! partial signatures per proposed block and finalises a block once the
//! group threshold is reached.

pub mod era;
pub mod error;
pub mod fts;
pub mod group;
pub mod processor;
pub mod proposer;
pub mod reward;
pub mod selector;
pub mod traits;
pub mod verify_context;

pub use era::Era;
pub use error::{ConsensusError, Result};
pub use fts::CandidateSelector;
pub use group::routine::CreateRoutine;
pub use group::former::GroupFormer;
pub use group::sk_store::{spawn_sk_worker, SkCommand};
pub use processor::ConsensusProcessor;
pub use proposer::Proposer;
pub use selector::GroupSelector;
pub use traits::{GroupPacketSender, JoinedGroupFilter, MinerReader};
pub use verify_context::{CastContexts, SlotStatus, VerifyContext};
