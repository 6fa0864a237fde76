//! The group-creation subsystem: the per-era DKG routine, the group former
//! that assembles a verify group from on-chain packets, and the secret-key
//! store worker.

pub mod former;
pub mod routine;
pub mod sk_store;
