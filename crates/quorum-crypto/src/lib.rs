//! # QuorumChain Cryptography
//!
//! Cryptographic primitives for the group consensus engine:
//! - BLS threshold signatures on BLS12-381 (share dealing, Lagrange recovery,
//!   aggregation)
//! - concat-digest helpers (Keccak256, SHA-256) behind the chain derivations
//! - a deterministic SHA-based RNG seeded from beacon randomness
//! - a VRF for proposer election built on BLS signature uniqueness

pub mod bls;
pub mod error;
pub mod hash;
pub mod rng;
pub mod vrf;

pub use error::{CryptoError, Result};
pub use hash::{keccak256, keccak_concat, sha256, sha_concat, Hash};
pub use rng::SeededRng;
