use crate::hash::{sha256, sha_concat, Hash};

/// Deterministic RNG seeded from beacon randomness.
///
/// Every draw is a pure function of the seed: `derive(i)` re-keys with the
/// iteration counter, `modulo_u64` maps the state onto a range. Identical
/// seeds produce identical sequences on every node, which is what makes
/// FTS selection and group election reproducible across the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededRng {
    state: Hash,
}

impl SeededRng {
    /// Seed from arbitrary bytes; the state is the SHA-256 of the input.
    pub fn from_bytes(seed: &[u8]) -> Self {
        Self { state: sha256(seed) }
    }

    /// Seed from an existing 32-byte state without re-hashing.
    pub fn from_hash(state: Hash) -> Self {
        Self { state }
    }

    /// Derive a child RNG for iteration `i`.
    pub fn derive(&self, i: u64) -> Self {
        Self { state: sha_concat(&[&self.state, &i.to_be_bytes()]) }
    }

    /// Reduce the state modulo `n`. `n` must be non-zero.
    pub fn modulo_u64(&self, n: u64) -> u64 {
        debug_assert!(n > 0);
        u64::from_be_bytes(self.state[..8].try_into().unwrap()) % n
    }

    pub fn bytes(&self) -> &Hash {
        &self.state
    }
}
