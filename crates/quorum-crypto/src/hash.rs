//! Digest helpers shared by the consensus derivations.
//!
//! Almost every hash in the protocol is taken over a concatenation of
//! heterogeneous parts (a beacon plus a height, a seed plus a counter, a
//! header's fields), so the primitives here stream parts into the digest
//! instead of asking callers to assemble intermediate buffers. Keccak256 is
//! the chain digest (block hashes, addresses, beacon mixing); SHA-256 feeds
//! the deterministic RNG and key derivations.

use sha2::Sha256;
use sha3::{Digest, Keccak256};

pub type Hash = [u8; 32];

/// Keccak256 over the concatenation of `parts`.
pub fn keccak_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Keccak256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Keccak256 of a single buffer.
pub fn keccak256(data: &[u8]) -> Hash {
    keccak_concat(&[data])
}

/// SHA-256 over the concatenation of `parts`.
pub fn sha_concat(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// SHA-256 of a single buffer.
pub fn sha256(data: &[u8]) -> Hash {
    sha_concat(&[data])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concat_equals_joined_buffer() {
        let joined = [b"random".as_slice(), b"height".as_slice()].concat();
        assert_eq!(keccak_concat(&[b"random", b"height"]), keccak256(&joined));
        assert_eq!(sha_concat(&[b"random", b"height"]), sha256(&joined));
    }

    #[test]
    fn test_part_boundaries_do_not_matter() {
        assert_eq!(
            sha_concat(&[b"ab", b"cd"]),
            sha_concat(&[b"a", b"bcd"]),
        );
    }

    #[test]
    fn test_digests_disagree() {
        assert_ne!(keccak256(b"seed"), sha256(b"seed"));
        assert_ne!(sha256(b"a"), sha256(b"b"));
    }
}
