//! VRF for proposer election, built from the uniqueness of BLS signatures.
//!
//! BLS signing is deterministic: for a fixed key there is exactly one valid
//! signature per message, so the signature itself is a verifiable random
//! function of the input. The proof is the 48-byte signature over the
//! domain-tagged input, the output its keccak digest. Anyone holding the
//! prover's VRF public key checks the proof with a plain signature
//! verification; nobody can produce a second output for the same input.
//!
//! The VRF key pair is a BLS key pair derived from its own seed, so block
//! signing and proposer election never share key material.

use crate::bls::{Pubkey, Seckey, Signature};
use crate::error::{CryptoError, Result};
use crate::hash::keccak_concat;

/// VRF output hash type (32 bytes)
pub type VrfOutput = [u8; 32];

pub const VRF_PROOF_LENGTH: usize = Signature::LENGTH;

/// Tag mixed into the signed message, separating VRF proofs from every other
/// signature the key scheme produces.
const VRF_INPUT_TAG: &[u8] = b"quorum/vrf/in";
/// Tag applied when hashing the proof down to the output.
const VRF_OUTPUT_TAG: &[u8] = b"quorum/vrf/out";

/// A VRF proof: the unique signature over the tagged input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrfProof(Signature);

impl VrfProof {
    pub fn to_bytes(&self) -> [u8; VRF_PROOF_LENGTH] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Signature::from_bytes(bytes)
            .map(Self)
            .map_err(|_| CryptoError::VrfProofInvalid)
    }
}

fn tagged_input(alpha: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(VRF_INPUT_TAG.len() + alpha.len());
    msg.extend_from_slice(VRF_INPUT_TAG);
    msg.extend_from_slice(alpha);
    msg
}

fn proof_output(proof: &VrfProof) -> VrfOutput {
    keccak_concat(&[VRF_OUTPUT_TAG, &proof.to_bytes()])
}

/// VRF key pair for proving and verification.
pub struct VrfKeypair {
    seckey: Seckey,
    pubkey: Pubkey,
}

impl VrfKeypair {
    /// Deterministic key generation from a 32-byte seed. Callers hand in a
    /// seed derived exclusively for the VRF role.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let seckey = Seckey::from_seed(seed);
        let pubkey = seckey.pubkey();
        Self { seckey, pubkey }
    }

    pub fn public_key(&self) -> &Pubkey {
        &self.pubkey
    }

    pub fn public_key_bytes(&self) -> Vec<u8> {
        self.pubkey.to_vec()
    }

    /// Generate the proof and output for input `alpha`.
    pub fn prove(&self, alpha: &[u8]) -> (VrfOutput, VrfProof) {
        let proof = VrfProof(self.seckey.sign(&tagged_input(alpha)));
        (proof_output(&proof), proof)
    }
}

/// Verify a proof against a public key and input; returns the output on
/// success. A block carrying a proof that fails this check must be rejected.
pub fn vrf_verify(public_key: &[u8], alpha: &[u8], proof: &VrfProof) -> Result<VrfOutput> {
    let pubkey = Pubkey::from_bytes(public_key).map_err(|_| CryptoError::VrfProofInvalid)?;
    if !proof.0.verify(&tagged_input(alpha), &pubkey) {
        return Err(CryptoError::VrfProofInvalid);
    }
    Ok(proof_output(proof))
}

/// Selection threshold scaled so that the win probability approximates
/// `stake / total_stake * difficulty`.
pub fn proposer_threshold(stake: u64, total_stake: u64, difficulty: u64) -> u64 {
    if total_stake == 0 {
        return 0;
    }
    let scaled = (u64::MAX as u128) * (stake as u128) * (difficulty as u128)
        / (total_stake as u128);
    scaled.min(u64::MAX as u128) as u64
}

/// An output wins when it falls under the stake-proportional threshold.
pub fn output_below_threshold(output: &VrfOutput, threshold: u64) -> bool {
    output_value(output) < threshold
}

/// Quality number of a winning output: rarer draws weigh more, so chains
/// built from luckier proofs accumulate a larger total quality number.
pub fn quality_number(output: &VrfOutput) -> u64 {
    output_value(output).leading_zeros() as u64 + 1
}

fn output_value(output: &VrfOutput) -> u64 {
    u64::from_be_bytes(output[..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prove_verify_round_trip() {
        let kp = VrfKeypair::from_seed(&[1u8; 32]);
        let (output, proof) = kp.prove(b"random||height");
        let verified = vrf_verify(&kp.public_key_bytes(), b"random||height", &proof).unwrap();
        assert_eq!(output, verified);
    }

    #[test]
    fn test_proof_is_unique_per_input() {
        let kp = VrfKeypair::from_seed(&[1u8; 32]);
        let (out_a, proof_a) = kp.prove(b"alpha");
        let (out_b, proof_b) = kp.prove(b"alpha");
        assert_eq!(proof_a, proof_b);
        assert_eq!(out_a, out_b);
        let (out_c, _) = kp.prove(b"beta");
        assert_ne!(out_a, out_c);
    }

    #[test]
    fn test_wrong_input_fails() {
        let kp = VrfKeypair::from_seed(&[1u8; 32]);
        let (_, proof) = kp.prove(b"alpha");
        assert!(vrf_verify(&kp.public_key_bytes(), b"beta", &proof).is_err());
    }

    #[test]
    fn test_wrong_key_fails() {
        let kp = VrfKeypair::from_seed(&[1u8; 32]);
        let other = VrfKeypair::from_seed(&[2u8; 32]);
        let (_, proof) = kp.prove(b"alpha");
        assert!(vrf_verify(&other.public_key_bytes(), b"alpha", &proof).is_err());
    }

    #[test]
    fn test_vrf_domain_separated_from_plain_signing() {
        // A signature over the raw bytes must not pass as a VRF proof.
        let kp = VrfKeypair::from_seed(&[3u8; 32]);
        let forged = VrfProof(kp.seckey.sign(b"alpha"));
        assert!(vrf_verify(&kp.public_key_bytes(), b"alpha", &forged).is_err());
    }

    #[test]
    fn test_proof_bytes_round_trip() {
        let kp = VrfKeypair::from_seed(&[9u8; 32]);
        let (_, proof) = kp.prove(b"x");
        let parsed = VrfProof::from_bytes(&proof.to_bytes()).unwrap();
        assert_eq!(proof, parsed);
        assert!(VrfProof::from_bytes(&[0u8; 12]).is_err());
    }

    #[test]
    fn test_threshold_monotone_in_stake() {
        let t1 = proposer_threshold(10, 100, 4);
        let t2 = proposer_threshold(40, 100, 4);
        assert!(t2 > t1);
        assert_eq!(proposer_threshold(10, 0, 4), 0);
    }
}
