use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Invalid secret key")]
    InvalidSeckey,

    #[error("Invalid public key bytes")]
    InvalidPubkey,

    #[error("Invalid signature bytes")]
    InvalidSignature,

    #[error("Signature verification failed")]
    VerificationFailed,

    #[error("Not enough shares: got {got}, need {need}")]
    NotEnoughShares { got: usize, need: usize },

    #[error("Duplicate share index {0}")]
    DuplicateShareIndex(u64),

    #[error("VRF proof is invalid")]
    VrfProofInvalid,

    #[error("Ciphertext length mismatch: {0}")]
    CiphertextLength(usize),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
