//! BLS threshold signatures on BLS12-381.
//!
//! Uses the `min_sig` parameterisation: public keys are 96-byte compressed G2
//! points, signatures 48-byte compressed G1 points. On top of the plain
//! sign/verify pair this module provides the threshold machinery the group
//! protocol needs: secret-share polynomials, Lagrange recovery of signatures
//! and public keys at x = 0, and the DH-derived stream cipher used to
//! encrypt share pieces for individual group members.
//!
//! Share indices are the x coordinates of the underlying Shamir polynomial
//! and must be non-zero; callers use `member_index + 1`.

use blst::min_sig as blst_core;
use blst::{
    blst_bendian_from_scalar, blst_p1, blst_p1_add_or_double, blst_p1_affine, blst_p1_compress,
    blst_p1_from_affine, blst_p1_mult, blst_p1_uncompress, blst_p2, blst_p2_add_or_double,
    blst_p2_affine, blst_p2_compress, blst_p2_from_affine, blst_p2_mult, blst_p2_uncompress,
    blst_scalar, blst_scalar_from_bendian, blst_scalar_from_uint64, blst_sk_add_n_check,
    blst_sk_check, blst_sk_inverse, blst_sk_mul_n_check, blst_sk_sub_n_check, BLST_ERROR,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, Result};
use crate::hash::sha_concat;

const DST_BLS_SIG_IN_G1_WITH_POP: &[u8] = b"BLS_SIG_BLS12381G1_XMD:SHA-256_SSWU_RO_POP_";

/// Number of significant bits in a scalar multiplication.
const SCALAR_BITS: usize = 255;

/// BLS secret key: a non-zero scalar mod r, big-endian encoded.
#[derive(Clone, PartialEq, Eq)]
pub struct Seckey {
    bytes: [u8; Self::LENGTH],
}

impl Drop for Seckey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Seckey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Seckey(..)")
    }
}

impl Seckey {
    pub const LENGTH: usize = 32;

    /// Derive a secret key from 32 bytes of seed material.
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        // key_gen only fails on short ikm; 32 bytes is the documented minimum.
        let sk = blst_core::SecretKey::key_gen(seed, &[]).expect("ikm length is fixed");
        Self { bytes: sk.to_bytes() }
    }

    /// Generate a fresh random secret key.
    pub fn random() -> Self {
        let mut ikm = [0u8; 32];
        rand::rngs::OsRng.fill_bytes(&mut ikm);
        let sk = Self::from_seed(&ikm);
        ikm.zeroize();
        sk
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; Self::LENGTH] =
            bytes.try_into().map_err(|_| CryptoError::InvalidSeckey)?;
        let mut sc = blst_scalar::default();
        unsafe {
            blst_scalar_from_bendian(&mut sc, arr.as_ptr());
            if !blst_sk_check(&sc) {
                return Err(CryptoError::InvalidSeckey);
            }
        }
        Ok(Self { bytes: arr })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.bytes
    }

    pub fn pubkey(&self) -> Pubkey {
        let sk = self.inner();
        Pubkey { bytes: sk.sk_to_pk().to_bytes() }
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        let sig = self.inner().sign(data, DST_BLS_SIG_IN_G1_WITH_POP, &[]);
        Signature { bytes: sig.to_bytes() }
    }

    /// Sum of secret keys mod r. Used to fold decrypted share pieces into
    /// the miner's master secret share.
    pub fn aggregate(keys: &[Seckey]) -> Result<Seckey> {
        let mut iter = keys.iter();
        let first = iter.next().ok_or(CryptoError::NotEnoughShares { got: 0, need: 1 })?;
        let mut acc = first.scalar();
        for k in iter {
            let term = k.scalar();
            let ok = unsafe { blst_sk_add_n_check(&mut acc, &acc, &term) };
            if !ok {
                return Err(CryptoError::InvalidSeckey);
            }
        }
        Seckey::from_scalar(&acc)
    }

    fn inner(&self) -> blst_core::SecretKey {
        // bytes were validated on construction
        blst_core::SecretKey::from_bytes(&self.bytes).expect("seckey bytes validated")
    }

    fn scalar(&self) -> blst_scalar {
        let mut sc = blst_scalar::default();
        unsafe { blst_scalar_from_bendian(&mut sc, self.bytes.as_ptr()) };
        sc
    }

    fn from_scalar(sc: &blst_scalar) -> Result<Seckey> {
        if !unsafe { blst_sk_check(sc) } {
            return Err(CryptoError::InvalidSeckey);
        }
        let mut bytes = [0u8; Self::LENGTH];
        unsafe { blst_bendian_from_scalar(bytes.as_mut_ptr(), sc) };
        Ok(Seckey { bytes })
    }
}

/// BLS public key: compressed G2 point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Pubkey {
    bytes: [u8; Self::LENGTH],
}

impl Pubkey {
    pub const LENGTH: usize = 96;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let pk = blst_core::PublicKey::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidPubkey)?;
        Ok(Self { bytes: pk.to_bytes() })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }
}

impl std::fmt::Debug for Pubkey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pubkey(0x{})", hex::encode(&self.bytes[..8]))
    }
}

/// BLS signature: compressed G1 point.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature {
    bytes: [u8; Self::LENGTH],
}

impl Signature {
    pub const LENGTH: usize = 48;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let sig = blst_core::Signature::from_bytes(bytes)
            .map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { bytes: sig.to_bytes() })
    }

    pub fn to_bytes(&self) -> [u8; Self::LENGTH] {
        self.bytes
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.bytes.to_vec()
    }

    pub fn verify(&self, data: &[u8], pubkey: &Pubkey) -> bool {
        let sig = match blst_core::Signature::from_bytes(&self.bytes) {
            Ok(sig) => sig,
            Err(_) => return false,
        };
        let pk = match blst_core::PublicKey::from_bytes(&pubkey.bytes) {
            Ok(pk) => pk,
            Err(_) => return false,
        };
        sig.verify(true, data, DST_BLS_SIG_IN_G1_WITH_POP, &[], &pk, false)
            == BLST_ERROR::BLST_SUCCESS
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature(0x{})", hex::encode(&self.bytes[..8]))
    }
}

/// Secret-share polynomial of degree `threshold - 1`.
///
/// Each dealer samples one of these per era; `share_at(x)` is the piece dealt
/// to the member with share index `x`, and `commitment0()` is the dealer's
/// contribution to the group public key (g^{a0}).
pub struct SharePolynomial {
    coeffs: Vec<Seckey>,
}

impl SharePolynomial {
    pub fn random(threshold: usize) -> Self {
        let coeffs = (0..threshold).map(|_| Seckey::random()).collect();
        Self { coeffs }
    }

    /// Deterministic polynomial: coefficient `i` is derived from the seed
    /// and its position.
    pub fn from_seed(seed: &[u8; 32], threshold: usize) -> Self {
        let coeffs = (0..threshold as u64)
            .map(|i| Seckey::from_seed(&sha_concat(&[seed, &i.to_be_bytes()])))
            .collect();
        Self { coeffs }
    }

    pub fn threshold(&self) -> usize {
        self.coeffs.len()
    }

    /// Evaluate at a non-zero x coordinate (Horner form, all mod r).
    pub fn share_at(&self, x: u64) -> Result<Seckey> {
        debug_assert!(x > 0, "share index must be non-zero");
        let xs = scalar_from_u64(x);
        let mut acc = self.coeffs[self.coeffs.len() - 1].scalar();
        for c in self.coeffs.iter().rev().skip(1) {
            let ok = unsafe {
                blst_sk_mul_n_check(&mut acc, &acc, &xs)
                    && blst_sk_add_n_check(&mut acc, &acc, &c.scalar())
            };
            if !ok {
                return Err(CryptoError::InvalidSeckey);
            }
        }
        Seckey::from_scalar(&acc)
    }

    pub fn commitment0(&self) -> Pubkey {
        self.coeffs[0].pubkey()
    }
}

/// Recover the group signature from at least `threshold` partial signatures
/// by Lagrange interpolation at x = 0.
///
/// `parts` pairs each compressed partial signature with its share index.
/// Indices must be unique and non-zero.
pub fn recover_signature(parts: &[(u64, Signature)], threshold: usize) -> Result<Signature> {
    if parts.len() < threshold {
        return Err(CryptoError::NotEnoughShares { got: parts.len(), need: threshold });
    }
    let xs: Vec<u64> = parts.iter().map(|(x, _)| *x).collect();
    let lambdas = lagrange_coeffs_at_zero(&xs)?;

    let mut acc = blst_p1::default();
    for (k, (_, sig)) in parts.iter().enumerate() {
        let mut aff = blst_p1_affine::default();
        let err = unsafe { blst_p1_uncompress(&mut aff, sig.bytes.as_ptr()) };
        if err != BLST_ERROR::BLST_SUCCESS {
            return Err(CryptoError::InvalidSignature);
        }
        let mut point = blst_p1::default();
        let mut term = blst_p1::default();
        unsafe {
            blst_p1_from_affine(&mut point, &aff);
            blst_p1_mult(&mut term, &point, lambdas[k].b.as_ptr(), SCALAR_BITS);
            if k == 0 {
                acc = term;
            } else {
                blst_p1_add_or_double(&mut acc, &acc, &term);
            }
        }
    }
    let mut out = [0u8; Signature::LENGTH];
    unsafe { blst_p1_compress(out.as_mut_ptr(), &acc) };
    Signature::from_bytes(&out)
}

/// Recover the group public key from the members' master-public-key
/// contributions by Lagrange interpolation at x = 0.
pub fn recover_pubkey(parts: &[(u64, Pubkey)], threshold: usize) -> Result<Pubkey> {
    if parts.len() < threshold {
        return Err(CryptoError::NotEnoughShares { got: parts.len(), need: threshold });
    }
    let xs: Vec<u64> = parts.iter().map(|(x, _)| *x).collect();
    let lambdas = lagrange_coeffs_at_zero(&xs)?;

    let mut acc = blst_p2::default();
    for (k, (_, pk)) in parts.iter().enumerate() {
        let mut aff = blst_p2_affine::default();
        let err = unsafe { blst_p2_uncompress(&mut aff, pk.bytes.as_ptr()) };
        if err != BLST_ERROR::BLST_SUCCESS {
            return Err(CryptoError::InvalidPubkey);
        }
        let mut point = blst_p2::default();
        let mut term = blst_p2::default();
        unsafe {
            blst_p2_from_affine(&mut point, &aff);
            blst_p2_mult(&mut term, &point, lambdas[k].b.as_ptr(), SCALAR_BITS);
            if k == 0 {
                acc = term;
            } else {
                blst_p2_add_or_double(&mut acc, &acc, &term);
            }
        }
    }
    let mut out = [0u8; Pubkey::LENGTH];
    unsafe { blst_p2_compress(out.as_mut_ptr(), &acc) };
    Pubkey::from_bytes(&out)
}

/// Encrypt one 32-byte share piece for a single recipient.
///
/// The stream key is derived from the DH secret between the dealer's
/// ephemeral encryption key and the recipient's BLS public key, so the
/// recipient recovers it from `(own seckey, dealer's enc pubkey)`:
/// `encSk · PK_i  ==  sk_i · EncPk  ==  g^(encSk · sk_i)`.
pub fn encrypt_share(
    sk: &Seckey,
    peer_pk: &Pubkey,
    index: u64,
    share: &[u8; 32],
) -> Result<[u8; 32]> {
    let key = share_stream_key(sk, peer_pk, index)?;
    let mut out = [0u8; 32];
    for (i, b) in out.iter_mut().enumerate() {
        *b = share[i] ^ key[i];
    }
    Ok(out)
}

/// Decryption is the same XOR stream keyed from the mirrored DH pair.
pub fn decrypt_share(
    sk: &Seckey,
    peer_pk: &Pubkey,
    index: u64,
    cipher: &[u8; 32],
) -> Result<[u8; 32]> {
    encrypt_share(sk, peer_pk, index, cipher)
}

fn share_stream_key(sk: &Seckey, pk: &Pubkey, index: u64) -> Result<[u8; 32]> {
    let mut aff = blst_p2_affine::default();
    let err = unsafe { blst_p2_uncompress(&mut aff, pk.bytes.as_ptr()) };
    if err != BLST_ERROR::BLST_SUCCESS {
        return Err(CryptoError::InvalidPubkey);
    }
    let sc = sk.scalar();
    let mut point = blst_p2::default();
    let mut shared = blst_p2::default();
    let mut compressed = [0u8; 96];
    unsafe {
        blst_p2_from_affine(&mut point, &aff);
        blst_p2_mult(&mut shared, &point, sc.b.as_ptr(), SCALAR_BITS);
        blst_p2_compress(compressed.as_mut_ptr(), &shared);
    }
    Ok(sha_concat(&[&compressed, &index.to_be_bytes()]))
}

fn scalar_from_u64(x: u64) -> blst_scalar {
    let limbs = [x, 0, 0, 0];
    let mut sc = blst_scalar::default();
    unsafe { blst_scalar_from_uint64(&mut sc, limbs.as_ptr()) };
    sc
}

fn lagrange_coeffs_at_zero(xs: &[u64]) -> Result<Vec<blst_scalar>> {
    for (i, x) in xs.iter().enumerate() {
        if *x == 0 {
            return Err(CryptoError::DuplicateShareIndex(0));
        }
        if xs[..i].contains(x) {
            return Err(CryptoError::DuplicateShareIndex(*x));
        }
    }
    let scalars: Vec<blst_scalar> = xs.iter().map(|x| scalar_from_u64(*x)).collect();
    let mut out = Vec::with_capacity(xs.len());
    for i in 0..xs.len() {
        let mut num = scalar_from_u64(1);
        let mut den = scalar_from_u64(1);
        for j in 0..xs.len() {
            if i == j {
                continue;
            }
            let mut diff = blst_scalar::default();
            let ok = unsafe {
                blst_sk_mul_n_check(&mut num, &num, &scalars[j])
                    && blst_sk_sub_n_check(&mut diff, &scalars[j], &scalars[i])
                    && blst_sk_mul_n_check(&mut den, &den, &diff)
            };
            if !ok {
                return Err(CryptoError::InvalidSeckey);
            }
        }
        let mut lambda = blst_scalar::default();
        let ok = unsafe {
            blst_sk_inverse(&mut den, &den);
            blst_sk_mul_n_check(&mut lambda, &num, &den)
        };
        if !ok {
            return Err(CryptoError::InvalidSeckey);
        }
        out.push(lambda);
    }
    Ok(out)
}
