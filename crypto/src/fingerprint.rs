// Copyright (c) 2025 The Haze Project

//! Key fingerprints and truncated MACs.
//!
//! A fingerprint is a 255-bit value computable only by the sender and the
//! designated receiver. The top bit of both fingerprints and MACs is
//! reserved for group membership on the wire and MUST be zero in stored
//! and compared values.

use crate::error::{CryptoError, Result};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Length of a key fingerprint in bytes.
pub const FINGERPRINT_LEN: usize = 32;

/// A 255-bit key fingerprint (top bit always zero).
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct KeyFingerprint([u8; FINGERPRINT_LEN]);

impl KeyFingerprint {
    /// Wrap raw bytes, rejecting a set top bit.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Result<Self> {
        if bytes[0] & 0x80 != 0 {
            return Err(CryptoError::FingerprintTopBit);
        }
        Ok(KeyFingerprint(bytes))
    }

    /// Wrap raw wire bytes, clearing the reserved top bit first.
    pub fn from_wire(mut bytes: [u8; FINGERPRINT_LEN]) -> Self {
        bytes[0] &= 0x7f;
        KeyFingerprint(bytes)
    }

    /// The fingerprint bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Fp({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for KeyFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Derive the fingerprint for key `key_num` of a session base key.
pub fn derive_key_fingerprint(base_key: &[u8; 32], key_num: u32) -> KeyFingerprint {
    let mut digest: [u8; 32] = Sha256::new()
        .chain_update(b"haze-key-fingerprint")
        .chain_update(base_key)
        .chain_update(key_num.to_le_bytes())
        .finalize()
        .into();
    digest[0] &= 0x7f;
    KeyFingerprint(digest)
}

/// Compute the 255-bit message MAC over a ciphertext.
pub fn make_mac(key: &[u8; 32], ciphertext: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(ciphertext);
    let mut out: [u8; 32] = mac.finalize().into_bytes().into();
    out[0] &= 0x7f;
    out
}

/// Verify a message MAC (with the wire's reserved bit already cleared).
/// The comparison is constant time; a MAC check must not leak how far
/// it matched.
pub fn verify_mac(key: &[u8; 32], ciphertext: &[u8], expected: &[u8; 32]) -> Result<()> {
    if bool::from(make_mac(key, ciphertext)[..].ct_eq(&expected[..])) {
        Ok(())
    } else {
        Err(CryptoError::BadMac)
    }
}
