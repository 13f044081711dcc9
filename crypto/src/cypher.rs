// Copyright (c) 2025 The Haze Project

//! One-shot end-to-end message keys.
//!
//! Each session key index yields exactly one symmetric key and one
//! fingerprint. The nonce is bound to the fingerprint, so a key can
//! encrypt or decrypt exactly one message; cypher consumption is enforced
//! by the session layer that owns the key indices.

use crate::{
    error::{CryptoError, Result},
    fingerprint::KeyFingerprint,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of a service identification hash on the wire.
pub const SIH_LEN: usize = 25;

/// A 256-bit symmetric key, zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    /// Wrap raw key bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        SymmetricKey(bytes)
    }

    /// The raw key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "SymmetricKey(..)")
    }
}

/// Derive the message key for `key_num` of a session base key.
pub fn derive_message_key(base_key: &SymmetricKey, key_num: u32) -> SymmetricKey {
    let hk = Hkdf::<Sha256>::new(Some(b"haze-e2e-message-key"), base_key.as_bytes());
    let mut okm = [0u8; 32];
    hk.expand(&key_num.to_le_bytes(), &mut okm)
        .expect("32-byte hkdf output");
    SymmetricKey(okm)
}

fn nonce_for(fingerprint: &KeyFingerprint) -> Nonce {
    *Nonce::from_slice(&fingerprint.as_bytes()[..12])
}

/// Encrypt one message under a one-shot key.
pub fn encrypt(key: &SymmetricKey, fingerprint: &KeyFingerprint, plaintext: &[u8]) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("32-byte key");
    cipher
        .encrypt(&nonce_for(fingerprint), plaintext)
        .expect("chacha20poly1305 encryption is infallible for in-memory buffers")
}

/// Decrypt one message under a one-shot key.
pub fn decrypt(
    key: &SymmetricKey,
    fingerprint: &KeyFingerprint,
    ciphertext: &[u8],
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new_from_slice(key.as_bytes()).expect("32-byte key");
    cipher
        .decrypt(&nonce_for(fingerprint), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)
}

/// The trial-hashable service identification hash for a tagged message.
///
/// Both the sender and any receiver holding the tag can compute it; the
/// demultiplexer trial-hashes received contents against every registered
/// tag.
pub fn service_tag_hash(tag: &[u8], contents: &[u8]) -> [u8; SIH_LEN] {
    let digest = Sha256::new()
        .chain_update(b"haze-service-hash")
        .chain_update((tag.len() as u32).to_le_bytes())
        .chain_update(tag)
        .chain_update(contents)
        .finalize();
    digest[..SIH_LEN].try_into().expect("25 digest bytes")
}
