// Copyright (c) 2025 The Haze Project

//! Diffie-Hellman key agreement inside a cyclic group.
//!
//! Used twice: once per mix node during key registration (cMix group) and
//! once per conversation partner for session base keys (E2E group).

use crate::{cypher::SymmetricKey, group::CyclicGroup};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};

/// A private DH exponent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhPrivateKey(pub BigUint);

/// A public DH group element.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct DhPublicKey(pub BigUint);

/// A freshly generated DH key pair.
#[derive(Clone, Debug)]
pub struct DhKeyPair {
    /// The private exponent; never leaves the client.
    pub private: DhPrivateKey,
    /// The public element transmitted to the peer.
    pub public: DhPublicKey,
}

/// Generate a key pair in the given group.
pub fn generate_keypair<R: rand::RngCore>(group: &CyclicGroup, rng: &mut R) -> DhKeyPair {
    let private = group.random_exponent(rng);
    let public = group.public_of(&private);
    DhKeyPair {
        private: DhPrivateKey(private),
        public: DhPublicKey(public),
    }
}

/// Derive the shared symmetric key `H(theirPub ^ myPriv mod p)`.
///
/// This is both the node transmission key (cMix group) and the session
/// base key (E2E group).
pub fn derive_shared_key(
    group: &CyclicGroup,
    my_private: &DhPrivateKey,
    their_public: &DhPublicKey,
) -> SymmetricKey {
    let shared = group.exp(&their_public.0, &my_private.0);
    let digest = Sha256::new()
        .chain_update(b"haze-dh-shared-key")
        .chain_update(group.encode(&shared))
        .finalize();
    SymmetricKey::from_bytes(digest.into())
}
