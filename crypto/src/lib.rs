// Copyright (c) 2025 The Haze Project

//! Cryptographic primitives for the haze client.
//!
//! - [`CyclicGroup`]: mod-p arithmetic for the cMix and E2E groups.
//! - [`dh`]: Diffie-Hellman key agreement inside a group.
//! - [`fingerprint`]: 255-bit key fingerprints and truncated MACs.
//! - [`cypher`]: one-shot end-to-end message keys.
//! - [`slot`]: per-node onion layers over cMix slot payloads.

mod cypher;
mod dh;
mod error;
mod fingerprint;
mod group;
mod slot;

pub use crate::{
    cypher::{decrypt, derive_message_key, encrypt, service_tag_hash, SymmetricKey, SIH_LEN},
    dh::{derive_shared_key, generate_keypair, DhKeyPair, DhPrivateKey, DhPublicKey},
    error::{CryptoError, Result},
    fingerprint::{derive_key_fingerprint, make_mac, verify_mac, KeyFingerprint, FINGERPRINT_LEN},
    group::CyclicGroup,
    slot::{node_payload_key, onion_decrypt, onion_encrypt},
};
