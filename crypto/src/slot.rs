// Copyright (c) 2025 The Haze Project

//! Per-node onion layers over cMix slot payloads.
//!
//! Each payload half is a group element. For every node in the round's
//! topology the sender multiplies in a payload key derived from that
//! node's transmission key and the round salt; the mix nodes divide their
//! keys back out during the round, so only the fully unwrapped plaintext
//! leaves the last node. Layer order does not matter: the group is
//! commutative.

use crate::{
    cypher::SymmetricKey,
    error::{CryptoError, Result},
    group::CyclicGroup,
};
use num_bigint::BigUint;

/// Derive a node's payload key for one round and payload half.
///
/// `half_tag` distinguishes the A and B payload halves so the two halves
/// never share a key.
pub fn node_payload_key(
    group: &CyclicGroup,
    transmission_key: &SymmetricKey,
    round_salt: &[u8],
    half_tag: &[u8],
) -> BigUint {
    let mut seed = Vec::with_capacity(32 + round_salt.len() + half_tag.len());
    seed.extend_from_slice(transmission_key.as_bytes());
    seed.extend_from_slice(round_salt);
    seed.extend_from_slice(half_tag);
    group.hash_to_element(&seed)
}

/// Multiply every node's payload key into a payload half.
///
/// The payload must already be a valid group element; the wire format
/// guarantees this by keeping the top bit of each half clear.
pub fn onion_encrypt(group: &CyclicGroup, keys: &[BigUint], payload: &[u8]) -> Result<Vec<u8>> {
    let mut el = group.decode(payload)?;
    for key in keys {
        if !group.contains(key) {
            return Err(CryptoError::NotInGroup);
        }
        el = group.mul(&el, key);
    }
    Ok(group.encode(&el))
}

/// Divide every node's payload key back out of a payload half.
///
/// The mix nodes do this server-side during the round; the client-side
/// implementation exists for round-trip testing of the layer law.
pub fn onion_decrypt(group: &CyclicGroup, keys: &[BigUint], payload: &[u8]) -> Result<Vec<u8>> {
    let mut el = group.decode(payload)?;
    for key in keys {
        let inv = group.inverse(key)?;
        el = group.mul(&el, &inv);
    }
    Ok(group.encode(&el))
}
