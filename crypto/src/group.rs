// Copyright (c) 2025 The Haze Project

//! Cyclic group arithmetic modulo a prime.
//!
//! The network definition carries two groups (cMix and E2E) as hex-encoded
//! prime and generator. All slot payloads are elements of the cMix group;
//! its prime length fixes the wire message size.

use crate::error::{CryptoError, Result};
use num_bigint::{BigUint, RandBigInt};
use num_traits::{One, Zero};
use sha2::{Digest, Sha256};

/// A multiplicative group modulo a prime, with a fixed generator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CyclicGroup {
    prime: BigUint,
    generator: BigUint,
    byte_len: usize,
}

impl CyclicGroup {
    /// Build a group from its parameters.
    ///
    /// The prime must be odd and at least 16 bits; the generator must be a
    /// group element greater than one. Primality itself is trusted from
    /// the signed network definition.
    pub fn new(prime: BigUint, generator: BigUint) -> Result<Self> {
        if prime.bits() < 16 {
            return Err(CryptoError::InvalidGroup("prime too small".into()));
        }
        if (&prime % 2u8).is_zero() {
            return Err(CryptoError::InvalidGroup("prime is even".into()));
        }
        if generator <= BigUint::one() || generator >= prime {
            return Err(CryptoError::InvalidGroup("generator out of range".into()));
        }
        let byte_len = ((prime.bits() + 7) / 8) as usize;
        Ok(CyclicGroup {
            prime,
            generator,
            byte_len,
        })
    }

    /// Parse a group from hex-encoded parameters, as found in the NDF.
    pub fn from_hex(prime_hex: &str, generator_hex: &str) -> Result<Self> {
        let prime = parse_hex(prime_hex)?;
        let generator = parse_hex(generator_hex)?;
        CyclicGroup::new(prime, generator)
    }

    /// The group prime.
    pub fn prime(&self) -> &BigUint {
        &self.prime
    }

    /// The group generator.
    pub fn generator(&self) -> &BigUint {
        &self.generator
    }

    /// Byte length of an encoded group element.
    pub fn prime_len(&self) -> usize {
        self.byte_len
    }

    /// Whether `el` is a usable group element (`0 < el < p`).
    pub fn contains(&self, el: &BigUint) -> bool {
        !el.is_zero() && el < &self.prime
    }

    /// Draw a random exponent in `[2, p-1)`.
    pub fn random_exponent<R: rand::RngCore>(&self, rng: &mut R) -> BigUint {
        let low = BigUint::from(2u8);
        let high = &self.prime - BigUint::one();
        rng.gen_biguint_range(&low, &high)
    }

    /// `base ^ exp mod p`.
    pub fn exp(&self, base: &BigUint, exp: &BigUint) -> BigUint {
        base.modpow(exp, &self.prime)
    }

    /// `g ^ exp mod p`; the public element for a private exponent.
    pub fn public_of(&self, exp: &BigUint) -> BigUint {
        self.generator.modpow(exp, &self.prime)
    }

    /// `a * b mod p`.
    pub fn mul(&self, a: &BigUint, b: &BigUint) -> BigUint {
        (a * b) % &self.prime
    }

    /// Modular inverse of `a`, if one exists.
    pub fn inverse(&self, a: &BigUint) -> Result<BigUint> {
        a.modinv(&self.prime).ok_or(CryptoError::NoInverse)
    }

    /// Encode an element as big-endian bytes padded to the prime length.
    pub fn encode(&self, el: &BigUint) -> Vec<u8> {
        let raw = el.to_bytes_be();
        let mut out = vec![0u8; self.byte_len];
        out[self.byte_len - raw.len()..].copy_from_slice(&raw);
        out
    }

    /// Decode big-endian bytes into a group element.
    pub fn decode(&self, bytes: &[u8]) -> Result<BigUint> {
        if bytes.len() != self.byte_len {
            return Err(CryptoError::PayloadLength(bytes.len(), self.byte_len));
        }
        let el = BigUint::from_bytes_be(bytes);
        if el >= self.prime {
            return Err(CryptoError::NotInGroup);
        }
        Ok(el)
    }

    /// Deterministically map a seed onto a nonzero group element.
    ///
    /// Expands the seed with counter-mode SHA-256 to the prime length,
    /// reduces mod p, and bumps zero to one so the result is always
    /// invertible.
    pub fn hash_to_element(&self, seed: &[u8]) -> BigUint {
        let mut expanded = Vec::with_capacity(self.byte_len + 32);
        let mut counter = 0u32;
        while expanded.len() < self.byte_len {
            let block = Sha256::new()
                .chain_update(b"haze-hash-to-element")
                .chain_update(counter.to_le_bytes())
                .chain_update(seed)
                .finalize();
            expanded.extend_from_slice(&block);
            counter += 1;
        }
        expanded.truncate(self.byte_len);
        let el = BigUint::from_bytes_be(&expanded) % &self.prime;
        if el.is_zero() {
            BigUint::one()
        } else {
            el
        }
    }
}

fn parse_hex(s: &str) -> Result<BigUint> {
    let cleaned: String = s.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&cleaned).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    Ok(BigUint::from_bytes_be(&bytes))
}
