// Copyright (c) 2025 The Haze Project

//! Error types for the crypto crate.

use displaydoc::Display;
use haze_common::ErrorKind;
use thiserror::Error;

/// Errors that can occur in cryptographic operations.
#[derive(Debug, Display, Error)]
pub enum CryptoError {
    /// Invalid group parameter: {0}
    InvalidGroup(String),
    /// Value is not an element of the group
    NotInGroup,
    /// Element has no modular inverse
    NoInverse,
    /// Payload length {0} does not match the group prime length {1}
    PayloadLength(usize, usize),
    /// Key fingerprint has its reserved top bit set
    FingerprintTopBit,
    /// Authenticated decryption failed
    DecryptionFailed,
    /// MAC verification failed
    BadMac,
    /// Invalid hex encoding: {0}
    InvalidHex(String),
}

impl CryptoError {
    /// Map onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CryptoError::InvalidGroup(_)
            | CryptoError::NotInGroup
            | CryptoError::PayloadLength(_, _)
            | CryptoError::FingerprintTopBit
            | CryptoError::InvalidHex(_) => ErrorKind::Validation,
            CryptoError::NoInverse
            | CryptoError::DecryptionFailed
            | CryptoError::BadMac => ErrorKind::Unrecoverable,
        }
    }
}

/// Result type for crypto operations.
pub type Result<T> = std::result::Result<T, CryptoError>;
