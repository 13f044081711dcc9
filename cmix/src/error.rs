// Copyright (c) 2025 The Haze Project

//! Error types for the cMix core.

use displaydoc::Display;
use haze_common::ErrorKind;
use haze_connection::ConnectError;
use haze_crypto::CryptoError;
use haze_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the transmission core and follower.
#[derive(Debug, Display, Error)]
pub enum CmixError {
    /// Network is unhealthy; send rejected
    NetworkUnhealthy,
    /// No suitable round found within {0} attempts
    NoRoundAvailable(u32),
    /// Round {0} contains blacklisted node
    BlacklistedTopology(u64),
    /// Missing node keys for round {0}
    MissingNodeKeys(u64),
    /// Round {0} failed
    RoundFailed(u64),
    /// Timed out waiting for round {0} results
    RoundResultTimeout(u64),
    /// Wire message malformed: {0}
    MalformedMessage(String),
    /// Fingerprint already registered
    AlreadyExists,
    /// Network definition invalid: {0}
    BadNdf(String),
    /// Network definition signature verification failed
    BadNdfSignature,
    /// Node key response rejected: {0}
    BadKeyResponse(String),
    /// Identity is not tracked
    UnknownIdentity,
    /// Stop signal observed
    Cancelled,
    /// Connection failure: {0}
    Connect(#[from] ConnectError),
    /// Crypto failure: {0}
    Crypto(#[from] CryptoError),
    /// Storage failure: {0}
    Storage(#[from] StorageError),
    /// Persistence codec failure: {0}
    Codec(String),
}

impl CmixError {
    /// Map onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CmixError::NetworkUnhealthy
            | CmixError::NoRoundAvailable(_)
            | CmixError::RoundFailed(_)
            | CmixError::RoundResultTimeout(_)
            | CmixError::MissingNodeKeys(_) => ErrorKind::Transient,
            CmixError::BlacklistedTopology(_)
            | CmixError::MalformedMessage(_)
            | CmixError::BadNdf(_) => ErrorKind::Validation,
            CmixError::AlreadyExists => ErrorKind::Validation,
            CmixError::UnknownIdentity => ErrorKind::NotFound,
            CmixError::BadNdfSignature | CmixError::BadKeyResponse(_) => ErrorKind::Unrecoverable,
            CmixError::Cancelled => ErrorKind::Cancelled,
            CmixError::Connect(e) => e.kind(),
            CmixError::Crypto(e) => e.kind(),
            CmixError::Storage(e) => e.kind(),
            CmixError::Codec(_) => ErrorKind::Storage,
        }
    }
}

/// Result type for cMix operations.
pub type Result<T> = std::result::Result<T, CmixError>;
