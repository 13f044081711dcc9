// Copyright (c) 2025 The Haze Project

//! Error types for the ratchet layer.

use displaydoc::Display;
use haze_common::ErrorKind;
use haze_crypto::CryptoError;
use haze_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by sessions and partner managers.
#[derive(Debug, Display, Error)]
pub enum E2eError {
    /// No manager exists for partner {0}
    NoPartner(String),
    /// Partner {0} is already established
    PartnerExists(String),
    /// Session not found
    UnknownSession,
    /// Key index {0} already consumed
    KeyConsumed(u32),
    /// Send session keyspace exhausted
    KeyExhausted,
    /// Message failed authentication or decryption
    Decrypt(#[from] CryptoError),
    /// Malformed end-to-end payload: {0}
    Malformed(String),
    /// Storage failure: {0}
    Storage(#[from] StorageError),
    /// Stop signal observed
    Cancelled,
    /// Delivery failure: {0}
    Send(String),
}

impl E2eError {
    /// Map onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            E2eError::NoPartner(_) | E2eError::UnknownSession => ErrorKind::NotFound,
            E2eError::PartnerExists(_)
            | E2eError::KeyConsumed(_)
            | E2eError::Malformed(_) => ErrorKind::Validation,
            E2eError::KeyExhausted => ErrorKind::Unrecoverable,
            E2eError::Decrypt(e) => e.kind(),
            E2eError::Storage(e) => e.kind(),
            E2eError::Cancelled => ErrorKind::Cancelled,
            E2eError::Send(_) => ErrorKind::Transient,
        }
    }
}

/// Result type for ratchet operations.
pub type Result<T> = std::result::Result<T, E2eError>;
