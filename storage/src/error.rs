// Copyright (c) 2025 The Haze Project

//! Error types for the storage crate.

use displaydoc::Display;
use haze_common::ErrorKind;
use thiserror::Error;

/// Errors surfaced by the key-value façade.
#[derive(Debug, Display, Error)]
pub enum StorageError {
    /// No record at key "{0}"
    NotFound(String),
    /// Record at "{0}" has version {1}, newer than supported {2}; upgrade required
    UnsupportedVersion(String, u64, u64),
    /// Stored data is corrupted: {0}
    Corrupted(String),
    /// IO failure: {0}
    Io(#[from] std::io::Error),
    /// Decryption of the backing file failed
    BadStorageKey,
}

impl StorageError {
    /// Map onto the shared taxonomy. Only `NotFound` and
    /// `UnsupportedVersion` are recoverable by callers.
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::NotFound(_) => ErrorKind::NotFound,
            StorageError::UnsupportedVersion(_, _, _) => ErrorKind::Validation,
            StorageError::Corrupted(_) | StorageError::Io(_) | StorageError::BadStorageKey => {
                ErrorKind::Storage
            }
        }
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;
