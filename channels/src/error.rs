// Copyright (c) 2025 The Haze Project

use displaydoc::Display;
use haze_common::ErrorKind;
use haze_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the lease scheduler.
#[derive(Debug, Display, Error)]
pub enum LeaseError {
    /// Corrupt lease record: {0}
    Malformed(String),
    /// Storage failure: {0}
    Storage(#[from] StorageError),
}

impl LeaseError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LeaseError::Malformed(_) => ErrorKind::Validation,
            LeaseError::Storage(e) => e.kind(),
        }
    }
}

pub type Result<T> = std::result::Result<T, LeaseError>;
