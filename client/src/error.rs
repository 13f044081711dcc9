// Copyright (c) 2025 The Haze Project

use displaydoc::Display;
use haze_channels::LeaseError;
use haze_cmix::CmixError;
use haze_common::ErrorKind;
use haze_connection::ConnectError;
use haze_e2e::E2eError;
use haze_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by the client facade.
#[derive(Debug, Display, Error)]
pub enum ClientError {
    /// Storage already holds a client identity; load it instead
    AlreadyInitialized,
    /// Storage holds no client identity; create one first
    MissingIdentity,
    /// The network follower is already running
    AlreadyRunning,
    /// The network follower is not running
    NotRunning,
    /// The network did not become healthy within the start timeout
    StartTimeout,
    /// Corrupt client record: {0}
    Malformed(String),
    /// {0}
    Cmix(#[from] CmixError),
    /// {0}
    E2e(#[from] E2eError),
    /// {0}
    Lease(#[from] LeaseError),
    /// {0}
    Connect(#[from] ConnectError),
    /// {0}
    Storage(#[from] StorageError),
}

impl ClientError {
    /// Map onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::AlreadyInitialized
            | ClientError::MissingIdentity
            | ClientError::AlreadyRunning
            | ClientError::NotRunning
            | ClientError::Malformed(_) => ErrorKind::Validation,
            ClientError::StartTimeout => ErrorKind::Transient,
            ClientError::Cmix(e) => e.kind(),
            ClientError::E2e(e) => e.kind(),
            ClientError::Lease(e) => e.kind(),
            ClientError::Connect(e) => e.kind(),
            ClientError::Storage(e) => e.kind(),
        }
    }
}

/// Result type for the client facade.
pub type Result<T> = std::result::Result<T, ClientError>;
