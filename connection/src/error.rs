// Copyright (c) 2025 The Haze Project

//! The failure taxonomy returned to callers of the host pool.

use displaydoc::Display;
use haze_common::ErrorKind;
use thiserror::Error;

/// Why a gateway call failed, and what the caller may do about it.
#[derive(Clone, Debug, Display, Error)]
pub enum ConnectError {
    /// Host unreachable: {0}; retry elsewhere
    Unreachable(String),
    /// Unrecoverable gateway response: {0}; stop trying
    Unrecoverable(String),
    /// Stop signal observed
    Cancelled,
    /// Call timed out after {0:?}
    Timeout(std::time::Duration),
    /// No healthy host available in the pool
    PoolExhausted,
}

impl ConnectError {
    /// Map onto the shared taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectError::Unreachable(_)
            | ConnectError::Timeout(_)
            | ConnectError::PoolExhausted => ErrorKind::Transient,
            ConnectError::Unrecoverable(_) => ErrorKind::Unrecoverable,
            ConnectError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether the pool may retry the call on another host.
    pub fn retry_elsewhere(&self) -> bool {
        matches!(
            self,
            ConnectError::Unreachable(_) | ConnectError::Timeout(_)
        )
    }
}

/// Result type for connection operations.
pub type Result<T> = std::result::Result<T, ConnectError>;
