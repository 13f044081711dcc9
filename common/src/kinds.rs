// Copyright (c) 2025 The Haze Project

//! The error-kind taxonomy shared by every crate in the workspace.
//!
//! Each crate keeps its own error enum; `kind()` maps it onto one of these
//! so callers can choose a recovery policy without matching on crate
//! internals.

use displaydoc::Display;
use serde::{Deserialize, Serialize};

/// Coarse classification of a failure, driving the caller's retry policy.
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid argument shape; returned to the caller, never retried
    Validation,
    /// Timeout, unhealthy network, or failed round; retried per policy
    Transient,
    /// Rejected payload or failed verification; surfaced immediately
    Unrecoverable,
    /// Storage corruption or IO failure; fatal to the follower
    Storage,
    /// A stop signal was observed; tasks unwind cleanly
    Cancelled,
    /// Lookup miss the caller is expected to handle
    NotFound,
}

impl ErrorKind {
    /// Whether a failure of this kind may be retried locally.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::Transient)
    }

    /// Whether a failure of this kind must stop the enclosing task.
    pub fn fatal(&self) -> bool {
        matches!(self, ErrorKind::Storage)
    }
}
