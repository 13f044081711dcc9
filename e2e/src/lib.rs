// Copyright (c) 2025 The Haze Project

//! End-to-end encryption over the mixnet.
//!
//! Conversations are keyed by a Diffie-Hellman ratchet: each partner
//! relationship holds a chain of sessions, every message consumes a
//! one-shot key addressed by its fingerprint, and sessions renegotiate
//! automatically as their keyspace depletes.

pub mod error;
pub mod partner;
pub mod ratchet;
pub mod rekey;
pub mod session;

pub use error::{E2eError, Result};
pub use ratchet::{Ratchet, ReceivedMessage};
pub use rekey::{run_rekey, E2ePayload, Transport, WireMessage, REKEY_SWEEP_PERIOD};
pub use session::{SessionId, SessionParams, SessionState};
