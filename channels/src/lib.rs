// Copyright (c) 2025 The Haze Project

//! Channel action leases.

pub mod error;
pub mod lease;

pub use error::{LeaseError, Result};
pub use lease::{
    lease_fingerprint, ChannelAction, LeaseEvent, LeaseMessage, LeaseScheduler, MESSAGE_LIFE,
};
