// Copyright (c) 2025 The Haze Project

//! The client facade over the mixnet stack.
//!
//! A [`Client`] ties together the transmission pipeline, the reception
//! follower, the end-to-end ratchet, and the channel lease scheduler
//! behind one handle. Create or load one, start the network follower,
//! and everything underneath runs until stopped.

pub mod client;
mod error;
mod transport;

pub use client::{Client, ClientFault, ClientParams, RoundResult, RoundResults};
pub use error::{ClientError, Result};
