// Copyright (c) 2025 The Haze Project

//! The cMix transmission core and reception follower.
//!
//! Outbound: [`send::SendPipeline`] picks an upcoming round, wraps each
//! message in the round team's onion layers using keys from the
//! [`nodes::NodeRegistrar`], uploads the batch, and awaits the round
//! result. Inbound: [`follow::Follower`] polls gateways for the
//! client's ephemeral identities, [`pickup::PickupPool`] fetches and
//! parses slots, and [`demux::Demux`] routes them to processors.
//! [`critical::CriticalQueue`] gives at-least-once delivery across
//! restarts and health outages.

pub mod attempts;
pub mod critical;
pub mod demux;
mod error;
pub mod follow;
pub mod health;
pub mod identity;
pub mod message;
pub mod ndf;
pub mod nodes;
pub mod params;
pub mod pickup;
pub mod rounds;
pub mod send;
pub mod unchecked;

pub use crate::{
    error::{CmixError, Result},
    message::CmixMessage,
    ndf::NetworkDefinition,
    params::{CmixParams, FollowParams},
    send::{fixed, Assembler, OutboundMessage, SendPipeline, SendReport},
};
