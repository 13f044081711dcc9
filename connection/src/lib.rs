// Copyright (c) 2025 The Haze Project

//! Connection support: the gateway RPC surface and the host pool.
//!
//! Gateways are remote peers; their implementation is out of scope. This
//! crate pins down the RPC surface as an async trait and provides the
//! resilient pool used for every outbound call: weighted host selection by
//! recent latency, a proxy-error score that evicts misbehaving hosts, and
//! retry-to-next-host semantics with an explicit failure taxonomy.

mod error;
mod pool;
mod rpc;

#[cfg(any(test, feature = "testing"))]
pub mod mock;

pub use crate::{
    error::{ConnectError, Result},
    pool::{HostPool, HostPoolParams, HostReport},
    rpc::{
        ClientKeyRequest, ConnectionFactory, GatewayConnection, GatewaySpec, MessageRequest,
        MessageResponse, PollRequest, PollResponse, PutManyMessages, RoundId, RoundInfo,
        RoundState, SignedKeyResponse, Slot,
    },
};
