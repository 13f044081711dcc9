// Copyright (c) 2025 The Haze Project

//! The gateway RPC surface.
//!
//! Mirrors the wire protocol spoken to gateways. Transport is behind
//! [`GatewayConnection`]; tests script it through the mock, production
//! embeds a real transport through a [`ConnectionFactory`].

use crate::error::Result;
use async_trait::async_trait;
use haze_common::{EphemeralId, Id};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc, time::SystemTime};

/// Monotonic round identifier.
#[derive(
    Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct RoundId(pub u64);

impl std::fmt::Display for RoundId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle states of a cMix round.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub enum RoundState {
    /// Declared but not yet scheduled
    Pending,
    /// The team is precomputing
    Precomputing,
    /// Precomputation done, waiting in the queue
    Standby,
    /// Scheduled; slot uploads accepted until realtime begins
    Queued,
    /// The batch is being mixed
    Realtime,
    /// Mixing finished successfully
    Completed,
    /// The round failed
    Failed,
}

impl RoundState {
    /// Whether the round can still accept slot uploads.
    pub fn accepts_uploads(&self) -> bool {
        matches!(
            self,
            RoundState::Pending | RoundState::Precomputing | RoundState::Standby | RoundState::Queued
        )
    }

    /// Whether the round has reached a terminal state.
    pub fn terminal(&self) -> bool {
        matches!(self, RoundState::Completed | RoundState::Failed)
    }
}

/// Everything the client knows about one round.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RoundInfo {
    /// The round id.
    pub id: RoundId,
    /// Current state.
    pub state: RoundState,
    /// Ordered team of mix nodes processing the round.
    pub topology: Vec<Id>,
    /// When each state was entered.
    pub timestamps: BTreeMap<RoundState, SystemTime>,
    /// Number of slots in the batch.
    pub batch_size: u32,
}

impl RoundInfo {
    /// The gateway fronting the first node of the team, which accepts the
    /// round's slot uploads.
    pub fn upload_gateway(&self) -> Option<Id> {
        self.topology
            .first()
            .map(|n| n.with_kind(haze_common::IdKind::Gateway))
    }

    /// The gateway fronting the last node of the team, which serves the
    /// round's delivered slots.
    pub fn pickup_gateway(&self) -> Option<Id> {
        self.topology
            .last()
            .map(|n| n.with_kind(haze_common::IdKind::Gateway))
    }
}

/// One uploaded or delivered cMix slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    /// The recipient's ephemeral id.
    pub ephemeral_id: EphemeralId,
    /// The full fixed-width wire message.
    pub payload: Vec<u8>,
}

/// Batched slot upload for one round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PutManyMessages {
    /// The round the slots belong to.
    pub round_id: RoundId,
    /// The first node of the round's team.
    pub target: Id,
    /// The slots to include in the batch.
    pub slots: Vec<Slot>,
}

/// Node-key registration request, relayed by the gateway to its node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientKeyRequest {
    /// The registering client.
    pub client_id: Id,
    /// The client's DH public element, group-encoded.
    pub client_public: Vec<u8>,
    /// Random salt binding the request.
    pub salt: Vec<u8>,
    /// When the request was made.
    pub timestamp: SystemTime,
    /// Client signature over salt and timestamp.
    pub signature: Vec<u8>,
}

/// The node's signed reply to a key registration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SignedKeyResponse {
    /// The node's DH public element, group-encoded.
    pub node_public: Vec<u8>,
    /// Identifier of the derived key at the node.
    pub key_id: Vec<u8>,
    /// When the key expires.
    pub valid_until: SystemTime,
    /// Node signature over the response fields.
    pub signature: Vec<u8>,
}

/// Mailbox pickup request for one identity and round.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageRequest {
    /// The ephemeral identity being polled.
    pub ephemeral_id: EphemeralId,
    /// The round to fetch slots from.
    pub round_id: RoundId,
}

/// Mailbox pickup response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    /// Whether the gateway had the round's slots at all. False means the
    /// caller should retry later through the unchecked-round path.
    pub has_round: bool,
    /// Slots addressed to the requested identity.
    pub slots: Vec<Slot>,
}

/// The follower's primary cycle request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollRequest {
    /// Newest round the client has seen.
    pub last_known_round: RoundId,
    /// An ephemeral identity the gateway should report activity for.
    pub ephemeral_id: EphemeralId,
}

/// The follower's primary cycle response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PollResponse {
    /// Newest round the gateway knows.
    pub head: RoundId,
    /// Round creations and state updates since `last_known_round`.
    pub rounds: Vec<RoundInfo>,
    /// Gateway-reported clock skew in milliseconds.
    pub skew_ms: i64,
    /// Current address-space size in bits, if changed.
    pub address_space_bits: Option<u8>,
}

/// A gateway as described by the network definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewaySpec {
    /// The gateway's identity.
    pub gateway_id: Id,
    /// The mix node it fronts.
    pub node_id: Id,
    /// host:port.
    pub address: String,
    /// PEM TLS certificate pinned from the NDF.
    pub tls_cert: Vec<u8>,
}

/// One live gateway connection.
#[async_trait]
pub trait GatewayConnection: Send + Sync {
    /// Upload a batch of slots for a round.
    async fn put_many_messages(&self, req: PutManyMessages) -> Result<()>;

    /// Relay a node-key registration to the fronted node.
    async fn request_client_key(&self, req: ClientKeyRequest) -> Result<SignedKeyResponse>;

    /// Fetch slots for an identity from a finished round.
    async fn request_messages(&self, req: MessageRequest) -> Result<MessageResponse>;

    /// Look up rounds that fell out of the live window.
    async fn request_historical_rounds(
        &self,
        rounds: &[RoundId],
    ) -> Result<Vec<Option<RoundInfo>>>;

    /// The follower's primary cycle call.
    async fn poll(&self, req: PollRequest) -> Result<PollResponse>;

    /// Fetch the gateway's TLS certificate for pinning; doubles as the
    /// pool's liveness ping.
    async fn request_tls_certificate(&self) -> Result<Vec<u8>>;
}

/// Builds live connections from NDF gateway entries.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    /// Dial a gateway.
    async fn connect(&self, spec: &GatewaySpec) -> Result<Arc<dyn GatewayConnection>>;
}
