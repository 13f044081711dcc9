// Copyright (c) 2025 The Haze Project

//! A scriptable in-memory gateway network for tests.
//!
//! All mock gateways share one [`MockNetwork`]: rounds, mailboxes, and
//! uploads live there so a test can play both sides of the protocol.
//! Registration replies are delegated to an installable handler because
//! producing a valid key response requires group math this crate does not
//! depend on.

use crate::{
    error::{ConnectError, Result},
    rpc::{
        ClientKeyRequest, ConnectionFactory, GatewayConnection, GatewaySpec, MessageRequest,
        MessageResponse, PollRequest, PollResponse, PutManyMessages, RoundId, RoundInfo,
        SignedKeyResponse, Slot,
    },
};
use async_trait::async_trait;
use haze_common::{EphemeralId, Id};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

type KeyHandler = dyn Fn(&ClientKeyRequest) -> Result<SignedKeyResponse> + Send + Sync;

/// Shared state of the simulated gateway network.
pub struct MockNetwork {
    rounds: Mutex<BTreeMap<RoundId, RoundInfo>>,
    head: Mutex<RoundId>,
    mailboxes: Mutex<HashMap<(EphemeralId, RoundId), Vec<Slot>>>,
    uploads: Mutex<Vec<PutManyMessages>>,
    /// Rounds whose first pickup reports "slot not available".
    pickup_failures: Mutex<HashMap<RoundId, u32>>,
    /// Gateways with forced transient failures remaining.
    forced_failures: Mutex<HashMap<Id, u32>>,
    key_handler: Mutex<Option<Arc<KeyHandler>>>,
    reject_uploads: AtomicBool,
    skew_ms: AtomicI64,
    latency: Mutex<Duration>,
}

impl MockNetwork {
    /// An empty network.
    pub fn new() -> Arc<Self> {
        Arc::new(MockNetwork {
            rounds: Mutex::new(BTreeMap::new()),
            head: Mutex::new(RoundId(0)),
            mailboxes: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            pickup_failures: Mutex::new(HashMap::new()),
            forced_failures: Mutex::new(HashMap::new()),
            key_handler: Mutex::new(None),
            reject_uploads: AtomicBool::new(false),
            skew_ms: AtomicI64::new(0),
            latency: Mutex::new(Duration::ZERO),
        })
    }

    /// Install or replace a round, advancing the head if needed.
    pub fn put_round(&self, info: RoundInfo) {
        let mut head = self.head.lock().unwrap();
        if info.id > *head {
            *head = info.id;
        }
        self.rounds.lock().unwrap().insert(info.id, info);
    }

    /// The current head round.
    pub fn head(&self) -> RoundId {
        *self.head.lock().unwrap()
    }

    /// A copy of one round, if known.
    pub fn round(&self, id: RoundId) -> Option<RoundInfo> {
        self.rounds.lock().unwrap().get(&id).cloned()
    }

    /// Deposit slots into an identity's mailbox for a round.
    pub fn deposit(&self, ephemeral: EphemeralId, round: RoundId, slots: Vec<Slot>) {
        self.mailboxes
            .lock()
            .unwrap()
            .entry((ephemeral, round))
            .or_default()
            .extend(slots);
    }

    /// All uploads received so far.
    pub fn uploads(&self) -> Vec<PutManyMessages> {
        self.uploads.lock().unwrap().clone()
    }

    /// Make the next `n` pickups of `round` report "slot not available".
    pub fn fail_pickup(&self, round: RoundId, n: u32) {
        self.pickup_failures.lock().unwrap().insert(round, n);
    }

    /// Force the next `n` calls through `gateway` to fail as unreachable.
    pub fn fail_next(&self, gateway: Id, n: u32) {
        self.forced_failures.lock().unwrap().insert(gateway, n);
    }

    /// Reject every upload with an unrecoverable error.
    pub fn reject_all_uploads(&self) {
        self.reject_uploads.store(true, Ordering::Relaxed);
    }

    /// Respond to key registrations with the given handler.
    pub fn set_key_handler(
        &self,
        handler: impl Fn(&ClientKeyRequest) -> Result<SignedKeyResponse> + Send + Sync + 'static,
    ) {
        *self.key_handler.lock().unwrap() = Some(Arc::new(handler));
    }

    /// Report this skew on every poll.
    pub fn set_skew_ms(&self, skew: i64) {
        self.skew_ms.store(skew, Ordering::Relaxed);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    fn check_forced_failure(&self, gateway: &Id) -> Result<()> {
        let mut failures = self.forced_failures.lock().unwrap();
        if let Some(n) = failures.get_mut(gateway) {
            if *n > 0 {
                *n = n.saturating_sub(1);
                return Err(ConnectError::Unreachable("forced failure".into()));
            }
        }
        Ok(())
    }
}

/// One simulated gateway connection.
pub struct MockGateway {
    gateway_id: Id,
    net: Arc<MockNetwork>,
}

impl MockGateway {
    /// A gateway backed by the shared network.
    pub fn new(gateway_id: Id, net: Arc<MockNetwork>) -> Self {
        MockGateway { gateway_id, net }
    }

    async fn simulate(&self) -> Result<()> {
        let latency = *self.net.latency.lock().unwrap();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        self.net.check_forced_failure(&self.gateway_id)
    }
}

#[async_trait]
impl GatewayConnection for MockGateway {
    async fn put_many_messages(&self, req: PutManyMessages) -> Result<()> {
        self.simulate().await?;
        if self.net.reject_uploads.load(Ordering::Relaxed) {
            return Err(ConnectError::Unrecoverable("malformed slot".into()));
        }
        self.net.uploads.lock().unwrap().push(req);
        Ok(())
    }

    async fn request_client_key(&self, req: ClientKeyRequest) -> Result<SignedKeyResponse> {
        self.simulate().await?;
        let handler = self.net.key_handler.lock().unwrap().clone();
        match handler {
            Some(h) => h(&req),
            None => Err(ConnectError::Unrecoverable(
                "no key handler installed".into(),
            )),
        }
    }

    async fn request_messages(&self, req: MessageRequest) -> Result<MessageResponse> {
        self.simulate().await?;
        {
            let mut failures = self.net.pickup_failures.lock().unwrap();
            if let Some(n) = failures.get_mut(&req.round_id) {
                if *n > 0 {
                    *n -= 1;
                    return Ok(MessageResponse {
                        has_round: false,
                        slots: Vec::new(),
                    });
                }
            }
        }
        let slots = self
            .net
            .mailboxes
            .lock()
            .unwrap()
            .get(&(req.ephemeral_id, req.round_id))
            .cloned()
            .unwrap_or_default();
        Ok(MessageResponse {
            has_round: true,
            slots,
        })
    }

    async fn request_historical_rounds(
        &self,
        rounds: &[RoundId],
    ) -> Result<Vec<Option<RoundInfo>>> {
        self.simulate().await?;
        let known = self.net.rounds.lock().unwrap();
        Ok(rounds.iter().map(|id| known.get(id).cloned()).collect())
    }

    async fn poll(&self, req: PollRequest) -> Result<PollResponse> {
        self.simulate().await?;
        // Inclusive of the caller's newest round so late state
        // transitions of an already-seen round still propagate.
        let rounds: Vec<RoundInfo> = {
            let known = self.net.rounds.lock().unwrap();
            known
                .range(req.last_known_round..)
                .map(|(_, info)| info.clone())
                .collect()
        };
        Ok(PollResponse {
            head: self.net.head(),
            rounds,
            skew_ms: self.net.skew_ms.load(Ordering::Relaxed),
            address_space_bits: None,
        })
    }

    async fn request_tls_certificate(&self) -> Result<Vec<u8>> {
        self.simulate().await?;
        Ok(b"-----BEGIN CERTIFICATE-----".to_vec())
    }
}

/// Builds [`MockGateway`] connections over a shared network.
pub struct MockFactory {
    net: Arc<MockNetwork>,
}

impl MockFactory {
    /// A factory over the given network.
    pub fn new(net: Arc<MockNetwork>) -> Self {
        MockFactory { net }
    }
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, spec: &GatewaySpec) -> Result<Arc<dyn GatewayConnection>> {
        Ok(Arc::new(MockGateway::new(spec.gateway_id, Arc::clone(&self.net))))
    }
}
