// Copyright (c) 2025 The Haze Project

//! The client facade.
//!
//! A [`Client`] owns one identity and every component beneath it: the
//! host pool, the round tracker, the demultiplexer, the ratchet, the
//! lease scheduler, and the critical queue. Starting the network
//! follower spawns the long-running task tree; stopping it tears the
//! tree down through the shared stop group. Everything else is a thin,
//! lockable surface over the components.

use crate::error::{ClientError, Result};
use crate::transport::PipelineTransport;
use ed25519_dalek::SigningKey;
use haze_channels::{ChannelAction, LeaseEvent, LeaseMessage, LeaseScheduler};
use haze_cmix::attempts::AttemptTracker;
use haze_cmix::critical::{run_critical_drain, CriticalQueue};
use haze_cmix::demux::{Demux, MessageProcessor};
use haze_cmix::follow::Follower;
use haze_cmix::health::HealthMonitor;
use haze_cmix::identity::IdentityTracker;
use haze_cmix::ndf::NetworkDefinition;
use haze_cmix::nodes::{NoAuth, NodeRegistrar};
use haze_cmix::pickup::{run_unchecked_checker, PickupPool};
use haze_cmix::rounds::{HistoricalRounds, RoundTracker};
use haze_cmix::unchecked::UncheckedStore;
use haze_cmix::{fixed, CmixParams, FollowParams, OutboundMessage, SendPipeline, SendReport};
use haze_common::{stoppable, Id, IdKind, NetTime, StopGroup, StopToken};
use haze_connection::{ConnectionFactory, HostPool, HostPoolParams, RoundId, RoundState};
use haze_crypto::{generate_keypair, CyclicGroup, DhPublicKey, KeyFingerprint};
use haze_e2e::{
    run_rekey, Ratchet, ReceivedMessage, SessionId, SessionParams, SessionState, Transport,
    REKEY_SWEEP_PERIOD,
};
use haze_storage::{Kv, Record};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::broadcast;
use tracing::{info, warn};

const IDENTITY_KEY: &str = "identity";
const IDENTITY_VERSION: u64 = 1;

/// Everything tunable about one client.
#[derive(Clone, Debug)]
pub struct ClientParams {
    pub cmix: CmixParams,
    pub follow: FollowParams,
    pub send_sessions: SessionParams,
    pub receive_sessions: SessionParams,
    /// Network retention window driving lease replay spread.
    pub message_life: Duration,
    /// How long a stopping task may take before it is declared stuck.
    pub stop_deadline: Duration,
}

impl Default for ClientParams {
    fn default() -> Self {
        ClientParams {
            cmix: CmixParams::default(),
            follow: FollowParams::default(),
            send_sessions: SessionParams::default(),
            receive_sessions: SessionParams::default(),
            message_life: haze_channels::MESSAGE_LIFE,
            stop_deadline: Duration::from_secs(3),
        }
    }
}

/// An internally-fatal event delivered to the embedder.
#[derive(Clone, Debug)]
pub struct ClientFault {
    pub source: String,
    pub message: String,
}

/// Terminal outcome of one round, as seen by `get_round_results`.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoundResult {
    Succeeded,
    Failed,
    TimedOut,
}

/// The aggregated answer of `get_round_results`.
#[derive(Clone, Debug)]
pub struct RoundResults {
    pub all_succeeded: bool,
    pub rounds: HashMap<RoundId, RoundResult>,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    client_id: Id,
    dh_private: Vec<u8>,
    signing: [u8; 32],
}

/// The running task tree and the handles only valid while it lives.
struct Running {
    group: StopGroup,
    pipeline: Arc<SendPipeline>,
    historical: HistoricalRounds,
    send_stop: StopToken,
}

pub struct Client {
    params: ClientParams,
    ndf: NetworkDefinition,
    kv: Kv,
    client_id: Id,
    signing: SigningKey,
    cmix_group: CyclicGroup,
    pool: Arc<HostPool>,
    rounds: Arc<RoundTracker>,
    demux: Arc<Demux>,
    health: Arc<HealthMonitor>,
    nettime: Arc<NetTime>,
    attempts: Arc<AttemptTracker>,
    identities: Arc<IdentityTracker>,
    unchecked: Arc<UncheckedStore>,
    critical: Arc<CriticalQueue>,
    ratchet: Arc<Ratchet>,
    e2e_public: DhPublicKey,
    leases: Arc<LeaseScheduler>,
    lease_events: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<LeaseEvent>>>,
    faults: broadcast::Sender<ClientFault>,
    running: tokio::sync::Mutex<Option<Running>>,
}

impl Client {
    /// Create a fresh client: generate its identity, persist it, and
    /// build the component tree. Fails if the storage already holds an
    /// identity.
    pub async fn new(
        ndf: NetworkDefinition,
        kv: Kv,
        factory: Arc<dyn ConnectionFactory>,
        params: ClientParams,
    ) -> Result<Arc<Self>> {
        let session = kv.prefix("session/");
        if session.exists(IDENTITY_KEY) {
            return Err(ClientError::AlreadyInitialized);
        }
        let e2e_group = ndf.e2e_group.to_group()?;
        let mut rng = rand::thread_rng();
        let identity = StoredIdentity {
            client_id: Id::random(&mut rng, IdKind::User),
            dh_private: generate_keypair(&e2e_group, &mut rng)
                .private
                .0
                .to_bytes_be(),
            signing: SigningKey::generate(&mut rng).to_bytes(),
        };
        let data = bincode::serialize(&identity).expect("identity serializes");
        session.set(IDENTITY_KEY, Record::new(IDENTITY_VERSION, data));
        info!(client = %identity.client_id, "client identity created");
        Self::build(ndf, kv, factory, params, identity).await
    }

    /// Rebuild a client from persisted storage.
    pub async fn load(
        ndf: NetworkDefinition,
        kv: Kv,
        factory: Arc<dyn ConnectionFactory>,
        params: ClientParams,
    ) -> Result<Arc<Self>> {
        let session = kv.prefix("session/");
        let record = session
            .get_versioned(IDENTITY_KEY, IDENTITY_VERSION)
            .map_err(|_| ClientError::MissingIdentity)?;
        let identity: StoredIdentity = bincode::deserialize(&record.data)
            .map_err(|e| ClientError::Malformed(format!("identity: {e}")))?;
        info!(client = %identity.client_id, "client identity loaded");
        Self::build(ndf, kv, factory, params, identity).await
    }

    async fn build(
        ndf: NetworkDefinition,
        kv: Kv,
        factory: Arc<dyn ConnectionFactory>,
        params: ClientParams,
        identity: StoredIdentity,
    ) -> Result<Arc<Self>> {
        let cmix_group = ndf.cmix_group.to_group()?;
        let e2e_group = ndf.e2e_group.to_group()?;
        let pool = Arc::new(
            HostPool::new(ndf.gateway_specs(), factory, HostPoolParams::default()).await?,
        );
        let demux = Arc::new(Demux::new());
        let dh_private =
            haze_crypto::DhPrivateKey(BigUint::from_bytes_be(&identity.dh_private));
        let e2e_public = DhPublicKey(e2e_group.public_of(&dh_private.0));
        let ratchet = Ratchet::load(
            identity.client_id,
            dh_private,
            e2e_group,
            kv.prefix("e2e/"),
            demux.clone(),
        )?;
        let (leases, lease_events) =
            LeaseScheduler::load(kv.prefix("channels/"), params.message_life)?;
        let (faults, _) = broadcast::channel(16);
        let address_space_bits = ndf.address_space_bits;
        Ok(Arc::new(Client {
            ndf,
            client_id: identity.client_id,
            signing: SigningKey::from_bytes(&identity.signing),
            cmix_group,
            pool,
            rounds: Arc::new(RoundTracker::new()),
            demux,
            health: Arc::new(HealthMonitor::new()),
            nettime: Arc::new(NetTime::new(params.follow.clock_skew_clamp)),
            attempts: Arc::new(AttemptTracker::new()),
            identities: Arc::new(IdentityTracker::load(
                kv.prefix("cmix/"),
                address_space_bits,
            )),
            unchecked: Arc::new(UncheckedStore::load(kv.prefix("cmix/"))),
            critical: CriticalQueue::load(kv.prefix("critical/")),
            ratchet,
            e2e_public,
            leases,
            lease_events: Mutex::new(Some(lease_events)),
            faults,
            running: tokio::sync::Mutex::new(None),
            params,
            kv,
        }))
    }

    pub fn client_id(&self) -> Id {
        self.client_id
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy()
    }

    /// Internally-fatal events; subscribe before starting the follower.
    pub fn faults(&self) -> broadcast::Receiver<ClientFault> {
        self.faults.subscribe()
    }

    /// Start the network follower task tree: node registration, the
    /// poll loop, pickup workers, the unchecked checker, the critical
    /// drain, rekey negotiation, and the lease timer. Waits up to
    /// `timeout` for the first healthy poll; the tree keeps running on
    /// timeout so a slow network can still converge.
    pub async fn start_network_follower(&self, timeout: Duration) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ClientError::AlreadyRunning);
        }
        let mut group = StopGroup::new();

        let (stopper, token) = stoppable("registrar");
        group.push(stopper);
        let registrar = NodeRegistrar::spawn(
            self.kv.prefix("cmix/"),
            self.cmix_group.clone(),
            self.pool.clone(),
            Arc::new(NoAuth::new()),
            self.signing.clone(),
            self.client_id,
            &self.params.follow,
            token,
        );
        registrar.ensure_registered(&self.ndf).await?;

        let pipeline = Arc::new(SendPipeline::new(
            self.cmix_group.clone(),
            self.pool.clone(),
            self.rounds.clone(),
            registrar,
            self.health.clone(),
            self.attempts.clone(),
            self.nettime.clone(),
            self.ndf.address_space_bits,
            &self.params.follow,
        ));

        let (stopper, token) = stoppable("historical");
        group.push(stopper);
        let historical = HistoricalRounds::spawn(self.pool.clone(), token);

        let pickup = PickupPool::spawn(
            self.params.follow.pickup_workers,
            self.cmix_group.prime_len(),
            self.pool.clone(),
            self.rounds.clone(),
            historical.clone(),
            self.demux.clone(),
            self.unchecked.clone(),
            self.nettime.clone(),
            &mut group,
        );

        let (stopper, token) = stoppable("unchecked-checker");
        group.push(stopper);
        tokio::spawn(run_unchecked_checker(
            self.unchecked.clone(),
            pickup.clone(),
            self.nettime.clone(),
            self.params.follow.track_period,
            token,
        ));

        let follower = Follower::new(
            self.pool.clone(),
            self.rounds.clone(),
            self.identities.clone(),
            pickup,
            self.health.clone(),
            self.nettime.clone(),
            self.params.follow.track_period,
        );
        let (stopper, token) = stoppable("follower");
        group.push(stopper);
        tokio::spawn(follower.run(token));

        let (stopper, token) = stoppable("critical-drain");
        group.push(stopper);
        tokio::spawn(run_critical_drain(
            self.critical.clone(),
            pipeline.clone(),
            self.health.clone(),
            token,
        ));

        let (stopper, send_stop) = stoppable("sends");
        group.push(stopper);

        let (stopper, token) = stoppable("rekey");
        group.push(stopper);
        let transport: Arc<dyn Transport> = Arc::new(PipelineTransport::new(
            pipeline.clone(),
            self.params.cmix.clone(),
            send_stop.clone(),
        ));
        tokio::spawn(run_rekey(
            self.ratchet.clone(),
            transport,
            REKEY_SWEEP_PERIOD,
            token,
        ));

        let (stopper, token) = stoppable("leases");
        group.push(stopper);
        let leases = self.leases.clone();
        tokio::spawn(async move { leases.run(token).await });

        info!(tasks = group.len(), "network follower started");
        *running = Some(Running {
            group,
            pipeline,
            historical,
            send_stop,
        });
        drop(running);

        if !self.health.wait_healthy(timeout).await {
            warn!("network not healthy before the start timeout");
            return Err(ClientError::StartTimeout);
        }
        Ok(())
    }

    /// Stop the task tree. Stuck tasks are reported on the fault
    /// channel rather than waited for.
    pub async fn stop_network_follower(&self) -> Result<()> {
        let running = self
            .running
            .lock()
            .await
            .take()
            .ok_or(ClientError::NotRunning)?;
        let stuck = running.group.stop_all(self.params.stop_deadline).await;
        for name in stuck {
            warn!(task = %name, "task did not stop in time");
            let _ = self.faults.send(ClientFault {
                source: name,
                message: "task did not acknowledge stop".into(),
            });
        }
        self.health.set_healthy(false);
        info!("network follower stopped");
        Ok(())
    }

    /// Track a reception identity. Re-adding refreshes its expiry.
    pub fn add_identity(&self, id: Id, valid_until: Option<SystemTime>, persistent: bool) {
        self.identities.add(id, valid_until, persistent);
    }

    /// Stop tracking an identity. Removing twice is a no-op.
    pub fn remove_identity(&self, id: &Id) {
        self.identities.remove(id);
    }

    /// Register a one-shot reception fingerprint for an identity.
    pub fn add_fingerprint(
        &self,
        identity: Id,
        fingerprint: KeyFingerprint,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        Ok(self.demux.add_fingerprint(identity, fingerprint, processor)?)
    }

    pub fn delete_fingerprint(&self, fingerprint: &KeyFingerprint) {
        self.demux.delete_fingerprint(fingerprint);
    }

    /// Register a trial-hash service for an identity.
    pub fn add_service(
        &self,
        identity: Id,
        tag: Vec<u8>,
        metadata: Vec<u8>,
        processor: Arc<dyn MessageProcessor>,
    ) {
        self.demux.add_service(identity, tag, metadata, processor);
    }

    pub fn delete_service(&self, identity: &Id, tag: &[u8]) {
        self.demux.delete_service(identity, tag);
    }

    /// Send one pre-keyed message through the mixnet.
    pub async fn send(
        &self,
        message: OutboundMessage,
        params: &CmixParams,
    ) -> Result<SendReport> {
        let (pipeline, stop) = self.pipeline().await?;
        Ok(pipeline.send_cmix(fixed(message), params, &stop).await?)
    }

    /// Send a batch through a single round: all land together or none do.
    pub async fn send_many(
        &self,
        messages: Vec<OutboundMessage>,
        params: &CmixParams,
    ) -> Result<SendReport> {
        let (pipeline, stop) = self.pipeline().await?;
        let assemblers = messages.into_iter().map(fixed).collect();
        Ok(pipeline.send_many_cmix(assemblers, params, &stop).await?)
    }

    /// Queue a message for at-least-once delivery. It is attempted as
    /// soon as the network is healthy and retained across restarts
    /// until a round accepts it.
    pub fn send_critical(&self, message: OutboundMessage, mut params: CmixParams) {
        params.critical = true;
        self.critical.add(message, params);
    }

    /// Establish an end-to-end partner from their public element.
    pub fn add_partner(&self, partner: Id, partner_public: DhPublicKey) -> Result<SessionId> {
        Ok(self.ratchet.add_partner(
            partner,
            partner_public,
            self.params.send_sessions,
            self.params.receive_sessions,
        )?)
    }

    pub fn remove_partner(&self, partner: &Id) {
        self.ratchet.remove_partner(partner);
    }

    /// This client's long-term end-to-end public element, shared with
    /// partners out of band.
    pub fn e2e_public(&self) -> DhPublicKey {
        self.e2e_public.clone()
    }

    /// The session currently used for sends to a partner.
    pub fn current_send(&self, partner: &Id) -> Result<SessionId> {
        Ok(self.ratchet.current_send(partner)?)
    }

    pub fn session_state(&self, partner: &Id, session: &SessionId) -> Option<SessionState> {
        self.ratchet.session_state(partner, session)
    }

    /// Deliver decrypted end-to-end payloads to this listener.
    pub fn on_message(&self, listener: impl Fn(ReceivedMessage) + Send + Sync + 'static) {
        self.ratchet.set_listener(Box::new(listener));
    }

    /// Seal a payload for a partner and send it through the mixnet.
    pub async fn send_e2e(&self, partner: &Id, payload: &[u8]) -> Result<SendReport> {
        let sealed = self.ratchet.seal(partner, payload)?;
        let outbound = OutboundMessage {
            recipient: sealed.recipient,
            fingerprint: sealed.fingerprint,
            service_tag: Vec::new(),
            contents: sealed.contents,
            mac_key: sealed.mac_key,
        };
        self.send(outbound, &self.params.cmix).await
    }

    /// Register a leased channel action.
    pub fn add_lease(
        &self,
        channel: Id,
        action: ChannelAction,
        payload: Vec<u8>,
        original_timestamp: SystemTime,
        lease: Option<Duration>,
    ) {
        self.leases
            .add(channel, action, payload, original_timestamp, lease);
    }

    pub fn remove_lease(&self, channel: &Id, action: &ChannelAction, payload: &[u8]) {
        self.leases.remove(channel, action, payload);
    }

    pub fn pending_lease(
        &self,
        channel: &Id,
        action: &ChannelAction,
        payload: &[u8],
    ) -> Option<LeaseMessage> {
        self.leases.get(channel, action, payload)
    }

    /// The replay/undo event stream. Yields `Some` exactly once.
    pub fn lease_events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<LeaseEvent>> {
        self.lease_events.lock().unwrap().take()
    }

    /// Resolve the terminal outcome of each round, waiting up to
    /// `timeout` for rounds still in flight. Rounds the live tracker
    /// has forgotten are looked up historically.
    pub async fn get_round_results(
        &self,
        timeout: Duration,
        round_ids: Vec<RoundId>,
    ) -> Result<RoundResults> {
        let historical = {
            let running = self.running.lock().await;
            running
                .as_ref()
                .map(|r| r.historical.clone())
                .ok_or(ClientError::NotRunning)?
        };
        let lookups = round_ids.into_iter().map(|id| {
            let historical = historical.clone();
            async move { (id, self.round_result(id, timeout, historical).await) }
        });
        let rounds: HashMap<RoundId, RoundResult> =
            futures::future::join_all(lookups).await.into_iter().collect();
        Ok(RoundResults {
            all_succeeded: rounds.values().all(|r| *r == RoundResult::Succeeded),
            rounds,
        })
    }

    async fn round_result(
        &self,
        id: RoundId,
        timeout: Duration,
        historical: HistoricalRounds,
    ) -> RoundResult {
        match self.rounds.wait_terminal(id, timeout).await {
            Ok(RoundState::Completed) => return RoundResult::Succeeded,
            Ok(_) => return RoundResult::Failed,
            Err(_) => {}
        }
        // Not resolved live; ask the network's history.
        match historical.lookup(id).await {
            Ok(Some(info)) if info.state == RoundState::Completed => RoundResult::Succeeded,
            Ok(Some(_)) => RoundResult::Failed,
            _ => RoundResult::TimedOut,
        }
    }

    async fn pipeline(&self) -> Result<(Arc<SendPipeline>, StopToken)> {
        let running = self.running.lock().await;
        running
            .as_ref()
            .map(|r| (r.pipeline.clone(), r.send_stop.clone()))
            .ok_or(ClientError::NotRunning)
    }
}
