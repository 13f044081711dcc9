// Copyright (c) 2025 The Haze Project

//! The outbound send pipeline.
//!
//! A send picks an upcoming round, assembles one slot per recipient,
//! wraps each slot in the round team's onion layers, uploads the batch
//! to the round's first gateway, and waits for the round to complete.
//! Failed rounds are marked attempted and the pipeline moves to the
//! next candidate until the attempt budget or the time budget runs out.

use crate::attempts::AttemptTracker;
use crate::error::{CmixError, Result};
use crate::health::HealthMonitor;
use crate::message::CmixMessage;
use crate::nodes::NodeRegistrar;
use crate::params::{CmixParams, FollowParams};
use crate::rounds::RoundTracker;
use haze_common::{window_at, EphemeralId, ErrorKind, Id, NetTime, StopToken};
use haze_connection::{HostPool, PutManyMessages, RoundId, RoundInfo, RoundState, Slot};
use haze_crypto::{
    make_mac, node_payload_key, onion_encrypt, service_tag_hash, CyclicGroup, KeyFingerprint,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{debug, info, warn};

/// A fully specified outbound message, before onion wrapping.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub recipient: Id,
    pub fingerprint: KeyFingerprint,
    /// Trial-hash tag; empty for fingerprint-only messages.
    pub service_tag: Vec<u8>,
    pub contents: Vec<u8>,
    /// Key for the integrity MAC over the contents.
    pub mac_key: [u8; 32],
}

/// Builds the message for a chosen round. Single-use send tokens and
/// file chunks tailor their contents to the round id.
pub type Assembler = Box<dyn Fn(RoundId) -> Result<OutboundMessage> + Send + Sync>;

/// Wrap a fixed message as an assembler.
pub fn fixed(message: OutboundMessage) -> Assembler {
    Box::new(move |_| Ok(message.clone()))
}

/// The result of a successful send.
#[derive(Clone, Debug)]
pub struct SendReport {
    pub round_id: RoundId,
    pub ephemeral_ids: Vec<EphemeralId>,
    /// The round's COMPLETED timestamp, when the network reported one.
    pub completed_at: Option<SystemTime>,
}

/// Everything a send needs, shared by the client handle and the
/// critical-message drain.
pub struct SendPipeline {
    group: CyclicGroup,
    pool: Arc<HostPool>,
    rounds: Arc<RoundTracker>,
    registrar: Arc<NodeRegistrar>,
    health: Arc<HealthMonitor>,
    attempts: Arc<AttemptTracker>,
    nettime: Arc<NetTime>,
    address_space_bits: u8,
    round_results_timeout: std::time::Duration,
}

impl SendPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: CyclicGroup,
        pool: Arc<HostPool>,
        rounds: Arc<RoundTracker>,
        registrar: Arc<NodeRegistrar>,
        health: Arc<HealthMonitor>,
        attempts: Arc<AttemptTracker>,
        nettime: Arc<NetTime>,
        address_space_bits: u8,
        follow: &FollowParams,
    ) -> Self {
        SendPipeline {
            group,
            pool,
            rounds,
            registrar,
            health,
            attempts,
            nettime,
            address_space_bits,
            round_results_timeout: follow.round_results_timeout,
        }
    }

    /// Send one message.
    pub async fn send_cmix(
        &self,
        assembler: Assembler,
        params: &CmixParams,
        stop: &StopToken,
    ) -> Result<SendReport> {
        self.send_many_cmix(vec![assembler], params, stop).await
    }

    /// Send a batch of messages through one round. All slots land in the
    /// same round or none do.
    pub async fn send_many_cmix(
        &self,
        assemblers: Vec<Assembler>,
        params: &CmixParams,
        stop: &StopToken,
    ) -> Result<SendReport> {
        if !self.health.is_healthy() && !params.critical {
            return Err(CmixError::NetworkUnhealthy);
        }
        let tries = if params.probe {
            params.round_tries
        } else {
            params.round_tries.min(self.attempts.optimal_attempts())
        };
        let started = Instant::now();
        let mut attempted: HashSet<RoundId> = params.excluded_rounds.clone();
        for attempt in 0..tries {
            if stop.is_stopped() {
                return Err(CmixError::Cancelled);
            }
            let remaining = match params.timeout.checked_sub(started.elapsed()) {
                Some(r) if !r.is_zero() => r,
                _ => break,
            };
            let round = match self
                .rounds
                .get_upcoming_realtime(remaining, &attempted, params.send_time_buffer)
                .await
            {
                Ok(round) => round,
                Err(CmixError::NoRoundAvailable(_)) => continue,
                Err(e) => return Err(e),
            };
            attempted.insert(round.id);
            if let Some(node) = round
                .topology
                .iter()
                .find(|n| params.blacklisted_nodes.contains(n))
            {
                debug!(round = round.id.0, node = %node, tag = %params.debug_tag,
                    "round skipped: blacklisted node");
                continue;
            }
            match self
                .attempt_round(&round, &assemblers, params, stop)
                .await
            {
                Ok(report) => {
                    if params.probe {
                        self.attempts.record(attempt + 1);
                    }
                    return Ok(report);
                }
                Err(e) if e.kind() == ErrorKind::Unrecoverable => return Err(e),
                Err(CmixError::Cancelled) => return Err(CmixError::Cancelled),
                Err(e) => {
                    debug!(round = round.id.0, error = %e, tag = %params.debug_tag,
                        "send attempt failed, trying another round");
                }
            }
        }
        Err(CmixError::NoRoundAvailable(attempted.len() as u32))
    }

    /// One complete attempt against one round: assemble, wrap, upload,
    /// await the result.
    async fn attempt_round(
        &self,
        round: &RoundInfo,
        assemblers: &[Assembler],
        params: &CmixParams,
        stop: &StopToken,
    ) -> Result<SendReport> {
        let keys = self.registrar.keys_for(&round.topology)?;
        let now = self.nettime.now();
        let mut slots = Vec::with_capacity(assemblers.len());
        let mut ephemeral_ids = Vec::with_capacity(assemblers.len());
        {
            let mut rng = rand::thread_rng();
            for assembler in assemblers {
                let outbound = assembler(round.id)?;
                let window = window_at(&outbound.recipient, self.address_space_bits, now);
                let msg = self.wrap_slot(&outbound, round, &keys, &mut rng)?;
                ephemeral_ids.push(window.ephemeral);
                slots.push(Slot {
                    ephemeral_id: window.ephemeral,
                    payload: msg.marshal(),
                });
            }
        }
        let upload_gateway = round
            .upload_gateway()
            .ok_or_else(|| CmixError::MalformedMessage("round has no topology".into()))?;
        let request = PutManyMessages {
            round_id: round.id,
            target: upload_gateway,
            slots,
        };
        self.pool
            .send_to_preferred(
                &[upload_gateway],
                &move |conn, _gw| {
                    let request = request.clone();
                    Box::pin(async move { conn.put_many_messages(request).await })
                },
                stop,
            )
            .await?;
        debug!(round = round.id.0, tag = %params.debug_tag, "slots uploaded");
        match self
            .rounds
            .wait_terminal(round.id, self.round_results_timeout)
            .await?
        {
            RoundState::Completed => {
                let completed_at = self
                    .rounds
                    .get(round.id)
                    .and_then(|r| r.timestamps.get(&RoundState::Completed).copied());
                info!(round = round.id.0, tag = %params.debug_tag, "send completed");
                Ok(SendReport {
                    round_id: round.id,
                    ephemeral_ids,
                    completed_at,
                })
            }
            _ => {
                warn!(round = round.id.0, "round failed after upload");
                Err(CmixError::RoundFailed(round.id.0))
            }
        }
    }

    /// Build the wire message for one recipient and wrap it in the
    /// round team's onion layers.
    fn wrap_slot<R: rand::Rng>(
        &self,
        outbound: &OutboundMessage,
        round: &RoundInfo,
        keys: &[haze_crypto::SymmetricKey],
        rng: &mut R,
    ) -> Result<CmixMessage> {
        let mut msg = CmixMessage::new(self.group.prime_len())?;
        msg.set_fingerprint(&outbound.fingerprint);
        msg.set_contents(&outbound.contents)?;
        if !outbound.service_tag.is_empty() {
            msg.set_sih(&service_tag_hash(&outbound.service_tag, &outbound.contents));
        }
        let mac = make_mac(&outbound.mac_key, &outbound.contents);
        msg.set_mac(&mac);

        let round_salt = round.id.0.to_le_bytes();
        let keys_a: Vec<_> = keys
            .iter()
            .map(|k| node_payload_key(&self.group, k, &round_salt, b"A"))
            .collect();
        let keys_b: Vec<_> = keys
            .iter()
            .map(|k| node_payload_key(&self.group, k, &round_salt, b"B"))
            .collect();
        let a = onion_encrypt(&self.group, &keys_a, msg.payload_a())?;
        let b = onion_encrypt(&self.group, &keys_b, msg.payload_b())?;
        msg.set_payloads(a, b)?;
        msg.randomize_group_bits(rng);
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndf::test_ndf;
    use crate::nodes::NoAuth;
    use crate::params::FollowParams;
    use ed25519_dalek::SigningKey;
    use haze_common::{stoppable, IdKind};
    use haze_connection::mock::{MockFactory, MockNetwork};
    use haze_connection::HostPoolParams;
    use haze_crypto::generate_keypair;
    use haze_storage::Kv;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn test_group() -> CyclicGroup {
        CyclicGroup::from_hex(test_ndf::TEST_CMIX_PRIME_HEX, "02").unwrap()
    }

    struct Fixture {
        net: Arc<MockNetwork>,
        pipeline: SendPipeline,
        rounds: Arc<RoundTracker>,
        _stoppers: Vec<haze_common::Stopper>,
    }

    async fn fixture(ndf: &crate::ndf::NetworkDefinition) -> Fixture {
        let net = MockNetwork::new();
        let group = test_group();
        let handler_group = group.clone();
        net.set_key_handler(move |_req| {
            let mut rng = rand::thread_rng();
            let pair = generate_keypair(&handler_group, &mut rng);
            Ok(haze_connection::SignedKeyResponse {
                node_public: handler_group.encode(&pair.public.0),
                key_id: vec![7],
                valid_until: SystemTime::now() + Duration::from_secs(3600),
                signature: vec![0; 64],
            })
        });
        let pool = Arc::new(
            HostPool::new(
                ndf.gateway_specs(),
                Arc::new(MockFactory::new(net.clone())),
                HostPoolParams::default(),
            )
            .await
            .unwrap(),
        );
        let params = FollowParams {
            registration_delay: Duration::from_millis(10),
            round_results_timeout: Duration::from_secs(2),
            ..FollowParams::default()
        };
        let (stopper, token) = stoppable("registrar");
        let mut rng = rand::rngs::StdRng::seed_from_u64(2);
        let registrar = NodeRegistrar::spawn(
            Kv::in_memory(),
            group.clone(),
            pool.clone(),
            Arc::new(NoAuth::new()),
            SigningKey::from_bytes(&[4u8; 32]),
            Id::random(&mut rng, IdKind::User),
            &params,
            token,
        );
        registrar.ensure_registered(ndf).await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let rounds = Arc::new(RoundTracker::new());
        let health = Arc::new(HealthMonitor::new());
        health.set_healthy(true);
        let pipeline = SendPipeline::new(
            group,
            pool,
            rounds.clone(),
            registrar,
            health,
            Arc::new(AttemptTracker::new()),
            Arc::new(NetTime::new(Duration::from_secs(300))),
            ndf.address_space_bits,
            &params,
        );
        Fixture {
            net,
            pipeline,
            rounds,
            _stoppers: vec![stopper],
        }
    }

    fn queued_round(id: u64, topology: Vec<Id>) -> RoundInfo {
        let mut timestamps = BTreeMap::new();
        timestamps.insert(
            RoundState::Realtime,
            SystemTime::now() + Duration::from_secs(30),
        );
        RoundInfo {
            id: RoundId(id),
            state: RoundState::Queued,
            topology,
            timestamps,
            batch_size: 32,
        }
    }

    fn outbound(recipient: Id) -> OutboundMessage {
        OutboundMessage {
            recipient,
            fingerprint: KeyFingerprint::from_bytes([5u8; 32]).unwrap(),
            service_tag: b"chat".to_vec(),
            contents: b"hello".to_vec(),
            mac_key: [6u8; 32],
        }
    }

    /// Drives a round to COMPLETED shortly after its upload arrives.
    fn complete_after_upload(fx: &Fixture, round: RoundInfo) {
        let net = fx.net.clone();
        let rounds = fx.rounds.clone();
        tokio::spawn(async move {
            loop {
                if net.uploads().iter().any(|u| u.round_id == round.id) {
                    let mut done = round.clone();
                    done.state = RoundState::Completed;
                    done.timestamps
                        .insert(RoundState::Completed, SystemTime::now());
                    rounds.observe(done);
                    return;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        });
    }

    #[tokio::test]
    async fn single_send_uploads_once_and_completes() {
        let ndf = test_ndf::with_nodes(2);
        let fx = fixture(&ndf).await;
        let topology: Vec<Id> = ndf.nodes.iter().map(|n| n.id).collect();
        let round = queued_round(100, topology);
        fx.rounds.observe(round.clone());
        complete_after_upload(&fx, round);

        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        let recipient = Id::random(&mut rng, IdKind::User);
        let (_stopper, token) = stoppable("send");
        let report = fx
            .pipeline
            .send_cmix(fixed(outbound(recipient)), &CmixParams::default(), &token)
            .await
            .unwrap();
        assert_eq!(report.round_id, RoundId(100));
        assert_eq!(report.ephemeral_ids.len(), 1);
        assert!(report.completed_at.is_some());
        let uploads = fx.net.uploads();
        assert_eq!(uploads.len(), 1);
        assert_eq!(uploads[0].slots.len(), 1);
    }

    #[tokio::test]
    async fn blacklisted_topology_is_skipped() {
        let ndf = test_ndf::with_nodes(4);
        let fx = fixture(&ndf).await;
        let nodes: Vec<Id> = ndf.nodes.iter().map(|n| n.id).collect();
        fx.rounds
            .observe(queued_round(100, vec![nodes[0], nodes[1]]));
        let good = queued_round(101, vec![nodes[2], nodes[3]]);
        fx.rounds.observe(good.clone());
        complete_after_upload(&fx, good);

        let mut rng = rand::rngs::StdRng::seed_from_u64(4);
        let recipient = Id::random(&mut rng, IdKind::User);
        let params = CmixParams {
            blacklisted_nodes: [nodes[0]].into(),
            ..CmixParams::default()
        };
        let (_stopper, token) = stoppable("send");
        let report = fx
            .pipeline
            .send_cmix(fixed(outbound(recipient)), &params, &token)
            .await
            .unwrap();
        assert_eq!(report.round_id, RoundId(101));
        let uploads = fx.net.uploads();
        assert!(uploads.iter().all(|u| u.round_id == RoundId(101)));
    }

    #[tokio::test]
    async fn unhealthy_network_rejects_ordinary_sends() {
        let ndf = test_ndf::with_nodes(2);
        let fx = fixture(&ndf).await;
        fx.pipeline.health.set_healthy(false);
        let mut rng = rand::rngs::StdRng::seed_from_u64(5);
        let recipient = Id::random(&mut rng, IdKind::User);
        let (_stopper, token) = stoppable("send");
        let err = fx
            .pipeline
            .send_cmix(fixed(outbound(recipient)), &CmixParams::default(), &token)
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::NetworkUnhealthy));
    }

    #[tokio::test]
    async fn failed_round_falls_through_to_next() {
        let ndf = test_ndf::with_nodes(2);
        let fx = fixture(&ndf).await;
        let topology: Vec<Id> = ndf.nodes.iter().map(|n| n.id).collect();
        let doomed = queued_round(100, topology.clone());
        fx.rounds.observe(doomed.clone());
        let good = queued_round(101, topology);
        fx.rounds.observe(good.clone());
        // Round 100 fails as soon as its upload lands; 101 completes.
        {
            let net = fx.net.clone();
            let rounds = fx.rounds.clone();
            tokio::spawn(async move {
                loop {
                    if net.uploads().iter().any(|u| u.round_id == doomed.id) {
                        let mut failed = doomed.clone();
                        failed.state = RoundState::Failed;
                        rounds.observe(failed);
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            });
        }
        complete_after_upload(&fx, good);

        let mut rng = rand::rngs::StdRng::seed_from_u64(6);
        let recipient = Id::random(&mut rng, IdKind::User);
        let (_stopper, token) = stoppable("send");
        let report = fx
            .pipeline
            .send_cmix(fixed(outbound(recipient)), &CmixParams::default(), &token)
            .await
            .unwrap();
        assert_eq!(report.round_id, RoundId(101));
    }
}
