// Copyright (c) 2025 The Haze Project

//! Mailbox pickup.
//!
//! The follower turns round activity into pickup jobs; a bounded worker
//! pool fetches each round's slots from the round's last gateway,
//! parses them, and hands them to the demultiplexer. A fetch that fails
//! or finds the gateway without the round lands the job in the
//! unchecked-round table for backoff retry.

use crate::demux::Demux;
use crate::error::Result;
use crate::message::CmixMessage;
use crate::rounds::{HistoricalRounds, RoundTracker};
use crate::unchecked::UncheckedStore;
use haze_common::{stoppable, EphemeralId, Id, NetTime, StopGroup, StopToken};
use haze_connection::{HostPool, MessageRequest, RoundId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// One round to fetch for one receiver.
#[derive(Clone, Debug)]
pub struct PickupJob {
    pub round_id: RoundId,
    pub ephemeral_id: EphemeralId,
    pub source: Id,
    /// Cover-traffic jobs fetch but never decrypt.
    pub fake: bool,
}

struct Shared {
    prime_len: usize,
    pool: Arc<HostPool>,
    rounds: Arc<RoundTracker>,
    historical: HistoricalRounds,
    demux: Arc<Demux>,
    unchecked: Arc<UncheckedStore>,
    nettime: Arc<NetTime>,
}

/// Handle for enqueueing pickup jobs.
#[derive(Clone)]
pub struct PickupPool {
    tx: mpsc::Sender<PickupJob>,
}

impl PickupPool {
    /// Spawn `workers` pickup workers; their stoppers join `group`.
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        workers: usize,
        prime_len: usize,
        pool: Arc<HostPool>,
        rounds: Arc<RoundTracker>,
        historical: HistoricalRounds,
        demux: Arc<Demux>,
        unchecked: Arc<UncheckedStore>,
        nettime: Arc<NetTime>,
        group: &mut StopGroup,
    ) -> Self {
        let (tx, rx) = mpsc::channel::<PickupJob>(256);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shared = Arc::new(Shared {
            prime_len,
            pool,
            rounds,
            historical,
            demux,
            unchecked,
            nettime,
        });
        for n in 0..workers {
            let (stopper, token) = stoppable(format!("pickup-{n}"));
            group.push(stopper);
            tokio::spawn(run_worker(Arc::clone(&shared), Arc::clone(&rx), token));
        }
        PickupPool { tx }
    }

    /// Enqueue a job; applies backpressure when the workers are behind.
    pub async fn enqueue(&self, job: PickupJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| crate::error::CmixError::Cancelled)
    }
}

async fn run_worker(
    shared: Arc<Shared>,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<PickupJob>>>,
    mut stop: StopToken,
) {
    let work_stop = stop.clone();
    loop {
        let job = {
            let mut rx = rx.lock().await;
            tokio::select! {
                job = rx.recv() => match job {
                    Some(job) => job,
                    None => {
                        work_stop.acknowledge();
                        return;
                    }
                },
                _ = stop.stopped() => {
                    work_stop.acknowledge();
                    return;
                }
            }
        };
        process_job(&shared, &job, &work_stop).await;
    }
}

async fn process_job(shared: &Shared, job: &PickupJob, stop: &StopToken) {
    // Resolve the round's team so the fetch goes to its last gateway.
    let info = match shared.rounds.get(job.round_id) {
        Some(info) => Some(info),
        None => match shared.historical.lookup(job.round_id).await {
            Ok(info) => info,
            Err(_) => None,
        },
    };
    let preferred: Vec<Id> = info
        .as_ref()
        .and_then(|i| i.pickup_gateway())
        .into_iter()
        .collect();
    let request = MessageRequest {
        ephemeral_id: job.ephemeral_id,
        round_id: job.round_id,
    };
    let result = shared
        .pool
        .send_to_preferred(
            &preferred,
            &move |conn, _gw| {
                let request = request.clone();
                Box::pin(async move { conn.request_messages(request).await })
            },
            stop,
        )
        .await;
    let now = shared.nettime.now();
    match result {
        Ok(resp) if resp.has_round => {
            trace!(round = job.round_id.0, slots = resp.slots.len(), "round picked up");
            if !job.fake {
                for slot in &resp.slots {
                    match CmixMessage::unmarshal(shared.prime_len, &slot.payload) {
                        Ok(msg) => shared.demux.handle(&job.source, &msg, job.round_id),
                        Err(e) => {
                            warn!(round = job.round_id.0, error = %e, "undecodable slot dropped")
                        }
                    }
                }
            }
            shared.unchecked.remove(job.round_id, job.ephemeral_id);
        }
        Ok(_) => {
            debug!(round = job.round_id.0, "gateway missing round, deferring");
            defer(shared, job, now);
        }
        Err(e) => {
            debug!(round = job.round_id.0, error = %e, "pickup failed, deferring");
            defer(shared, job, now);
        }
    }
}

fn defer(shared: &Shared, job: &PickupJob, now: std::time::SystemTime) {
    if job.fake {
        // Cover traffic is never retried.
        return;
    }
    if shared.unchecked.get(job.round_id, job.ephemeral_id).is_some() {
        shared.unchecked.record_check(job.round_id, job.ephemeral_id, now);
    } else {
        shared
            .unchecked
            .add(job.round_id, job.ephemeral_id, job.source, now);
    }
}

/// Ticker that re-enqueues due unchecked rounds.
pub async fn run_unchecked_checker(
    unchecked: Arc<UncheckedStore>,
    pickup: PickupPool,
    nettime: Arc<NetTime>,
    period: std::time::Duration,
    mut stop: StopToken,
) {
    let work_stop = stop.clone();
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.stopped() => {
                work_stop.acknowledge();
                return;
            }
        }
        for entry in unchecked.due(nettime.now()) {
            let job = PickupJob {
                round_id: entry.round_id,
                ephemeral_id: entry.ephemeral_id,
                source: entry.source,
                fake: false,
            };
            if pickup.enqueue(job).await.is_err() {
                work_stop.acknowledge();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::MessageProcessor;
    use crate::message::MIN_PRIME_LEN;
    use crate::ndf::test_ndf;
    use haze_common::IdKind;
    use haze_connection::mock::{MockFactory, MockNetwork};
    use haze_connection::{HostPoolParams, RoundInfo, RoundState, Slot};
    use haze_crypto::KeyFingerprint;
    use haze_storage::Kv;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, SystemTime};

    const PRIME_LEN: usize = MIN_PRIME_LEN + 7;

    struct Counting(AtomicUsize);

    impl MessageProcessor for Counting {
        fn process(&self, _r: &Id, _m: &CmixMessage, _round: RoundId) -> bool {
            self.0.fetch_add(1, Ordering::SeqCst);
            true
        }
    }

    struct Fixture {
        net: Arc<MockNetwork>,
        pickup: PickupPool,
        demux: Arc<Demux>,
        unchecked: Arc<UncheckedStore>,
        rounds: Arc<RoundTracker>,
        group: StopGroup,
    }

    async fn fixture() -> Fixture {
        let ndf = test_ndf::with_nodes(2);
        let net = MockNetwork::new();
        let pool = Arc::new(
            HostPool::new(
                ndf.gateway_specs(),
                Arc::new(MockFactory::new(net.clone())),
                HostPoolParams::default(),
            )
            .await
            .unwrap(),
        );
        let rounds = Arc::new(RoundTracker::new());
        let mut group = StopGroup::new();
        let (hist_stopper, hist_token) = stoppable("historical");
        group.push(hist_stopper);
        let historical = HistoricalRounds::spawn(pool.clone(), hist_token);
        let demux = Arc::new(Demux::new());
        let unchecked = Arc::new(UncheckedStore::load(Kv::in_memory()));
        let pickup = PickupPool::spawn(
            2,
            PRIME_LEN,
            pool,
            rounds.clone(),
            historical,
            demux.clone(),
            unchecked.clone(),
            Arc::new(NetTime::new(Duration::from_secs(300))),
            &mut group,
        );
        Fixture {
            net,
            pickup,
            demux,
            unchecked,
            rounds,
            group,
        }
    }

    fn finished_round(id: u64) -> RoundInfo {
        let mut rng = rand::rngs::StdRng::seed_from_u64(id);
        RoundInfo {
            id: RoundId(id),
            state: RoundState::Completed,
            topology: vec![
                Id::random(&mut rng, IdKind::Node),
                Id::random(&mut rng, IdKind::Node),
            ],
            timestamps: BTreeMap::new(),
            batch_size: 32,
        }
    }

    fn slot_for(fp: &KeyFingerprint, eph: EphemeralId) -> Slot {
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        msg.set_fingerprint(fp);
        Slot {
            ephemeral_id: eph,
            payload: msg.marshal(),
        }
    }

    #[tokio::test]
    async fn pickup_routes_slots_to_demux() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(40);
        let source = Id::random(&mut rng, IdKind::User);
        let eph = EphemeralId(42);
        let fp = KeyFingerprint::from_bytes([8u8; 32]).unwrap();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        fx.demux.add_fingerprint(source, fp, counter.clone()).unwrap();

        fx.rounds.observe(finished_round(12));
        fx.net.put_round(finished_round(12));
        fx.net.deposit(eph, RoundId(12), vec![slot_for(&fp, eph)]);
        fx.pickup
            .enqueue(PickupJob {
                round_id: RoundId(12),
                ephemeral_id: eph,
                source,
                fake: false,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(fx.unchecked.is_empty());
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn failed_pickup_lands_in_unchecked() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(41);
        let source = Id::random(&mut rng, IdKind::User);
        let eph = EphemeralId(43);
        fx.net.fail_pickup(RoundId(20), 1);
        fx.rounds.observe(finished_round(20));
        fx.pickup
            .enqueue(PickupJob {
                round_id: RoundId(20),
                ephemeral_id: eph,
                source,
                fake: false,
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        let entry = fx.unchecked.get(RoundId(20), eph).unwrap();
        assert_eq!(entry.num_checks, 1);
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn unchecked_retry_succeeds_after_gateway_recovers() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let source = Id::random(&mut rng, IdKind::User);
        let eph = EphemeralId(44);
        let fp = KeyFingerprint::from_bytes([9u8; 32]).unwrap();
        let counter = Arc::new(Counting(AtomicUsize::new(0)));
        fx.demux.add_fingerprint(source, fp, counter.clone()).unwrap();

        let t0 = SystemTime::now();
        fx.unchecked.add(RoundId(30), eph, source, t0 - Duration::from_secs(11));
        fx.rounds.observe(finished_round(30));
        fx.net.put_round(finished_round(30));
        fx.net.deposit(eph, RoundId(30), vec![slot_for(&fp, eph)]);

        let mut group = StopGroup::new();
        let (stopper, token) = stoppable("checker");
        group.push(stopper);
        tokio::spawn(run_unchecked_checker(
            fx.unchecked.clone(),
            fx.pickup.clone(),
            Arc::new(NetTime::new(Duration::from_secs(300))),
            Duration::from_millis(20),
            token,
        ));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        assert!(fx.unchecked.get(RoundId(30), eph).is_none());
        group.stop_all(Duration::from_secs(1)).await;
        fx.group.stop_all(Duration::from_secs(1)).await;
    }
}
