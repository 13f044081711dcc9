// Copyright (c) 2025 The Haze Project

//! The reception follower.
//!
//! One long-running loop polls a gateway each cycle for every active
//! receiver identity, feeds round updates into the tracker, records
//! clock skew, flips network health, and enqueues pickup jobs for
//! completed rounds the client's identities should attend. The cycle
//! period is settable at runtime through a watch channel.

use crate::error::Result;
use crate::health::HealthMonitor;
use crate::identity::IdentityTracker;
use crate::pickup::{PickupJob, PickupPool};
use crate::rounds::RoundTracker;
use haze_common::{NetTime, StopToken};
use haze_connection::{HostPool, PollRequest, PollResponse, RoundId, RoundState};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// How long the head may stall before the network counts as unhealthy.
const STALL_LIMIT: Duration = Duration::from_secs(60);

/// How far the poll floor may trail behind the head while a round
/// stays unresolved. Bounds the size of every poll response.
const POLL_LOOKBACK: u64 = 512;

pub struct Follower {
    pool: Arc<HostPool>,
    rounds: Arc<RoundTracker>,
    identities: Arc<IdentityTracker>,
    pickup: PickupPool,
    health: Arc<HealthMonitor>,
    nettime: Arc<NetTime>,
    period_tx: watch::Sender<Duration>,
    state: Mutex<FollowState>,
}

struct FollowState {
    last_known: RoundId,
    last_head: RoundId,
    last_advance: Instant,
}

impl Follower {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: Arc<HostPool>,
        rounds: Arc<RoundTracker>,
        identities: Arc<IdentityTracker>,
        pickup: PickupPool,
        health: Arc<HealthMonitor>,
        nettime: Arc<NetTime>,
        track_period: Duration,
    ) -> Arc<Self> {
        let (period_tx, _) = watch::channel(track_period);
        Arc::new(Follower {
            pool,
            rounds,
            identities,
            pickup,
            health,
            nettime,
            period_tx,
            state: Mutex::new(FollowState {
                last_known: RoundId(0),
                last_head: RoundId(0),
                last_advance: Instant::now(),
            }),
        })
    }

    /// Change the cycle period; takes effect on the next cycle.
    pub fn set_track_period(&self, period: Duration) {
        let _ = self.period_tx.send(period);
    }

    pub fn track_period(&self) -> Duration {
        *self.period_tx.borrow()
    }

    /// The follower loop. Runs until stopped.
    pub async fn run(self: Arc<Self>, mut stop: StopToken) {
        let work_stop = stop.clone();
        let mut period_rx = self.period_tx.subscribe();
        loop {
            let period = *period_rx.borrow_and_update();
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = period_rx.changed() => continue,
                _ = stop.stopped() => {
                    work_stop.acknowledge();
                    return;
                }
            }
            if let Err(e) = self.cycle(&work_stop).await {
                debug!(error = %e, "follower cycle failed");
                self.health.set_healthy(false);
            }
        }
    }

    /// One follower cycle. Public so tests can drive the loop
    /// deterministically.
    pub async fn cycle(&self, stop: &StopToken) -> Result<()> {
        let now = self.nettime.now();
        let receivers = {
            let mut rng = rand::thread_rng();
            self.identities.active_receivers(now, &mut rng)
        };
        let floor = self.state.lock().unwrap().last_known;
        let mut newest = floor;
        let mut completed = Vec::new();
        for receiver in &receivers {
            let request = PollRequest {
                last_known_round: floor,
                ephemeral_id: receiver.window.ephemeral,
            };
            let response: PollResponse = self
                .pool
                .send_to_any(
                    &move |conn, _gw| {
                        let request = request.clone();
                        Box::pin(async move { conn.poll(request).await })
                    },
                    stop,
                )
                .await?;
            self.nettime.record_skew(response.skew_ms);
            if let Some(bits) = response.address_space_bits {
                self.identities.set_address_space(bits);
            }
            let head = response.head;
            self.rounds.observe_head(head);
            newest = newest.max(head);
            for info in response.rounds {
                let state = info.state;
                let id = info.id;
                // The tracker's forward-only merge dedupes: a round
                // reports as newly completed exactly once.
                if self.rounds.observe(info) && state == RoundState::Completed {
                    completed.push(id);
                }
            }
            if receiver.fake {
                // Cover traffic: fetch a random historical round so the
                // poll pattern matches a real receiver's.
                let round = {
                    let mut rng = rand::thread_rng();
                    self.identities.fake_poll_round(head, &mut rng)
                };
                self.pickup
                    .enqueue(PickupJob {
                        round_id: round,
                        ephemeral_id: receiver.window.ephemeral,
                        source: receiver.window.source,
                        fake: true,
                    })
                    .await?;
            }
        }
        for id in &completed {
            for receiver in &receivers {
                trace!(round = id.0, eph = receiver.window.ephemeral.value(),
                    "scheduling pickup");
                self.pickup
                    .enqueue(PickupJob {
                        round_id: *id,
                        ephemeral_id: receiver.window.ephemeral,
                        source: receiver.window.source,
                        fake: receiver.fake,
                    })
                    .await?;
            }
        }
        // The floor trails back to the oldest unresolved round so a
        // completion behind the head is still observed. `last_head`
        // carries the stall check; the floor may legitimately hold.
        let floor_next = self
            .rounds
            .oldest_pending()
            .unwrap_or(newest)
            .max(RoundId(newest.0.saturating_sub(POLL_LOOKBACK)));
        let healthy = {
            let mut state = self.state.lock().unwrap();
            state.last_known = floor_next;
            if newest > state.last_head {
                state.last_head = newest;
                state.last_advance = Instant::now();
            }
            state.last_advance.elapsed() < STALL_LIMIT
        };
        if !healthy {
            warn!("round head has stalled");
        }
        self.health.set_healthy(healthy);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demux::Demux;
    use crate::message::MIN_PRIME_LEN;
    use crate::ndf::test_ndf;
    use crate::rounds::HistoricalRounds;
    use crate::unchecked::UncheckedStore;
    use haze_common::{stoppable, Id, IdKind, StopGroup};
    use haze_connection::mock::{MockFactory, MockNetwork};
    use haze_connection::{HostPoolParams, RoundInfo};
    use haze_storage::Kv;
    use rand::SeedableRng;
    use std::collections::BTreeMap;
    use std::time::SystemTime;

    const PRIME_LEN: usize = MIN_PRIME_LEN + 7;

    struct Fixture {
        net: Arc<MockNetwork>,
        follower: Arc<Follower>,
        nettime: Arc<NetTime>,
        health: Arc<HealthMonitor>,
        identities: Arc<IdentityTracker>,
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
        let identities = Arc::new(IdentityTracker::load(Kv::in_memory(), 16));
        let health = Arc::new(HealthMonitor::new());
        let nettime = Arc::new(NetTime::new(Duration::from_secs(300)));
        let mut group = StopGroup::new();
        let (hist_stopper, hist_token) = stoppable("historical");
        group.push(hist_stopper);
        let historical = HistoricalRounds::spawn(pool.clone(), hist_token);
        let pickup = PickupPool::spawn(
            2,
            PRIME_LEN,
            pool.clone(),
            rounds.clone(),
            historical,
            Arc::new(Demux::new()),
            Arc::new(UncheckedStore::load(Kv::in_memory())),
            nettime.clone(),
            &mut group,
        );
        let follower = Follower::new(
            pool,
            rounds.clone(),
            identities.clone(),
            pickup,
            health.clone(),
            nettime.clone(),
            Duration::from_millis(20),
        );
        Fixture {
            net,
            follower,
            nettime,
            health,
            identities,
            rounds,
            group,
        }
    }

    fn round(id: u64, state: RoundState) -> RoundInfo {
        let mut rng = rand::rngs::StdRng::seed_from_u64(id);
        let mut timestamps = BTreeMap::new();
        if state == RoundState::Completed {
            timestamps.insert(RoundState::Completed, SystemTime::now());
        }
        RoundInfo {
            id: RoundId(id),
            state,
            topology: vec![
                Id::random(&mut rng, IdKind::Node),
                Id::random(&mut rng, IdKind::Node),
            ],
            timestamps,
            batch_size: 32,
        }
    }

    fn completed_round(id: u64) -> RoundInfo {
        round(id, RoundState::Completed)
    }

    #[tokio::test]
    async fn cycle_ingests_rounds_and_skew() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(50);
        fx.identities
            .add(Id::random(&mut rng, IdKind::User), None, false);
        fx.net.put_round(completed_round(5));
        fx.net.set_skew_ms(1500);
        let (_stopper, token) = stoppable("cycle");
        fx.follower.cycle(&token).await.unwrap();
        assert_eq!(fx.rounds.head(), RoundId(5));
        assert!(fx.rounds.get(RoundId(5)).is_some());
        assert!(fx.health.is_healthy());
        assert!(fx.nettime.offset_ms() != 0);
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn completion_behind_the_head_is_still_observed() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(52);
        fx.identities
            .add(Id::random(&mut rng, IdKind::User), None, false);
        // Round 5 is still queued when round 8 has already completed.
        fx.net.put_round(round(5, RoundState::Queued));
        fx.net.put_round(completed_round(8));
        let (_stopper, token) = stoppable("cycle");
        fx.follower.cycle(&token).await.unwrap();
        assert_eq!(fx.rounds.head(), RoundId(8));
        assert_eq!(fx.rounds.get(RoundId(5)).unwrap().state, RoundState::Queued);
        // It completes behind the head; the next cycle must see it, or
        // every waiter on round 5 times out and the sender re-uploads.
        fx.net.put_round(completed_round(5));
        fx.follower.cycle(&token).await.unwrap();
        assert_eq!(
            fx.rounds.get(RoundId(5)).unwrap().state,
            RoundState::Completed
        );
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn run_loop_ingests_until_stopped() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(53);
        fx.identities
            .add(Id::random(&mut rng, IdKind::User), None, false);
        fx.net.put_round(completed_round(3));
        let (stopper, token) = stoppable("follower");
        let handle = tokio::spawn(fx.follower.clone().run(token));
        let deadline = Instant::now() + Duration::from_secs(2);
        while fx.rounds.head() != RoundId(3) && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.rounds.head(), RoundId(3));
        assert!(stopper.stop(Duration::from_secs(1)).await);
        handle.await.unwrap();
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn poll_failure_marks_unhealthy() {
        let fx = fixture().await;
        let mut rng = rand::rngs::StdRng::seed_from_u64(51);
        fx.identities
            .add(Id::random(&mut rng, IdKind::User), None, false);
        fx.health.set_healthy(true);
        for gw in test_ndf::with_nodes(2).gateway_specs() {
            fx.net.fail_next(gw.gateway_id, 100);
        }
        let (_stopper, token) = stoppable("cycle");
        assert!(fx.follower.cycle(&token).await.is_err());
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn fake_receiver_polls_when_nothing_tracked() {
        let fx = fixture().await;
        fx.net.put_round(completed_round(9));
        let (_stopper, token) = stoppable("cycle");
        fx.follower.cycle(&token).await.unwrap();
        // The fake receiver still drove a poll; head was ingested.
        assert_eq!(fx.rounds.head(), RoundId(9));
        fx.group.stop_all(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn track_period_is_settable() {
        let fx = fixture().await;
        fx.follower.set_track_period(Duration::from_millis(250));
        assert_eq!(fx.follower.track_period(), Duration::from_millis(250));
        fx.group.stop_all(Duration::from_secs(1)).await;
    }
}
