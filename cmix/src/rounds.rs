// Copyright (c) 2025 The Haze Project

//! Round bookkeeping.
//!
//! [`RoundTracker`] mirrors the scheduler's view of live rounds as the
//! follower polls, broadcasts state transitions to waiters, and answers
//! the send path's "give me an upcoming realtime round" query. Rounds
//! the tracker has already forgotten are resolved through
//! [`HistoricalRounds`], which batches lookups over the gateway pool.

use crate::error::{CmixError, Result};
use haze_common::StopToken;
use haze_connection::{HostPool, RoundId, RoundInfo, RoundState};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Terminal rounds retained before pruning.
const RETAINED_ROUNDS: usize = 1024;

/// Event channel depth; slow subscribers drop, they can re-scan.
const EVENT_CAPACITY: usize = 256;

/// Live view of the network's rounds.
pub struct RoundTracker {
    inner: Mutex<TrackerInner>,
    events: broadcast::Sender<RoundInfo>,
}

struct TrackerInner {
    rounds: BTreeMap<RoundId, RoundInfo>,
    head: RoundId,
}

impl RoundTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        RoundTracker {
            inner: Mutex::new(TrackerInner {
                rounds: BTreeMap::new(),
                head: RoundId(0),
            }),
            events,
        }
    }

    /// The newest round id the network has announced.
    pub fn head(&self) -> RoundId {
        self.inner.lock().unwrap().head
    }

    pub fn get(&self, id: RoundId) -> Option<RoundInfo> {
        self.inner.lock().unwrap().rounds.get(&id).cloned()
    }

    /// Record a poll-reported head without any round detail.
    pub fn observe_head(&self, head: RoundId) {
        let mut inner = self.inner.lock().unwrap();
        if head > inner.head {
            inner.head = head;
        }
    }

    /// Merge one round update. State only moves forward; a stale poll
    /// response never regresses a round we already saw complete.
    /// Returns whether the round's state actually advanced.
    pub fn observe(&self, info: RoundInfo) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if info.id > inner.head {
            inner.head = info.id;
        }
        let changed = match inner.rounds.get(&info.id) {
            Some(known) if known.state >= info.state => false,
            _ => {
                inner.rounds.insert(info.id, info.clone());
                true
            }
        };
        if inner.rounds.len() > RETAINED_ROUNDS {
            let cutoff = RETAINED_ROUNDS / 2;
            // Drop the oldest terminal rounds first.
            let stale: Vec<RoundId> = inner
                .rounds
                .iter()
                .filter(|(_, r)| r.state.terminal())
                .map(|(id, _)| *id)
                .take(cutoff)
                .collect();
            for id in stale {
                inner.rounds.remove(&id);
            }
        }
        drop(inner);
        if changed {
            trace!(round = info.id.0, state = ?info.state, "round transition");
            let _ = self.events.send(info);
        }
        changed
    }

    /// The oldest tracked round that has not reached a terminal state.
    pub fn oldest_pending(&self) -> Option<RoundId> {
        let inner = self.inner.lock().unwrap();
        inner
            .rounds
            .values()
            .find(|r| !r.state.terminal())
            .map(|r| r.id)
    }

    /// Subscribe to round state transitions.
    pub fn subscribe(&self) -> broadcast::Receiver<RoundInfo> {
        self.events.subscribe()
    }

    /// Find a round the caller can still upload to: accepting uploads,
    /// scheduled to start at least `send_buffer` from now, and not in
    /// `attempted`. Waits for one to appear, up to `remaining`.
    pub async fn get_upcoming_realtime(
        &self,
        remaining: Duration,
        attempted: &HashSet<RoundId>,
        send_buffer: Duration,
    ) -> Result<RoundInfo> {
        let deadline = tokio::time::Instant::now() + remaining;
        let mut events = self.subscribe();
        loop {
            if let Some(info) = self.scan_usable(attempted, send_buffer) {
                return Ok(info);
            }
            tokio::select! {
                ev = events.recv() => match ev {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CmixError::Cancelled);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CmixError::NoRoundAvailable(attempted.len() as u32));
                }
            }
        }
    }

    fn scan_usable(
        &self,
        attempted: &HashSet<RoundId>,
        send_buffer: Duration,
    ) -> Option<RoundInfo> {
        let now = SystemTime::now();
        let inner = self.inner.lock().unwrap();
        inner
            .rounds
            .values()
            .filter(|r| r.state == RoundState::Queued && !attempted.contains(&r.id))
            .filter(|r| match r.timestamps.get(&RoundState::Realtime) {
                // Realtime start must leave room for the upload to land.
                Some(start) => *start > now + send_buffer,
                None => true,
            })
            .min_by_key(|r| r.id)
            .cloned()
    }

    /// Await the terminal state of a round, via live transitions only.
    pub async fn wait_terminal(
        &self,
        id: RoundId,
        timeout: Duration,
    ) -> Result<RoundState> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = self.subscribe();
        loop {
            if let Some(info) = self.get(id) {
                if info.state.terminal() {
                    return Ok(info.state);
                }
            }
            tokio::select! {
                ev = events.recv() => match ev {
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(CmixError::Cancelled);
                    }
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(CmixError::RoundResultTimeout(id.0));
                }
            }
        }
    }
}

impl Default for RoundTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// How many lookups accumulate before a historical batch is flushed.
const HISTORICAL_BATCH_SIZE: usize = 5;

/// How long a partial batch waits before flushing anyway.
const HISTORICAL_BATCH_DELAY: Duration = Duration::from_millis(500);

struct Lookup {
    round: RoundId,
    reply: oneshot::Sender<Option<RoundInfo>>,
}

/// Batched resolver for rounds that have fallen out of the live tracker.
#[derive(Clone)]
pub struct HistoricalRounds {
    tx: mpsc::Sender<Lookup>,
}

impl HistoricalRounds {
    /// Spawn the batching worker. It runs until `stop` fires or every
    /// handle is dropped.
    pub fn spawn(pool: Arc<HostPool>, stop: StopToken) -> Self {
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(run_historical(pool, rx, stop));
        HistoricalRounds { tx }
    }

    /// Resolve one round. Returns `None` when the network no longer
    /// remembers it either.
    pub async fn lookup(&self, round: RoundId) -> Result<Option<RoundInfo>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Lookup { round, reply })
            .await
            .map_err(|_| CmixError::Cancelled)?;
        rx.await.map_err(|_| CmixError::Cancelled)
    }
}

async fn run_historical(pool: Arc<HostPool>, mut rx: mpsc::Receiver<Lookup>, mut stop: StopToken) {
    let send_stop = stop.clone();
    let mut pending: Vec<Lookup> = Vec::new();
    loop {
        let flush = tokio::select! {
            req = rx.recv() => match req {
                Some(req) => {
                    pending.push(req);
                    pending.len() >= HISTORICAL_BATCH_SIZE
                }
                None => {
                    if !pending.is_empty() {
                        flush_batch(&pool, &mut pending, &send_stop).await;
                    }
                    return;
                }
            },
            _ = tokio::time::sleep(HISTORICAL_BATCH_DELAY), if !pending.is_empty() => true,
            _ = stop.stopped() => {
                send_stop.acknowledge();
                return;
            }
        };
        if flush {
            flush_batch(&pool, &mut pending, &send_stop).await;
        }
    }
}

async fn flush_batch(pool: &HostPool, pending: &mut Vec<Lookup>, stop: &StopToken) {
    let batch = std::mem::take(pending);
    let ids: Vec<RoundId> = batch.iter().map(|l| l.round).collect();
    debug!(rounds = ids.len(), "resolving historical rounds");
    let lookup_ids = ids.clone();
    let result = pool
        .send_to_any(
            &move |conn, _gw| {
                let ids = lookup_ids.clone();
                Box::pin(async move { conn.request_historical_rounds(&ids).await })
            },
            stop,
        )
        .await;
    match result {
        Ok(infos) => {
            let mut by_id: HashMap<RoundId, Option<RoundInfo>> =
                ids.into_iter().zip(infos).collect();
            for lookup in batch {
                let info = by_id.remove(&lookup.round).flatten();
                let _ = lookup.reply.send(info);
            }
        }
        Err(e) => {
            warn!(error = %e, "historical round lookup failed");
            for lookup in batch {
                let _ = lookup.reply.send(None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_common::{stoppable, Id, IdKind};
    use haze_connection::mock::{MockFactory, MockNetwork};
    use haze_connection::{GatewaySpec, HostPoolParams};
    use rand::SeedableRng;

    fn round(id: u64, state: RoundState) -> RoundInfo {
        let mut rng = rand::rngs::StdRng::seed_from_u64(id);
        RoundInfo {
            id: RoundId(id),
            state,
            topology: vec![
                Id::random(&mut rng, IdKind::Node),
                Id::random(&mut rng, IdKind::Node),
            ],
            timestamps: BTreeMap::new(),
            batch_size: 32,
        }
    }

    #[test]
    fn state_never_regresses() {
        let tracker = RoundTracker::new();
        assert!(tracker.observe(round(5, RoundState::Completed)));
        assert!(!tracker.observe(round(5, RoundState::Queued)));
        assert_eq!(tracker.get(RoundId(5)).unwrap().state, RoundState::Completed);
        assert_eq!(tracker.head(), RoundId(5));
    }

    #[test]
    fn oldest_pending_skips_terminal_rounds() {
        let tracker = RoundTracker::new();
        assert!(tracker.oldest_pending().is_none());
        tracker.observe(round(4, RoundState::Completed));
        tracker.observe(round(5, RoundState::Queued));
        tracker.observe(round(6, RoundState::Realtime));
        assert_eq!(tracker.oldest_pending(), Some(RoundId(5)));
        tracker.observe(round(5, RoundState::Failed));
        assert_eq!(tracker.oldest_pending(), Some(RoundId(6)));
        tracker.observe(round(6, RoundState::Completed));
        assert!(tracker.oldest_pending().is_none());
    }

    #[tokio::test]
    async fn upcoming_realtime_prefers_lowest_usable_round() {
        let tracker = RoundTracker::new();
        let mut queued = round(10, RoundState::Queued);
        queued.timestamps.insert(
            RoundState::Realtime,
            SystemTime::now() + Duration::from_secs(10),
        );
        tracker.observe(queued);
        tracker.observe(round(11, RoundState::Realtime));
        let got = tracker
            .get_upcoming_realtime(
                Duration::from_millis(100),
                &HashSet::new(),
                Duration::from_millis(50),
            )
            .await
            .unwrap();
        assert_eq!(got.id, RoundId(10));
    }

    #[tokio::test]
    async fn attempted_rounds_are_skipped() {
        let tracker = RoundTracker::new();
        tracker.observe(round(10, RoundState::Queued));
        let attempted: HashSet<RoundId> = [RoundId(10)].into();
        let err = tracker
            .get_upcoming_realtime(
                Duration::from_millis(50),
                &attempted,
                Duration::from_millis(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CmixError::NoRoundAvailable(1)));
    }

    #[tokio::test]
    async fn wait_terminal_sees_late_completion() {
        let tracker = Arc::new(RoundTracker::new());
        tracker.observe(round(7, RoundState::Realtime));
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                tracker
                    .wait_terminal(RoundId(7), Duration::from_secs(1))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tracker.observe(round(7, RoundState::Completed));
        assert_eq!(waiter.await.unwrap().unwrap(), RoundState::Completed);
    }

    #[tokio::test]
    async fn historical_lookup_resolves_through_gateway() {
        let net = MockNetwork::new();
        net.put_round(round(3, RoundState::Completed));
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let node = Id::random(&mut rng, IdKind::Node);
        let specs = vec![GatewaySpec {
            gateway_id: node.with_kind(IdKind::Gateway),
            node_id: node,
            address: "gw0.test:8443".into(),
            tls_cert: Vec::new(),
        }];
        let pool = Arc::new(
            HostPool::new(
                specs,
                Arc::new(MockFactory::new(net)),
                HostPoolParams::default(),
            )
            .await
            .unwrap(),
        );
        let (stopper, token) = stoppable("historical");
        let historical = HistoricalRounds::spawn(pool, token);
        let info = historical.lookup(RoundId(3)).await.unwrap().unwrap();
        assert_eq!(info.state, RoundState::Completed);
        assert!(historical.lookup(RoundId(99)).await.unwrap().is_none());
        stopper.stop(Duration::from_secs(1)).await;
    }
}
