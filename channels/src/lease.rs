// Copyright (c) 2025 The Haze Project

//! Action leases.
//!
//! A channel action (pin, mute, hide, delete) carries a lease: a
//! duration after which the action must be undone. Actions outliving
//! the network's message retention must additionally be replayed before
//! the network forgets them, so other members joining late still see
//! them. One scheduler orders every pending trigger and a single timer
//! task fires them.

use crate::error::{LeaseError, Result};
use haze_common::{Id, StopToken};
use haze_storage::{Kv, Record};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

/// How long the network retains a message before dropping it.
pub const MESSAGE_LIFE: Duration = Duration::from_secs(500 * 3600);

/// Reschedule window for triggers found already expired at load, so a
/// faster client's replay can land first.
const STALE_FLOOR: Duration = Duration::from_secs(5 * 60);
const STALE_CEIL: Duration = Duration::from_secs(30 * 60);

const CHANNELS_MAP: &str = "channels";
const LEASE_VERSION: u64 = 1;

/// The channel operations a lease can govern.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChannelAction {
    Pin,
    Mute,
    Hide,
    Delete,
}

impl ChannelAction {
    fn tag(&self) -> u8 {
        match self {
            ChannelAction::Pin => 1,
            ChannelAction::Mute => 2,
            ChannelAction::Hide => 3,
            ChannelAction::Delete => 4,
        }
    }
}

/// One leased action awaiting its trigger.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LeaseMessage {
    pub channel: Id,
    pub action: ChannelAction,
    pub payload: Vec<u8>,
    /// When the action was first issued; replays carry it unchanged.
    pub original_timestamp: SystemTime,
    /// None replays indefinitely.
    pub lease: Option<Duration>,
    /// Absent for indefinite leases.
    pub lease_end: Option<SystemTime>,
    pub lease_trigger: SystemTime,
}

impl LeaseMessage {
    pub fn fingerprint(&self) -> [u8; 32] {
        lease_fingerprint(&self.channel, &self.action, &self.payload)
    }
}

/// Dedup key: one live lease per (channel, action, payload).
pub fn lease_fingerprint(channel: &Id, action: &ChannelAction, payload: &[u8]) -> [u8; 32] {
    Sha256::new()
        .chain_update(channel.as_bytes())
        .chain_update([action.tag()])
        .chain_update(payload)
        .finalize()
        .into()
}

/// What a fired trigger asks of the channel layer.
#[derive(Clone, Debug)]
pub enum LeaseEvent {
    /// Re-send the action with its original timestamp.
    Replay(LeaseMessage),
    /// The lease ended; reverse the action.
    Undo(LeaseMessage),
}

#[derive(Default)]
struct Inner {
    /// Pending triggers in firing order.
    queue: BTreeMap<(SystemTime, [u8; 32]), LeaseMessage>,
    /// Fingerprint to its current queue position.
    by_fingerprint: HashMap<[u8; 32], SystemTime>,
}

/// Orders every pending lease trigger and fires them through one timer.
pub struct LeaseScheduler {
    kv: Kv,
    message_life: Duration,
    inner: Mutex<Inner>,
    kick: Notify,
    events: mpsc::UnboundedSender<LeaseEvent>,
}

impl LeaseScheduler {
    /// Restore every persisted per-channel list. Triggers that expired
    /// while this client was offline are pushed a short random distance
    /// into the future rather than fired immediately.
    pub fn load(
        kv: Kv,
        message_life: Duration,
    ) -> Result<(std::sync::Arc<Self>, mpsc::UnboundedReceiver<LeaseEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let scheduler = std::sync::Arc::new(LeaseScheduler {
            kv,
            message_life,
            inner: Mutex::new(Inner::default()),
            kick: Notify::new(),
            events,
        });
        let now = SystemTime::now();
        let mut rng = rand::thread_rng();
        for (channel_key, _) in scheduler.kv.map_elements(CHANNELS_MAP) {
            let map = format!("leases/{channel_key}");
            for (element, record) in scheduler.kv.map_elements(&map) {
                let mut message: LeaseMessage =
                    bincode::deserialize(&record.data).map_err(|e| {
                        LeaseError::Malformed(format!("lease {channel_key}/{element}: {e}"))
                    })?;
                if message.lease_trigger < now {
                    message.lease_trigger = now + random_duration(&mut rng, STALE_FLOOR, STALE_CEIL);
                    debug!(channel = %message.channel, "stale trigger rescheduled");
                    scheduler.persist(&message);
                }
                let mut inner = scheduler.inner.lock().unwrap();
                let fp = message.fingerprint();
                inner.by_fingerprint.insert(fp, message.lease_trigger);
                inner.queue.insert((message.lease_trigger, fp), message);
            }
        }
        let restored = scheduler.inner.lock().unwrap().queue.len();
        if restored > 0 {
            info!(leases = restored, "lease schedule restored");
        }
        Ok((scheduler, rx))
    }

    /// Register a leased action. An existing lease for the same
    /// (channel, action, payload) is replaced.
    pub fn add(
        &self,
        channel: Id,
        action: ChannelAction,
        payload: Vec<u8>,
        original_timestamp: SystemTime,
        lease: Option<Duration>,
    ) {
        self.add_at(
            channel,
            action,
            payload,
            original_timestamp,
            lease,
            SystemTime::now(),
            &mut rand::thread_rng(),
        );
    }

    fn add_at<R: Rng>(
        &self,
        channel: Id,
        action: ChannelAction,
        payload: Vec<u8>,
        original_timestamp: SystemTime,
        lease: Option<Duration>,
        now: SystemTime,
        rng: &mut R,
    ) {
        let lease_end = lease.map(|l| original_timestamp + l);
        let lease_trigger = self.initial_trigger(lease, lease_end, now, rng);
        let message = LeaseMessage {
            channel,
            action,
            payload,
            original_timestamp,
            lease,
            lease_end,
            lease_trigger,
        };
        let fp = message.fingerprint();
        let mut inner = self.inner.lock().unwrap();
        if let Some(old_trigger) = inner.by_fingerprint.remove(&fp) {
            inner.queue.remove(&(old_trigger, fp));
        }
        inner.by_fingerprint.insert(fp, lease_trigger);
        inner.queue.insert((lease_trigger, fp), message.clone());
        drop(inner);
        self.persist(&message);
        self.kick.notify_one();
    }

    /// Drop a lease without firing it. Unknown leases are a no-op.
    pub fn remove(&self, channel: &Id, action: &ChannelAction, payload: &[u8]) {
        let fp = lease_fingerprint(channel, action, payload);
        let removed = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .by_fingerprint
                .remove(&fp)
                .and_then(|trigger| inner.queue.remove(&(trigger, fp)))
        };
        if let Some(message) = removed {
            self.unpersist(&message);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The pending lease for an action, if any.
    pub fn get(&self, channel: &Id, action: &ChannelAction, payload: &[u8]) -> Option<LeaseMessage> {
        let fp = lease_fingerprint(channel, action, payload);
        let inner = self.inner.lock().unwrap();
        inner
            .by_fingerprint
            .get(&fp)
            .and_then(|trigger| inner.queue.get(&(*trigger, fp)))
            .cloned()
    }

    fn next_trigger(&self) -> Option<SystemTime> {
        self.inner
            .lock()
            .unwrap()
            .queue
            .keys()
            .next()
            .map(|(trigger, _)| *trigger)
    }

    /// Fire every trigger at or before `now`, in order. Replays are
    /// reinserted with a fresh trigger; undos delete the entry.
    pub fn fire_due<R: Rng>(&self, now: SystemTime, rng: &mut R) {
        loop {
            let due = {
                let mut inner = self.inner.lock().unwrap();
                let key = match inner.queue.keys().next() {
                    Some((trigger, fp)) if *trigger <= now => (*trigger, *fp),
                    _ => return,
                };
                let message = inner.queue.remove(&key).expect("head present");
                inner.by_fingerprint.remove(&key.1);
                message
            };
            let replay = match due.lease_end {
                None => true,
                Some(end) => due.lease_trigger < end,
            };
            if replay {
                let mut next = due.clone();
                next.lease_trigger = self.replay_trigger(now, rng, due.lease_end);
                let fp = next.fingerprint();
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.by_fingerprint.insert(fp, next.lease_trigger);
                    inner.queue.insert((next.lease_trigger, fp), next.clone());
                }
                self.persist(&next);
                debug!(channel = %due.channel, action = ?due.action, "lease replay");
                let _ = self.events.send(LeaseEvent::Replay(due));
            } else {
                self.unpersist(&due);
                debug!(channel = %due.channel, action = ?due.action, "lease expired");
                let _ = self.events.send(LeaseEvent::Undo(due));
            }
        }
    }

    /// Drive the timer until stopped.
    pub async fn run(&self, mut stop: StopToken) {
        loop {
            let wait = match self.next_trigger() {
                Some(trigger) => trigger
                    .duration_since(SystemTime::now())
                    .unwrap_or(Duration::ZERO),
                // Nothing queued; sleep until an add kicks us.
                None => Duration::from_secs(3600),
            };
            tokio::select! {
                _ = stop.stopped() => {
                    stop.acknowledge();
                    return;
                }
                _ = self.kick.notified() => {}
                _ = tokio::time::sleep(wait) => {
                    self.fire_due(SystemTime::now(), &mut rand::thread_rng());
                }
            }
        }
    }

    fn initial_trigger<R: Rng>(
        &self,
        lease: Option<Duration>,
        lease_end: Option<SystemTime>,
        now: SystemTime,
        rng: &mut R,
    ) -> SystemTime {
        let replayed = match lease {
            None => true,
            Some(l) => l > self.message_life,
        };
        if replayed {
            self.replay_trigger(now, rng, lease_end)
        } else {
            lease_end.expect("finite lease has an end")
        }
    }

    /// A replay trigger spread over the retention window, never past
    /// the lease end.
    fn replay_trigger<R: Rng>(
        &self,
        now: SystemTime,
        rng: &mut R,
        lease_end: Option<SystemTime>,
    ) -> SystemTime {
        let low = self.message_life / 2;
        let high = self.message_life * 9 / 10;
        let drawn = now + random_duration(rng, low, high);
        match lease_end {
            Some(end) if drawn > end => end,
            _ => drawn,
        }
    }

    fn persist(&self, message: &LeaseMessage) {
        let channel_key = message.channel.to_string();
        let data = bincode::serialize(message).expect("lease serializes");
        self.kv.map_set(
            &format!("leases/{channel_key}"),
            &hex::encode(message.fingerprint()),
            Record::new(LEASE_VERSION, data),
        );
        let id = bincode::serialize(&message.channel).expect("id serializes");
        self.kv
            .map_set(CHANNELS_MAP, &channel_key, Record::new(LEASE_VERSION, id));
    }

    fn unpersist(&self, message: &LeaseMessage) {
        let channel_key = message.channel.to_string();
        let map = format!("leases/{channel_key}");
        self.kv.map_delete(&map, &hex::encode(message.fingerprint()));
        if self.kv.map_elements(&map).is_empty() {
            self.kv.map_delete(CHANNELS_MAP, &channel_key);
        }
    }
}

fn random_duration<R: Rng>(rng: &mut R, low: Duration, high: Duration) -> Duration {
    if high <= low {
        warn!("degenerate trigger window");
        return low;
    }
    Duration::from_millis(rng.gen_range(low.as_millis() as u64..=high.as_millis() as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_common::IdKind;
    use rand::SeedableRng;

    const HOUR: Duration = Duration::from_secs(3600);

    fn channel(seed: u64) -> Id {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Id::random(&mut rng, IdKind::Group)
    }

    fn scheduler(kv: Kv) -> (
        std::sync::Arc<LeaseScheduler>,
        mpsc::UnboundedReceiver<LeaseEvent>,
    ) {
        LeaseScheduler::load(kv, MESSAGE_LIFE).unwrap()
    }

    #[tokio::test]
    async fn long_lease_replays_inside_the_spread_window() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(41);
        let now = SystemTime::now();
        s.add_at(
            channel(1),
            ChannelAction::Pin,
            b"pin msg".to_vec(),
            now,
            Some(1000 * HOUR),
            now,
            &mut rng,
        );
        let pending = s.get(&channel(1), &ChannelAction::Pin, b"pin msg").unwrap();
        assert!(pending.lease_trigger >= now + 250 * HOUR);
        assert!(pending.lease_trigger <= now + 450 * HOUR);

        s.fire_due(pending.lease_trigger, &mut rng);
        match events.try_recv().unwrap() {
            LeaseEvent::Replay(m) => {
                assert_eq!(m.original_timestamp, now);
                assert_eq!(m.lease_end, Some(now + 1000 * HOUR));
            }
            other => panic!("expected replay, got {other:?}"),
        }
        // Rescheduled, not removed.
        assert_eq!(s.len(), 1);
        let next = s.get(&channel(1), &ChannelAction::Pin, b"pin msg").unwrap();
        assert!(next.lease_trigger > pending.lease_trigger);
    }

    #[tokio::test]
    async fn short_lease_fires_undo_at_lease_end() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let now = SystemTime::now();
        s.add_at(
            channel(2),
            ChannelAction::Mute,
            b"user".to_vec(),
            now,
            Some(Duration::from_secs(600)),
            now,
            &mut rng,
        );
        let pending = s.get(&channel(2), &ChannelAction::Mute, b"user").unwrap();
        assert_eq!(pending.lease_trigger, now + Duration::from_secs(600));

        s.fire_due(now + Duration::from_secs(599), &mut rng);
        assert!(events.try_recv().is_err());
        s.fire_due(now + Duration::from_secs(600), &mut rng);
        assert!(matches!(events.try_recv().unwrap(), LeaseEvent::Undo(_)));
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn replay_clamps_to_lease_end_then_undoes() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(43);
        let now = SystemTime::now();
        // Long enough to replay once; the reschedule must clamp.
        s.add_at(
            channel(3),
            ChannelAction::Hide,
            b"msg".to_vec(),
            now,
            Some(600 * HOUR),
            now,
            &mut rng,
        );
        s.fire_due(now + 450 * HOUR, &mut rng);
        assert!(matches!(events.try_recv().unwrap(), LeaseEvent::Replay(_)));
        let pending = s.get(&channel(3), &ChannelAction::Hide, b"msg").unwrap();
        assert_eq!(pending.lease_trigger, now + 600 * HOUR);

        s.fire_due(now + 600 * HOUR, &mut rng);
        assert!(matches!(events.try_recv().unwrap(), LeaseEvent::Undo(_)));
        assert!(s.is_empty());
    }

    #[tokio::test]
    async fn indefinite_lease_replays_forever() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(44);
        let now = SystemTime::now();
        s.add_at(
            channel(4),
            ChannelAction::Pin,
            b"forever".to_vec(),
            now,
            None,
            now,
            &mut rng,
        );
        let mut at = now;
        for _ in 0..3 {
            at = s.get(&channel(4), &ChannelAction::Pin, b"forever")
                .unwrap()
                .lease_trigger
                .max(at);
            s.fire_due(at, &mut rng);
            assert!(matches!(events.try_recv().unwrap(), LeaseEvent::Replay(_)));
        }
        assert_eq!(s.len(), 1);
    }

    #[tokio::test]
    async fn duplicate_action_replaces_the_lease() {
        let (s, _events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(45);
        let now = SystemTime::now();
        for _ in 0..2 {
            s.add_at(
                channel(5),
                ChannelAction::Delete,
                b"dup".to_vec(),
                now,
                Some(HOUR),
                now,
                &mut rng,
            );
        }
        assert_eq!(s.len(), 1);
    }

    #[tokio::test]
    async fn triggers_fire_in_order() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(46);
        let now = SystemTime::now();
        s.add_at(channel(6), ChannelAction::Mute, b"b".to_vec(), now, Some(2 * HOUR), now, &mut rng);
        s.add_at(channel(6), ChannelAction::Mute, b"a".to_vec(), now, Some(HOUR), now, &mut rng);
        s.fire_due(now + 3 * HOUR, &mut rng);
        let first = match events.try_recv().unwrap() {
            LeaseEvent::Undo(m) => m,
            other => panic!("expected undo, got {other:?}"),
        };
        let second = match events.try_recv().unwrap() {
            LeaseEvent::Undo(m) => m,
            other => panic!("expected undo, got {other:?}"),
        };
        assert_eq!(first.payload, b"a");
        assert_eq!(second.payload, b"b");
    }

    #[tokio::test]
    async fn stale_triggers_reschedule_on_load() {
        let kv = Kv::in_memory();
        {
            let (s, _events) = scheduler(kv.clone());
            let mut rng = rand::rngs::StdRng::seed_from_u64(47);
            let past = SystemTime::now() - 20 * HOUR;
            s.add_at(
                channel(7),
                ChannelAction::Pin,
                b"old".to_vec(),
                past,
                Some(10 * HOUR),
                past,
                &mut rng,
            );
        }
        let now = SystemTime::now();
        let (restored, _events) = scheduler(kv);
        let pending = restored
            .get(&channel(7), &ChannelAction::Pin, b"old")
            .unwrap();
        assert!(pending.lease_trigger >= now + Duration::from_secs(5 * 60));
        assert!(pending.lease_trigger <= now + Duration::from_secs(31 * 60));
    }

    #[tokio::test]
    async fn removed_lease_never_fires() {
        let (s, mut events) = scheduler(Kv::in_memory());
        let mut rng = rand::rngs::StdRng::seed_from_u64(48);
        let now = SystemTime::now();
        s.add_at(
            channel(8),
            ChannelAction::Hide,
            b"gone".to_vec(),
            now,
            Some(HOUR),
            now,
            &mut rng,
        );
        s.remove(&channel(8), &ChannelAction::Hide, b"gone");
        s.remove(&channel(8), &ChannelAction::Hide, b"gone");
        s.fire_due(now + 2 * HOUR, &mut rng);
        assert!(events.try_recv().is_err());
        assert!(s.is_empty());
    }
}
