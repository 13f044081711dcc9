// Copyright (c) 2025 The Haze Project

//! Rounds whose mailbox pickup failed.
//!
//! Each failed pickup lands here and is retried on a capped exponential
//! backoff. Entries that exhaust the schedule are kept (so history
//! survives a restart) but never retried again; only a successful
//! pickup removes one.

use haze_common::{EphemeralId, Id};
use haze_connection::RoundId;
use haze_storage::{Kv, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

const UNCHECKED_VERSION: u64 = 1;
const UNCHECKED_MAP: &str = "unchecked";

/// Checks beyond this are never scheduled.
pub const CAPPED_TRIES: u32 = 7;

/// Delay before check n+1, indexed by checks already made minus one.
pub const BACKOFF: [Duration; CAPPED_TRIES as usize] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(5 * 60),
    Duration::from_secs(30 * 60),
    Duration::from_secs(3 * 3600),
    Duration::from_secs(12 * 3600),
    Duration::from_secs(24 * 3600),
];

/// One round awaiting a pickup retry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UncheckedRound {
    pub round_id: RoundId,
    pub ephemeral_id: EphemeralId,
    pub source: Id,
    pub num_checks: u32,
    pub last_check: SystemTime,
}

impl UncheckedRound {
    /// When the next check is allowed, or `None` past the cap.
    pub fn next_check(&self) -> Option<SystemTime> {
        if self.num_checks >= CAPPED_TRIES {
            return None;
        }
        let idx = (self.num_checks.max(1) - 1) as usize;
        Some(self.last_check + BACKOFF[idx])
    }
}

pub struct UncheckedStore {
    kv: Kv,
    rounds: Mutex<HashMap<(RoundId, EphemeralId), UncheckedRound>>,
}

impl UncheckedStore {
    pub fn load(kv: Kv) -> Self {
        let mut rounds = HashMap::new();
        for (element, record) in kv.map_elements(UNCHECKED_MAP) {
            match bincode::deserialize::<UncheckedRound>(&record.data) {
                Ok(r) => {
                    rounds.insert((r.round_id, r.ephemeral_id), r);
                }
                Err(e) => warn!(element, error = %e, "dropping unreadable unchecked round"),
            }
        }
        UncheckedStore {
            kv,
            rounds: Mutex::new(rounds),
        }
    }

    /// Record a failed first pickup. Re-adding an existing entry is a
    /// no-op; its retry schedule is already running.
    pub fn add(&self, round_id: RoundId, ephemeral_id: EphemeralId, source: Id, now: SystemTime) {
        let mut rounds = self.rounds.lock().unwrap();
        if rounds.contains_key(&(round_id, ephemeral_id)) {
            return;
        }
        let entry = UncheckedRound {
            round_id,
            ephemeral_id,
            source,
            num_checks: 1,
            last_check: now,
        };
        self.persist(&entry);
        debug!(round = round_id.0, "round marked unchecked");
        rounds.insert((round_id, ephemeral_id), entry);
    }

    /// Entries whose backoff has elapsed at `now`.
    pub fn due(&self, now: SystemTime) -> Vec<UncheckedRound> {
        self.rounds
            .lock()
            .unwrap()
            .values()
            .filter(|r| matches!(r.next_check(), Some(at) if at <= now))
            .cloned()
            .collect()
    }

    /// Record another failed check, advancing the backoff.
    pub fn record_check(&self, round_id: RoundId, ephemeral_id: EphemeralId, now: SystemTime) {
        let mut rounds = self.rounds.lock().unwrap();
        if let Some(entry) = rounds.get_mut(&(round_id, ephemeral_id)) {
            entry.num_checks = (entry.num_checks + 1).min(CAPPED_TRIES);
            entry.last_check = now;
            if entry.num_checks == CAPPED_TRIES {
                warn!(round = round_id.0, "unchecked round retries exhausted");
            }
            let entry = entry.clone();
            drop(rounds);
            self.persist(&entry);
        }
    }

    /// A successful pickup removes the entry.
    pub fn remove(&self, round_id: RoundId, ephemeral_id: EphemeralId) {
        self.rounds.lock().unwrap().remove(&(round_id, ephemeral_id));
        self.kv
            .map_delete(UNCHECKED_MAP, &element_key(round_id, ephemeral_id));
    }

    pub fn get(&self, round_id: RoundId, ephemeral_id: EphemeralId) -> Option<UncheckedRound> {
        self.rounds
            .lock()
            .unwrap()
            .get(&(round_id, ephemeral_id))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rounds.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.lock().unwrap().is_empty()
    }

    fn persist(&self, entry: &UncheckedRound) {
        let data = bincode::serialize(entry).expect("unchecked round serializes");
        self.kv.map_set(
            UNCHECKED_MAP,
            &element_key(entry.round_id, entry.ephemeral_id),
            Record::new(UNCHECKED_VERSION, data),
        );
    }
}

fn element_key(round_id: RoundId, ephemeral_id: EphemeralId) -> String {
    format!("{}/{}", round_id.0, ephemeral_id.value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_common::IdKind;
    use rand::SeedableRng;

    fn source() -> Id {
        let mut rng = rand::rngs::StdRng::seed_from_u64(31);
        Id::random(&mut rng, IdKind::User)
    }

    #[test]
    fn first_failure_schedules_after_ten_seconds() {
        let store = UncheckedStore::load(Kv::in_memory());
        let t0 = SystemTime::now();
        store.add(RoundId(5), EphemeralId(9), source(), t0);
        let entry = store.get(RoundId(5), EphemeralId(9)).unwrap();
        assert_eq!(entry.num_checks, 1);
        assert_eq!(entry.last_check, t0);
        assert!(store.due(t0 + Duration::from_secs(9)).is_empty());
        assert_eq!(store.due(t0 + Duration::from_secs(10)).len(), 1);
    }

    #[test]
    fn backoff_advances_per_check() {
        let store = UncheckedStore::load(Kv::in_memory());
        let t0 = SystemTime::now();
        store.add(RoundId(5), EphemeralId(9), source(), t0);
        let t1 = t0 + Duration::from_secs(10);
        store.record_check(RoundId(5), EphemeralId(9), t1);
        assert!(store.due(t1 + Duration::from_secs(29)).is_empty());
        assert_eq!(store.due(t1 + Duration::from_secs(30)).len(), 1);
    }

    #[test]
    fn capped_entry_is_retained_but_never_due() {
        let store = UncheckedStore::load(Kv::in_memory());
        let mut now = SystemTime::now();
        store.add(RoundId(5), EphemeralId(9), source(), now);
        for _ in 0..CAPPED_TRIES {
            now += Duration::from_secs(25 * 3600);
            store.record_check(RoundId(5), EphemeralId(9), now);
        }
        assert_eq!(store.len(), 1);
        assert!(store.due(now + Duration::from_secs(48 * 3600)).is_empty());
    }

    #[test]
    fn success_removes_and_reload_preserves() {
        let kv = Kv::in_memory();
        let t0 = SystemTime::now();
        {
            let store = UncheckedStore::load(kv.clone());
            store.add(RoundId(5), EphemeralId(9), source(), t0);
            store.add(RoundId(6), EphemeralId(9), source(), t0);
            store.remove(RoundId(5), EphemeralId(9));
        }
        let reloaded = UncheckedStore::load(kv);
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.get(RoundId(6), EphemeralId(9)).is_some());
    }
}
