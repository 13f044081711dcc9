// Copyright (c) 2025 The Haze Project

//! Tracked reception identities.
//!
//! The client listens as a set of ephemeral ids derived from its real
//! identities. The tracker owns that set, rotates it with the clock and
//! the network's address-space size, prunes expired identities, and
//! synthesizes a fake identity when there is no real one so the poll
//! traffic never goes quiet.

use haze_common::{window_at, Id, IdKind, IdentityWindow};
use haze_connection::RoundId;
use haze_storage::{Kv, Record};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, info};

const IDENTITY_VERSION: u64 = 1;
const IDENTITIES_MAP: &str = "identities";

/// How far behind head the fake identity polls, in rounds.
const FAKE_POLL_DEPTH: u64 = 800;

/// One identity the client receives as.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TrackedIdentity {
    pub source: Id,
    /// Expiry; `None` tracks until removed.
    pub valid_until: Option<SystemTime>,
    /// Persistent identities survive a restart.
    pub persistent: bool,
}

/// A receiver the follower should poll for this cycle.
#[derive(Clone, Debug)]
pub struct Receiver {
    pub window: IdentityWindow,
    /// Fake receivers exist only as cover traffic; their messages are
    /// discarded without decryption attempts.
    pub fake: bool,
}

pub struct IdentityTracker {
    kv: Kv,
    address_space_bits: AtomicU8,
    identities: Mutex<Vec<TrackedIdentity>>,
}

impl IdentityTracker {
    /// Load persistent identities from storage.
    pub fn load(kv: Kv, address_space_bits: u8) -> Self {
        let mut identities = Vec::new();
        for (element, record) in kv.map_elements(IDENTITIES_MAP) {
            match bincode::deserialize::<TrackedIdentity>(&record.data) {
                Ok(identity) => identities.push(identity),
                Err(e) => {
                    debug!(element, error = %e, "dropping unreadable identity record")
                }
            }
        }
        info!(loaded = identities.len(), "tracked identities loaded");
        IdentityTracker {
            kv,
            address_space_bits: AtomicU8::new(address_space_bits),
            identities: Mutex::new(identities),
        }
    }

    /// Track a new identity. Adding an already-tracked id refreshes its
    /// expiry and persistence flag.
    pub fn add(&self, source: Id, valid_until: Option<SystemTime>, persistent: bool) {
        let identity = TrackedIdentity {
            source,
            valid_until,
            persistent,
        };
        if persistent {
            let data = bincode::serialize(&identity).expect("identity serializes");
            self.kv.map_set(
                IDENTITIES_MAP,
                &source.to_string(),
                Record::new(IDENTITY_VERSION, data),
            );
        }
        let mut identities = self.identities.lock().unwrap();
        identities.retain(|i| i.source != source);
        identities.push(identity);
    }

    /// Stop tracking an identity. Removing an unknown id is a no-op.
    pub fn remove(&self, source: &Id) {
        self.kv.map_delete(IDENTITIES_MAP, &source.to_string());
        self.identities
            .lock()
            .unwrap()
            .retain(|i| i.source != *source);
    }

    pub fn is_tracked(&self, source: &Id) -> bool {
        self.identities
            .lock()
            .unwrap()
            .iter()
            .any(|i| i.source == *source)
    }

    /// Update the address-space size announced by gateways. Widening the
    /// space changes every derived ephemeral id on the next cycle.
    pub fn set_address_space(&self, bits: u8) {
        let old = self.address_space_bits.swap(bits, Ordering::AcqRel);
        if old != bits {
            info!(from = old, to = bits, "address space resized");
        }
    }

    pub fn address_space(&self) -> u8 {
        self.address_space_bits.load(Ordering::Acquire)
    }

    /// The receivers to poll for right now. Expired identities are
    /// pruned as a side effect. Falls back to one fake receiver when
    /// nothing real is tracked.
    pub fn active_receivers<R: rand::RngCore>(
        &self,
        now: SystemTime,
        rng: &mut R,
    ) -> Vec<Receiver> {
        let bits = self.address_space();
        let mut expired = Vec::new();
        let receivers: Vec<Receiver> = {
            let mut identities = self.identities.lock().unwrap();
            identities.retain(|i| match i.valid_until {
                Some(until) if until <= now => {
                    expired.push(i.source);
                    false
                }
                _ => true,
            });
            identities
                .iter()
                .map(|i| Receiver {
                    window: window_at(&i.source, bits, now),
                    fake: false,
                })
                .collect()
        };
        for source in expired {
            self.kv.map_delete(IDENTITIES_MAP, &source.to_string());
            debug!(identity = %source, "tracked identity expired");
        }
        if receivers.is_empty() {
            let fake = Id::random(rng, IdKind::Ephemeral);
            return vec![Receiver {
                window: window_at(&fake, bits, now),
                fake: true,
            }];
        }
        receivers
    }

    /// A random historical round for the fake receiver to poll, drawn
    /// from the depth window behind head.
    pub fn fake_poll_round<R: rand::RngCore>(&self, head: RoundId, rng: &mut R) -> RoundId {
        let depth = FAKE_POLL_DEPTH.min(head.0);
        if depth == 0 {
            return head;
        }
        RoundId(head.0 - rng.next_u64() % depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use std::time::Duration;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(77)
    }

    #[test]
    fn expired_identities_are_pruned() {
        let tracker = IdentityTracker::load(Kv::in_memory(), 16);
        let mut rng = rng();
        let id = Id::random(&mut rng, IdKind::User);
        let now = SystemTime::now();
        tracker.add(id, Some(now + Duration::from_secs(60)), false);
        assert!(!tracker.active_receivers(now, &mut rng)[0].fake);
        let later = now + Duration::from_secs(120);
        assert!(tracker.active_receivers(later, &mut rng)[0].fake);
        assert!(!tracker.is_tracked(&id));
    }

    #[test]
    fn remove_is_idempotent() {
        let tracker = IdentityTracker::load(Kv::in_memory(), 16);
        let mut rng = rng();
        let id = Id::random(&mut rng, IdKind::User);
        tracker.add(id, None, false);
        tracker.remove(&id);
        tracker.remove(&id);
        assert!(!tracker.is_tracked(&id));
    }

    #[test]
    fn persistent_identities_survive_reload() {
        let kv = Kv::in_memory();
        let mut rng = rng();
        let keep = Id::random(&mut rng, IdKind::User);
        let drop_ = Id::random(&mut rng, IdKind::User);
        {
            let tracker = IdentityTracker::load(kv.clone(), 16);
            tracker.add(keep, None, true);
            tracker.add(drop_, None, false);
        }
        let reloaded = IdentityTracker::load(kv, 16);
        assert!(reloaded.is_tracked(&keep));
        assert!(!reloaded.is_tracked(&drop_));
    }

    #[test]
    fn fake_poll_round_stays_behind_head() {
        let tracker = IdentityTracker::load(Kv::in_memory(), 16);
        let mut rng = rng();
        for _ in 0..100 {
            let r = tracker.fake_poll_round(RoundId(10_000), &mut rng);
            assert!(r.0 > 10_000 - FAKE_POLL_DEPTH && r.0 <= 10_000);
        }
        assert_eq!(tracker.fake_poll_round(RoundId(0), &mut rng), RoundId(0));
    }
}
