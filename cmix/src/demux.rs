// Copyright (c) 2025 The Haze Project

//! Received-message demultiplexing.
//!
//! Every picked-up slot is routed three ways, in order: an exact
//! fingerprint match (one-shot; consumed on successful decrypt), a
//! trial-hash against the recipient's registered services, and finally
//! the recipient's fallthrough processor. A message matching none of
//! them is counted as garbled and dropped.

use crate::error::{CmixError, Result};
use crate::message::CmixMessage;
use haze_common::Id;
use haze_connection::RoundId;
use haze_crypto::{service_tag_hash, KeyFingerprint};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};
use tracing::{debug, trace};

/// How long consumed fingerprints are remembered. Matches the network's
/// message retention window; an older message can no longer reach us.
const CONSUMED_RETENTION: Duration = Duration::from_secs(500 * 3600);

/// Handles one received message.
///
/// Returns true when the message was accepted (for fingerprint hits this
/// means the decrypt succeeded and the fingerprint must be consumed).
pub trait MessageProcessor: Send + Sync {
    fn process(&self, recipient: &Id, message: &CmixMessage, round: RoundId) -> bool;
}

/// A registered trial-hash service.
pub struct Service {
    pub tag: Vec<u8>,
    pub metadata: Vec<u8>,
    processor: Arc<dyn MessageProcessor>,
}

#[derive(Default)]
struct Tables {
    /// Global fingerprint table; a fingerprint routes to exactly one
    /// recipient and processor.
    fingerprints: HashMap<KeyFingerprint, (Id, Arc<dyn MessageProcessor>)>,
    /// Fingerprints consumed by a successful decrypt, with the time of
    /// consumption. Re-registration is rejected until the entry ages
    /// past the retention window.
    consumed: HashMap<KeyFingerprint, SystemTime>,
    services: HashMap<Id, Vec<Service>>,
    fallthrough: HashMap<Id, Arc<dyn MessageProcessor>>,
}

/// Routes received messages to their processors.
pub struct Demux {
    tables: RwLock<Tables>,
    garbled: AtomicU64,
}

impl Demux {
    pub fn new() -> Self {
        Demux {
            tables: RwLock::new(Tables::default()),
            garbled: AtomicU64::new(0),
        }
    }

    /// Register a one-shot fingerprint. Re-registering a live
    /// fingerprint is rejected; a consumed fingerprint must never
    /// return to the table under a different processor.
    pub fn add_fingerprint(
        &self,
        recipient: Id,
        fingerprint: KeyFingerprint,
        processor: Arc<dyn MessageProcessor>,
    ) -> Result<()> {
        let mut tables = self.tables.write().unwrap();
        prune_consumed(&mut tables, SystemTime::now());
        if tables.fingerprints.contains_key(&fingerprint)
            || tables.consumed.contains_key(&fingerprint)
        {
            return Err(CmixError::AlreadyExists);
        }
        tables
            .fingerprints
            .insert(fingerprint, (recipient, processor));
        Ok(())
    }

    /// Remove a fingerprint. Unknown fingerprints are a no-op.
    pub fn delete_fingerprint(&self, fingerprint: &KeyFingerprint) {
        self.tables.write().unwrap().fingerprints.remove(fingerprint);
    }

    pub fn has_fingerprint(&self, fingerprint: &KeyFingerprint) -> bool {
        self.tables
            .read()
            .unwrap()
            .fingerprints
            .contains_key(fingerprint)
    }

    pub fn fingerprint_count(&self) -> usize {
        self.tables.read().unwrap().fingerprints.len()
    }

    /// Register a trial-hash service under a recipient. Registering the
    /// same tag again replaces the processor.
    pub fn add_service(
        &self,
        recipient: Id,
        tag: Vec<u8>,
        metadata: Vec<u8>,
        processor: Arc<dyn MessageProcessor>,
    ) {
        let mut tables = self.tables.write().unwrap();
        let services = tables.services.entry(recipient).or_default();
        services.retain(|s| s.tag != tag);
        services.push(Service {
            tag,
            metadata,
            processor,
        });
    }

    /// Remove a service by tag. Unknown tags are a no-op.
    pub fn delete_service(&self, recipient: &Id, tag: &[u8]) {
        let mut tables = self.tables.write().unwrap();
        if let Some(services) = tables.services.get_mut(recipient) {
            services.retain(|s| s.tag != tag);
        }
    }

    /// Install the last-resort processor for a recipient.
    pub fn set_fallthrough(&self, recipient: Id, processor: Arc<dyn MessageProcessor>) {
        self.tables
            .write()
            .unwrap()
            .fallthrough
            .insert(recipient, processor);
    }

    /// Messages that matched nothing since startup.
    pub fn garbled_count(&self) -> u64 {
        self.garbled.load(Ordering::Relaxed)
    }

    /// Route one received message.
    pub fn handle(&self, recipient: &Id, message: &CmixMessage, round: RoundId) {
        let fingerprint = message.fingerprint();

        // Fingerprint hit: read-locked lookup, write-locked consume.
        let hit = {
            let tables = self.tables.read().unwrap();
            tables.fingerprints.get(&fingerprint).cloned()
        };
        if let Some((owner, processor)) = hit {
            if processor.process(&owner, message, round) {
                let now = SystemTime::now();
                let mut tables = self.tables.write().unwrap();
                tables.fingerprints.remove(&fingerprint);
                tables.consumed.insert(fingerprint, now);
                prune_consumed(&mut tables, now);
                trace!(%fingerprint, "fingerprint consumed");
            }
            return;
        }

        // Trial-hash against the recipient's services.
        let sih = message.sih();
        let contents = message.contents();
        let matched = {
            let tables = self.tables.read().unwrap();
            tables.services.get(recipient).and_then(|services| {
                services
                    .iter()
                    .find(|s| service_tag_hash(&s.tag, &contents) == sih)
                    .map(|s| Arc::clone(&s.processor))
            })
        };
        if let Some(processor) = matched {
            processor.process(recipient, message, round);
            return;
        }

        // Fallthrough, then garbled.
        let fallthrough = {
            let tables = self.tables.read().unwrap();
            tables.fallthrough.get(recipient).cloned()
        };
        match fallthrough {
            Some(processor) => {
                processor.process(recipient, message, round);
            }
            None => {
                self.garbled.fetch_add(1, Ordering::Relaxed);
                debug!(recipient = %recipient, round = round.0, "garbled message dropped");
            }
        }
    }
}

impl Default for Demux {
    fn default() -> Self {
        Self::new()
    }
}

fn prune_consumed(tables: &mut Tables, now: SystemTime) {
    tables.consumed.retain(|_, at| {
        now.duration_since(*at)
            .map_or(true, |age| age < CONSUMED_RETENTION)
    });
}
