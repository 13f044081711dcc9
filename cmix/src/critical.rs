// Copyright (c) 2025 The Haze Project

//! Critical messages: an at-least-once outbound queue.
//!
//! Adding a message persists it before the first delivery attempt; only
//! a confirmed round result deletes it. A restart or a health outage
//! therefore never loses a critical message, at the price of possible
//! duplicates, which receivers dedup by message id. The drain task
//! replays every retained record whenever health is restored.

use crate::error::Result;
use crate::health::HealthMonitor;
use crate::params::CmixParams;
use crate::send::{fixed, OutboundMessage, SendPipeline, SendReport};
use haze_common::StopToken;
use haze_storage::{Kv, Record};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const CRITICAL_VERSION: u64 = 1;
const CRITICAL_MAP: &str = "critical";

#[derive(Clone, Debug, Serialize, Deserialize)]
struct CriticalRecord {
    message: OutboundMessage,
    params: CmixParams,
}

/// The persistent queue. FIFO by insertion sequence.
pub struct CriticalQueue {
    kv: Kv,
    entries: Mutex<BTreeMap<u64, CriticalRecord>>,
    next_seq: AtomicU64,
    kick: Notify,
}

impl CriticalQueue {
    pub fn load(kv: Kv) -> Arc<Self> {
        let mut entries = BTreeMap::new();
        for (element, record) in kv.map_elements(CRITICAL_MAP) {
            let seq: u64 = match element.parse() {
                Ok(seq) => seq,
                Err(_) => {
                    warn!(element, "dropping critical record with bad key");
                    continue;
                }
            };
            match bincode::deserialize::<CriticalRecord>(&record.data) {
                Ok(rec) => {
                    entries.insert(seq, rec);
                }
                Err(e) => warn!(element, error = %e, "dropping unreadable critical record"),
            }
        }
        if !entries.is_empty() {
            info!(retained = entries.len(), "critical messages awaiting replay");
        }
        let next_seq = entries.keys().next_back().map_or(0, |s| s + 1);
        Arc::new(CriticalQueue {
            kv,
            entries: Mutex::new(entries),
            next_seq: AtomicU64::new(next_seq),
            kick: Notify::new(),
        })
    }

    /// Persist a message and wake the drain task.
    pub fn add(&self, message: OutboundMessage, params: CmixParams) {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let record = CriticalRecord { message, params };
        let data = bincode::serialize(&record).expect("critical record serializes");
        self.kv.map_set(
            CRITICAL_MAP,
            &seq.to_string(),
            Record::new(CRITICAL_VERSION, data),
        );
        self.entries.lock().unwrap().insert(seq, record);
        self.kick.notify_one();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }

    fn snapshot(&self) -> Vec<(u64, CriticalRecord)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .map(|(s, r)| (*s, r.clone()))
            .collect()
    }

    fn confirm(&self, seq: u64) {
        self.entries.lock().unwrap().remove(&seq);
        self.kv.map_delete(CRITICAL_MAP, &seq.to_string());
    }

    /// Attempt delivery of every retained record, oldest first. Records
    /// that fail stay queued for the next drain.
    pub async fn drain(&self, pipeline: &SendPipeline, stop: &StopToken) -> Vec<SendReport> {
        let mut delivered = Vec::new();
        for (seq, record) in self.snapshot() {
            if stop.is_stopped() {
                break;
            }
            let params = CmixParams {
                critical: true,
                ..record.params.clone()
            };
            match pipeline
                .send_cmix(fixed(record.message.clone()), &params, stop)
                .await
            {
                Ok(report) => {
                    debug!(seq, round = report.round_id.0, "critical message delivered");
                    self.confirm(seq);
                    delivered.push(report);
                }
                Err(e) => {
                    warn!(seq, error = %e, "critical message delivery failed, retained");
                }
            }
        }
        delivered
    }
}

/// Drain loop: runs a drain on every health restore and on every new
/// enqueue while healthy.
pub async fn run_critical_drain(
    queue: Arc<CriticalQueue>,
    pipeline: Arc<SendPipeline>,
    health: Arc<HealthMonitor>,
    mut stop: StopToken,
) -> Result<()> {
    let work_stop = stop.clone();
    let mut health_rx = health.subscribe();
    loop {
        tokio::select! {
            _ = stop.stopped() => {
                work_stop.acknowledge();
                return Ok(());
            }
            changed = health_rx.changed() => {
                if changed.is_err() {
                    work_stop.acknowledge();
                    return Ok(());
                }
            }
            _ = queue.kick.notified() => {}
        }
        if health.is_healthy() && !queue.is_empty() {
            queue.drain(&pipeline, &work_stop).await;
        }
    }
}
