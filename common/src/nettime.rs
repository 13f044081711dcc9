// Copyright (c) 2025 The Haze Project

//! Skew-corrected network time.
//!
//! Gateways report their view of the clock offset on every poll. The
//! samples are clamped and aggregated into a median, and `now()` applies
//! the result so round timing lines up with the network rather than the
//! local clock.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime},
};
use tracing::debug;

/// Samples retained for the running median.
const MAX_SAMPLES: usize = 50;

#[derive(Debug)]
struct Inner {
    /// Applied offset in milliseconds; positive means the network clock
    /// runs ahead of ours.
    offset_ms: AtomicI64,
    samples: Mutex<VecDeque<i64>>,
    clamp_ms: i64,
}

/// Shared clock handle. Cheap to clone; all clones see the same offset.
#[derive(Clone, Debug)]
pub struct NetTime {
    inner: Arc<Inner>,
}

impl NetTime {
    /// A clock that clamps individual skew samples to `clamp`.
    pub fn new(clamp: Duration) -> Self {
        NetTime {
            inner: Arc::new(Inner {
                offset_ms: AtomicI64::new(0),
                samples: Mutex::new(VecDeque::with_capacity(MAX_SAMPLES)),
                clamp_ms: clamp.as_millis() as i64,
            }),
        }
    }

    /// Current time with the aggregated skew applied.
    pub fn now(&self) -> SystemTime {
        let offset = self.inner.offset_ms.load(Ordering::Relaxed);
        if offset >= 0 {
            SystemTime::now() + Duration::from_millis(offset as u64)
        } else {
            SystemTime::now() - Duration::from_millis((-offset) as u64)
        }
    }

    /// The offset currently in force, in milliseconds.
    pub fn offset_ms(&self) -> i64 {
        self.inner.offset_ms.load(Ordering::Relaxed)
    }

    /// Fold in a gateway-reported skew sample (milliseconds).
    pub fn record_skew(&self, sample_ms: i64) {
        let clamped = sample_ms.clamp(-self.inner.clamp_ms, self.inner.clamp_ms);
        let median = {
            let mut samples = self.inner.samples.lock().expect("skew samples lock");
            if samples.len() == MAX_SAMPLES {
                samples.pop_front();
            }
            samples.push_back(clamped);
            let mut sorted: Vec<i64> = samples.iter().copied().collect();
            sorted.sort_unstable();
            sorted[sorted.len() / 2]
        };
        let prev = self.inner.offset_ms.swap(median, Ordering::Relaxed);
        if prev != median {
            debug!(prev, median, "clock skew offset updated");
        }
    }
}
