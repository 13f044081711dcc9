// Copyright (c) 2025 The Haze Project

//! Rolling estimate of how many round attempts a send needs.
//!
//! Probe sends record how many rounds they burned before succeeding;
//! ordinary sends size their effort from the rolling mean. Too little
//! data falls back to a fixed default.

use std::collections::VecDeque;
use std::sync::Mutex;

const WINDOW: usize = 50;
const MIN_SAMPLES: usize = 5;
const DEFAULT_ATTEMPTS: u32 = 4;

/// Tracks probe attempt counts and answers "how many tries are optimal".
pub struct AttemptTracker {
    samples: Mutex<VecDeque<u32>>,
}

impl AttemptTracker {
    pub fn new() -> Self {
        AttemptTracker {
            samples: Mutex::new(VecDeque::with_capacity(WINDOW)),
        }
    }

    /// Record the attempt count of a completed probe send.
    pub fn record(&self, attempts: u32) {
        let mut samples = self.samples.lock().unwrap();
        if samples.len() == WINDOW {
            samples.pop_front();
        }
        samples.push_back(attempts);
    }

    /// The rolling mean, rounded up, or the default when data is thin.
    pub fn optimal_attempts(&self) -> u32 {
        let samples = self.samples.lock().unwrap();
        if samples.len() < MIN_SAMPLES {
            return DEFAULT_ATTEMPTS;
        }
        let sum: u64 = samples.iter().map(|&a| a as u64).sum();
        sum.div_ceil(samples.len() as u64) as u32
    }
}

impl Default for AttemptTracker {
    fn default() -> Self {
        Self::new()
    }
}
