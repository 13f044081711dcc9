// Copyright (c) 2025 The Haze Project

//! Network-health tracking.
//!
//! The follower reports each cycle's outcome; health means gateway polls
//! are succeeding and the round tracker is advancing. Observers register
//! callbacks that fire on every transition, and async callers can park
//! on a watch channel until health is restored.

use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

pub type HealthCallback = Box<dyn Fn(bool) + Send + Sync>;

pub struct HealthMonitor {
    state: watch::Sender<bool>,
    callbacks: Mutex<Vec<HealthCallback>>,
}

impl HealthMonitor {
    /// Starts unhealthy; the first successful follower cycle flips it.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        HealthMonitor {
            state,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current health. Callbacks fire only on transitions.
    pub fn set_healthy(&self, healthy: bool) {
        let changed = self.state.send_if_modified(|state| {
            if *state == healthy {
                return false;
            }
            *state = healthy;
            true
        });
        if changed {
            info!(healthy, "network health changed");
            for cb in self.callbacks.lock().unwrap().iter() {
                cb(healthy);
            }
        }
    }

    /// Register a transition callback.
    pub fn on_change(&self, cb: impl Fn(bool) + Send + Sync + 'static) {
        self.callbacks.lock().unwrap().push(Box::new(cb));
    }

    /// A channel view of health for async waiters.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.state.subscribe()
    }

    /// Wait until the network is healthy. Returns false on timeout.
    pub async fn wait_healthy(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        tokio::time::timeout(timeout, async {
            loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    return;
                }
            }
        })
        .await
        .is_ok()
            && self.is_healthy()
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
