// Copyright (c) 2025 The Haze Project

//! Cooperative shutdown for the follower's long-running tasks.
//!
//! Every task receives a [`StopToken`] and must treat each await point as
//! a place it can be asked to unwind. A [`StopGroup`] composes the
//! stoppers into a shutdown tree: `stop_all` signals every member and
//! waits up to the deadline, logging any task that fails to report
//! stopped in time.

use std::{
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::watch;
use tracing::{debug, warn};

/// Lifecycle of a stoppable task.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum TaskStatus {
    /// Running normally
    Running = 0,
    /// Stop requested, not yet acknowledged
    Stopping = 1,
    /// Task has unwound
    Stopped = 2,
}

#[derive(Debug)]
struct Shared {
    name: String,
    status: AtomicU8,
}

/// Held by the supervisor; requests and observes shutdown of one task.
#[derive(Debug)]
pub struct Stopper {
    shared: Arc<Shared>,
    quit_tx: watch::Sender<bool>,
    stopped_rx: watch::Receiver<bool>,
}

/// Held by the task; observed at every suspension point.
#[derive(Clone, Debug)]
pub struct StopToken {
    shared: Arc<Shared>,
    quit_rx: watch::Receiver<bool>,
    stopped_tx: watch::Sender<bool>,
}

/// Create a linked stopper/token pair named for the task it controls.
pub fn stoppable(name: impl Into<String>) -> (Stopper, StopToken) {
    let shared = Arc::new(Shared {
        name: name.into(),
        status: AtomicU8::new(TaskStatus::Running as u8),
    });
    let (quit_tx, quit_rx) = watch::channel(false);
    let (stopped_tx, stopped_rx) = watch::channel(false);
    (
        Stopper {
            shared: Arc::clone(&shared),
            quit_tx,
            stopped_rx,
        },
        StopToken {
            shared,
            quit_rx,
            stopped_tx,
        },
    )
}

impl Stopper {
    /// The task name this stopper controls.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Current task status.
    pub fn status(&self) -> TaskStatus {
        match self.shared.status.load(Ordering::Acquire) {
            0 => TaskStatus::Running,
            1 => TaskStatus::Stopping,
            _ => TaskStatus::Stopped,
        }
    }

    /// Signal the task to stop and wait for acknowledgement.
    ///
    /// Returns false if the task missed the deadline.
    pub async fn stop(&self, deadline: Duration) -> bool {
        self.shared
            .status
            .compare_exchange(
                TaskStatus::Running as u8,
                TaskStatus::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .ok();
        let _ = self.quit_tx.send(true);
        let mut rx = self.stopped_rx.clone();
        let acknowledged = tokio::time::timeout(deadline, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    // Token dropped entirely; the task is gone.
                    break;
                }
            }
        })
        .await
        .is_ok();
        if acknowledged {
            self.shared
                .status
                .store(TaskStatus::Stopped as u8, Ordering::Release);
            debug!(task = %self.shared.name, "task stopped");
        } else {
            warn!(task = %self.shared.name, "task did not stop within deadline");
        }
        acknowledged
    }
}

impl StopToken {
    /// The controlling task's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether a stop has been requested.
    pub fn is_stopped(&self) -> bool {
        *self.quit_rx.borrow()
    }

    /// Resolve when a stop is requested.
    pub async fn stopped(&mut self) {
        while !*self.quit_rx.borrow() {
            if self.quit_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Report that the task has unwound. Called on every exit path.
    pub fn acknowledge(&self) {
        self.shared
            .status
            .store(TaskStatus::Stopped as u8, Ordering::Release);
        let _ = self.stopped_tx.send(true);
    }
}

/// A tree of stoppers shut down as a unit.
#[derive(Debug, Default)]
pub struct StopGroup {
    members: Vec<Stopper>,
}

impl StopGroup {
    /// An empty group.
    pub fn new() -> Self {
        StopGroup::default()
    }

    /// Add a member to shut down with the group.
    pub fn push(&mut self, stopper: Stopper) {
        self.members.push(stopper);
    }

    /// Number of members.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the group has no members.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Stop every member, returning the names of tasks that missed the
    /// deadline.
    pub async fn stop_all(&self, deadline: Duration) -> Vec<String> {
        let mut stuck = Vec::new();
        for member in &self.members {
            if !member.stop(deadline).await {
                stuck.push(member.name().to_string());
            }
        }
        stuck
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STOP_DEADLINE: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn stop_is_observed_and_acknowledged() {
        let (stopper, mut token) = stoppable("worker");
        let handle = tokio::spawn(async move {
            token.stopped().await;
            token.acknowledge();
        });
        assert!(stopper.stop(STOP_DEADLINE).await);
        assert_eq!(stopper.status(), TaskStatus::Stopped);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unresponsive_task_is_reported_stuck() {
        let (stopper, _token) = stoppable("stuck");
        let mut group = StopGroup::new();
        group.push(stopper);
        let stuck = group.stop_all(Duration::from_millis(50)).await;
        assert_eq!(stuck, vec!["stuck".to_string()]);
    }

    #[tokio::test]
    async fn dropped_token_counts_as_stopped() {
        let (stopper, token) = stoppable("dropper");
        token.acknowledge();
        drop(token);
        assert!(stopper.stop(STOP_DEADLINE).await);
    }
}
