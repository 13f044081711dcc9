// Copyright (c) 2025 The Haze Project

//! Tunable parameters for the send pipeline and follower.

use haze_common::Id;
use haze_connection::RoundId;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Parameters for one send call.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CmixParams {
    /// Rounds to try before giving up.
    pub round_tries: u32,
    /// Total time budget for the send.
    pub timeout: Duration,
    /// Per-RPC timeout.
    pub send_timeout: Duration,
    /// Margin a round's realtime start must leave for the upload.
    pub send_time_buffer: Duration,
    /// Nodes the caller refuses to route through.
    pub blacklisted_nodes: HashSet<Id>,
    /// Rounds the caller refuses to use.
    pub excluded_rounds: HashSet<RoundId>,
    /// Free-form tag carried into send logs.
    pub debug_tag: String,
    /// Probe sends feed the attempt tracker instead of consulting it.
    pub probe: bool,
    /// Set by the critical queue so its replays bypass the health gate.
    pub critical: bool,
}

impl Default for CmixParams {
    fn default() -> Self {
        CmixParams {
            round_tries: 10,
            timeout: Duration::from_secs(45),
            send_timeout: Duration::from_secs(3),
            send_time_buffer: Duration::from_millis(1000),
            blacklisted_nodes: HashSet::new(),
            excluded_rounds: HashSet::new(),
            debug_tag: String::new(),
            probe: false,
            critical: false,
        }
    }
}

/// Parameters for the reception follower.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FollowParams {
    /// Pause between follower cycles; settable at runtime.
    pub track_period: Duration,
    /// Message-retrieval workers.
    pub pickup_workers: usize,
    /// How long a round-result wait may block.
    pub round_results_timeout: Duration,
    /// Maximum tolerated gateway clock skew.
    pub clock_skew_clamp: Duration,
    /// Node-key registrations buffered before a batch flush.
    pub registration_buffer: usize,
    /// How long a partial registration batch waits before flushing.
    pub registration_delay: Duration,
}

impl Default for FollowParams {
    fn default() -> Self {
        FollowParams {
            track_period: Duration::from_millis(1000),
            pickup_workers: 4,
            round_results_timeout: Duration::from_secs(15),
            clock_skew_clamp: Duration::from_secs(300),
            registration_buffer: 8,
            registration_delay: Duration::from_millis(500),
        }
    }
}
