// Copyright (c) 2025 The Haze Project

//! Session negotiation.
//!
//! A background worker sweeps every partner for sessions needing
//! negotiation, seals a trigger carrying the fresh public element, and
//! transmits it. The partner answers with a confirm, which moves the
//! session to its working state. Failed sends regress the session so
//! the next sweep retries.

use crate::error::{E2eError, Result};
use crate::ratchet::Ratchet;
use crate::session::SessionId;
use async_trait::async_trait;
use haze_common::{Id, StopToken};
use haze_crypto::KeyFingerprint;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// The plaintext inside every end-to-end encrypted message.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum E2ePayload {
    /// Application data.
    Data(Vec<u8>),
    /// Announces a freshly negotiated session; carries its group-encoded
    /// public element.
    Trigger { new_public: Vec<u8> },
    /// Acknowledges a trigger; the named session is now live.
    Confirm { session: SessionId },
}

/// One sealed message ready for the mixnet.
#[derive(Clone, Debug)]
pub struct WireMessage {
    pub recipient: Id,
    pub fingerprint: KeyFingerprint,
    pub mac_key: [u8; 32],
    pub contents: Vec<u8>,
}

/// The delivery seam: the client implements this over its transmission
/// pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, message: WireMessage) -> Result<()>;
}

/// Prefix a ciphertext with its length so it survives the zero padding
/// of a fixed-width mixnet slot.
pub fn frame(ciphertext: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + ciphertext.len());
    out.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
    out.extend_from_slice(ciphertext);
    out
}

/// Recover the ciphertext from padded slot contents.
pub fn unframe(contents: &[u8]) -> Result<&[u8]> {
    if contents.len() < 4 {
        return Err(E2eError::Malformed("framed contents too short".into()));
    }
    let len = u32::from_le_bytes(contents[..4].try_into().expect("4 bytes")) as usize;
    contents
        .get(4..4 + len)
        .ok_or_else(|| E2eError::Malformed("frame length exceeds contents".into()))
}

/// How often the worker sweeps when nothing kicks it sooner.
pub const REKEY_SWEEP_PERIOD: Duration = Duration::from_secs(30);

/// How soon a sweep with failed deliveries is retried.
const RETRY_PERIOD: Duration = Duration::from_secs(2);

/// Drive session negotiation until stopped. Each pass transmits queued
/// confirms, then triggers for every session awaiting negotiation.
pub async fn run_rekey(
    ratchet: Arc<Ratchet>,
    transport: Arc<dyn Transport>,
    period: Duration,
    mut stop: StopToken,
) {
    let mut next = period;
    loop {
        tokio::select! {
            _ = stop.stopped() => {
                stop.acknowledge();
                return;
            }
            _ = ratchet.rekey_kick().notified() => {}
            _ = tokio::time::sleep(next) => {}
        }
        let clean = sweep(&ratchet, transport.as_ref()).await;
        next = if clean { period } else { RETRY_PERIOD.min(period) };
    }
}

/// One negotiation pass, exposed for tests. Returns false when any
/// delivery failed and is awaiting retry.
pub async fn sweep(ratchet: &Ratchet, transport: &dyn Transport) -> bool {
    let mut clean = true;
    for (partner, session, message) in ratchet.sealed_confirms() {
        if let Err(e) = transport.deliver(message).await {
            warn!(partner = %partner, session = %session, error = %e,
                "confirm delivery failed");
            ratchet.requeue_confirm(partner, session);
            clean = false;
        }
    }
    for (session, message) in ratchet.sealed_triggers() {
        let recipient = message.recipient;
        match transport.deliver(message).await {
            Ok(()) => {
                debug!(partner = %recipient, session = %session, "trigger delivered");
                ratchet.trigger_sent(&recipient, &session);
            }
            Err(e) => {
                warn!(partner = %recipient, session = %session, error = %e,
                    "trigger delivery failed");
                ratchet.trigger_failed(&recipient, &session);
                clean = false;
            }
        }
    }
    clean
}
