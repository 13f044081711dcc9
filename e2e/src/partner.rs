// Copyright (c) 2025 The Haze Project

//! Per-partner session management.
//!
//! Each `(myID, partnerID)` pair owns one current send session plus any
//! superseded ones still draining, and every receive session in
//! parallel so out-of-order traffic decrypts. Sessions are stored in a
//! slab keyed by session id; everything else references them by id,
//! never by pointer.

use crate::error::{E2eError, Result};
use crate::session::{Cypher, Session, SessionId, SessionParams, SessionRecord, SessionState};
use haze_common::Id;
use haze_crypto::{generate_keypair, CyclicGroup, DhPrivateKey, DhPublicKey, KeyFingerprint};
use haze_storage::{Kv, Record};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

const PARTNER_VERSION: u64 = 1;
const PARTNER_KEY: &str = "partner";

/// A rekey the negotiation worker must transmit.
#[derive(Clone, Debug)]
pub struct PendingTrigger {
    pub partner_id: Id,
    /// The successor session being negotiated.
    pub session_id: SessionId,
    /// Its public element, group-encoded.
    pub new_public: Vec<u8>,
}

pub struct PartnerManager {
    my_id: Id,
    partner_id: Id,
    kv: Kv,
    group: CyclicGroup,
    /// Slab of all sessions, send and receive, keyed by id.
    sessions: HashMap<SessionId, Session>,
    /// Send-session ids, oldest first.
    send_order: Vec<SessionId>,
    /// Receive-session ids, oldest first.
    receive_order: Vec<SessionId>,
    send_params: SessionParams,
    receive_params: SessionParams,
}

impl PartnerManager {
    /// Establish a new partner from the initial key agreement. The
    /// first send session starts unconfirmed; its trigger is the
    /// partner's proof of liveness.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        my_id: Id,
        partner_id: Id,
        my_private: DhPrivateKey,
        partner_public: DhPublicKey,
        send_params: SessionParams,
        receive_params: SessionParams,
        group: CyclicGroup,
        kv: Kv,
    ) -> Self {
        let send = Session::new(
            &group,
            my_private.clone(),
            partner_public.clone(),
            send_params,
            SessionState::Unconfirmed,
        );
        let receive = Session::new(
            &group,
            my_private,
            partner_public,
            receive_params,
            SessionState::Confirmed,
        );
        info!(partner = %partner_id, session = %send.id(), "partner established");
        let mut manager = PartnerManager {
            my_id,
            partner_id,
            kv,
            group,
            sessions: HashMap::new(),
            send_order: vec![send.id()],
            receive_order: vec![receive.id()],
            send_params,
            receive_params,
        };
        // The initial send and receive sessions share a base key, so
        // they share a slab slot.
        let send_id = send.id();
        manager.sessions.insert(send_id, send);
        if !manager.sessions.contains_key(&receive.id()) {
            manager.sessions.insert(receive.id(), receive);
        }
        manager.persist();
        manager
    }

    pub fn my_id(&self) -> Id {
        self.my_id
    }

    pub fn partner_id(&self) -> Id {
        self.partner_id
    }

    /// The session new outbound traffic should use: the newest not yet
    /// superseded.
    pub fn current_send(&self) -> Result<SessionId> {
        self.send_order
            .iter()
            .rev()
            .find(|id| {
                self.sessions
                    .get(id)
                    .map(|s| s.usable_for_send())
                    .unwrap_or(false)
            })
            .copied()
            .ok_or(E2eError::UnknownSession)
    }

    /// Pop a send cypher from the current session.
    pub fn pop_send_key(&mut self) -> Result<Cypher> {
        let id = self.current_send()?;
        let session = self.sessions.get_mut(&id).ok_or(E2eError::UnknownSession)?;
        let cypher = session.pop_key()?;
        self.persist();
        Ok(cypher)
    }

    pub fn session_state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.get(id).map(|s| s.state())
    }

    /// Pop a key to carry the trigger negotiating `session`. The
    /// partner cannot decrypt under a session it has not learned of
    /// yet, so prefer the newest session the partner already holds; the
    /// initial session carries its own trigger, since both ends derive
    /// it from the introduction.
    pub fn pop_trigger_key(&mut self, session: &SessionId) -> Result<Cypher> {
        let carrier = self
            .send_order
            .iter()
            .rev()
            .find(|id| {
                *id != session
                    && matches!(
                        self.sessions.get(id).map(|s| s.state()),
                        Some(
                            SessionState::Confirmed
                                | SessionState::NewSessionTriggered
                                | SessionState::NewSessionCreated
                        )
                    )
            })
            .copied()
            .unwrap_or(*session);
        let cypher = self
            .sessions
            .get_mut(&carrier)
            .ok_or(E2eError::UnknownSession)?
            .pop_key()?;
        self.persist();
        Ok(cypher)
    }

    /// Collect sessions needing negotiation. Threshold-crossed sessions
    /// get their successor created here; unconfirmed sessions are
    /// retried. Every returned session moves to `Sending`.
    pub fn trigger_negotiations<R: rand::RngCore>(
        &mut self,
        rng: &mut R,
    ) -> Vec<PendingTrigger> {
        let mut pending = Vec::new();
        // Successors for threshold-crossed sessions.
        let triggered: Vec<SessionId> = self
            .send_order
            .iter()
            .filter(|id| {
                matches!(
                    self.sessions.get(id).map(|s| s.state()),
                    Some(SessionState::NewSessionTriggered)
                )
            })
            .copied()
            .collect();
        for old_id in triggered {
            let keypair = generate_keypair(&self.group, rng);
            let partner_public = self
                .sessions
                .get(&old_id)
                .expect("session in send_order")
                .partner_public()
                .clone();
            let successor = Session::new(
                &self.group,
                keypair.private,
                partner_public,
                self.send_params,
                SessionState::Unconfirmed,
            );
            debug!(partner = %self.partner_id, old = %old_id, new = %successor.id(),
                "successor session created");
            self.send_order.push(successor.id());
            self.sessions.insert(successor.id(), successor);
            if let Some(old) = self.sessions.get_mut(&old_id) {
                old.set_state(SessionState::NewSessionCreated);
            }
        }
        // Triggers for every unconfirmed send session.
        for id in self.send_order.clone() {
            let Some(session) = self.sessions.get_mut(&id) else {
                continue;
            };
            if session.state() != SessionState::Unconfirmed {
                continue;
            }
            session.set_state(SessionState::Sending);
            pending.push(PendingTrigger {
                partner_id: self.partner_id,
                session_id: id,
                new_public: self
                    .group
                    .encode(&self.group.public_of(&session.my_private().0)),
            });
        }
        if !pending.is_empty() {
            self.persist();
        }
        pending
    }

    /// The trigger's round completed.
    pub fn trigger_sent(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            if session.state() == SessionState::Sending {
                session.set_state(SessionState::Sent);
                self.persist();
            }
        }
    }

    /// The trigger send failed; regress so the next key pop retries.
    pub fn trigger_failed(&mut self, id: &SessionId) {
        if let Some(session) = self.sessions.get_mut(id) {
            if session.state() == SessionState::Sending {
                session.set_state(SessionState::Unconfirmed);
                self.persist();
            }
        }
    }

    /// Partner announced a new session. Build the matching receive
    /// session and return its window fingerprints for registration plus
    /// the session id to confirm.
    pub fn handle_trigger(
        &mut self,
        new_public_wire: &[u8],
        my_private: &DhPrivateKey,
    ) -> Result<(SessionId, Vec<(u32, KeyFingerprint)>)> {
        let partner_new = DhPublicKey(
            self.group
                .decode(new_public_wire)
                .map_err(|_| E2eError::Malformed("trigger public not in group".into()))?,
        );
        let receive = Session::new(
            &self.group,
            my_private.clone(),
            partner_new,
            self.receive_params,
            SessionState::Confirmed,
        );
        let id = receive.id();
        if self.sessions.contains_key(&id) {
            // Replayed trigger; the session already exists.
            return Ok((id, Vec::new()));
        }
        let fingerprints = receive.window_fingerprints();
        debug!(partner = %self.partner_id, session = %id, "receive session from trigger");
        self.receive_order.push(id);
        self.sessions.insert(id, receive);
        self.persist();
        Ok((id, fingerprints))
    }

    /// Partner confirmed a session we negotiated.
    pub fn handle_confirm(&mut self, id: &SessionId) -> Result<()> {
        let session = self.sessions.get_mut(id).ok_or(E2eError::UnknownSession)?;
        match session.state() {
            SessionState::Sending | SessionState::Sent | SessionState::Unconfirmed => {
                session.set_state(SessionState::Confirmed);
                info!(partner = %self.partner_id, session = %id, "session confirmed");
                self.persist();
                Ok(())
            }
            SessionState::Confirmed => Ok(()),
            _ => Err(E2eError::UnknownSession),
        }
    }

    /// The receive cypher for a matched fingerprint.
    pub fn receive_cypher(&self, session: &SessionId, index: u32) -> Result<Cypher> {
        self.sessions
            .get(session)
            .ok_or(E2eError::UnknownSession)?
            .receive_cypher(index)
    }

    /// Consume a receive key and sweep drained superseded sessions.
    /// Returns fresh fingerprints to register.
    pub fn consume(
        &mut self,
        session: &SessionId,
        index: u32,
    ) -> Result<Vec<(u32, KeyFingerprint)>> {
        let fresh = self
            .sessions
            .get_mut(session)
            .ok_or(E2eError::UnknownSession)?
            .consume(index);
        let drained: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.drained())
            .map(|(id, _)| *id)
            .collect();
        for id in drained {
            debug!(session = %id, "drained session swept");
            self.sessions.remove(&id);
            self.send_order.retain(|s| s != &id);
            self.receive_order.retain(|s| s != &id);
        }
        self.persist();
        Ok(fresh)
    }

    /// All live receive windows, for fingerprint registration at load.
    pub fn all_receive_fingerprints(&self) -> Vec<(SessionId, u32, KeyFingerprint)> {
        self.receive_order
            .iter()
            .filter_map(|id| self.sessions.get(id).map(|s| (id, s)))
            .flat_map(|(id, s)| {
                s.window_fingerprints()
                    .into_iter()
                    .map(move |(i, fp)| (*id, i, fp))
            })
            .collect()
    }

    fn persist(&self) {
        let record = PartnerRecord {
            my_id: self.my_id,
            partner_id: self.partner_id,
            send_params: self.send_params,
            receive_params: self.receive_params,
            send_order: self.send_order.clone(),
            receive_order: self.receive_order.clone(),
            sessions: self
                .sessions
                .iter()
                .map(|(id, s)| (*id, s.to_record()))
                .collect(),
        };
        let data = bincode::serialize(&record).expect("partner record serializes");
        self.kv.set(PARTNER_KEY, Record::new(PARTNER_VERSION, data));
    }

    /// Rebuild a manager from its persisted record.
    pub fn load(kv: Kv, group: CyclicGroup) -> Result<Self> {
        let record = kv.get_versioned(PARTNER_KEY, PARTNER_VERSION)?;
        let record: PartnerRecord = bincode::deserialize(&record.data)
            .map_err(|e| E2eError::Malformed(e.to_string()))?;
        let sessions = record
            .sessions
            .into_iter()
            .map(|(id, rec)| (id, Session::from_record(&group, rec)))
            .collect();
        Ok(PartnerManager {
            my_id: record.my_id,
            partner_id: record.partner_id,
            kv,
            group,
            sessions,
            send_order: record.send_order,
            receive_order: record.receive_order,
            send_params: record.send_params,
            receive_params: record.receive_params,
        })
    }
}

#[derive(Serialize, Deserialize)]
struct PartnerRecord {
    my_id: Id,
    partner_id: Id,
    send_params: SessionParams,
    receive_params: SessionParams,
    send_order: Vec<SessionId>,
    receive_order: Vec<SessionId>,
    sessions: Vec<(SessionId, SessionRecord)>,
}
