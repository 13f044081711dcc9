// Copyright (c) 2025 The Haze Project

//! The end-to-end layer over the mixnet.
//!
//! The ratchet owns every conversation partner, registers their receive
//! windows with the demultiplexer, seals outbound payloads under
//! one-shot keys, and decrypts inbound slots as they match. Session
//! negotiation runs through the rekey worker; the ratchet only queues
//! the work and seals its wire form.

use crate::error::{E2eError, Result};
use crate::partner::PartnerManager;
use crate::rekey::{frame, unframe, E2ePayload, WireMessage};
use crate::session::{SessionId, SessionParams, SessionState};
use haze_cmix::demux::{Demux, MessageProcessor};
use haze_cmix::CmixMessage;
use haze_common::Id;
use haze_connection::RoundId;
use haze_crypto::{CyclicGroup, DhPrivateKey, DhPublicKey, KeyFingerprint};
use haze_storage::{Kv, Record};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const PARTNERS_MAP: &str = "partners";
const PARTNERS_VERSION: u64 = 1;

/// A decrypted application payload.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub partner: Id,
    pub contents: Vec<u8>,
    pub round: RoundId,
}

type Listener = Box<dyn Fn(ReceivedMessage) + Send + Sync>;

pub struct Ratchet {
    my_id: Id,
    my_private: DhPrivateKey,
    group: CyclicGroup,
    kv: Kv,
    demux: Arc<Demux>,
    partners: Mutex<HashMap<Id, PartnerManager>>,
    /// Sessions confirmed on receive, awaiting their confirm send.
    confirms: Mutex<Vec<(Id, SessionId)>>,
    kick: Notify,
    listener: Mutex<Option<Listener>>,
}

impl Ratchet {
    /// Build the ratchet and restore every persisted partner, putting
    /// their receive windows back in the demultiplexer.
    pub fn load(
        my_id: Id,
        my_private: DhPrivateKey,
        group: CyclicGroup,
        kv: Kv,
        demux: Arc<Demux>,
    ) -> Result<Arc<Self>> {
        let ratchet = Arc::new(Ratchet {
            my_id,
            my_private,
            group,
            kv,
            demux,
            partners: Mutex::new(HashMap::new()),
            confirms: Mutex::new(Vec::new()),
            kick: Notify::new(),
            listener: Mutex::new(None),
        });
        for (element, record) in ratchet.kv.map_elements(PARTNERS_MAP) {
            let partner: Id = bincode::deserialize(&record.data)
                .map_err(|e| E2eError::Malformed(format!("partner entry {element}: {e}")))?;
            let manager = PartnerManager::load(
                ratchet.kv.prefix(&partner_prefix(&partner)),
                ratchet.group.clone(),
            )?;
            let windows = manager.all_receive_fingerprints();
            ratchet.partners.lock().unwrap().insert(partner, manager);
            for (session, index, fp) in windows {
                ratchet.register_slot(partner, session, index, fp);
            }
            info!(partner = %partner, "partner restored");
        }
        Ok(ratchet)
    }

    /// Deliver decrypted application payloads here.
    pub fn set_listener(&self, listener: Listener) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Wakes the rekey worker.
    pub fn rekey_kick(&self) -> &Notify {
        &self.kick
    }

    /// Establish a conversation partner from their long-term public
    /// element. The initial session starts unconfirmed; the next rekey
    /// sweep announces it.
    pub fn add_partner(
        self: &Arc<Self>,
        partner: Id,
        partner_public: DhPublicKey,
        send_params: SessionParams,
        receive_params: SessionParams,
    ) -> Result<SessionId> {
        let mut partners = self.partners.lock().unwrap();
        if partners.contains_key(&partner) {
            return Err(E2eError::PartnerExists(partner.to_string()));
        }
        let manager = PartnerManager::new(
            self.my_id,
            partner,
            self.my_private.clone(),
            partner_public,
            send_params,
            receive_params,
            self.group.clone(),
            self.kv.prefix(&partner_prefix(&partner)),
        );
        let session = manager.current_send()?;
        let windows = manager.all_receive_fingerprints();
        partners.insert(partner, manager);
        drop(partners);
        for (session, index, fp) in windows {
            self.register_slot(partner, session, index, fp);
        }
        let data = bincode::serialize(&partner).expect("id serializes");
        self.kv
            .map_set(PARTNERS_MAP, &partner.to_string(), Record::new(PARTNERS_VERSION, data));
        self.kick.notify_one();
        Ok(session)
    }

    /// Remove a partner and every fingerprint registered for them.
    /// Unknown partners are a no-op.
    pub fn remove_partner(&self, partner: &Id) {
        let removed = self.partners.lock().unwrap().remove(partner);
        let Some(manager) = removed else { return };
        for (_, _, fp) in manager.all_receive_fingerprints() {
            self.demux.delete_fingerprint(&fp);
        }
        self.confirms.lock().unwrap().retain(|(p, _)| p != partner);
        self.kv.map_delete(PARTNERS_MAP, &partner.to_string());
        info!(partner = %partner, "partner removed");
    }

    pub fn has_partner(&self, partner: &Id) -> bool {
        self.partners.lock().unwrap().contains_key(partner)
    }

    pub fn partner_ids(&self) -> Vec<Id> {
        self.partners.lock().unwrap().keys().copied().collect()
    }

    pub fn current_send(&self, partner: &Id) -> Result<SessionId> {
        self.partners
            .lock()
            .unwrap()
            .get(partner)
            .ok_or_else(|| E2eError::NoPartner(partner.to_string()))?
            .current_send()
    }

    pub fn session_state(&self, partner: &Id, session: &SessionId) -> Option<SessionState> {
        self.partners
            .lock()
            .unwrap()
            .get(partner)
            .and_then(|m| m.session_state(session))
    }

    /// Seal application data for a partner under the next one-shot key.
    pub fn seal(&self, partner: &Id, plaintext: &[u8]) -> Result<WireMessage> {
        let payload = E2ePayload::Data(plaintext.to_vec());
        let (message, triggered) = {
            let mut partners = self.partners.lock().unwrap();
            let manager = partners
                .get_mut(partner)
                .ok_or_else(|| E2eError::NoPartner(partner.to_string()))?;
            let cypher = manager.pop_send_key()?;
            let triggered =
                manager.session_state(&cypher.session) == Some(SessionState::NewSessionTriggered);
            (self.seal_with(&cypher, *partner, &payload), triggered)
        };
        if triggered {
            self.kick.notify_one();
        }
        Ok(message)
    }

    /// Seal every queued trigger, moving the sessions to `Sending`. The
    /// rekey worker reports each delivery back.
    pub fn sealed_triggers(&self) -> Vec<(SessionId, WireMessage)> {
        let mut rng = rand::thread_rng();
        let mut out = Vec::new();
        let mut partners = self.partners.lock().unwrap();
        for (partner, manager) in partners.iter_mut() {
            for pending in manager.trigger_negotiations(&mut rng) {
                let cypher = match manager.pop_trigger_key(&pending.session_id) {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(partner = %partner, session = %pending.session_id, error = %e,
                            "no carrier key for trigger");
                        manager.trigger_failed(&pending.session_id);
                        continue;
                    }
                };
                let payload = E2ePayload::Trigger {
                    new_public: pending.new_public,
                };
                out.push((
                    pending.session_id,
                    self.seal_with(&cypher, *partner, &payload),
                ));
            }
        }
        out
    }

    /// Seal every queued confirm. A confirm that cannot be sealed is
    /// requeued for the next sweep.
    pub fn sealed_confirms(&self) -> Vec<(Id, SessionId, WireMessage)> {
        let queued: Vec<(Id, SessionId)> =
            std::mem::take(&mut *self.confirms.lock().unwrap());
        let mut out = Vec::new();
        let mut partners = self.partners.lock().unwrap();
        for (partner, session) in queued {
            let Some(manager) = partners.get_mut(&partner) else {
                continue;
            };
            match manager.pop_send_key() {
                Ok(cypher) => {
                    let payload = E2ePayload::Confirm { session };
                    out.push((partner, session, self.seal_with(&cypher, partner, &payload)));
                }
                Err(e) => {
                    warn!(partner = %partner, session = %session, error = %e,
                        "confirm deferred");
                    self.confirms.lock().unwrap().push((partner, session));
                }
            }
        }
        out
    }

    /// Put an undelivered confirm back in the queue.
    pub fn requeue_confirm(&self, partner: Id, session: SessionId) {
        self.confirms.lock().unwrap().push((partner, session));
    }

    pub fn trigger_sent(&self, partner: &Id, session: &SessionId) {
        if let Some(manager) = self.partners.lock().unwrap().get_mut(partner) {
            manager.trigger_sent(session);
        }
    }

    pub fn trigger_failed(&self, partner: &Id, session: &SessionId) {
        if let Some(manager) = self.partners.lock().unwrap().get_mut(partner) {
            manager.trigger_failed(session);
        }
    }

    fn seal_with(
        &self,
        cypher: &crate::session::Cypher,
        partner: Id,
        payload: &E2ePayload,
    ) -> WireMessage {
        let plaintext = bincode::serialize(payload).expect("payload serializes");
        let contents = frame(&cypher.encrypt(&plaintext));
        WireMessage {
            recipient: partner,
            fingerprint: cypher.fingerprint(),
            mac_key: cypher.mac_key(),
            contents,
        }
    }

    /// Decrypt one matched slot. Returns true when the message was
    /// accepted, consuming its fingerprint.
    fn receive(
        self: &Arc<Self>,
        partner: Id,
        session: SessionId,
        key_index: u32,
        message: &CmixMessage,
        round: RoundId,
    ) -> bool {
        enum After {
            Deliver(ReceivedMessage),
            Kick,
            Nothing,
        }
        let after = {
            let mut partners = self.partners.lock().unwrap();
            let Some(manager) = partners.get_mut(&partner) else {
                return false;
            };
            let framed = message.contents();
            let payload = match open_slot(manager, &session, key_index, &framed, message) {
                Ok(payload) => payload,
                Err(e) => {
                    debug!(partner = %partner, session = %session, index = key_index,
                        error = %e, "slot rejected");
                    return false;
                }
            };
            let fresh = match manager.consume(&session, key_index) {
                Ok(fresh) => fresh,
                Err(e) => {
                    debug!(session = %session, index = key_index, error = %e,
                        "consume failed");
                    return false;
                }
            };
            for (index, fp) in fresh {
                self.register_slot(partner, session, index, fp);
            }
            match payload {
                E2ePayload::Data(contents) => After::Deliver(ReceivedMessage {
                    partner,
                    contents,
                    round,
                }),
                E2ePayload::Trigger { new_public } => {
                    match manager.handle_trigger(&new_public, &self.my_private) {
                        Ok((new_session, fingerprints)) => {
                            for (index, fp) in fingerprints {
                                self.register_slot(partner, new_session, index, fp);
                            }
                            self.confirms.lock().unwrap().push((partner, new_session));
                            After::Kick
                        }
                        Err(e) => {
                            debug!(partner = %partner, error = %e, "trigger rejected");
                            After::Nothing
                        }
                    }
                }
                E2ePayload::Confirm { session: confirmed } => {
                    if let Err(e) = manager.handle_confirm(&confirmed) {
                        debug!(partner = %partner, session = %confirmed, error = %e,
                            "confirm for unknown session");
                    }
                    After::Nothing
                }
            }
        };
        match after {
            After::Deliver(received) => {
                if let Some(listener) = self.listener.lock().unwrap().as_ref() {
                    listener(received);
                }
            }
            After::Kick => self.kick.notify_one(),
            After::Nothing => {}
        }
        true
    }

    fn register_slot(
        self: &Arc<Self>,
        partner: Id,
        session: SessionId,
        key_index: u32,
        fingerprint: KeyFingerprint,
    ) {
        let slot = Arc::new(CypherSlot {
            ratchet: Arc::downgrade(self),
            partner,
            session,
            key_index,
        });
        if let Err(e) = self.demux.add_fingerprint(self.my_id, fingerprint, slot) {
            debug!(session = %session, index = key_index, error = %e,
                "fingerprint already registered");
        }
    }
}

/// Verify and decrypt the framed slot contents. The integrity MAC
/// covers the unpadded frame, so it is recomputed over the frame's
/// exact extent.
fn open_slot(
    manager: &PartnerManager,
    session: &SessionId,
    key_index: u32,
    framed: &[u8],
    message: &CmixMessage,
) -> Result<E2ePayload> {
    let cypher = manager.receive_cypher(session, key_index)?;
    let ciphertext = unframe(framed)?;
    cypher.verify_mac(&framed[..4 + ciphertext.len()], &message.mac())?;
    let plaintext = cypher.decrypt(ciphertext)?;
    bincode::deserialize(&plaintext).map_err(|e| E2eError::Malformed(e.to_string()))
}

/// Routes one registered fingerprint back into the ratchet.
struct CypherSlot {
    ratchet: Weak<Ratchet>,
    partner: Id,
    session: SessionId,
    key_index: u32,
}

impl MessageProcessor for CypherSlot {
    fn process(&self, _recipient: &Id, message: &CmixMessage, round: RoundId) -> bool {
        let Some(ratchet) = self.ratchet.upgrade() else {
            return false;
        };
        ratchet.receive(self.partner, self.session, self.key_index, message, round)
    }
}

fn partner_prefix(partner: &Id) -> String {
    format!("e2e/{partner}/")
}
