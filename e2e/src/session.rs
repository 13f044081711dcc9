// Copyright (c) 2025 The Haze Project

//! Ratchet sessions.
//!
//! A session is one DH agreement and the key stream derived from it.
//! Send sessions hand out one-shot cyphers front to back; receive
//! sessions keep a sliding window of unconsumed cyphers so out-of-order
//! delivery still decrypts. Crossing the rekey threshold flags the
//! session for negotiation of a successor.

use crate::error::{E2eError, Result};
use haze_crypto::{
    decrypt, derive_key_fingerprint, derive_message_key, derive_shared_key, encrypt, make_mac,
    verify_mac, CyclicGroup, DhPrivateKey, DhPublicKey, KeyFingerprint, SymmetricKey,
};
use num_bigint::BigUint;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

/// Identifies a session on both ends: the hash of its base key.
#[derive(Clone, Copy, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
pub struct SessionId([u8; 32]);

impl SessionId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Session({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Lifecycle of a send session.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum SessionState {
    /// Created; no rekey trigger delivered yet.
    Unconfirmed,
    /// A trigger send is in flight.
    Sending,
    /// The trigger's round completed; awaiting the partner's confirm.
    Sent,
    /// Confirmed by the partner; the normal working state.
    Confirmed,
    /// Threshold crossed; a successor must be negotiated.
    NewSessionTriggered,
    /// Superseded; kept until its receive traffic drains.
    NewSessionCreated,
}

/// Tunables for one session.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SessionParams {
    /// W: the nominal keyspace. The precomputed window is 2W wide.
    pub num_keys: u32,
    /// Fraction of W consumed before a rekey triggers.
    pub rekey_threshold: f64,
}

impl Default for SessionParams {
    fn default() -> Self {
        SessionParams {
            num_keys: 128,
            rekey_threshold: 0.75,
        }
    }
}

/// A one-shot key: exactly one fingerprint, one encrypt or decrypt.
pub struct Cypher {
    pub session: SessionId,
    pub key_index: u32,
    key: SymmetricKey,
    fingerprint: KeyFingerprint,
}

impl Cypher {
    pub fn fingerprint(&self) -> KeyFingerprint {
        self.fingerprint
    }

    /// The key bytes used for the wire MAC over the ciphertext.
    pub fn mac_key(&self) -> [u8; 32] {
        *self.key.as_bytes()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        encrypt(&self.key, &self.fingerprint, plaintext)
    }

    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(decrypt(&self.key, &self.fingerprint, ciphertext)?)
    }

    pub fn verify_mac(&self, ciphertext: &[u8], mac: &[u8; 32]) -> Result<()> {
        Ok(verify_mac(self.key.as_bytes(), ciphertext, mac)?)
    }

    pub fn make_mac(&self, ciphertext: &[u8]) -> [u8; 32] {
        make_mac(self.key.as_bytes(), ciphertext)
    }
}

/// One DH agreement and its key stream.
pub struct Session {
    id: SessionId,
    my_private: DhPrivateKey,
    partner_public: DhPublicKey,
    base_key: SymmetricKey,
    params: SessionParams,
    state: SessionState,
    /// Next unissued send index.
    next_key: u32,
    /// Receive indices consumed so far.
    consumed: BTreeSet<u32>,
    /// Receive fingerprints have been derived for `0..registered_through`.
    registered_through: u32,
}

impl Session {
    /// Agree a new session from a key pair and the partner's public.
    pub fn new(
        group: &CyclicGroup,
        my_private: DhPrivateKey,
        partner_public: DhPublicKey,
        params: SessionParams,
        state: SessionState,
    ) -> Self {
        let base_key = derive_shared_key(group, &my_private, &partner_public);
        let id = session_id_of(&base_key);
        Session {
            id,
            my_private,
            partner_public,
            base_key,
            params,
            state,
            next_key: 0,
            consumed: BTreeSet::new(),
            registered_through: 2 * params.num_keys,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    pub fn params(&self) -> SessionParams {
        self.params
    }

    pub fn partner_public(&self) -> &DhPublicKey {
        &self.partner_public
    }

    pub fn my_private(&self) -> &DhPrivateKey {
        &self.my_private
    }

    /// Whether this session may carry new outbound traffic.
    pub fn usable_for_send(&self) -> bool {
        !matches!(self.state, SessionState::NewSessionCreated)
    }

    /// Keys consumed relative to W, as a fraction.
    pub fn usage(&self) -> f64 {
        self.next_key as f64 / self.params.num_keys as f64
    }

    /// Pop the next send cypher. Crossing the threshold moves a
    /// confirmed session to `NewSessionTriggered`; the caller learns via
    /// [`Session::state`] after the pop.
    pub fn pop_key(&mut self) -> Result<Cypher> {
        if self.next_key >= 2 * self.params.num_keys {
            return Err(E2eError::KeyExhausted);
        }
        let index = self.next_key;
        self.next_key += 1;
        if self.state == SessionState::Confirmed && self.usage() >= self.params.rekey_threshold {
            self.state = SessionState::NewSessionTriggered;
        }
        Ok(self.cypher(index))
    }

    /// The cypher for a given receive index, failing on reuse.
    pub fn receive_cypher(&self, index: u32) -> Result<Cypher> {
        if self.consumed.contains(&index) {
            return Err(E2eError::KeyConsumed(index));
        }
        if index >= self.registered_through {
            return Err(E2eError::UnknownSession);
        }
        Ok(self.cypher(index))
    }

    /// Consume a receive index and slide the window. Returns the newly
    /// derived fingerprints the caller must register.
    pub fn consume(&mut self, index: u32) -> Vec<(u32, KeyFingerprint)> {
        self.consumed.insert(index);
        let target = (index + 2 * self.params.num_keys).max(self.registered_through);
        let fresh: Vec<(u32, KeyFingerprint)> = (self.registered_through..target)
            .map(|i| (i, derive_key_fingerprint(self.base_key.as_bytes(), i)))
            .collect();
        self.registered_through = target;
        fresh
    }

    /// Whether every receivable key up to the consumed high-water mark
    /// has been used; a superseded session in this state can be swept.
    pub fn drained(&self) -> bool {
        self.state == SessionState::NewSessionCreated
            && self.consumed.len() as u32 >= self.params.num_keys
    }

    /// The fingerprints of the current receive window, for registration.
    pub fn window_fingerprints(&self) -> Vec<(u32, KeyFingerprint)> {
        (0..self.registered_through)
            .filter(|i| !self.consumed.contains(i))
            .map(|i| (i, derive_key_fingerprint(self.base_key.as_bytes(), i)))
            .collect()
    }

    fn cypher(&self, index: u32) -> Cypher {
        Cypher {
            session: self.id,
            key_index: index,
            key: derive_message_key(&self.base_key, index),
            fingerprint: derive_key_fingerprint(self.base_key.as_bytes(), index),
        }
    }

    /// Snapshot for persistence.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            my_private: self.my_private.0.to_bytes_be(),
            partner_public: self.partner_public.0.to_bytes_be(),
            params: self.params,
            state: self.state,
            next_key: self.next_key,
            consumed: self.consumed.iter().copied().collect(),
            registered_through: self.registered_through,
        }
    }

    /// Rebuild from a persisted snapshot.
    pub fn from_record(group: &CyclicGroup, record: SessionRecord) -> Self {
        let my_private = DhPrivateKey(BigUint::from_bytes_be(&record.my_private));
        let partner_public = DhPublicKey(BigUint::from_bytes_be(&record.partner_public));
        let base_key = derive_shared_key(group, &my_private, &partner_public);
        Session {
            id: session_id_of(&base_key),
            my_private,
            partner_public,
            base_key,
            params: record.params,
            state: record.state,
            next_key: record.next_key,
            consumed: record.consumed.into_iter().collect(),
            registered_through: record.registered_through,
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("next_key", &self.next_key)
            .finish()
    }
}

/// Serializable session snapshot.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionRecord {
    my_private: Vec<u8>,
    partner_public: Vec<u8>,
    params: SessionParams,
    state: SessionState,
    next_key: u32,
    consumed: Vec<u32>,
    registered_through: u32,
}

/// A session's identity is the hash of its base key, so both ends
/// compute the same id without exchanging it.
pub fn session_id_of(base_key: &SymmetricKey) -> SessionId {
    let digest = Sha256::new()
        .chain_update(b"haze-session-id")
        .chain_update(base_key.as_bytes())
        .finalize();
    SessionId(digest.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_crypto::generate_keypair;
    use rand::SeedableRng;

    fn group() -> CyclicGroup {
        CyclicGroup::from_hex("ffffffffffffffffffffffffffffff61", "02").unwrap()
    }

    fn pair(seed: u64) -> (DhPrivateKey, DhPublicKey) {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let kp = generate_keypair(&group(), &mut rng);
        (kp.private, kp.public)
    }

    fn session(state: SessionState) -> Session {
        let (a_priv, _) = pair(1);
        let (_, b_pub) = pair(2);
        Session::new(&group(), a_priv, b_pub, SessionParams::default(), state)
    }

    #[test]
    fn both_ends_agree_on_session_id() {
        let g = group();
        let (a_priv, a_pub) = pair(1);
        let (b_priv, b_pub) = pair(2);
        let alice = Session::new(
            &g,
            a_priv,
            b_pub,
            SessionParams::default(),
            SessionState::Unconfirmed,
        );
        let bob = Session::new(
            &g,
            b_priv,
            a_pub,
            SessionParams::default(),
            SessionState::Unconfirmed,
        );
        assert_eq!(alice.id(), bob.id());
    }

    #[test]
    fn send_pop_matches_receive_cypher() {
        let g = group();
        let (a_priv, a_pub) = pair(1);
        let (b_priv, b_pub) = pair(2);
        let mut alice = Session::new(
            &g,
            a_priv,
            b_pub,
            SessionParams::default(),
            SessionState::Confirmed,
        );
        let bob = Session::new(
            &g,
            b_priv,
            a_pub,
            SessionParams::default(),
            SessionState::Confirmed,
        );
        let cypher = alice.pop_key().unwrap();
        let ct = cypher.encrypt(b"secret");
        let mac = cypher.make_mac(&ct);
        let receive = bob.receive_cypher(cypher.key_index).unwrap();
        assert_eq!(receive.fingerprint(), cypher.fingerprint());
        receive.verify_mac(&ct, &mac).unwrap();
        assert_eq!(receive.decrypt(&ct).unwrap(), b"secret");
    }

    #[test]
    fn threshold_crossing_triggers_rekey() {
        let mut s = session(SessionState::Confirmed);
        let threshold =
            (s.params().num_keys as f64 * s.params().rekey_threshold).ceil() as u32;
        for _ in 0..threshold {
            s.pop_key().unwrap();
        }
        assert_eq!(s.state(), SessionState::NewSessionTriggered);
    }

    #[test]
    fn unconfirmed_session_never_triggers() {
        let mut s = session(SessionState::Unconfirmed);
        for _ in 0..s.params().num_keys {
            s.pop_key().unwrap();
        }
        assert_eq!(s.state(), SessionState::Unconfirmed);
    }

    #[test]
    fn consume_slides_the_window() {
        let mut s = session(SessionState::Confirmed);
        let w2 = 2 * s.params().num_keys;
        assert!(s.consume(0).is_empty());
        let fresh = s.consume(5);
        assert_eq!(fresh.len(), 5);
        assert_eq!(fresh[0].0, w2);
        assert!(matches!(
            s.receive_cypher(5),
            Err(E2eError::KeyConsumed(5))
        ));
        s.receive_cypher(w2 + 4).unwrap();
    }

    #[test]
    fn record_round_trip_preserves_keys() {
        let mut s = session(SessionState::Sent);
        s.pop_key().unwrap();
        s.consume(3);
        let restored = Session::from_record(&group(), s.to_record());
        assert_eq!(restored.id(), s.id());
        assert_eq!(restored.state(), SessionState::Sent);
        assert!(matches!(
            restored.receive_cypher(3),
            Err(E2eError::KeyConsumed(3))
        ));
        let a = s.cypher(7);
        let b = restored.cypher(7);
        assert_eq!(a.fingerprint(), b.fingerprint());
    }
}
