// Copyright (c) 2025 The Haze Project

//! Node-key registration.
//!
//! Each mix node must hold a shared transmission key with this client
//! before it will process the client's slots. The registrar enumerates
//! the NDF, runs a batched DH handshake with every node it is missing a
//! valid key for, and persists the results so a restart re-registers
//! nothing.

use crate::error::{CmixError, Result};
use crate::ndf::NetworkDefinition;
use crate::params::FollowParams;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use haze_common::{Id, StopToken};
use haze_connection::{ClientKeyRequest, HostPool, SignedKeyResponse};
use haze_crypto::{derive_shared_key, generate_keypair, CyclicGroup, SymmetricKey};
use haze_storage::{Kv, Record};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const NODE_KEY_VERSION: u64 = 1;
const NODES_MAP: &str = "nodes";
const MAX_ATTEMPTS: u32 = 5;

/// Per-attempt retry delays; attempts beyond the table reuse the last.
const RETRY_DELAYS: [Duration; 4] = [
    Duration::from_secs(5),
    Duration::from_secs(30),
    Duration::from_secs(120),
    Duration::from_secs(600),
];

/// A completed registration with one node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeKeyRecord {
    pub node_id: Id,
    transmission_key: [u8; 32],
    pub valid_until: SystemTime,
    pub key_id: Vec<u8>,
}

impl NodeKeyRecord {
    pub fn key(&self) -> SymmetricKey {
        SymmetricKey::from_bytes(self.transmission_key)
    }

    pub fn valid_at(&self, when: SystemTime) -> bool {
        self.valid_until > when
    }
}

/// Checks the node's signature over a key response.
///
/// Production deployments verify against keys pinned from the NDF; the
/// no-verification mode exists for development networks and is logged
/// loudly at construction.
pub trait ResponseAuth: Send + Sync {
    fn verify(&self, node: &Id, resp: &SignedKeyResponse) -> Result<()>;
}

/// Verifies responses against per-node ed25519 keys.
pub struct Ed25519Auth {
    keys: HashMap<Id, VerifyingKey>,
}

impl Ed25519Auth {
    pub fn new(keys: HashMap<Id, VerifyingKey>) -> Self {
        Ed25519Auth { keys }
    }
}

impl ResponseAuth for Ed25519Auth {
    fn verify(&self, node: &Id, resp: &SignedKeyResponse) -> Result<()> {
        let key = self
            .keys
            .get(node)
            .ok_or_else(|| CmixError::BadKeyResponse(format!("no verify key for node {node}")))?;
        let sig = Signature::from_slice(&resp.signature)
            .map_err(|_| CmixError::BadKeyResponse("malformed node signature".into()))?;
        key.verify(&signed_response_bytes(resp), &sig)
            .map_err(|_| CmixError::BadKeyResponse("node signature check failed".into()))
    }
}

/// Accepts every response without checking. Development networks only.
pub struct NoAuth;

impl NoAuth {
    pub fn new() -> Self {
        warn!("node-key response signature verification is DISABLED");
        NoAuth
    }
}

impl Default for NoAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAuth for NoAuth {
    fn verify(&self, _node: &Id, _resp: &SignedKeyResponse) -> Result<()> {
        Ok(())
    }
}

/// The bytes a node signs in its key response.
pub fn signed_response_bytes(resp: &SignedKeyResponse) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&resp.node_public);
    out.extend_from_slice(&resp.key_id);
    let nanos = resp
        .valid_until
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    out.extend_from_slice(&nanos.to_le_bytes());
    out
}

struct RegistrarInner {
    records: HashMap<Id, NodeKeyRecord>,
    attempts: HashMap<Id, u32>,
}

/// Registers this client with mix nodes and stores transmission keys.
pub struct NodeRegistrar {
    kv: Kv,
    group: CyclicGroup,
    pool: Arc<HostPool>,
    auth: Arc<dyn ResponseAuth>,
    signing: SigningKey,
    client_id: Id,
    inner: Mutex<RegistrarInner>,
    queue: mpsc::Sender<Id>,
}

impl NodeRegistrar {
    /// Load persisted records and spawn the batch-registration worker.
    pub fn spawn(
        kv: Kv,
        group: CyclicGroup,
        pool: Arc<HostPool>,
        auth: Arc<dyn ResponseAuth>,
        signing: SigningKey,
        client_id: Id,
        params: &FollowParams,
        stop: StopToken,
    ) -> Arc<Self> {
        let mut records = HashMap::new();
        for (element, record) in kv.map_elements(NODES_MAP) {
            match bincode::deserialize::<NodeKeyRecord>(&record.data) {
                Ok(rec) => {
                    records.insert(rec.node_id, rec);
                }
                Err(e) => warn!(element, error = %e, "dropping unreadable node key record"),
            }
        }
        info!(loaded = records.len(), "node key records loaded");
        let (queue, rx) = mpsc::channel(256);
        let registrar = Arc::new(NodeRegistrar {
            kv,
            group,
            pool,
            auth,
            signing,
            client_id,
            inner: Mutex::new(RegistrarInner {
                records,
                attempts: HashMap::new(),
            }),
            queue,
        });
        tokio::spawn(run_registration(
            Arc::clone(&registrar),
            rx,
            params.registration_buffer,
            params.registration_delay,
            stop,
        ));
        registrar
    }

    /// Enqueue registration for every active node missing a valid key.
    /// Called on startup and whenever the NDF changes; also resets the
    /// attempt counters so previously dropped nodes get another chance.
    pub async fn ensure_registered(&self, ndf: &NetworkDefinition) -> Result<()> {
        let now = SystemTime::now();
        let missing: Vec<Id> = {
            let mut inner = self.inner.lock().unwrap();
            inner.attempts.clear();
            ndf.active_nodes()
                .map(|n| n.id)
                .filter(|id| !matches!(inner.records.get(id), Some(r) if r.valid_at(now)))
                .collect()
        };
        debug!(missing = missing.len(), "scheduling node registrations");
        for node in missing {
            self.queue
                .send(node)
                .await
                .map_err(|_| CmixError::Cancelled)?;
        }
        Ok(())
    }

    /// The transmission key for one node, if registered and unexpired.
    pub fn key_for(&self, node: &Id) -> Option<SymmetricKey> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(node)
            .filter(|r| r.valid_at(SystemTime::now()))
            .map(|r| r.key())
    }

    /// Transmission keys for an entire round topology, in order.
    /// Fails with the first missing node so the send path can skip the
    /// round.
    pub fn keys_for(&self, topology: &[Id]) -> Result<Vec<SymmetricKey>> {
        let now = SystemTime::now();
        let inner = self.inner.lock().unwrap();
        topology
            .iter()
            .map(|node| {
                inner
                    .records
                    .get(node)
                    .filter(|r| r.valid_at(now))
                    .map(|r| r.key())
                    .ok_or(CmixError::MissingNodeKeys(node_tag(node)))
            })
            .collect()
    }

    /// How many nodes currently hold a valid key for this client.
    pub fn registered_count(&self) -> usize {
        let now = SystemTime::now();
        let inner = self.inner.lock().unwrap();
        inner.records.values().filter(|r| r.valid_at(now)).count()
    }

    /// Run one registration handshake with one node.
    async fn register_node(&self, node: Id, stop: &StopToken) -> Result<()> {
        let keypair = {
            let mut rng = rand::thread_rng();
            generate_keypair(&self.group, &mut rng)
        };
        let mut salt = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut salt);
        let timestamp = SystemTime::now();
        let nanos = timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        let mut signed = salt.to_vec();
        signed.extend_from_slice(&nanos.to_le_bytes());
        let req = ClientKeyRequest {
            client_id: self.client_id,
            client_public: self.group.encode(&keypair.public.0),
            salt: salt.to_vec(),
            timestamp,
            signature: self.signing.sign(&signed).to_bytes().to_vec(),
        };
        let gateway = node.with_kind(haze_common::IdKind::Gateway);
        let resp = self
            .pool
            .send_to_preferred(
                &[gateway],
                &move |conn, _gw| {
                    let req = req.clone();
                    Box::pin(async move { conn.request_client_key(req).await })
                },
                stop,
            )
            .await?;
        self.auth.verify(&node, &resp)?;
        let node_public = haze_crypto::DhPublicKey(self.group.decode(&resp.node_public)?);
        let shared = derive_shared_key(&self.group, &keypair.private, &node_public);
        let record = NodeKeyRecord {
            node_id: node,
            transmission_key: *shared.as_bytes(),
            valid_until: resp.valid_until,
            key_id: resp.key_id,
        };
        self.store(record);
        debug!(node = %node, "node key registered");
        Ok(())
    }

    fn store(&self, record: NodeKeyRecord) {
        let data = bincode::serialize(&record).expect("node key record serializes");
        self.kv.map_set(
            NODES_MAP,
            &record.node_id.to_string(),
            Record::new(NODE_KEY_VERSION, data),
        );
        let mut inner = self.inner.lock().unwrap();
        inner.attempts.remove(&record.node_id);
        inner.records.insert(record.node_id, record);
    }

    /// Record a failure; returns the delay before the next attempt, or
    /// `None` when the node is dropped until the next NDF change.
    fn next_retry(&self, node: &Id) -> Option<Duration> {
        let mut inner = self.inner.lock().unwrap();
        let attempts = inner.attempts.entry(*node).or_insert(0);
        *attempts += 1;
        if *attempts >= MAX_ATTEMPTS {
            return None;
        }
        let idx = (*attempts as usize - 1).min(RETRY_DELAYS.len() - 1);
        Some(RETRY_DELAYS[idx])
    }
}

/// Derive a precanned transmission key from a fixture user index. Test
/// networks seed their nodes with the same scheme; real networks never
/// accept these identities.
#[cfg(any(test, feature = "testing"))]
pub fn precanned_key(user_index: u32) -> SymmetricKey {
    use sha2::{Digest, Sha256};
    let seed = 4000u32 + user_index;
    let digest = Sha256::new()
        .chain_update(b"haze-precanned-key")
        .chain_update(seed.to_le_bytes())
        .finalize();
    SymmetricKey::from_bytes(digest.into())
}

async fn run_registration(
    registrar: Arc<NodeRegistrar>,
    mut rx: mpsc::Receiver<Id>,
    buffer_size: usize,
    batch_delay: Duration,
    mut stop: StopToken,
) {
    let work_stop = stop.clone();
    let mut batch: Vec<Id> = Vec::new();
    loop {
        let flush = tokio::select! {
            node = rx.recv() => match node {
                Some(node) => {
                    if !batch.contains(&node) {
                        batch.push(node);
                    }
                    batch.len() >= buffer_size
                }
                None => return,
            },
            _ = tokio::time::sleep(batch_delay), if !batch.is_empty() => true,
            _ = stop.stopped() => {
                work_stop.acknowledge();
                return;
            }
        };
        if !flush {
            continue;
        }
        for node in batch.drain(..) {
            if work_stop.is_stopped() {
                work_stop.acknowledge();
                return;
            }
            if let Err(e) = registrar.register_node(node, &work_stop).await {
                match registrar.next_retry(&node) {
                    Some(delay) => {
                        warn!(node = %node, error = %e, ?delay, "registration failed, will retry");
                        let registrar = Arc::clone(&registrar);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = registrar.queue.send(node).await;
                        });
                    }
                    None => {
                        warn!(node = %node, error = %e, "registration abandoned until NDF change");
                    }
                }
            }
        }
    }
}

fn node_tag(node: &Id) -> u64 {
    u64::from_le_bytes(node.entropy()[..8].try_into().expect("8 entropy bytes"))
}
