// Copyright (c) 2025 The Haze Project

//! The network definition file (NDF).
//!
//! A signed two-line document: a line of JSON describing the network's
//! groups, nodes, and gateways, then a line of base64 signature over the
//! JSON bytes. The signature is checked against a bundled public key
//! before the JSON is parsed; an empty key skips verification as an
//! explicit, logged, development-only opt-out.

use crate::error::{CmixError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use haze_common::Id;
use haze_connection::GatewaySpec;
use haze_crypto::CyclicGroup;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Hex-encoded group parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    /// The prime, 16-bit ASCII hex.
    pub prime: String,
    /// The generator, hex.
    pub generator: String,
}

impl GroupSpec {
    /// Parse into a usable group.
    pub fn to_group(&self) -> Result<CyclicGroup> {
        Ok(CyclicGroup::from_hex(&self.prime, &self.generator)?)
    }
}

/// Operational status of a node or gateway.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Participating in rounds.
    Active,
    /// Lagging; skipped for registration.
    Stale,
    /// Excluded from the network.
    Banned,
}

/// One node or gateway entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeEntry {
    /// 33-byte id, base64.
    #[serde(with = "id_b64")]
    pub id: Id,
    /// host:port.
    pub address: String,
    /// PEM TLS certificate.
    pub tls_cert: String,
    /// Operational status.
    pub status: NodeStatus,
}

/// The user-discovery service entry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UdbEntry {
    /// The service identity.
    #[serde(with = "id_b64")]
    pub id: Id,
    /// DH public key bytes, base64.
    pub dh_pub_key: String,
    /// host:port.
    pub address: String,
    /// PEM TLS certificate.
    pub cert: String,
}

/// The parsed network definition.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkDefinition {
    /// The cMix group; its prime length sizes every wire message.
    pub cmix_group: GroupSpec,
    /// The end-to-end group.
    pub e2e_group: GroupSpec,
    /// Mix nodes.
    pub nodes: Vec<NodeEntry>,
    /// Gateways, parallel to `nodes`.
    pub gateways: Vec<NodeEntry>,
    /// User discovery, if deployed.
    pub udb: Option<UdbEntry>,
    /// Ephemeral-id width in bits.
    pub address_space_bits: u8,
}

impl NetworkDefinition {
    /// Parse and verify a signed two-line NDF document.
    ///
    /// `verify_key` is a 32-byte ed25519 public key; pass an empty slice
    /// to skip verification (development only).
    pub fn parse_signed(doc: &str, verify_key: &[u8]) -> Result<Self> {
        let mut lines = doc.lines();
        let json = lines
            .next()
            .ok_or_else(|| CmixError::BadNdf("missing JSON line".into()))?;
        let sig_line = lines
            .next()
            .ok_or_else(|| CmixError::BadNdf("missing signature line".into()))?;
        if verify_key.is_empty() {
            warn!("NDF signature verification skipped: no public key configured");
        } else {
            let key_bytes: [u8; 32] = verify_key
                .try_into()
                .map_err(|_| CmixError::BadNdf("verify key must be 32 bytes".into()))?;
            let key = VerifyingKey::from_bytes(&key_bytes)
                .map_err(|_| CmixError::BadNdf("invalid verify key".into()))?;
            let sig_bytes = BASE64
                .decode(sig_line.trim())
                .map_err(|_| CmixError::BadNdf("signature not base64".into()))?;
            let sig = Signature::from_slice(&sig_bytes)
                .map_err(|_| CmixError::BadNdf("signature malformed".into()))?;
            key.verify(json.as_bytes(), &sig)
                .map_err(|_| CmixError::BadNdfSignature)?;
        }
        let ndf: NetworkDefinition =
            serde_json::from_str(json).map_err(|e| CmixError::BadNdf(e.to_string()))?;
        ndf.validate()?;
        Ok(ndf)
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.len() != self.gateways.len() {
            return Err(CmixError::BadNdf(
                "node and gateway lists are not parallel".into(),
            ));
        }
        if self.address_space_bits == 0 || self.address_space_bits > 64 {
            return Err(CmixError::BadNdf("address space must be 1..=64 bits".into()));
        }
        Ok(())
    }

    /// Nodes participating in rounds (neither stale nor banned).
    pub fn active_nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Active)
    }

    /// The gateway fronting a given node, by list position.
    pub fn gateway_for(&self, node_id: &Id) -> Option<&NodeEntry> {
        let idx = self.nodes.iter().position(|n| &n.id == node_id)?;
        self.gateways.get(idx)
    }

    /// Gateway dial specs for the host pool.
    pub fn gateway_specs(&self) -> Vec<GatewaySpec> {
        self.nodes
            .iter()
            .zip(&self.gateways)
            .filter(|(n, _)| n.status == NodeStatus::Active)
            .map(|(n, g)| GatewaySpec {
                gateway_id: g.id,
                node_id: n.id,
                address: g.address.clone(),
                tls_cert: g.tls_cert.clone().into_bytes(),
            })
            .collect()
    }
}

mod id_b64 {
    use haze_common::Id;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(id: &Id, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&id.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Id, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod test_ndf {
    use super::*;
    use haze_common::IdKind;
    use rand::SeedableRng;

    /// The 128-bit test group parameters (p = 2^128 - 159, g = 2).
    pub const TEST_PRIME_HEX: &str = "ffffffffffffffffffffffffffffff61";

    /// The 512-bit cMix test prime (p = 2^512 - 569, g = 2). The cMix
    /// group must leave room for the fixed wire-message headers, which
    /// the 128-bit prime does not.
    pub const TEST_CMIX_PRIME_HEX: &str = "fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffdc7";

    /// An NDF with `n` active node/gateway pairs and small test groups.
    pub fn with_nodes(n: usize) -> NetworkDefinition {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1000);
        let nodes: Vec<NodeEntry> = (0..n)
            .map(|i| NodeEntry {
                id: Id::random(&mut rng, IdKind::Node),
                address: format!("node{i}.test:11420"),
                tls_cert: String::new(),
                status: NodeStatus::Active,
            })
            .collect();
        let gateways = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| NodeEntry {
                id: n.id.with_kind(IdKind::Gateway),
                address: format!("gw{i}.test:8443"),
                tls_cert: String::new(),
                status: NodeStatus::Active,
            })
            .collect();
        NetworkDefinition {
            cmix_group: GroupSpec {
                prime: TEST_CMIX_PRIME_HEX.into(),
                generator: "02".into(),
            },
            e2e_group: GroupSpec {
                prime: TEST_PRIME_HEX.into(),
                generator: "02".into(),
            },
            nodes,
            gateways,
            udb: None,
            address_space_bits: 16,
        }
    }
}
