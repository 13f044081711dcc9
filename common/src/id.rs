// Copyright (c) 2025 The Haze Project

//! The opaque identity type used for users, nodes, gateways, and groups.

use displaydoc::Display;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    cmp::Ordering,
    fmt::{Debug, Formatter, Result as FmtResult},
    str::FromStr,
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

/// Total length of an [`Id`] in bytes: 32 bytes of entropy plus a kind tag.
pub const ID_LEN: usize = 33;

/// Length of the entropy portion of an [`Id`].
pub const ID_DATA_LEN: usize = 32;

/// Errors arising from [`Id`] construction and parsing.
#[derive(Clone, Debug, Display, Eq, PartialEq, thiserror::Error)]
pub enum IdError {
    /// Wrong length {0}, expected 33 bytes
    InvalidLength(usize),
    /// Unknown id kind tag {0}
    UnknownKind(u8),
    /// Invalid base64 encoding
    InvalidBase64,
}

/// What an [`Id`] refers to, stored in its final byte.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize)]
#[repr(u8)]
pub enum IdKind {
    /// A client user
    User = 1,
    /// A gateway fronting a mix node
    Gateway = 2,
    /// A mix node
    Node = 3,
    /// A messaging group
    Group = 4,
    /// A time-rotating receiver identity
    Ephemeral = 5,
}

impl IdKind {
    /// Decode a kind tag byte.
    pub fn from_byte(b: u8) -> Result<Self, IdError> {
        match b {
            1 => Ok(IdKind::User),
            2 => Ok(IdKind::Gateway),
            3 => Ok(IdKind::Node),
            4 => Ok(IdKind::Group),
            5 => Ok(IdKind::Ephemeral),
            other => Err(IdError::UnknownKind(other)),
        }
    }
}

/// A 33-byte opaque identity: 32 bytes of entropy and a one-byte kind tag.
///
/// Equality, ordering, and hashing cover all 33 bytes, so two ids that
/// share entropy but differ in kind are distinct.
#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Id([u8; ID_LEN]);

impl Id {
    /// Build an id from raw entropy and a kind.
    pub fn new(data: [u8; ID_DATA_LEN], kind: IdKind) -> Self {
        let mut bytes = [0u8; ID_LEN];
        bytes[..ID_DATA_LEN].copy_from_slice(&data);
        bytes[ID_DATA_LEN] = kind as u8;
        Id(bytes)
    }

    /// Construct from a full 33-byte slice, validating the kind tag.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdError> {
        if bytes.len() != ID_LEN {
            return Err(IdError::InvalidLength(bytes.len()));
        }
        IdKind::from_byte(bytes[ID_DATA_LEN])?;
        let mut buf = [0u8; ID_LEN];
        buf.copy_from_slice(bytes);
        Ok(Id(buf))
    }

    /// Generate a random id of the given kind.
    pub fn random<R: rand::RngCore>(rng: &mut R, kind: IdKind) -> Self {
        let mut data = [0u8; ID_DATA_LEN];
        rng.fill_bytes(&mut data);
        Id::new(data, kind)
    }

    /// The full 33 bytes.
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// The 32 entropy bytes, without the kind tag.
    pub fn entropy(&self) -> &[u8] {
        &self.0[..ID_DATA_LEN]
    }

    /// The kind tag.
    pub fn kind(&self) -> IdKind {
        // The tag was validated on construction.
        IdKind::from_byte(self.0[ID_DATA_LEN]).unwrap_or(IdKind::User)
    }

    /// The same entropy re-tagged with another kind.
    pub fn with_kind(&self, kind: IdKind) -> Self {
        let mut bytes = self.0;
        bytes[ID_DATA_LEN] = kind as u8;
        Id(bytes)
    }
}

impl Ord for Id {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for Id {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", BASE64.encode(self.0))
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "Id({:?}, {})", self.kind(), BASE64.encode(&self.0[..8]))
    }
}

impl FromStr for Id {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, IdError> {
        let bytes = BASE64.decode(s).map_err(|_| IdError::InvalidBase64)?;
        Id::from_bytes(&bytes)
    }
}

impl Serialize for Id {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut Formatter) -> FmtResult {
                write!(f, "33 id bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Id, E> {
                Id::from_bytes(v).map_err(E::custom)
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Id, A::Error> {
                let mut buf = Vec::with_capacity(ID_LEN);
                while let Some(b) = seq.next_element::<u8>()? {
                    buf.push(b);
                }
                Id::from_bytes(&buf).map_err(de::Error::custom)
            }
        }

        deserializer.deserialize_bytes(IdVisitor)
    }
}
