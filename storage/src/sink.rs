// Copyright (c) 2025 The Haze Project

//! Encrypted file snapshots behind the in-memory store.
//!
//! The whole map is written as one bincode snapshot via a temp file and
//! atomic rename, optionally sealed with ChaCha20-Poly1305 under a
//! caller-supplied 32-byte key. A random 12-byte nonce is prepended to
//! each write.

use crate::{
    error::{Result, StorageError},
    kv::Record,
};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use std::{collections::HashMap, fs, path::PathBuf};

const NONCE_LEN: usize = 12;

/// Destination for store snapshots.
#[derive(Clone)]
pub struct FileSink {
    path: PathBuf,
    key: Option<[u8; 32]>,
}

impl std::fmt::Debug for FileSink {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("FileSink")
            .field("path", &self.path)
            .field("encrypted", &self.key.is_some())
            .finish()
    }
}

impl FileSink {
    /// A plaintext snapshot file.
    pub fn plaintext(path: impl Into<PathBuf>) -> Self {
        FileSink {
            path: path.into(),
            key: None,
        }
    }

    /// A snapshot file sealed under `key`.
    pub fn encrypted(path: impl Into<PathBuf>, key: [u8; 32]) -> Self {
        FileSink {
            path: path.into(),
            key: Some(key),
        }
    }

    /// Whether a snapshot already exists on disk.
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Write the full map, atomically replacing any previous snapshot.
    pub fn persist(&self, data: &HashMap<String, Record>) -> Result<()> {
        let plain = bincode::serialize(data)
            .map_err(|e| StorageError::Corrupted(format!("snapshot encode: {e}")))?;
        let bytes = match &self.key {
            None => plain,
            Some(key) => {
                let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte key");
                let mut nonce_bytes = [0u8; NONCE_LEN];
                rand::thread_rng().fill_bytes(&mut nonce_bytes);
                let nonce = Nonce::from_slice(&nonce_bytes);
                let sealed = cipher
                    .encrypt(nonce, plain.as_slice())
                    .expect("chacha20poly1305 encryption is infallible for in-memory buffers");
                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce_bytes);
                out.extend_from_slice(&sealed);
                out
            }
        };
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// Load the map from disk.
    pub fn load(&self) -> Result<HashMap<String, Record>> {
        let bytes = fs::read(&self.path)?;
        let plain = match &self.key {
            None => bytes,
            Some(key) => {
                if bytes.len() < NONCE_LEN {
                    return Err(StorageError::Corrupted("snapshot too short".into()));
                }
                let cipher = ChaCha20Poly1305::new_from_slice(key).expect("32-byte key");
                let nonce = Nonce::from_slice(&bytes[..NONCE_LEN]);
                cipher
                    .decrypt(nonce, &bytes[NONCE_LEN..])
                    .map_err(|_| StorageError::BadStorageKey)?
            }
        };
        bincode::deserialize(&plain)
            .map_err(|e| StorageError::Corrupted(format!("snapshot decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn sample() -> HashMap<String, Record> {
        let mut map = HashMap::new();
        map.insert(
            "session/key".to_string(),
            Record {
                version: 1,
                timestamp: SystemTime::now(),
                data: vec![1, 2, 3],
            },
        );
        map
    }

    #[test]
    fn plaintext_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::plaintext(dir.path().join("kv.bin"));
        sink.persist(&sample()).unwrap();
        let loaded = sink.load().unwrap();
        assert_eq!(loaded["session/key"].data, vec![1, 2, 3]);
    }

    #[test]
    fn encrypted_round_trip_and_wrong_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.bin");
        let sink = FileSink::encrypted(&path, [4u8; 32]);
        sink.persist(&sample()).unwrap();
        assert_eq!(sink.load().unwrap().len(), 1);
        let wrong = FileSink::encrypted(&path, [5u8; 32]);
        assert!(matches!(wrong.load(), Err(StorageError::BadStorageKey)));
    }

    #[test]
    fn truncated_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.bin");
        std::fs::write(&path, b"short").unwrap();
        let sink = FileSink::encrypted(&path, [4u8; 32]);
        assert!(matches!(sink.load(), Err(StorageError::Corrupted(_))));
    }
}
