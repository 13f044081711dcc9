// Copyright (c) 2025 The Haze Project

//! The versioned key-value store.

use crate::{
    error::{Result, StorageError},
    sink::FileSink,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
    time::SystemTime,
};
use tracing::error;

/// A stored value with its format version and write time.
///
/// Readers compare `version` against the newest version they understand
/// and surface [`StorageError::UnsupportedVersion`] rather than
/// misinterpret a payload from a newer client.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Format version of `data`.
    pub version: u64,
    /// When the record was written.
    pub timestamp: SystemTime,
    /// The serialized payload.
    pub data: Vec<u8>,
}

impl Record {
    /// A record stamped with the current wall clock.
    pub fn new(version: u64, data: Vec<u8>) -> Self {
        Record {
            version,
            timestamp: SystemTime::now(),
            data,
        }
    }
}

/// What happened to a map element.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MapOp {
    /// The element was inserted.
    Created,
    /// The element was overwritten.
    Updated,
    /// The element was removed.
    Deleted,
}

/// One atomic edit to a named map element, with old and new values.
#[derive(Clone, Debug)]
pub struct MapEdit {
    /// Element key within the map.
    pub element: String,
    /// The kind of edit.
    pub op: MapOp,
    /// Value before the edit, if any.
    pub old: Option<Record>,
    /// Value after the edit, if any.
    pub new: Option<Record>,
}

type MapWatcher = Arc<dyn Fn(&[MapEdit]) + Send + Sync>;

struct Shared {
    data: RwLock<HashMap<String, Record>>,
    watchers: RwLock<HashMap<String, Vec<MapWatcher>>>,
    sink: Option<FileSink>,
}

/// A handle on the store, scoped to a key prefix.
#[derive(Clone)]
pub struct Kv {
    shared: Arc<Shared>,
    prefix: String,
}

impl std::fmt::Debug for Kv {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Kv(prefix={:?})", self.prefix)
    }
}

impl Kv {
    /// A purely in-memory store.
    pub fn in_memory() -> Self {
        Kv {
            shared: Arc::new(Shared {
                data: RwLock::new(HashMap::new()),
                watchers: RwLock::new(HashMap::new()),
                sink: None,
            }),
            prefix: String::new(),
        }
    }

    /// A store backed by a file snapshot, loading any existing contents.
    pub fn with_sink(sink: FileSink) -> Result<Self> {
        let data = if sink.exists() {
            sink.load()?
        } else {
            HashMap::new()
        };
        Ok(Kv {
            shared: Arc::new(Shared {
                data: RwLock::new(data),
                watchers: RwLock::new(HashMap::new()),
                sink: Some(sink),
            }),
            prefix: String::new(),
        })
    }

    /// A child handle namespaced under `p`.
    pub fn prefix(&self, p: &str) -> Kv {
        Kv {
            shared: Arc::clone(&self.shared),
            prefix: format!("{}{}/", self.prefix, p),
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    fn persist_locked(&self, data: &HashMap<String, Record>) {
        if let Some(sink) = &self.shared.sink {
            if let Err(e) = sink.persist(data) {
                // A failed flush leaves the in-memory state authoritative;
                // the next successful flush repairs the snapshot.
                error!(error = %e, "kv snapshot flush failed");
            }
        }
    }

    /// Fetch the record at `key`.
    pub fn get(&self, key: &str) -> Result<Record> {
        let full = self.full_key(key);
        self.shared
            .data
            .read()
            .expect("kv lock")
            .get(&full)
            .cloned()
            .ok_or(StorageError::NotFound(full))
    }

    /// Fetch a record, rejecting versions newer than `max_version`.
    pub fn get_versioned(&self, key: &str, max_version: u64) -> Result<Record> {
        let record = self.get(key)?;
        if record.version > max_version {
            return Err(StorageError::UnsupportedVersion(
                self.full_key(key),
                record.version,
                max_version,
            ));
        }
        Ok(record)
    }

    /// Store a record at `key`.
    pub fn set(&self, key: &str, record: Record) {
        let full = self.full_key(key);
        let data = {
            let mut data = self.shared.data.write().expect("kv lock");
            data.insert(full, record);
            data.clone()
        };
        self.persist_locked(&data);
    }

    /// Remove the record at `key`. Removing a missing key is not an error.
    pub fn delete(&self, key: &str) {
        let full = self.full_key(key);
        let (changed, data) = {
            let mut data = self.shared.data.write().expect("kv lock");
            let changed = data.remove(&full).is_some();
            (changed, data.clone())
        };
        if changed {
            self.persist_locked(&data);
        }
    }

    /// Whether a record exists at `key`.
    pub fn exists(&self, key: &str) -> bool {
        self.shared
            .data
            .read()
            .expect("kv lock")
            .contains_key(&self.full_key(key))
    }

    /// All keys under this handle's prefix, with the prefix stripped.
    pub fn keys(&self) -> Vec<String> {
        self.shared
            .data
            .read()
            .expect("kv lock")
            .keys()
            .filter_map(|k| k.strip_prefix(&self.prefix))
            .map(str::to_string)
            .collect()
    }

    // ------------------------------------------------------------------
    // Named maps
    // ------------------------------------------------------------------

    fn map_key(&self, name: &str, element: &str) -> String {
        format!("{}map/{}/{}", self.prefix, name, element)
    }

    fn map_prefix(&self, name: &str) -> String {
        format!("{}map/{}/", self.prefix, name)
    }

    /// Insert or update one element of the named map, atomically notifying
    /// watchers with the old and new values.
    pub fn map_set(&self, name: &str, element: &str, record: Record) {
        let full = self.map_key(name, element);
        let (old, data) = {
            let mut data = self.shared.data.write().expect("kv lock");
            let old = data.insert(full, record.clone());
            (old, data.clone())
        };
        self.persist_locked(&data);
        let op = if old.is_some() {
            MapOp::Updated
        } else {
            MapOp::Created
        };
        self.notify(
            name,
            &[MapEdit {
                element: element.to_string(),
                op,
                old,
                new: Some(record),
            }],
        );
    }

    /// Delete one element of the named map.
    pub fn map_delete(&self, name: &str, element: &str) {
        let full = self.map_key(name, element);
        let (old, data) = {
            let mut data = self.shared.data.write().expect("kv lock");
            let old = data.remove(&full);
            (old, data.clone())
        };
        let Some(old) = old else { return };
        self.persist_locked(&data);
        self.notify(
            name,
            &[MapEdit {
                element: element.to_string(),
                op: MapOp::Deleted,
                old: Some(old),
                new: None,
            }],
        );
    }

    /// Fetch one element of the named map.
    pub fn map_get(&self, name: &str, element: &str) -> Result<Record> {
        let full = self.map_key(name, element);
        self.shared
            .data
            .read()
            .expect("kv lock")
            .get(&full)
            .cloned()
            .ok_or(StorageError::NotFound(full))
    }

    /// All elements of the named map.
    pub fn map_elements(&self, name: &str) -> Vec<(String, Record)> {
        let prefix = self.map_prefix(name);
        self.shared
            .data
            .read()
            .expect("kv lock")
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|elt| (elt.to_string(), v.clone()))
            })
            .collect()
    }

    /// Observe edits to the named map.
    pub fn watch_map(&self, name: &str, watcher: impl Fn(&[MapEdit]) + Send + Sync + 'static) {
        self.shared
            .watchers
            .write()
            .expect("kv watcher lock")
            .entry(self.map_prefix(name))
            .or_default()
            .push(Arc::new(watcher));
    }

    fn notify(&self, name: &str, edits: &[MapEdit]) {
        let watchers: Vec<MapWatcher> = {
            let watchers = self.shared.watchers.read().expect("kv watcher lock");
            watchers
                .get(&self.map_prefix(name))
                .map(|v| v.to_vec())
                .unwrap_or_default()
        };
        for watcher in watchers {
            watcher(edits);
        }
    }
}
