// Copyright (c) 2025 The Haze Project

//! The key-value persistence façade.
//!
//! Every persistent component in the client stores versioned records
//! through a [`Kv`] handle. Handles are cheap clones sharing one backing
//! store; `prefix` derives namespaced children, and `watch_map` observes
//! per-element edits to named maps. The backing store is in-memory with an
//! optional encrypted file snapshot behind it.

mod error;
mod kv;
mod sink;

pub use crate::{
    error::{Result, StorageError},
    kv::{Kv, MapEdit, MapOp, Record},
    sink::FileSink,
};
