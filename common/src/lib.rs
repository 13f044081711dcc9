// Copyright (c) 2025 The Haze Project

//! Shared primitives for the haze client crates: opaque identities,
//! ephemeral receiver IDs, the error-kind taxonomy, skew-corrected network
//! time, and the cooperative shutdown tree.

mod ephemeral;
mod id;
mod kinds;
mod nettime;
mod stop;

pub use crate::{
    ephemeral::{window_at, windows_in_range, EphemeralId, IdentityWindow, ROTATION_PERIOD},
    id::{Id, IdKind, IdError, ID_DATA_LEN, ID_LEN},
    kinds::ErrorKind,
    nettime::NetTime,
    stop::{stoppable, StopGroup, StopToken, Stopper, TaskStatus},
};
