// Copyright (c) 2025 The Haze Project

//! Time-rotating ephemeral receiver identities.
//!
//! A gateway only ever sees a short ephemeral ID, derived from the stable
//! [`Id`], the current rotation epoch, and the network's address-space
//! size. Each id rotates at a time offset drawn from its own hash, so the
//! population does not re-key in lockstep at epoch boundaries.

use crate::id::Id;
use sha2::{Digest, Sha256};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// How long a single ephemeral identity stays valid.
pub const ROTATION_PERIOD: Duration = Duration::from_secs(24 * 60 * 60);

const DERIVATION_TAG: &[u8] = b"haze-ephemeral-id-v1";

/// A derived receiver identity, masked to the network address-space size.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Serialize, serde::Deserialize,
)]
pub struct EphemeralId(pub u64);

impl EphemeralId {
    /// The raw masked value.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for EphemeralId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// An ephemeral id together with the interval it is valid for and the
/// stable id it was derived from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IdentityWindow {
    /// The derived ephemeral id.
    pub ephemeral: EphemeralId,
    /// The stable source identity.
    pub source: Id,
    /// Start of validity (inclusive).
    pub start: SystemTime,
    /// End of validity (exclusive).
    pub end: SystemTime,
}

impl IdentityWindow {
    /// Whether `when` falls inside this window.
    pub fn covers(&self, when: SystemTime) -> bool {
        when >= self.start && when < self.end
    }
}

/// Per-id rotation offset in seconds, in `[0, ROTATION_PERIOD)`.
fn rotation_offset(id: &Id) -> u64 {
    let digest = Sha256::new()
        .chain_update(DERIVATION_TAG)
        .chain_update(b"offset")
        .chain_update(id.as_bytes())
        .finalize();
    u64::from_le_bytes(digest[..8].try_into().expect("8 digest bytes"))
        % ROTATION_PERIOD.as_secs()
}

fn mask(size_bits: u8) -> u64 {
    debug_assert!(size_bits >= 1 && size_bits <= 64, "address space 1..=64");
    if size_bits >= 64 {
        u64::MAX
    } else {
        (1u64 << size_bits) - 1
    }
}

fn derive(id: &Id, size_bits: u8, epoch: u64) -> EphemeralId {
    let digest = Sha256::new()
        .chain_update(DERIVATION_TAG)
        .chain_update(id.as_bytes())
        .chain_update(epoch.to_le_bytes())
        .chain_update([size_bits])
        .finalize();
    let raw = u64::from_le_bytes(digest[..8].try_into().expect("8 digest bytes"));
    EphemeralId(raw & mask(size_bits))
}

fn unix_secs(ts: SystemTime) -> u64 {
    ts.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// The identity window that covers `now` for the given id.
pub fn window_at(id: &Id, size_bits: u8, now: SystemTime) -> IdentityWindow {
    let period = ROTATION_PERIOD.as_secs();
    let offset = rotation_offset(id);
    let shifted = unix_secs(now) + offset;
    let epoch = shifted / period;
    let start = UNIX_EPOCH + Duration::from_secs((epoch * period).saturating_sub(offset));
    IdentityWindow {
        ephemeral: derive(id, size_bits, epoch),
        source: *id,
        start,
        end: start + ROTATION_PERIOD,
    }
}

/// All identity windows overlapping `[from, until)`, oldest first.
///
/// The follower uses this to keep listening through a rotation boundary,
/// so messages addressed to the outgoing ephemeral id are still picked up.
pub fn windows_in_range(
    id: &Id,
    size_bits: u8,
    from: SystemTime,
    until: SystemTime,
) -> Vec<IdentityWindow> {
    let mut out = Vec::new();
    let mut cursor = from;
    loop {
        let w = window_at(id, size_bits, cursor);
        let end = w.end;
        out.push(w);
        if end >= until {
            break;
        }
        cursor = end;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::IdKind;
    use rand::SeedableRng;

    fn test_id(seed: u64) -> Id {
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        Id::random(&mut rng, IdKind::User)
    }

    #[test]
    fn masked_to_address_space() {
        let id = test_id(1);
        for bits in [1u8, 8, 16, 32, 63] {
            let w = window_at(&id, bits, SystemTime::now());
            assert!(w.ephemeral.value() <= super::mask(bits));
        }
    }

    #[test]
    fn stable_within_a_window_rotates_across() {
        let id = test_id(2);
        let now = SystemTime::now();
        let w = window_at(&id, 16, now);
        let mid = w.start + ROTATION_PERIOD / 2;
        assert_eq!(window_at(&id, 16, mid).ephemeral, w.ephemeral);
        let next = window_at(&id, 16, w.end + Duration::from_secs(1));
        // 16-bit space makes an accidental collision unlikely but possible;
        // the windows themselves must always differ.
        assert!(next.start >= w.end);
    }

    #[test]
    fn offsets_stagger_rotation_boundaries() {
        let a = window_at(&test_id(3), 16, SystemTime::now());
        let b = window_at(&test_id(4), 16, SystemTime::now());
        assert_ne!(a.start, b.start);
    }

    #[test]
    fn range_covers_boundary() {
        let id = test_id(5);
        let now = SystemTime::now();
        let windows = windows_in_range(&id, 16, now, now + ROTATION_PERIOD * 2);
        assert!(windows.len() >= 2);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }
}
