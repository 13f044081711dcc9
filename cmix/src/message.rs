// Copyright (c) 2025 The Haze Project

//! The fixed-width cMix wire message.
//!
//! A message is two payload halves, each exactly one group element wide:
//!
//! ```text
//! half A: [ key fingerprint (32) | contents A ]
//! half B: [ mac (32) | service hash (25) | contents B ]
//! ```
//!
//! The top bit of the fingerprint and of the MAC is reserved: keeping it
//! zero guarantees each half is below the group prime and therefore a
//! valid group element. On the wire the two reserved bits are randomized
//! to deny tagging; receivers clear them before parsing.

use crate::error::{CmixError, Result};
use haze_crypto::{KeyFingerprint, FINGERPRINT_LEN, SIH_LEN};
use rand::Rng;

/// Byte length of the MAC field.
pub const MAC_LEN: usize = 32;

/// Fixed header of half A.
const HEADER_A: usize = FINGERPRINT_LEN;
/// Fixed header of half B.
const HEADER_B: usize = MAC_LEN + SIH_LEN;

/// Smallest prime length that leaves room for both headers.
pub const MIN_PRIME_LEN: usize = HEADER_B + 1;

/// A parsed cMix message, sized for a specific group prime length.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CmixMessage {
    prime_len: usize,
    half_a: Vec<u8>,
    half_b: Vec<u8>,
}

impl CmixMessage {
    /// An empty message for the given prime length.
    pub fn new(prime_len: usize) -> Result<Self> {
        if prime_len < MIN_PRIME_LEN {
            return Err(CmixError::MalformedMessage(format!(
                "prime length {prime_len} below minimum {MIN_PRIME_LEN}"
            )));
        }
        Ok(CmixMessage {
            prime_len,
            half_a: vec![0u8; prime_len],
            half_b: vec![0u8; prime_len],
        })
    }

    /// Total wire length: both halves.
    pub fn wire_len(&self) -> usize {
        2 * self.prime_len
    }

    /// Capacity of contents A.
    pub fn contents_a_len(&self) -> usize {
        self.prime_len - HEADER_A
    }

    /// Capacity of contents B.
    pub fn contents_b_len(&self) -> usize {
        self.prime_len - HEADER_B
    }

    /// Total contents capacity across both halves.
    pub fn contents_len(&self) -> usize {
        self.contents_a_len() + self.contents_b_len()
    }

    /// Set the key fingerprint.
    pub fn set_fingerprint(&mut self, fp: &KeyFingerprint) {
        // Top bit is clear by construction of KeyFingerprint.
        self.half_a[..FINGERPRINT_LEN].copy_from_slice(fp.as_bytes());
    }

    /// The key fingerprint, with the wire's reserved bit cleared.
    pub fn fingerprint(&self) -> KeyFingerprint {
        let bytes: [u8; FINGERPRINT_LEN] = self.half_a[..FINGERPRINT_LEN]
            .try_into()
            .expect("fingerprint width");
        KeyFingerprint::from_wire(bytes)
    }

    /// Set the MAC. Aborts if the reserved top bit is set: that is a
    /// programmer error at write time, not a runtime condition.
    pub fn set_mac(&mut self, mac: &[u8; MAC_LEN]) {
        assert_eq!(mac[0] & 0x80, 0, "MAC top bit is reserved");
        self.half_b[..MAC_LEN].copy_from_slice(mac);
    }

    /// The MAC, with the wire's reserved bit cleared.
    pub fn mac(&self) -> [u8; MAC_LEN] {
        let mut mac: [u8; MAC_LEN] = self.half_b[..MAC_LEN].try_into().expect("mac width");
        mac[0] &= 0x7f;
        mac
    }

    /// Set the service identification hash.
    pub fn set_sih(&mut self, sih: &[u8; SIH_LEN]) {
        self.half_b[MAC_LEN..MAC_LEN + SIH_LEN].copy_from_slice(sih);
    }

    /// The service identification hash.
    pub fn sih(&self) -> [u8; SIH_LEN] {
        self.half_b[MAC_LEN..MAC_LEN + SIH_LEN]
            .try_into()
            .expect("sih width")
    }

    /// Store contents, split across the two halves. Shorter contents are
    /// zero-padded; longer contents are rejected.
    pub fn set_contents(&mut self, contents: &[u8]) -> Result<()> {
        if contents.len() > self.contents_len() {
            return Err(CmixError::MalformedMessage(format!(
                "contents {} exceed capacity {}",
                contents.len(),
                self.contents_len()
            )));
        }
        let a_len = self.contents_a_len().min(contents.len());
        self.half_a[HEADER_A..].fill(0);
        self.half_b[HEADER_B..].fill(0);
        self.half_a[HEADER_A..HEADER_A + a_len].copy_from_slice(&contents[..a_len]);
        let rest = &contents[a_len..];
        self.half_b[HEADER_B..HEADER_B + rest.len()].copy_from_slice(rest);
        Ok(())
    }

    /// The concatenated contents of both halves (zero padding included).
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.contents_len());
        out.extend_from_slice(&self.half_a[HEADER_A..]);
        out.extend_from_slice(&self.half_b[HEADER_B..]);
        out
    }

    /// Payload half A as a group-element-wide byte string.
    pub fn payload_a(&self) -> &[u8] {
        &self.half_a
    }

    /// Payload half B.
    pub fn payload_b(&self) -> &[u8] {
        &self.half_b
    }

    /// Replace both payload halves (after onion encryption).
    pub fn set_payloads(&mut self, a: Vec<u8>, b: Vec<u8>) -> Result<()> {
        if a.len() != self.prime_len || b.len() != self.prime_len {
            return Err(CmixError::MalformedMessage(
                "payload halves must be prime length".into(),
            ));
        }
        self.half_a = a;
        self.half_b = b;
        Ok(())
    }

    /// Randomize the two reserved group-membership bits for transmission.
    pub fn randomize_group_bits<R: Rng>(&mut self, rng: &mut R) {
        set_top_bit(&mut self.half_a[0], rng.gen());
        set_top_bit(&mut self.half_b[0], rng.gen());
    }

    /// Clear the reserved bits, as done on every receive path.
    pub fn clear_group_bits(&mut self) {
        self.half_a[0] &= 0x7f;
        self.half_b[0] &= 0x7f;
    }

    /// Serialize to the wire form.
    pub fn marshal(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_len());
        out.extend_from_slice(&self.half_a);
        out.extend_from_slice(&self.half_b);
        out
    }

    /// Parse a wire-form message of the given prime length, clearing the
    /// reserved group bits.
    pub fn unmarshal(prime_len: usize, wire: &[u8]) -> Result<Self> {
        if wire.len() != 2 * prime_len {
            return Err(CmixError::MalformedMessage(format!(
                "wire length {} != {}",
                wire.len(),
                2 * prime_len
            )));
        }
        let mut msg = CmixMessage {
            prime_len,
            half_a: wire[..prime_len].to_vec(),
            half_b: wire[prime_len..].to_vec(),
        };
        msg.clear_group_bits();
        Ok(msg)
    }
}

fn set_top_bit(byte: &mut u8, on: bool) {
    if on {
        *byte |= 0x80;
    } else {
        *byte &= 0x7f;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use haze_crypto::derive_key_fingerprint;
    use rand::SeedableRng;

    const PRIME_LEN: usize = 128;

    #[test]
    fn marshal_unmarshal_round_trip() {
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        msg.set_fingerprint(&derive_key_fingerprint(&[1u8; 32], 0));
        msg.set_mac(&haze_crypto::make_mac(&[2u8; 32], b"ct"));
        msg.set_sih(&haze_crypto::service_tag_hash(b"chat", b"ct"));
        msg.set_contents(b"hello world").unwrap();
        let wire = msg.marshal();
        assert_eq!(wire.len(), 2 * PRIME_LEN);
        let back = CmixMessage::unmarshal(PRIME_LEN, &wire).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn reserved_bits_cleared_on_unmarshal() {
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        msg.set_contents(b"payload").unwrap();
        let mut rng = rand::rngs::StdRng::seed_from_u64(3);
        msg.randomize_group_bits(&mut rng);
        let back = CmixMessage::unmarshal(PRIME_LEN, &msg.marshal()).unwrap();
        assert_eq!(back.fingerprint().as_bytes()[0] & 0x80, 0);
        assert_eq!(back.mac()[0] & 0x80, 0);
    }

    #[test]
    fn contents_split_across_halves() {
        let msg_cap = CmixMessage::new(PRIME_LEN).unwrap();
        let long = vec![0xabu8; msg_cap.contents_a_len() + 5];
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        msg.set_contents(&long).unwrap();
        let got = msg.contents();
        assert_eq!(&got[..long.len()], &long[..]);
        assert!(got[long.len()..].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_contents_rejected() {
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        let too_long = vec![0u8; msg.contents_len() + 1];
        assert!(msg.set_contents(&too_long).is_err());
    }

    #[test]
    #[should_panic(expected = "MAC top bit is reserved")]
    fn mac_top_bit_write_aborts() {
        let mut msg = CmixMessage::new(PRIME_LEN).unwrap();
        let mut bad = [0u8; MAC_LEN];
        bad[0] = 0x80;
        msg.set_mac(&bad);
    }

    #[test]
    fn wrong_wire_length_rejected() {
        assert!(CmixMessage::unmarshal(PRIME_LEN, &[0u8; 100]).is_err());
    }
}
