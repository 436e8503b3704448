// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Canonical JSON byte form and SHA-256 state hashing for Delta Fabric.
//!
//! Every hash in the fabric — entity state hashes, delta chain links, packet
//! signing forms — is computed over the canonical byte encoding produced by
//! this crate. Interop across implementations requires byte-for-byte identical
//! canonical forms, so the encoder enforces:
//!
//! - Object keys sorted by Unicode code point, recursively
//! - No insignificant whitespace
//! - Explicit `null`
//! - Integers emitted without a fractional part; floats via the shortest
//!   round-tripping decimal
//! - `NaN` and ±∞ rejected
//!
//! # Hash Domain Policy
//!
//! State hashes are content-only: `SHA256(canonical(state))` with no domain
//! prefix. Two states with identical canonical bytes are the same state. The
//! genesis sentinel is [`StateHash::ZERO`] (32 zero bytes), which no real
//! SHA-256 output collides with in practice.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod canonical;
pub use canonical::{canonical_bytes, canonical_string, CanonError};

use serde_json::Value;
use sha2::{Digest, Sha256};

/// A 32-byte SHA-256 state hash.
///
/// Thin newtype over `[u8; 32]`. The inner bytes are public for zero-cost
/// access; the `Display` impl renders lowercase hex (64 chars), which is the
/// only externally visible form. Serde round-trips through the hex form.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StateHash(pub [u8; 32]);

impl StateHash {
    /// The genesis sentinel: 32 zero bytes.
    ///
    /// A genesis delta's `prev_hash` is always `ZERO`; no other delta may
    /// carry it.
    pub const ZERO: StateHash = StateHash([0u8; 32]);

    /// View the hash as a byte slice.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Returns `true` if this is the genesis sentinel.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }

    /// Renders the hash as a lowercase hex string (64 chars).
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parses a 64-char lowercase hex string into a hash.
    ///
    /// # Errors
    ///
    /// Returns [`HashParseError`] when the input is not exactly 64 hex chars.
    pub fn parse_hex(s: &str) -> Result<Self, HashParseError> {
        if s.len() != 64 {
            return Err(HashParseError::BadLength { len: s.len() });
        }
        let bytes = hex::decode(s).map_err(|_| HashParseError::BadDigit)?;
        let mut out = [0u8; 32];
        out.copy_from_slice(&bytes);
        Ok(StateHash(out))
    }
}

impl std::fmt::Display for StateHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl serde::Serialize for StateHash {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> serde::Deserialize<'de> for StateHash {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize<'de>>::deserialize(deserializer)?;
        StateHash::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Errors from parsing the hex form of a [`StateHash`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HashParseError {
    /// Input was not 64 characters long.
    #[error("expected 64 hex chars, got {len}")]
    BadLength {
        /// Observed input length.
        len: usize,
    },
    /// Input contained a non-hex character.
    #[error("invalid hex digit")]
    BadDigit,
}

/// Computes the SHA-256 hash of raw bytes.
#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> StateHash {
    let digest = Sha256::digest(bytes);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    StateHash(out)
}

/// Computes the SHA-256 hash of a value's canonical byte form.
///
/// # Errors
///
/// Returns [`CanonError`] when the value cannot be canonicalized (non-finite
/// number).
pub fn hash_canonical(value: &Value) -> Result<StateHash, CanonError> {
    Ok(hash_bytes(&canonical_bytes(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn zero_hash_renders_64_zeros() {
        assert_eq!(StateHash::ZERO.to_hex(), "0".repeat(64));
        assert!(StateHash::ZERO.is_zero());
    }

    #[test]
    fn empty_object_hash_matches_known_vector() {
        // SHA256("{}")
        let h = hash_canonical(&json!({})).unwrap();
        assert_eq!(
            h.to_hex(),
            "44136fa355b3678a1146ad16f7e8649e94fb4fc21fe77e8310c060f61caaff8a"
        );
    }

    #[test]
    fn hex_round_trip() {
        let h = hash_bytes(b"delta-fabric");
        let parsed = StateHash::parse_hex(&h.to_hex()).unwrap();
        assert_eq!(h, parsed);
    }

    #[test]
    fn parse_rejects_bad_inputs() {
        assert!(matches!(
            StateHash::parse_hex("ab"),
            Err(HashParseError::BadLength { len: 2 })
        ));
        let not_hex = "zz".repeat(32);
        assert!(matches!(
            StateHash::parse_hex(&not_hex),
            Err(HashParseError::BadDigit)
        ));
    }

    #[test]
    fn serde_round_trips_through_hex() {
        let h = hash_bytes(b"x");
        let encoded = serde_json::to_string(&h).unwrap();
        assert_eq!(encoded, format!("\"{}\"", h.to_hex()));
        let decoded: StateHash = serde_json::from_str(&encoded).unwrap();
        assert_eq!(h, decoded);
    }
}
