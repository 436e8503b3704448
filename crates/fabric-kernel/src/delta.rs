// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Delta records and leaf-patch operations.

use fabric_canonical::{canonical_bytes, CanonError, StateHash};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The three patch operation kinds, per RFC 6902 with fabric refinements:
/// `add` on an existing leaf behaves as `replace`, and `remove` of a missing
/// leaf is a no-op.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchKind {
    /// Set a leaf value, materializing missing ancestors.
    Add,
    /// Replace an existing leaf value (degrades to `add` on absent leaves).
    Replace,
    /// Remove a leaf; absent targets are a no-op.
    Remove,
}

/// A single leaf-targeted patch operation.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct PatchOp {
    /// Operation kind.
    pub op: PatchKind,
    /// RFC 6901 pointer to the leaf being written or removed.
    pub path: String,
    /// Value for `add`/`replace`; absent for `remove`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

impl PatchOp {
    /// Convenience constructor for an `add` op.
    #[must_use]
    pub fn add(path: impl Into<String>, value: Value) -> Self {
        PatchOp {
            op: PatchKind::Add,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Convenience constructor for a `replace` op.
    #[must_use]
    pub fn replace(path: impl Into<String>, value: Value) -> Self {
        PatchOp {
            op: PatchKind::Replace,
            path: path.into(),
            value: Some(value),
        }
    }

    /// Convenience constructor for a `remove` op.
    #[must_use]
    pub fn remove(path: impl Into<String>) -> Self {
        PatchOp {
            op: PatchKind::Remove,
            path: path.into(),
            value: None,
        }
    }
}

/// An immutable, hash-linked record of one committed patch set.
///
/// `prev_hash` is the entity's state hash immediately before apply (the zero
/// hash for genesis); `new_hash` is `SHA256(canonical(new_state))`. Deltas
/// are never mutated or removed once accepted.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Delta {
    /// Opaque delta id, minted as `delta-{16 hex}`.
    pub delta_id: String,
    /// Entity this delta targets.
    pub entity_id: String,
    /// Parent version + 1.
    pub version: u64,
    /// Opaque author tag (`user`, `cognitive-sensor`, `closure_engine`,
    /// `enforcement_system`, `daemon`, …).
    pub author: String,
    /// Wall-clock millis since epoch at commit time.
    pub ts: u64,
    /// Ordered leaf patches applied by this delta.
    pub patches: Vec<PatchOp>,
    /// Entity state hash before apply; [`StateHash::ZERO`] for genesis.
    pub prev_hash: StateHash,
    /// Entity state hash after apply.
    pub new_hash: StateHash,
    /// Optional detached signature over [`Delta::signing_bytes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Delta {
    /// Returns `true` when this is a genesis delta (`prev_hash` is zero).
    #[must_use]
    pub fn is_genesis(&self) -> bool {
        self.prev_hash.is_zero()
    }

    /// Canonical byte form for signing/verification.
    ///
    /// The `signature` field is excluded; everything else is encoded
    /// canonically, so two implementations sign identical bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] when a patch value cannot be canonicalized.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CanonError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        // Delta serialization cannot fail: every field is a plain value.
        let tree = serde_json::to_value(&unsigned).unwrap_or(Value::Null);
        canonical_bytes(&tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Delta {
        Delta {
            delta_id: "delta-00112233445566".to_string(),
            entity_id: "task-8877665544332211".to_string(),
            version: 2,
            author: "user".to_string(),
            ts: 1_700_000_000_000,
            patches: vec![PatchOp::replace("/title", json!("new title"))],
            prev_hash: fabric_canonical::hash_bytes(b"prev"),
            new_hash: fabric_canonical::hash_bytes(b"new"),
            signature: None,
        }
    }

    #[test]
    fn genesis_detection_uses_zero_hash() {
        let mut d = sample();
        assert!(!d.is_genesis());
        d.prev_hash = StateHash::ZERO;
        assert!(d.is_genesis());
    }

    #[test]
    fn signing_bytes_exclude_signature() {
        let mut d = sample();
        let unsigned = d.signing_bytes().unwrap();
        d.signature = Some("sig".to_string());
        let signed = d.signing_bytes().unwrap();
        assert_eq!(unsigned, signed);
        assert!(!String::from_utf8(unsigned).unwrap().contains("signature"));
    }

    #[test]
    fn patch_serde_omits_absent_value() {
        let encoded = serde_json::to_string(&PatchOp::remove("/x")).unwrap();
        assert_eq!(encoded, r#"{"op":"remove","path":"/x"}"#);
        let decoded: PatchOp = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.op, PatchKind::Remove);
        assert!(decoded.value.is_none());
    }

    #[test]
    fn delta_round_trips_through_serde() {
        let d = sample();
        let encoded = serde_json::to_string(&d).unwrap();
        let decoded: Delta = serde_json::from_str(&encoded).unwrap();
        assert_eq!(d, decoded);
    }
}
