// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Heads diffing and want generation.

use crate::error::SyncError;
use crate::packet::{Head, WantEntry};
use fabric_canonical::StateHash;
use fabric_kernel::Delta;
use fabric_store::Store;
use std::collections::BTreeMap;

/// Classification of entities given two head lists.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct HeadsDiff {
    /// Present locally, absent remotely.
    pub local_only: Vec<String>,
    /// Absent locally, present remotely.
    pub remote_only: Vec<String>,
    /// Present on both sides with differing hashes.
    pub diverged: Vec<String>,
    /// Identical on both sides.
    pub synced: Vec<String>,
}

/// Diffs local heads against a peer's.
#[must_use]
pub fn diff_heads(local: &[Head], remote: &[Head]) -> HeadsDiff {
    let local_map: BTreeMap<&str, &Head> =
        local.iter().map(|h| (h.entity_id.as_str(), h)).collect();
    let remote_map: BTreeMap<&str, &Head> =
        remote.iter().map(|h| (h.entity_id.as_str(), h)).collect();
    let mut diff = HeadsDiff::default();
    for (id, head) in &local_map {
        match remote_map.get(id) {
            None => diff.local_only.push((*id).to_string()),
            Some(theirs) if theirs.state_hash == head.state_hash => {
                diff.synced.push((*id).to_string());
            }
            Some(_) => diff.diverged.push((*id).to_string()),
        }
    }
    for id in remote_map.keys() {
        if !local_map.contains_key(id) {
            diff.remote_only.push((*id).to_string());
        }
    }
    diff
}

/// Builds WANT entries from a diff: remote-only entities from genesis,
/// diverged entities from the local head.
#[must_use]
pub fn build_wants(diff: &HeadsDiff, local: &[Head]) -> Vec<WantEntry> {
    let local_map: BTreeMap<&str, &Head> =
        local.iter().map(|h| (h.entity_id.as_str(), h)).collect();
    let mut wants = Vec::new();
    for id in &diff.remote_only {
        wants.push(WantEntry {
            entity_id: id.clone(),
            since_hash: StateHash::ZERO,
        });
    }
    for id in &diff.diverged {
        let since = local_map
            .get(id.as_str())
            .map_or(StateHash::ZERO, |h| h.state_hash);
        wants.push(WantEntry {
            entity_id: id.clone(),
            since_hash: since,
        });
    }
    wants
}

/// Reads the store's current heads, one per entity.
///
/// # Errors
///
/// Returns [`SyncError`] on store failure.
pub fn local_heads(store: &dyn Store) -> Result<Vec<Head>, SyncError> {
    Ok(store
        .load_entities()?
        .into_iter()
        .map(|r| Head {
            entity_id: r.entity.entity_id,
            version: r.entity.version,
            state_hash: r.entity.state_hash,
        })
        .collect())
}

/// Walks an entity's log forward from `since_hash`.
///
/// The zero hash yields the entity's full history. An unknown `since_hash`
/// (the requester's head is on a branch this node never saw) falls back to
/// the full history so the requester can detect and resolve the divergence.
///
/// # Errors
///
/// Returns [`SyncError`] on store failure.
pub fn deltas_since(
    store: &dyn Store,
    entity_id: &str,
    since_hash: StateHash,
) -> Result<Vec<Delta>, SyncError> {
    let log = store.load_deltas_for_entity(entity_id)?;
    if since_hash.is_zero() {
        return Ok(log);
    }
    // Walk the hash chain forward from the requested cut point.
    let mut out = Vec::new();
    let mut cursor = since_hash;
    loop {
        let next = log.iter().find(|d| d.prev_hash == cursor);
        match next {
            Some(delta) => {
                cursor = delta.new_hash;
                out.push(delta.clone());
            }
            None => break,
        }
    }
    if out.is_empty() && !log.iter().any(|d| d.new_hash == since_hash) {
        // The cut point is not on our chain at all: bootstrap the requester.
        return Ok(log);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_canonical::hash_bytes;

    fn head(id: &str, version: u64, tag: &[u8]) -> Head {
        Head {
            entity_id: id.to_string(),
            version,
            state_hash: hash_bytes(tag),
        }
    }

    #[test]
    fn diff_classifies_all_four_ways() {
        let local = vec![
            head("a", 1, b"same"),
            head("b", 2, b"ours"),
            head("c", 1, b"local-only"),
        ];
        let remote = vec![
            head("a", 1, b"same"),
            head("b", 3, b"theirs"),
            head("d", 1, b"remote-only"),
        ];
        let diff = diff_heads(&local, &remote);
        assert_eq!(diff.synced, ["a"]);
        assert_eq!(diff.diverged, ["b"]);
        assert_eq!(diff.local_only, ["c"]);
        assert_eq!(diff.remote_only, ["d"]);
    }

    #[test]
    fn wants_request_genesis_for_unknown_entities() {
        let local = vec![head("b", 2, b"ours")];
        let remote = vec![head("b", 3, b"theirs"), head("d", 1, b"new")];
        let diff = diff_heads(&local, &remote);
        let wants = build_wants(&diff, &local);
        assert_eq!(wants.len(), 2);
        let new = wants.iter().find(|w| w.entity_id == "d").unwrap();
        assert!(new.since_hash.is_zero());
        let diverged = wants.iter().find(|w| w.entity_id == "b").unwrap();
        assert_eq!(diverged.since_hash, hash_bytes(b"ours"));
    }
}
