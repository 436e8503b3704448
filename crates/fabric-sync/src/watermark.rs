// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-peer watermarks: the last heads each peer is known to hold.
//!
//! Watermarks let a HEADS exchange ship only entities whose tip changed
//! since the peer last acknowledged them. They are an optimization, never an
//! authority — a lost watermark file just means the next exchange is full.

use crate::packet::Head;
use fabric_canonical::StateHash;
use fabric_store::{read_json_artifact, write_json_artifact, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

const WATERMARKS_FILE: &str = "peer_watermarks.json";

/// What one peer is known to hold.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct PeerWatermark {
    /// Last completed sync with this peer, millis since epoch.
    pub last_sync_at: u64,
    /// Last known head hash per entity.
    #[serde(default)]
    pub entity_heads: BTreeMap<String, StateHash>,
}

/// Durable per-peer watermark map.
pub struct WatermarkStore {
    path: PathBuf,
    peers: BTreeMap<String, PeerWatermark>,
}

impl WatermarkStore {
    /// Opens (or initializes) the watermark artifact under `data_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O failure; a missing file is an empty map.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = data_dir.into().join(WATERMARKS_FILE);
        let peers = read_json_artifact(&path)?.unwrap_or_default();
        Ok(WatermarkStore { path, peers })
    }

    /// The watermark for a peer, if any sync ever completed.
    #[must_use]
    pub fn peer(&self, peer_id: &str) -> Option<&PeerWatermark> {
        self.peers.get(peer_id)
    }

    /// Filters local heads down to those the peer does not already hold.
    #[must_use]
    pub fn changed_heads(&self, peer_id: &str, local: &[Head]) -> Vec<Head> {
        let Some(mark) = self.peers.get(peer_id) else {
            return local.to_vec();
        };
        local
            .iter()
            .filter(|h| mark.entity_heads.get(&h.entity_id) != Some(&h.state_hash))
            .cloned()
            .collect()
    }

    /// Records heads the peer has acknowledged holding.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the artifact write fails.
    pub fn record_acked(
        &mut self,
        peer_id: &str,
        heads: &[Head],
        now_ms: u64,
    ) -> Result<(), StoreError> {
        let mark = self.peers.entry(peer_id.to_string()).or_default();
        for head in heads {
            mark.entity_heads
                .insert(head.entity_id.clone(), head.state_hash);
        }
        mark.last_sync_at = now_ms;
        write_json_artifact(&self.path, &self.peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_canonical::hash_bytes;

    fn head(id: &str, tag: &[u8]) -> Head {
        Head {
            entity_id: id.to_string(),
            version: 1,
            state_hash: hash_bytes(tag),
        }
    }

    #[test]
    fn unknown_peer_gets_full_heads() {
        let dir = tempfile::tempdir().unwrap();
        let marks = WatermarkStore::open(dir.path()).unwrap();
        let local = vec![head("a", b"1"), head("b", b"2")];
        assert_eq!(marks.changed_heads("peer-x", &local).len(), 2);
    }

    #[test]
    fn acked_heads_are_filtered_until_they_change() {
        let dir = tempfile::tempdir().unwrap();
        let mut marks = WatermarkStore::open(dir.path()).unwrap();
        let local = vec![head("a", b"1"), head("b", b"2")];
        marks.record_acked("peer-x", &local[..1], 100).unwrap();

        let changed = marks.changed_heads("peer-x", &local);
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].entity_id, "b");

        // Entity `a` advances: it shows up again.
        let advanced = vec![head("a", b"1-new"), head("b", b"2")];
        let changed = marks.changed_heads("peer-x", &advanced);
        assert_eq!(changed.len(), 2);
    }

    #[test]
    fn watermarks_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut marks = WatermarkStore::open(dir.path()).unwrap();
            marks
                .record_acked("peer-x", &[head("a", b"1")], 42)
                .unwrap();
        }
        let marks = WatermarkStore::open(dir.path()).unwrap();
        let mark = marks.peer("peer-x").unwrap();
        assert_eq!(mark.last_sync_at, 42);
        assert_eq!(mark.entity_heads.len(), 1);
    }
}
