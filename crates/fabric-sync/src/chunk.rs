// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chunked delivery of oversized deltas.
//!
//! A delta whose canonical packet form exceeds the peer's `max_packet_bytes`
//! travels as `DELTAS_CHUNK` fragments: the delta's canonical bytes are
//! split into raw pieces, each base64-encoded into its own packet. The
//! base64 budget per packet is `max_packet_bytes` minus the nominal header
//! overhead; raw piece size is ¾ of that. Receivers buffer fragments per
//! `delta_id`, reassemble when all indices are present, and expire partial
//! buffers on a timeout.

use crate::error::SyncError;
use crate::packet::{Packet, PacketBody};
use fabric_canonical::canonical_bytes;
use fabric_kernel::Delta;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Envelope overhead per chunk packet (type tag, ids, indices, framing),
/// sized so a default-budget chunk packet never exceeds 220 canonical bytes.
pub const CHUNK_HEADER_BYTES: usize = 140;

/// Default partial-buffer expiry window.
pub const DEFAULT_CHUNK_EXPIRY_MS: u64 = 30_000;

/// Base64 payload budget for a given packet budget.
#[must_use]
pub fn payload_budget(max_packet_bytes: usize) -> usize {
    max_packet_bytes.saturating_sub(CHUNK_HEADER_BYTES).max(20)
}

/// Raw byte budget per piece: base64 inflates 3 bytes into 4 chars.
fn raw_piece_budget(max_packet_bytes: usize) -> usize {
    (payload_budget(max_packet_bytes) / 4 * 3).max(12)
}

/// Returns `true` when a DELTAS packet holding just this delta would exceed
/// the budget and the delta must be chunked.
///
/// # Errors
///
/// Returns [`SyncError::Canon`] when the delta cannot be canonicalized.
pub fn needs_chunking(
    node_id: &str,
    delta: &Delta,
    max_packet_bytes: usize,
) -> Result<bool, SyncError> {
    let probe = Packet::new(
        node_id,
        PacketBody::Deltas {
            deltas: vec![delta.clone()],
        },
    );
    Ok(probe.canonical_size()? > max_packet_bytes)
}

/// Splits a delta into `DELTAS_CHUNK` packets.
///
/// # Errors
///
/// Returns [`SyncError::Canon`] when the delta cannot be canonicalized.
pub fn chunk_delta(
    node_id: &str,
    delta: &Delta,
    max_packet_bytes: usize,
) -> Result<Vec<Packet>, SyncError> {
    let tree = serde_json::to_value(delta).unwrap_or(serde_json::Value::Null);
    let bytes = canonical_bytes(&tree)?;
    let budget = raw_piece_budget(max_packet_bytes);
    let pieces: Vec<&[u8]> = bytes.chunks(budget).collect();
    let total = pieces.len() as u32;
    debug!(delta_id = %delta.delta_id, total, "chunking oversized delta");
    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            Packet::new(
                node_id,
                PacketBody::DeltasChunk {
                    delta_id: delta.delta_id.clone(),
                    chunk_index: i as u32,
                    chunk_total: total,
                    chunk_payload: base64::encode(piece),
                },
            )
        })
        .collect())
}

struct PartialDelta {
    total: u32,
    pieces: BTreeMap<u32, Vec<u8>>,
    first_seen_ms: u64,
}

/// Per-peer reassembly buffer for chunked deltas.
pub struct ChunkBuffer {
    expiry_ms: u64,
    partial: BTreeMap<String, PartialDelta>,
}

impl ChunkBuffer {
    /// Creates a buffer whose partial entries expire after `expiry_ms`.
    #[must_use]
    pub fn new(expiry_ms: u64) -> Self {
        ChunkBuffer {
            expiry_ms,
            partial: BTreeMap::new(),
        }
    }

    /// Number of deltas currently mid-reassembly.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.partial.len()
    }

    /// Accepts one fragment. Returns the reassembled delta once every index
    /// is present.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ChunkMismatch`] for inconsistent totals, bad
    /// base64, an out-of-range index, or a reassembled payload that does not
    /// parse back into the declared delta.
    pub fn accept(
        &mut self,
        delta_id: &str,
        chunk_index: u32,
        chunk_total: u32,
        chunk_payload: &str,
        now_ms: u64,
    ) -> Result<Option<Delta>, SyncError> {
        if chunk_total == 0 || chunk_index >= chunk_total {
            return Err(SyncError::ChunkMismatch {
                delta_id: delta_id.to_string(),
                detail: format!("index {chunk_index} out of range of {chunk_total}"),
            });
        }
        let piece = base64::decode(chunk_payload).map_err(|e| SyncError::ChunkMismatch {
            delta_id: delta_id.to_string(),
            detail: format!("bad base64: {e}"),
        })?;
        let entry = self
            .partial
            .entry(delta_id.to_string())
            .or_insert_with(|| PartialDelta {
                total: chunk_total,
                pieces: BTreeMap::new(),
                first_seen_ms: now_ms,
            });
        if entry.total != chunk_total {
            let detail = format!("total changed from {} to {chunk_total}", entry.total);
            self.partial.remove(delta_id);
            return Err(SyncError::ChunkMismatch {
                delta_id: delta_id.to_string(),
                detail,
            });
        }
        entry.pieces.insert(chunk_index, piece);
        if entry.pieces.len() < entry.total as usize {
            return Ok(None);
        }

        // All indices present: reassemble and validate.
        let Some(done) = self.partial.remove(delta_id) else {
            return Ok(None);
        };
        let mut bytes = Vec::new();
        for piece in done.pieces.values() {
            bytes.extend_from_slice(piece);
        }
        let delta: Delta =
            serde_json::from_slice(&bytes).map_err(|e| SyncError::ChunkMismatch {
                delta_id: delta_id.to_string(),
                detail: format!("reassembled payload unparseable: {e}"),
            })?;
        if delta.delta_id != delta_id {
            return Err(SyncError::ChunkMismatch {
                delta_id: delta_id.to_string(),
                detail: format!("payload declares {:?}", delta.delta_id),
            });
        }
        Ok(Some(delta))
    }

    /// Drops partial buffers older than the expiry window. Returns the ids
    /// dropped.
    pub fn expire(&mut self, now_ms: u64) -> Vec<String> {
        let expired: Vec<String> = self
            .partial
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.first_seen_ms) > self.expiry_ms)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            warn!(delta_id = %id, "chunk reassembly expired");
            self.partial.remove(id);
        }
        expired
    }
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        ChunkBuffer::new(DEFAULT_CHUNK_EXPIRY_MS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::DEFAULT_MAX_PACKET_BYTES;
    use fabric_canonical::hash_bytes;
    use fabric_kernel::PatchOp;
    use serde_json::json;

    fn big_delta() -> Delta {
        Delta {
            delta_id: "delta-big00000000".to_string(),
            entity_id: "note-0000000000000001".to_string(),
            version: 2,
            author: "user".to_string(),
            ts: 1_700_000_000_000,
            patches: vec![PatchOp::replace(
                "/content",
                json!("x".repeat(4096)),
            )],
            prev_hash: hash_bytes(b"prev"),
            new_hash: hash_bytes(b"new"),
            signature: None,
        }
    }

    fn reassemble(packets: &[Packet]) -> Delta {
        let mut buffer = ChunkBuffer::default();
        let mut out = None;
        for p in packets {
            let PacketBody::DeltasChunk {
                delta_id,
                chunk_index,
                chunk_total,
                chunk_payload,
            } = &p.body
            else {
                panic!("expected chunk packet");
            };
            out = buffer
                .accept(delta_id, *chunk_index, *chunk_total, chunk_payload, 0)
                .unwrap();
        }
        out.expect("all chunks delivered")
    }

    #[test]
    fn oversized_delta_round_trips_through_chunks() {
        let delta = big_delta();
        assert!(needs_chunking("n", &delta, DEFAULT_MAX_PACKET_BYTES).unwrap());
        let packets = chunk_delta("n", &delta, DEFAULT_MAX_PACKET_BYTES).unwrap();
        // A 4 KB payload needs at least ⌈4096 / 150⌉ fragments.
        assert!(packets.len() >= 4096 / 150);
        for p in &packets {
            assert!(p.canonical_size().unwrap() <= DEFAULT_MAX_PACKET_BYTES);
        }
        let rebuilt = reassemble(&packets);
        assert_eq!(rebuilt, delta);
        assert_eq!(rebuilt.new_hash, delta.new_hash);
    }

    #[test]
    fn out_of_order_delivery_reassembles() {
        let delta = big_delta();
        let mut packets = chunk_delta("n", &delta, DEFAULT_MAX_PACKET_BYTES).unwrap();
        packets.reverse();
        let rebuilt = reassemble(&packets);
        assert_eq!(rebuilt, delta);
    }

    #[test]
    fn partial_buffers_expire() {
        let delta = big_delta();
        let packets = chunk_delta("n", &delta, DEFAULT_MAX_PACKET_BYTES).unwrap();
        let mut buffer = ChunkBuffer::new(1_000);
        let PacketBody::DeltasChunk {
            delta_id,
            chunk_index,
            chunk_total,
            chunk_payload,
        } = &packets[0].body
        else {
            panic!("expected chunk packet");
        };
        buffer
            .accept(delta_id, *chunk_index, *chunk_total, chunk_payload, 0)
            .unwrap();
        assert_eq!(buffer.pending(), 1);
        assert!(buffer.expire(500).is_empty());
        assert_eq!(buffer.expire(2_000), vec![delta_id.clone()]);
        assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn inconsistent_totals_reset_the_buffer() {
        let mut buffer = ChunkBuffer::default();
        buffer
            .accept("delta-x", 0, 3, &base64::encode(b"abc"), 0)
            .unwrap();
        let err = buffer
            .accept("delta-x", 1, 4, &base64::encode(b"def"), 0)
            .unwrap_err();
        assert!(matches!(err, SyncError::ChunkMismatch { .. }));
        assert_eq!(buffer.pending(), 0);
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn chunk_reassemble_identity(len in 1usize..6000, budget in 120usize..512) {
                let mut delta = big_delta();
                delta.patches = vec![PatchOp::replace("/content", json!("y".repeat(len)))];
                let packets = chunk_delta("n", &delta, budget).unwrap();
                let rebuilt = reassemble(&packets);
                prop_assert_eq!(rebuilt, delta);
            }
        }
    }
}
