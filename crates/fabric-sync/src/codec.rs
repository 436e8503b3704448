// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Wire encodings for packets.
//!
//! The canonical (hashing/signing) form is always JSON with sorted keys; the
//! bytes on the wire may be that same JSON or CBOR when both peers advertise
//! `supports_cbor`. Either way the decoded packet is identical.

use crate::error::SyncError;
use crate::packet::{Capabilities, Packet};
use fabric_canonical::canonical_bytes;

/// Wire encodings.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum WireFormat {
    /// Canonical JSON bytes.
    #[default]
    Json,
    /// CBOR (negotiated via `supports_cbor`).
    Cbor,
}

/// Picks the wire format both peers support.
#[must_use]
pub fn negotiate(ours: &Capabilities, theirs: &Capabilities) -> WireFormat {
    if ours.supports_cbor && theirs.supports_cbor {
        WireFormat::Cbor
    } else {
        WireFormat::Json
    }
}

/// Encodes a packet for the wire.
///
/// # Errors
///
/// Returns [`SyncError::Codec`] when serialization fails.
pub fn encode(packet: &Packet, format: WireFormat) -> Result<Vec<u8>, SyncError> {
    match format {
        WireFormat::Json => {
            let tree = serde_json::to_value(packet)
                .map_err(|e| SyncError::Codec { detail: e.to_string() })?;
            canonical_bytes(&tree).map_err(|e| SyncError::Codec { detail: e.to_string() })
        }
        WireFormat::Cbor => {
            let mut out = Vec::new();
            ciborium::ser::into_writer(packet, &mut out)
                .map_err(|e| SyncError::Codec { detail: e.to_string() })?;
            Ok(out)
        }
    }
}

/// Decodes a packet from the wire.
///
/// # Errors
///
/// Returns [`SyncError::Codec`] when the bytes do not parse as a packet.
pub fn decode(bytes: &[u8], format: WireFormat) -> Result<Packet, SyncError> {
    match format {
        WireFormat::Json => serde_json::from_slice(bytes)
            .map_err(|e| SyncError::Codec { detail: e.to_string() }),
        WireFormat::Cbor => ciborium::de::from_reader(bytes)
            .map_err(|e: ciborium::de::Error<std::io::Error>| SyncError::Codec {
                detail: e.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::PacketBody;

    #[test]
    fn json_round_trip_is_canonical() {
        let packet = Packet::new(
            "node-a",
            PacketBody::Ack {
                delta_ids: vec!["delta-1".to_string()],
            },
        );
        let bytes = encode(&packet, WireFormat::Json).unwrap();
        // Sorted keys, no whitespace.
        let text = String::from_utf8(bytes.clone()).unwrap();
        assert!(!text.contains(' '));
        let decoded = decode(&bytes, WireFormat::Json).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn cbor_round_trip() {
        let packet = Packet::new(
            "node-b",
            PacketBody::Want {
                wants: vec![crate::packet::WantEntry {
                    entity_id: "task-0001".to_string(),
                    since_hash: fabric_canonical::StateHash::ZERO,
                }],
            },
        );
        let bytes = encode(&packet, WireFormat::Cbor).unwrap();
        let decoded = decode(&bytes, WireFormat::Cbor).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn negotiation_prefers_cbor_only_when_mutual() {
        let cbor = Capabilities::default();
        let json_only = Capabilities {
            supports_cbor: false,
            ..Capabilities::default()
        };
        assert_eq!(negotiate(&cbor, &cbor), WireFormat::Cbor);
        assert_eq!(negotiate(&cbor, &json_only), WireFormat::Json);
    }
}
