// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sync packet schema and the canonical signing form.
//!
//! Every packet carries `node_id`, an optional `nonce`, and an optional
//! detached `signature` computed over the packet's canonical byte form with
//! the `signature` field excluded. The canonical form is JSON with sorted
//! keys and no whitespace regardless of the wire encoding in use.

use fabric_canonical::{canonical_bytes, CanonError, StateHash};
use fabric_kernel::{Delta, Signer, Verifier};
use serde::{Deserialize, Serialize};

/// Wire protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default datagram budget: one LoRa frame.
pub const DEFAULT_MAX_PACKET_BYTES: usize = 220;

/// Capabilities advertised in HELLO.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Capabilities {
    /// Protocol version.
    pub protocol_version: u32,
    /// Largest datagram the sender will accept.
    pub max_packet_bytes: usize,
    /// Whether CBOR wire encoding is supported.
    pub supports_cbor: bool,
    /// Whether payload encryption is supported.
    pub supports_encryption: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Capabilities {
            protocol_version: PROTOCOL_VERSION,
            max_packet_bytes: DEFAULT_MAX_PACKET_BYTES,
            supports_cbor: true,
            supports_encryption: false,
        }
    }
}

/// One entity tip in a HEADS packet.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Head {
    /// Entity id.
    pub entity_id: String,
    /// Tip version.
    pub version: u64,
    /// Tip state hash.
    pub state_hash: StateHash,
}

/// One request in a WANT packet.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct WantEntry {
    /// Entity being requested.
    pub entity_id: String,
    /// Walk the responder's log forward from this hash; the zero hash
    /// requests from genesis.
    pub since_hash: StateHash,
}

/// Why a packet or delta was rejected.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    /// Delta did not link onto any known head.
    HashChainBroken,
    /// Delta referenced an entity this node cannot materialize.
    EntityUnknown,
    /// Packet or patch payload was malformed.
    SchemaInvalid,
    /// Sender exceeded the receiver's rate budget.
    RateLimited,
    /// Signature verification failed.
    Unauthorized,
}

/// Packet payloads, tagged by `type` on the wire.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PacketBody {
    /// Session opener carrying capabilities.
    #[serde(rename = "HELLO")]
    Hello {
        /// Sender capabilities.
        capabilities: Capabilities,
    },
    /// Current entity tips.
    #[serde(rename = "HEADS")]
    Heads {
        /// Tips, one per entity (possibly watermark-filtered).
        heads: Vec<Head>,
    },
    /// Request for deltas.
    #[serde(rename = "WANT")]
    Want {
        /// Requests, one per entity.
        wants: Vec<WantEntry>,
    },
    /// Delta batch.
    #[serde(rename = "DELTAS")]
    Deltas {
        /// Deltas in priority order.
        deltas: Vec<Delta>,
    },
    /// One fragment of an oversized delta.
    #[serde(rename = "DELTAS_CHUNK")]
    DeltasChunk {
        /// Delta being reassembled.
        delta_id: String,
        /// Zero-based fragment index.
        chunk_index: u32,
        /// Total fragment count.
        chunk_total: u32,
        /// Base64 fragment of the delta's canonical bytes.
        chunk_payload: String,
    },
    /// Acceptance receipt.
    #[serde(rename = "ACK")]
    Ack {
        /// Ids of deltas durably applied.
        delta_ids: Vec<String>,
    },
    /// Refusal.
    #[serde(rename = "REJECT")]
    Reject {
        /// Machine-stable reason.
        reason: RejectReason,
        /// Entity the refusal concerns, when specific.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        entity_id: Option<String>,
        /// Free-form detail.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
}

/// A sync packet: envelope plus body.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Packet {
    /// Sending node.
    pub node_id: String,
    /// Optional replay nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Payload.
    #[serde(flatten)]
    pub body: PacketBody,
    /// Detached signature over [`Packet::signing_bytes`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl Packet {
    /// Builds an unsigned packet.
    #[must_use]
    pub fn new(node_id: impl Into<String>, body: PacketBody) -> Self {
        Packet {
            node_id: node_id.into(),
            nonce: None,
            body,
            signature: None,
        }
    }

    /// Canonical byte form with the `signature` field excluded.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] when a payload value cannot be canonicalized.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, CanonError> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        let tree = serde_json::to_value(&unsigned).unwrap_or(serde_json::Value::Null);
        canonical_bytes(&tree)
    }

    /// Canonical byte form including the signature; the size that counts
    /// against `max_packet_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] when a payload value cannot be canonicalized.
    pub fn canonical_size(&self) -> Result<usize, CanonError> {
        let tree = serde_json::to_value(self).unwrap_or(serde_json::Value::Null);
        Ok(canonical_bytes(&tree)?.len())
    }

    /// Signs the packet in place.
    ///
    /// # Errors
    ///
    /// Returns [`CanonError`] when the packet cannot be canonicalized.
    pub fn sign(&mut self, signer: &dyn Signer) -> Result<(), CanonError> {
        let bytes = self.signing_bytes()?;
        self.signature = Some(signer.sign(&bytes));
        Ok(())
    }

    /// Verifies the detached signature, when present.
    ///
    /// Unsigned packets verify trivially; a node requiring signatures
    /// rejects them at the session layer instead.
    #[must_use]
    pub fn verify(&self, verifier: &dyn Verifier) -> bool {
        match (&self.signature, self.signing_bytes()) {
            (None, _) => true,
            (Some(sig), Ok(bytes)) => verifier.verify(&bytes, sig),
            (Some(_), Err(_)) => false,
        }
    }
}
