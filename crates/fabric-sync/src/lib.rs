// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-sync: peer-to-peer delta synchronization over small datagrams.
//!
//! Nodes converge by exchanging hash-chained deltas inside packets sized to
//! a single LoRa frame (220 bytes by default):
//!
//! ```text
//! HELLO ⇄ HELLO → HEADS ⇄ HEADS → WANT → DELTAS / DELTAS_CHUNK → ACK
//! ```
//!
//! The crate is transport-agnostic: a [`SyncEndpoint`] turns received
//! packets into packets to send, and the embedder moves bytes. Heads diffing
//! classifies entities (localOnly / remoteOnly / diverged / synced), wants
//! walk the responder's log forward from a cut-point hash, oversized deltas
//! chunk and reassemble, forks resolve deterministically, and per-peer
//! watermarks shrink repeat HEADS exchanges.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod chunk;
mod codec;
mod conflict;
mod diff;
mod error;
mod packet;
mod priority;
mod session;
mod watermark;

pub use chunk::{
    chunk_delta, needs_chunking, payload_budget, ChunkBuffer, CHUNK_HEADER_BYTES,
    DEFAULT_CHUNK_EXPIRY_MS,
};
pub use codec::{decode, encode, negotiate, WireFormat};
pub use conflict::{
    resolve, Branch, ConflictStatus, EntityConflict, MergeFn, Resolution, ResolverRegistry,
    RESOLUTION_AUTHOR,
};
pub use diff::{build_wants, deltas_since, diff_heads, local_heads, HeadsDiff};
pub use error::SyncError;
pub use packet::{
    Capabilities, Head, Packet, PacketBody, RejectReason, WantEntry, DEFAULT_MAX_PACKET_BYTES,
    PROTOCOL_VERSION,
};
pub use priority::{delta_priority, order_pending};
pub use session::{
    ReceiveOutcome, SessionConfig, SessionState, SyncEndpoint, SyncSession,
    DEFAULT_SESSION_DEADLINE_MS,
};
pub use watermark::{PeerWatermark, WatermarkStore};
