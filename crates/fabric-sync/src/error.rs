// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sync error taxonomy.

use crate::packet::RejectReason;
use fabric_canonical::CanonError;
use fabric_kernel::KernelError;
use fabric_store::StoreError;

/// Errors from sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Wire encode/decode failure.
    #[error("codec error: {detail}")]
    Codec {
        /// Underlying failure text.
        detail: String,
    },
    /// Chunk reassembly produced inconsistent fragments.
    #[error("[CHUNK_MISMATCH] delta {delta_id:?}: {detail}")]
    ChunkMismatch {
        /// Delta being reassembled.
        delta_id: String,
        /// What disagreed.
        detail: String,
    },
    /// A packet arrived that the session state machine cannot accept.
    #[error("[SESSION_STATE] unexpected {got} in state {state}")]
    UnexpectedPacket {
        /// Packet type tag received.
        got: &'static str,
        /// Session state name.
        state: &'static str,
    },
    /// The session deadline expired.
    #[error("[SESSION_TIMEOUT] session to {peer_id:?} expired")]
    SessionTimeout {
        /// Peer the session addressed.
        peer_id: String,
    },
    /// Canonicalization failure.
    #[error(transparent)]
    Canon(#[from] CanonError),
    /// Kernel apply failure.
    #[error(transparent)]
    Kernel(#[from] KernelError),
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Maps an error onto the wire reject reason it should travel as.
    #[must_use]
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            SyncError::Kernel(
                KernelError::HashChainBroken { .. } | KernelError::VersionMismatch { .. },
            ) => RejectReason::HashChainBroken,
            SyncError::Kernel(KernelError::EntityTypeUnknown { .. }) => RejectReason::EntityUnknown,
            _ => RejectReason::SchemaInvalid,
        }
    }
}
