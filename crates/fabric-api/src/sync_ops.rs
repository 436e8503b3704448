// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Sync operations: per-peer sessions behind the commit lane.
//!
//! The commit lane doubles as the per-peer mutex the concurrency model
//! requires: only one packet mutates state at a time, and sessions live in
//! the lane-guarded map keyed by peer id.

use crate::{ApiError, Inner, KernelContext, StateEvent};
use fabric_sync::{Packet, PacketBody, SessionState};
use serde_json::{json, Value};

impl KernelContext {
    /// Opens (or reopens) a session to a peer, returning the HELLO to ship.
    #[must_use]
    pub fn sync_begin(&self, peer_id: &str) -> Packet {
        let now = self.kernel.clock().now_ms();
        let mut inner = self.lane();
        let (session, hello) = self.sync.begin(peer_id, now);
        inner.sessions.insert(peer_id.to_string(), session);
        hello
    }

    /// Feeds one received packet, returning the packets to ship back. A
    /// packet from an unknown peer opens a responder session.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] for packets the session state cannot accept.
    pub fn sync_receive(&self, peer_id: &str, packet: &Packet) -> Result<Vec<Packet>, ApiError> {
        let now = self.kernel.clock().now_ms();
        let (out, unified) = {
            let mut inner = self.lane();
            let Inner {
                store,
                watermarks,
                sessions,
                ..
            } = &mut *inner;
            // A fresh HELLO reopens a finished conversation.
            if matches!(packet.body, PacketBody::Hello { .. }) {
                let stale = sessions.get(peer_id).is_some_and(|s| {
                    matches!(s.state, SessionState::Complete | SessionState::Error)
                });
                if stale {
                    sessions.remove(peer_id);
                }
            }
            let session = sessions
                .entry(peer_id.to_string())
                .or_insert_with(|| self.sync.accept(peer_id, now));
            let out = self
                .sync
                .handle_packet(session, store, watermarks, packet, now)?;
            (out, self.unified_locked(&inner))
        };
        self.emit(StateEvent::UnifiedState { state: unified });
        Ok(out)
    }

    /// Watchdog tick over every open session; expired sessions transition
    /// to ERROR and are pruned.
    pub fn sync_tick(&self) {
        let now = self.kernel.clock().now_ms();
        let mut inner = self.lane();
        let Inner { sessions, .. } = &mut *inner;
        for session in sessions.values_mut() {
            self.sync.tick(session, now);
        }
        sessions.retain(|_, s| {
            !matches!(s.state, SessionState::Complete | SessionState::Error)
        });
    }

    /// Session snapshot per peer.
    #[must_use]
    pub fn sync_status(&self) -> Value {
        let inner = self.lane();
        let sessions: Vec<Value> = inner
            .sessions
            .iter()
            .map(|(peer, s)| json!({ "peer_id": peer, "state": format!("{:?}", s.state) }))
            .collect();
        json!({ "node_id": self.node_id(), "sessions": sessions })
    }
}
