// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Stream events for `state.stream` consumers.

use serde::Serialize;
use serde_json::Value;

/// One event on the state stream.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StateEvent {
    /// The unified state after a commit.
    UnifiedState {
        /// Merged view per `state.get_unified`.
        state: Value,
    },
    /// A delta was committed.
    DeltaCreated {
        /// The new delta's id.
        delta_id: String,
        /// Entity it advanced.
        entity_id: String,
        /// Version it reached.
        version: u64,
    },
}
