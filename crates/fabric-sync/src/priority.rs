// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Transmission ordering for pending deltas.

use fabric_kernel::{Delta, EntityType};

/// Priority rank for a delta, 1 highest. Unrecognized entity ids sort last.
#[must_use]
pub fn delta_priority(delta: &Delta) -> u8 {
    EntityType::from_entity_id(&delta.entity_id).map_or(u8::MAX, EntityType::priority)
}

/// Sorts pending deltas into transmission order: entity-type priority rank,
/// then `ts`, then `version`.
pub fn order_pending(deltas: &mut [Delta]) {
    deltas.sort_by(|a, b| {
        (delta_priority(a), a.ts, a.version, &a.entity_id).cmp(&(
            delta_priority(b),
            b.ts,
            b.version,
            &b.entity_id,
        ))
    });
}
