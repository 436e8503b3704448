// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Per-type state schemas.
//!
//! Schemas here are structural, not exhaustive: every entity state must be a
//! JSON object, types with a natural core declare required keys with expected
//! kinds, and `system_state` gets the full skeleton check (mode tag, metrics
//! and enforcement subtrees). The registry also marks which array paths are
//! ordered sequences — the only arrays numeric patch indices may target once
//! the array pre-exists a delta.

use crate::entity::{EntityType, Mode};
use serde_json::Value;

/// Schema violation detail.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    /// State was not a JSON object.
    #[error("[SCHEMA_INVALID] {entity_type} state must be an object")]
    NotAnObject {
        /// Offending entity type.
        entity_type: EntityType,
    },
    /// A required key was missing.
    #[error("[SCHEMA_INVALID] {entity_type} state missing required key {key:?}")]
    MissingKey {
        /// Offending entity type.
        entity_type: EntityType,
        /// The absent key.
        key: &'static str,
    },
    /// A key held a value of the wrong kind.
    #[error("[SCHEMA_INVALID] {entity_type} key {key:?} must be {expected}")]
    WrongKind {
        /// Offending entity type.
        entity_type: EntityType,
        /// The offending key.
        key: &'static str,
        /// Human tag of the expected kind.
        expected: &'static str,
    },
    /// `system_state./mode` held an unknown mode tag.
    #[error("[SCHEMA_INVALID] unknown mode tag {tag:?}")]
    UnknownMode {
        /// The unrecognized tag.
        tag: String,
    },
}

/// Expected JSON kind for a required key.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Kind {
    String,
    Number,
    Bool,
    Object,
    Array,
}

impl Kind {
    fn matches(self, v: &Value) -> bool {
        match self {
            Kind::String => v.is_string(),
            Kind::Number => v.is_number(),
            Kind::Bool => v.is_boolean(),
            Kind::Object => v.is_object(),
            Kind::Array => v.is_array(),
        }
    }

    fn tag(self) -> &'static str {
        match self {
            Kind::String => "a string",
            Kind::Number => "a number",
            Kind::Bool => "a bool",
            Kind::Object => "an object",
            Kind::Array => "an array",
        }
    }
}

/// Required keys per type. Types absent from this table only need to be
/// objects; their shape is open.
fn required_keys(ty: EntityType) -> &'static [(&'static str, Kind)] {
    match ty {
        EntityType::SystemState => &[
            ("mode", Kind::String),
            ("build_allowed", Kind::Bool),
            ("metrics", Kind::Object),
            ("enforcement", Kind::Object),
        ],
        EntityType::Task => &[("title", Kind::String), ("status", Kind::String)],
        EntityType::Project => &[("name", Kind::String)],
        EntityType::Draft | EntityType::Note => &[("content", Kind::String)],
        EntityType::InboxItem => &[("summary", Kind::String)],
        EntityType::Message => &[("body", Kind::String)],
        EntityType::Thread => &[("subject", Kind::String)],
        EntityType::PendingAction => &[("action", Kind::String)],
        EntityType::ActuationIntent => &[("actuator_id", Kind::String)],
        EntityType::Actuator => &[("name", Kind::String)],
        EntityType::ActuationReceipt => &[("intent_id", Kind::String)],
        EntityType::Token => &[("text", Kind::String)],
        EntityType::Pattern | EntityType::Motif => &[("label", Kind::String)],
        EntityType::DiscoveryProposal | EntityType::DesignProposal => {
            &[("title", Kind::String)]
        }
        _ => &[],
    }
}

/// Array paths (pointer prefixes) that are ordered sequences for a type.
///
/// A numeric patch index may target an element of a pre-existing array only
/// when the array's path appears here. Arrays materialized inside the same
/// delta are exempt — they are still being constructed.
#[must_use]
pub(crate) fn ordered_sequences(ty: EntityType) -> &'static [&'static str] {
    match ty {
        EntityType::SystemState => &[
            "/enforcement/closure_log",
            "/enforcement/override_log",
            "/law/acknowledged_orders",
        ],
        EntityType::Task => &["/tags", "/depends_on", "/checklist"],
        EntityType::Project => &["/task_ids", "/tags"],
        EntityType::Thread => &["/message_ids"],
        EntityType::Draft | EntityType::Note => &["/tags"],
        EntityType::UiSurface => &["/component_ids"],
        EntityType::ControlSurface => &["/widget_ids"],
        EntityType::SceneTile => &["/object_ids"],
        EntityType::Pattern => &["/token_ids"],
        EntityType::Motif => &["/pattern_ids"],
        _ => &[],
    }
}

/// Validates a state value against its type's schema.
///
/// # Errors
///
/// Returns [`SchemaError`] describing the first violation found.
pub fn validate_state(ty: EntityType, state: &Value) -> Result<(), SchemaError> {
    let Value::Object(map) = state else {
        return Err(SchemaError::NotAnObject { entity_type: ty });
    };
    for (key, kind) in required_keys(ty) {
        match map.get(*key) {
            None => {
                return Err(SchemaError::MissingKey {
                    entity_type: ty,
                    key,
                })
            }
            Some(v) if !kind.matches(v) => {
                return Err(SchemaError::WrongKind {
                    entity_type: ty,
                    key,
                    expected: kind.tag(),
                })
            }
            Some(_) => {}
        }
    }
    if ty == EntityType::SystemState {
        if let Some(Value::String(tag)) = map.get("mode") {
            if Mode::parse(tag).is_none() {
                return Err(SchemaError::UnknownMode { tag: tag.clone() });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn open_types_only_require_objects() {
        assert!(validate_state(EntityType::CameraTick, &json!({})).is_ok());
        assert!(matches!(
            validate_state(EntityType::CameraTick, &json!(3)),
            Err(SchemaError::NotAnObject { .. })
        ));
    }

    #[test]
    fn task_requires_title_and_status() {
        let ok = json!({"title": "ship it", "status": "OPEN"});
        assert!(validate_state(EntityType::Task, &ok).is_ok());
        assert!(matches!(
            validate_state(EntityType::Task, &json!({"title": "x"})),
            Err(SchemaError::MissingKey { key: "status", .. })
        ));
        assert!(matches!(
            validate_state(EntityType::Task, &json!({"title": 3, "status": "OPEN"})),
            Err(SchemaError::WrongKind { key: "title", .. })
        ));
    }

    #[test]
    fn system_state_rejects_unknown_mode() {
        let bad = json!({
            "mode": "PARTY",
            "build_allowed": true,
            "metrics": {},
            "enforcement": {}
        });
        assert!(matches!(
            validate_state(EntityType::SystemState, &bad),
            Err(SchemaError::UnknownMode { .. })
        ));
        let good = json!({
            "mode": "BUILD",
            "build_allowed": true,
            "metrics": {},
            "enforcement": {}
        });
        assert!(validate_state(EntityType::SystemState, &good).is_ok());
    }

    #[test]
    fn ordered_sequence_registry_marks_known_paths() {
        assert!(ordered_sequences(EntityType::SystemState)
            .contains(&"/enforcement/closure_log"));
        assert!(ordered_sequences(EntityType::Task).contains(&"/tags"));
        assert!(ordered_sequences(EntityType::CameraTick).is_empty());
    }
}
