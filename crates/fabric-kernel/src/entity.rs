// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Entity identity, the closed type set, and operational modes.

use fabric_canonical::StateHash;
use serde::{Deserialize, Serialize};

/// The closed set of entity types the fabric replicates.
///
/// The discriminant order is not meaningful; sync transmission order comes
/// from [`EntityType::priority`]. The serde form is the snake_case tag that
/// appears in durable artifacts and on the wire.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum EntityType {
    SystemState,
    Task,
    Project,
    Draft,
    Note,
    InboxItem,
    Message,
    Thread,
    PendingAction,
    ActuationIntent,
    Actuator,
    ActuatorState,
    ActuationReceipt,
    CameraSurface,
    SceneTile,
    SceneObject,
    SceneLight,
    CameraTick,
    UiSurface,
    UiComponent,
    UiRenderTick,
    UiSurfaceLink,
    ControlSurface,
    ControlWidget,
    Token,
    Pattern,
    Motif,
    DiscoveryProposal,
    DesignProposal,
}

impl EntityType {
    /// Every member of the closed set, in declaration order.
    pub const ALL: [EntityType; 29] = [
        EntityType::SystemState,
        EntityType::Task,
        EntityType::Project,
        EntityType::Draft,
        EntityType::Note,
        EntityType::InboxItem,
        EntityType::Message,
        EntityType::Thread,
        EntityType::PendingAction,
        EntityType::ActuationIntent,
        EntityType::Actuator,
        EntityType::ActuatorState,
        EntityType::ActuationReceipt,
        EntityType::CameraSurface,
        EntityType::SceneTile,
        EntityType::SceneObject,
        EntityType::SceneLight,
        EntityType::CameraTick,
        EntityType::UiSurface,
        EntityType::UiComponent,
        EntityType::UiRenderTick,
        EntityType::UiSurfaceLink,
        EntityType::ControlSurface,
        EntityType::ControlWidget,
        EntityType::Token,
        EntityType::Pattern,
        EntityType::Motif,
        EntityType::DiscoveryProposal,
        EntityType::DesignProposal,
    ];

    /// The snake_case tag used in artifacts, ids, and on the wire.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            EntityType::SystemState => "system_state",
            EntityType::Task => "task",
            EntityType::Project => "project",
            EntityType::Draft => "draft",
            EntityType::Note => "note",
            EntityType::InboxItem => "inbox_item",
            EntityType::Message => "message",
            EntityType::Thread => "thread",
            EntityType::PendingAction => "pending_action",
            EntityType::ActuationIntent => "actuation_intent",
            EntityType::Actuator => "actuator",
            EntityType::ActuatorState => "actuator_state",
            EntityType::ActuationReceipt => "actuation_receipt",
            EntityType::CameraSurface => "camera_surface",
            EntityType::SceneTile => "scene_tile",
            EntityType::SceneObject => "scene_object",
            EntityType::SceneLight => "scene_light",
            EntityType::CameraTick => "camera_tick",
            EntityType::UiSurface => "ui_surface",
            EntityType::UiComponent => "ui_component",
            EntityType::UiRenderTick => "ui_render_tick",
            EntityType::UiSurfaceLink => "ui_surface_link",
            EntityType::ControlSurface => "control_surface",
            EntityType::ControlWidget => "control_widget",
            EntityType::Token => "token",
            EntityType::Pattern => "pattern",
            EntityType::Motif => "motif",
            EntityType::DiscoveryProposal => "discovery_proposal",
            EntityType::DesignProposal => "design_proposal",
        }
    }

    /// Parses the snake_case tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<EntityType> {
        EntityType::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// Sync transmission priority, 1 = highest.
    ///
    /// When multiple deltas are pending for a peer, lower-ranked entity types
    /// ship first; ties break by `ts` then `version`.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            EntityType::SystemState => 1,
            EntityType::PendingAction => 2,
            EntityType::ActuationIntent => 3,
            EntityType::Actuator | EntityType::ActuatorState | EntityType::ActuationReceipt => 4,
            EntityType::CameraSurface
            | EntityType::SceneTile
            | EntityType::SceneObject
            | EntityType::SceneLight
            | EntityType::CameraTick => 5,
            EntityType::UiSurface
            | EntityType::UiComponent
            | EntityType::UiRenderTick
            | EntityType::UiSurfaceLink
            | EntityType::ControlSurface
            | EntityType::ControlWidget => 6,
            EntityType::Message | EntityType::Thread => 7,
            EntityType::Task | EntityType::Project => 8,
            EntityType::Draft | EntityType::Note | EntityType::InboxItem => 9,
            EntityType::Token
            | EntityType::Pattern
            | EntityType::Motif
            | EntityType::DiscoveryProposal
            | EntityType::DesignProposal => 10,
        }
    }

    /// Recovers the entity type from a minted entity id.
    ///
    /// Ids are minted as `{type}-{16 hex}`, so the type tag is the prefix
    /// before the final dash. Sync uses this to materialize entities from
    /// genesis deltas, which carry no separate type field.
    #[must_use]
    pub fn from_entity_id(entity_id: &str) -> Option<EntityType> {
        let (prefix, _) = entity_id.rsplit_once('-')?;
        EntityType::parse(prefix)
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed, identified, versioned piece of state.
///
/// The entity record itself is small; its current state lives beside it and
/// its history is the delta log. `version` strictly increases by one per
/// accepted delta and `state_hash` is always `SHA256(canonical(state))`.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Entity {
    /// Opaque id, minted as `{type}-{16 hex}`.
    pub entity_id: String,
    /// Member of the closed type set.
    pub entity_type: EntityType,
    /// Wall-clock creation time, millis since epoch.
    pub created_at: u64,
    /// Monotonic version; 1 after the genesis delta.
    pub version: u64,
    /// Hash of the current state's canonical byte form.
    pub state_hash: StateHash,
}

/// Operational mode of the system, as recorded in `system_state`.
///
/// Modes gate admission: CLOSURE denies all non-closure work, and the ratio
/// LUT decides `build_allowed` alongside the mode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
pub enum Mode {
    /// Sleep-debt override; no progression until recovered.
    #[serde(rename = "RECOVER")]
    Recover,
    /// Too many open loops; closing work takes priority.
    #[serde(rename = "CLOSE_LOOPS")]
    CloseLoops,
    /// Ratio ≥ 0.60; building allowed.
    #[serde(rename = "BUILD")]
    Build,
    /// Leverage compounding on top of BUILD.
    #[serde(rename = "COMPOUND")]
    Compound,
    /// Ratio ≥ 0.80 with sustained streak; highest tier.
    #[serde(rename = "SCALE")]
    Scale,
    /// Ratio in [0.40, 0.60); building denied.
    #[serde(rename = "MAINTENANCE")]
    Maintenance,
    /// Ratio < 0.40; only closure work admitted.
    #[serde(rename = "CLOSURE")]
    Closure,
}

impl Mode {
    /// All modes.
    pub const ALL: [Mode; 7] = [
        Mode::Recover,
        Mode::CloseLoops,
        Mode::Build,
        Mode::Compound,
        Mode::Scale,
        Mode::Maintenance,
        Mode::Closure,
    ];

    /// The UPPER_SNAKE tag recorded in `system_state` at `/mode`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Recover => "RECOVER",
            Mode::CloseLoops => "CLOSE_LOOPS",
            Mode::Build => "BUILD",
            Mode::Compound => "COMPOUND",
            Mode::Scale => "SCALE",
            Mode::Maintenance => "MAINTENANCE",
            Mode::Closure => "CLOSURE",
        }
    }

    /// Parses the UPPER_SNAKE tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<Mode> {
        Mode::ALL.into_iter().find(|m| m.as_str() == tag)
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tags_round_trip() {
        for ty in EntityType::ALL {
            assert_eq!(EntityType::parse(ty.as_str()), Some(ty));
        }
        assert_eq!(EntityType::parse("nonsense"), None);
    }

    #[test]
    fn serde_uses_snake_case_tags() {
        let encoded = serde_json::to_string(&EntityType::SystemState).unwrap();
        assert_eq!(encoded, "\"system_state\"");
        let decoded: EntityType = serde_json::from_str("\"ui_render_tick\"").unwrap();
        assert_eq!(decoded, EntityType::UiRenderTick);
    }

    #[test]
    fn priority_matches_declared_table() {
        assert_eq!(EntityType::SystemState.priority(), 1);
        assert_eq!(EntityType::PendingAction.priority(), 2);
        assert_eq!(EntityType::ActuatorState.priority(), 4);
        assert_eq!(EntityType::CameraTick.priority(), 5);
        assert_eq!(EntityType::ControlWidget.priority(), 6);
        assert_eq!(EntityType::Thread.priority(), 7);
        assert_eq!(EntityType::Project.priority(), 8);
        assert_eq!(EntityType::InboxItem.priority(), 9);
        assert_eq!(EntityType::DesignProposal.priority(), 10);
    }

    #[test]
    fn type_recovered_from_minted_id() {
        assert_eq!(
            EntityType::from_entity_id("system_state-00ff00ff00ff00ff"),
            Some(EntityType::SystemState)
        );
        assert_eq!(
            EntityType::from_entity_id("task-abcdef0123456789"),
            Some(EntityType::Task)
        );
        assert_eq!(EntityType::from_entity_id("no-dash-type"), None);
        assert_eq!(EntityType::from_entity_id("plain"), None);
    }

    #[test]
    fn mode_tags_round_trip() {
        for m in Mode::ALL {
            assert_eq!(Mode::parse(m.as_str()), Some(m));
        }
        let encoded = serde_json::to_string(&Mode::CloseLoops).unwrap();
        assert_eq!(encoded, "\"CLOSE_LOOPS\"");
    }
}
