// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `law.*` operations.

use crate::{ApiError, Inner, KernelContext, StateEvent};
use fabric_kernel::EntityType;
use fabric_law::{ClosureOutcome, ClosureRequest};
use fabric_store::Store;
use serde::Deserialize;
use serde_json::{json, Value};

/// Input for `law.close_loop`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct CloseLoopInput {
    /// Loop being retired, when tracked.
    #[serde(default)]
    pub loop_id: Option<String>,
    /// Human title for the ledger row.
    #[serde(default)]
    pub title: Option<String>,
    /// `closed` (default) or `archived`.
    #[serde(default)]
    pub outcome: Option<String>,
    /// Originating source tag; defaults to `user`.
    #[serde(default)]
    pub source: Option<String>,
}

impl KernelContext {
    /// `law.close_loop`: one atomic closure event.
    ///
    /// # Errors
    ///
    /// Returns 409-equivalent `already_closed` for duplicate loop ids and a
    /// validation error for unknown outcome tags.
    pub fn law_close_loop(&self, input: &CloseLoopInput) -> Result<Value, ApiError> {
        let outcome = match input.outcome.as_deref() {
            None | Some("closed") => ClosureOutcome::Closed,
            Some("archived") => ClosureOutcome::Archived,
            Some(other) => {
                return Err(ApiError::validation(format!("unknown outcome {other:?}")))
            }
        };
        let request = ClosureRequest {
            loop_id: input.loop_id.clone(),
            title: input.title.clone(),
            outcome,
            source: input.source.clone().unwrap_or_else(|| "user".to_string()),
        };
        let (receipt, unified, system_head) = {
            let mut inner = self.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            let receipt = law.close_loop(store, &request)?;
            timeline.record(
                "closure",
                "closure_engine",
                receipt.closure.loop_id.as_deref(),
                serde_json::to_value(&receipt).ok(),
            );
            let head = store
                .load_entities_by_type(EntityType::SystemState)
                .ok()
                .and_then(|mut v| v.pop())
                .map(|r| (r.entity.entity_id, r.entity.version));
            (receipt, self.unified_locked(&inner), head)
        };
        if let Some((entity_id, version)) = system_head {
            self.emit(StateEvent::DeltaCreated {
                delta_id: receipt.delta_id.clone(),
                entity_id,
                version,
            });
        }
        self.emit(StateEvent::UnifiedState { state: unified });
        serde_json::to_value(&receipt).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `law.acknowledge`: records acknowledgement of the primary order.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on commit failure.
    pub fn law_acknowledge(&self, order: &str) -> Result<Value, ApiError> {
        let mut inner = self.lane();
        let Inner {
            store,
            law,
            timeline,
            ..
        } = &mut *inner;
        let receipt = law.acknowledge(store, order)?;
        timeline.record("acknowledge", "user", None, Some(json!({"order": order})));
        serde_json::to_value(&receipt).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `law.archive`: archives a loop by id or title.
    ///
    /// # Errors
    ///
    /// Returns a validation error when neither identifier is given.
    pub fn law_archive(
        &self,
        loop_id: Option<&str>,
        loop_title: Option<&str>,
        reason: Option<&str>,
    ) -> Result<Value, ApiError> {
        let receipt = {
            let mut inner = self.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            let receipt = law.archive(store, loop_id, loop_title, reason)?;
            timeline.record(
                "archive",
                "user",
                receipt.closure.loop_id.as_deref(),
                Some(json!({"reason": reason})),
            );
            receipt
        };
        Ok(json!({ "archived": true, "closure": receipt.closure }))
    }

    /// `law.refresh`: requests an upstream cognitive refresh.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on commit failure.
    pub fn law_refresh(&self) -> Result<Value, ApiError> {
        let mut inner = self.lane();
        let Inner {
            store,
            law,
            timeline,
            ..
        } = &mut *inner;
        let receipt = law.refresh(store)?;
        timeline.record("refresh", "daemon", None, None);
        serde_json::to_value(&receipt).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `law.violation`: records a violation and escalates enforcement.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `action` is empty.
    pub fn law_violation(
        &self,
        action: &str,
        context: Option<&Value>,
    ) -> Result<Value, ApiError> {
        let mut inner = self.lane();
        let Inner {
            store,
            law,
            timeline,
            ..
        } = &mut *inner;
        let receipt = law.violation(store, action, context)?;
        timeline.record(
            "violation",
            "enforcement_system",
            None,
            Some(json!({"action": action})),
        );
        serde_json::to_value(&receipt).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `law.override`: logs a deliberate override.
    ///
    /// # Errors
    ///
    /// Returns a validation error when `reason` is empty.
    pub fn law_override(&self, reason: &str) -> Result<Value, ApiError> {
        let mut inner = self.lane();
        let Inner {
            store,
            law,
            timeline,
            ..
        } = &mut *inner;
        let receipt = law.record_override(store, reason)?;
        timeline.record(
            "override",
            "enforcement_system",
            None,
            Some(json!({"reason": reason})),
        );
        serde_json::to_value(&receipt).map_err(|e| ApiError::internal(e.to_string()))
    }
}
