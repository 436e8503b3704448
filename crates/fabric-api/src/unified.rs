// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `state.get_unified`, `state.put`, and `ingest.cognitive`.

use crate::{ApiError, Inner, KernelContext, StateEvent};
use fabric_kernel::Pointer;
use fabric_law::{ClosureEngine, PutSignals};
use serde::Deserialize;
use serde_json::{json, Value};

/// Default primary order shown when none has been recorded.
const DEFAULT_PRIMARY_ORDER: &str = "Close open loops before opening new ones.";

/// Input for `state.put`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct StatePut {
    /// New mode tag.
    #[serde(default)]
    pub mode: Option<String>,
    /// Last night's sleep, hours.
    #[serde(default)]
    pub sleep_hours: Option<f64>,
    /// Open loop count.
    #[serde(default)]
    pub open_loops: Option<u64>,
    /// Leverage balance.
    #[serde(default)]
    pub leverage_balance: Option<f64>,
    /// Streak days.
    #[serde(default)]
    pub streak_days: Option<u64>,
}

fn read<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    Pointer::parse(path).ok()?.resolve(state)
}

fn risk_of(enforcement_level: &str) -> &'static str {
    match enforcement_level {
        "lockdown" => "high",
        "warning" => "elevated",
        _ => "low",
    }
}

impl KernelContext {
    /// `state.get_unified`: the merged view. Always returns a response;
    /// subsystems that failed to load are listed in `errors[]`.
    #[must_use]
    pub fn state_get_unified(&self) -> Value {
        let inner = self.lane();
        self.unified_locked(&inner)
    }

    pub(crate) fn unified_locked(&self, inner: &Inner) -> Value {
        let mut errors: Vec<String> = Vec::new();

        let system = match ClosureEngine::load_system(&inner.store) {
            Ok(record) => record,
            Err(e) => {
                errors.push(format!("system_state: {e}"));
                None
            }
        };
        let registry = match inner.law.registry() {
            Ok(registry) => registry,
            Err(e) => {
                errors.push(format!("closures: {e}"));
                fabric_law::ClosuresRegistry::default()
            }
        };
        let open_loops = match inner.law.open_loops() {
            Ok(loops) => loops.len() as u64,
            Err(e) => {
                errors.push(format!("loops_latest: {e}"));
                0
            }
        };

        let state = system
            .as_ref()
            .map_or_else(|| json!({}), |r| r.state.clone());
        let mode = read(&state, "/mode").and_then(Value::as_str).unwrap_or("CLOSURE");
        let build_allowed = read(&state, "/build_allowed")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let enforcement_level = read(&state, "/enforcement/enforcement_level")
            .and_then(Value::as_str)
            .unwrap_or("normal");
        let total = registry.stats.total_closures;
        let closure_ratio = if total + open_loops > 0 {
            total as f64 / (open_loops + total) as f64
        } else {
            0.0
        };
        let primary_order = read(&state, "/law/last_acknowledged_order")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PRIMARY_ORDER);

        json!({
            "system_state": state,
            "mode": mode,
            "risk": risk_of(enforcement_level),
            "open_loops": open_loops,
            "closure_ratio": closure_ratio,
            "primary_order": primary_order,
            "build_allowed": build_allowed,
            "enforcement_level": enforcement_level,
            "closures_today": registry.stats.closures_today,
            "total_closures": total,
            "streak_days": registry.stats.streak_days,
            "best_streak": registry.stats.best_streak,
            "errors": errors,
        })
    }

    /// `state.put`: writes signal fields.
    ///
    /// # Errors
    ///
    /// Returns a validation [`ApiError`] for unknown mode tags.
    pub fn state_put(&self, put: &StatePut) -> Result<Value, ApiError> {
        let signals = PutSignals {
            mode: put.mode.clone(),
            sleep_hours: put.sleep_hours,
            open_loops: put.open_loops,
            leverage_balance: put.leverage_balance,
            streak_days: put.streak_days,
        };
        let unified = {
            let mut inner = self.lane();
            let Inner { store, law, .. } = &mut *inner;
            law.put_signals(store, &signals)?;
            self.unified_locked(&inner)
        };
        self.emit(StateEvent::UnifiedState {
            state: unified.clone(),
        });
        Ok(json!({ "ok": true }))
    }

    /// `ingest.cognitive`: consumes an upstream cognitive snapshot and
    /// recomputes the mode.
    ///
    /// # Errors
    ///
    /// Returns a validation [`ApiError`] when the snapshot is not an object.
    pub fn ingest_cognitive(&self, cognitive: &Value) -> Result<Value, ApiError> {
        if !cognitive.is_object() {
            return Err(ApiError::validation("cognitive must be an object"));
        }
        let (receipt, unified) = {
            let mut inner = self.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            let receipt = law.ingest_cognitive(store, cognitive)?;
            timeline.record(
                "cognitive_ingest",
                "cognitive-sensor",
                None,
                Some(cognitive.clone()),
            );
            (receipt, self.unified_locked(&inner))
        };
        self.emit(StateEvent::UnifiedState { state: unified });
        Ok(json!({
            "mode": receipt.mode.as_str(),
            "open_loops": receipt.open_loops,
        }))
    }
}
