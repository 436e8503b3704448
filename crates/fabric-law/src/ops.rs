// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Secondary law operations: acknowledge, archive, refresh, violation,
//! override, signal writes, and cognitive ingestion.
//!
//! Each operation follows the same discipline as a closure: compute, emit
//! one delta, return a receipt. None of them touches the registry except
//! `archive`, which delegates to the closure engine proper.

use crate::closure::{
    array_len, commit, read_f64, read_u64, ClosureEngine, ClosureReceipt, ClosureRequest, LawError,
};
use crate::registry::ClosureOutcome;
use fabric_kernel::{Mode, PatchOp};
use fabric_store::Store;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::info;

/// Receipt for `law.acknowledge`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct AcknowledgeReceipt {
    /// When the order was acknowledged, millis since epoch.
    pub acknowledged_at: u64,
}

/// Receipt for `law.refresh`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct RefreshReceipt {
    /// When the refresh was requested, millis since epoch.
    pub refresh_requested_at: u64,
}

/// Receipt for `law.violation`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct ViolationReceipt {
    /// Violations since the last closure.
    pub violations_count: u64,
    /// `normal` below 3, `warning` at 3, `lockdown` at 5.
    pub enforcement_level: String,
}

/// Receipt for `law.override`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct OverrideReceipt {
    /// All-time override count.
    pub overrides_count: u64,
    /// The override was appended to the log.
    pub override_logged: bool,
}

/// Receipt for `ingest.cognitive`.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct IngestReceipt {
    /// Mode after ingestion.
    pub mode: Mode,
    /// Open loops after ingestion.
    pub open_loops: u64,
}

/// Signal fields accepted by `state.put`. Absent fields are left unchanged.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct PutSignals {
    /// New mode tag (validated against the mode set).
    pub mode: Option<String>,
    /// Last night's sleep, hours.
    pub sleep_hours: Option<f64>,
    /// Open loop count.
    pub open_loops: Option<u64>,
    /// Leverage balance.
    pub leverage_balance: Option<f64>,
    /// Streak days.
    pub streak_days: Option<u64>,
}

fn enforcement_level(count: u64) -> &'static str {
    if count >= 5 {
        "lockdown"
    } else if count >= 3 {
        "warning"
    } else {
        "normal"
    }
}

impl ClosureEngine {
    /// Acknowledges the current primary order.
    pub fn acknowledge(
        &self,
        store: &mut dyn Store,
        order: &str,
    ) -> Result<AcknowledgeReceipt, LawError> {
        let system = self.ensure_system(store)?;
        let now = self.kernel.clock().now_ms();
        let idx = array_len(&system.state, "/law/acknowledged_orders");
        let patches = vec![
            PatchOp::replace("/law/last_acknowledged_order", json!(order)),
            PatchOp::replace("/law/acknowledged_at", json!(now)),
            PatchOp::add(
                format!("/law/acknowledged_orders/{idx}"),
                json!({"order": order, "ts": now}),
            ),
        ];
        let committed =
            self.kernel
                .create_delta(&system.entity, &system.state, patches, "user")?;
        commit(store, &committed)?;
        Ok(AcknowledgeReceipt {
            acknowledged_at: now,
        })
    }

    /// Archives a loop by id or title. Delegates to [`Self::close_loop`]
    /// with an `archived` outcome, so idempotency and atomicity hold.
    ///
    /// # Errors
    ///
    /// Returns [`LawError::MissingIdentifier`] when neither id nor title is
    /// given.
    pub fn archive(
        &self,
        store: &mut dyn Store,
        loop_id: Option<&str>,
        loop_title: Option<&str>,
        reason: Option<&str>,
    ) -> Result<ClosureReceipt, LawError> {
        let resolved_id = match (loop_id, loop_title) {
            (Some(id), _) => Some(id.to_string()),
            (None, Some(title)) => self
                .open_loops()?
                .iter()
                .find(|l| l.title.as_deref() == Some(title))
                .map(|l| l.loop_id.clone()),
            (None, None) => return Err(LawError::MissingIdentifier),
        };
        let title = loop_title
            .map(str::to_string)
            .or_else(|| reason.map(|r| format!("archived: {r}")));
        self.close_loop(
            store,
            &ClosureRequest {
                loop_id: resolved_id,
                title,
                outcome: ClosureOutcome::Archived,
                source: "user".to_string(),
            },
        )
    }

    /// Records a refresh request from the upstream cognitive collaborator.
    pub fn refresh(&self, store: &mut dyn Store) -> Result<RefreshReceipt, LawError> {
        let system = self.ensure_system(store)?;
        let now = self.kernel.clock().now_ms();
        let committed = self.kernel.create_delta(
            &system.entity,
            &system.state,
            vec![PatchOp::replace("/law/refresh_requested_at", json!(now))],
            "daemon",
        )?;
        commit(store, &committed)?;
        Ok(RefreshReceipt {
            refresh_requested_at: now,
        })
    }

    /// Records a law violation and escalates the enforcement level.
    ///
    /// # Errors
    ///
    /// Returns [`LawError::ActionRequired`] when `action` is empty.
    pub fn violation(
        &self,
        store: &mut dyn Store,
        action: &str,
        context: Option<&Value>,
    ) -> Result<ViolationReceipt, LawError> {
        if action.trim().is_empty() {
            return Err(LawError::ActionRequired);
        }
        let system = self.ensure_system(store)?;
        let now = self.kernel.clock().now_ms();
        let count = read_u64(&system.state, "/enforcement/violations_count").unwrap_or(0) + 1;
        let level = enforcement_level(count);
        let mut patches = vec![
            PatchOp::replace("/enforcement/violations_count", json!(count)),
            PatchOp::replace("/enforcement/enforcement_level", json!(level)),
            PatchOp::replace("/enforcement/last_violation_at", json!(now)),
            PatchOp::replace("/enforcement/last_violation_action", json!(action)),
        ];
        if let Some(ctx) = context {
            if !ctx.is_object() && !ctx.is_array() {
                patches.push(PatchOp::replace(
                    "/enforcement/last_violation_context",
                    ctx.clone(),
                ));
            }
        }
        let committed = self.kernel.create_delta(
            &system.entity,
            &system.state,
            patches,
            "enforcement_system",
        )?;
        commit(store, &committed)?;
        info!(action, count, level, "violation recorded");
        Ok(ViolationReceipt {
            violations_count: count,
            enforcement_level: level.to_string(),
        })
    }

    /// Logs a deliberate override of the law.
    ///
    /// # Errors
    ///
    /// Returns [`LawError::ReasonRequired`] when `reason` is empty.
    pub fn record_override(
        &self,
        store: &mut dyn Store,
        reason: &str,
    ) -> Result<OverrideReceipt, LawError> {
        if reason.trim().is_empty() {
            return Err(LawError::ReasonRequired);
        }
        let system = self.ensure_system(store)?;
        let now = self.kernel.clock().now_ms();
        let count = read_u64(&system.state, "/enforcement/overrides_count").unwrap_or(0) + 1;
        let idx = array_len(&system.state, "/enforcement/override_log");
        let patches = vec![
            PatchOp::replace("/enforcement/overrides_count", json!(count)),
            PatchOp::add(
                format!("/enforcement/override_log/{idx}"),
                json!({"ts": now, "reason": reason}),
            ),
        ];
        let committed = self.kernel.create_delta(
            &system.entity,
            &system.state,
            patches,
            "enforcement_system",
        )?;
        commit(store, &committed)?;
        Ok(OverrideReceipt {
            overrides_count: count,
            override_logged: true,
        })
    }

    /// Writes signal fields (`state.put`), then leaves mode recalculation to
    /// the caller or the daemon.
    ///
    /// # Errors
    ///
    /// Returns [`LawError::UnknownMode`] for an unrecognized mode tag.
    pub fn put_signals(
        &self,
        store: &mut dyn Store,
        signals: &PutSignals,
    ) -> Result<(), LawError> {
        if let Some(tag) = &signals.mode {
            if Mode::parse(tag).is_none() {
                return Err(LawError::UnknownMode { tag: tag.clone() });
            }
        }
        let system = self.ensure_system(store)?;
        let mut patches = Vec::new();
        if let Some(tag) = &signals.mode {
            patches.push(PatchOp::replace("/mode", json!(tag)));
            patches.push(PatchOp::replace(
                "/build_allowed",
                json!(matches!(
                    Mode::parse(tag),
                    Some(Mode::Build | Mode::Compound | Mode::Scale)
                )),
            ));
        }
        if let Some(hours) = signals.sleep_hours {
            patches.push(PatchOp::replace("/signals/sleep_hours", json!(hours)));
        }
        if let Some(loops) = signals.open_loops {
            patches.push(PatchOp::replace("/metrics/open_loops", json!(loops)));
        }
        if let Some(leverage) = signals.leverage_balance {
            patches.push(PatchOp::replace(
                "/signals/leverage_balance",
                json!(leverage),
            ));
        }
        if let Some(days) = signals.streak_days {
            patches.push(PatchOp::replace("/streak/streak_days", json!(days)));
        }
        if patches.is_empty() {
            return Ok(());
        }
        let committed =
            self.kernel
                .create_delta(&system.entity, &system.state, patches, "user")?;
        commit(store, &committed)?;
        Ok(())
    }

    /// Ingests an upstream cognitive snapshot: updates signal fields, then
    /// recalculates the mode.
    pub fn ingest_cognitive(
        &self,
        store: &mut dyn Store,
        cognitive: &Value,
    ) -> Result<IngestReceipt, LawError> {
        let put = PutSignals {
            mode: None,
            sleep_hours: read_f64(cognitive, "/sleep_hours"),
            open_loops: read_u64(cognitive, "/open_loops"),
            leverage_balance: read_f64(cognitive, "/leverage_balance"),
            streak_days: None,
        };
        self.put_signals(store, &put)?;
        let recalc = self.recalc_mode(store)?;
        let system = Self::load_system(store)?;
        let open_loops = system
            .as_ref()
            .and_then(|r| read_u64(&r.state, "/metrics/open_loops"))
            .unwrap_or(0);
        Ok(IngestReceipt {
            mode: recalc.mode,
            open_loops,
        })
    }
}
