// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The closure engine: one atomic delta per closure event.
//!
//! A closure event computes the new closure ratio, routes it through the mode
//! LUT, applies the streak rule, and emits **one** delta carrying every leaf
//! patch — ratio, mode, streak, and enforcement changes land together or not
//! at all. External side-effects strictly follow the delta: the registry row
//! is appended after the commit, and physical loop removal is best-effort
//! (its failure never rolls the ledger back).
//!
//! The closure ratio is cumulative: `closed_total / (open + closed_total)`.
//! It drifts upward over the life of a node; that is reference behavior, not
//! a bug.

use crate::mode::{compute_mode, ModeDecision, ModeSignals};
use crate::registry::{ClosureOutcome, ClosureRecord, ClosuresRegistry, LoopRecord};
use fabric_kernel::{
    Committed, EntityType, Kernel, KernelError, Mode, PatchOp, Pointer,
};
use fabric_store::{
    read_json_artifact, write_json_artifact, EntityRecord, Store, StoreError,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing::{info, warn};

const CLOSURES_FILE: &str = "closures.json";
const LOOPS_LATEST_FILE: &str = "loops_latest.json";
const LOOPS_CLOSED_FILE: &str = "loops_closed.json";

/// Errors from law operations.
#[derive(Debug, thiserror::Error)]
pub enum LawError {
    /// A successful closure already exists for this loop id (409).
    #[error("[ALREADY_CLOSED] loop {loop_id:?} already closed")]
    AlreadyClosed {
        /// The duplicate loop id.
        loop_id: String,
    },
    /// Archive was called without a loop id or title.
    #[error("loop_id or loop_title required")]
    MissingIdentifier,
    /// Violation was recorded without an action.
    #[error("action required")]
    ActionRequired,
    /// Override was recorded without a reason.
    #[error("reason required")]
    ReasonRequired,
    /// `state.put` carried an unknown mode tag.
    #[error("unknown mode tag {tag:?}")]
    UnknownMode {
        /// The unrecognized tag.
        tag: String,
    },
    /// Store failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Kernel commit failure.
    #[error(transparent)]
    Kernel(#[from] KernelError),
}

/// A closure request.
#[derive(Clone, PartialEq, Debug)]
pub struct ClosureRequest {
    /// Loop being retired, when tracked.
    pub loop_id: Option<String>,
    /// Human title for the ledger row.
    pub title: Option<String>,
    /// Closed or archived.
    pub outcome: ClosureOutcome,
    /// Originating source tag (`user`, `ai`, `system`, `daemon`, …).
    pub source: String,
}

/// Metrics after a closure.
#[derive(Clone, Copy, PartialEq, Debug, Serialize)]
pub struct ClosureMetrics {
    /// All-time closed count (including this closure).
    pub closed_loops_total: u64,
    /// Open loops after this closure.
    pub open_loops: u64,
    /// `closed / (open + closed)`.
    pub closure_ratio: f64,
    /// Closures on the current UTC day (including this one).
    pub closures_today: u64,
    /// This closure's timestamp.
    pub last_closure_at: u64,
}

/// Streak fields after a closure.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct StreakSnapshot {
    /// Current streak, days.
    pub streak_days: u64,
    /// Best streak ever reached.
    pub best_streak: u64,
    /// Whether this closure incremented the streak.
    pub incremented: bool,
}

/// Best-effort physical loop removal outcome.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct PhysicalClosure {
    /// Whether a loop id was named at all.
    pub requested: bool,
    /// Whether the loop was found and moved to the closed file.
    pub removed: bool,
    /// Error text when removal failed; the ledger stays authoritative.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Everything a closure event produced.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct ClosureReceipt {
    /// The ledger row that was appended.
    pub closure: ClosureRecord,
    /// Metrics after the event.
    pub metrics: ClosureMetrics,
    /// Mode after the event.
    pub mode: Mode,
    /// Whether the mode changed.
    pub mode_changed: bool,
    /// Whether build work is now admitted.
    pub build_allowed: bool,
    /// Violations counter was reset to zero.
    pub violations_reset: bool,
    /// Streak after the event.
    pub streak: StreakSnapshot,
    /// Physical removal outcome.
    pub physical_closure: PhysicalClosure,
    /// Id of the atomic delta that recorded the event.
    pub delta_id: String,
}

/// Outcome of a mode recalculation.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct ModeRecalc {
    /// Mode before.
    pub previous: Mode,
    /// Mode after.
    pub mode: Mode,
    /// Whether a transition delta was committed.
    pub changed: bool,
    /// Whether build work is now admitted.
    pub build_allowed: bool,
}

/// Outcome of the day-end sweep.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct DayEndReport {
    /// Whether the streak was reset (no BUILD-eligible closure that day).
    pub streak_reset: bool,
}

/// The law engine. Owns the registry and loops artifacts; commits deltas
/// through the kernel.
pub struct ClosureEngine {
    pub(crate) kernel: Kernel,
    pub(crate) data_dir: PathBuf,
}

impl ClosureEngine {
    /// Creates an engine persisting under `data_dir`.
    pub fn new(kernel: Kernel, data_dir: impl Into<PathBuf>) -> Self {
        ClosureEngine {
            kernel,
            data_dir: data_dir.into(),
        }
    }

    /// The engine's kernel (clock and id ports).
    #[must_use]
    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    fn path(&self, file: &str) -> PathBuf {
        self.data_dir.join(file)
    }

    /// Loads the closures registry (empty when absent).
    pub fn registry(&self) -> Result<ClosuresRegistry, LawError> {
        Ok(read_json_artifact(&self.path(CLOSURES_FILE))?.unwrap_or_default())
    }

    pub(crate) fn save_registry(&self, registry: &ClosuresRegistry) -> Result<(), LawError> {
        write_json_artifact(&self.path(CLOSURES_FILE), registry)?;
        Ok(())
    }

    /// Loads the open-loop records (empty when absent).
    pub fn open_loops(&self) -> Result<Vec<LoopRecord>, LawError> {
        Ok(read_json_artifact(&self.path(LOOPS_LATEST_FILE))?.unwrap_or_default())
    }

    /// Loads the closed-loop records (empty when absent).
    pub fn closed_loops(&self) -> Result<Vec<LoopRecord>, LawError> {
        Ok(read_json_artifact(&self.path(LOOPS_CLOSED_FILE))?.unwrap_or_default())
    }

    /// Replaces the open-loop file (used by embedders seeding loops).
    pub fn save_open_loops(&self, loops: &[LoopRecord]) -> Result<(), LawError> {
        write_json_artifact(&self.path(LOOPS_LATEST_FILE), &loops)?;
        Ok(())
    }

    /// Loads the current `system_state` record, if one exists.
    pub fn load_system(store: &dyn Store) -> Result<Option<EntityRecord>, LawError> {
        Ok(store
            .load_entities_by_type(EntityType::SystemState)?
            .into_iter()
            .next())
    }

    /// Loads `system_state`, creating the default skeleton when absent.
    pub fn ensure_system(&self, store: &mut dyn Store) -> Result<EntityRecord, LawError> {
        if let Some(record) = Self::load_system(store)? {
            return Ok(record);
        }
        let now = self.kernel.clock().now_ms();
        let skeleton = default_skeleton(now);
        let committed = self
            .kernel
            .create_entity(EntityType::SystemState, &skeleton, "closure_engine")?;
        commit(store, &committed)?;
        info!(entity_id = %committed.entity.entity_id, "materialized system_state skeleton");
        Ok(EntityRecord {
            entity: committed.entity,
            state: committed.state,
        })
    }

    /// Closes (or archives) a loop: one atomic delta, then the registry row,
    /// then best-effort physical removal.
    ///
    /// # Errors
    ///
    /// Returns [`LawError::AlreadyClosed`] when the loop id already has a
    /// registry row, or a store/kernel error from the commit itself.
    pub fn close_loop(
        &self,
        store: &mut dyn Store,
        req: &ClosureRequest,
    ) -> Result<ClosureReceipt, LawError> {
        let mut registry = self.registry()?;
        if let Some(loop_id) = &req.loop_id {
            if registry.contains_loop(loop_id) {
                return Err(LawError::AlreadyClosed {
                    loop_id: loop_id.clone(),
                });
            }
        }

        let now = self.kernel.clock().now_ms();
        let today = self.kernel.clock().utc_day();
        let system = Self::load_system(store)?;

        let loops = self.open_loops()?;
        let open_after = loops
            .iter()
            .filter(|l| Some(l.loop_id.as_str()) != req.loop_id.as_deref())
            .count() as u64;

        let closed_total = registry.stats.total_closures + 1;
        let ratio = closed_total as f64 / (open_after + closed_total) as f64;

        let current_mode = system
            .as_ref()
            .and_then(|r| read_mode(&r.state))
            .unwrap_or(Mode::Closure);
        let signals = ModeSignals {
            mode: current_mode,
            sleep_hours: system
                .as_ref()
                .and_then(|r| read_f64(&r.state, "/signals/sleep_hours"))
                .unwrap_or(7.0),
            open_loops: open_after,
            leverage_balance: system
                .as_ref()
                .and_then(|r| read_f64(&r.state, "/signals/leverage_balance"))
                .unwrap_or(0.0),
            streak_days: registry.stats.streak_days,
            closure_ratio: Some(ratio),
        };
        let decision = compute_mode(&signals);
        let mode_changed = system.is_none() || decision.mode != current_mode;

        // Streak rule: first closure of the UTC day, and only when the new
        // mode is BUILD-eligible.
        let first_today = registry.closures_on_day(&today) == 0;
        let streak_eligible = matches!(decision.mode, Mode::Build | Mode::Scale);
        let incremented = first_today && streak_eligible;
        let streak_days = if incremented {
            registry.stats.streak_days + 1
        } else {
            registry.stats.streak_days
        };
        let best_streak = registry.stats.best_streak.max(streak_days);
        let closures_today = registry.closures_on_day(&today) + 1;

        let record = ClosureRecord {
            ts: now,
            loop_id: req.loop_id.clone(),
            title: req.title.clone(),
            outcome: req.outcome,
            source: req.source.clone(),
        };
        let log_entry = json!({
            "ts": now,
            "loop_id": record.loop_id,
            "title": record.title,
            "outcome": record.outcome.as_str(),
        });

        let committed = match &system {
            Some(current) => {
                let mut patches = vec![
                    PatchOp::replace("/enforcement/violations_count", json!(0)),
                    PatchOp::add(
                        format!(
                            "/enforcement/closure_log/{}",
                            array_len(&current.state, "/enforcement/closure_log")
                        ),
                        log_entry,
                    ),
                    PatchOp::replace("/metrics/closed_loops_total", json!(closed_total)),
                    PatchOp::replace("/metrics/last_closure_at", json!(now)),
                    PatchOp::replace("/metrics/closure_ratio", json!(ratio)),
                    PatchOp::replace("/metrics/open_loops", json!(open_after)),
                    PatchOp::replace("/metrics/closures_today", json!(closures_today)),
                    PatchOp::replace("/build_allowed", json!(decision.build_allowed)),
                ];
                if mode_changed {
                    patches.push(PatchOp::replace("/mode", json!(decision.mode.as_str())));
                    patches.push(PatchOp::replace("/last_mode_transition_at", json!(now)));
                    patches.push(PatchOp::replace(
                        "/last_mode_transition_reason",
                        json!(decision.reason),
                    ));
                }
                if incremented {
                    patches.push(PatchOp::replace("/streak/streak_days", json!(streak_days)));
                    patches.push(PatchOp::replace("/streak/best_streak", json!(best_streak)));
                    patches.push(PatchOp::replace("/streak/last_streak_date", json!(today)));
                }
                let committed = self.kernel.create_delta(
                    &current.entity,
                    &current.state,
                    patches,
                    "closure_engine",
                )?;
                commit(store, &committed)?;
                committed
            }
            None => {
                // Genesis closure: materialize the fully populated skeleton
                // in a single genesis delta.
                let skeleton = genesis_skeleton(
                    &decision,
                    now,
                    &today,
                    closed_total,
                    open_after,
                    ratio,
                    closures_today,
                    streak_days,
                    best_streak,
                    incremented,
                    &log_entry,
                );
                let committed = self.kernel.create_entity(
                    EntityType::SystemState,
                    &skeleton,
                    "closure_engine",
                )?;
                commit(store, &committed)?;
                committed
            }
        };

        // Ledger row follows the delta.
        registry.closures.push(record.clone());
        registry.stats.total_closures = closed_total;
        registry.stats.closures_today = closures_today;
        registry.stats.last_closure_at = Some(now);
        registry.stats.streak_days = streak_days;
        registry.stats.best_streak = best_streak;
        if incremented {
            registry.stats.last_streak_date = Some(today.clone());
        }
        self.save_registry(&registry)?;

        // Physical removal is best-effort and never rolls back the delta.
        let physical_closure = match &req.loop_id {
            None => PhysicalClosure {
                requested: false,
                removed: false,
                error: None,
            },
            Some(loop_id) => match self.remove_loop(loop_id, now) {
                Ok(removed) => PhysicalClosure {
                    requested: true,
                    removed,
                    error: None,
                },
                Err(e) => {
                    warn!(loop_id = %loop_id, error = %e, "physical loop removal failed");
                    PhysicalClosure {
                        requested: true,
                        removed: false,
                        error: Some(e.to_string()),
                    }
                }
            },
        };

        info!(
            loop_id = ?req.loop_id,
            mode = %decision.mode,
            ratio,
            "closure committed"
        );
        Ok(ClosureReceipt {
            closure: record,
            metrics: ClosureMetrics {
                closed_loops_total: closed_total,
                open_loops: open_after,
                closure_ratio: ratio,
                closures_today,
                last_closure_at: now,
            },
            mode: decision.mode,
            mode_changed,
            build_allowed: decision.build_allowed,
            violations_reset: true,
            streak: StreakSnapshot {
                streak_days,
                best_streak,
                incremented,
            },
            physical_closure,
            delta_id: committed.delta.delta_id,
        })
    }

    fn remove_loop(&self, loop_id: &str, now: u64) -> Result<bool, LawError> {
        let mut latest = self.open_loops()?;
        let before = latest.len();
        let mut removed_record = None;
        latest.retain(|l| {
            if l.loop_id == loop_id {
                removed_record = Some(l.clone());
                false
            } else {
                true
            }
        });
        if latest.len() == before {
            return Ok(false);
        }
        write_json_artifact(&self.path(LOOPS_LATEST_FILE), &latest)?;
        let mut closed = self.closed_loops()?;
        if let Some(mut record) = removed_record {
            record.closed_at = Some(now);
            closed.push(record);
        }
        write_json_artifact(&self.path(LOOPS_CLOSED_FILE), &closed)?;
        Ok(true)
    }

    /// Recomputes the mode from current signals, committing a transition
    /// delta when it changed.
    pub fn recalc_mode(&self, store: &mut dyn Store) -> Result<ModeRecalc, LawError> {
        let system = self.ensure_system(store)?;
        let registry = self.registry()?;
        let open = self.open_loops()?.len() as u64;
        let total = registry.stats.total_closures;
        let ratio = (total > 0).then(|| total as f64 / (open + total) as f64);
        let current_mode = read_mode(&system.state).unwrap_or(Mode::Closure);
        let signals = ModeSignals {
            mode: current_mode,
            sleep_hours: read_f64(&system.state, "/signals/sleep_hours").unwrap_or(7.0),
            open_loops: open,
            leverage_balance: read_f64(&system.state, "/signals/leverage_balance").unwrap_or(0.0),
            streak_days: registry.stats.streak_days,
            closure_ratio: ratio,
        };
        let decision = compute_mode(&signals);
        let build_now = read_bool(&system.state, "/build_allowed").unwrap_or(false);
        if decision.mode == current_mode && decision.build_allowed == build_now {
            return Ok(ModeRecalc {
                previous: current_mode,
                mode: decision.mode,
                changed: false,
                build_allowed: decision.build_allowed,
            });
        }
        let now = self.kernel.clock().now_ms();
        let patches = vec![
            PatchOp::replace("/mode", json!(decision.mode.as_str())),
            PatchOp::replace("/build_allowed", json!(decision.build_allowed)),
            PatchOp::replace("/last_mode_transition_at", json!(now)),
            PatchOp::replace("/last_mode_transition_reason", json!(decision.reason)),
        ];
        let committed =
            self.kernel
                .create_delta(&system.entity, &system.state, patches, "daemon")?;
        commit(store, &committed)?;
        info!(from = %current_mode, to = %decision.mode, "mode transition");
        Ok(ModeRecalc {
            previous: current_mode,
            mode: decision.mode,
            changed: true,
            build_allowed: decision.build_allowed,
        })
    }

    /// Day-start job: resets the daily closure counter.
    pub fn day_start(&self, store: &mut dyn Store) -> Result<(), LawError> {
        let system = self.ensure_system(store)?;
        let committed = self.kernel.create_delta(
            &system.entity,
            &system.state,
            vec![PatchOp::replace("/metrics/closures_today", json!(0))],
            "daemon",
        )?;
        commit(store, &committed)?;
        let mut registry = self.registry()?;
        registry.stats.closures_today = 0;
        self.save_registry(&registry)?;
        Ok(())
    }

    /// Day-end job: resets the streak when no BUILD-eligible closure
    /// happened on the current UTC day.
    pub fn day_end(&self, store: &mut dyn Store) -> Result<DayEndReport, LawError> {
        let today = self.kernel.clock().utc_day();
        let mut registry = self.registry()?;
        let streak_held = registry.stats.last_streak_date.as_deref() == Some(today.as_str());
        if streak_held || registry.stats.streak_days == 0 {
            return Ok(DayEndReport {
                streak_reset: false,
            });
        }
        let system = self.ensure_system(store)?;
        let committed = self.kernel.create_delta(
            &system.entity,
            &system.state,
            vec![PatchOp::replace("/streak/streak_days", json!(0))],
            "daemon",
        )?;
        commit(store, &committed)?;
        registry.stats.streak_days = 0;
        self.save_registry(&registry)?;
        info!("streak reset at day end");
        Ok(DayEndReport { streak_reset: true })
    }
}

/// Appends the delta, then the snapshot — log first, always.
pub(crate) fn commit(store: &mut dyn Store, committed: &Committed) -> Result<(), StoreError> {
    store.append_delta(&committed.delta)?;
    store.save_entity(&EntityRecord {
        entity: committed.entity.clone(),
        state: committed.state.clone(),
    })
}

pub(crate) fn read_mode(state: &Value) -> Option<Mode> {
    read_str(state, "/mode").and_then(|s| Mode::parse(&s))
}

pub(crate) fn read_str(state: &Value, path: &str) -> Option<String> {
    resolve(state, path)?.as_str().map(str::to_string)
}

pub(crate) fn read_f64(state: &Value, path: &str) -> Option<f64> {
    resolve(state, path)?.as_f64()
}

pub(crate) fn read_u64(state: &Value, path: &str) -> Option<u64> {
    resolve(state, path)?.as_u64()
}

pub(crate) fn read_bool(state: &Value, path: &str) -> Option<bool> {
    resolve(state, path)?.as_bool()
}

pub(crate) fn array_len(state: &Value, path: &str) -> usize {
    resolve(state, path)
        .and_then(Value::as_array)
        .map_or(0, Vec::len)
}

fn resolve<'a>(state: &'a Value, path: &str) -> Option<&'a Value> {
    Pointer::parse(path).ok()?.resolve(state)
}

/// Default skeleton for a node that has never closed a loop: CLOSURE mode,
/// build denied, all counters zero.
pub(crate) fn default_skeleton(now: u64) -> Value {
    json!({
        "mode": Mode::Closure.as_str(),
        "build_allowed": false,
        "last_mode_transition_at": now,
        "last_mode_transition_reason": "genesis",
        "metrics": {
            "closed_loops_total": 0,
            "open_loops": 0,
            "closure_ratio": 0.0,
            "closures_today": 0,
            "last_closure_at": 0,
        },
        "enforcement": {
            "violations_count": 0,
            "enforcement_level": "normal",
            "overrides_count": 0,
            "closure_log": [],
            "override_log": [],
        },
        "streak": {
            "streak_days": 0,
            "best_streak": 0,
            "last_streak_date": "",
        },
        "signals": {
            "sleep_hours": 7.0,
            "leverage_balance": 0.0,
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn genesis_skeleton(
    decision: &ModeDecision,
    now: u64,
    today: &str,
    closed_total: u64,
    open_loops: u64,
    ratio: f64,
    closures_today: u64,
    streak_days: u64,
    best_streak: u64,
    incremented: bool,
    log_entry: &Value,
) -> Value {
    json!({
        "mode": decision.mode.as_str(),
        "build_allowed": decision.build_allowed,
        "last_mode_transition_at": now,
        "last_mode_transition_reason": decision.reason,
        "metrics": {
            "closed_loops_total": closed_total,
            "open_loops": open_loops,
            "closure_ratio": ratio,
            "closures_today": closures_today,
            "last_closure_at": now,
        },
        "enforcement": {
            "violations_count": 0,
            "enforcement_level": "normal",
            "overrides_count": 0,
            "closure_log": [log_entry],
            "override_log": [],
        },
        "streak": {
            "streak_days": streak_days,
            "best_streak": best_streak,
            "last_streak_date": if incremented { today.to_string() } else { String::new() },
        },
        "signals": {
            "sleep_hours": 7.0,
            "leverage_balance": 0.0,
        },
    })
}
