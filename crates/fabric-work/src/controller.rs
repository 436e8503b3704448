// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The admission controller.
//!
//! Every piece of state-mutating work — human, machine, or scheduled — passes
//! through [`AdmissionController::request`], which applies three gates in
//! order:
//!
//! 1. **Mode gate** — CLOSURE mode denies non-closure work (AI work may be
//!    exempted by config); `build_allowed == false` denies it too.
//! 2. **Dependency gate** — unfinished `depends_on` entries queue the job
//!    with `blocked_by`.
//! 3. **Capacity gate** — active weights sum against `max_concurrent`;
//!    overflow queues, and a full queue denies.
//!
//! Completion emits a closure through the closure engine (tagged with the
//! job's type as source), frees slots, and drains the queue while admission
//! accepts. The ordering policy is fixed at construction and deterministic
//! for a given input sequence.

use crate::ledger::{JobOutcome, JobType, WorkJob, WorkLedger, WorkRequest, WorkStats};
use fabric_kernel::{EntityType, Kernel, Mode, Pointer};
use fabric_law::{ClosureEngine, ClosureOutcome, ClosureReceipt, ClosureRequest, LawError};
use fabric_store::{read_json_artifact, write_json_artifact, Store, StoreError};
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use tracing::{info, warn};

const LEDGER_FILE: &str = "work_ledger.json";

/// Tuning knobs for the controller.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct WorkConfig {
    /// Slot capacity: the sum of active job weights may not exceed this.
    pub max_concurrent: u64,
    /// Queue depth beyond which requests are denied, not queued.
    pub max_queue_depth: usize,
    /// Timeout applied when a request names none.
    pub default_timeout_ms: u64,
    /// Admit AI jobs even in CLOSURE mode.
    pub allow_ai_in_closure_mode: bool,
    /// Queue ordering policy; fixed for the controller's lifetime.
    pub ordering: OrderingPolicy,
}

impl Default for WorkConfig {
    fn default() -> Self {
        WorkConfig {
            max_concurrent: 3,
            max_queue_depth: 10,
            default_timeout_ms: 600_000,
            allow_ai_in_closure_mode: false,
            ordering: OrderingPolicy::Fifo,
        }
    }
}

/// Deterministic queue ordering policies.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub enum OrderingPolicy {
    /// By `queued_at`, insertion order breaking ties.
    #[default]
    Fifo,
    /// By metadata `priority` (1 highest), then `queued_at`, then id.
    Priority,
    /// By weight (heaviest first), then `queued_at`, then id.
    Weight,
}

/// Mode inputs consulted by the gates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct GateInputs {
    /// Current operational mode.
    pub mode: Mode,
    /// Whether build work is admitted.
    pub build_allowed: bool,
}

impl GateInputs {
    /// Reads the gates from the current `system_state`. A node with no
    /// `system_state` yet is in CLOSURE with build denied.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError`] on store failure.
    pub fn read(store: &dyn Store) -> Result<GateInputs, WorkError> {
        let system = store
            .load_entities_by_type(EntityType::SystemState)?
            .into_iter()
            .next();
        Ok(match system {
            None => GateInputs {
                mode: Mode::Closure,
                build_allowed: false,
            },
            Some(record) => GateInputs {
                mode: read_str(&record.state, "/mode")
                    .and_then(|s| Mode::parse(&s))
                    .unwrap_or(Mode::Closure),
                build_allowed: read_bool(&record.state, "/build_allowed").unwrap_or(false),
            },
        })
    }
}

fn read_str(state: &Value, path: &str) -> Option<String> {
    Pointer::parse(path)
        .ok()?
        .resolve(state)?
        .as_str()
        .map(str::to_string)
}

fn read_bool(state: &Value, path: &str) -> Option<bool> {
    Pointer::parse(path).ok()?.resolve(state)?.as_bool()
}

/// Why a request was denied.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    /// CLOSURE mode admits only closure work.
    ModeDeniesWork,
    /// The ratio LUT has build denied.
    BuildNotAllowed,
    /// Active weights would exceed capacity and the queue is full.
    SystemAtCapacity,
    /// The queue itself is full.
    QueueFull,
}

impl DenyReason {
    /// Human-facing reason line.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            DenyReason::ModeDeniesWork => "Must close loops first",
            DenyReason::BuildNotAllowed => "Build is not allowed in the current mode",
            DenyReason::SystemAtCapacity => "system_at_capacity",
            DenyReason::QueueFull => "queue_full",
        }
    }
}

/// Outcome of a work request.
#[derive(Clone, PartialEq, Debug, Serialize)]
#[serde(tag = "status", rename_all = "UPPERCASE")]
pub enum Admission {
    /// The job started immediately.
    Approved {
        /// The started job.
        job: WorkJob,
    },
    /// The job is waiting on capacity or dependencies.
    Queued {
        /// The queued job.
        job: WorkJob,
        /// Zero-based queue position at admission time.
        position: usize,
        /// Unfinished dependencies, when that is what queued it.
        blocked_by: Vec<String>,
    },
    /// The job was not admitted.
    Denied {
        /// Machine-stable reason.
        reason: DenyReason,
        /// Human-facing reason line.
        message: String,
    },
}

/// Receipt for `work.complete`.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct CompleteReceipt {
    /// Whether a slot was freed (the job was active).
    pub freed_slot: bool,
    /// Whether the queue advanced.
    pub queue_advanced: bool,
    /// First job started by the advance, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_job_started: Option<String>,
    /// Closure emitted for a completed outcome.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closure: Option<ClosureReceipt>,
    /// Streak after the closure, when one was emitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak_days: Option<u64>,
}

/// Receipt for `work.cancel`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize)]
pub struct CancelReceipt {
    /// Whether the job was running when cancelled.
    pub was_active: bool,
    /// Whether a slot was freed.
    pub freed_slot: bool,
    /// Whether the queue advanced.
    pub queue_advanced: bool,
}

/// Report from the timeout sweep.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct SweepReport {
    /// Jobs failed with `error = "timeout"`.
    pub timed_out: Vec<String>,
    /// Jobs started from the queue afterwards.
    pub started: Vec<String>,
}

/// Capacity snapshot for `work.status`.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct WorkStatus {
    /// Slot capacity.
    pub max_concurrent: u64,
    /// Slots in use (sum of active weights).
    pub used_slots: u64,
    /// Remaining capacity.
    pub available_slots: u64,
    /// Queue depth limit.
    pub max_queue_depth: usize,
    /// Running jobs.
    pub active: Vec<WorkJob>,
    /// Waiting jobs, queue order.
    pub queued: Vec<WorkJob>,
}

/// Recent history for `work.history`.
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct WorkHistory {
    /// Most recent terminal jobs, oldest first (capped).
    pub completed: Vec<WorkJob>,
    /// Aggregates.
    pub stats: WorkStats,
}

/// Errors from controller operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    /// No such job in the ledger's active or queued lists.
    #[error("[NOT_FOUND] job {job_id:?}")]
    NotFound {
        /// The missing job id.
        job_id: String,
    },
    /// Weight outside 1–10.
    #[error("weight must be between 1 and 10, got {weight}")]
    InvalidWeight {
        /// The offending weight.
        weight: u64,
    },
    /// A live job already holds this id.
    #[error("[DUPLICATE_JOB] job {job_id:?} already exists")]
    DuplicateJob {
        /// The duplicate id.
        job_id: String,
    },
    /// Ledger artifact failure.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Closure emission failure.
    #[error(transparent)]
    Law(#[from] LawError),
}

/// The admission controller. Owns the work ledger artifact exclusively.
pub struct AdmissionController {
    config: WorkConfig,
    kernel: Kernel,
    ledger_path: PathBuf,
}

impl AdmissionController {
    /// Creates a controller persisting its ledger under `data_dir`.
    pub fn new(kernel: Kernel, data_dir: impl Into<PathBuf>, config: WorkConfig) -> Self {
        AdmissionController {
            config,
            kernel,
            ledger_path: data_dir.into().join(LEDGER_FILE),
        }
    }

    /// The controller's configuration.
    #[must_use]
    pub fn config(&self) -> &WorkConfig {
        &self.config
    }

    /// Loads the ledger (empty when absent).
    pub fn ledger(&self) -> Result<WorkLedger, WorkError> {
        Ok(read_json_artifact(&self.ledger_path)?.unwrap_or_default())
    }

    fn save_ledger(&self, ledger: &WorkLedger) -> Result<(), WorkError> {
        write_json_artifact(&self.ledger_path, ledger)?;
        Ok(())
    }

    /// Requests admission for a job.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError::InvalidWeight`] / [`WorkError::DuplicateJob`] for
    /// malformed requests; gate failures come back as
    /// [`Admission::Denied`], not errors.
    pub fn request(
        &self,
        gates: &GateInputs,
        req: &WorkRequest,
    ) -> Result<Admission, WorkError> {
        if req.weight == 0 || req.weight > 10 {
            return Err(WorkError::InvalidWeight { weight: req.weight });
        }
        let mut ledger = self.ledger()?;
        let now = self.kernel.clock().now_ms();
        let job_id = match &req.job_id {
            Some(id) => id.clone(),
            None => self.kernel.ids().mint("job"),
        };
        if ledger.knows(&job_id) {
            return Err(WorkError::DuplicateJob { job_id });
        }

        // Gate 1: mode.
        if !req.closure_work {
            let ai_exempt =
                self.config.allow_ai_in_closure_mode && req.job_type == JobType::Ai;
            if gates.mode == Mode::Closure && !ai_exempt {
                ledger.stats.total_denied += 1;
                self.save_ledger(&ledger)?;
                return Ok(deny(DenyReason::ModeDeniesWork));
            }
            if !gates.build_allowed && !ai_exempt {
                ledger.stats.total_denied += 1;
                self.save_ledger(&ledger)?;
                return Ok(deny(DenyReason::BuildNotAllowed));
            }
        }

        let mut job = WorkJob {
            job_id,
            job_type: req.job_type,
            title: req.title.clone(),
            agent: req.agent.clone(),
            weight: req.weight,
            depends_on: req.depends_on.clone(),
            timeout_ms: req.timeout_ms.unwrap_or(self.config.default_timeout_ms),
            metadata: req.metadata.clone(),
            closure_work: req.closure_work,
            requested_at: now,
            queued_at: None,
            blocked_by: Vec::new(),
            started_at: None,
            timeout_at: None,
            completed_at: None,
            outcome: None,
            error: None,
            result: None,
            metrics: None,
        };

        // Gate 2: dependencies.
        let blocked_by: Vec<String> = job
            .depends_on
            .iter()
            .filter(|dep| !ledger.is_completed(dep))
            .cloned()
            .collect();
        if !blocked_by.is_empty() {
            if ledger.queued.len() >= self.config.max_queue_depth {
                ledger.stats.total_denied += 1;
                self.save_ledger(&ledger)?;
                return Ok(deny(DenyReason::QueueFull));
            }
            job.queued_at = Some(now);
            job.blocked_by = blocked_by.clone();
            ledger.queued.push(job.clone());
            ledger.stats.total_requested += 1;
            let position = ledger.queued.len() - 1;
            self.save_ledger(&ledger)?;
            info!(job_id = %job.job_id, ?blocked_by, "job queued on dependencies");
            return Ok(Admission::Queued {
                job,
                position,
                blocked_by,
            });
        }

        // Gate 3: capacity.
        if ledger.used_slots() + job.weight > self.config.max_concurrent {
            if ledger.queued.len() >= self.config.max_queue_depth {
                ledger.stats.total_denied += 1;
                self.save_ledger(&ledger)?;
                return Ok(deny(DenyReason::SystemAtCapacity));
            }
            job.queued_at = Some(now);
            ledger.queued.push(job.clone());
            ledger.stats.total_requested += 1;
            let position = ledger.queued.len() - 1;
            self.save_ledger(&ledger)?;
            info!(job_id = %job.job_id, "job queued on capacity");
            return Ok(Admission::Queued {
                job,
                position,
                blocked_by: Vec::new(),
            });
        }

        job.started_at = Some(now);
        job.timeout_at = Some(now + job.timeout_ms);
        ledger.active.push(job.clone());
        ledger.stats.total_requested += 1;
        self.save_ledger(&ledger)?;
        info!(job_id = %job.job_id, weight = job.weight, "job approved");
        Ok(Admission::Approved { job })
    }

    /// Completes a job and advances the queue.
    ///
    /// A `completed` outcome emits a closure through the closure engine
    /// (source = the job's type); the queue then re-evaluates against the
    /// post-closure mode.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError::NotFound`] for an unknown or already-terminal
    /// job id.
    #[allow(clippy::too_many_arguments)]
    pub fn complete(
        &self,
        store: &mut dyn Store,
        law: &ClosureEngine,
        job_id: &str,
        outcome: JobOutcome,
        result: Option<Value>,
        error: Option<String>,
        metrics: Option<Value>,
    ) -> Result<CompleteReceipt, WorkError> {
        let mut ledger = self.ledger()?;
        let now = self.kernel.clock().now_ms();
        let (mut job, freed_slot) = take_job(&mut ledger, job_id)?;
        job.completed_at = Some(now);
        job.outcome = Some(outcome);
        job.result = result;
        job.error = error;
        job.metrics = metrics;
        match outcome {
            JobOutcome::Completed => ledger.stats.total_completed += 1,
            JobOutcome::Failed => ledger.stats.total_failed += 1,
            JobOutcome::Abandoned => ledger.stats.total_abandoned += 1,
        }

        let closure = if outcome == JobOutcome::Completed {
            match law.close_loop(
                store,
                &ClosureRequest {
                    loop_id: job.loop_id(),
                    title: Some(job.title.clone()),
                    outcome: ClosureOutcome::Closed,
                    source: job.job_type.as_str().to_string(),
                },
            ) {
                Ok(receipt) => Some(receipt),
                Err(LawError::AlreadyClosed { loop_id }) => {
                    warn!(job_id, %loop_id, "job loop already closed; skipping closure");
                    None
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            None
        };

        ledger.completed.push(job);
        // Mode may have shifted with the closure; re-read the gates before
        // draining the queue.
        let gates = GateInputs::read(store)?;
        let started = self.advance(&mut ledger, &gates, now);
        self.save_ledger(&ledger)?;
        Ok(CompleteReceipt {
            freed_slot,
            queue_advanced: !started.is_empty(),
            next_job_started: started.first().cloned(),
            streak_days: closure.as_ref().map(|c| c.streak.streak_days),
            closure,
        })
    }

    /// Cancels an active or queued job, recording an `abandoned` row.
    ///
    /// # Errors
    ///
    /// Returns [`WorkError::NotFound`] for an unknown job id.
    pub fn cancel(
        &self,
        gates: &GateInputs,
        job_id: &str,
        reason: Option<&str>,
    ) -> Result<CancelReceipt, WorkError> {
        let mut ledger = self.ledger()?;
        let now = self.kernel.clock().now_ms();
        let (mut job, was_active) = take_job(&mut ledger, job_id)?;
        job.completed_at = Some(now);
        job.outcome = Some(JobOutcome::Abandoned);
        job.error = reason.map(str::to_string);
        ledger.stats.total_abandoned += 1;
        ledger.completed.push(job);
        let started = self.advance(&mut ledger, gates, now);
        self.save_ledger(&ledger)?;
        Ok(CancelReceipt {
            was_active,
            freed_slot: was_active,
            queue_advanced: !started.is_empty(),
        })
    }

    /// Times out overdue active jobs, then advances the queue.
    pub fn sweep(&self, gates: &GateInputs) -> Result<SweepReport, WorkError> {
        let mut ledger = self.ledger()?;
        let now = self.kernel.clock().now_ms();
        let mut report = SweepReport::default();
        let mut kept = Vec::with_capacity(ledger.active.len());
        for mut job in std::mem::take(&mut ledger.active) {
            let overdue = job.timeout_at.is_some_and(|t| now > t);
            if overdue {
                job.completed_at = Some(now);
                job.outcome = Some(JobOutcome::Failed);
                job.error = Some("timeout".to_string());
                ledger.stats.total_failed += 1;
                ledger.stats.total_timed_out += 1;
                warn!(job_id = %job.job_id, "job timed out");
                report.timed_out.push(job.job_id.clone());
                ledger.completed.push(job);
            } else {
                kept.push(job);
            }
        }
        ledger.active = kept;
        report.started = self.advance(&mut ledger, gates, now);
        self.save_ledger(&ledger)?;
        Ok(report)
    }

    /// Capacity snapshot.
    pub fn status(&self) -> Result<WorkStatus, WorkError> {
        let ledger = self.ledger()?;
        let used = ledger.used_slots();
        Ok(WorkStatus {
            max_concurrent: self.config.max_concurrent,
            used_slots: used,
            available_slots: self.config.max_concurrent.saturating_sub(used),
            max_queue_depth: self.config.max_queue_depth,
            active: ledger.active,
            queued: ledger.queued,
        })
    }

    /// Recent completions plus aggregates.
    pub fn history(&self) -> Result<WorkHistory, WorkError> {
        let ledger = self.ledger()?;
        let skip = ledger.completed.len().saturating_sub(50);
        Ok(WorkHistory {
            completed: ledger.completed.into_iter().skip(skip).collect(),
            stats: ledger.stats,
        })
    }

    /// Drains the queue while admission accepts: dependency-satisfied jobs in
    /// policy order start until capacity stops the drain.
    fn advance(&self, ledger: &mut WorkLedger, gates: &GateInputs, now: u64) -> Vec<String> {
        let mut started = Vec::new();
        loop {
            self.order_queue(&mut ledger.queued);
            let candidate = ledger.queued.iter().position(|job| {
                job.depends_on.iter().all(|dep| ledger.is_completed(dep))
                    && mode_admits(gates, job, &self.config)
            });
            let Some(idx) = candidate else { break };
            if ledger.used_slots() + ledger.queued[idx].weight > self.config.max_concurrent {
                break;
            }
            let mut job = ledger.queued.remove(idx);
            job.blocked_by.clear();
            job.started_at = Some(now);
            job.timeout_at = Some(now + job.timeout_ms);
            info!(job_id = %job.job_id, "queue advanced");
            started.push(job.job_id.clone());
            ledger.active.push(job);
        }
        started
    }

    fn order_queue(&self, queued: &mut [WorkJob]) {
        match self.config.ordering {
            OrderingPolicy::Fifo => {
                queued.sort_by(|a, b| a.queued_at.cmp(&b.queued_at));
            }
            OrderingPolicy::Priority => {
                queued.sort_by(|a, b| {
                    (a.priority(), a.queued_at, &a.job_id)
                        .cmp(&(b.priority(), b.queued_at, &b.job_id))
                });
            }
            OrderingPolicy::Weight => {
                queued.sort_by(|a, b| {
                    (std::cmp::Reverse(a.weight), a.queued_at, &a.job_id)
                        .cmp(&(std::cmp::Reverse(b.weight), b.queued_at, &b.job_id))
                });
            }
        }
    }
}

fn mode_admits(gates: &GateInputs, job: &WorkJob, config: &WorkConfig) -> bool {
    if job.closure_work {
        return true;
    }
    let ai_exempt = config.allow_ai_in_closure_mode && job.job_type == JobType::Ai;
    if gates.mode == Mode::Closure && !ai_exempt {
        return false;
    }
    gates.build_allowed || ai_exempt
}

fn deny(reason: DenyReason) -> Admission {
    Admission::Denied {
        reason,
        message: reason.message().to_string(),
    }
}

/// Removes a live job from active (true) or queued (false).
fn take_job(ledger: &mut WorkLedger, job_id: &str) -> Result<(WorkJob, bool), WorkError> {
    if let Some(idx) = ledger.active.iter().position(|j| j.job_id == job_id) {
        return Ok((ledger.active.remove(idx), true));
    }
    if let Some(idx) = ledger.queued.iter().position(|j| j.job_id == job_id) {
        return Ok((ledger.queued.remove(idx), false));
    }
    Err(WorkError::NotFound {
        job_id: job_id.to_string(),
    })
}
