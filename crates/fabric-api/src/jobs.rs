// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Governance job bodies, dispatched by the daemon through the commit lane.

use crate::{Inner, KernelContext, StateEvent};
use fabric_daemon::{JobError, JobHandler, JobName};
use fabric_work::GateInputs;
use serde_json::{json, Value};
use std::sync::Arc;

pub(crate) struct GovernanceJobs {
    pub(crate) context: Arc<KernelContext>,
}

impl GovernanceJobs {
    fn heartbeat(&self) -> Result<Value, JobError> {
        let inner = self.context.lane();
        inner.timeline.record("heartbeat", "daemon", None, None);
        Ok(json!({ "ok": true, "ts": self.context.kernel.clock().now_ms() }))
    }

    fn refresh(&self) -> Result<Value, JobError> {
        let mut inner = self.context.lane();
        let Inner {
            store,
            law,
            timeline,
            ..
        } = &mut *inner;
        let receipt = law.refresh(store).map_err(failed)?;
        timeline.record("refresh", "daemon", None, None);
        serde_json::to_value(receipt).map_err(failed)
    }

    fn day_start(&self) -> Result<Value, JobError> {
        let recalc = {
            let mut inner = self.context.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            law.day_start(store).map_err(failed)?;
            let recalc = law.recalc_mode(store).map_err(failed)?;
            timeline.record("day_start", "daemon", None, None);
            recalc
        };
        self.emit_unified();
        serde_json::to_value(recalc).map_err(failed)
    }

    fn day_end(&self) -> Result<Value, JobError> {
        let (report, recalc) = {
            let mut inner = self.context.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            let report = law.day_end(store).map_err(failed)?;
            let recalc = law.recalc_mode(store).map_err(failed)?;
            timeline.record(
                "day_end",
                "daemon",
                None,
                Some(json!({"streak_reset": report.streak_reset})),
            );
            (report, recalc)
        };
        self.emit_unified();
        Ok(json!({
            "streak_reset": report.streak_reset,
            "mode": recalc.mode.as_str(),
        }))
    }

    fn mode_recalc(&self) -> Result<Value, JobError> {
        let recalc = {
            let mut inner = self.context.lane();
            let Inner {
                store,
                law,
                timeline,
                ..
            } = &mut *inner;
            let recalc = law.recalc_mode(store).map_err(failed)?;
            if recalc.changed {
                timeline.record(
                    "mode_transition",
                    "daemon",
                    None,
                    Some(json!({
                        "from": recalc.previous.as_str(),
                        "to": recalc.mode.as_str(),
                    })),
                );
            }
            recalc
        };
        if recalc.changed {
            self.emit_unified();
        }
        serde_json::to_value(recalc).map_err(failed)
    }

    fn work_queue_sweep(&self) -> Result<Value, JobError> {
        let report = {
            let inner = self.context.lane();
            let gates = GateInputs::read(&inner.store).map_err(failed)?;
            inner.work.sweep(&gates).map_err(failed)?
        };
        serde_json::to_value(report).map_err(failed)
    }

    fn emit_unified(&self) {
        let unified = self.context.state_get_unified();
        self.context.emit(StateEvent::UnifiedState { state: unified });
    }
}

impl JobHandler for GovernanceJobs {
    fn run(&self, job: JobName) -> Result<Value, JobError> {
        match job {
            JobName::Heartbeat => self.heartbeat(),
            JobName::Refresh => self.refresh(),
            JobName::DayStart => self.day_start(),
            JobName::DayEnd => self.day_end(),
            JobName::ModeRecalc => self.mode_recalc(),
            JobName::WorkQueueSweep => self.work_queue_sweep(),
        }
    }
}

fn failed(e: impl std::fmt::Display) -> JobError {
    JobError::Failed {
        detail: e.to_string(),
    }
}
