// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `work.*` operations.

use crate::{ApiError, Inner, KernelContext, StateEvent};
use fabric_work::{Admission, GateInputs, JobOutcome, WorkRequest};
use serde::Deserialize;
use serde_json::{json, Value};

/// Input for `work.complete`.
#[derive(Clone, Debug, Deserialize)]
pub struct CompleteInput {
    /// Job reaching a terminal outcome.
    pub job_id: String,
    /// `completed`, `failed`, or `abandoned`.
    pub outcome: JobOutcome,
    /// Result payload for completed jobs.
    #[serde(default)]
    pub result: Option<Value>,
    /// Error text for failed jobs.
    #[serde(default)]
    pub error: Option<String>,
    /// Completion metrics.
    #[serde(default)]
    pub metrics: Option<Value>,
}

impl KernelContext {
    /// `work.request`: admission under mode, dependency, and capacity gates.
    ///
    /// # Errors
    ///
    /// Returns validation errors for malformed requests; gate denials come
    /// back inside the envelope, not as errors.
    pub fn work_request(&self, request: &WorkRequest) -> Result<Value, ApiError> {
        let (admission, unified) = {
            let mut inner = self.lane();
            let gates = GateInputs::read(&inner.store)?;
            let admission = inner.work.request(&gates, request)?;
            let Inner { timeline, .. } = &mut *inner;
            timeline.record(
                "work_request",
                "admission",
                Some(&request.title),
                serde_json::to_value(&admission).ok(),
            );
            (admission, self.unified_locked(&inner))
        };
        if matches!(admission, Admission::Approved { .. }) {
            self.emit(StateEvent::UnifiedState { state: unified });
        }
        serde_json::to_value(&admission).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `work.complete`: terminal outcome, closure accounting, queue advance.
    ///
    /// # Errors
    ///
    /// Returns 404-equivalent for unknown job ids.
    pub fn work_complete(&self, input: &CompleteInput) -> Result<Value, ApiError> {
        let (receipt, unified) = {
            let mut inner = self.lane();
            let Inner {
                store,
                law,
                work,
                timeline,
                ..
            } = &mut *inner;
            let receipt = work.complete(
                store,
                law,
                &input.job_id,
                input.outcome,
                input.result.clone(),
                input.error.clone(),
                input.metrics.clone(),
            )?;
            timeline.record(
                "work_complete",
                "admission",
                Some(&input.job_id),
                serde_json::to_value(&receipt).ok(),
            );
            (receipt, self.unified_locked(&inner))
        };
        self.emit(StateEvent::UnifiedState { state: unified });
        Ok(json!({
            "freed_slot": receipt.freed_slot,
            "queue_advanced": receipt.queue_advanced,
            "next_job_started": receipt.next_job_started,
            "closure_count": receipt.closure.as_ref().map(|_| 1).unwrap_or(0),
            "streak_days": receipt.streak_days,
        }))
    }

    /// `work.status`: capacity, lists, and the gates in force.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on ledger failure.
    pub fn work_status(&self) -> Result<Value, ApiError> {
        let inner = self.lane();
        let status = inner.work.status()?;
        let unified = self.unified_locked(&inner);
        let mut value =
            serde_json::to_value(&status).map_err(|e| ApiError::internal(e.to_string()))?;
        if let Value::Object(map) = &mut value {
            map.insert("mode".to_string(), unified["mode"].clone());
            map.insert(
                "build_allowed".to_string(),
                unified["build_allowed"].clone(),
            );
            map.insert(
                "closure_ratio".to_string(),
                unified["closure_ratio"].clone(),
            );
        }
        Ok(value)
    }

    /// `work.cancel`: removes a job from either list.
    ///
    /// # Errors
    ///
    /// Returns 404-equivalent for unknown job ids.
    pub fn work_cancel(&self, job_id: &str, reason: Option<&str>) -> Result<Value, ApiError> {
        let mut inner = self.lane();
        let gates = GateInputs::read(&inner.store)?;
        let receipt = inner.work.cancel(&gates, job_id, reason)?;
        let Inner { timeline, .. } = &mut *inner;
        timeline.record(
            "work_cancel",
            "admission",
            Some(job_id),
            Some(json!({"reason": reason})),
        );
        serde_json::to_value(receipt).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `work.history`: recent completions plus aggregates.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on ledger failure.
    pub fn work_history(&self) -> Result<Value, ApiError> {
        let inner = self.lane();
        let history = inner.work.history()?;
        serde_json::to_value(&history).map_err(|e| ApiError::internal(e.to_string()))
    }
}
