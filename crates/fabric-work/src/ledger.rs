// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The work ledger: typed job records and their durable artifact.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who (or what) performs a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    /// A human operator.
    Human,
    /// An AI agent.
    Ai,
    /// A machine/system task.
    System,
}

impl JobType {
    /// The lowercase tag used in artifacts and closure sources.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobType::Human => "human",
            JobType::Ai => "ai",
            JobType::System => "system",
        }
    }
}

/// Terminal outcome of a job.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobOutcome {
    /// Finished successfully; emits a closure.
    Completed,
    /// Finished unsuccessfully (including timeouts).
    Failed,
    /// Cancelled before finishing.
    Abandoned,
}

/// A work request as submitted by a caller.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct WorkRequest {
    /// Caller-chosen id; minted when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// Performer class.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Human-readable title.
    pub title: String,
    /// Named agent, when one is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Slot weight, 1–10.
    #[serde(default = "default_weight")]
    pub weight: u64,
    /// Job ids that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Per-job timeout; the controller default applies when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Opaque caller metadata. A `loop_id` key here links the job's closure
    /// to a tracked loop.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Marks closure work, which the CLOSURE mode gate admits.
    #[serde(default)]
    pub closure_work: bool,
}

fn default_weight() -> u64 {
    1
}

/// A job as tracked by the ledger.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct WorkJob {
    /// Unique id.
    pub job_id: String,
    /// Performer class.
    #[serde(rename = "type")]
    pub job_type: JobType,
    /// Human-readable title.
    pub title: String,
    /// Named agent, when one is assigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Slot weight, 1–10.
    pub weight: u64,
    /// Job ids that must complete first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Effective timeout for this job.
    pub timeout_ms: u64,
    /// Opaque caller metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    /// Marks closure work.
    #[serde(default)]
    pub closure_work: bool,
    /// When the request was admitted into the ledger.
    pub requested_at: u64,
    /// When the job entered the queue, when it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued_at: Option<u64>,
    /// Unfinished dependencies blocking this job.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_by: Vec<String>,
    /// When the job started running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    /// Hard deadline (`started_at + timeout_ms`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_at: Option<u64>,
    /// When the job reached a terminal outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
    /// Terminal outcome, once reached.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<JobOutcome>,
    /// Error text for failed jobs (`"timeout"` for sweep kills).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Result payload for completed jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Caller-supplied completion metrics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<Value>,
}

impl WorkJob {
    /// The `loop_id` this job's closure should retire, when its metadata
    /// names one.
    #[must_use]
    pub fn loop_id(&self) -> Option<String> {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("loop_id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Queue priority from metadata (`priority` key, default 5, 1 highest).
    #[must_use]
    pub fn priority(&self) -> u64 {
        self.metadata
            .as_ref()
            .and_then(|m| m.get("priority"))
            .and_then(Value::as_u64)
            .unwrap_or(5)
    }
}

/// Ledger aggregates.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct WorkStats {
    /// Requests ever admitted (approved or queued).
    pub total_requested: u64,
    /// Jobs completed successfully.
    pub total_completed: u64,
    /// Jobs failed (including timeouts).
    pub total_failed: u64,
    /// Jobs abandoned via cancel.
    pub total_abandoned: u64,
    /// Requests denied outright.
    pub total_denied: u64,
    /// Jobs killed by the timeout sweep.
    pub total_timed_out: u64,
}

/// The durable `work_ledger.json` artifact.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct WorkLedger {
    /// Running jobs.
    #[serde(default)]
    pub active: Vec<WorkJob>,
    /// Waiting jobs, queue order.
    #[serde(default)]
    pub queued: Vec<WorkJob>,
    /// Terminal jobs, completion order.
    #[serde(default)]
    pub completed: Vec<WorkJob>,
    /// Aggregates.
    #[serde(default)]
    pub stats: WorkStats,
}

impl WorkLedger {
    /// Sum of active job weights (slots in use).
    #[must_use]
    pub fn used_slots(&self) -> u64 {
        self.active.iter().map(|j| j.weight).sum()
    }

    /// Whether a terminal record exists for `job_id`.
    #[must_use]
    pub fn is_completed(&self, job_id: &str) -> bool {
        self.completed.iter().any(|j| j.job_id == job_id)
    }

    /// Whether any record (active, queued, or terminal) holds `job_id`.
    #[must_use]
    pub fn knows(&self, job_id: &str) -> bool {
        self.active.iter().any(|j| j.job_id == job_id)
            || self.queued.iter().any(|j| j.job_id == job_id)
            || self.is_completed(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_defaults_apply() {
        let req: WorkRequest =
            serde_json::from_value(json!({"type": "ai", "title": "index corpus"})).unwrap();
        assert_eq!(req.weight, 1);
        assert!(req.depends_on.is_empty());
        assert!(!req.closure_work);
    }

    #[test]
    fn used_slots_sums_weights() {
        let mut ledger = WorkLedger::default();
        for (id, weight) in [("a", 2), ("b", 3)] {
            ledger.active.push(WorkJob {
                job_id: id.to_string(),
                job_type: JobType::System,
                title: id.to_string(),
                agent: None,
                weight,
                depends_on: Vec::new(),
                timeout_ms: 1000,
                metadata: None,
                closure_work: false,
                requested_at: 0,
                queued_at: None,
                blocked_by: Vec::new(),
                started_at: Some(0),
                timeout_at: Some(1000),
                completed_at: None,
                outcome: None,
                error: None,
                result: None,
                metrics: None,
            });
        }
        assert_eq!(ledger.used_slots(), 5);
    }

    #[test]
    fn loop_id_and_priority_read_from_metadata() {
        let job = WorkJob {
            job_id: "j".to_string(),
            job_type: JobType::Human,
            title: "t".to_string(),
            agent: None,
            weight: 1,
            depends_on: Vec::new(),
            timeout_ms: 1,
            metadata: Some(json!({"loop_id": "L1", "priority": 2})),
            closure_work: false,
            requested_at: 0,
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
        assert_eq!(job.loop_id().as_deref(), Some("L1"));
        assert_eq!(job.priority(), 2);
    }
}
