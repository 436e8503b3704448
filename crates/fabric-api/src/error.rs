// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Structured API failures: `{error, reason, details?}` with machine-stable
//! reason codes and an HTTP-equivalent status for transport shells.

use fabric_daemon::JobError;
use fabric_kernel::KernelError;
use fabric_law::LawError;
use fabric_store::StoreError;
use fabric_sync::SyncError;
use fabric_timeline::TimelineError;
use fabric_work::WorkError;
use serde::Serialize;
use serde_json::Value;

/// A user-visible failure.
#[derive(Debug, Clone, Serialize)]
pub struct ApiError {
    /// Coarse error kind (`validation`, `conflict`, `not_found`, …).
    pub error: String,
    /// Machine-stable reason code or human-facing reason line.
    pub reason: String,
    /// Optional structured detail.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    /// HTTP-equivalent status for transport shells.
    #[serde(skip)]
    pub status: u16,
}

impl ApiError {
    /// Builds a validation failure (400-equivalent).
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        ApiError {
            error: "validation".to_string(),
            reason: reason.into(),
            details: None,
            status: 400,
        }
    }

    /// Builds a not-found failure (404-equivalent).
    #[must_use]
    pub fn not_found(reason: impl Into<String>) -> Self {
        ApiError {
            error: "not_found".to_string(),
            reason: reason.into(),
            details: None,
            status: 404,
        }
    }

    /// Builds a conflict failure (409-equivalent).
    #[must_use]
    pub fn conflict(reason: impl Into<String>) -> Self {
        ApiError {
            error: "conflict".to_string(),
            reason: reason.into(),
            details: None,
            status: 409,
        }
    }

    /// Builds an internal failure (500-equivalent).
    #[must_use]
    pub fn internal(reason: impl Into<String>) -> Self {
        ApiError {
            error: "internal".to_string(),
            reason: reason.into(),
            details: None,
            status: 500,
        }
    }

    /// Attaches structured detail.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.error, self.reason)
    }
}

impl std::error::Error for ApiError {}

impl From<LawError> for ApiError {
    fn from(e: LawError) -> Self {
        match &e {
            LawError::AlreadyClosed { loop_id } => ApiError::conflict("already_closed")
                .with_details(serde_json::json!({ "loop_id": loop_id })),
            LawError::MissingIdentifier
            | LawError::ActionRequired
            | LawError::ReasonRequired
            | LawError::UnknownMode { .. } => ApiError::validation(e.to_string()),
            LawError::Kernel(k) => kernel_error(k),
            LawError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

impl From<WorkError> for ApiError {
    fn from(e: WorkError) -> Self {
        match &e {
            WorkError::NotFound { job_id } => ApiError::not_found("job_not_found")
                .with_details(serde_json::json!({ "job_id": job_id })),
            WorkError::InvalidWeight { .. } | WorkError::DuplicateJob { .. } => {
                ApiError::validation(e.to_string())
            }
            WorkError::Law(law) => law.clone_into_api(),
            WorkError::Store(_) => ApiError::internal(e.to_string()),
        }
    }
}

// LawError is not Clone (it wraps io errors); go through Display instead.
trait LawErrorExt {
    fn clone_into_api(&self) -> ApiError;
}

impl LawErrorExt for LawError {
    fn clone_into_api(&self) -> ApiError {
        match self {
            LawError::AlreadyClosed { loop_id } => ApiError::conflict("already_closed")
                .with_details(serde_json::json!({ "loop_id": loop_id })),
            other => ApiError::internal(other.to_string()),
        }
    }
}

fn kernel_error(e: &KernelError) -> ApiError {
    match e {
        KernelError::HashChainBroken { .. } | KernelError::VersionMismatch { .. } => {
            ApiError::conflict(e.to_string())
        }
        _ => ApiError::validation(e.to_string()),
    }
}

impl From<KernelError> for ApiError {
    fn from(e: KernelError) -> Self {
        kernel_error(&e)
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<TimelineError> for ApiError {
    fn from(e: TimelineError) -> Self {
        ApiError::internal(e.to_string())
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        ApiError::validation(e.to_string())
    }
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        match &e {
            JobError::UnknownJob { .. } => ApiError::validation(e.to_string()),
            JobError::Failed { .. } => ApiError::internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn already_closed_maps_to_409() {
        let api: ApiError = LawError::AlreadyClosed {
            loop_id: "L1".to_string(),
        }
        .into();
        assert_eq!(api.status, 409);
        assert_eq!(api.reason, "already_closed");
        assert_eq!(api.details.unwrap()["loop_id"], "L1");
    }

    #[test]
    fn serializes_without_status() {
        let api = ApiError::validation("weight must be between 1 and 10");
        let v = serde_json::to_value(&api).unwrap();
        assert_eq!(v["error"], "validation");
        assert!(v.get("status").is_none());
        assert!(v.get("details").is_none());
    }
}
