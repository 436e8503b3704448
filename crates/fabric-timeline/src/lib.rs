// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-timeline: the append-only event log.
//!
//! Every notable happening — closures, mode transitions, work admissions,
//! daemon ticks, sync sessions — lands here as a `{ts, type, source,
//! subject?, payload?}` row. Writes are best-effort: a caller must never
//! fail because the timeline write did; failures degrade to a warning.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

use fabric_kernel::{utc_day_of, Clock};
use fabric_store::{read_json_artifact, write_json_artifact, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

const TIMELINE_FILE: &str = "timeline_events.json";

/// Query limit cap; larger requests are clamped.
pub const MAX_QUERY_LIMIT: usize = 100;

/// One timeline row.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TimelineEvent {
    /// Event time, millis since epoch.
    pub ts: u64,
    /// Event type tag (`closure`, `mode_transition`, `work_request`, …).
    #[serde(rename = "type")]
    pub event_type: String,
    /// Originating subsystem (`closure_engine`, `daemon`, `sync`, …).
    pub source: String,
    /// Subject id (entity, job, loop, peer), when one exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Structured payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
}

/// Query parameters for [`TimelineLogger::query`].
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct TimelineQuery {
    /// Inclusive lower bound on `ts`.
    pub from: Option<u64>,
    /// Inclusive upper bound on `ts`.
    pub to: Option<u64>,
    /// Exact event type filter.
    pub event_type: Option<String>,
    /// Exact source filter.
    pub source: Option<String>,
    /// Row cap; clamped to [`MAX_QUERY_LIMIT`].
    pub limit: Option<usize>,
}

/// Aggregates for `timeline.stats`.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct TimelineStats {
    /// Total rows.
    pub total_events: u64,
    /// Row counts by type.
    pub by_type: BTreeMap<String, u64>,
    /// Row counts by source.
    pub by_source: BTreeMap<String, u64>,
    /// Oldest row timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_ts: Option<u64>,
    /// Newest row timestamp.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ts: Option<u64>,
}

/// Errors from explicit timeline reads (writes never surface errors).
#[derive(Debug, thiserror::Error)]
pub enum TimelineError {
    /// Artifact failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// The timeline logger.
///
/// `record` is infallible by contract: persistence failures are logged and
/// swallowed. Reads go back to the artifact so multiple handles stay
/// consistent.
pub struct TimelineLogger {
    path: PathBuf,
    clock: Arc<dyn Clock>,
}

impl TimelineLogger {
    /// Creates a logger persisting under `data_dir`.
    pub fn new(clock: Arc<dyn Clock>, data_dir: impl Into<PathBuf>) -> Self {
        TimelineLogger {
            path: data_dir.into().join(TIMELINE_FILE),
            clock,
        }
    }

    /// Appends an event. Best-effort: failures degrade to a warning.
    pub fn record(
        &self,
        event_type: &str,
        source: &str,
        subject: Option<&str>,
        payload: Option<Value>,
    ) {
        let event = TimelineEvent {
            ts: self.clock.now_ms(),
            event_type: event_type.to_string(),
            source: source.to_string(),
            subject: subject.map(str::to_string),
            payload,
        };
        if let Err(e) = self.append(&event) {
            warn!(error = %e, event_type, "timeline write failed; event dropped");
        }
    }

    fn append(&self, event: &TimelineEvent) -> Result<(), TimelineError> {
        let mut events = self.load()?;
        events.push(event.clone());
        write_json_artifact(&self.path, &events)?;
        Ok(())
    }

    fn load(&self) -> Result<Vec<TimelineEvent>, TimelineError> {
        Ok(read_json_artifact(&self.path)?.unwrap_or_default())
    }

    /// Queries rows, newest last, capped at [`MAX_QUERY_LIMIT`].
    ///
    /// # Errors
    ///
    /// Returns [`TimelineError`] on artifact failure.
    pub fn query(&self, query: &TimelineQuery) -> Result<Vec<TimelineEvent>, TimelineError> {
        let limit = query.limit.unwrap_or(MAX_QUERY_LIMIT).min(MAX_QUERY_LIMIT);
        let events = self.load()?;
        let matched: Vec<TimelineEvent> = events
            .into_iter()
            .filter(|e| {
                query.from.is_none_or(|from| e.ts >= from)
                    && query.to.is_none_or(|to| e.ts <= to)
                    && query
                        .event_type
                        .as_deref()
                        .is_none_or(|t| e.event_type == t)
                    && query.source.as_deref().is_none_or(|s| e.source == s)
            })
            .collect();
        let skip = matched.len().saturating_sub(limit);
        Ok(matched.into_iter().skip(skip).collect())
    }

    /// Rows whose timestamp falls on the given UTC day (`YYYY-MM-DD`).
    ///
    /// # Errors
    ///
    /// Returns [`TimelineError`] on artifact failure.
    pub fn day(&self, day: &str) -> Result<Vec<TimelineEvent>, TimelineError> {
        Ok(self
            .load()?
            .into_iter()
            .filter(|e| utc_day_of(e.ts) == day)
            .collect())
    }

    /// Aggregate stats over the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`TimelineError`] on artifact failure.
    pub fn stats(&self) -> Result<TimelineStats, TimelineError> {
        let events = self.load()?;
        let mut stats = TimelineStats {
            total_events: events.len() as u64,
            ..TimelineStats::default()
        };
        for event in &events {
            *stats.by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            *stats.by_source.entry(event.source.clone()).or_insert(0) += 1;
        }
        stats.first_ts = events.first().map(|e| e.ts);
        stats.last_ts = events.last().map(|e| e.ts);
        Ok(stats)
    }
}
