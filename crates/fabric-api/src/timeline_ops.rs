// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `timeline.*` operations.

use crate::{ApiError, KernelContext};
use fabric_timeline::TimelineQuery;
use serde_json::{json, Value};

impl KernelContext {
    /// `timeline.query`: filtered event rows, newest last, limit ≤ 100.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on artifact failure.
    pub fn timeline_query(&self, query: &TimelineQuery) -> Result<Value, ApiError> {
        let inner = self.lane();
        let events = inner.timeline.query(query)?;
        Ok(json!(events))
    }

    /// `timeline.stats`: aggregates over the whole log.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on artifact failure.
    pub fn timeline_stats(&self) -> Result<Value, ApiError> {
        let inner = self.lane();
        let stats = inner.timeline.stats()?;
        serde_json::to_value(&stats).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `timeline.day`: rows for one UTC day (`YYYY-MM-DD`).
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed dates.
    pub fn timeline_day(&self, day: &str) -> Result<Value, ApiError> {
        if day.len() != 10 || !day.bytes().enumerate().all(|(i, b)| match i {
            4 | 7 => b == b'-',
            _ => b.is_ascii_digit(),
        }) {
            return Err(ApiError::validation("day must be YYYY-MM-DD"));
        }
        let inner = self.lane();
        let events = inner.timeline.day(day)?;
        Ok(json!(events))
    }
}
