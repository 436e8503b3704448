// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The closures registry and the physical loop files.
//!
//! The registry (`closures.json`) is the authority on what has been closed;
//! loop records carry only opaque `loop_id` strings that dereference into it
//! at query time. The loops files (`loops_latest.json` / `loops_closed.json`)
//! are a best-effort physical mirror — the ledger never rolls back because a
//! loop file write failed.

use serde::{Deserialize, Serialize};

/// Outcome of a closure event.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClosureOutcome {
    /// The loop was completed.
    Closed,
    /// The loop was abandoned into the archive.
    Archived,
}

impl ClosureOutcome {
    /// The lowercase tag used in artifacts.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ClosureOutcome::Closed => "closed",
            ClosureOutcome::Archived => "archived",
        }
    }
}

/// One row of the closures ledger.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ClosureRecord {
    /// Closure time, millis since epoch.
    pub ts: u64,
    /// Loop this closure retired, when one was named.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_id: Option<String>,
    /// Human title, when provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Closed or archived.
    pub outcome: ClosureOutcome,
    /// Originating source (`user`, `ai`, `system`, `daemon`, …).
    pub source: String,
}

/// Aggregate stats carried beside the ledger rows.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize, Deserialize)]
pub struct RegistryStats {
    /// All-time closure count.
    pub total_closures: u64,
    /// Closures on the current UTC day.
    pub closures_today: u64,
    /// Timestamp of the most recent closure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_closure_at: Option<u64>,
    /// Current streak, days.
    pub streak_days: u64,
    /// UTC day (`YYYY-MM-DD`) of the last streak increment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_streak_date: Option<String>,
    /// Best streak ever reached.
    pub best_streak: u64,
}

/// The durable `closures.json` artifact.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub struct ClosuresRegistry {
    /// Ledger rows, append order.
    #[serde(default)]
    pub closures: Vec<ClosureRecord>,
    /// Aggregates.
    #[serde(default)]
    pub stats: RegistryStats,
}

impl ClosuresRegistry {
    /// Returns `true` when a successful closure already exists for `loop_id`.
    #[must_use]
    pub fn contains_loop(&self, loop_id: &str) -> bool {
        self.closures
            .iter()
            .any(|c| c.loop_id.as_deref() == Some(loop_id))
    }

    /// Counts closures whose timestamp falls on the given UTC day.
    #[must_use]
    pub fn closures_on_day(&self, day: &str) -> u64 {
        self.closures
            .iter()
            .filter(|c| fabric_kernel::utc_day_of(c.ts) == day)
            .count() as u64
    }
}

/// An open (or closed) loop record in the physical loop files.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct LoopRecord {
    /// Opaque loop id; dereferences into the registry.
    pub loop_id: String,
    /// Human title.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// When the loop was opened, millis since epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<u64>,
    /// When the loop was closed, millis since epoch. Absent while open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_loop_matches_only_named_rows() {
        let reg = ClosuresRegistry {
            closures: vec![
                ClosureRecord {
                    ts: 1,
                    loop_id: Some("L1".to_string()),
                    title: None,
                    outcome: ClosureOutcome::Closed,
                    source: "user".to_string(),
                },
                ClosureRecord {
                    ts: 2,
                    loop_id: None,
                    title: Some("untracked".to_string()),
                    outcome: ClosureOutcome::Closed,
                    source: "user".to_string(),
                },
            ],
            stats: RegistryStats::default(),
        };
        assert!(reg.contains_loop("L1"));
        assert!(!reg.contains_loop("L2"));
    }

    #[test]
    fn closures_on_day_buckets_by_utc_date() {
        let reg = ClosuresRegistry {
            closures: vec![
                ClosureRecord {
                    ts: 1_700_000_000_000, // 2023-11-14
                    loop_id: None,
                    title: None,
                    outcome: ClosureOutcome::Closed,
                    source: "user".to_string(),
                },
                ClosureRecord {
                    ts: 1_700_086_400_000, // 2023-11-15
                    loop_id: None,
                    title: None,
                    outcome: ClosureOutcome::Archived,
                    source: "user".to_string(),
                },
            ],
            stats: RegistryStats::default(),
        };
        assert_eq!(reg.closures_on_day("2023-11-14"), 1);
        assert_eq!(reg.closures_on_day("2023-11-15"), 1);
        assert_eq!(reg.closures_on_day("2023-11-16"), 0);
    }
}
