// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-daemon: the governance scheduler.
//!
//! Six independent, idempotent jobs fire on wall-clock schedules:
//!
//! | job | schedule |
//! |-----|----------|
//! | heartbeat | every 5 min |
//! | refresh | top of every hour |
//! | day_start | 06:00 local |
//! | day_end | 22:00 local |
//! | mode_recalc | every 15 min |
//! | work_queue_sweep | every 1 min |
//!
//! Jobs run one-at-a-time per name: a tick that lands while the previous run
//! is still going is skipped with a warning, never executed concurrently.
//! The daemon knows nothing about what jobs do — embedders supply a
//! [`JobHandler`] and the daemon supplies timing, overrun protection, and
//! run history.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

use chrono::{DateTime, Duration as ChronoDuration, Local, TimeZone, Timelike};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, warn};

/// The fixed set of governance jobs.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobName {
    /// Liveness marker.
    Heartbeat,
    /// Upstream cognitive refresh.
    Refresh,
    /// Daily counter reset.
    DayStart,
    /// Streak sweep.
    DayEnd,
    /// Mode recomputation.
    ModeRecalc,
    /// Queue advance + job timeouts.
    WorkQueueSweep,
}

impl JobName {
    /// Every job, in schedule-table order.
    pub const ALL: [JobName; 6] = [
        JobName::Heartbeat,
        JobName::Refresh,
        JobName::DayStart,
        JobName::DayEnd,
        JobName::ModeRecalc,
        JobName::WorkQueueSweep,
    ];

    /// The snake_case tag used in status payloads and `daemon.run`.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            JobName::Heartbeat => "heartbeat",
            JobName::Refresh => "refresh",
            JobName::DayStart => "day_start",
            JobName::DayEnd => "day_end",
            JobName::ModeRecalc => "mode_recalc",
            JobName::WorkQueueSweep => "work_queue_sweep",
        }
    }

    /// Parses the snake_case tag.
    #[must_use]
    pub fn parse(tag: &str) -> Option<JobName> {
        JobName::ALL.into_iter().find(|j| j.as_str() == tag)
    }

    /// The job's wall-clock schedule.
    #[must_use]
    pub fn schedule(self) -> Schedule {
        match self {
            JobName::Heartbeat => Schedule::Every(Duration::from_secs(300)),
            JobName::Refresh => Schedule::Hourly { minute: 0 },
            JobName::DayStart => Schedule::DailyAt { hour: 6, minute: 0 },
            JobName::DayEnd => Schedule::DailyAt {
                hour: 22,
                minute: 0,
            },
            JobName::ModeRecalc => Schedule::Every(Duration::from_secs(900)),
            JobName::WorkQueueSweep => Schedule::Every(Duration::from_secs(60)),
        }
    }
}

impl std::fmt::Display for JobName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// When a job fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Schedule {
    /// Fixed interval from the previous fire.
    Every(Duration),
    /// Once per hour at the given minute.
    Hourly {
        /// Minute within the hour.
        minute: u32,
    },
    /// Once per day at the given local time.
    DailyAt {
        /// Hour of day, local.
        hour: u32,
        /// Minute within the hour.
        minute: u32,
    },
}

impl Schedule {
    /// The next fire time strictly after `now`.
    #[must_use]
    pub fn next_fire_after(&self, now: DateTime<Local>) -> DateTime<Local> {
        match *self {
            Schedule::Every(d) => {
                now + ChronoDuration::from_std(d).unwrap_or_else(|_| ChronoDuration::seconds(60))
            }
            Schedule::Hourly { minute } => {
                let base = now
                    .with_minute(minute)
                    .and_then(|t| t.with_second(0))
                    .and_then(|t| t.with_nanosecond(0));
                match base {
                    Some(base) if base > now => base,
                    Some(base) => base + ChronoDuration::hours(1),
                    None => now + ChronoDuration::hours(1),
                }
            }
            Schedule::DailyAt { hour, minute } => {
                let mut date = now.date_naive();
                for _ in 0..3 {
                    if let Some(naive) = date.and_hms_opt(hour, minute, 0) {
                        if let Some(dt) = Local.from_local_datetime(&naive).earliest() {
                            if dt > now {
                                return dt;
                            }
                        }
                    }
                    match date.succ_opt() {
                        Some(next) => date = next,
                        None => break,
                    }
                }
                now + ChronoDuration::days(1)
            }
        }
    }
}

/// Errors from job execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobError {
    /// `daemon.run` named a job outside the manual set.
    #[error("unknown job {name:?}")]
    UnknownJob {
        /// The unrecognized tag.
        name: String,
    },
    /// The handler reported a failure.
    #[error("job failed: {detail}")]
    Failed {
        /// Handler-supplied failure detail.
        detail: String,
    },
}

/// What the daemon calls to actually do the work.
///
/// Implementations are synchronous; the daemon dispatches them off the async
/// runtime. Jobs that emit deltas go through the embedder's commit lane
/// inside `run`.
pub trait JobHandler: Send + Sync + 'static {
    /// Executes one job, returning a structured result payload.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::Failed`] with detail on failure.
    fn run(&self, job: JobName) -> Result<Value, JobError>;
}

/// Per-job run history.
#[derive(Clone, PartialEq, Eq, Debug, Default, Serialize)]
pub struct JobHistory {
    /// Completed runs.
    pub runs: u64,
    /// Ticks skipped because the previous run was still going.
    pub skips: u64,
    /// Failures.
    pub failures: u64,
    /// Start of the most recent run, millis since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_started_at: Option<u64>,
    /// End of the most recent run, millis since epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_finished_at: Option<u64>,
    /// Whether the most recent run succeeded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_ok: Option<bool>,
    /// Error detail from the most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Snapshot for `daemon.status`.
#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
pub struct DaemonStatus {
    /// When the daemon was constructed, millis since epoch.
    pub started_at: u64,
    /// History per job tag.
    pub jobs: BTreeMap<String, JobHistory>,
}

struct DaemonInner {
    handler: Arc<dyn JobHandler>,
    history: Mutex<BTreeMap<JobName, JobHistory>>,
    locks: BTreeMap<JobName, tokio::sync::Mutex<()>>,
    started_at: u64,
}

/// The governance daemon. Cheap to clone; all clones share history.
#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl Daemon {
    /// Creates a daemon over the given handler.
    #[must_use]
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        let locks = JobName::ALL
            .into_iter()
            .map(|j| (j, tokio::sync::Mutex::new(())))
            .collect();
        Daemon {
            inner: Arc::new(DaemonInner {
                handler,
                history: Mutex::new(BTreeMap::new()),
                locks,
                started_at: now_ms(),
            }),
        }
    }

    /// Spawns one scheduling task per job on the current runtime.
    ///
    /// The returned handles run until aborted; dropping them detaches the
    /// loops (they keep running), matching the daemon's fire-and-forget
    /// contract.
    pub fn spawn_all(&self) -> Vec<tokio::task::JoinHandle<()>> {
        JobName::ALL
            .into_iter()
            .map(|job| {
                let daemon = self.clone();
                tokio::spawn(async move {
                    loop {
                        let next = job.schedule().next_fire_after(Local::now());
                        let wait = (next - Local::now())
                            .to_std()
                            .unwrap_or(Duration::from_secs(1));
                        tokio::time::sleep(wait).await;
                        daemon.tick(job).await;
                    }
                })
            })
            .collect()
    }

    /// One guarded execution: runs the job unless its previous run is still
    /// going, in which case the tick is dropped with a warning.
    pub async fn tick(&self, job: JobName) {
        let Some(lock) = self.inner.locks.get(&job) else {
            return;
        };
        let Ok(_guard) = lock.try_lock() else {
            warn!(job = %job, "previous run still active; skipping tick");
            self.with_history(job, |h| h.skips += 1);
            return;
        };
        let started = now_ms();
        self.with_history(job, |h| h.last_started_at = Some(started));
        let handler = Arc::clone(&self.inner.handler);
        let outcome = tokio::task::spawn_blocking(move || handler.run(job)).await;
        let finished = now_ms();
        match outcome {
            Ok(Ok(_)) => {
                debug!(job = %job, "job completed");
                self.with_history(job, |h| {
                    h.runs += 1;
                    h.last_finished_at = Some(finished);
                    h.last_ok = Some(true);
                    h.last_error = None;
                });
            }
            Ok(Err(e)) => {
                error!(job = %job, error = %e, "job failed");
                self.with_history(job, |h| {
                    h.runs += 1;
                    h.failures += 1;
                    h.last_finished_at = Some(finished);
                    h.last_ok = Some(false);
                    h.last_error = Some(e.to_string());
                });
            }
            Err(join_err) => {
                error!(job = %job, error = %join_err, "job panicked");
                self.with_history(job, |h| {
                    h.failures += 1;
                    h.last_finished_at = Some(finished);
                    h.last_ok = Some(false);
                    h.last_error = Some(join_err.to_string());
                });
            }
        }
    }

    /// Runs a job immediately on the caller's thread (`daemon.run`).
    ///
    /// Only the manual set ({heartbeat, refresh, day_start, day_end}) is
    /// accepted; recalc and sweep belong to their schedules.
    ///
    /// # Errors
    ///
    /// Returns [`JobError::UnknownJob`] for tags outside the manual set and
    /// the handler's error otherwise.
    pub fn run_now(&self, tag: &str) -> Result<Value, JobError> {
        let job = JobName::parse(tag).ok_or_else(|| JobError::UnknownJob {
            name: tag.to_string(),
        })?;
        if !matches!(
            job,
            JobName::Heartbeat | JobName::Refresh | JobName::DayStart | JobName::DayEnd
        ) {
            return Err(JobError::UnknownJob {
                name: tag.to_string(),
            });
        }
        let started = now_ms();
        self.with_history(job, |h| h.last_started_at = Some(started));
        let result = self.inner.handler.run(job);
        let finished = now_ms();
        match &result {
            Ok(_) => self.with_history(job, |h| {
                h.runs += 1;
                h.last_finished_at = Some(finished);
                h.last_ok = Some(true);
                h.last_error = None;
            }),
            Err(e) => {
                let detail = e.to_string();
                self.with_history(job, |h| {
                    h.runs += 1;
                    h.failures += 1;
                    h.last_finished_at = Some(finished);
                    h.last_ok = Some(false);
                    h.last_error = Some(detail.clone());
                });
            }
        }
        result
    }

    /// Run history and liveness snapshot.
    #[must_use]
    pub fn status(&self) -> DaemonStatus {
        let history = self
            .inner
            .history
            .lock()
            .map(|h| h.clone())
            .unwrap_or_default();
        DaemonStatus {
            started_at: self.inner.started_at,
            jobs: history
                .into_iter()
                .map(|(job, h)| (job.as_str().to_string(), h))
                .collect(),
        }
    }

    fn with_history(&self, job: JobName, f: impl FnOnce(&mut JobHistory)) {
        if let Ok(mut history) = self.inner.history.lock() {
            f(history.entry(job).or_default());
        }
    }
}

fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn local(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Local> {
        let naive = NaiveDate::from_ymd_opt(y, mo, d)
            .unwrap()
            .and_hms_opt(h, mi, 0)
            .unwrap();
        Local.from_local_datetime(&naive).earliest().unwrap()
    }

    #[test]
    fn hourly_fires_at_top_of_next_hour() {
        let s = Schedule::Hourly { minute: 0 };
        let next = s.next_fire_after(local(2024, 3, 1, 10, 25));
        assert_eq!(next, local(2024, 3, 1, 11, 0));
        let next = s.next_fire_after(local(2024, 3, 1, 10, 0));
        assert_eq!(next, local(2024, 3, 1, 11, 0));
    }

    #[test]
    fn daily_fires_today_or_tomorrow() {
        let s = Schedule::DailyAt { hour: 6, minute: 0 };
        let next = s.next_fire_after(local(2024, 3, 1, 4, 0));
        assert_eq!(next, local(2024, 3, 1, 6, 0));
        let next = s.next_fire_after(local(2024, 3, 1, 7, 0));
        assert_eq!(next, local(2024, 3, 2, 6, 0));
    }

    #[test]
    fn every_adds_the_interval() {
        let s = Schedule::Every(Duration::from_secs(300));
        let now = local(2024, 3, 1, 10, 0);
        assert_eq!(s.next_fire_after(now), now + ChronoDuration::seconds(300));
    }

    struct Counting {
        runs: AtomicU64,
        block_ms: u64,
    }

    impl JobHandler for Counting {
        fn run(&self, _job: JobName) -> Result<Value, JobError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.block_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.block_ms));
            }
            Ok(Value::Null)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_ticks_are_skipped_not_queued() {
        let handler = Arc::new(Counting {
            runs: AtomicU64::new(0),
            block_ms: 200,
        });
        let daemon = Daemon::new(Arc::clone(&handler) as Arc<dyn JobHandler>);

        let d2 = daemon.clone();
        let slow = tokio::spawn(async move { d2.tick(JobName::Heartbeat).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        daemon.tick(JobName::Heartbeat).await;
        slow.await.unwrap();

        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
        let status = daemon.status();
        let history = status.jobs.get("heartbeat").unwrap();
        assert_eq!(history.skips, 1);
        assert_eq!(history.runs, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_now_accepts_only_the_manual_set() {
        let handler = Arc::new(Counting {
            runs: AtomicU64::new(0),
            block_ms: 0,
        });
        let daemon = Daemon::new(Arc::clone(&handler) as Arc<dyn JobHandler>);
        daemon.run_now("heartbeat").unwrap();
        assert!(matches!(
            daemon.run_now("mode_recalc"),
            Err(JobError::UnknownJob { .. })
        ));
        assert!(matches!(
            daemon.run_now("nonsense"),
            Err(JobError::UnknownJob { .. })
        ));
        assert_eq!(handler.runs.load(Ordering::SeqCst), 1);
    }
}
