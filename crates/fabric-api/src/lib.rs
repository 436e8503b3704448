// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-api: the transport-agnostic operation surface.
//!
//! [`KernelContext`] wires the whole engine together — store, closure
//! engine, admission controller, timeline, sync endpoint — behind one
//! explicit handle. There is no ambient authority: embedders construct the
//! context, pass it around, and expose its operations over whatever
//! transport they choose (HTTP, in-proc calls, CLI).
//!
//! All mutation serializes through the context's **commit lane** (one
//! in-process mutex over the durable subsystems); reads snapshot under the
//! same lane and stream consumers receive [`StateEvent`]s after each
//! commit.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod error;
mod events;
mod jobs;
mod law_ops;
mod sync_ops;
mod tasks;
mod timeline_ops;
mod unified;
mod work_ops;

pub use error::ApiError;
pub use events::StateEvent;
pub use law_ops::CloseLoopInput;
pub use tasks::{TaskInput, TaskUpdate};
pub use unified::StatePut;
pub use work_ops::CompleteInput;

use fabric_daemon::{Daemon, JobHandler};
use fabric_kernel::{Clock, IdSource, Kernel, RandomIds, SystemClock};
use fabric_law::ClosureEngine;
use fabric_store::FsStore;
use fabric_sync::{SessionConfig, SyncEndpoint, SyncSession, WatermarkStore};
use fabric_timeline::TimelineLogger;
use fabric_work::{AdmissionController, WorkConfig};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use tokio::sync::broadcast;
use tracing::info;

/// Environment variable locating the durable artifacts.
pub const DATA_DIR_ENV: &str = "DELTA_DATA_DIR";

/// Default data directory when the environment does not say otherwise.
pub const DEFAULT_DATA_DIR: &str = ".delta-fabric";

/// Context construction parameters.
#[derive(Clone, Debug)]
pub struct FabricConfig {
    /// Directory holding every durable artifact.
    pub data_dir: PathBuf,
    /// This node's sync identity.
    pub node_id: String,
    /// Admission controller tuning.
    pub work: WorkConfig,
    /// Sync session tuning.
    pub sync: SessionConfig,
}

impl FabricConfig {
    /// Builds a config rooted at `data_dir` with defaults elsewhere.
    #[must_use]
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        FabricConfig {
            data_dir: data_dir.into(),
            node_id: IdSource::mint(&RandomIds, "node"),
            work: WorkConfig::default(),
            sync: SessionConfig::default(),
        }
    }

    /// Builds a config from `DELTA_DATA_DIR` (default `.delta-fabric/`).
    #[must_use]
    pub fn from_env() -> Self {
        let dir = std::env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
        FabricConfig::new(dir)
    }
}

pub(crate) struct Inner {
    pub(crate) store: FsStore,
    pub(crate) law: ClosureEngine,
    pub(crate) work: AdmissionController,
    pub(crate) timeline: TimelineLogger,
    pub(crate) watermarks: WatermarkStore,
    pub(crate) sessions: BTreeMap<String, SyncSession>,
}

/// The engine behind every operation.
///
/// Construction is explicit and teardown is `Drop`; nothing global. Clone
/// the surrounding `Arc` to share.
pub struct KernelContext {
    pub(crate) kernel: Kernel,
    node_id: String,
    pub(crate) inner: Mutex<Inner>,
    pub(crate) events: broadcast::Sender<StateEvent>,
    pub(crate) sync: SyncEndpoint,
    daemon: OnceLock<Daemon>,
}

impl KernelContext {
    /// Opens a context with the system clock and random ids.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the store fails to open or recover.
    pub fn open(config: FabricConfig) -> Result<Arc<Self>, ApiError> {
        Self::open_with_ports(config, Arc::new(SystemClock), Arc::new(RandomIds))
    }

    /// Opens a context with explicit clock/id ports (tests freeze time this
    /// way).
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when the store fails to open or recover.
    pub fn open_with_ports(
        config: FabricConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Result<Arc<Self>, ApiError> {
        let kernel = Kernel::new(Arc::clone(&clock), ids);
        let store = FsStore::open(&config.data_dir)?;
        let law = ClosureEngine::new(kernel.clone(), &config.data_dir);
        let work = AdmissionController::new(kernel.clone(), &config.data_dir, config.work);
        let timeline = TimelineLogger::new(clock, &config.data_dir);
        let watermarks = WatermarkStore::open(&config.data_dir)?;
        let (events, _) = broadcast::channel(256);
        info!(data_dir = %config.data_dir.display(), node_id = %config.node_id, "fabric context open");
        Ok(Arc::new(KernelContext {
            kernel,
            node_id: config.node_id.clone(),
            inner: Mutex::new(Inner {
                store,
                law,
                work,
                timeline,
                watermarks,
                sessions: BTreeMap::new(),
            }),
            events,
            sync: SyncEndpoint::new(config.node_id, config.sync),
            daemon: OnceLock::new(),
        }))
    }

    /// This node's sync identity.
    #[must_use]
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The commit lane: one guard at a time, writers and consistent readers
    /// both pass through here.
    pub(crate) fn lane(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Subscribes to the event stream (`state.stream`).
    ///
    /// Receivers get `unified_state` and `delta_created` events as they
    /// occur; a lagging receiver drops oldest events rather than blocking
    /// commits.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: StateEvent) {
        // No receivers is fine; streams are optional.
        let _ = self.events.send(event);
    }

    /// `health`: liveness and version.
    #[must_use]
    pub fn health(&self) -> Value {
        json!({
            "ok": true,
            "ts": self.kernel.clock().now_ms(),
            "version": env!("CARGO_PKG_VERSION"),
        })
    }

    /// Attaches the governance daemon handle so `daemon.*` operations can
    /// reach it. Called once at wiring time; later calls are ignored.
    pub fn attach_daemon(&self, daemon: Daemon) {
        let _ = self.daemon.set(daemon);
    }

    /// `daemon.status`: job history and liveness.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] when no daemon is attached.
    pub fn daemon_status(&self) -> Result<Value, ApiError> {
        let daemon = self
            .daemon
            .get()
            .ok_or_else(|| ApiError::internal("daemon not attached"))?;
        serde_json::to_value(daemon.status()).map_err(|e| ApiError::internal(e.to_string()))
    }

    /// `daemon.run`: force one of the manual jobs.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] for unknown jobs or job failure.
    pub fn daemon_run(&self, job: &str) -> Result<Value, ApiError> {
        let daemon = self
            .daemon
            .get()
            .ok_or_else(|| ApiError::internal("daemon not attached"))?;
        Ok(daemon.run_now(job)?)
    }
}

/// Appends a delta and then the entity snapshot — log first, always.
pub(crate) fn commit_to(
    inner: &mut Inner,
    committed: &fabric_kernel::Committed,
) -> Result<(), ApiError> {
    use fabric_store::Store;
    inner.store.append_delta(&committed.delta)?;
    inner.store.save_entity(&fabric_store::EntityRecord {
        entity: committed.entity.clone(),
        state: committed.state.clone(),
    })?;
    Ok(())
}

/// Builds the governance daemon over a context.
///
/// The daemon dispatches its jobs back into the context's commit lane; call
/// [`KernelContext::attach_daemon`] with the result, then
/// [`Daemon::spawn_all`] on a runtime.
#[must_use]
pub fn governance_daemon(context: &Arc<KernelContext>) -> Daemon {
    let handler: Arc<dyn JobHandler> = Arc::new(jobs::GovernanceJobs {
        context: Arc::clone(context),
    });
    Daemon::new(handler)
}
