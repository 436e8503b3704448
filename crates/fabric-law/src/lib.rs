// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-law: the mode router and the closure engine.
//!
//! Two tightly coupled pieces:
//!
//! - [`compute_mode`] is a pure function from signals to an operational mode
//!   (overrides → closure-ratio LUT → progression ladder). It never mutates
//!   state.
//! - [`ClosureEngine`] turns closure events into single atomic deltas against
//!   `system_state`, keeps the closures registry, and runs the daily
//!   governance sweeps (day start, day end, mode recalc).
//!
//! The registry is the authority on closed loops; the loops files are a
//! best-effort physical mirror.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod closure;
mod mode;
mod ops;
mod registry;

pub use closure::{
    ClosureEngine, ClosureMetrics, ClosureReceipt, ClosureRequest, DayEndReport, LawError,
    ModeRecalc, PhysicalClosure, StreakSnapshot,
};
pub use mode::{compute_mode, ModeDecision, ModeSignals};
pub use ops::{
    AcknowledgeReceipt, IngestReceipt, OverrideReceipt, PutSignals, RefreshReceipt,
    ViolationReceipt,
};
pub use registry::{ClosureOutcome, ClosureRecord, ClosuresRegistry, LoopRecord, RegistryStats};
