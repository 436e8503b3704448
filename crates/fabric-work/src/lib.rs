// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-work: the admission controller and its work ledger.
//!
//! A bounded job scheduler gating all state-mutating work through mode,
//! dependency, and capacity checks, with unified closure accounting on
//! completion. The ledger artifact (`work_ledger.json`) is mutated
//! exclusively by this crate.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod controller;
mod ledger;

pub use controller::{
    Admission, AdmissionController, CancelReceipt, CompleteReceipt, DenyReason, GateInputs,
    OrderingPolicy, SweepReport, WorkConfig, WorkError, WorkHistory, WorkStatus,
};
pub use ledger::{JobOutcome, JobType, WorkJob, WorkLedger, WorkRequest, WorkStats};
