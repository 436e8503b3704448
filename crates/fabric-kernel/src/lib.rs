// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! fabric-kernel: typed entities, hash-chained leaf-patch deltas, Law Genesis.
//!
//! The kernel owns the fabric's datamodel and its two hard invariants:
//!
//! - **Hash chain**: a delta's `prev_hash` must equal the entity's state hash
//!   immediately before apply, and after apply the entity's state hash equals
//!   the delta's `new_hash` — which is `SHA256(canonical(new_state))`.
//! - **Leaf patches only**: no patch may target a populated composite subtree
//!   of the current state. Missing ancestor containers are materialized inside
//!   the applying delta (the Law Genesis rule), so sub-systems may write
//!   `/enforcement/violations_count` without a prior subtree-create delta.
//!
//! Entities are never destroyed; logical archival is a state field. Deltas are
//! immutable once accepted and strictly increase `version` by one.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod apply;
mod delta;
mod entity;
mod pointer;
mod ports;
mod schema;

pub use apply::{
    apply_delta, apply_patches, genesis_patches, verify_hash_chain, ChainCheck, Committed, Kernel,
    KernelError,
};
pub use delta::{Delta, PatchKind, PatchOp};
pub use entity::{Entity, EntityType, Mode};
pub use fabric_canonical::StateHash;
pub use pointer::{Pointer, PointerError};
pub use apply::materialize_from_genesis;
pub use ports::{
    utc_day_of, Clock, FixedClock, IdSource, RandomIds, SequentialIds, Signer, SystemClock,
    Verifier,
};
pub use schema::{validate_state, SchemaError};
