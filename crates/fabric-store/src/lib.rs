// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Durable store for Delta Fabric: entity snapshots plus the append-only
//! delta log.
//!
//! Two artifacts per namespace: an **entities** map (latest `(entity, state)`
//! per id) and a **deltas** append log. The log is the authority — writes
//! land the delta first, then the snapshot, and on open a snapshot that is
//! absent or whose head mismatches the log is rebuilt by replay.
//!
//! [`MemoryStore`] backs tests and embedders that persist elsewhere;
//! [`FsStore`] persists JSON artifacts under a data directory.
//!
//! # Absence Semantics
//!
//! `load_entity` returns `None` for unknown ids — this is not an error. A
//! fabric node routinely asks about entities it has not yet synced. Error
//! variants are reserved for I/O and integrity failures.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]

mod artifact;
mod fs;

pub use artifact::{read_json_artifact, write_json_artifact};
pub use fs::FsStore;

use fabric_kernel::{Delta, Entity, EntityType, KernelError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A persisted `(entity, state)` pair.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct EntityRecord {
    /// The entity header.
    pub entity: Entity,
    /// Its current state.
    pub state: Value,
}

/// Errors from store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying filesystem failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Artifact failed to serialize/deserialize.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Replay of the delta log failed; the log itself is inconsistent.
    #[error("[LOG_CORRUPT] replay failed for {entity_id:?}: {source}")]
    LogCorrupt {
        /// Entity whose chain failed to replay.
        entity_id: String,
        /// The kernel error encountered during replay.
        source: KernelError,
    },
    /// A delta arrived out of order for its entity.
    #[error("[APPEND_ORDER] delta {delta_id:?} does not extend {entity_id:?}")]
    AppendOrder {
        /// The rejected delta.
        delta_id: String,
        /// Its entity.
        entity_id: String,
    },
}

/// Storage port: persist and load entities and deltas.
///
/// Mutating methods take `&mut self`; the commit lane above serializes
/// writers, so implementations need no interior locking.
pub trait Store: Send {
    /// Persists the latest `(entity, state)` snapshot.
    fn save_entity(&mut self, record: &EntityRecord) -> Result<(), StoreError>;

    /// Loads the latest snapshot for an id. `None` when unknown.
    fn load_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>, StoreError>;

    /// Loads every snapshot, ordered by entity id.
    fn load_entities(&self) -> Result<Vec<EntityRecord>, StoreError>;

    /// Loads every snapshot of one type, ordered by entity id.
    fn load_entities_by_type(&self, ty: EntityType) -> Result<Vec<EntityRecord>, StoreError>;

    /// Appends one delta to the log.
    fn append_delta(&mut self, delta: &Delta) -> Result<(), StoreError>;

    /// Appends a batch of deltas to the log in order.
    fn append_deltas(&mut self, deltas: &[Delta]) -> Result<(), StoreError> {
        for delta in deltas {
            self.append_delta(delta)?;
        }
        Ok(())
    }

    /// Loads the full delta log, in append order.
    fn load_deltas(&self) -> Result<Vec<Delta>, StoreError>;

    /// Loads one entity's deltas, in chain order.
    fn load_deltas_for_entity(&self, entity_id: &str) -> Result<Vec<Delta>, StoreError>;
}

/// In-memory store tier.
///
/// Snapshot ordering is deterministic (`BTreeMap` by id); the log preserves
/// append order.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entities: BTreeMap<String, EntityRecord>,
    deltas: Vec<Delta>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

impl Store for MemoryStore {
    fn save_entity(&mut self, record: &EntityRecord) -> Result<(), StoreError> {
        self.entities
            .insert(record.entity.entity_id.clone(), record.clone());
        Ok(())
    }

    fn load_entity(&self, entity_id: &str) -> Result<Option<EntityRecord>, StoreError> {
        Ok(self.entities.get(entity_id).cloned())
    }

    fn load_entities(&self) -> Result<Vec<EntityRecord>, StoreError> {
        Ok(self.entities.values().cloned().collect())
    }

    fn load_entities_by_type(&self, ty: EntityType) -> Result<Vec<EntityRecord>, StoreError> {
        Ok(self
            .entities
            .values()
            .filter(|r| r.entity.entity_type == ty)
            .cloned()
            .collect())
    }

    fn append_delta(&mut self, delta: &Delta) -> Result<(), StoreError> {
        self.deltas.push(delta.clone());
        Ok(())
    }

    fn load_deltas(&self) -> Result<Vec<Delta>, StoreError> {
        Ok(self.deltas.clone())
    }

    fn load_deltas_for_entity(&self, entity_id: &str) -> Result<Vec<Delta>, StoreError> {
        Ok(self
            .deltas
            .iter()
            .filter(|d| d.entity_id == entity_id)
            .cloned()
            .collect())
    }
}

/// Rebuilds entity snapshots by replaying a delta log from genesis.
///
/// Used on open when snapshots are absent or their heads mismatch the log.
/// Replay is branch-aware: a delta whose `prev_hash` matches an *earlier*
/// head of its entity (not the latest) forks from that point — this is how
/// sync conflict resolution lands a winning branch beside a superseded one.
/// The entity's snapshot is always the result of the last delta applied.
///
/// # Errors
///
/// Returns [`StoreError::LogCorrupt`] when a delta links to no known head of
/// its entity — the log itself is then inconsistent, which local commits
/// must never produce.
pub fn replay_log(deltas: &[Delta]) -> Result<BTreeMap<String, EntityRecord>, StoreError> {
    // Every head each entity has ever reached, by state hash.
    let mut seen: BTreeMap<String, BTreeMap<fabric_canonical::StateHash, EntityRecord>> =
        BTreeMap::new();
    let mut out: BTreeMap<String, EntityRecord> = BTreeMap::new();
    for delta in deltas {
        let parent = seen
            .get(&delta.entity_id)
            .and_then(|heads| heads.get(&delta.prev_hash).cloned());
        let next = match parent {
            None if delta.is_genesis() && !seen.contains_key(&delta.entity_id) => {
                let (entity, state) = fabric_kernel::materialize_from_genesis(delta)
                    .map_err(|source| StoreError::LogCorrupt {
                        entity_id: delta.entity_id.clone(),
                        source,
                    })?;
                EntityRecord { entity, state }
            }
            None => {
                return Err(StoreError::LogCorrupt {
                    entity_id: delta.entity_id.clone(),
                    source: fabric_kernel::KernelError::HashChainBroken {
                        expected: out
                            .get(&delta.entity_id)
                            .map_or(fabric_canonical::StateHash::ZERO, |r| {
                                r.entity.state_hash
                            }),
                        found: delta.prev_hash,
                    },
                })
            }
            Some(current) => {
                let (entity, state) =
                    fabric_kernel::apply_delta(&current.entity, &current.state, delta).map_err(
                        |source| StoreError::LogCorrupt {
                            entity_id: delta.entity_id.clone(),
                            source,
                        },
                    )?;
                EntityRecord { entity, state }
            }
        };
        seen.entry(delta.entity_id.clone())
            .or_default()
            .insert(next.entity.state_hash, next.clone());
        out.insert(delta.entity_id.clone(), next);
    }
    Ok(out)
}
