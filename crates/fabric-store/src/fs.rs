// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Filesystem store tier.
//!
//! Persists `entities.json` (array of `[entity_id, {entity, state}]` pairs)
//! and `deltas.json` (append-only array of deltas) under a data directory.
//! Write ordering is delta-first: the log lands before the snapshot, so a
//! crash between the two leaves a snapshot that is merely stale — open-time
//! replay repairs it from the log.

use crate::artifact::{read_json_artifact, write_json_artifact};
use crate::{replay_log, EntityRecord, Store, StoreError};
use fabric_kernel::{Delta, EntityType};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const ENTITIES_FILE: &str = "entities.json";
const DELTAS_FILE: &str = "deltas.json";

/// Filesystem-backed store.
///
/// Keeps a full in-memory image and writes artifacts whole on every mutation;
/// the delta log at this engine's scale is small and the whole-file write
/// keeps recovery trivial.
pub struct FsStore {
    dir: PathBuf,
    entities: BTreeMap<String, EntityRecord>,
    deltas: Vec<Delta>,
}

impl FsStore {
    /// Opens (or initializes) a store under `dir`.
    ///
    /// Recovery rules, in order:
    /// 1. A delta log that fails to parse is truncated to its longest intact
    ///    prefix of records; the truncated tail is logged and dropped.
    /// 2. An absent snapshot file, or any snapshot whose head hash mismatches
    ///    the log's last delta for that entity, triggers a full rebuild by
    ///    replay.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on I/O failure or when the surviving log does
    /// not replay cleanly.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;

        let deltas = load_deltas_lenient(&dir.join(DELTAS_FILE))?;
        let snapshot: Option<Vec<(String, EntityRecord)>> =
            read_json_artifact(&dir.join(ENTITIES_FILE))?;

        let entities = match snapshot {
            Some(pairs) if snapshot_matches_log(&pairs, &deltas) => pairs.into_iter().collect(),
            Some(_) => {
                warn!("entity snapshot head mismatch; rebuilding from delta log");
                replay_log(&deltas)?
            }
            None => {
                if !deltas.is_empty() {
                    debug!("no entity snapshot; rebuilding {} deltas", deltas.len());
                }
                replay_log(&deltas)?
            }
        };

        let store = FsStore {
            dir,
            entities,
            deltas,
        };
        // Persist whatever recovery produced so the next open is clean.
        store.flush_deltas()?;
        store.flush_entities()?;
        Ok(store)
    }

    /// The directory this store persists under.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn flush_entities(&self) -> Result<(), StoreError> {
        let pairs: Vec<(&String, &EntityRecord)> = self.entities.iter().collect();
        write_json_artifact(&self.dir.join(ENTITIES_FILE), &pairs)
    }

    fn flush_deltas(&self) -> Result<(), StoreError> {
        write_json_artifact(&self.dir.join(DELTAS_FILE), &self.deltas)
    }
}

impl Store for FsStore {
    fn save_entity(&mut self, record: &EntityRecord) -> Result<(), StoreError> {
        self.entities
            .insert(record.entity.entity_id.clone(), record.clone());
        self.flush_entities()
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
        self.flush_deltas()
    }

    fn append_deltas(&mut self, deltas: &[Delta]) -> Result<(), StoreError> {
        self.deltas.extend_from_slice(deltas);
        self.flush_deltas()
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

fn snapshot_matches_log(pairs: &[(String, EntityRecord)], deltas: &[Delta]) -> bool {
    let mut heads: BTreeMap<&str, &Delta> = BTreeMap::new();
    for delta in deltas {
        heads.insert(delta.entity_id.as_str(), delta);
    }
    if heads.len() != pairs.len() {
        return false;
    }
    pairs.iter().all(|(id, record)| {
        heads
            .get(id.as_str())
            .is_some_and(|head| head.new_hash == record.entity.state_hash)
    })
}

/// Loads the delta log, recovering the longest intact prefix when the file's
/// tail is corrupt.
fn load_deltas_lenient(path: &Path) -> Result<Vec<Delta>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io(e)),
    };
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_slice::<Vec<Delta>>(&bytes) {
        Ok(deltas) => Ok(deltas),
        Err(parse_err) => {
            let recovered = recover_record_prefix(&bytes);
            warn!(
                error = %parse_err,
                kept = recovered.len(),
                "delta log tail corrupt; truncating to last intact record"
            );
            Ok(recovered)
        }
    }
}

/// Scans a damaged JSON array for its longest prefix of parseable records.
///
/// Walks balanced top-level `{…}` spans (string- and escape-aware) and stops
/// at the first span that fails to parse as a [`Delta`].
fn recover_record_prefix(bytes: &[u8]) -> Vec<Delta> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    if let Some(s) = start.take() {
                        match serde_json::from_slice::<Delta>(&bytes[s..=i]) {
                            Ok(delta) => out.push(delta),
                            Err(_) => return out,
                        }
                    }
                }
            }
            _ => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_kernel::{FixedClock, Kernel, PatchOp, SequentialIds};
    use serde_json::json;
    use std::sync::Arc;

    fn kernel() -> Kernel {
        Kernel::new(
            Arc::new(FixedClock::at(1_700_000_000_000)),
            Arc::new(SequentialIds::default()),
        )
    }

    fn committed_pair(k: &Kernel) -> (fabric_kernel::Committed, fabric_kernel::Committed) {
        let genesis = k
            .create_entity(EntityType::Task, &json!({"title": "t", "status": "OPEN"}), "user")
            .unwrap();
        let second = k
            .create_delta(
                &genesis.entity,
                &genesis.state,
                vec![PatchOp::replace("/status", json!("DONE"))],
                "user",
            )
            .unwrap();
        (genesis, second)
    }

    #[test]
    fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let k = kernel();
        let (genesis, second) = committed_pair(&k);
        {
            let mut store = FsStore::open(dir.path()).unwrap();
            store.append_delta(&genesis.delta).unwrap();
            store
                .save_entity(&EntityRecord {
                    entity: genesis.entity.clone(),
                    state: genesis.state.clone(),
                })
                .unwrap();
            store.append_delta(&second.delta).unwrap();
            store
                .save_entity(&EntityRecord {
                    entity: second.entity.clone(),
                    state: second.state.clone(),
                })
                .unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        let record = store.load_entity(&second.entity.entity_id).unwrap().unwrap();
        assert_eq!(record.entity.version, 2);
        assert_eq!(store.load_deltas().unwrap().len(), 2);
    }

    #[test]
    fn missing_snapshot_rebuilds_from_log() {
        let dir = tempfile::tempdir().unwrap();
        let k = kernel();
        let (genesis, second) = committed_pair(&k);
        {
            let mut store = FsStore::open(dir.path()).unwrap();
            store
                .append_deltas(&[genesis.delta.clone(), second.delta.clone()])
                .unwrap();
            // Snapshot deliberately never saved.
        }
        fs::remove_file(dir.path().join(ENTITIES_FILE)).ok();
        let store = FsStore::open(dir.path()).unwrap();
        let record = store.load_entity(&second.entity.entity_id).unwrap().unwrap();
        assert_eq!(record.entity.state_hash, second.entity.state_hash);
        assert_eq!(record.state["status"], json!("DONE"));
    }

    #[test]
    fn stale_snapshot_head_triggers_rebuild() {
        let dir = tempfile::tempdir().unwrap();
        let k = kernel();
        let (genesis, second) = committed_pair(&k);
        {
            let mut store = FsStore::open(dir.path()).unwrap();
            store.append_delta(&genesis.delta).unwrap();
            store
                .save_entity(&EntityRecord {
                    entity: genesis.entity.clone(),
                    state: genesis.state.clone(),
                })
                .unwrap();
            // Log advances; snapshot does not (simulated crash between the
            // two writes).
            store.deltas.push(second.delta.clone());
            store.flush_deltas().unwrap();
        }
        let store = FsStore::open(dir.path()).unwrap();
        let record = store.load_entity(&second.entity.entity_id).unwrap().unwrap();
        assert_eq!(record.entity.version, 2);
        assert_eq!(record.entity.state_hash, second.entity.state_hash);
    }

    #[test]
    fn corrupt_log_tail_truncates_to_last_intact_record() {
        let dir = tempfile::tempdir().unwrap();
        let k = kernel();
        let (genesis, second) = committed_pair(&k);
        {
            let mut store = FsStore::open(dir.path()).unwrap();
            store
                .append_deltas(&[genesis.delta.clone(), second.delta.clone()])
                .unwrap();
        }
        // Chop the artifact mid-record.
        let path = dir.path().join(DELTAS_FILE);
        let full = fs::read(&path).unwrap();
        fs::write(&path, &full[..full.len() - 25]).unwrap();
        fs::remove_file(dir.path().join(ENTITIES_FILE)).ok();

        let store = FsStore::open(dir.path()).unwrap();
        let deltas = store.load_deltas().unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].delta_id, genesis.delta.delta_id);
        let record = store.load_entity(&genesis.entity.entity_id).unwrap().unwrap();
        assert_eq!(record.entity.version, 1);
    }
}
