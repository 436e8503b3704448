// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic conflict detection and resolution.
//!
//! When both sides hold deltas after a common `base_hash`, the node that
//! first sees both branches constructs an [`EntityConflict`] and resolves it
//! without negotiation: the branch with the lexicographically greater head
//! hash survives, and the losing branch's patches are rebased onto the
//! winner as **one** compensating resolution delta. Patches that no longer
//! apply on the winner are dropped — deterministically, in order. Given
//! identical branches, every implementation produces the identical
//! resolution delta (same id, same ts, same patches, same `new_hash`), so
//! both nodes converge by each consuming it.

use crate::error::SyncError;
use fabric_canonical::{hash_bytes, hash_canonical, StateHash};
use fabric_kernel::{apply_patches, Delta, Entity, EntityType, PatchOp};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Author tag carried by resolution deltas.
pub const RESOLUTION_AUTHOR: &str = "sync_resolver";

/// Lifecycle of a detected conflict.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ConflictStatus {
    /// Both branches identified; not yet resolved.
    Detected,
    /// Resolution delta constructed.
    Resolved,
}

/// One branch of a fork.
#[derive(Clone, PartialEq, Debug)]
pub struct Branch {
    /// Hash at the branch tip.
    pub head_hash: StateHash,
    /// Deltas from the base to the tip, chain order.
    pub deltas: Vec<Delta>,
}

impl Branch {
    /// Builds a branch from its deltas (must be non-empty, chain order).
    #[must_use]
    pub fn new(deltas: Vec<Delta>) -> Self {
        let head_hash = deltas.last().map_or(StateHash::ZERO, |d| d.new_hash);
        Branch { head_hash, deltas }
    }
}

/// A fork of one entity's history.
#[derive(Clone, PartialEq, Debug)]
pub struct EntityConflict {
    /// The forked entity.
    pub entity_id: String,
    /// Last hash both branches share.
    pub base_hash: StateHash,
    /// Local branch.
    pub branch_a: Branch,
    /// Remote branch.
    pub branch_b: Branch,
    /// Lifecycle state.
    pub status: ConflictStatus,
}

/// A commutative merge: `(base, ours, theirs) → merged`.
///
/// Types that register one get semantic merging instead of branch
/// selection. The function must be commutative in its branch arguments or
/// nodes will diverge.
pub type MergeFn = fn(&Value, &Value, &Value) -> Value;

/// Per-type resolution strategies.
#[derive(Default)]
pub struct ResolverRegistry {
    merges: BTreeMap<EntityType, MergeFn>,
}

impl ResolverRegistry {
    /// Creates a registry with the default strategy (lexicographic branch
    /// selection) for every type.
    #[must_use]
    pub fn new() -> Self {
        ResolverRegistry::default()
    }

    /// Registers a commutative merge for a type. Static at construction:
    /// registration after sessions start would break determinism.
    pub fn register_merge(&mut self, ty: EntityType, merge: MergeFn) {
        self.merges.insert(ty, merge);
    }

    fn merge_for(&self, ty: EntityType) -> Option<MergeFn> {
        self.merges.get(&ty).copied()
    }
}

/// What resolution produced.
#[derive(Clone, PartialEq, Debug)]
pub struct Resolution {
    /// The surviving branch (`true` = branch_a / local).
    pub winner_is_a: bool,
    /// The compensating delta extending the winner's tip.
    pub resolution_delta: Delta,
}

/// Resolves a conflict deterministically.
///
/// `base` is the entity/state pair at `base_hash` (both branches fork from
/// it). The winner is the branch with the lexicographically greater head
/// hash; with a registered merge the loser's patches are replaced by merge
/// output patches. The returned delta extends the winner's tip.
///
/// # Errors
///
/// Returns [`SyncError`] when a branch fails to apply from the base — the
/// caller screened both branches, so this indicates a corrupt branch.
pub fn resolve(
    conflict: &EntityConflict,
    registry: &ResolverRegistry,
    base_entity: &Entity,
    base_state: &Value,
) -> Result<Resolution, SyncError> {
    let winner_is_a = conflict.branch_a.head_hash >= conflict.branch_b.head_hash;
    let (winner, loser) = if winner_is_a {
        (&conflict.branch_a, &conflict.branch_b)
    } else {
        (&conflict.branch_b, &conflict.branch_a)
    };
    debug!(
        entity_id = %conflict.entity_id,
        winner = %winner.head_hash,
        "resolving fork"
    );

    // Replay the winner branch from the base.
    let ty = base_entity.entity_type;
    let mut winner_state = base_state.clone();
    for delta in &winner.deltas {
        winner_state = apply_patches(ty, &winner_state, &delta.patches)?;
    }
    let winner_version = winner
        .deltas
        .last()
        .map_or(base_entity.version, |d| d.version);

    // Rebase the loser: merge output when registered, otherwise the loser's
    // patches in order, dropping those the winner state no longer accepts.
    let patches = match registry.merge_for(ty) {
        Some(merge) => {
            let mut loser_state = base_state.clone();
            for delta in &loser.deltas {
                loser_state = apply_patches(ty, &loser_state, &delta.patches)?;
            }
            let merged = merge(base_state, &winner_state, &loser_state);
            rebase_to_target(ty, &winner_state, &merged)
        }
        None => {
            let mut survivors = Vec::new();
            let mut probe = winner_state.clone();
            for delta in &loser.deltas {
                for patch in &delta.patches {
                    match apply_patches(ty, &probe, std::slice::from_ref(patch)) {
                        Ok(next) => {
                            probe = next;
                            survivors.push(patch.clone());
                        }
                        Err(_) => {
                            debug!(path = %patch.path, "dropping non-rebasable patch");
                        }
                    }
                }
            }
            survivors
        }
    };

    let resolved_state = apply_patches(ty, &winner_state, &patches)?;
    let new_hash = hash_canonical(&resolved_state)?;
    let ts = winner
        .deltas
        .iter()
        .chain(&loser.deltas)
        .map(|d| d.ts)
        .max()
        .unwrap_or(base_entity.created_at);
    let resolution_delta = Delta {
        delta_id: resolution_delta_id(
            &conflict.entity_id,
            conflict.branch_a.head_hash,
            conflict.branch_b.head_hash,
        ),
        entity_id: conflict.entity_id.clone(),
        version: winner_version + 1,
        author: RESOLUTION_AUTHOR.to_string(),
        ts,
        patches,
        prev_hash: winner.head_hash,
        new_hash,
        signature: None,
    };
    info!(
        entity_id = %conflict.entity_id,
        delta_id = %resolution_delta.delta_id,
        "fork resolved"
    );
    Ok(Resolution {
        winner_is_a,
        resolution_delta,
    })
}

/// Deterministic id for a resolution delta: both nodes derive the same id
/// from the pair of branch heads (order-independent).
fn resolution_delta_id(entity_id: &str, head_a: StateHash, head_b: StateHash) -> String {
    let (lo, hi) = if head_a.as_bytes() <= head_b.as_bytes() {
        (head_a, head_b)
    } else {
        (head_b, head_a)
    };
    let mut seed = Vec::with_capacity(entity_id.len() + 76);
    seed.extend_from_slice(b"resolution:");
    seed.extend_from_slice(entity_id.as_bytes());
    seed.extend_from_slice(lo.as_bytes());
    seed.extend_from_slice(hi.as_bytes());
    let digest = hash_bytes(&seed);
    format!("delta-{}", &digest.to_hex()[..16])
}

/// Leaf patches that transform `current` into `target` (both objects).
/// Used by merge-based resolution to express the merge as a patch set.
fn rebase_to_target(ty: EntityType, current: &Value, target: &Value) -> Vec<PatchOp> {
    let mut patches = Vec::new();
    diff_values("", current, target, &mut patches);
    // Keep only patches the winner state accepts, in order.
    let mut probe = current.clone();
    patches.retain(|patch| {
        match apply_patches(ty, &probe, std::slice::from_ref(patch)) {
            Ok(next) => {
                probe = next;
                true
            }
            Err(_) => false,
        }
    });
    patches
}

fn diff_values(prefix: &str, current: &Value, target: &Value, out: &mut Vec<PatchOp>) {
    match (current, target) {
        (Value::Object(cur), Value::Object(tgt)) => {
            let mut keys: Vec<&String> = cur.keys().chain(tgt.keys()).collect();
            keys.sort_unstable();
            keys.dedup();
            for key in keys {
                let escaped = key.replace('~', "~0").replace('/', "~1");
                let path = format!("{prefix}/{escaped}");
                match (cur.get(key), tgt.get(key)) {
                    (Some(c), Some(t)) if c != t => diff_values(&path, c, t, out),
                    (Some(_), None) => out.push(PatchOp::remove(path)),
                    (None, Some(t)) => flatten_adds(&path, t, out),
                    _ => {}
                }
            }
        }
        (Value::Array(cur), Value::Array(tgt)) => {
            // Replace diverging elements; extend or shrink the tail.
            for (i, t) in tgt.iter().enumerate() {
                if cur.get(i) != Some(t) {
                    out.push(PatchOp::replace(format!("{prefix}/{i}"), t.clone()));
                }
            }
            for i in (tgt.len()..cur.len()).rev() {
                out.push(PatchOp::remove(format!("{prefix}/{i}")));
            }
        }
        (_, t) => out.push(PatchOp::replace(prefix.to_string(), t.clone())),
    }
}

fn flatten_adds(prefix: &str, value: &Value, out: &mut Vec<PatchOp>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                if let Some(child) = map.get(key) {
                    let escaped = key.replace('~', "~0").replace('/', "~1");
                    flatten_adds(&format!("{prefix}/{escaped}"), child, out);
                }
            }
        }
        Value::Array(items) if !items.is_empty() => {
            for (i, item) in items.iter().enumerate() {
                out.push(PatchOp::add(format!("{prefix}/{i}"), item.clone()));
            }
        }
        other => out.push(PatchOp::add(prefix.to_string(), other.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabric_kernel::{FixedClock, Kernel, SequentialIds};
    use serde_json::json;
    use std::sync::Arc;

    fn kernel(seed: u64) -> Kernel {
        let ids = SequentialIds::default();
        for _ in 0..seed {
            let _ = fabric_kernel::IdSource::mint(&ids, "skip");
        }
        Kernel::new(Arc::new(FixedClock::at(1_700_000_000_000)), Arc::new(ids))
    }

    fn fork() -> (Entity, Value, EntityConflict) {
        let k = kernel(0);
        let base = k
            .create_entity(
                EntityType::Note,
                &json!({"content": "base", "mood": "calm"}),
                "user",
            )
            .unwrap();

        let ours = k
            .create_delta(
                &base.entity,
                &base.state,
                vec![PatchOp::replace("/content", json!("ours"))],
                "user",
            )
            .unwrap();
        let theirs = k
            .create_delta(
                &base.entity,
                &base.state,
                vec![
                    PatchOp::replace("/content", json!("theirs")),
                    PatchOp::replace("/mood", json!("stormy")),
                ],
                "user",
            )
            .unwrap();

        let conflict = EntityConflict {
            entity_id: base.entity.entity_id.clone(),
            base_hash: base.entity.state_hash,
            branch_a: Branch::new(vec![ours.delta]),
            branch_b: Branch::new(vec![theirs.delta]),
            status: ConflictStatus::Detected,
        };
        (base.entity, base.state, conflict)
    }

    #[test]
    fn winner_is_the_greater_head_hash() {
        let (entity, state, conflict) = fork();
        let resolution = resolve(&conflict, &ResolverRegistry::new(), &entity, &state).unwrap();
        let expected_winner_is_a = conflict.branch_a.head_hash >= conflict.branch_b.head_hash;
        assert_eq!(resolution.winner_is_a, expected_winner_is_a);
        let winner = if resolution.winner_is_a {
            &conflict.branch_a
        } else {
            &conflict.branch_b
        };
        assert_eq!(resolution.resolution_delta.prev_hash, winner.head_hash);
        assert_eq!(resolution.resolution_delta.author, RESOLUTION_AUTHOR);
    }

    #[test]
    fn resolution_is_identical_regardless_of_branch_labelling() {
        // A node seeing (local=X, remote=Y) and one seeing (local=Y,
        // remote=X) must construct the same resolution delta.
        let (entity, state, conflict) = fork();
        let flipped = EntityConflict {
            entity_id: conflict.entity_id.clone(),
            base_hash: conflict.base_hash,
            branch_a: conflict.branch_b.clone(),
            branch_b: conflict.branch_a.clone(),
            status: ConflictStatus::Detected,
        };
        let registry = ResolverRegistry::new();
        let r1 = resolve(&conflict, &registry, &entity, &state).unwrap();
        let r2 = resolve(&flipped, &registry, &entity, &state).unwrap();
        assert_eq!(r1.resolution_delta, r2.resolution_delta);
        assert_eq!(r1.resolution_delta.new_hash, r2.resolution_delta.new_hash);
    }

    #[test]
    fn loser_patches_survive_where_they_still_apply() {
        let (entity, state, conflict) = fork();
        let resolution = resolve(&conflict, &ResolverRegistry::new(), &entity, &state).unwrap();
        // Whichever branch lost, its writes land in the resolved state (the
        // loser's /content overwrites the winner's: last writer at resolve
        // time, deterministically).
        let resolved = apply_winner_then(&entity, &state, &conflict, &resolution);
        assert!(resolved.get("mood").is_some());
        assert_eq!(
            fabric_canonical::hash_canonical(&resolved).unwrap(),
            resolution.resolution_delta.new_hash
        );
    }

    fn apply_winner_then(
        entity: &Entity,
        base_state: &Value,
        conflict: &EntityConflict,
        resolution: &Resolution,
    ) -> Value {
        let winner = if resolution.winner_is_a {
            &conflict.branch_a
        } else {
            &conflict.branch_b
        };
        let mut state = base_state.clone();
        for delta in &winner.deltas {
            state = apply_patches(entity.entity_type, &state, &delta.patches).unwrap();
        }
        apply_patches(
            entity.entity_type,
            &state,
            &resolution.resolution_delta.patches,
        )
        .unwrap()
    }

    #[test]
    fn registered_merge_replaces_branch_selection() {
        fn keep_both(_base: &Value, ours: &Value, theirs: &Value) -> Value {
            // Commutative: field-wise max of contents by string order.
            let a = ours["content"].as_str().unwrap_or_default();
            let b = theirs["content"].as_str().unwrap_or_default();
            let mut merged = ours.clone();
            merged["content"] = json!(a.max(b));
            merged
        }
        let (entity, state, conflict) = fork();
        let mut registry = ResolverRegistry::new();
        registry.register_merge(EntityType::Note, keep_both);
        let resolution = resolve(&conflict, &registry, &entity, &state).unwrap();
        let resolved = apply_winner_then(&entity, &state, &conflict, &resolution);
        assert_eq!(resolved["content"], json!("theirs")); // "theirs" > "ours"
    }
}
