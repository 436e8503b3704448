// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Patch application, Law Genesis materialization, and the commit operations.
//!
//! Apply semantics, in order per patch:
//!
//! 1. Parse the RFC 6901 pointer.
//! 2. Walk the ancestor tokens, materializing missing containers — objects
//!    for string keys, arrays for numeric keys (Law Genesis). Materialization
//!    happens inside the applying delta, never as a separate one.
//! 3. Enforce leaf-patch rules at the target: an object key may only hold a
//!    primitive or an empty container; an array element is a leaf position
//!    and may hold any value. A populated composite that pre-existed the
//!    delta can never be overwritten or removed wholesale.
//! 4. `add` and `replace` are both upserts; `remove` of an absent target is
//!    a no-op.
//!
//! Numeric indices may only target arrays that either were materialized
//! within the same delta or are schema-marked ordered sequences.

use crate::delta::{Delta, PatchKind, PatchOp};
use crate::entity::{Entity, EntityType};
use crate::pointer::{array_index, is_index_token, Pointer, PointerError};
use crate::ports::{Clock, IdSource};
use crate::schema::{ordered_sequences, validate_state, SchemaError};
use fabric_canonical::{hash_canonical, CanonError, StateHash};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::Arc;

/// Errors from patch application and commit operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum KernelError {
    /// Patch path failed to parse.
    #[error("invalid pointer: {0}")]
    Pointer(#[from] PointerError),
    /// Patch targeted a populated composite subtree.
    #[error("[NOT_LEAF] path {path:?} targets a populated composite")]
    NotLeaf {
        /// The offending path.
        path: String,
    },
    /// Patch path traverses through a primitive value.
    #[error("[NOT_CONTAINER] path {path:?} traverses a primitive at {at:?}")]
    NotContainer {
        /// The offending path.
        path: String,
        /// The token where traversal failed.
        at: String,
    },
    /// Numeric index into an array the schema does not mark ordered.
    #[error("[NOT_ORDERED] path {path:?} indexes an unordered sequence")]
    NotOrderedSequence {
        /// The offending path.
        path: String,
    },
    /// Array index was beyond one-past-the-end.
    #[error("[INDEX_RANGE] path {path:?} index out of range")]
    IndexOutOfRange {
        /// The offending path.
        path: String,
    },
    /// `add`/`replace` without a value.
    #[error("[VALUE_REQUIRED] {op:?} at {path:?} requires a value")]
    ValueRequired {
        /// The op missing its value.
        op: PatchKind,
        /// The offending path.
        path: String,
    },
    /// Resulting state failed its type schema.
    #[error(transparent)]
    Schema(#[from] SchemaError),
    /// Canonicalization failed (non-finite number in a patch value).
    #[error(transparent)]
    Canon(#[from] CanonError),
    /// Delta's `prev_hash` did not match the entity's state hash, or its
    /// `new_hash` did not match the applied result.
    #[error("[HASH_CHAIN_BROKEN] expected {expected}, found {found}")]
    HashChainBroken {
        /// Hash the chain required.
        expected: StateHash,
        /// Hash actually presented/computed.
        found: StateHash,
    },
    /// Delta's version was not parent version + 1.
    #[error("[VERSION_MISMATCH] expected {expected}, found {found}")]
    VersionMismatch {
        /// Version the chain required.
        expected: u64,
        /// Version actually presented.
        found: u64,
    },
    /// Genesis delta's entity id does not encode a known type.
    #[error("[ENTITY_TYPE_UNKNOWN] cannot derive type from {entity_id:?}")]
    EntityTypeUnknown {
        /// The undecodable entity id.
        entity_id: String,
    },
    /// Initial state for `create_entity` was not an object.
    #[error("initial state must be an object")]
    InitialStateNotObject,
}

/// Outcome of [`verify_hash_chain`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ChainCheck {
    /// Delta links cleanly and the result satisfies the schema.
    Ok,
    /// `prev_hash`/`new_hash` linkage is broken.
    HashChainBroken,
    /// Patches are malformed or the result violates the type schema.
    SchemaInvalid,
}

/// Result of a successful commit: the advanced entity, its new state, and
/// the delta that records the transition.
#[derive(Clone, PartialEq, Debug)]
pub struct Committed {
    /// Entity after the commit (version bumped, hash advanced).
    pub entity: Entity,
    /// State after the commit.
    pub state: Value,
    /// The immutable record of the transition.
    pub delta: Delta,
}

/// Commit-side kernel: mints ids and timestamps through its ports.
///
/// Cheap to clone; the ports are shared.
#[derive(Clone)]
pub struct Kernel {
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl Kernel {
    /// Creates a kernel over the given ports.
    pub fn new(clock: Arc<dyn Clock>, ids: Arc<dyn IdSource>) -> Self {
        Kernel { clock, ids }
    }

    /// The kernel's clock port.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// The kernel's id port.
    #[must_use]
    pub fn ids(&self) -> &Arc<dyn IdSource> {
        &self.ids
    }

    /// Creates a new entity with a genesis delta.
    ///
    /// The initial state is flattened into leaf `add` patches so the delta
    /// log alone can rebuild it; the genesis delta's `prev_hash` is the zero
    /// hash and the entity lands at version 1.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when the initial state is not an object,
    /// violates the type schema, or cannot be canonicalized.
    pub fn create_entity(
        &self,
        entity_type: EntityType,
        initial_state: &Value,
        author: &str,
    ) -> Result<Committed, KernelError> {
        if !initial_state.is_object() {
            return Err(KernelError::InitialStateNotObject);
        }
        validate_state(entity_type, initial_state)?;
        let patches = genesis_patches(initial_state);
        let state = apply_patches(entity_type, &Value::Object(Map::new()), &patches)?;
        let new_hash = hash_canonical(&state)?;
        let ts = self.clock.now_ms();
        let entity_id = self.ids.mint(entity_type.as_str());
        let delta = Delta {
            delta_id: self.ids.mint("delta"),
            entity_id: entity_id.clone(),
            version: 1,
            author: author.to_string(),
            ts,
            patches,
            prev_hash: StateHash::ZERO,
            new_hash,
            signature: None,
        };
        let entity = Entity {
            entity_id,
            entity_type,
            created_at: ts,
            version: 1,
            state_hash: new_hash,
        };
        Ok(Committed {
            entity,
            state,
            delta,
        })
    }

    /// Commits a patch set against an entity's current state.
    ///
    /// # Errors
    ///
    /// Returns [`KernelError`] when a patch violates the leaf rules, the
    /// result fails its schema, or canonicalization fails.
    pub fn create_delta(
        &self,
        entity: &Entity,
        current_state: &Value,
        patches: Vec<PatchOp>,
        author: &str,
    ) -> Result<Committed, KernelError> {
        let state = apply_patches(entity.entity_type, current_state, &patches)?;
        validate_state(entity.entity_type, &state)?;
        let new_hash = hash_canonical(&state)?;
        let delta = Delta {
            delta_id: self.ids.mint("delta"),
            entity_id: entity.entity_id.clone(),
            version: entity.version + 1,
            author: author.to_string(),
            ts: self.clock.now_ms(),
            patches,
            prev_hash: entity.state_hash,
            new_hash,
            signature: None,
        };
        let mut advanced = entity.clone();
        advanced.version += 1;
        advanced.state_hash = new_hash;
        Ok(Committed {
            entity: advanced,
            state,
            delta,
        })
    }
}

/// Re-applies a peer's delta to a local entity (sync receive path).
///
/// # Errors
///
/// Returns [`KernelError::VersionMismatch`] / [`KernelError::HashChainBroken`]
/// when the delta does not link onto the entity's current head, and schema or
/// patch errors when the payload is malformed.
pub fn apply_delta(
    entity: &Entity,
    current_state: &Value,
    delta: &Delta,
) -> Result<(Entity, Value), KernelError> {
    if delta.version != entity.version + 1 {
        return Err(KernelError::VersionMismatch {
            expected: entity.version + 1,
            found: delta.version,
        });
    }
    if delta.prev_hash != entity.state_hash {
        return Err(KernelError::HashChainBroken {
            expected: entity.state_hash,
            found: delta.prev_hash,
        });
    }
    let state = apply_patches(entity.entity_type, current_state, &delta.patches)?;
    validate_state(entity.entity_type, &state)?;
    let computed = hash_canonical(&state)?;
    if computed != delta.new_hash {
        return Err(KernelError::HashChainBroken {
            expected: delta.new_hash,
            found: computed,
        });
    }
    let mut advanced = entity.clone();
    advanced.version = delta.version;
    advanced.state_hash = computed;
    Ok((advanced, state))
}

/// Materializes a brand-new entity from a genesis delta (sync bootstrap).
///
/// The entity type is recovered from the id prefix; the state is rebuilt by
/// applying the genesis patches to an empty object and checked against the
/// delta's `new_hash`.
///
/// # Errors
///
/// Returns [`KernelError`] when the delta is not genesis-shaped, its id does
/// not encode a known type, or the rebuilt state does not match `new_hash`.
pub fn materialize_from_genesis(delta: &Delta) -> Result<(Entity, Value), KernelError> {
    if !delta.is_genesis() || delta.version != 1 {
        return Err(KernelError::VersionMismatch {
            expected: 1,
            found: delta.version,
        });
    }
    let Some(entity_type) = EntityType::from_entity_id(&delta.entity_id) else {
        return Err(KernelError::EntityTypeUnknown {
            entity_id: delta.entity_id.clone(),
        });
    };
    let state = apply_patches(entity_type, &Value::Object(Map::new()), &delta.patches)?;
    validate_state(entity_type, &state)?;
    let computed = hash_canonical(&state)?;
    if computed != delta.new_hash {
        return Err(KernelError::HashChainBroken {
            expected: delta.new_hash,
            found: computed,
        });
    }
    let entity = Entity {
        entity_id: delta.entity_id.clone(),
        entity_type,
        created_at: delta.ts,
        version: 1,
        state_hash: computed,
    };
    Ok((entity, state))
}

/// Checks whether a delta links onto an entity/state pair without applying
/// it for real.
#[must_use]
pub fn verify_hash_chain(entity: &Entity, current_state: &Value, delta: &Delta) -> ChainCheck {
    match apply_delta(entity, current_state, delta) {
        Ok(_) => ChainCheck::Ok,
        Err(KernelError::HashChainBroken { .. } | KernelError::VersionMismatch { .. }) => {
            ChainCheck::HashChainBroken
        }
        Err(_) => ChainCheck::SchemaInvalid,
    }
}

/// Flattens an initial state into leaf `add` patches.
///
/// Keys are visited in sorted order and array elements in ascending index
/// order, so the output is deterministic and each index lands exactly at
/// one-past-the-end when re-applied.
#[must_use]
pub fn genesis_patches(state: &Value) -> Vec<PatchOp> {
    let mut out = Vec::new();
    flatten_into("", state, &mut out, true);
    out
}

fn flatten_into(prefix: &str, value: &Value, out: &mut Vec<PatchOp>, is_root: bool) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            for key in keys {
                let Some(child) = map.get(key) else { continue };
                let escaped = key.replace('~', "~0").replace('/', "~1");
                flatten_into(&format!("{prefix}/{escaped}"), child, out, false);
            }
        }
        Value::Array(items) if !items.is_empty() => {
            // Array elements are leaf positions; emit each element whole so
            // nested composites stay intact.
            for (i, item) in items.iter().enumerate() {
                out.push(PatchOp::add(format!("{prefix}/{i}"), item.clone()));
            }
        }
        other => {
            if is_root {
                return;
            }
            out.push(PatchOp::add(prefix.to_string(), other.clone()));
        }
    }
}

/// Applies a patch set to a deep copy of `state`, materializing missing
/// ancestors (Law Genesis).
///
/// # Errors
///
/// Returns [`KernelError`] for malformed pointers, leaf violations, illegal
/// array indices, or missing values.
pub fn apply_patches(
    entity_type: EntityType,
    state: &Value,
    patches: &[PatchOp],
) -> Result<Value, KernelError> {
    let mut next = state.clone();
    // Paths of containers created by this patch set; fresh containers accept
    // any index and may be overwritten while still under construction.
    let mut fresh: HashSet<String> = HashSet::new();
    for patch in patches {
        let pointer = Pointer::parse(&patch.path)?;
        match patch.op {
            PatchKind::Add | PatchKind::Replace => {
                let Some(value) = patch.value.clone() else {
                    return Err(KernelError::ValueRequired {
                        op: patch.op,
                        path: patch.path.clone(),
                    });
                };
                apply_set(entity_type, &mut next, &pointer, &patch.path, value, &mut fresh)?;
            }
            PatchKind::Remove => {
                apply_remove(&mut next, &pointer, &patch.path, &fresh)?;
            }
        }
    }
    Ok(next)
}

fn prefix_of(tokens: &[String], upto: usize) -> String {
    let mut out = String::new();
    for token in &tokens[..upto] {
        out.push('/');
        out.push_str(&token.replace('~', "~0").replace('/', "~1"));
    }
    out
}

/// Walks to the parent of the addressed leaf, materializing containers.
fn descend_to_parent<'a>(
    entity_type: EntityType,
    root: &'a mut Value,
    pointer: &Pointer,
    path: &str,
    fresh: &mut HashSet<String>,
) -> Result<&'a mut Value, KernelError> {
    let tokens = pointer.tokens();
    let mut current = root;
    for (i, token) in tokens[..tokens.len() - 1].iter().enumerate() {
        let here = prefix_of(tokens, i + 1);
        let next_is_index = is_index_token(&tokens[i + 1]);
        let make_child = || {
            if next_is_index {
                Value::Array(Vec::new())
            } else {
                Value::Object(Map::new())
            }
        };
        match current {
            Value::Object(map) => {
                if !map.contains_key(token.as_str()) {
                    map.insert(token.clone(), make_child());
                    fresh.insert(here.clone());
                }
                // Entry exists now; descend.
                current = map
                    .get_mut(token.as_str())
                    .ok_or_else(|| KernelError::NotContainer {
                        path: path.to_string(),
                        at: token.clone(),
                    })?;
                if !current.is_object() && !current.is_array() {
                    return Err(KernelError::NotContainer {
                        path: path.to_string(),
                        at: token.clone(),
                    });
                }
            }
            Value::Array(items) => {
                check_ordered(entity_type, &prefix_of(tokens, i), path, fresh)?;
                let Some(idx) = array_index(token, items.len()) else {
                    return Err(KernelError::IndexOutOfRange {
                        path: path.to_string(),
                    });
                };
                if idx == items.len() {
                    items.push(make_child());
                    fresh.insert(here.clone());
                }
                current = items.get_mut(idx).ok_or_else(|| KernelError::IndexOutOfRange {
                    path: path.to_string(),
                })?;
                if !current.is_object() && !current.is_array() {
                    return Err(KernelError::NotContainer {
                        path: path.to_string(),
                        at: token.clone(),
                    });
                }
            }
            _ => {
                return Err(KernelError::NotContainer {
                    path: path.to_string(),
                    at: token.clone(),
                })
            }
        }
    }
    Ok(current)
}

/// An existing value counts as a leaf when it is a primitive or an empty
/// container.
fn is_leaf_value(v: &Value) -> bool {
    match v {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => true,
    }
}

fn check_ordered(
    entity_type: EntityType,
    array_prefix: &str,
    path: &str,
    fresh: &HashSet<String>,
) -> Result<(), KernelError> {
    if fresh.contains(array_prefix) {
        return Ok(());
    }
    if ordered_sequences(entity_type).contains(&array_prefix) {
        return Ok(());
    }
    Err(KernelError::NotOrderedSequence {
        path: path.to_string(),
    })
}

fn apply_set(
    entity_type: EntityType,
    root: &mut Value,
    pointer: &Pointer,
    path: &str,
    value: Value,
    fresh: &mut HashSet<String>,
) -> Result<(), KernelError> {
    let tokens = pointer.tokens();
    let leaf = pointer.leaf_token().to_string();
    let array_prefix = prefix_of(tokens, tokens.len() - 1);
    let parent = descend_to_parent(entity_type, root, pointer, path, fresh)?;
    match parent {
        Value::Object(map) => {
            // Object keys only hold leaf values; a populated composite that
            // pre-existed this delta is never overwritten.
            if let Some(existing) = map.get(&leaf) {
                let full = prefix_of(tokens, tokens.len());
                if !is_leaf_value(existing) && !fresh.contains(&full) {
                    return Err(KernelError::NotLeaf {
                        path: path.to_string(),
                    });
                }
            }
            if !is_leaf_value(&value) {
                return Err(KernelError::NotLeaf {
                    path: path.to_string(),
                });
            }
            map.insert(leaf, value);
        }
        Value::Array(items) => {
            check_ordered(entity_type, &array_prefix, path, fresh)?;
            let Some(idx) = array_index(&leaf, items.len()) else {
                return Err(KernelError::IndexOutOfRange {
                    path: path.to_string(),
                });
            };
            if idx == items.len() {
                items.push(value);
            } else {
                items[idx] = value;
            }
        }
        _ => {
            return Err(KernelError::NotContainer {
                path: path.to_string(),
                at: leaf,
            })
        }
    }
    Ok(())
}

fn apply_remove(
    root: &mut Value,
    pointer: &Pointer,
    path: &str,
    _fresh: &HashSet<String>,
) -> Result<(), KernelError> {
    // Removal never materializes; a missing target (or missing ancestor) is
    // a no-op.
    let tokens = pointer.tokens();
    let mut current = &mut *root;
    for token in &tokens[..tokens.len() - 1] {
        let next = match current {
            Value::Object(map) => map.get_mut(token.as_str()),
            Value::Array(items) => {
                let len = items.len();
                match array_index(token, len) {
                    Some(idx) if idx < len => items.get_mut(idx),
                    _ => None,
                }
            }
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Ok(()),
        }
    }
    let leaf = pointer.leaf_token();
    match current {
        Value::Object(map) => {
            if let Some(existing) = map.get(leaf) {
                if !is_leaf_value(existing) {
                    return Err(KernelError::NotLeaf {
                        path: path.to_string(),
                    });
                }
                map.remove(leaf);
            }
        }
        Value::Array(items) => {
            if let Some(idx) = array_index(leaf, items.len()) {
                if idx < items.len() {
                    items.remove(idx);
                }
            }
        }
        _ => {}
    }
    Ok(())
}
