// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `tasks.*` CRUD over `task` entities.
//!
//! Tasks are ordinary entities: creation is a genesis delta, updates are
//! leaf patches, and deletion is logical (`status = ARCHIVED`) — entity
//! history is never destroyed.

use crate::{ApiError, KernelContext, StateEvent};
use fabric_kernel::{EntityType, PatchOp};
use fabric_store::{EntityRecord, Store};
use serde::Deserialize;
use serde_json::{json, Value};

/// Input for `tasks.create`.
#[derive(Clone, Debug, Deserialize)]
pub struct TaskInput {
    /// Task title.
    pub title: String,
    /// Initial status; defaults to `OPEN`.
    #[serde(default)]
    pub status: Option<String>,
    /// Free-form notes.
    #[serde(default)]
    pub notes: Option<String>,
    /// Ordered tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Input for `tasks.update`; absent fields are left unchanged.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TaskUpdate {
    /// New title.
    #[serde(default)]
    pub title: Option<String>,
    /// New status.
    #[serde(default)]
    pub status: Option<String>,
    /// New notes.
    #[serde(default)]
    pub notes: Option<String>,
}

fn view(record: &EntityRecord) -> Value {
    json!({
        "task_id": record.entity.entity_id,
        "version": record.entity.version,
        "created_at": record.entity.created_at,
        "state": record.state,
    })
}

impl KernelContext {
    /// `tasks.create`: a genesis delta for a new task entity.
    ///
    /// # Errors
    ///
    /// Returns a validation error when the title is empty.
    pub fn tasks_create(&self, input: &TaskInput) -> Result<Value, ApiError> {
        if input.title.trim().is_empty() {
            return Err(ApiError::validation("title required"));
        }
        let mut state = json!({
            "title": input.title,
            "status": input.status.clone().unwrap_or_else(|| "OPEN".to_string()),
        });
        if let Some(notes) = &input.notes {
            state["notes"] = json!(notes);
        }
        if !input.tags.is_empty() {
            state["tags"] = json!(input.tags);
        }
        let committed = {
            let mut inner = self.lane();
            let committed = self.kernel.create_entity(EntityType::Task, &state, "user")?;
            crate::commit_to(&mut inner, &committed)?;
            inner
                .timeline
                .record("task_created", "user", Some(&committed.entity.entity_id), None);
            committed
        };
        self.emit(StateEvent::DeltaCreated {
            delta_id: committed.delta.delta_id.clone(),
            entity_id: committed.entity.entity_id.clone(),
            version: committed.entity.version,
        });
        Ok(view(&EntityRecord {
            entity: committed.entity,
            state: committed.state,
        }))
    }

    /// `tasks.get`: one task by id.
    ///
    /// # Errors
    ///
    /// Returns 404-equivalent for unknown ids.
    pub fn tasks_get(&self, task_id: &str) -> Result<Value, ApiError> {
        let inner = self.lane();
        let record = inner
            .store
            .load_entity(task_id)?
            .filter(|r| r.entity.entity_type == EntityType::Task)
            .ok_or_else(|| ApiError::not_found("task_not_found"))?;
        Ok(view(&record))
    }

    /// `tasks.list`: every task, id order.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError`] on store failure.
    pub fn tasks_list(&self) -> Result<Value, ApiError> {
        let inner = self.lane();
        let records = inner.store.load_entities_by_type(EntityType::Task)?;
        Ok(json!(records.iter().map(view).collect::<Vec<Value>>()))
    }

    /// `tasks.update`: leaf patches against a task.
    ///
    /// # Errors
    ///
    /// Returns 404-equivalent for unknown ids and validation errors for
    /// empty updates.
    pub fn tasks_update(&self, task_id: &str, update: &TaskUpdate) -> Result<Value, ApiError> {
        let mut patches = Vec::new();
        if let Some(title) = &update.title {
            patches.push(PatchOp::replace("/title", json!(title)));
        }
        if let Some(status) = &update.status {
            patches.push(PatchOp::replace("/status", json!(status)));
        }
        if let Some(notes) = &update.notes {
            patches.push(PatchOp::replace("/notes", json!(notes)));
        }
        if patches.is_empty() {
            return Err(ApiError::validation("nothing to update"));
        }
        self.patch_task(task_id, patches, "task_updated")
    }

    /// `tasks.archive`: logical deletion.
    ///
    /// # Errors
    ///
    /// Returns 404-equivalent for unknown ids.
    pub fn tasks_archive(&self, task_id: &str) -> Result<Value, ApiError> {
        self.patch_task(
            task_id,
            vec![PatchOp::replace("/status", json!("ARCHIVED"))],
            "task_archived",
        )
    }

    fn patch_task(
        &self,
        task_id: &str,
        patches: Vec<PatchOp>,
        event: &str,
    ) -> Result<Value, ApiError> {
        let committed = {
            let mut inner = self.lane();
            let record = inner
                .store
                .load_entity(task_id)?
                .filter(|r| r.entity.entity_type == EntityType::Task)
                .ok_or_else(|| ApiError::not_found("task_not_found"))?;
            let committed = self
                .kernel
                .create_delta(&record.entity, &record.state, patches, "user")?;
            crate::commit_to(&mut inner, &committed)?;
            inner.timeline.record(event, "user", Some(task_id), None);
            committed
        };
        self.emit(StateEvent::DeltaCreated {
            delta_id: committed.delta.delta_id.clone(),
            entity_id: committed.entity.entity_id.clone(),
            version: committed.entity.version,
        });
        Ok(view(&EntityRecord {
            entity: committed.entity,
            state: committed.state,
        }))
    }
}
