//! In-memory implementation of WorkflowStore for testing

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;
use waymark_model::{
    ActivityForm, ActivityInstance, ActivityInstanceKey, ActivityVersion, MethodParameter,
    Position, SemaphoreRecord, Transition, WorkflowForm, WorkflowInstance, WorkflowSummary,
    WorkflowVersion,
};

use super::store::{new_etag, StoreError, WorkflowStore};

/// In-memory implementation of WorkflowStore
///
/// This is primarily for testing. It stores all data in memory and provides
/// the same semantics as the PostgreSQL implementation, including
/// optimistic-concurrency checks.
///
/// # Example
///
/// ```
/// use waymark_engine::InMemoryWorkflowStore;
///
/// let store = InMemoryWorkflowStore::new();
/// ```
#[derive(Default)]
pub struct InMemoryWorkflowStore {
    workflow_forms: RwLock<HashMap<Uuid, WorkflowForm>>,
    workflow_versions: RwLock<HashMap<Uuid, WorkflowVersion>>,
    activity_forms: RwLock<HashMap<Uuid, ActivityForm>>,
    activity_versions: RwLock<HashMap<Uuid, ActivityVersion>>,
    transitions: RwLock<HashMap<Uuid, Transition>>,
    method_parameters: RwLock<HashMap<Uuid, MethodParameter>>,
    workflow_instances: RwLock<HashMap<Uuid, WorkflowInstance>>,
    activity_instances: RwLock<HashMap<Uuid, ActivityInstance>>,
    activity_index: RwLock<HashMap<ActivityInstanceKey, Uuid>>,
    summaries: RwLock<HashMap<Uuid, WorkflowSummary>>,
    semaphores: RwLock<HashMap<String, SemaphoreRecord>>,
}

impl InMemoryWorkflowStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of workflow instances
    pub fn workflow_instance_count(&self) -> usize {
        self.workflow_instances.read().len()
    }

    /// Get the number of activity instances
    pub fn activity_instance_count(&self) -> usize {
        self.activity_instances.read().len()
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.workflow_forms.write().clear();
        self.workflow_versions.write().clear();
        self.activity_forms.write().clear();
        self.activity_versions.write().clear();
        self.transitions.write().clear();
        self.method_parameters.write().clear();
        self.workflow_instances.write().clear();
        self.activity_instances.write().clear();
        self.activity_index.write().clear();
        self.summaries.write().clear();
        self.semaphores.write().clear();
    }
}

/// Create-or-update a row in a map, regenerating the etag.
fn upsert_row<K: std::hash::Hash + Eq + Clone, V: Clone>(
    map: &RwLock<HashMap<K, V>>,
    key: K,
    mut row: V,
    set_etag: impl FnOnce(&mut V, String),
) -> V {
    set_etag(&mut row, new_etag());
    map.write().insert(key, row.clone());
    row
}

#[async_trait]
impl WorkflowStore for InMemoryWorkflowStore {
    async fn workflow_form(&self, id: Uuid) -> Result<Option<WorkflowForm>, StoreError> {
        Ok(self.workflow_forms.read().get(&id).cloned())
    }

    async fn upsert_workflow_form(&self, form: &WorkflowForm) -> Result<WorkflowForm, StoreError> {
        Ok(upsert_row(
            &self.workflow_forms,
            form.id,
            form.clone(),
            |row, etag| row.etag = etag,
        ))
    }

    async fn workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self.workflow_versions.read().get(&id).cloned())
    }

    async fn find_workflow_version(
        &self,
        workflow_form_id: Uuid,
        major_version: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        Ok(self
            .workflow_versions
            .read()
            .values()
            .find(|v| v.workflow_form_id == workflow_form_id && v.major_version == major_version)
            .cloned())
    }

    async fn upsert_workflow_version(
        &self,
        version: &WorkflowVersion,
    ) -> Result<WorkflowVersion, StoreError> {
        let mut versions = self.workflow_versions.write();
        // Same conflict target as the relational adapter: one row per
        // (form, major version), whoever registered first keeps the id.
        let id = versions
            .values()
            .find(|v| {
                v.workflow_form_id == version.workflow_form_id
                    && v.major_version == version.major_version
            })
            .map(|v| v.id)
            .unwrap_or(version.id);

        let mut row = version.clone();
        row.id = id;
        row.etag = new_etag();
        versions.insert(id, row.clone());
        Ok(row)
    }

    async fn activity_form(&self, id: Uuid) -> Result<Option<ActivityForm>, StoreError> {
        Ok(self.activity_forms.read().get(&id).cloned())
    }

    async fn upsert_activity_form(&self, form: &ActivityForm) -> Result<ActivityForm, StoreError> {
        Ok(upsert_row(
            &self.activity_forms,
            form.id,
            form.clone(),
            |row, etag| row.etag = etag,
        ))
    }

    async fn activity_version(&self, id: Uuid) -> Result<Option<ActivityVersion>, StoreError> {
        Ok(self.activity_versions.read().get(&id).cloned())
    }

    async fn find_activity_version(
        &self,
        workflow_version_id: Uuid,
        activity_form_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError> {
        Ok(self
            .activity_versions
            .read()
            .values()
            .find(|v| {
                v.workflow_version_id == workflow_version_id
                    && v.activity_form_id == activity_form_id
                    && &v.position == position
            })
            .cloned())
    }

    async fn activity_version_at(
        &self,
        workflow_version_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError> {
        Ok(self
            .activity_versions
            .read()
            .values()
            .find(|v| v.workflow_version_id == workflow_version_id && &v.position == position)
            .cloned())
    }

    async fn upsert_activity_version(
        &self,
        version: &ActivityVersion,
    ) -> Result<ActivityVersion, StoreError> {
        let mut versions = self.activity_versions.write();
        // One row per (workflow version, form, position), as in SQL.
        let id = versions
            .values()
            .find(|v| {
                v.workflow_version_id == version.workflow_version_id
                    && v.activity_form_id == version.activity_form_id
                    && v.position == version.position
            })
            .map(|v| v.id)
            .unwrap_or(version.id);

        let mut row = version.clone();
        row.id = id;
        row.etag = new_etag();
        versions.insert(id, row.clone());
        Ok(row)
    }

    async fn create_transition(&self, transition: &Transition) -> Result<Transition, StoreError> {
        Ok(upsert_row(
            &self.transitions,
            transition.id,
            transition.clone(),
            |row, etag| row.etag = etag,
        ))
    }

    async fn transitions_for_version(
        &self,
        workflow_version_id: Uuid,
    ) -> Result<Vec<Transition>, StoreError> {
        Ok(self
            .transitions
            .read()
            .values()
            .filter(|t| t.workflow_version_id == workflow_version_id)
            .cloned()
            .collect())
    }

    async fn upsert_method_parameter(
        &self,
        parameter: &MethodParameter,
    ) -> Result<MethodParameter, StoreError> {
        let mut parameters = self.method_parameters.write();
        // One row per (owner, name), as in SQL.
        let id = parameters
            .values()
            .find(|p| p.owner_version_id == parameter.owner_version_id && p.name == parameter.name)
            .map(|p| p.id)
            .unwrap_or(parameter.id);

        let mut row = parameter.clone();
        row.id = id;
        row.etag = new_etag();
        parameters.insert(id, row.clone());
        Ok(row)
    }

    async fn method_parameters_for(
        &self,
        owner_version_id: Uuid,
    ) -> Result<Vec<MethodParameter>, StoreError> {
        Ok(self
            .method_parameters
            .read()
            .values()
            .filter(|p| p.owner_version_id == owner_version_id)
            .cloned()
            .collect())
    }

    async fn create_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut row = instance.clone();
        row.etag = new_etag();
        self.workflow_instances.write().insert(row.id, row.clone());
        Ok(row)
    }

    async fn workflow_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.workflow_instances.read().get(&id).cloned())
    }

    async fn update_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut instances = self.workflow_instances.write();
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "workflow instance",
                id: instance.id.to_string(),
            })?;

        if stored.etag != instance.etag {
            return Err(StoreError::ConcurrencyConflict {
                entity: "workflow instance",
                id: instance.id.to_string(),
            });
        }

        let mut updated = instance.clone();
        updated.etag = new_etag();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn find_or_create_activity_instance(
        &self,
        template: &ActivityInstance,
    ) -> Result<(ActivityInstance, bool), StoreError> {
        let key = template.key();

        // Take both locks in a fixed order so the index and rows stay in sync.
        let mut index = self.activity_index.write();
        let mut instances = self.activity_instances.write();

        if let Some(existing_id) = index.get(&key) {
            let row = instances
                .get(existing_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound {
                    entity: "activity instance",
                    id: existing_id.to_string(),
                })?;
            return Ok((row, false));
        }

        let mut row = template.clone();
        row.etag = new_etag();
        index.insert(key, row.id);
        instances.insert(row.id, row.clone());
        Ok((row, true))
    }

    async fn activity_instance(&self, id: Uuid) -> Result<Option<ActivityInstance>, StoreError> {
        Ok(self.activity_instances.read().get(&id).cloned())
    }

    async fn update_activity_instance(
        &self,
        instance: &ActivityInstance,
    ) -> Result<ActivityInstance, StoreError> {
        let mut instances = self.activity_instances.write();
        let stored = instances
            .get_mut(&instance.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "activity instance",
                id: instance.id.to_string(),
            })?;

        if stored.etag != instance.etag {
            return Err(StoreError::ConcurrencyConflict {
                entity: "activity instance",
                id: instance.id.to_string(),
            });
        }

        let mut updated = instance.clone();
        updated.etag = new_etag();
        *stored = updated.clone();
        Ok(updated)
    }

    async fn activity_instances_for(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<ActivityInstance>, StoreError> {
        let mut rows: Vec<_> = self
            .activity_instances
            .read()
            .values()
            .filter(|a| a.workflow_instance_id == workflow_instance_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.position.clone(), a.iteration).cmp(&(b.position.clone(), b.iteration)));
        Ok(rows)
    }

    async fn create_or_update_summary(
        &self,
        summary: &WorkflowSummary,
    ) -> Result<(), StoreError> {
        self.summaries
            .write()
            .insert(summary.instance.id, summary.clone());
        Ok(())
    }

    async fn workflow_summary(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError> {
        Ok(self.summaries.read().get(&workflow_instance_id).cloned())
    }

    async fn semaphore(&self, resource_id: &str) -> Result<Option<SemaphoreRecord>, StoreError> {
        Ok(self.semaphores.read().get(resource_id).cloned())
    }

    async fn upsert_semaphore(
        &self,
        record: &SemaphoreRecord,
    ) -> Result<SemaphoreRecord, StoreError> {
        let mut semaphores = self.semaphores.write();

        if let Some(stored) = semaphores.get(&record.resource_id) {
            if stored.etag != record.etag {
                return Err(StoreError::ConcurrencyConflict {
                    entity: "semaphore",
                    id: record.resource_id.clone(),
                });
            }
        } else if !record.etag.is_empty() {
            return Err(StoreError::ConcurrencyConflict {
                entity: "semaphore",
                id: record.resource_id.clone(),
            });
        }

        let mut updated = record.clone();
        updated.etag = new_etag();
        semaphores.insert(updated.resource_id.clone(), updated.clone());
        Ok(updated)
    }

    async fn delete_all(&self) -> Result<(), StoreError> {
        self.clear();
        Ok(())
    }
}
