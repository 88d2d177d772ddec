//! WorkflowStore trait definition

use async_trait::async_trait;
use uuid::Uuid;
use waymark_model::{
    ActivityForm, ActivityInstance, ActivityVersion, MethodParameter, Position, SemaphoreRecord,
    Transition, WorkflowForm, WorkflowInstance, WorkflowSummary, WorkflowVersion,
};

use crate::outcome::ActivityFailure;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Row not found
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Concurrency conflict (optimistic-concurrency token mismatch)
    ///
    /// Someone else changed the row. The correct reaction is a conflict-aware
    /// merge (reload and retry), never a silent overwrite.
    #[error("concurrency conflict on {entity} {id}")]
    ConcurrencyConflict { entity: &'static str, id: String },

    /// The stored schema version is incompatible with this engine build
    #[error("schema version mismatch: engine expects {engine}, store has {stored}")]
    SchemaMismatch { engine: i32, stored: i32 },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<StoreError> for ActivityFailure {
    fn from(err: StoreError) -> Self {
        ActivityFailure::capability(format!("storage error: {err}"))
    }
}

/// Generate a fresh optimistic-concurrency token.
pub fn new_etag() -> String {
    Uuid::now_v7().to_string()
}

/// Storage port for workflow definitions and runtime state
///
/// This trait defines the interface the engine persists through.
/// Implementations must be thread-safe and support concurrent access.
///
/// Every mutable row carries an `etag`; `update_*` operations check it and
/// fail with [`StoreError::ConcurrencyConflict`] on a mismatch. `upsert_*`
/// operations are create-or-update: "already exists" is never a failure.
#[async_trait]
pub trait WorkflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definition Operations
    // =========================================================================

    /// Get a workflow form by id
    async fn workflow_form(&self, id: Uuid) -> Result<Option<WorkflowForm>, StoreError>;

    /// Create or update a workflow form, returning the stored row
    async fn upsert_workflow_form(&self, form: &WorkflowForm) -> Result<WorkflowForm, StoreError>;

    /// Get a workflow version by id
    async fn workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError>;

    /// Find the workflow version of a form with the given major version
    async fn find_workflow_version(
        &self,
        workflow_form_id: Uuid,
        major_version: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError>;

    /// Create or update a workflow version
    async fn upsert_workflow_version(
        &self,
        version: &WorkflowVersion,
    ) -> Result<WorkflowVersion, StoreError>;

    /// Get an activity form by id
    async fn activity_form(&self, id: Uuid) -> Result<Option<ActivityForm>, StoreError>;

    /// Create or update an activity form
    async fn upsert_activity_form(&self, form: &ActivityForm) -> Result<ActivityForm, StoreError>;

    /// Get an activity version by id
    async fn activity_version(&self, id: Uuid) -> Result<Option<ActivityVersion>, StoreError>;

    /// Find the activity version of a form at a position within a workflow
    /// version
    async fn find_activity_version(
        &self,
        workflow_version_id: Uuid,
        activity_form_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError>;

    /// Find whichever activity version sits at a position within a workflow
    /// version (used for parent lookup by trimming the position)
    async fn activity_version_at(
        &self,
        workflow_version_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError>;

    /// Create or update an activity version
    async fn upsert_activity_version(
        &self,
        version: &ActivityVersion,
    ) -> Result<ActivityVersion, StoreError>;

    /// Record a configuration-time transition edge
    async fn create_transition(&self, transition: &Transition) -> Result<Transition, StoreError>;

    /// List the transition edges of a workflow version
    async fn transitions_for_version(
        &self,
        workflow_version_id: Uuid,
    ) -> Result<Vec<Transition>, StoreError>;

    /// Create or update a method parameter declaration
    async fn upsert_method_parameter(
        &self,
        parameter: &MethodParameter,
    ) -> Result<MethodParameter, StoreError>;

    /// List the parameters declared on a workflow or activity version
    async fn method_parameters_for(
        &self,
        owner_version_id: Uuid,
    ) -> Result<Vec<MethodParameter>, StoreError>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create a new workflow instance
    async fn create_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Get a workflow instance by id
    async fn workflow_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Update a workflow instance (etag checked)
    async fn update_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError>;

    /// Find or create the activity instance for the template's identity tuple
    ///
    /// The identity is `(workflow_instance_id, activity_version_id, position,
    /// iteration)`; re-running the same logical step must resolve to the same
    /// row, never create a duplicate. Returns the row and whether it was
    /// created by this call.
    async fn find_or_create_activity_instance(
        &self,
        template: &ActivityInstance,
    ) -> Result<(ActivityInstance, bool), StoreError>;

    /// Get an activity instance by id
    async fn activity_instance(&self, id: Uuid) -> Result<Option<ActivityInstance>, StoreError>;

    /// Update an activity instance (etag checked)
    async fn update_activity_instance(
        &self,
        instance: &ActivityInstance,
    ) -> Result<ActivityInstance, StoreError>;

    /// List all activity instances of a workflow instance
    async fn activity_instances_for(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<ActivityInstance>, StoreError>;

    // =========================================================================
    // Summary Operations
    // =========================================================================

    /// Create or update the denormalized summary row for an instance
    ///
    /// "Already exists" is success-then-update, never a hard failure.
    async fn create_or_update_summary(&self, summary: &WorkflowSummary)
        -> Result<(), StoreError>;

    /// Get the summary of a workflow instance
    async fn workflow_summary(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError>;

    // =========================================================================
    // Semaphore Operations
    // =========================================================================

    /// Get the persisted state of a named resource
    async fn semaphore(&self, resource_id: &str) -> Result<Option<SemaphoreRecord>, StoreError>;

    /// Compare-and-swap upsert of a semaphore record
    ///
    /// Creates the row when the record's etag is empty; otherwise the etag is
    /// checked, so concurrent raises/lowers of the same resource serialize
    /// through conflict retries.
    async fn upsert_semaphore(
        &self,
        record: &SemaphoreRecord,
    ) -> Result<SemaphoreRecord, StoreError>;

    // =========================================================================
    // Test Isolation
    // =========================================================================

    /// Delete everything. Exists only for test isolation.
    async fn delete_all(&self) -> Result<(), StoreError>;
}
