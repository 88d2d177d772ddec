//! PostgreSQL implementation of WorkflowStore
//!
//! Production persistence using PostgreSQL with:
//! - Optimistic concurrency control via etag columns
//! - Identity-tuple uniqueness enforced by the database
//! - A schema/compatibility guard run before first use

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;
use waymark_model::{
    ActivityForm, ActivityInstance, ActivityInstanceState, ActivityKind, ActivityVersion,
    FailUrgency, FailureCategory, MethodParameter, Position, SemaphoreRecord, Transition,
    WorkflowForm, WorkflowInstance, WorkflowInstanceState, WorkflowSummary, WorkflowVersion,
};

use super::store::{new_etag, StoreError, WorkflowStore};

/// Schema version this engine build expects.
///
/// A store carrying a newer version than this is fatal (the engine is too
/// old); an older version triggers an idempotent upgrade.
pub const SCHEMA_VERSION: i32 = 1;

/// PostgreSQL implementation of WorkflowStore
///
/// # Example
///
/// ```ignore
/// use waymark_engine::PostgresWorkflowStore;
///
/// let store = PostgresWorkflowStore::connect("postgres://localhost/waymark").await?;
/// ```
#[derive(Clone)]
pub struct PostgresWorkflowStore {
    pool: PgPool,
}

impl PostgresWorkflowStore {
    /// Wrap an existing pool. The schema guard must have run already; prefer
    /// [`connect`](Self::connect) unless the pool is shared.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and run the schema/compatibility guard.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Self::ensure_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Compare the engine's expected schema version against the stored one.
    ///
    /// Engine older than the store is fatal; engine newer runs the
    /// idempotent upgrade DDL and records the new version.
    pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS waymark_schema_info (
                id INT PRIMARY KEY,
                version INT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let stored: Option<i32> = sqlx::query("SELECT version FROM waymark_schema_info WHERE id = 1")
            .fetch_optional(pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?
            .map(|row| row.get("version"));

        match stored {
            Some(version) if version > SCHEMA_VERSION => {
                error!(
                    stored = version,
                    engine = SCHEMA_VERSION,
                    "store schema is newer than this engine build"
                );
                Err(StoreError::SchemaMismatch {
                    engine: SCHEMA_VERSION,
                    stored: version,
                })
            }
            Some(version) if version == SCHEMA_VERSION => Ok(()),
            _ => {
                info!(
                    stored = stored.unwrap_or(0),
                    engine = SCHEMA_VERSION,
                    "upgrading store schema"
                );
                Self::apply_schema(pool).await?;
                sqlx::query(
                    r#"
                    INSERT INTO waymark_schema_info (id, version) VALUES (1, $1)
                    ON CONFLICT (id) DO UPDATE SET version = EXCLUDED.version
                    "#,
                )
                .bind(SCHEMA_VERSION)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
                Ok(())
            }
        }
    }

    async fn apply_schema(pool: &PgPool) -> Result<(), StoreError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS waymark_workflow_forms (
                id UUID PRIMARY KEY,
                capability_name TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                etag TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_workflow_versions (
                id UUID PRIMARY KEY,
                workflow_form_id UUID NOT NULL REFERENCES waymark_workflow_forms (id),
                major_version INT NOT NULL,
                minor_version INT NOT NULL,
                dynamic_create BOOLEAN NOT NULL,
                etag TEXT NOT NULL,
                UNIQUE (workflow_form_id, major_version)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_activity_forms (
                id UUID PRIMARY KEY,
                kind TEXT NOT NULL,
                title TEXT NOT NULL,
                etag TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_activity_versions (
                id UUID PRIMARY KEY,
                workflow_version_id UUID NOT NULL REFERENCES waymark_workflow_versions (id),
                activity_form_id UUID NOT NULL REFERENCES waymark_activity_forms (id),
                position TEXT NOT NULL,
                parent_activity_version_id UUID,
                fail_urgency TEXT NOT NULL,
                etag TEXT NOT NULL,
                UNIQUE (workflow_version_id, activity_form_id, position)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_transitions (
                id UUID PRIMARY KEY,
                workflow_version_id UUID NOT NULL REFERENCES waymark_workflow_versions (id),
                from_activity_version_id UUID,
                to_activity_version_id UUID NOT NULL,
                etag TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_method_parameters (
                id UUID PRIMARY KEY,
                owner_version_id UUID NOT NULL,
                name TEXT NOT NULL,
                data_type TEXT NOT NULL,
                etag TEXT NOT NULL,
                UNIQUE (owner_version_id, name)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_workflow_instances (
                id UUID PRIMARY KEY,
                workflow_version_id UUID NOT NULL REFERENCES waymark_workflow_versions (id),
                title TEXT NOT NULL,
                state TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                cancelled_at TIMESTAMPTZ,
                parameters JSONB NOT NULL DEFAULT '{}'::jsonb,
                result JSONB,
                exception_technical_message TEXT,
                exception_friendly_message TEXT,
                etag TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_activity_instances (
                id UUID PRIMARY KEY,
                workflow_instance_id UUID NOT NULL REFERENCES waymark_workflow_instances (id),
                activity_version_id UUID NOT NULL REFERENCES waymark_activity_versions (id),
                position TEXT NOT NULL,
                iteration INT NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                started_at TIMESTAMPTZ NOT NULL,
                finished_at TIMESTAMPTZ,
                result JSONB,
                context JSONB,
                async_request_id UUID,
                exception_category TEXT,
                exception_technical_message TEXT,
                exception_friendly_message TEXT,
                attempts INT NOT NULL DEFAULT 1,
                etag TEXT NOT NULL,
                UNIQUE (workflow_instance_id, activity_version_id, position, iteration)
            )
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_waymark_activity_instances_workflow
            ON waymark_activity_instances (workflow_instance_id)
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_workflow_summaries (
                workflow_instance_id UUID PRIMARY KEY,
                summary JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS waymark_semaphores (
                resource_id TEXT PRIMARY KEY,
                capacity INT NOT NULL,
                holders JSONB NOT NULL DEFAULT '[]'::jsonb,
                waiters JSONB NOT NULL DEFAULT '[]'::jsonb,
                etag TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        }
        Ok(())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn ser_err(e: serde_json::Error) -> StoreError {
    StoreError::Serialization(e.to_string())
}

fn parse_position(s: &str) -> Result<Position, StoreError> {
    Position::parse(s).ok_or_else(|| StoreError::Serialization(format!("invalid position '{s}'")))
}

fn kind_to_str(kind: ActivityKind) -> String {
    kind.to_string()
}

fn parse_kind(s: &str) -> Result<ActivityKind, StoreError> {
    serde_json::from_value(serde_json::Value::String(s.to_string()))
        .map_err(|_| StoreError::Serialization(format!("unknown activity kind '{s}'")))
}

fn urgency_to_str(urgency: FailUrgency) -> &'static str {
    match urgency {
        FailUrgency::Stopping => "stopping",
        FailUrgency::CancelWorkflow => "cancel_workflow",
    }
}

fn parse_urgency(s: &str) -> Result<FailUrgency, StoreError> {
    match s {
        "stopping" => Ok(FailUrgency::Stopping),
        "cancel_workflow" => Ok(FailUrgency::CancelWorkflow),
        other => Err(StoreError::Serialization(format!(
            "unknown fail urgency '{other}'"
        ))),
    }
}

fn parse_workflow_state(s: &str) -> Result<WorkflowInstanceState, StoreError> {
    match s {
        "executing" => Ok(WorkflowInstanceState::Executing),
        "waiting" => Ok(WorkflowInstanceState::Waiting),
        "halting" => Ok(WorkflowInstanceState::Halting),
        "halted" => Ok(WorkflowInstanceState::Halted),
        "success" => Ok(WorkflowInstanceState::Success),
        "failed" => Ok(WorkflowInstanceState::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown workflow state '{other}'"
        ))),
    }
}

fn parse_activity_state(s: &str) -> Result<ActivityInstanceState, StoreError> {
    match s {
        "executing" => Ok(ActivityInstanceState::Executing),
        "waiting" => Ok(ActivityInstanceState::Waiting),
        "success" => Ok(ActivityInstanceState::Success),
        "failed" => Ok(ActivityInstanceState::Failed),
        other => Err(StoreError::Serialization(format!(
            "unknown activity state '{other}'"
        ))),
    }
}

fn parse_category(s: &str) -> Result<FailureCategory, StoreError> {
    match s {
        "technical" => Ok(FailureCategory::Technical),
        "business" => Ok(FailureCategory::Business),
        "workflow_capability" => Ok(FailureCategory::WorkflowCapability),
        "max_time_reached" => Ok(FailureCategory::MaxTimeReached),
        other => Err(StoreError::Serialization(format!(
            "unknown failure category '{other}'"
        ))),
    }
}

fn workflow_instance_from_row(row: &sqlx::postgres::PgRow) -> Result<WorkflowInstance, StoreError> {
    let state: String = row.get("state");
    let parameters: serde_json::Value = row.get("parameters");
    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow_version_id: row.get("workflow_version_id"),
        title: row.get("title"),
        state: parse_workflow_state(&state)?,
        started_at: row.get::<DateTime<Utc>, _>("started_at"),
        finished_at: row.get("finished_at"),
        cancelled_at: row.get("cancelled_at"),
        parameters: serde_json::from_value(parameters).map_err(ser_err)?,
        result_as_json: row.get("result"),
        exception_technical_message: row.get("exception_technical_message"),
        exception_friendly_message: row.get("exception_friendly_message"),
        etag: row.get("etag"),
    })
}

fn activity_instance_from_row(row: &sqlx::postgres::PgRow) -> Result<ActivityInstance, StoreError> {
    let state: String = row.get("state");
    let position: String = row.get("position");
    let category: Option<String> = row.get("exception_category");
    Ok(ActivityInstance {
        id: row.get("id"),
        workflow_instance_id: row.get("workflow_instance_id"),
        activity_version_id: row.get("activity_version_id"),
        position: parse_position(&position)?,
        iteration: row.get::<i32, _>("iteration") as u32,
        state: parse_activity_state(&state)?,
        started_at: row.get::<DateTime<Utc>, _>("started_at"),
        finished_at: row.get("finished_at"),
        result_as_json: row.get("result"),
        context_as_json: row.get("context"),
        async_request_id: row.get("async_request_id"),
        exception_category: category.as_deref().map(parse_category).transpose()?,
        exception_technical_message: row.get("exception_technical_message"),
        exception_friendly_message: row.get("exception_friendly_message"),
        attempts: row.get::<i32, _>("attempts") as u32,
        etag: row.get("etag"),
    })
}

fn activity_version_from_row(row: &sqlx::postgres::PgRow) -> Result<ActivityVersion, StoreError> {
    let position: String = row.get("position");
    let urgency: String = row.get("fail_urgency");
    Ok(ActivityVersion {
        id: row.get("id"),
        workflow_version_id: row.get("workflow_version_id"),
        activity_form_id: row.get("activity_form_id"),
        position: parse_position(&position)?,
        parent_activity_version_id: row.get("parent_activity_version_id"),
        fail_urgency: parse_urgency(&urgency)?,
        etag: row.get("etag"),
    })
}

#[async_trait]
impl WorkflowStore for PostgresWorkflowStore {
    #[instrument(skip(self))]
    async fn workflow_form(&self, id: Uuid) -> Result<Option<WorkflowForm>, StoreError> {
        let row = sqlx::query(
            "SELECT id, capability_name, title, etag FROM waymark_workflow_forms WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| WorkflowForm {
            id: row.get("id"),
            capability_name: row.get("capability_name"),
            title: row.get("title"),
            etag: row.get("etag"),
        }))
    }

    #[instrument(skip(self, form))]
    async fn upsert_workflow_form(&self, form: &WorkflowForm) -> Result<WorkflowForm, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_workflow_forms (id, capability_name, title, etag)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET capability_name = EXCLUDED.capability_name,
                title = EXCLUDED.title,
                etag = EXCLUDED.etag
            "#,
        )
        .bind(form.id)
        .bind(&form.capability_name)
        .bind(&form.title)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stored = form.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn workflow_version(&self, id: Uuid) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_form_id, major_version, minor_version, dynamic_create, etag
            FROM waymark_workflow_versions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| WorkflowVersion {
            id: row.get("id"),
            workflow_form_id: row.get("workflow_form_id"),
            major_version: row.get::<i32, _>("major_version") as u32,
            minor_version: row.get::<i32, _>("minor_version") as u32,
            dynamic_create: row.get("dynamic_create"),
            etag: row.get("etag"),
        }))
    }

    #[instrument(skip(self))]
    async fn find_workflow_version(
        &self,
        workflow_form_id: Uuid,
        major_version: u32,
    ) -> Result<Option<WorkflowVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_form_id, major_version, minor_version, dynamic_create, etag
            FROM waymark_workflow_versions
            WHERE workflow_form_id = $1 AND major_version = $2
            "#,
        )
        .bind(workflow_form_id)
        .bind(major_version as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.map(|row| WorkflowVersion {
            id: row.get("id"),
            workflow_form_id: row.get("workflow_form_id"),
            major_version: row.get::<i32, _>("major_version") as u32,
            minor_version: row.get::<i32, _>("minor_version") as u32,
            dynamic_create: row.get("dynamic_create"),
            etag: row.get("etag"),
        }))
    }

    #[instrument(skip(self, version))]
    async fn upsert_workflow_version(
        &self,
        version: &WorkflowVersion,
    ) -> Result<WorkflowVersion, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_workflow_versions
                (id, workflow_form_id, major_version, minor_version, dynamic_create, etag)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (workflow_form_id, major_version) DO UPDATE
            SET minor_version = EXCLUDED.minor_version,
                dynamic_create = EXCLUDED.dynamic_create,
                etag = EXCLUDED.etag
            "#,
        )
        .bind(version.id)
        .bind(version.workflow_form_id)
        .bind(version.major_version as i32)
        .bind(version.minor_version as i32)
        .bind(version.dynamic_create)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        // The conflict target may have kept an earlier row id.
        self.find_workflow_version(version.workflow_form_id, version.major_version)
            .await?
            .ok_or(StoreError::NotFound {
                entity: "workflow version",
                id: version.id.to_string(),
            })
    }

    #[instrument(skip(self))]
    async fn activity_form(&self, id: Uuid) -> Result<Option<ActivityForm>, StoreError> {
        let row = sqlx::query("SELECT id, kind, title, etag FROM waymark_activity_forms WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| {
            let kind: String = row.get("kind");
            Ok(ActivityForm {
                id: row.get("id"),
                kind: parse_kind(&kind)?,
                title: row.get("title"),
                etag: row.get("etag"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, form))]
    async fn upsert_activity_form(&self, form: &ActivityForm) -> Result<ActivityForm, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_activity_forms (id, kind, title, etag)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET kind = EXCLUDED.kind, title = EXCLUDED.title, etag = EXCLUDED.etag
            "#,
        )
        .bind(form.id)
        .bind(kind_to_str(form.kind))
        .bind(&form.title)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stored = form.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn activity_version(&self, id: Uuid) -> Result<Option<ActivityVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, activity_form_id, position,
                   parent_activity_version_id, fail_urgency, etag
            FROM waymark_activity_versions WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| activity_version_from_row(&row)).transpose()
    }

    #[instrument(skip(self, position))]
    async fn find_activity_version(
        &self,
        workflow_version_id: Uuid,
        activity_form_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, activity_form_id, position,
                   parent_activity_version_id, fail_urgency, etag
            FROM waymark_activity_versions
            WHERE workflow_version_id = $1 AND activity_form_id = $2 AND position = $3
            "#,
        )
        .bind(workflow_version_id)
        .bind(activity_form_id)
        .bind(position.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| activity_version_from_row(&row)).transpose()
    }

    #[instrument(skip(self, position))]
    async fn activity_version_at(
        &self,
        workflow_version_id: Uuid,
        position: &Position,
    ) -> Result<Option<ActivityVersion>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, workflow_version_id, activity_form_id, position,
                   parent_activity_version_id, fail_urgency, etag
            FROM waymark_activity_versions
            WHERE workflow_version_id = $1 AND position = $2
            "#,
        )
        .bind(workflow_version_id)
        .bind(position.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| activity_version_from_row(&row)).transpose()
    }

    #[instrument(skip(self, version))]
    async fn upsert_activity_version(
        &self,
        version: &ActivityVersion,
    ) -> Result<ActivityVersion, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_activity_versions
                (id, workflow_version_id, activity_form_id, position,
                 parent_activity_version_id, fail_urgency, etag)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (workflow_version_id, activity_form_id, position) DO UPDATE
            SET parent_activity_version_id = EXCLUDED.parent_activity_version_id,
                fail_urgency = EXCLUDED.fail_urgency,
                etag = EXCLUDED.etag
            "#,
        )
        .bind(version.id)
        .bind(version.workflow_version_id)
        .bind(version.activity_form_id)
        .bind(version.position.as_str())
        .bind(version.parent_activity_version_id)
        .bind(urgency_to_str(version.fail_urgency))
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        self.find_activity_version(
            version.workflow_version_id,
            version.activity_form_id,
            &version.position,
        )
        .await?
        .ok_or(StoreError::NotFound {
            entity: "activity version",
            id: version.id.to_string(),
        })
    }

    #[instrument(skip(self, transition))]
    async fn create_transition(&self, transition: &Transition) -> Result<Transition, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_transitions
                (id, workflow_version_id, from_activity_version_id, to_activity_version_id, etag)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(transition.id)
        .bind(transition.workflow_version_id)
        .bind(transition.from_activity_version_id)
        .bind(transition.to_activity_version_id)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stored = transition.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn transitions_for_version(
        &self,
        workflow_version_id: Uuid,
    ) -> Result<Vec<Transition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_version_id, from_activity_version_id, to_activity_version_id, etag
            FROM waymark_transitions WHERE workflow_version_id = $1
            "#,
        )
        .bind(workflow_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| Transition {
                id: row.get("id"),
                workflow_version_id: row.get("workflow_version_id"),
                from_activity_version_id: row.get("from_activity_version_id"),
                to_activity_version_id: row.get("to_activity_version_id"),
                etag: row.get("etag"),
            })
            .collect())
    }

    #[instrument(skip(self, parameter))]
    async fn upsert_method_parameter(
        &self,
        parameter: &MethodParameter,
    ) -> Result<MethodParameter, StoreError> {
        let etag = new_etag();
        sqlx::query(
            r#"
            INSERT INTO waymark_method_parameters (id, owner_version_id, name, data_type, etag)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (owner_version_id, name) DO UPDATE
            SET data_type = EXCLUDED.data_type, etag = EXCLUDED.etag
            "#,
        )
        .bind(parameter.id)
        .bind(parameter.owner_version_id)
        .bind(&parameter.name)
        .bind(&parameter.data_type)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let mut stored = parameter.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn method_parameters_for(
        &self,
        owner_version_id: Uuid,
    ) -> Result<Vec<MethodParameter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner_version_id, name, data_type, etag
            FROM waymark_method_parameters WHERE owner_version_id = $1
            ORDER BY name
            "#,
        )
        .bind(owner_version_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(rows
            .into_iter()
            .map(|row| MethodParameter {
                id: row.get("id"),
                owner_version_id: row.get("owner_version_id"),
                name: row.get("name"),
                data_type: row.get("data_type"),
                etag: row.get("etag"),
            })
            .collect())
    }

    #[instrument(skip(self, instance))]
    async fn create_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let etag = new_etag();
        let parameters = serde_json::to_value(&instance.parameters).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT INTO waymark_workflow_instances
                (id, workflow_version_id, title, state, started_at, finished_at, cancelled_at,
                 parameters, result, exception_technical_message, exception_friendly_message, etag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(instance.id)
        .bind(instance.workflow_version_id)
        .bind(&instance.title)
        .bind(instance.state.to_string())
        .bind(instance.started_at)
        .bind(instance.finished_at)
        .bind(instance.cancelled_at)
        .bind(&parameters)
        .bind(&instance.result_as_json)
        .bind(&instance.exception_technical_message)
        .bind(&instance.exception_friendly_message)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("failed to create workflow instance: {e}");
            db_err(e)
        })?;

        debug!(instance_id = %instance.id, "created workflow instance");
        let mut stored = instance.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn workflow_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM waymark_workflow_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| workflow_instance_from_row(&row)).transpose()
    }

    #[instrument(skip(self, instance))]
    async fn update_workflow_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let etag = new_etag();
        let parameters = serde_json::to_value(&instance.parameters).map_err(ser_err)?;
        let result = sqlx::query(
            r#"
            UPDATE waymark_workflow_instances
            SET title = $3, state = $4, started_at = $5, finished_at = $6, cancelled_at = $7,
                parameters = $8, result = $9, exception_technical_message = $10,
                exception_friendly_message = $11, etag = $12
            WHERE id = $1 AND etag = $2
            "#,
        )
        .bind(instance.id)
        .bind(&instance.etag)
        .bind(&instance.title)
        .bind(instance.state.to_string())
        .bind(instance.started_at)
        .bind(instance.finished_at)
        .bind(instance.cancelled_at)
        .bind(&parameters)
        .bind(&instance.result_as_json)
        .bind(&instance.exception_technical_message)
        .bind(&instance.exception_friendly_message)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return if self.workflow_instance(instance.id).await?.is_some() {
                Err(StoreError::ConcurrencyConflict {
                    entity: "workflow instance",
                    id: instance.id.to_string(),
                })
            } else {
                Err(StoreError::NotFound {
                    entity: "workflow instance",
                    id: instance.id.to_string(),
                })
            };
        }

        let mut stored = instance.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self, template))]
    async fn find_or_create_activity_instance(
        &self,
        template: &ActivityInstance,
    ) -> Result<(ActivityInstance, bool), StoreError> {
        let etag = new_etag();
        let inserted = sqlx::query(
            r#"
            INSERT INTO waymark_activity_instances
                (id, workflow_instance_id, activity_version_id, position, iteration, state,
                 started_at, finished_at, result, context, async_request_id,
                 exception_category, exception_technical_message, exception_friendly_message,
                 attempts, etag)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (workflow_instance_id, activity_version_id, position, iteration)
            DO NOTHING
            "#,
        )
        .bind(template.id)
        .bind(template.workflow_instance_id)
        .bind(template.activity_version_id)
        .bind(template.position.as_str())
        .bind(template.iteration as i32)
        .bind(template.state.to_string())
        .bind(template.started_at)
        .bind(template.finished_at)
        .bind(&template.result_as_json)
        .bind(&template.context_as_json)
        .bind(template.async_request_id)
        .bind(template.exception_category.map(|c| c.to_string()))
        .bind(&template.exception_technical_message)
        .bind(&template.exception_friendly_message)
        .bind(template.attempts as i32)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        let created = inserted.rows_affected() > 0;
        if created {
            let mut stored = template.clone();
            stored.etag = etag;
            return Ok((stored, true));
        }

        let row = sqlx::query(
            r#"
            SELECT * FROM waymark_activity_instances
            WHERE workflow_instance_id = $1 AND activity_version_id = $2
              AND position = $3 AND iteration = $4
            "#,
        )
        .bind(template.workflow_instance_id)
        .bind(template.activity_version_id)
        .bind(template.position.as_str())
        .bind(template.iteration as i32)
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok((activity_instance_from_row(&row)?, false))
    }

    #[instrument(skip(self))]
    async fn activity_instance(&self, id: Uuid) -> Result<Option<ActivityInstance>, StoreError> {
        let row = sqlx::query("SELECT * FROM waymark_activity_instances WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        row.map(|row| activity_instance_from_row(&row)).transpose()
    }

    #[instrument(skip(self, instance))]
    async fn update_activity_instance(
        &self,
        instance: &ActivityInstance,
    ) -> Result<ActivityInstance, StoreError> {
        let etag = new_etag();
        let result = sqlx::query(
            r#"
            UPDATE waymark_activity_instances
            SET state = $3, finished_at = $4, result = $5, context = $6, async_request_id = $7,
                exception_category = $8, exception_technical_message = $9,
                exception_friendly_message = $10, attempts = $11, etag = $12
            WHERE id = $1 AND etag = $2
            "#,
        )
        .bind(instance.id)
        .bind(&instance.etag)
        .bind(instance.state.to_string())
        .bind(instance.finished_at)
        .bind(&instance.result_as_json)
        .bind(&instance.context_as_json)
        .bind(instance.async_request_id)
        .bind(instance.exception_category.map(|c| c.to_string()))
        .bind(&instance.exception_technical_message)
        .bind(&instance.exception_friendly_message)
        .bind(instance.attempts as i32)
        .bind(&etag)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return if self.activity_instance(instance.id).await?.is_some() {
                Err(StoreError::ConcurrencyConflict {
                    entity: "activity instance",
                    id: instance.id.to_string(),
                })
            } else {
                Err(StoreError::NotFound {
                    entity: "activity instance",
                    id: instance.id.to_string(),
                })
            };
        }

        let mut stored = instance.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn activity_instances_for(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Vec<ActivityInstance>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM waymark_activity_instances
            WHERE workflow_instance_id = $1
            ORDER BY position, iteration
            "#,
        )
        .bind(workflow_instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter().map(activity_instance_from_row).collect()
    }

    #[instrument(skip(self, summary))]
    async fn create_or_update_summary(
        &self,
        summary: &WorkflowSummary,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_value(summary).map_err(ser_err)?;
        sqlx::query(
            r#"
            INSERT INTO waymark_workflow_summaries (workflow_instance_id, summary)
            VALUES ($1, $2)
            ON CONFLICT (workflow_instance_id) DO UPDATE SET summary = EXCLUDED.summary
            "#,
        )
        .bind(summary.instance.id)
        .bind(&json)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn workflow_summary(
        &self,
        workflow_instance_id: Uuid,
    ) -> Result<Option<WorkflowSummary>, StoreError> {
        let row = sqlx::query(
            "SELECT summary FROM waymark_workflow_summaries WHERE workflow_instance_id = $1",
        )
        .bind(workflow_instance_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            let json: serde_json::Value = row.get("summary");
            serde_json::from_value(json).map_err(ser_err)
        })
        .transpose()
    }

    #[instrument(skip(self))]
    async fn semaphore(&self, resource_id: &str) -> Result<Option<SemaphoreRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT resource_id, capacity, holders, waiters, etag FROM waymark_semaphores WHERE resource_id = $1",
        )
        .bind(resource_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_err)?;

        row.map(|row| {
            let holders: serde_json::Value = row.get("holders");
            let waiters: serde_json::Value = row.get("waiters");
            Ok(SemaphoreRecord {
                resource_id: row.get("resource_id"),
                capacity: row.get::<i32, _>("capacity") as u32,
                holders: serde_json::from_value(holders).map_err(ser_err)?,
                waiters: serde_json::from_value(waiters).map_err(ser_err)?,
                etag: row.get("etag"),
            })
        })
        .transpose()
    }

    #[instrument(skip(self, record))]
    async fn upsert_semaphore(
        &self,
        record: &SemaphoreRecord,
    ) -> Result<SemaphoreRecord, StoreError> {
        let etag = new_etag();
        let holders = serde_json::to_value(&record.holders).map_err(ser_err)?;
        let waiters = serde_json::to_value(&record.waiters).map_err(ser_err)?;

        let result = if record.etag.is_empty() {
            sqlx::query(
                r#"
                INSERT INTO waymark_semaphores (resource_id, capacity, holders, waiters, etag)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (resource_id) DO NOTHING
                "#,
            )
            .bind(&record.resource_id)
            .bind(record.capacity as i32)
            .bind(&holders)
            .bind(&waiters)
            .bind(&etag)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
        } else {
            sqlx::query(
                r#"
                UPDATE waymark_semaphores
                SET capacity = $3, holders = $4, waiters = $5, etag = $6
                WHERE resource_id = $1 AND etag = $2
                "#,
            )
            .bind(&record.resource_id)
            .bind(&record.etag)
            .bind(record.capacity as i32)
            .bind(&holders)
            .bind(&waiters)
            .bind(&etag)
            .execute(&self.pool)
            .await
            .map_err(db_err)?
        };

        if result.rows_affected() == 0 {
            return Err(StoreError::ConcurrencyConflict {
                entity: "semaphore",
                id: record.resource_id.clone(),
            });
        }

        let mut stored = record.clone();
        stored.etag = etag;
        Ok(stored)
    }

    #[instrument(skip(self))]
    async fn delete_all(&self) -> Result<(), StoreError> {
        // Reverse dependency order.
        for table in [
            "waymark_workflow_summaries",
            "waymark_semaphores",
            "waymark_activity_instances",
            "waymark_workflow_instances",
            "waymark_method_parameters",
            "waymark_transitions",
            "waymark_activity_versions",
            "waymark_activity_forms",
            "waymark_workflow_versions",
            "waymark_workflow_forms",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&self.pool)
                .await
                .map_err(db_err)?;
        }
        Ok(())
    }
}
