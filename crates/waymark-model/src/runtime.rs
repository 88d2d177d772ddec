//! Runtime entities: what the engine creates and advances on every tick.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::position::Position;

/// State of one workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowInstanceState {
    /// A tick is (or should be) running the workflow's code.
    Executing,

    /// Postponed; waiting for an external event or a timer before the next
    /// tick can make progress.
    Waiting,

    /// An external halt was requested; the next tick will finish it.
    Halting,

    /// Halted on request; requires external intervention to resume.
    Halted,

    /// Completed successfully.
    Success,

    /// Failed (possibly cancelled; see `cancelled_at`).
    Failed,
}

impl WorkflowInstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for WorkflowInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Waiting => write!(f, "waiting"),
            Self::Halting => write!(f, "halting"),
            Self::Halted => write!(f, "halted"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One execution of a workflow version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow_version_id: Uuid,
    pub title: String,
    pub state: WorkflowInstanceState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,

    /// Input parameters the instance was started with.
    pub parameters: BTreeMap<String, Value>,

    /// Final result once the instance reaches `Success`.
    pub result_as_json: Option<Value>,

    pub exception_technical_message: Option<String>,
    pub exception_friendly_message: Option<String>,

    pub etag: String,
}

impl WorkflowInstance {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// State of one activity instance.
///
/// Instances only move forward: `Executing -> {Success | Failed | Waiting}`.
/// `Waiting -> Executing` happens only through an explicit resume or retry,
/// never by replay alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityInstanceState {
    Executing,
    Waiting,
    Success,
    Failed,
}

impl ActivityInstanceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for ActivityInstanceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Executing => write!(f, "executing"),
            Self::Waiting => write!(f, "waiting"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Category of an activity failure.
///
/// `WorkflowCapability` is reserved for engine-internal faults (a storage
/// read failing unexpectedly) so they are never confused with a business
/// failure of the workflow being run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Technical,
    Business,
    WorkflowCapability,
    MaxTimeReached,
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Technical => write!(f, "technical"),
            Self::Business => write!(f, "business"),
            Self::WorkflowCapability => write!(f, "workflow_capability"),
            Self::MaxTimeReached => write!(f, "max_time_reached"),
        }
    }
}

/// The identity under which an activity instance is found or created.
///
/// Re-running the same logical step must resolve to the same row, never
/// create a duplicate; this tuple is the uniqueness key that guarantees it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActivityInstanceKey {
    pub workflow_instance_id: Uuid,
    pub activity_version_id: Uuid,
    pub position: Position,

    /// Iteration number for loop/fan-out children; 0 when not iterated.
    pub iteration: u32,
}

/// One execution of an activity version inside a specific workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityInstance {
    pub id: Uuid,
    pub workflow_instance_id: Uuid,
    pub activity_version_id: Uuid,
    pub position: Position,
    pub iteration: u32,
    pub state: ActivityInstanceState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Memoized result, present once the instance reaches `Success`.
    pub result_as_json: Option<Value>,

    /// Per-activity bookkeeping (sleep wake time, outbound request list).
    pub context_as_json: Option<Value>,

    /// Async request the instance is suspended on, when waiting for one.
    pub async_request_id: Option<Uuid>,

    pub exception_category: Option<FailureCategory>,
    pub exception_technical_message: Option<String>,
    pub exception_friendly_message: Option<String>,

    /// How many times the body has been attempted (retries increment this).
    pub attempts: u32,

    pub etag: String,
}

impl ActivityInstance {
    pub fn key(&self) -> ActivityInstanceKey {
        ActivityInstanceKey {
            workflow_instance_id: self.workflow_instance_id,
            activity_version_id: self.activity_version_id,
            position: self.position.clone(),
            iteration: self.iteration,
        }
    }
}

/// Per-instance container mapping a parallel job index to its JSON result.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobResults {
    results: BTreeMap<u32, Value>,
}

impl JobResults {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Serialize>(&mut self, job_index: u32, value: &T) -> Result<(), serde_json::Error> {
        self.results.insert(job_index, serde_json::to_value(value)?);
        Ok(())
    }

    pub fn insert_json(&mut self, job_index: u32, value: Value) {
        self.results.insert(job_index, value);
    }

    /// Deserialize the result of job `job_index` to the expected type.
    pub fn get<T: DeserializeOwned>(&self, job_index: u32) -> Option<Result<T, serde_json::Error>> {
        self.results
            .get(&job_index)
            .map(|v| serde_json::from_value(v.clone()))
    }

    pub fn get_json(&self, job_index: u32) -> Option<&Value> {
        self.results.get(&job_index)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn job_indexes(&self) -> impl Iterator<Item = u32> + '_ {
        self.results.keys().copied()
    }
}

/// A recorded holder of a named resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreHolder {
    /// Stable identity of the holder, usually the raising activity instance.
    pub holder_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub raised_at: DateTime<Utc>,
}

/// A workflow instance queued behind a fully-held resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreWaiter {
    pub holder_id: Uuid,
    pub workflow_instance_id: Uuid,
    pub enqueued_at: DateTime<Utc>,
}

/// Persisted, cross-instance state of a named semaphore (or lock, at
/// capacity 1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemaphoreRecord {
    pub resource_id: String,
    pub capacity: u32,
    pub holders: Vec<SemaphoreHolder>,
    pub waiters: Vec<SemaphoreWaiter>,
    pub etag: String,
}

impl SemaphoreRecord {
    pub fn new(resource_id: impl Into<String>, capacity: u32) -> Self {
        Self {
            resource_id: resource_id.into(),
            capacity: capacity.max(1),
            holders: Vec::new(),
            waiters: Vec::new(),
            etag: String::new(),
        }
    }

    pub fn holds(&self, holder_id: Uuid) -> bool {
        self.holders.iter().any(|h| h.holder_id == holder_id)
    }

    pub fn has_capacity(&self) -> bool {
        (self.holders.len() as u32) < self.capacity
    }
}
