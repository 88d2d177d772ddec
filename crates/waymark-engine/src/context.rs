//! Execution context threaded through every activity call
//!
//! The context is an explicit value, never ambient state: it carries the
//! workflow instance, the tick deadline, the asynchronous-mode flag and the
//! position cursor, so concurrent ticks of different instances cannot
//! cross-contaminate.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use waymark_model::{Position, WorkflowForm, WorkflowInstance, WorkflowVersion};

use crate::bridge::{AsyncRequestService, HttpSender};
use crate::engine::executor::EngineConfig;
use crate::outcome::ActivityFailure;
use crate::persistence::WorkflowStore;
use crate::semaphore::SemaphoreCoordinator;

/// Services and per-tick facts shared by every context in one tick.
pub(crate) struct ContextInner {
    pub instance: WorkflowInstance,
    pub form: WorkflowForm,
    pub version: WorkflowVersion,
    pub store: Arc<dyn WorkflowStore>,
    pub async_requests: Option<Arc<dyn AsyncRequestService>>,
    pub http: Arc<dyn HttpSender>,
    pub semaphores: SemaphoreCoordinator,

    /// Whether the workflow was woken by a message rather than a caller
    /// blocking on a response. Outbound calls are redirected through the
    /// async request service when set.
    pub asynchronous: bool,

    /// Point in time after which no new activity body may start.
    pub deadline: Option<Instant>,

    pub cancel: CancellationToken,
    pub config: EngineConfig,
}

/// Handle workflow code uses to create activities.
///
/// Each context addresses one level of the activity tree: top-level workflow
/// code gets the root context, and every activity body gets a child context
/// whose base is the activity's own position. Creating activities in the
/// same order on every tick is the determinism contract that makes replay
/// find the same rows.
pub struct WorkflowContext {
    pub(crate) inner: Arc<ContextInner>,
    base: Position,
    iteration: u32,
    cursor: AtomicU32,
}

impl WorkflowContext {
    pub(crate) fn root(inner: Arc<ContextInner>) -> Self {
        Self {
            inner,
            base: Position::root(),
            iteration: 0,
            cursor: AtomicU32::new(0),
        }
    }

    /// Child context for the activity at `base`, inheriting the current
    /// iteration.
    pub(crate) fn child(&self, base: Position) -> Self {
        Self {
            inner: self.inner.clone(),
            base,
            iteration: self.iteration,
            cursor: AtomicU32::new(0),
        }
    }

    /// Sibling context with the same base but a different iteration number,
    /// used by loops and fan-outs so every activity the body creates carries
    /// the iteration in its identity.
    pub(crate) fn with_iteration(&self, iteration: u32) -> Self {
        Self {
            inner: self.inner.clone(),
            base: self.base.clone(),
            iteration,
            cursor: AtomicU32::new(0),
        }
    }

    /// Allocate the next child position at this level.
    pub(crate) fn next_position(&self) -> Position {
        let ordinal = self.cursor.fetch_add(1, Ordering::Relaxed) + 1;
        self.base.child(ordinal)
    }

    pub fn workflow_instance_id(&self) -> Uuid {
        self.inner.instance.id
    }

    pub fn workflow_version(&self) -> &WorkflowVersion {
        &self.inner.version
    }

    pub fn workflow_form(&self) -> &WorkflowForm {
        &self.inner.form
    }

    /// Input parameters the instance was started with.
    pub fn parameters(&self) -> &BTreeMap<String, Value> {
        &self.inner.instance.parameters
    }

    /// Deserialize a named input parameter to the expected type.
    pub fn parameter<T: DeserializeOwned>(&self, name: &str) -> Result<T, ActivityFailure> {
        let value = self.parameters().get(name).ok_or_else(|| {
            ActivityFailure::capability(format!("missing workflow parameter '{name}'"))
        })?;
        serde_json::from_value(value.clone()).map_err(|e| {
            ActivityFailure::capability(format!("workflow parameter '{name}' has wrong type: {e}"))
        })
    }

    /// Whether the workflow runs in fire-and-forget mode (woken by a
    /// message); outbound calls are then redirected asynchronously.
    pub fn is_asynchronous(&self) -> bool {
        self.inner.asynchronous
    }

    /// Iteration number this context executes under (0 outside loops).
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// Whether the tick must stop creating work: the cancellation signal
    /// fired or the run-time budget is spent.
    pub(crate) fn out_of_time(&self) -> bool {
        if self.inner.cancel.is_cancelled() {
            return true;
        }
        match self.inner.deadline {
            Some(deadline) => Instant::now() >= deadline,
            None => false,
        }
    }
}
