//! Workflow executor: drives one tick of an instance's code
//!
//! The executor creates or loads the `WorkflowInstance`, runs the registered
//! workflow implementation and classifies the outcome into persisted
//! instance state: `Success`, `Waiting` (postponed), or `Failed` (with
//! `cancelled_at` when the failure cancels the instance). It also enforces
//! the run-time budget, serializes ticks per instance, and fires the
//! after-save notification hook on every persisted transition.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use waymark_model::{
    WorkflowForm, WorkflowInstance, WorkflowInstanceState, WorkflowSummary, WorkflowVersion,
};

use super::notify::{InstanceChangeListener, WorkflowInstanceChange};
use super::registry::{
    AnyWorkflowImplementation, RegistryError, WorkflowImplementation, WorkflowRegistry,
};
use crate::bridge::{AsyncRequestService, HttpSender, ReqwestSender};
use crate::context::{ContextInner, WorkflowContext};
use crate::outcome::{ActivityFailure, Outcome, PostponeReason, Postponement};
use crate::persistence::{new_etag, StoreError, WorkflowStore};
use crate::semaphore::{SemaphoreCoordinator, WakeUp};

/// Configuration for the workflow engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Run-time budget of one tick
    pub max_total_run_time: Duration,

    /// Headroom that must remain before the caller's deadline for a tick to
    /// start at all (exiting early beats being killed mid-write)
    pub save_margin: Duration,

    /// Backoff window used for temporary failures that carry no hint
    pub default_retry_backoff: Duration,

    /// Safety bound on loop iterations within one tick
    pub max_loop_iterations: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_total_run_time: Duration::from_secs(60),
            save_margin: Duration::from_secs(2),
            default_retry_backoff: Duration::from_secs(30),
            max_loop_iterations: 10_000,
        }
    }
}

/// Per-trigger execution options
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Whether the workflow was woken by a message rather than a caller
    /// blocking on a response; outbound calls are redirected asynchronously
    /// when set
    pub asynchronous: bool,

    /// Outer cancellation boundary (e.g. the transport's request timeout)
    pub deadline: Option<Instant>,
}

impl ExecutionOptions {
    /// Fire-and-forget mode: resumed by messages, outbound calls redirected.
    pub fn asynchronous() -> Self {
        Self {
            asynchronous: true,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Errors from engine operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Store error
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Registry error
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Workflow instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    /// The instance references a version or form that no longer exists
    #[error("workflow version not found: {0}")]
    VersionNotFound(Uuid),

    /// A tick is already running for this instance
    ///
    /// Per-instance serialization: interleaved ticks would corrupt
    /// position-keyed activity lookups, so a second trigger is rejected.
    #[error("a tick is already in progress for workflow instance {0}")]
    TickInProgress(Uuid),

    /// Dynamic instance creation is disabled for the version
    #[error("dynamic creation is disabled for workflow '{capability}' major version {major_version}")]
    DynamicCreationDisabled {
        capability: String,
        major_version: u32,
    },

    /// Retry requested for an activity that is not in a failed state
    #[error("activity instance {id} is in state {state}, only failed activities can be retried")]
    ActivityNotRetryable { id: Uuid, state: String },

    /// The instance already reached a terminal state
    #[error("workflow instance {0} already finished")]
    AlreadyFinished(Uuid),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Workflow engine: the trigger boundary drives instances through it
///
/// # Example
///
/// ```ignore
/// use waymark_engine::prelude::*;
///
/// let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
/// engine.register(OrderWorkflow);
///
/// let (instance_id, outcome) = engine
///     .start_workflow::<OrderWorkflow>(params, ExecutionOptions::default(), CancellationToken::new())
///     .await?;
///
/// // Later triggers re-enter the same instance:
/// let outcome = engine
///     .execute(instance_id, ExecutionOptions::asynchronous(), CancellationToken::new())
///     .await?;
/// ```
pub struct WorkflowEngine<S: WorkflowStore> {
    store: Arc<S>,
    registry: WorkflowRegistry,
    config: EngineConfig,
    async_requests: Option<Arc<dyn AsyncRequestService>>,
    http: Arc<dyn HttpSender>,
    listeners: Vec<Arc<dyn InstanceChangeListener>>,
    ticks: DashMap<Uuid, Arc<Mutex<()>>>,
    wake_tx: mpsc::UnboundedSender<WakeUp>,
    wake_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<WakeUp>>>,
}

impl<S: WorkflowStore> WorkflowEngine<S> {
    /// Create a new engine with the given store
    pub fn new(store: S) -> Self {
        Self::with_config(store, EngineConfig::default())
    }

    /// Create a new engine with custom config
    pub fn with_config(store: S, config: EngineConfig) -> Self {
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        Self {
            store: Arc::new(store),
            registry: WorkflowRegistry::new(),
            config,
            async_requests: None,
            http: Arc::new(ReqwestSender::new()),
            listeners: Vec::new(),
            ticks: DashMap::new(),
            wake_tx,
            wake_rx: parking_lot::Mutex::new(Some(wake_rx)),
        }
    }

    /// Register a workflow implementation
    pub fn register<W: WorkflowImplementation>(&mut self, implementation: W) {
        self.registry.register(implementation);
        info!(
            capability = W::CAPABILITY,
            major_version = W::MAJOR_VERSION,
            "registered workflow implementation"
        );
    }

    /// Configure the async request service outbound calls redirect through
    pub fn set_async_request_service(&mut self, service: Arc<dyn AsyncRequestService>) {
        self.async_requests = Some(service);
    }

    /// Replace the pass-through HTTP sender used in synchronous mode
    pub fn set_http_sender(&mut self, sender: Arc<dyn HttpSender>) {
        self.http = sender;
    }

    /// Subscribe to instance changes; fired exactly once per persisted
    /// transition
    pub fn add_listener(&mut self, listener: Arc<dyn InstanceChangeListener>) {
        self.listeners.push(listener);
    }

    /// Take the receiver of semaphore wake-up events (once); the transport
    /// uses it to re-trigger woken instances
    pub fn take_wake_events(&self) -> Option<mpsc::UnboundedReceiver<WakeUp>> {
        self.wake_rx.lock().take()
    }

    /// Get a reference to the store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Start a new workflow instance and run its first tick.
    ///
    /// Ensures the workflow form and version exist (create-or-update),
    /// enforces the version's dynamic-create flag, then behaves like
    /// [`execute`](Self::execute).
    #[instrument(skip(self, parameters, options, cancel), fields(capability = W::CAPABILITY))]
    pub async fn start_workflow<W: WorkflowImplementation>(
        &self,
        parameters: BTreeMap<String, Value>,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<(Uuid, Outcome<Value>), EngineError> {
        let implementation = self.registry.resolve(W::FORM_ID, W::MAJOR_VERSION)?;
        let (form, version) = self.ensure_workflow_definitions(&implementation).await?;

        if !version.dynamic_create {
            return Err(EngineError::DynamicCreationDisabled {
                capability: form.capability_name,
                major_version: version.major_version,
            });
        }

        let instance = WorkflowInstance {
            id: Uuid::now_v7(),
            workflow_version_id: version.id,
            title: format!("{} {}", form.title, version.version_string()),
            state: WorkflowInstanceState::Executing,
            started_at: Utc::now(),
            finished_at: None,
            cancelled_at: None,
            parameters,
            result_as_json: None,
            exception_technical_message: None,
            exception_friendly_message: None,
            etag: String::new(),
        };

        let instance = self.store.create_workflow_instance(&instance).await?;
        let instance_id = instance.id;
        info!(%instance_id, "started workflow instance");
        self.after_save(&form, &version, None, &instance).await?;

        let _guard = self.tick_guard(instance_id)?;
        let outcome = self
            .tick(implementation, form, version, instance, &options, cancel)
            .await?;
        Ok((instance_id, outcome))
    }

    /// Run one tick of an existing instance.
    ///
    /// Returns the completed result, a pending indicator (postponement), or
    /// a typed failure; a cancelled instance surfaces a failure whose
    /// `cancel_workflow` flag is set.
    #[instrument(skip(self, options, cancel))]
    pub async fn execute(
        &self,
        instance_id: Uuid,
        options: ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<Outcome<Value>, EngineError> {
        let _guard = self.tick_guard(instance_id)?;

        let instance = self
            .store
            .workflow_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let version = self
            .store
            .workflow_version(instance.workflow_version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(instance.workflow_version_id))?;
        let form = self
            .store
            .workflow_form(version.workflow_form_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version.workflow_form_id))?;
        let implementation = self.registry.resolve(form.id, version.major_version)?;

        self.tick(implementation, form, version, instance, &options, cancel)
            .await
    }

    /// Make a failed activity re-runnable, leaving sibling and ancestor
    /// results memoized. The next tick runs its body again from scratch.
    pub async fn retry_activity(&self, activity_instance_id: Uuid) -> Result<(), EngineError> {
        let row = self
            .store
            .activity_instance(activity_instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(activity_instance_id))?;

        if row.state != waymark_model::ActivityInstanceState::Failed {
            return Err(EngineError::ActivityNotRetryable {
                id: activity_instance_id,
                state: row.state.to_string(),
            });
        }

        let workflow_instance_id = row.workflow_instance_id;
        let mut reset = row;
        reset.state = waymark_model::ActivityInstanceState::Executing;
        reset.result_as_json = None;
        reset.async_request_id = None;
        reset.exception_category = None;
        reset.exception_technical_message = None;
        reset.exception_friendly_message = None;
        reset.finished_at = None;
        reset.attempts += 1;
        self.store.update_activity_instance(&reset).await?;

        // A failed (but not cancelled) instance becomes runnable again so the
        // next tick can reach the reset step; everything else stays memoized.
        if let Some(instance) = self.store.workflow_instance(workflow_instance_id).await? {
            if instance.state == WorkflowInstanceState::Failed && instance.cancelled_at.is_none() {
                let version = self
                    .store
                    .workflow_version(instance.workflow_version_id)
                    .await?
                    .ok_or(EngineError::VersionNotFound(instance.workflow_version_id))?;
                let form = self
                    .store
                    .workflow_form(version.workflow_form_id)
                    .await?
                    .ok_or(EngineError::VersionNotFound(version.workflow_form_id))?;

                let old = instance.clone();
                let mut revived = instance;
                revived.state = WorkflowInstanceState::Waiting;
                revived.finished_at = None;
                revived.exception_technical_message = None;
                revived.exception_friendly_message = None;
                self.save_instance(&form, &version, Some(old), revived)
                    .await?;
            }
        }

        info!(%activity_instance_id, "activity reset for retry");
        Ok(())
    }

    /// Request that an instance halts: the next tick transitions it to
    /// `Halted` without running workflow code.
    pub async fn request_halt(&self, instance_id: Uuid) -> Result<(), EngineError> {
        let instance = self
            .store
            .workflow_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))?;

        if instance.is_terminal() {
            return Err(EngineError::AlreadyFinished(instance_id));
        }

        let version = self
            .store
            .workflow_version(instance.workflow_version_id)
            .await?
            .ok_or(EngineError::VersionNotFound(instance.workflow_version_id))?;
        let form = self
            .store
            .workflow_form(version.workflow_form_id)
            .await?
            .ok_or(EngineError::VersionNotFound(version.workflow_form_id))?;

        let old = instance.clone();
        let mut updated = instance;
        updated.state = WorkflowInstanceState::Halting;
        self.save_instance(&form, &version, Some(old), updated)
            .await?;
        Ok(())
    }

    // =========================================================================
    // Internal Methods
    // =========================================================================

    /// Reject a second concurrent trigger for the same instance.
    fn tick_guard(
        &self,
        instance_id: Uuid,
    ) -> Result<tokio::sync::OwnedMutexGuard<()>, EngineError> {
        let mutex = self
            .ticks
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex
            .try_lock_owned()
            .map_err(|_| EngineError::TickInProgress(instance_id))
    }

    async fn ensure_workflow_definitions(
        &self,
        implementation: &Arc<dyn AnyWorkflowImplementation>,
    ) -> Result<(WorkflowForm, WorkflowVersion), EngineError> {
        let form = match self.store.workflow_form(implementation.form_id()).await? {
            Some(form) => form,
            None => {
                self.store
                    .upsert_workflow_form(&WorkflowForm {
                        id: implementation.form_id(),
                        capability_name: implementation.capability().to_string(),
                        title: implementation.title().to_string(),
                        etag: new_etag(),
                    })
                    .await?
            }
        };

        let version = match self
            .store
            .find_workflow_version(form.id, implementation.major_version())
            .await?
        {
            Some(version) => version,
            None => {
                self.store
                    .upsert_workflow_version(&WorkflowVersion {
                        id: Uuid::now_v7(),
                        workflow_form_id: form.id,
                        major_version: implementation.major_version(),
                        minor_version: implementation.minor_version(),
                        dynamic_create: implementation.dynamic_create(),
                        etag: new_etag(),
                    })
                    .await?
            }
        };

        Ok((form, version))
    }

    async fn tick(
        &self,
        implementation: Arc<dyn AnyWorkflowImplementation>,
        form: WorkflowForm,
        version: WorkflowVersion,
        instance: WorkflowInstance,
        options: &ExecutionOptions,
        cancel: CancellationToken,
    ) -> Result<Outcome<Value>, EngineError> {
        let instance_id = instance.id;

        // Finished instances replay their recorded outcome.
        match instance.state {
            WorkflowInstanceState::Success => {
                return Ok(Outcome::Completed(
                    instance.result_as_json.clone().unwrap_or(Value::Null),
                ));
            }
            WorkflowInstanceState::Failed => {
                return Ok(Outcome::Failed(failure_from_instance(&instance)));
            }
            WorkflowInstanceState::Halted => {
                return Ok(Outcome::Postponed(Postponement::halted()));
            }
            WorkflowInstanceState::Halting => {
                let old = instance.clone();
                let mut updated = instance;
                updated.state = WorkflowInstanceState::Halted;
                self.save_instance(&form, &version, Some(old), updated)
                    .await?;
                info!(%instance_id, "workflow instance halted");
                return Ok(Outcome::Postponed(Postponement::halted()));
            }
            WorkflowInstanceState::Executing | WorkflowInstanceState::Waiting => {}
        }

        // Budget check before any user code: if the caller's deadline leaves
        // too little headroom, persist Waiting and come back on a fresh
        // trigger rather than risk being killed mid-write.
        let now = Instant::now();
        if let Some(deadline) = options.deadline {
            if deadline.saturating_duration_since(now) < self.config.save_margin {
                debug!(%instance_id, "insufficient time before cancellation boundary, postponing tick");
                let old = instance.clone();
                let mut updated = instance;
                updated.state = WorkflowInstanceState::Waiting;
                self.save_instance(&form, &version, Some(old), updated)
                    .await?;
                return Ok(Outcome::Postponed(Postponement::time_budget_exceeded()));
            }
        }
        let tick_deadline = {
            let budget = now + self.config.max_total_run_time;
            match options.deadline {
                Some(deadline) => Some(
                    budget.min(deadline.checked_sub(self.config.save_margin).unwrap_or(now)),
                ),
                None => Some(budget),
            }
        };

        // Resuming a waiting instance is an explicit transition.
        let mut instance = instance;
        if instance.state == WorkflowInstanceState::Waiting {
            let old = instance.clone();
            instance.state = WorkflowInstanceState::Executing;
            instance = self
                .save_instance(&form, &version, Some(old), instance)
                .await?;
        }

        let dyn_store: Arc<dyn WorkflowStore> = self.store.clone();
        let ctx = WorkflowContext::root(Arc::new(ContextInner {
            instance: instance.clone(),
            form: form.clone(),
            version: version.clone(),
            store: dyn_store.clone(),
            async_requests: self.async_requests.clone(),
            http: self.http.clone(),
            semaphores: SemaphoreCoordinator::new(dyn_store, Some(self.wake_tx.clone())),
            asynchronous: options.asynchronous,
            deadline: tick_deadline,
            cancel,
            config: self.config.clone(),
        }));

        debug!(%instance_id, asynchronous = options.asynchronous, "running workflow tick");
        let outcome = implementation.run_erased(&ctx).await;

        let old = instance.clone();
        let result = match outcome {
            Outcome::Completed(value) => {
                info!(%instance_id, "workflow instance completed");
                instance.state = WorkflowInstanceState::Success;
                instance.finished_at = Some(Utc::now());
                instance.result_as_json = Some(value.clone());
                Outcome::Completed(value)
            }

            Outcome::Postponed(mut postponement) => {
                if matches!(postponement.reason, PostponeReason::TemporaryFailure { .. })
                    && postponement.try_again_after.is_none()
                {
                    postponement.try_again_after =
                        Some(jittered(self.config.default_retry_backoff));
                }
                debug!(%instance_id, reason = ?postponement.reason, "workflow instance waiting");
                instance.state = WorkflowInstanceState::Waiting;
                Outcome::Postponed(postponement)
            }

            Outcome::Failed(failure) => {
                let finished = Utc::now();
                instance.state = WorkflowInstanceState::Failed;
                instance.finished_at = Some(finished);
                if failure.cancel_workflow {
                    // Cancellation is never silently swallowed: the caller
                    // observes the cancelling failure, and the instance
                    // records when it was cancelled.
                    warn!(%instance_id, "workflow instance cancelled: {}", failure.technical_message);
                    instance.cancelled_at = Some(finished);
                } else {
                    warn!(%instance_id, "workflow instance failed: {}", failure.technical_message);
                }
                instance.exception_technical_message = Some(failure.technical_message.clone());
                instance.exception_friendly_message = Some(failure.friendly_message.clone());
                Outcome::Failed(failure)
            }
        };

        self.save_instance(&form, &version, Some(old), instance)
            .await?;
        Ok(result)
    }

    /// Persist an instance transition, refresh the summary projection and
    /// fire the notification hook exactly once.
    async fn save_instance(
        &self,
        form: &WorkflowForm,
        version: &WorkflowVersion,
        old: Option<WorkflowInstance>,
        updated: WorkflowInstance,
    ) -> Result<WorkflowInstance, EngineError> {
        let saved = match self.store.update_workflow_instance(&updated).await {
            Ok(saved) => saved,
            Err(StoreError::ConcurrencyConflict { .. }) => {
                // Someone else touched the row between our read and write;
                // merge by taking the fresh etag and re-applying our change.
                let stored = self
                    .store
                    .workflow_instance(updated.id)
                    .await?
                    .ok_or(EngineError::InstanceNotFound(updated.id))?;
                let mut merged = updated.clone();
                merged.etag = stored.etag;
                self.store.update_workflow_instance(&merged).await?
            }
            Err(e) => return Err(e.into()),
        };

        self.after_save(form, version, old, &saved).await?;
        Ok(saved)
    }

    async fn after_save(
        &self,
        form: &WorkflowForm,
        version: &WorkflowVersion,
        old: Option<WorkflowInstance>,
        saved: &WorkflowInstance,
    ) -> Result<(), EngineError> {
        self.store
            .create_or_update_summary(&WorkflowSummary::new(
                form.clone(),
                version.clone(),
                saved.clone(),
            ))
            .await?;

        let change = WorkflowInstanceChange {
            form: form.clone(),
            version: version.clone(),
            old,
            new: saved.clone(),
        };
        for listener in &self.listeners {
            listener.on_instance_changed(&change).await;
        }
        Ok(())
    }
}

/// Apply 10% jitter to the default backoff window so retries of many
/// instances do not land on the same instant.
fn jittered(base: Duration) -> Duration {
    let base_secs = base.as_secs_f64();
    let range = base_secs * 0.1;
    if range <= 0.0 {
        return base;
    }
    let offset = rand::Rng::gen_range(&mut rand::thread_rng(), -range..range);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

/// Rebuild the failure a terminal `Failed` instance recorded.
fn failure_from_instance(instance: &WorkflowInstance) -> ActivityFailure {
    let mut failure = ActivityFailure::technical(
        instance
            .exception_technical_message
            .clone()
            .unwrap_or_else(|| "workflow failed".to_string()),
    );
    if let Some(friendly) = &instance.exception_friendly_message {
        failure = failure.with_friendly_message(friendly.clone());
    }
    failure.cancel_workflow = instance.cancelled_at.is_some();
    failure
}
