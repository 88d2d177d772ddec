//! The replay/memoize/suspend core behind every activity invocation
//!
//! Every control-flow primitive funnels into [`execute_step`]: look up (or
//! create) the activity instance row for the step's identity, decide from its
//! state whether the body may be skipped, must run, or the step must stay
//! suspended, and persist whatever the body decides. The memoization contract
//! is what makes replay side-effect-free: a step that already reached
//! `Success` returns its stored result without invoking the body again.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;
use waymark_model::{
    ActivityForm, ActivityInstance, ActivityInstanceState, ActivityKind, ActivityVersion,
    FailureCategory, Position,
};

use super::options::ActivityOptions;
use super::step::ActivityStep;
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome, PostponeReason, Postponement};
use crate::persistence::{StoreError, WorkflowStore};

/// Everything that identifies and parameterizes one step.
pub(crate) struct StepSpec {
    pub form_id: Uuid,
    pub title: String,
    pub kind: ActivityKind,
    pub options: ActivityOptions,
}

/// What a catch handler decided to do with an intercepted failure.
pub enum Recovery<T> {
    /// Substitute a value; the step is persisted as `Success` with it.
    Value(T),

    /// Reset the step so the next tick runs the body again from scratch.
    Retry {
        after: Option<std::time::Duration>,
    },

    /// Let the failure propagate unchanged.
    Propagate,
}

/// Builder for a single activity invocation.
pub struct ActivityBuilder<'c> {
    ctx: &'c WorkflowContext,
    spec: StepSpec,
}

impl WorkflowContext {
    /// Begin an [`ActivityKind::Action`] activity: one memoized call to a
    /// body function.
    pub fn activity(&self, form_id: Uuid, title: &str) -> ActivityBuilder<'_> {
        ActivityBuilder {
            ctx: self,
            spec: StepSpec {
                form_id,
                title: title.to_string(),
                kind: ActivityKind::Action,
                options: ActivityOptions::default(),
            },
        }
    }
}

impl<'c> ActivityBuilder<'c> {
    pub fn with_options(mut self, options: ActivityOptions) -> Self {
        self.spec.options = options;
        self
    }

    pub fn fail_urgency(mut self, urgency: waymark_model::FailUrgency) -> Self {
        self.spec.options.fail_urgency = urgency;
        self
    }

    pub fn max_execution_time(mut self, limit: std::time::Duration) -> Self {
        self.spec.options.max_execution_time = Some(limit);
        self
    }

    pub fn async_priority(mut self, priority: f64) -> Self {
        self.spec.options.async_priority = priority.clamp(0.0, 1.0);
        self
    }

    /// Run the activity body.
    pub async fn run<T, F, Fut>(self, body: F) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        execute_step(
            self.ctx,
            self.spec,
            None::<fn(&ActivityFailure) -> Recovery<T>>,
            body,
        )
        .await
    }

    /// Run the activity body with a catch clause that may intercept a
    /// failure before it propagates.
    ///
    /// The handler never sees a failure that cancels the whole workflow;
    /// those unwind past every catch.
    pub async fn run_catching<T, F, Fut, C>(self, body: F, catch: C) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
        C: FnOnce(&ActivityFailure) -> Recovery<T> + Send,
    {
        execute_step(self.ctx, self.spec, Some(catch), body).await
    }
}

/// Persist an activity row, merging on an optimistic-concurrency conflict.
///
/// On a conflict the row is reloaded, our changes are re-applied on top of
/// the fresh etag and the update retried once; the conflict is never papered
/// over with a blind overwrite of someone else's etag.
pub(crate) async fn save_activity_row(
    store: &Arc<dyn WorkflowStore>,
    row_arc: &Arc<Mutex<ActivityInstance>>,
) -> Result<(), StoreError> {
    let snapshot = row_arc.lock().clone();
    let saved = match store.update_activity_instance(&snapshot).await {
        Ok(saved) => saved,
        Err(StoreError::ConcurrencyConflict { .. }) => {
            let stored = store
                .activity_instance(snapshot.id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "activity instance",
                    id: snapshot.id.to_string(),
                })?;
            let mut merged = snapshot.clone();
            merged.etag = stored.etag;
            store.update_activity_instance(&merged).await?
        }
        Err(e) => return Err(e),
    };
    *row_arc.lock() = saved;
    Ok(())
}

/// Run one step, or decide it does not need to run.
pub(crate) async fn execute_step<T, F, Fut, C>(
    ctx: &WorkflowContext,
    spec: StepSpec,
    catch: Option<C>,
    body: F,
) -> Outcome<T>
where
    T: Serialize + DeserializeOwned + Send,
    F: FnOnce(ActivityStep) -> Fut + Send,
    Fut: Future<Output = Outcome<T>> + Send,
    C: FnOnce(&ActivityFailure) -> Recovery<T> + Send,
{
    let position = ctx.next_position();
    let iteration = ctx.iteration();

    let version = match ensure_definitions(ctx, &spec, &position).await {
        Ok(version) => version,
        Err(failure) => return Outcome::Failed(failure),
    };

    let template = ActivityInstance {
        id: Uuid::now_v7(),
        workflow_instance_id: ctx.workflow_instance_id(),
        activity_version_id: version.id,
        position: position.clone(),
        iteration,
        state: ActivityInstanceState::Executing,
        started_at: Utc::now(),
        finished_at: None,
        result_as_json: None,
        context_as_json: None,
        async_request_id: None,
        exception_category: None,
        exception_technical_message: None,
        exception_friendly_message: None,
        attempts: 1,
        etag: String::new(),
    };

    let (row, created) = match ctx
        .inner
        .store
        .find_or_create_activity_instance(&template)
        .await
    {
        Ok(found) => found,
        Err(e) => return Outcome::Failed(ActivityFailure::from(e)),
    };

    debug!(
        activity_instance_id = %row.id,
        position = %position,
        iteration,
        kind = %spec.kind,
        state = %row.state,
        created,
        "executing step"
    );

    if !created {
        match row.state {
            ActivityInstanceState::Success if spec.kind.memoizes() => {
                // The memoization contract: return the stored result without
                // invoking the body.
                let stored = row.result_as_json.clone().unwrap_or(Value::Null);
                return match serde_json::from_value(stored) {
                    Ok(value) => Outcome::Completed(value),
                    Err(e) => Outcome::Failed(
                        ActivityFailure::capability(format!(
                            "stored result of activity at position {position} does not \
                             deserialize to the expected type: {e}"
                        ))
                        .for_activity(row.id),
                    ),
                };
            }

            ActivityInstanceState::Failed => {
                let stored = failure_from_row(&row);
                let row_arc = Arc::new(Mutex::new(row));
                return settle(ctx, row_arc, &spec.options, catch, Outcome::Failed(stored))
                    .await;
            }

            ActivityInstanceState::Waiting => {
                if let Some(request_id) = row.async_request_id {
                    match poll_async_request(ctx, request_id).await {
                        Ok(true) => {
                            // Response arrived; fall through and resume the
                            // body, which picks the response up in place.
                        }
                        Ok(false) => {
                            return Outcome::Postponed(Postponement::async_request(request_id))
                        }
                        Err(failure) => return Outcome::Failed(failure.for_activity(row.id)),
                    }
                }
                // Semaphore and timer waits re-check inside the body.
            }

            _ => {}
        }
    }

    // Out of budget: persist the suspension before the signal is honored
    // rather than risk being killed mid-write.
    if ctx.out_of_time() {
        let row_arc = Arc::new(Mutex::new(row));
        return settle(
            ctx,
            row_arc,
            &spec.options,
            catch,
            Outcome::Postponed(Postponement::time_budget_exceeded()),
        )
        .await;
    }

    let row_arc = Arc::new(Mutex::new(row));
    row_arc.lock().state = ActivityInstanceState::Executing;

    let step = ActivityStep::new(
        ctx.child(position),
        row_arc.clone(),
        spec.options.clone(),
    );
    let fut = body(step);

    let outcome = match spec.options.max_execution_time {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(outcome) => outcome,
            Err(_) => Outcome::Failed(ActivityFailure::max_time_reached(limit)),
        },
        None => fut.await,
    };

    settle(ctx, row_arc, &spec.options, catch, outcome).await
}

/// Persist what the body decided and map it to the caller's outcome.
async fn settle<T, C>(
    ctx: &WorkflowContext,
    row_arc: Arc<Mutex<ActivityInstance>>,
    options: &ActivityOptions,
    catch: Option<C>,
    outcome: Outcome<T>,
) -> Outcome<T>
where
    T: Serialize + DeserializeOwned + Send,
    C: FnOnce(&ActivityFailure) -> Recovery<T> + Send,
{
    let store = &ctx.inner.store;
    let row_id = row_arc.lock().id;

    match outcome {
        Outcome::Completed(value) => {
            let json = match serde_json::to_value(&value) {
                Ok(json) => json,
                Err(e) => {
                    return Outcome::Failed(ActivityFailure::from(e).for_activity(row_id));
                }
            };
            mark_success(&row_arc, json);
            if let Err(e) = save_activity_row(store, &row_arc).await {
                return Outcome::Failed(ActivityFailure::from(e).for_activity(row_id));
            }
            Outcome::Completed(value)
        }

        Outcome::Postponed(postponement) => {
            {
                let mut row = row_arc.lock();
                row.state = ActivityInstanceState::Waiting;
                if let PostponeReason::AsyncRequest { request_id } = &postponement.reason {
                    row.async_request_id = Some(*request_id);
                }
            }
            if let Err(e) = save_activity_row(store, &row_arc).await {
                return Outcome::Failed(ActivityFailure::from(e).for_activity(row_id));
            }
            debug!(activity_instance_id = %row_id, reason = ?postponement.reason, "step postponed");
            Outcome::Postponed(postponement)
        }

        Outcome::Failed(mut failure) => {
            if failure.activity_instance_id.is_none() {
                failure = failure.for_activity(row_id);
            }

            // A cancelling failure unwinds past every catch; anything else
            // may be intercepted and recovered.
            if !failure.cancel_workflow {
                if let Some(catch) = catch {
                    match catch(&failure) {
                        Recovery::Value(value) => {
                            debug!(activity_instance_id = %row_id, "failure recovered with a substitute value");
                            let json = match serde_json::to_value(&value) {
                                Ok(json) => json,
                                Err(e) => {
                                    return Outcome::Failed(
                                        ActivityFailure::from(e).for_activity(row_id),
                                    );
                                }
                            };
                            mark_success(&row_arc, json);
                            if let Err(e) = save_activity_row(store, &row_arc).await {
                                return Outcome::Failed(
                                    ActivityFailure::from(e).for_activity(row_id),
                                );
                            }
                            return Outcome::Completed(value);
                        }
                        Recovery::Retry { after } => {
                            {
                                let mut row = row_arc.lock();
                                row.state = ActivityInstanceState::Executing;
                                row.result_as_json = None;
                                row.async_request_id = None;
                                row.exception_category = None;
                                row.exception_technical_message = None;
                                row.exception_friendly_message = None;
                                row.attempts += 1;
                            }
                            if let Err(e) = save_activity_row(store, &row_arc).await {
                                return Outcome::Failed(
                                    ActivityFailure::from(e).for_activity(row_id),
                                );
                            }
                            let mut postponement =
                                Postponement::temporary_failure(failure.technical_message.clone());
                            postponement.try_again_after = after;
                            return Outcome::Postponed(postponement);
                        }
                        Recovery::Propagate => {}
                    }
                }
                failure = failure.escalate(options.fail_urgency);
            }

            {
                let mut row = row_arc.lock();
                row.state = ActivityInstanceState::Failed;
                row.finished_at = Some(Utc::now());
                row.exception_category = Some(failure.category);
                row.exception_technical_message = Some(failure.technical_message.clone());
                row.exception_friendly_message = Some(failure.friendly_message.clone());
            }
            if let Err(e) = save_activity_row(store, &row_arc).await {
                warn!(activity_instance_id = %row_id, error = %e, "failed to persist activity failure");
            }
            warn!(
                activity_instance_id = %row_id,
                category = %failure.category,
                cancel_workflow = failure.cancel_workflow,
                "step failed: {}",
                failure.technical_message
            );
            Outcome::Failed(failure)
        }
    }
}

/// Record a successful result on the in-memory row.
fn mark_success(row_arc: &Arc<Mutex<ActivityInstance>>, json: Value) {
    let mut row = row_arc.lock();
    row.state = ActivityInstanceState::Success;
    row.result_as_json = Some(json);
    row.finished_at = Some(Utc::now());
    row.async_request_id = None;
    row.exception_category = None;
    row.exception_technical_message = None;
    row.exception_friendly_message = None;
}

/// Look up or lazily register the activity form and version for this step.
async fn ensure_definitions(
    ctx: &WorkflowContext,
    spec: &StepSpec,
    position: &Position,
) -> Result<ActivityVersion, ActivityFailure> {
    let store = &ctx.inner.store;

    let form = match store.activity_form(spec.form_id).await? {
        Some(form) => {
            if form.kind != spec.kind {
                return Err(ActivityFailure::capability(format!(
                    "activity form {} is registered as kind {} but used as {}",
                    spec.form_id, form.kind, spec.kind
                )));
            }
            form
        }
        None => {
            store
                .upsert_activity_form(&ActivityForm {
                    id: spec.form_id,
                    kind: spec.kind,
                    title: spec.title.clone(),
                    etag: String::new(),
                })
                .await?
        }
    };

    let workflow_version_id = ctx.workflow_version().id;
    if let Some(version) = store
        .find_activity_version(workflow_version_id, form.id, position)
        .await?
    {
        return Ok(version);
    }

    // Parent version found by trimming the position.
    let parent_activity_version_id = match position.parent() {
        Some(parent) if !parent.is_root() => store
            .activity_version_at(workflow_version_id, &parent)
            .await?
            .map(|v| v.id),
        _ => None,
    };

    let version = store
        .upsert_activity_version(&ActivityVersion {
            id: Uuid::now_v7(),
            workflow_version_id,
            activity_form_id: form.id,
            position: position.clone(),
            parent_activity_version_id,
            fail_urgency: spec.options.fail_urgency,
            etag: String::new(),
        })
        .await?;
    Ok(version)
}

/// Check whether the async request a step is suspended on has a response.
async fn poll_async_request(
    ctx: &WorkflowContext,
    request_id: Uuid,
) -> Result<bool, ActivityFailure> {
    let service = ctx.inner.async_requests.as_ref().ok_or_else(|| {
        ActivityFailure::capability(
            "activity is suspended on an async request but no async request service is configured",
        )
    })?;
    let response = service
        .response(request_id)
        .await
        .map_err(|e| ActivityFailure::capability(format!("async request service error: {e}")))?;
    Ok(response.is_some())
}

/// Rebuild the typed failure a `Failed` row stored.
fn failure_from_row(row: &ActivityInstance) -> ActivityFailure {
    ActivityFailure {
        category: row.exception_category.unwrap_or(FailureCategory::Technical),
        technical_message: row
            .exception_technical_message
            .clone()
            .unwrap_or_else(|| "activity failed".to_string()),
        friendly_message: row
            .exception_friendly_message
            .clone()
            .unwrap_or_else(|| "The process could not be completed.".to_string()),
        cancel_workflow: false,
        activity_instance_id: Some(row.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ReqwestSender;
    use crate::context::ContextInner;
    use crate::engine::executor::EngineConfig;
    use crate::persistence::InMemoryWorkflowStore;
    use crate::semaphore::SemaphoreCoordinator;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;
    use waymark_model::{WorkflowForm, WorkflowInstance, WorkflowInstanceState, WorkflowVersion};

    const FORM: Uuid = Uuid::from_u128(0x11);

    fn harness() -> (Arc<InMemoryWorkflowStore>, Uuid, impl Fn() -> WorkflowContext) {
        let store: Arc<InMemoryWorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        let instance_id = Uuid::now_v7();

        let form = WorkflowForm {
            id: Uuid::now_v7(),
            capability_name: "test".to_string(),
            title: "Test".to_string(),
            etag: String::new(),
        };
        let version = WorkflowVersion {
            id: Uuid::now_v7(),
            workflow_form_id: form.id,
            major_version: 1,
            minor_version: 0,
            dynamic_create: true,
            etag: String::new(),
        };
        let instance = WorkflowInstance {
            id: instance_id,
            workflow_version_id: version.id,
            title: "Test 1.0".to_string(),
            state: WorkflowInstanceState::Executing,
            started_at: Utc::now(),
            finished_at: None,
            cancelled_at: None,
            parameters: BTreeMap::new(),
            result_as_json: None,
            exception_technical_message: None,
            exception_friendly_message: None,
            etag: String::new(),
        };

        let make_ctx = {
            let store = store.clone();
            move || {
                let dyn_store: Arc<dyn crate::persistence::WorkflowStore> = store.clone();
                WorkflowContext::root(Arc::new(ContextInner {
                    instance: instance.clone(),
                    form: form.clone(),
                    version: version.clone(),
                    store: dyn_store.clone(),
                    async_requests: None,
                    http: Arc::new(ReqwestSender::new()),
                    semaphores: SemaphoreCoordinator::new(dyn_store, None),
                    asynchronous: false,
                    deadline: None,
                    cancel: CancellationToken::new(),
                    config: EngineConfig::default(),
                }))
            }
        };

        (store, instance_id, make_ctx)
    }

    #[tokio::test]
    async fn test_success_is_memoized_across_ticks() {
        let (_store, _instance_id, make_ctx) = harness();
        let invocations = Arc::new(AtomicU32::new(0));

        for tick in 0..2 {
            let ctx = make_ctx();
            let invocations = invocations.clone();
            let outcome = ctx
                .activity(FORM, "Count")
                .run(move |_step| async move {
                    invocations.fetch_add(1, Ordering::SeqCst);
                    Outcome::Completed(7_i64)
                })
                .await;
            assert_eq!(outcome, Outcome::Completed(7), "tick {tick}");
        }

        assert_eq!(invocations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_postponement_persists_waiting_never_failed() {
        let (store, instance_id, make_ctx) = harness();
        let ctx = make_ctx();

        let outcome = ctx
            .activity(FORM, "Wait")
            .run(|_step| async {
                Outcome::<i64>::Postponed(Postponement::temporary_failure("not yet"))
            })
            .await;
        assert!(outcome.is_postponed());

        let rows = store.activity_instances_for(instance_id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, ActivityInstanceState::Waiting);
    }

    #[tokio::test]
    async fn test_failure_is_persisted_and_re_raised() {
        let (store, instance_id, make_ctx) = harness();

        let outcome = make_ctx()
            .activity(FORM, "Boom")
            .run(|_step| async {
                Outcome::<i64>::Failed(ActivityFailure::business("no stock", "Out of stock"))
            })
            .await;
        assert!(outcome.is_failed());

        let rows = store.activity_instances_for(instance_id).await.unwrap();
        assert_eq!(rows[0].state, ActivityInstanceState::Failed);
        assert_eq!(rows[0].exception_category, Some(FailureCategory::Business));

        // Replay re-raises the stored failure without running the body.
        let outcome = make_ctx()
            .activity(FORM, "Boom")
            .run(|_step| async {
                if true {
                    panic!("body must not run for a failed step");
                }
                Outcome::<i64>::Completed(0)
            })
            .await;
        match outcome {
            Outcome::Failed(failure) => {
                assert_eq!(failure.category, FailureCategory::Business);
                assert_eq!(failure.friendly_message, "Out of stock");
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_catch_substitutes_a_value() {
        let (store, instance_id, make_ctx) = harness();

        let outcome = make_ctx()
            .activity(FORM, "Fallible")
            .run_catching(
                |_step| async { Outcome::<i64>::Failed(ActivityFailure::technical("flaky")) },
                |_failure| Recovery::Value(-1),
            )
            .await;
        assert_eq!(outcome, Outcome::Completed(-1));

        // The recovery value is memoized like any other result.
        let rows = store.activity_instances_for(instance_id).await.unwrap();
        assert_eq!(rows[0].state, ActivityInstanceState::Success);
        assert_eq!(rows[0].result_as_json, Some(serde_json::json!(-1)));
    }

    #[tokio::test]
    async fn test_catch_retry_resets_the_step() {
        let (store, instance_id, make_ctx) = harness();
        let invocations = Arc::new(AtomicU32::new(0));

        let counter = invocations.clone();
        let outcome = make_ctx()
            .activity(FORM, "Flaky")
            .run_catching(
                move |_step| async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Outcome::<i64>::Failed(ActivityFailure::technical("transient"))
                },
                |_failure| Recovery::Retry { after: None },
            )
            .await;
        assert!(outcome.is_postponed());

        let rows = store.activity_instances_for(instance_id).await.unwrap();
        assert_eq!(rows[0].state, ActivityInstanceState::Executing);
        assert_eq!(rows[0].attempts, 2);

        // Next tick runs the body again from scratch.
        let counter = invocations.clone();
        let outcome = make_ctx()
            .activity(FORM, "Flaky")
            .run(move |_step| async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::Completed(3_i64)
            })
            .await;
        assert_eq!(outcome, Outcome::Completed(3));
        assert_eq!(invocations.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelling_failure_bypasses_catch() {
        let (_store, _instance_id, make_ctx) = harness();
        let caught = AtomicU32::new(0);

        let outcome = make_ctx()
            .activity(FORM, "Outer")
            .run_catching(
                |step| async move {
                    // Nested step escalates to a workflow cancellation.
                    step.context()
                        .activity(Uuid::from_u128(0x12), "Inner")
                        .fail_urgency(waymark_model::FailUrgency::CancelWorkflow)
                        .run(|_step| async {
                            Outcome::<i64>::Failed(ActivityFailure::technical("fatal"))
                        })
                        .await
                },
                |_failure| {
                    caught.fetch_add(1, Ordering::SeqCst);
                    Recovery::Value(0)
                },
            )
            .await;

        match outcome {
            Outcome::Failed(failure) => assert!(failure.cancel_workflow),
            other => panic!("expected cancelling failure, got {other:?}"),
        }
        assert_eq!(caught.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_max_execution_time() {
        let (_store, _instance_id, make_ctx) = harness();

        let outcome = make_ctx()
            .activity(FORM, "Slow")
            .max_execution_time(std::time::Duration::from_millis(20))
            .run(|_step| async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Outcome::Completed(0_i64)
            })
            .await;

        match outcome {
            Outcome::Failed(failure) => {
                assert_eq!(failure.category, FailureCategory::MaxTimeReached)
            }
            other => panic!("expected max-time failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_positions_are_stable_across_ticks() {
        let (store, instance_id, make_ctx) = harness();

        let run = |ctx: WorkflowContext| async move {
            let _ = ctx
                .activity(FORM, "First")
                .run(|_step| async { Outcome::Completed(1_i64) })
                .await;
            let _ = ctx
                .activity(Uuid::from_u128(0x13), "Second")
                .run(|step| async move {
                    step.context()
                        .activity(Uuid::from_u128(0x14), "Nested")
                        .run(|_step| async { Outcome::Completed(3_i64) })
                        .await
                })
                .await;
        };

        run(make_ctx()).await;
        let first: Vec<_> = store
            .activity_instances_for(instance_id)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.position.to_string(), r.id))
            .collect();
        assert_eq!(
            first.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>(),
            vec!["1", "2", "2.1"]
        );

        run(make_ctx()).await;
        let second: Vec<_> = store
            .activity_instances_for(instance_id)
            .await
            .unwrap()
            .iter()
            .map(|r| (r.position.to_string(), r.id))
            .collect();

        // Same positions resolve to the same rows; nothing was duplicated.
        assert_eq!(first, second);
    }
}
