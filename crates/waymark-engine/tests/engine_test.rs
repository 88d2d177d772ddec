//! End-to-end tests for the workflow engine over the in-memory store
//!
//! These exercise the properties the engine guarantees: replay idempotence,
//! position stability, fan-in correctness, postponement semantics, lock
//! coordination across instances, and cancellation propagation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use waymark_engine::prelude::*;

const RECORD_FORM: Uuid = Uuid::from_u128(0x101);
const CALL_FORM: Uuid = Uuid::from_u128(0x102);
const JOB_FORM: Uuid = Uuid::from_u128(0x103);
const PARALLEL_FORM: Uuid = Uuid::from_u128(0x104);
const FOREACH_FORM: Uuid = Uuid::from_u128(0x105);
const ITEM_FORM: Uuid = Uuid::from_u128(0x106);
const LOCK_FORM: Uuid = Uuid::from_u128(0x107);
const WORK_FORM: Uuid = Uuid::from_u128(0x108);
const EXPLODE_FORM: Uuid = Uuid::from_u128(0x109);
const SLEEP_FORM: Uuid = Uuid::from_u128(0x10a);
const SWITCH_FORM: Uuid = Uuid::from_u128(0x10b);
const CASE_FORM: Uuid = Uuid::from_u128(0x10c);
const LOOP_FORM: Uuid = Uuid::from_u128(0x10d);
const ADD_FORM: Uuid = Uuid::from_u128(0x10e);
const FLAKY_FORM: Uuid = Uuid::from_u128(0x10f);

fn no_params() -> BTreeMap<String, Value> {
    BTreeMap::new()
}

fn params(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

async fn run_tick<S: WorkflowStore>(
    engine: &WorkflowEngine<S>,
    instance_id: Uuid,
) -> Outcome<Value> {
    engine
        .execute(
            instance_id,
            ExecutionOptions::asynchronous(),
            CancellationToken::new(),
        )
        .await
        .expect("tick should not error")
}

// =============================================================================
// Replay idempotence and the outbound bridge
// =============================================================================

struct FetchWorkflow {
    invocations: Arc<AtomicU32>,
}

#[async_trait]
impl WorkflowImplementation for FetchWorkflow {
    const CAPABILITY: &'static str = "fetch";
    const FORM_ID: Uuid = Uuid::from_u128(0x201);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Fetch";
    type Output = i64;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<i64> {
        let recorded = try_outcome!(
            ctx.activity(RECORD_FORM, "Record")
                .run(|_step| async move {
                    self.invocations.fetch_add(1, Ordering::SeqCst);
                    Outcome::Completed(1_i64)
                })
                .await
        );

        let response = try_outcome!(
            ctx.activity(CALL_FORM, "Call rates service")
                .run(|step| async move {
                    step.send_request(OutboundRequest::get("https://rates.example.com/latest"))
                        .await
                })
                .await
        );

        let rate: i64 = match response.json() {
            Ok(rate) => rate,
            Err(failure) => return Outcome::Failed(failure),
        };
        Outcome::Completed(recorded + rate)
    }
}

#[tokio::test]
async fn replayed_tick_returns_stored_results_without_reinvoking_bodies() {
    let invocations = Arc::new(AtomicU32::new(0));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    let service = Arc::new(InMemoryAsyncRequestService::new());
    engine.set_async_request_service(service.clone());
    engine.register(FetchWorkflow {
        invocations: invocations.clone(),
    });

    let (instance_id, outcome) = engine
        .start_workflow::<FetchWorkflow>(
            no_params(),
            ExecutionOptions::asynchronous(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // First tick: the record activity ran, the outbound call was redirected
    // and the workflow is pending.
    assert!(outcome.is_postponed());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Waiting);

    // The suspended activity carries the async request id.
    let rows = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap();
    let call_row = rows
        .iter()
        .find(|r| r.position.as_str() == "2")
        .expect("call activity row");
    assert_eq!(call_row.state, ActivityInstanceState::Waiting);
    assert!(call_row.async_request_id.is_some());

    // A tick while the response is still pending stays pending and invokes
    // nothing.
    let outcome = run_tick(&engine, instance_id).await;
    assert!(outcome.is_postponed());
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // Answer the request; the next tick resumes in place and completes.
    let (request_id, request) = service.pending_requests().pop().expect("pending request");
    assert_eq!(request.url, "https://rates.example.com/latest");
    service.respond(
        request_id,
        OutboundResponse {
            status: 200,
            headers: vec![],
            body: Some(json!(41)),
        },
    );

    let outcome = run_tick(&engine, instance_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(42)));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Success);
    assert!(instance.finished_at.is_some());

    // A further trigger replays the recorded outcome.
    let outcome = run_tick(&engine, instance_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(42)));
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn positions_are_stable_across_ticks() {
    let invocations = Arc::new(AtomicU32::new(0));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    let service = Arc::new(InMemoryAsyncRequestService::new());
    engine.set_async_request_service(service.clone());
    engine.register(FetchWorkflow { invocations });

    let (instance_id, _) = engine
        .start_workflow::<FetchWorkflow>(
            no_params(),
            ExecutionOptions::asynchronous(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let snapshot = |rows: Vec<waymark_model::ActivityInstance>| {
        rows.into_iter()
            .map(|r| (r.position.to_string(), r.iteration, r.id))
            .collect::<Vec<_>>()
    };

    let first = snapshot(
        engine
            .store()
            .activity_instances_for(instance_id)
            .await
            .unwrap(),
    );
    assert_eq!(
        first
            .iter()
            .map(|(p, _, _)| p.as_str())
            .collect::<Vec<_>>(),
        vec!["1", "2"]
    );

    run_tick(&engine, instance_id).await;
    let second = snapshot(
        engine
            .store()
            .activity_instances_for(instance_id)
            .await
            .unwrap(),
    );

    // Identical positions resolved to identical rows on the second tick.
    assert_eq!(first, second);
}

// =============================================================================
// Parallel fan-in
// =============================================================================

struct ParallelWorkflow;

#[async_trait]
impl WorkflowImplementation for ParallelWorkflow {
    const CAPABILITY: &'static str = "parallel-jobs";
    const FORM_ID: Uuid = Uuid::from_u128(0x202);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Parallel jobs";
    type Output = JobResults;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<JobResults> {
        let mut builder = ctx.parallel(PARALLEL_FORM, "Jobs");
        for k in 1..=4_u32 {
            builder = builder.job(k, move |step| async move {
                step.context()
                    .activity(JOB_FORM, "Job")
                    .run(move |_step| async move { Outcome::Completed(k as i64 * 10) })
                    .await
            });
        }
        builder.run().await
    }
}

#[tokio::test]
async fn parallel_jobs_collect_results_by_index() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(ParallelWorkflow);

    let (instance_id, outcome) = engine
        .start_workflow::<ParallelWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let results: JobResults = match outcome {
        Outcome::Completed(value) => serde_json::from_value(value).unwrap(),
        other => panic!("expected completion, got {other:?}"),
    };

    assert_eq!(results.len(), 4);
    let sum: i64 = (1..=4)
        .map(|k| results.get::<i64>(k).unwrap().unwrap())
        .sum();
    assert_eq!(sum, 100); // 10 * 4 * 5 / 2

    // Each job's activity shares a position but carries its job index as the
    // iteration.
    let rows = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap();
    let job_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.position.as_str() == "1.1")
        .collect();
    assert_eq!(job_rows.len(), 4);
    let iterations: Vec<u32> = job_rows.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3, 4]);
}

// =============================================================================
// ForEachParallel isolation
// =============================================================================

struct FanOutWorkflow {
    ready: Arc<AtomicBool>,
    item_invocations: Arc<AtomicU32>,
}

#[async_trait]
impl WorkflowImplementation for FanOutWorkflow {
    const CAPABILITY: &'static str = "fan-out";
    const FORM_ID: Uuid = Uuid::from_u128(0x203);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Fan out";
    type Output = Vec<i64>;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<Vec<i64>> {
        let ready = self.ready.clone();
        let item_invocations = self.item_invocations.clone();
        ctx.for_each_parallel(FOREACH_FORM, "Per item", vec![1_i64, 2], move |_i, item, step| {
            let ready = ready.clone();
            let item_invocations = item_invocations.clone();
            async move {
                if item == 2 && !ready.load(Ordering::SeqCst) {
                    return Outcome::Postponed(Postponement::temporary_failure(
                        "item 2 not ready",
                    ));
                }
                step.context()
                    .activity(ITEM_FORM, "Process item")
                    .run(move |_step| async move {
                        item_invocations.fetch_add(1, Ordering::SeqCst);
                        Outcome::Completed(item * 10)
                    })
                    .await
            }
        })
        .await
    }
}

#[tokio::test]
async fn postponing_iteration_keeps_fan_out_waiting_despite_sibling_success() {
    let ready = Arc::new(AtomicBool::new(false));
    let item_invocations = Arc::new(AtomicU32::new(0));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(FanOutWorkflow {
        ready: ready.clone(),
        item_invocations: item_invocations.clone(),
    });

    let (instance_id, outcome) = engine
        .start_workflow::<FanOutWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // One iteration succeeded, its sibling postponed: the fan-out must be
    // waiting, not successful.
    assert!(outcome.is_postponed());
    assert_eq!(item_invocations.load(Ordering::SeqCst), 1);

    let rows = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap();
    let foreach_row = rows
        .iter()
        .find(|r| r.position.as_str() == "1")
        .expect("fan-out row");
    assert_eq!(foreach_row.state, ActivityInstanceState::Waiting);
    let item_row = rows
        .iter()
        .find(|r| r.position.as_str() == "1.1" && r.iteration == 1)
        .expect("first item row");
    assert_eq!(item_row.state, ActivityInstanceState::Success);

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Waiting);

    // Unblock the second iteration; the first one replays from its memoized
    // result.
    ready.store(true, Ordering::SeqCst);
    let outcome = run_tick(&engine, instance_id).await;
    assert_eq!(outcome, Outcome::Completed(json!([10, 20])));
    assert_eq!(item_invocations.load(Ordering::SeqCst), 2);
}

// =============================================================================
// Locks across instances, and cancellation through locks
// =============================================================================

struct GuardedWorkflow {
    release: Arc<AtomicBool>,
}

#[async_trait]
impl WorkflowImplementation for GuardedWorkflow {
    const CAPABILITY: &'static str = "guarded";
    const FORM_ID: Uuid = Uuid::from_u128(0x204);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Guarded";
    type Output = i64;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<i64> {
        let hold = matches!(ctx.parameter::<bool>("hold"), Ok(true));
        let release = self.release.clone();
        ctx.under_lock(LOCK_FORM, "Guarded section", "shared-resource", move |step| {
            async move {
                let value = try_outcome!(
                    step.context()
                        .activity(WORK_FORM, "Work")
                        .run(|_step| async { Outcome::Completed(5_i64) })
                        .await
                );
                if hold && !release.load(Ordering::SeqCst) {
                    return Outcome::Postponed(Postponement::temporary_failure("holding"));
                }
                Outcome::Completed(value)
            }
        })
        .await
    }
}

#[tokio::test]
async fn lock_is_exclusive_across_instances_and_wakes_the_waiter() {
    let release = Arc::new(AtomicBool::new(false));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(GuardedWorkflow {
        release: release.clone(),
    });
    let mut wake_events = engine.take_wake_events().expect("wake receiver");

    // The first instance acquires the lock and suspends inside the guarded
    // section, still holding it.
    let (holder_id, outcome) = engine
        .start_workflow::<GuardedWorkflow>(
            params(&[("hold", json!(true))]),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(outcome.is_postponed());

    // The second instance queues behind the lock: postponed with no retry
    // hint, woken only by an explicit release.
    let (waiter_id, outcome) = engine
        .start_workflow::<GuardedWorkflow>(
            params(&[("hold", json!(false))]),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    match outcome {
        Outcome::Postponed(p) => {
            assert!(!p.try_again);
            assert!(matches!(p.reason, PostponeReason::Resource { .. }));
        }
        other => panic!("expected resource postponement, got {other:?}"),
    }

    // Let the holder finish; releasing the lock wakes the waiter.
    release.store(true, Ordering::SeqCst);
    let outcome = run_tick(&engine, holder_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(5)));

    let wake = wake_events.try_recv().expect("wake event");
    assert_eq!(wake.workflow_instance_id, waiter_id);
    assert_eq!(wake.resource_id, "shared-resource");

    let outcome = run_tick(&engine, waiter_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(5)));
}

struct CancellingGuardedWorkflow;

#[async_trait]
impl WorkflowImplementation for CancellingGuardedWorkflow {
    const CAPABILITY: &'static str = "guarded-cancel";
    const FORM_ID: Uuid = Uuid::from_u128(0x205);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Guarded cancel";
    type Output = i64;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<i64> {
        ctx.under_lock(LOCK_FORM, "Guarded section", "cancel-resource", |step| async move {
            step.context()
                .activity(EXPLODE_FORM, "Explode")
                .fail_urgency(FailUrgency::CancelWorkflow)
                .run(|_step| async {
                    Outcome::<i64>::Failed(ActivityFailure::business(
                        "ledger out of balance",
                        "The books do not balance.",
                    ))
                })
                .await
        })
        .await
    }
}

#[tokio::test]
async fn cancelling_failure_inside_lock_propagates() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(CancellingGuardedWorkflow);

    let (instance_id, outcome) = engine
        .start_workflow::<CancellingGuardedWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The cancellation is not swallowed by the lock wrapper: the caller
    // observes a cancelling failure.
    match outcome {
        Outcome::Failed(failure) => {
            assert!(failure.cancel_workflow);
            assert_eq!(failure.friendly_message, "The books do not balance.");
        }
        other => panic!("expected cancelling failure, got {other:?}"),
    }

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Failed);
    assert!(instance.cancelled_at.is_some());

    // The lock was released on the way out.
    let record = engine
        .store()
        .semaphore("cancel-resource")
        .await
        .unwrap()
        .expect("semaphore record");
    assert!(record.holders.is_empty());
    assert!(record.waiters.is_empty());
}

// =============================================================================
// Sleep
// =============================================================================

struct SleepyWorkflow;

#[async_trait]
impl WorkflowImplementation for SleepyWorkflow {
    const CAPABILITY: &'static str = "sleepy";
    const FORM_ID: Uuid = Uuid::from_u128(0x206);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Sleepy";
    type Output = ();

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<()> {
        try_outcome!(
            ctx.sleep(SLEEP_FORM, "Cool down", std::time::Duration::from_millis(50))
                .await
        );
        Outcome::Completed(())
    }
}

#[tokio::test]
async fn sleep_postpones_with_a_remaining_delay_and_never_fails() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(SleepyWorkflow);

    let (instance_id, outcome) = engine
        .start_workflow::<SleepyWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    match outcome {
        Outcome::Postponed(p) => {
            assert!(p.try_again);
            let after = p.try_again_after.expect("remaining delay hint");
            assert!(after <= std::time::Duration::from_millis(50));
        }
        other => panic!("expected postponement, got {other:?}"),
    }

    let rows = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap();
    assert_eq!(rows[0].state, ActivityInstanceState::Waiting);

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    let outcome = run_tick(&engine, instance_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(null)));
}

// =============================================================================
// Switch and loops
// =============================================================================

struct RoutedWorkflow;

#[async_trait]
impl WorkflowImplementation for RoutedWorkflow {
    const CAPABILITY: &'static str = "routed";
    const FORM_ID: Uuid = Uuid::from_u128(0x207);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Routed";
    type Output = i64;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<i64> {
        let mode: String = match ctx.parameter("mode") {
            Ok(mode) => mode,
            Err(failure) => return Outcome::Failed(failure),
        };

        let base = try_outcome!(
            ctx.switch(SWITCH_FORM, "Route by mode", move || mode)
                .case("fast".to_string(), |step| async move {
                    step.context()
                        .activity(CASE_FORM, "Fast path")
                        .run(|_step| async { Outcome::Completed(100_i64) })
                        .await
                })
                .case("slow".to_string(), |step| async move {
                    step.context()
                        .activity(CASE_FORM, "Slow path")
                        .run(|_step| async { Outcome::Completed(1_i64) })
                        .await
                })
                .default_case(|_step| async { Outcome::Completed(0_i64) })
                .run()
                .await
        );

        let accumulated = try_outcome!(
            ctx.do_until(
                LOOP_FORM,
                "Accumulate",
                |iteration, step| async move {
                    step.context()
                        .activity(ADD_FORM, "Add")
                        .run(move |_step| async move { Outcome::Completed(iteration as i64) })
                        .await
                },
                |value| *value >= 3,
            )
            .await
        );

        Outcome::Completed(base + accumulated)
    }
}

#[tokio::test]
async fn switch_routes_and_loop_iterations_are_distinct_rows() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(RoutedWorkflow);

    let (instance_id, outcome) = engine
        .start_workflow::<RoutedWorkflow>(
            params(&[("mode", json!("fast"))]),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(outcome, Outcome::Completed(json!(103)));

    let rows = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap();

    // Loop body activities at the same position, one row per iteration.
    let loop_rows: Vec<_> = rows
        .iter()
        .filter(|r| r.position.as_str() == "2.1")
        .collect();
    assert_eq!(loop_rows.len(), 3);
    assert!(loop_rows
        .iter()
        .all(|r| r.state == ActivityInstanceState::Success));
    let iterations: Vec<u32> = loop_rows.iter().map(|r| r.iteration).collect();
    assert_eq!(iterations, vec![1, 2, 3]);
}

// =============================================================================
// Retry
// =============================================================================

struct FlakyWorkflow {
    attempts: Arc<AtomicU32>,
}

#[async_trait]
impl WorkflowImplementation for FlakyWorkflow {
    const CAPABILITY: &'static str = "flaky";
    const FORM_ID: Uuid = Uuid::from_u128(0x208);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Flaky";
    type Output = i64;

    async fn run(&self, ctx: &WorkflowContext) -> Outcome<i64> {
        let attempts = self.attempts.clone();
        let value = try_outcome!(
            ctx.activity(FLAKY_FORM, "Flaky step")
                .run(move |_step| async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        Outcome::Failed(ActivityFailure::technical("first attempt fails"))
                    } else {
                        Outcome::Completed(9_i64)
                    }
                })
                .await
        );
        Outcome::Completed(value)
    }
}

#[tokio::test]
async fn explicit_retry_re_runs_only_the_failed_step() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(FlakyWorkflow {
        attempts: attempts.clone(),
    });

    let (instance_id, outcome) = engine
        .start_workflow::<FlakyWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(outcome.is_failed());

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Failed);
    assert!(instance.cancelled_at.is_none());

    // Without a retry, a new tick re-raises the stored failure.
    let outcome = run_tick(&engine, instance_id).await;
    assert!(outcome.is_failed());
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let failed_row = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.state == ActivityInstanceState::Failed)
        .expect("failed activity row");

    engine.retry_activity(failed_row.id).await.unwrap();

    let outcome = run_tick(&engine, instance_id).await;
    assert_eq!(outcome, Outcome::Completed(json!(9)));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn retry_rejects_activities_that_did_not_fail() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(ParallelWorkflow);

    let (instance_id, _) = engine
        .start_workflow::<ParallelWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let succeeded = engine
        .store()
        .activity_instances_for(instance_id)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.state == ActivityInstanceState::Success)
        .unwrap();

    let result = engine.retry_activity(succeeded.id).await;
    assert!(matches!(
        result,
        Err(EngineError::ActivityNotRetryable { .. })
    ));
}

// =============================================================================
// Per-instance serialization
// =============================================================================

struct SlowWorkflow {
    ready: Arc<AtomicBool>,
}

#[async_trait]
impl WorkflowImplementation for SlowWorkflow {
    const CAPABILITY: &'static str = "slow";
    const FORM_ID: Uuid = Uuid::from_u128(0x209);
    const MAJOR_VERSION: u32 = 1;
    const MINOR_VERSION: u32 = 0;
    const TITLE: &'static str = "Slow";
    type Output = ();

    async fn run(&self, _ctx: &WorkflowContext) -> Outcome<()> {
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        if self.ready.load(Ordering::SeqCst) {
            Outcome::Completed(())
        } else {
            Outcome::Postponed(Postponement::temporary_failure("not ready"))
        }
    }
}

#[tokio::test]
async fn concurrent_trigger_for_the_same_instance_is_rejected() {
    let ready = Arc::new(AtomicBool::new(false));
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(SlowWorkflow {
        ready: ready.clone(),
    });
    let engine = Arc::new(engine);

    let (instance_id, _) = engine
        .start_workflow::<SlowWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let first = {
        let engine = engine.clone();
        tokio::spawn(async move {
            engine
                .execute(
                    instance_id,
                    ExecutionOptions::default(),
                    CancellationToken::new(),
                )
                .await
        })
    };

    // Give the first tick time to take the guard, then trigger again.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let second = engine
        .execute(
            instance_id,
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await;

    assert!(matches!(second, Err(EngineError::TickInProgress(_))));
    assert!(first.await.unwrap().is_ok());
}

// =============================================================================
// Notification hook and summary projection
// =============================================================================

struct RecordingListener {
    transitions: parking_lot::Mutex<Vec<(Option<WorkflowInstanceState>, WorkflowInstanceState)>>,
}

#[async_trait]
impl InstanceChangeListener for RecordingListener {
    async fn on_instance_changed(&self, change: &WorkflowInstanceChange) {
        self.transitions
            .lock()
            .push((change.old.as_ref().map(|i| i.state), change.new.state));
    }
}

#[tokio::test]
async fn listener_fires_once_per_persisted_transition_and_summary_tracks() {
    let listener = Arc::new(RecordingListener {
        transitions: parking_lot::Mutex::new(Vec::new()),
    });
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(SleepyWorkflow);
    engine.add_listener(listener.clone());

    let (instance_id, _) = engine
        .start_workflow::<SleepyWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    run_tick(&engine, instance_id).await;

    let transitions = listener.transitions.lock().clone();
    // Creation, then Waiting after the first tick, Executing on resume,
    // Success at the end.
    assert_eq!(transitions.first().unwrap().0, None);
    assert_eq!(
        transitions.last().unwrap().1,
        WorkflowInstanceState::Success
    );
    assert!(transitions
        .iter()
        .any(|(_, new)| *new == WorkflowInstanceState::Waiting));

    let summary = engine
        .store()
        .workflow_summary(instance_id)
        .await
        .unwrap()
        .expect("summary row");
    assert_eq!(summary.instance.state, WorkflowInstanceState::Success);
    assert_eq!(summary.form.capability_name, "sleepy");
}

// =============================================================================
// Halting
// =============================================================================

#[tokio::test]
async fn halt_request_finishes_on_the_next_tick() {
    let mut engine = WorkflowEngine::new(InMemoryWorkflowStore::new());
    engine.register(SleepyWorkflow);

    let (instance_id, outcome) = engine
        .start_workflow::<SleepyWorkflow>(
            no_params(),
            ExecutionOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(outcome.is_postponed());

    engine.request_halt(instance_id).await.unwrap();

    let outcome = run_tick(&engine, instance_id).await;
    match outcome {
        Outcome::Postponed(p) => assert!(matches!(p.reason, PostponeReason::Halted)),
        other => panic!("expected halted postponement, got {other:?}"),
    }

    let instance = engine
        .store()
        .workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, WorkflowInstanceState::Halted);
}
