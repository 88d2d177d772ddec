//! Lock, Semaphore and Throttle: bodies guarded by a named resource

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};
use tracing::warn;
use uuid::Uuid;
use waymark_model::ActivityKind;

use super::no_catch;
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::{ActivityOptions, ActivityStep};
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome};

impl WorkflowContext {
    /// Run the body while holding an exclusive, system-wide lock on the
    /// named resource.
    pub async fn under_lock<T, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        resource_id: &str,
        body: F,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        self.guarded(form_id, title, ActivityKind::Lock, resource_id, 1, body)
            .await
    }

    /// Run the body as one of at most `capacity` concurrent holders of the
    /// named resource, across all workflow instances.
    pub async fn with_semaphore<T, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        resource_id: &str,
        capacity: u32,
        body: F,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        self.guarded(
            form_id,
            title,
            ActivityKind::Semaphore,
            resource_id,
            capacity,
            body,
        )
        .await
    }

    /// Bound the number of concurrent executions of the body system-wide.
    pub async fn with_throttle<T, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        resource_id: &str,
        capacity: u32,
        body: F,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        self.guarded(
            form_id,
            title,
            ActivityKind::Throttle,
            resource_id,
            capacity,
            body,
        )
        .await
    }

    async fn guarded<T, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        kind: ActivityKind,
        resource_id: &str,
        capacity: u32,
        body: F,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: FnOnce(ActivityStep) -> Fut + Send,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        let resource_id = resource_id.to_string();
        let workflow_instance_id = self.workflow_instance_id();
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<T>(), move |step| async move {
            let coordinator = step.context().inner.semaphores.clone();
            // The activity instance id is stable across replays, which makes
            // a replayed raise idempotent instead of double-counting.
            let holder_id = step.activity_instance_id();

            match coordinator
                .raise(&resource_id, capacity, holder_id, workflow_instance_id)
                .await
            {
                Outcome::Completed(()) => {}
                Outcome::Postponed(p) => return Outcome::Postponed(p),
                Outcome::Failed(f) => return Outcome::Failed(f),
            }

            match body(step).await {
                // The body is suspended mid-flight: keep holding the
                // resource until it finishes on a later tick.
                Outcome::Postponed(p) => Outcome::Postponed(p),

                done => {
                    if let Err(e) = coordinator.lower(&resource_id, holder_id).await {
                        match done {
                            // A body failure must propagate; a release
                            // failure on top of it is only logged. In
                            // particular a cancelling failure keeps
                            // cancelling the workflow.
                            Outcome::Failed(f) => {
                                warn!(resource_id, error = %e, "failed to lower resource after body failure");
                                return Outcome::Failed(f);
                            }
                            _ => {
                                return Outcome::Failed(ActivityFailure::from(e));
                            }
                        }
                    }
                    done
                }
            }
        })
        .await
    }
}
