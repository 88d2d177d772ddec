//! Do-Until and While-Do loops

use std::future::Future;

use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;
use waymark_model::ActivityKind;

use super::no_catch;
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::{ActivityOptions, ActivityStep};
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome};

impl WorkflowContext {
    /// Run the body, then keep repeating it until the predicate accepts its
    /// value. Returns the accepted value.
    ///
    /// Iteration `i` (1-based) runs in a scope whose activities carry `i` in
    /// their identity; the predicate is evaluated fresh every iteration and
    /// is never memoized.
    pub async fn do_until<T, F, Fut, P>(
        &self,
        form_id: Uuid,
        title: &str,
        body: F,
        until: P,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(u32, ActivityStep) -> Fut + Send + Sync,
        Fut: Future<Output = Outcome<T>> + Send,
        P: Fn(&T) -> bool + Send + Sync,
    {
        let max_iterations = self.inner.config.max_loop_iterations;
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::DoUntil,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<T>(), move |step| async move {
            let mut iteration = 1u32;
            loop {
                let iter_step = step.for_iteration(iteration);
                let value = match body(iteration, iter_step).await {
                    Outcome::Completed(value) => value,
                    other => return other,
                };
                if until(&value) {
                    return Outcome::Completed(value);
                }
                iteration += 1;
                if iteration > max_iterations {
                    return Outcome::Failed(ActivityFailure::capability(format!(
                        "loop exceeded {max_iterations} iterations"
                    )));
                }
            }
        })
        .await
    }

    /// Evaluate the condition before each iteration and run the body while
    /// it holds. Returns the last body value, or `None` if the body never
    /// ran.
    pub async fn while_do<T, F, Fut, P>(
        &self,
        form_id: Uuid,
        title: &str,
        condition: P,
        body: F,
    ) -> Outcome<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        F: Fn(u32, ActivityStep) -> Fut + Send + Sync,
        Fut: Future<Output = Outcome<T>> + Send,
        P: Fn(u32) -> bool + Send + Sync,
    {
        let max_iterations = self.inner.config.max_loop_iterations;
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::WhileDo,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<Option<T>>(), move |step| async move {
            let mut last = None;
            let mut iteration = 1u32;
            while condition(iteration) {
                let iter_step = step.for_iteration(iteration);
                match body(iteration, iter_step).await {
                    Outcome::Completed(value) => last = Some(value),
                    Outcome::Postponed(p) => return Outcome::Postponed(p),
                    Outcome::Failed(f) => return Outcome::Failed(f),
                }
                iteration += 1;
                if iteration > max_iterations {
                    return Outcome::Failed(ActivityFailure::capability(format!(
                        "loop exceeded {max_iterations} iterations"
                    )));
                }
            }
            Outcome::Completed(last)
        })
        .await
    }
}
