//! ForEach fan-out, parallel and sequential

use std::future::Future;

use futures::future::join_all;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;
use waymark_model::ActivityKind;

use super::{fan_in, no_catch};
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::{ActivityOptions, ActivityStep};
use crate::context::WorkflowContext;
use crate::outcome::Outcome;

impl WorkflowContext {
    /// Run the body once per item, all iterations concurrently.
    ///
    /// Iteration `i` (1-based) runs in a scope whose activities carry `i` in
    /// their identity, so the same body code yields distinct memoized rows
    /// per iteration. The activity completes only when every iteration's
    /// subtree is terminal; a single suspended iteration keeps the whole
    /// fan-out waiting.
    pub async fn for_each_parallel<T, I, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        items: I,
        body: F,
    ) -> Outcome<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        I: IntoIterator + Send,
        I::IntoIter: Send,
        I::Item: Send,
        F: Fn(u32, I::Item, ActivityStep) -> Fut + Send + Sync,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::ForEachParallel,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<Vec<T>>(), move |step| async move {
            let iterations: Vec<_> = items
                .into_iter()
                .enumerate()
                .map(|(index, item)| {
                    let iteration = index as u32 + 1;
                    let iter_step = step.for_iteration(iteration);
                    body(iteration, item, iter_step)
                })
                .collect();
            fan_in(join_all(iterations).await)
        })
        .await
    }

    /// Run the body once per item, strictly in order: iteration `i + 1` does
    /// not start until iteration `i` completed.
    pub async fn for_each_sequential<T, I, F, Fut>(
        &self,
        form_id: Uuid,
        title: &str,
        items: I,
        body: F,
    ) -> Outcome<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        I: IntoIterator + Send,
        I::IntoIter: Send,
        I::Item: Send,
        F: Fn(u32, I::Item, ActivityStep) -> Fut + Send + Sync,
        Fut: Future<Output = Outcome<T>> + Send,
    {
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::ForEachSequential,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<Vec<T>>(), move |step| async move {
            let mut values = Vec::new();
            for (index, item) in items.into_iter().enumerate() {
                let iteration = index as u32 + 1;
                let iter_step = step.for_iteration(iteration);
                match body(iteration, item, iter_step).await {
                    Outcome::Completed(value) => values.push(value),
                    Outcome::Postponed(p) => return Outcome::Postponed(p),
                    Outcome::Failed(f) => return Outcome::Failed(f),
                }
            }
            Outcome::Completed(values)
        })
        .await
    }
}
