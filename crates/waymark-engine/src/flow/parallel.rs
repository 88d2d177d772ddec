//! Parallel: a fixed set of named jobs with result aggregation

use std::future::Future;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;
use waymark_model::{ActivityKind, JobResults};

use super::no_catch;
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::{ActivityOptions, ActivityStep};
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome, Postponement};

type JobBody<'c> = Box<dyn FnOnce(ActivityStep) -> BoxFuture<'c, Outcome<Value>> + Send + 'c>;

impl WorkflowContext {
    /// Begin a Parallel activity. Chain [`job`](ParallelBuilder::job) for
    /// each named job, then [`run`](ParallelBuilder::run).
    pub fn parallel<'c>(&'c self, form_id: Uuid, title: &str) -> ParallelBuilder<'c> {
        ParallelBuilder {
            ctx: self,
            form_id,
            title: title.to_string(),
            jobs: Vec::new(),
        }
    }
}

/// Builder for a Parallel activity: jobs launched concurrently, results
/// collected by job index into [`JobResults`].
pub struct ParallelBuilder<'c> {
    ctx: &'c WorkflowContext,
    form_id: Uuid,
    title: String,
    jobs: Vec<(u32, JobBody<'c>)>,
}

impl<'c> ParallelBuilder<'c> {
    /// Add a job. Its activities carry `job_index` as their iteration, and
    /// its result lands in [`JobResults`] under the same index.
    pub fn job<T, F, Fut>(mut self, job_index: u32, body: F) -> Self
    where
        T: Serialize + Send,
        F: FnOnce(ActivityStep) -> Fut + Send + 'c,
        Fut: Future<Output = Outcome<T>> + Send + 'c,
    {
        self.jobs.push((
            job_index,
            Box::new(move |step| {
                async move {
                    match body(step).await {
                        Outcome::Completed(value) => match serde_json::to_value(&value) {
                            Ok(json) => Outcome::Completed(json),
                            Err(e) => Outcome::Failed(ActivityFailure::from(e)),
                        },
                        Outcome::Postponed(p) => Outcome::Postponed(p),
                        Outcome::Failed(f) => Outcome::Failed(f),
                    }
                }
                .boxed()
            }),
        ));
        self
    }

    /// Launch every job concurrently and wait for all of them (the fan-in
    /// barrier): the activity succeeds only once all jobs are terminal.
    pub async fn run(self) -> Outcome<JobResults> {
        let Self {
            ctx,
            form_id,
            title,
            jobs,
        } = self;

        let spec = StepSpec {
            form_id,
            title,
            kind: ActivityKind::Parallel,
            options: ActivityOptions::default(),
        };
        execute_step(ctx, spec, no_catch::<JobResults>(), move |step| async move {
            let launched: Vec<_> = jobs
                .into_iter()
                .map(|(job_index, job)| {
                    let job_step = step.for_iteration(job_index);
                    async move { (job_index, job(job_step).await) }
                })
                .collect();

            let mut results = JobResults::new();
            let mut postponement: Option<Postponement> = None;
            let mut failure: Option<ActivityFailure> = None;

            for (job_index, outcome) in join_all(launched).await {
                match outcome {
                    Outcome::Completed(value) => results.insert_json(job_index, value),
                    Outcome::Postponed(p) => {
                        postponement = Some(match postponement.take() {
                            Some(merged) => merged.merge(p),
                            None => p,
                        });
                    }
                    Outcome::Failed(f) => {
                        let replace = match &failure {
                            None => true,
                            Some(kept) => f.cancel_workflow && !kept.cancel_workflow,
                        };
                        if replace {
                            failure = Some(f);
                        }
                    }
                }
            }

            if let Some(failure) = failure {
                return Outcome::Failed(failure);
            }
            if let Some(postponement) = postponement {
                return Outcome::Postponed(postponement);
            }
            Outcome::Completed(results)
        })
        .await
    }
}
