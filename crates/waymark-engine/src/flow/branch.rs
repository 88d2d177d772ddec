//! If/Then/Else and Switch/Case branching

use std::future::Future;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;
use waymark_model::ActivityKind;

use super::no_catch;
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::{ActivityOptions, ActivityStep};
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome};

type CaseBody<'c, T> = Box<dyn FnOnce(ActivityStep) -> BoxFuture<'c, Outcome<T>> + Send + 'c>;

impl WorkflowContext {
    /// Run exactly one of two branches.
    ///
    /// The condition is evaluated fresh on every tick - it is not memoized,
    /// only the chosen branch's activities are - so it must be a
    /// deterministic function of the workflow's inputs and earlier memoized
    /// results.
    pub async fn if_else<T, C, TB, TFut, EB, EFut>(
        &self,
        form_id: Uuid,
        title: &str,
        condition: C,
        then_body: TB,
        else_body: EB,
    ) -> Outcome<T>
    where
        T: Serialize + DeserializeOwned + Send,
        C: FnOnce() -> bool + Send,
        TB: FnOnce(ActivityStep) -> TFut + Send,
        TFut: Future<Output = Outcome<T>> + Send,
        EB: FnOnce(ActivityStep) -> EFut + Send,
        EFut: Future<Output = Outcome<T>> + Send,
    {
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::If,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<T>(), move |step| async move {
            if condition() {
                then_body(step).await
            } else {
                else_body(step).await
            }
        })
        .await
    }

    /// Run a branch only when the condition holds.
    pub async fn if_then<T, C, TB, TFut>(
        &self,
        form_id: Uuid,
        title: &str,
        condition: C,
        then_body: TB,
    ) -> Outcome<Option<T>>
    where
        T: Serialize + DeserializeOwned + Send,
        C: FnOnce() -> bool + Send,
        TB: FnOnce(ActivityStep) -> TFut + Send,
        TFut: Future<Output = Outcome<T>> + Send,
    {
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::If,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<Option<T>>(), move |step| async move {
            if condition() {
                then_body(step).await.map(Some)
            } else {
                Outcome::Completed(None)
            }
        })
        .await
    }

    /// Begin a switch over a selector value. Chain [`case`](SwitchBuilder::case)
    /// and optionally [`default_case`](SwitchBuilder::default_case), then
    /// [`run`](SwitchBuilder::run).
    pub fn switch<'c, K, S, T>(
        &'c self,
        form_id: Uuid,
        title: &str,
        selector: S,
    ) -> SwitchBuilder<'c, K, T>
    where
        S: FnOnce() -> K + Send + 'c,
    {
        SwitchBuilder {
            ctx: self,
            form_id,
            title: title.to_string(),
            selector: Box::new(selector),
            cases: Vec::new(),
            default: None,
        }
    }
}

/// Builder for a Switch/Case activity.
pub struct SwitchBuilder<'c, K, T> {
    ctx: &'c WorkflowContext,
    form_id: Uuid,
    title: String,
    selector: Box<dyn FnOnce() -> K + Send + 'c>,
    cases: Vec<(K, CaseBody<'c, T>)>,
    default: Option<CaseBody<'c, T>>,
}

impl<'c, K, T> SwitchBuilder<'c, K, T>
where
    K: PartialEq + std::fmt::Debug + Send,
    T: Serialize + DeserializeOwned + Send,
{
    /// Add a case; the first case whose key matches the selector runs.
    pub fn case<F, Fut>(mut self, key: K, body: F) -> Self
    where
        F: FnOnce(ActivityStep) -> Fut + Send + 'c,
        Fut: Future<Output = Outcome<T>> + Send + 'c,
    {
        self.cases
            .push((key, Box::new(move |step| body(step).boxed())));
        self
    }

    /// Add the branch taken when no case matches.
    pub fn default_case<F, Fut>(mut self, body: F) -> Self
    where
        F: FnOnce(ActivityStep) -> Fut + Send + 'c,
        Fut: Future<Output = Outcome<T>> + Send + 'c,
    {
        self.default = Some(Box::new(move |step| body(step).boxed()));
        self
    }

    /// Evaluate the selector (fresh on every tick) and run the matching
    /// case's body as this activity's subtree.
    pub async fn run(self) -> Outcome<T> {
        let Self {
            ctx,
            form_id,
            title,
            selector,
            mut cases,
            default,
        } = self;

        let spec = StepSpec {
            form_id,
            title: title.clone(),
            kind: ActivityKind::Switch,
            options: ActivityOptions::default(),
        };
        execute_step(ctx, spec, no_catch::<T>(), move |step| async move {
            let key = selector();
            let body = match cases.iter().position(|(k, _)| *k == key) {
                Some(index) => cases.swap_remove(index).1,
                None => match default {
                    Some(body) => body,
                    None => {
                        return Outcome::Failed(ActivityFailure::capability(format!(
                            "switch '{title}': no case matches {key:?} and no default case given"
                        )))
                    }
                },
            };
            body(step).await
        })
        .await
    }
}
