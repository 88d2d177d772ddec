//! Sleep: a minimum wake time persisted across ticks

use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use waymark_model::ActivityKind;

use super::no_catch;
use crate::activity::executor::{execute_step, StepSpec};
use crate::activity::ActivityOptions;
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome, Postponement};

const RESUME_AT_KEY: &str = "resume_at";

impl WorkflowContext {
    /// Wait at least `duration` before the workflow continues past this
    /// point.
    ///
    /// The wake time is fixed on the first tick that reaches the sleep; a
    /// tick arriving earlier postpones asking to be retried no sooner than
    /// the remaining delay. Once the time has passed the sleep memoizes as
    /// `Success` like any other activity.
    pub async fn sleep(&self, form_id: Uuid, title: &str, duration: Duration) -> Outcome<()> {
        let spec = StepSpec {
            form_id,
            title: title.to_string(),
            kind: ActivityKind::Sleep,
            options: ActivityOptions::default(),
        };
        execute_step(self, spec, no_catch::<()>(), move |step| async move {
            let resume_at: DateTime<Utc> = match step.get_context_value(RESUME_AT_KEY) {
                Some(at) => at,
                None => {
                    let delay = match chrono::Duration::from_std(duration) {
                        Ok(delay) => delay,
                        Err(_) => {
                            return Outcome::Failed(ActivityFailure::capability(format!(
                                "sleep duration {duration:?} is out of range"
                            )))
                        }
                    };
                    let at = Utc::now() + delay;
                    if let Err(failure) = step.set_context_value(RESUME_AT_KEY, &at).await {
                        return Outcome::Failed(failure);
                    }
                    at
                }
            };

            if Utc::now() >= resume_at {
                Outcome::Completed(())
            } else {
                Outcome::Postponed(Postponement::timer(resume_at))
            }
        })
        .await
    }
}
