//! The three-way result of every activity and workflow execution.
//!
//! Suspension is not an error and never travels by stack unwinding: every
//! executor call returns an [`Outcome`], and callers forward non-completed
//! variants with [`try_outcome!`](crate::try_outcome).

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use waymark_model::{FailUrgency, FailureCategory};

/// Result of asking the engine to run one step (or one whole tick).
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The step finished and produced a value.
    Completed(T),

    /// The step cannot finish this tick; try again later (or wait for an
    /// explicit wake, see [`Postponement::try_again`]).
    Postponed(Postponement),

    /// The step failed.
    Failed(ActivityFailure),
}

impl<T> Outcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn is_postponed(&self) -> bool {
        matches!(self, Self::Postponed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Map the completed value, forwarding postponements and failures.
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Self::Completed(v) => Outcome::Completed(f(v)),
            Self::Postponed(p) => Outcome::Postponed(p),
            Self::Failed(e) => Outcome::Failed(e),
        }
    }

    /// The completed value, if any.
    pub fn ok(self) -> Option<T> {
        match self {
            Self::Completed(v) => Some(v),
            _ => None,
        }
    }
}

/// Unwrap a completed [`Outcome`] value, returning early from the enclosing
/// function with the postponement or failure otherwise.
///
/// This is the `futures::ready!` pattern applied to workflow control flow:
///
/// ```ignore
/// let quote = try_outcome!(ctx.activity(QUOTE_FORM, "Get quote").run(body).await);
/// ```
#[macro_export]
macro_rules! try_outcome {
    ($outcome:expr) => {
        match $outcome {
            $crate::Outcome::Completed(value) => value,
            $crate::Outcome::Postponed(postponement) => {
                return $crate::Outcome::Postponed(postponement)
            }
            $crate::Outcome::Failed(failure) => return $crate::Outcome::Failed(failure),
        }
    };
}

/// Why a step could not finish this tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PostponeReason {
    /// Suspended on an outbound call redirected through the async request
    /// service.
    AsyncRequest { request_id: Uuid },

    /// Queued behind a fully-held semaphore or lock; woken by a `lower`.
    Resource { resource_id: String },

    /// Sleeping until a wall-clock time.
    Timer { resume_at: DateTime<Utc> },

    /// The tick's run-time budget ran out before this step could run.
    TimeBudgetExceeded,

    /// A transient failure worth retrying after a backoff window.
    TemporaryFailure { message: String },

    /// The instance was halted on request and needs external intervention.
    Halted,
}

/// A non-error suspension signal: "this tick cannot finish this step now."
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Postponement {
    pub reason: PostponeReason,

    /// Whether a blind timed retry is meaningful. Semaphore and async-request
    /// waits set this to `false`: they are woken by an explicit event, not a
    /// timer.
    pub try_again: bool,

    /// Minimum wait before the next attempt, when one is known. `None` on a
    /// temporary failure means "use the engine's default backoff window".
    #[serde(with = "option_duration_millis")]
    pub try_again_after: Option<Duration>,
}

impl Postponement {
    /// Suspended on an async request; woken when the response arrives.
    pub fn async_request(request_id: Uuid) -> Self {
        Self {
            reason: PostponeReason::AsyncRequest { request_id },
            try_again: false,
            try_again_after: None,
        }
    }

    /// Queued behind a named resource; woken by whoever releases it.
    pub fn resource(resource_id: impl Into<String>) -> Self {
        Self {
            reason: PostponeReason::Resource {
                resource_id: resource_id.into(),
            },
            try_again: false,
            try_again_after: None,
        }
    }

    /// Sleeping until `resume_at`; retry no earlier than the remaining delay.
    pub fn timer(resume_at: DateTime<Utc>) -> Self {
        let remaining = (resume_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Self {
            reason: PostponeReason::Timer { resume_at },
            try_again: true,
            try_again_after: Some(remaining),
        }
    }

    /// The tick ran out of budget; safe to retry immediately on a new tick.
    pub fn time_budget_exceeded() -> Self {
        Self {
            reason: PostponeReason::TimeBudgetExceeded,
            try_again: true,
            try_again_after: None,
        }
    }

    /// A transient failure requesting backoff-style retry.
    pub fn temporary_failure(message: impl Into<String>) -> Self {
        Self {
            reason: PostponeReason::TemporaryFailure {
                message: message.into(),
            },
            try_again: true,
            try_again_after: None,
        }
    }

    /// The instance was halted on request.
    pub fn halted() -> Self {
        Self {
            reason: PostponeReason::Halted,
            try_again: false,
            try_again_after: None,
        }
    }

    pub fn with_try_again_after(mut self, after: Duration) -> Self {
        self.try_again_after = Some(after);
        self
    }

    /// Combine with a sibling postponement during fan-in: keep the earliest
    /// retry hint, and allow timed retries if either side does.
    pub fn merge(self, other: Postponement) -> Postponement {
        let try_again_after = match (self.try_again_after, other.try_again_after) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        Postponement {
            reason: self.reason,
            try_again: self.try_again || other.try_again,
            try_again_after,
        }
    }
}

/// A typed activity failure with an operator-facing and a business-facing
/// message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub category: FailureCategory,

    /// For operators: what actually went wrong.
    pub technical_message: String,

    /// For business users: what it means for the process.
    pub friendly_message: String,

    /// Set when the failure must unwind past every catch and cancel the
    /// whole workflow instance.
    pub cancel_workflow: bool,

    /// The activity instance the failure originated in, when known.
    pub activity_instance_id: Option<Uuid>,
}

impl ActivityFailure {
    fn new(category: FailureCategory, technical: impl Into<String>) -> Self {
        let technical = technical.into();
        Self {
            category,
            friendly_message: "The process could not be completed.".to_string(),
            technical_message: technical,
            cancel_workflow: false,
            activity_instance_id: None,
        }
    }

    /// A failure in the surrounding technology (network, serialization of
    /// user data, an external system misbehaving).
    pub fn technical(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::Technical, message)
    }

    /// A failure in the business process itself.
    pub fn business(technical: impl Into<String>, friendly: impl Into<String>) -> Self {
        let mut failure = Self::new(FailureCategory::Business, technical);
        failure.friendly_message = friendly.into();
        failure
    }

    /// An engine-internal fault (e.g. an unexpected storage error). Kept as
    /// its own category so it is never mistaken for a failure of the workflow
    /// being run.
    pub fn capability(message: impl Into<String>) -> Self {
        Self::new(FailureCategory::WorkflowCapability, message)
    }

    /// The activity exceeded its maximum execution time.
    pub fn max_time_reached(limit: Duration) -> Self {
        Self::new(
            FailureCategory::MaxTimeReached,
            format!("activity exceeded its maximum execution time of {limit:?}"),
        )
    }

    pub fn with_friendly_message(mut self, friendly: impl Into<String>) -> Self {
        self.friendly_message = friendly.into();
        self
    }

    pub fn for_activity(mut self, activity_instance_id: Uuid) -> Self {
        self.activity_instance_id = Some(activity_instance_id);
        self
    }

    /// Apply a fail-urgency policy. Escalation is one-way: a failure that
    /// already cancels the workflow is never downgraded.
    pub fn escalate(mut self, urgency: FailUrgency) -> Self {
        self.cancel_workflow = self.cancel_workflow || urgency == FailUrgency::CancelWorkflow;
        self
    }
}

impl std::fmt::Display for ActivityFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.category, self.technical_message)
    }
}

impl std::error::Error for ActivityFailure {}

impl From<serde_json::Error> for ActivityFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::capability(format!("serialization error: {err}"))
    }
}

impl From<anyhow::Error> for ActivityFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::technical(err.to_string())
    }
}

/// Serde support for Option<Duration> (as milliseconds)
mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn completed() -> Outcome<i32> {
        Outcome::Completed(41)
    }

    fn postponed() -> Outcome<i32> {
        Outcome::Postponed(Postponement::resource("printer"))
    }

    fn forward(outcome: Outcome<i32>) -> Outcome<i32> {
        let value = try_outcome!(outcome);
        Outcome::Completed(value + 1)
    }

    #[test]
    fn test_try_outcome_unwraps_completed() {
        assert_eq!(forward(completed()), Outcome::Completed(42));
    }

    #[test]
    fn test_try_outcome_forwards_postponement() {
        let result = forward(postponed());
        match result {
            Outcome::Postponed(p) => {
                assert!(!p.try_again);
                assert!(matches!(p.reason, PostponeReason::Resource { .. }));
            }
            other => panic!("expected postponement, got {other:?}"),
        }
    }

    #[test]
    fn test_try_outcome_forwards_failure() {
        let result = forward(Outcome::Failed(ActivityFailure::technical("boom")));
        assert!(result.is_failed());
    }

    #[test]
    fn test_resource_postponement_has_no_retry_hint() {
        let p = Postponement::resource("invoice-export");
        assert!(!p.try_again);
        assert_eq!(p.try_again_after, None);
    }

    #[test]
    fn test_timer_postponement_hint() {
        let p = Postponement::timer(Utc::now() + chrono::Duration::seconds(10));
        assert!(p.try_again);
        let after = p.try_again_after.unwrap();
        assert!(after <= Duration::from_secs(10));
        assert!(after >= Duration::from_secs(8));
    }

    #[test]
    fn test_merge_keeps_earliest_hint() {
        let a = Postponement::temporary_failure("x").with_try_again_after(Duration::from_secs(30));
        let b = Postponement::temporary_failure("y").with_try_again_after(Duration::from_secs(5));
        let merged = a.merge(b);
        assert_eq!(merged.try_again_after, Some(Duration::from_secs(5)));
        assert!(merged.try_again);
    }

    #[test]
    fn test_merge_with_wake_only() {
        let a = Postponement::resource("r");
        let b = Postponement::timer(Utc::now() + chrono::Duration::seconds(1));
        let merged = a.clone().merge(b);
        assert!(merged.try_again);
        assert!(merged.try_again_after.is_some());

        let both_wake = a.clone().merge(Postponement::resource("s"));
        assert!(!both_wake.try_again);
    }

    #[test]
    fn test_escalate_is_one_way() {
        let failure = ActivityFailure::business("no stock", "Out of stock")
            .escalate(FailUrgency::CancelWorkflow)
            .escalate(FailUrgency::Stopping);
        assert!(failure.cancel_workflow);
    }

    #[test]
    fn test_failure_serialization() {
        let failure = ActivityFailure::technical("connection reset")
            .with_friendly_message("Please try again later.")
            .for_activity(Uuid::now_v7());

        let json = serde_json::to_string(&failure).unwrap();
        let parsed: ActivityFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(failure, parsed);
    }
}
