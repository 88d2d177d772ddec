//! Control-flow activity library
//!
//! Each primitive is a thin policy layered on the activity executor:
//! branches ([`branch`]), fan-out ([`foreach`], [`parallel`]), timers
//! ([`sleep`]), loops ([`looping`]) and resource guards ([`lock`]). Branch
//! conditions and loop predicates are evaluated fresh on every tick; only
//! the activities they create are memoized.

pub mod branch;
pub mod foreach;
pub mod lock;
pub mod looping;
pub mod parallel;
pub mod sleep;

pub use branch::SwitchBuilder;
pub use parallel::ParallelBuilder;

use crate::outcome::{ActivityFailure, Outcome, Postponement};
use crate::Recovery;

/// The absent catch handler, with the turbofish spelled once.
pub(crate) fn no_catch<T>() -> Option<fn(&ActivityFailure) -> Recovery<T>> {
    None
}

/// Fan-in barrier over concurrently executed children.
///
/// A failure in any child fails the parent (cancelling failures take
/// precedence). Otherwise a postponement in any child postpones the parent:
/// one suspended sibling must never be masked by the others' success.
pub(crate) fn fan_in<T>(outcomes: Vec<Outcome<T>>) -> Outcome<Vec<T>> {
    let mut values = Vec::with_capacity(outcomes.len());
    let mut postponement: Option<Postponement> = None;
    let mut failure: Option<ActivityFailure> = None;

    for outcome in outcomes {
        match outcome {
            Outcome::Completed(value) => values.push(value),
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
    Outcome::Completed(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fan_in_all_completed() {
        let outcome = fan_in(vec![Outcome::Completed(1), Outcome::Completed(2)]);
        assert_eq!(outcome, Outcome::Completed(vec![1, 2]));
    }

    #[test]
    fn test_fan_in_postponement_not_masked_by_success() {
        let outcome = fan_in(vec![
            Outcome::Completed(1),
            Outcome::Postponed(Postponement::resource("r")),
            Outcome::Completed(3),
        ]);
        assert!(outcome.is_postponed());
    }

    #[test]
    fn test_fan_in_prefers_cancelling_failure() {
        let cancelling = ActivityFailure::technical("fatal")
            .escalate(waymark_model::FailUrgency::CancelWorkflow);
        let outcome = fan_in(vec![
            Outcome::<i32>::Failed(ActivityFailure::technical("minor")),
            Outcome::Failed(cancelling),
        ]);
        match outcome {
            Outcome::Failed(f) => assert!(f.cancel_workflow),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_fan_in_failure_beats_postponement() {
        let outcome = fan_in(vec![
            Outcome::<i32>::Postponed(Postponement::resource("r")),
            Outcome::Failed(ActivityFailure::technical("boom")),
        ]);
        assert!(outcome.is_failed());
    }
}
