//! Definition entities: the configured, versioned shape of a workflow.
//!
//! These rows are authored by a configuration service and read by the engine.
//! Activity forms and versions are additionally registered lazily by the
//! engine on first execution through conflict-aware upserts, so authoring
//! services and running engines converge on the same rows.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::position::Position;

/// A named workflow type (capability).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowForm {
    pub id: Uuid,

    /// Stable capability name, unique across forms.
    pub capability_name: String,

    pub title: String,

    /// Optimistic-concurrency token, regenerated on every update.
    pub etag: String,
}

/// One `(major, minor)` version of a workflow form.
///
/// Versions are immutable once published; a new minor version is published
/// instead of editing an existing one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_form_id: Uuid,
    pub major_version: u32,
    pub minor_version: u32,

    /// Whether new instances may be created dynamically against this version.
    pub dynamic_create: bool,

    pub etag: String,
}

impl WorkflowVersion {
    /// Version string in the `major.minor` form used in instance titles.
    pub fn version_string(&self) -> String {
        format!("{}.{}", self.major_version, self.minor_version)
    }
}

/// The closed set of control-flow primitives an activity can be.
///
/// The kind decides, at the single executor boundary, whether a stored
/// `Success` short-circuits replay: value-producing kinds memoize, while
/// condition-bearing kinds re-evaluate their predicate on every tick and rely
/// on their children's memoization instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Action,
    If,
    Switch,
    ForEachParallel,
    ForEachSequential,
    Parallel,
    Sleep,
    WhileDo,
    DoUntil,
    Lock,
    Semaphore,
    Throttle,
}

impl ActivityKind {
    /// Whether a stored `Success` result is returned without re-running the
    /// activity body.
    pub fn memoizes(self) -> bool {
        !matches!(
            self,
            Self::If
                | Self::Switch
                | Self::ForEachParallel
                | Self::ForEachSequential
                | Self::Parallel
                | Self::WhileDo
                | Self::DoUntil
        )
    }
}

impl std::fmt::Display for ActivityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Action => "action",
            Self::If => "if",
            Self::Switch => "switch",
            Self::ForEachParallel => "for_each_parallel",
            Self::ForEachSequential => "for_each_sequential",
            Self::Parallel => "parallel",
            Self::Sleep => "sleep",
            Self::WhileDo => "while_do",
            Self::DoUntil => "do_until",
            Self::Lock => "lock",
            Self::Semaphore => "semaphore",
            Self::Throttle => "throttle",
        };
        write!(f, "{name}")
    }
}

/// Policy for what an unhandled activity failure does to its surroundings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailUrgency {
    /// Fail the activity's subtree and stop; the enclosing workflow fails.
    #[default]
    Stopping,

    /// Unwind all the way and cancel the whole workflow instance.
    CancelWorkflow,
}

/// A named activity type, independent of any one workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityForm {
    pub id: Uuid,
    pub kind: ActivityKind,
    pub title: String,
    pub etag: String,
}

/// An activity form's place inside one workflow version's tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityVersion {
    pub id: Uuid,
    pub workflow_version_id: Uuid,
    pub activity_form_id: Uuid,
    pub position: Position,
    pub parent_activity_version_id: Option<Uuid>,
    pub fail_urgency: FailUrgency,
    pub etag: String,
}

/// Configuration-time edge between activity versions.
///
/// Used for visualization and validation of authored workflows, never for
/// execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub id: Uuid,
    pub workflow_version_id: Uuid,

    /// `None` means the edge starts at the workflow entry.
    pub from_activity_version_id: Option<Uuid>,

    pub to_activity_version_id: Uuid,
    pub etag: String,
}

/// A named, typed parameter declared on a workflow or activity version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodParameter {
    pub id: Uuid,

    /// The workflow or activity version this parameter belongs to.
    pub owner_version_id: Uuid,

    pub name: String,

    /// Declared JSON type (e.g. `"string"`, `"number"`, `"object"`).
    pub data_type: String,

    pub etag: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memoizing_kinds() {
        assert!(ActivityKind::Action.memoizes());
        assert!(ActivityKind::Sleep.memoizes());
        assert!(ActivityKind::Lock.memoizes());

        assert!(!ActivityKind::If.memoizes());
        assert!(!ActivityKind::Switch.memoizes());
        assert!(!ActivityKind::ForEachParallel.memoizes());
        assert!(!ActivityKind::DoUntil.memoizes());
    }

    #[test]
    fn test_fail_urgency_default() {
        assert_eq!(FailUrgency::default(), FailUrgency::Stopping);
    }

    #[test]
    fn test_kind_serialization() {
        let json = serde_json::to_string(&ActivityKind::ForEachParallel).unwrap();
        assert_eq!(json, "\"for_each_parallel\"");

        let parsed: ActivityKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ActivityKind::ForEachParallel);
    }

    #[test]
    fn test_version_string() {
        let version = WorkflowVersion {
            id: Uuid::nil(),
            workflow_form_id: Uuid::nil(),
            major_version: 2,
            minor_version: 7,
            dynamic_create: true,
            etag: String::new(),
        };
        assert_eq!(version.version_string(), "2.7");
    }
}
