//! Denormalized projection of an instance for external notification and
//! inspection.

use serde::{Deserialize, Serialize};

use crate::definition::{WorkflowForm, WorkflowVersion};
use crate::runtime::WorkflowInstance;

/// Instance + form + version in one row, kept fresh by create-or-update on
/// every persisted instance transition. "Already exists" is never a failure;
/// the row is updated instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSummary {
    pub form: WorkflowForm,
    pub version: WorkflowVersion,
    pub instance: WorkflowInstance,
}

impl WorkflowSummary {
    pub fn new(form: WorkflowForm, version: WorkflowVersion, instance: WorkflowInstance) -> Self {
        Self {
            form,
            version,
            instance,
        }
    }
}
