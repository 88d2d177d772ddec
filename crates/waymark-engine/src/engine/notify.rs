//! After-save notification hook for workflow instance changes

use async_trait::async_trait;
use waymark_model::{WorkflowForm, WorkflowInstance, WorkflowVersion};

/// What changed: the instance before and after one persisted transition,
/// with its form and version for context.
#[derive(Debug, Clone)]
pub struct WorkflowInstanceChange {
    pub form: WorkflowForm,
    pub version: WorkflowVersion,

    /// `None` on instance creation.
    pub old: Option<WorkflowInstance>,

    pub new: WorkflowInstance,
}

/// Callback fired exactly once per persisted workflow instance transition,
/// after the save. Used by external dashboards and notification pipelines.
#[async_trait]
pub trait InstanceChangeListener: Send + Sync + 'static {
    async fn on_instance_changed(&self, change: &WorkflowInstanceChange);
}
