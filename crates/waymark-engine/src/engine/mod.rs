//! Workflow executor, registry and notification hook

pub mod executor;
pub mod notify;
pub mod registry;

pub use executor::{EngineConfig, EngineError, ExecutionOptions, WorkflowEngine};
pub use notify::{InstanceChangeListener, WorkflowInstanceChange};
pub use registry::{RegistryError, WorkflowImplementation, WorkflowRegistry};
