//! Entity model for the waymark workflow engine.
//!
//! Definition entities (forms, versions, transitions, parameters) describe a
//! workflow's configured shape; they are authored by a configuration service
//! and versioned, immutable once published. Runtime entities (instances,
//! summaries, semaphores) are created and advanced by the engine on every
//! tick. Every mutable row carries an optimistic-concurrency token (`etag`)
//! that must be presented on update.

pub mod definition;
pub mod position;
pub mod runtime;
pub mod summary;

pub use definition::{
    ActivityForm, ActivityKind, ActivityVersion, FailUrgency, MethodParameter, Transition,
    WorkflowForm, WorkflowVersion,
};
pub use position::Position;
pub use runtime::{
    ActivityInstance, ActivityInstanceKey, ActivityInstanceState, FailureCategory, JobResults,
    SemaphoreHolder, SemaphoreRecord, SemaphoreWaiter, WorkflowInstance, WorkflowInstanceState,
};
pub use summary::WorkflowSummary;
