//! # Waymark Workflow Engine
//!
//! A replay-driven engine that lets a program express a long-running
//! business process as ordinary imperative code while the engine makes it
//! resumable across process restarts, network failures and external calls
//! that may take hours to answer.
//!
//! ## How replay works
//!
//! Workflow code runs from the top on every trigger ("tick"). Each activity
//! it creates is addressed by its position in the activity tree (plus an
//! iteration number inside loops and fan-outs); a step that already reached
//! `Success` on an earlier tick returns its memoized result without running
//! again, and a step that cannot finish yet returns a postponement that ends
//! the tick cleanly without losing or duplicating side effects.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      WorkflowEngine                          │
//! │   (tick driver, instance lifecycle, run-time budget)        │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Control-flow activity library                   │
//! │  (action, if/switch, foreach, parallel, sleep, loops,       │
//! │   lock/semaphore/throttle - thin policies over the core)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Activity executor                         │
//! │  (find-or-create row, memoize, suspend, persist outcome)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     WorkflowStore                            │
//! │        (in-memory for tests, PostgreSQL in production)      │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use waymark_engine::prelude::*;
//!
//! struct GreetingWorkflow;
//!
//! #[async_trait]
//! impl WorkflowImplementation for GreetingWorkflow {
//!     const CAPABILITY: &'static str = "greeting";
//!     const FORM_ID: Uuid = Uuid::from_u128(0x01);
//!     const MAJOR_VERSION: u32 = 1;
//!     const MINOR_VERSION: u32 = 0;
//!     const TITLE: &'static str = "Greeting";
//!     type Output = String;
//!
//!     async fn run(&self, ctx: &WorkflowContext) -> Outcome<String> {
//!         let name = try_outcome!(
//!             ctx.activity(Uuid::from_u128(0x02), "Resolve name")
//!                 .run(|_step| async { Outcome::Completed("world".to_string()) })
//!                 .await
//!         );
//!         Outcome::Completed(format!("hello, {name}"))
//!     }
//! }
//! ```

pub mod activity;
pub mod bridge;
pub mod context;
pub mod engine;
pub mod flow;
pub mod outcome;
pub mod persistence;
pub mod semaphore;

/// Prelude for common imports
pub mod prelude {
    pub use crate::activity::{ActivityOptions, ActivityStep, Recovery};
    pub use crate::bridge::{
        AsyncRequestService, HttpSender, InMemoryAsyncRequestService, OutboundRequest,
        OutboundResponse, ReqwestSender,
    };
    pub use crate::context::WorkflowContext;
    pub use crate::engine::{
        EngineConfig, EngineError, ExecutionOptions, InstanceChangeListener,
        WorkflowEngine, WorkflowImplementation, WorkflowInstanceChange,
    };
    pub use crate::flow::{ParallelBuilder, SwitchBuilder};
    pub use crate::outcome::{ActivityFailure, Outcome, PostponeReason, Postponement};
    pub use crate::persistence::{
        InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore,
    };
    pub use crate::semaphore::{SemaphoreCoordinator, WakeUp};
    pub use crate::try_outcome;
    pub use async_trait::async_trait;
    pub use uuid::Uuid;
    pub use waymark_model::{
        ActivityInstanceState, FailUrgency, FailureCategory, JobResults, Position,
        WorkflowInstanceState,
    };
}

// Re-export key types at crate root
pub use activity::{ActivityBuilder, ActivityOptions, ActivityStep, Recovery};
pub use bridge::{
    AsyncRequestService, BridgeError, HttpSender, InMemoryAsyncRequestService, OutboundRequest,
    OutboundResponse, ReqwestSender,
};
pub use context::WorkflowContext;
pub use engine::{
    EngineConfig, EngineError, ExecutionOptions, InstanceChangeListener, WorkflowEngine,
    WorkflowImplementation, WorkflowInstanceChange, WorkflowRegistry,
};
pub use outcome::{ActivityFailure, Outcome, PostponeReason, Postponement};
pub use persistence::{InMemoryWorkflowStore, PostgresWorkflowStore, StoreError, WorkflowStore};
pub use semaphore::{SemaphoreCoordinator, WakeUp};
