//! Workflow implementations and their type-erased registry
//!
//! The registry lets the executor resolve the implementation for an existing
//! instance by form id and major version, working with workflows without
//! knowing their concrete types.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome};

/// A workflow capability: ordinary imperative code the engine makes
/// resumable.
///
/// # Determinism
///
/// The body replays from the top on every tick, relying on memoized activity
/// results to skip completed steps. It must therefore create activities in
/// the same order given the same inputs and memoized results; that contract
/// is what keeps position addressing stable across ticks.
///
/// # Example
///
/// ```ignore
/// use waymark_engine::prelude::*;
///
/// struct OrderWorkflow;
///
/// #[async_trait]
/// impl WorkflowImplementation for OrderWorkflow {
///     const CAPABILITY: &'static str = "order-fulfilment";
///     const FORM_ID: Uuid = Uuid::from_u128(0x8f2f27cf84f447d8b1c6d1f7a9e0c001);
///     const MAJOR_VERSION: u32 = 1;
///     const MINOR_VERSION: u32 = 0;
///     const TITLE: &'static str = "Order fulfilment";
///     type Output = OrderResult;
///
///     async fn run(&self, ctx: &WorkflowContext) -> Outcome<OrderResult> {
///         let order: Order = match ctx.parameter("order") {
///             Ok(order) => order,
///             Err(failure) => return Outcome::Failed(failure),
///         };
///         let reserved = try_outcome!(
///             ctx.activity(RESERVE_FORM, "Reserve stock")
///                 .run(|step| reserve_stock(step, order.clone()))
///                 .await
///         );
///         // ...
///         Outcome::Completed(OrderResult { reserved })
///     }
/// }
/// ```
#[async_trait]
pub trait WorkflowImplementation: Send + Sync + 'static {
    /// Stable capability name of the workflow form.
    const CAPABILITY: &'static str;

    /// Id of the workflow form this implementation belongs to.
    const FORM_ID: Uuid;

    /// Major version implemented; instances of other majors resolve to other
    /// implementations.
    const MAJOR_VERSION: u32;

    /// Minor version, informational.
    const MINOR_VERSION: u32;

    /// Human-readable title, used in instance titles.
    const TITLE: &'static str;

    /// Result type of a successful run.
    type Output: Serialize + DeserializeOwned + Send;

    /// One tick of the workflow's code.
    async fn run(&self, ctx: &WorkflowContext) -> Outcome<Self::Output>;

    /// Whether new instances may be created dynamically against this
    /// version.
    fn dynamic_create() -> bool {
        true
    }
}

/// Type-erased workflow implementation interface
#[async_trait]
pub trait AnyWorkflowImplementation: Send + Sync {
    fn capability(&self) -> &'static str;
    fn form_id(&self) -> Uuid;
    fn major_version(&self) -> u32;
    fn minor_version(&self) -> u32;
    fn title(&self) -> &'static str;
    fn dynamic_create(&self) -> bool;

    /// Run one tick, with the result serialized to JSON.
    async fn run_erased(&self, ctx: &WorkflowContext) -> Outcome<Value>;
}

/// Wrapper to implement AnyWorkflowImplementation for any WorkflowImplementation
struct ImplementationWrapper<W: WorkflowImplementation> {
    inner: W,
}

#[async_trait]
impl<W: WorkflowImplementation> AnyWorkflowImplementation for ImplementationWrapper<W> {
    fn capability(&self) -> &'static str {
        W::CAPABILITY
    }

    fn form_id(&self) -> Uuid {
        W::FORM_ID
    }

    fn major_version(&self) -> u32 {
        W::MAJOR_VERSION
    }

    fn minor_version(&self) -> u32 {
        W::MINOR_VERSION
    }

    fn title(&self) -> &'static str {
        W::TITLE
    }

    fn dynamic_create(&self) -> bool {
        W::dynamic_create()
    }

    async fn run_erased(&self, ctx: &WorkflowContext) -> Outcome<Value> {
        match self.inner.run(ctx).await {
            Outcome::Completed(value) => match serde_json::to_value(&value) {
                Ok(json) => Outcome::Completed(json),
                Err(e) => Outcome::Failed(ActivityFailure::from(e)),
            },
            Outcome::Postponed(p) => Outcome::Postponed(p),
            Outcome::Failed(f) => Outcome::Failed(f),
        }
    }
}

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// No implementation registered for the form and major version
    #[error("no workflow implementation registered for form {form_id} major version {major_version}")]
    NotRegistered { form_id: Uuid, major_version: u32 },
}

/// Registry of workflow implementations keyed by form id and major version
#[derive(Default)]
pub struct WorkflowRegistry {
    implementations: HashMap<(Uuid, u32), Arc<dyn AnyWorkflowImplementation>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow implementation
    pub fn register<W: WorkflowImplementation>(&mut self, implementation: W) {
        self.implementations.insert(
            (W::FORM_ID, W::MAJOR_VERSION),
            Arc::new(ImplementationWrapper {
                inner: implementation,
            }),
        );
    }

    /// Resolve the implementation for a form and major version
    pub fn resolve(
        &self,
        form_id: Uuid,
        major_version: u32,
    ) -> Result<Arc<dyn AnyWorkflowImplementation>, RegistryError> {
        self.implementations
            .get(&(form_id, major_version))
            .cloned()
            .ok_or(RegistryError::NotRegistered {
                form_id,
                major_version,
            })
    }

    pub fn len(&self) -> usize {
        self.implementations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }
}
