//! Handle passed to activity bodies during execution

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use uuid::Uuid;
use waymark_model::ActivityInstance;

use super::executor::save_activity_row;
use super::options::ActivityOptions;
use crate::bridge::{self, OutboundRequest, OutboundResponse};
use crate::context::WorkflowContext;
use crate::outcome::{ActivityFailure, Outcome};

/// Handle an activity body receives while it runs.
///
/// The step gives the body a child [`WorkflowContext`] for creating nested
/// activities, access to the activity's persisted context dictionary, and the
/// outbound-call entry point that redirects through the async request service
/// in asynchronous mode.
pub struct ActivityStep {
    ctx: WorkflowContext,
    row: Arc<Mutex<ActivityInstance>>,
    options: ActivityOptions,
    outbound_calls: Arc<AtomicU32>,
}

impl ActivityStep {
    pub(crate) fn new(
        ctx: WorkflowContext,
        row: Arc<Mutex<ActivityInstance>>,
        options: ActivityOptions,
    ) -> Self {
        Self {
            ctx,
            row,
            options,
            outbound_calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Context for creating nested activities under this one.
    pub fn context(&self) -> &WorkflowContext {
        &self.ctx
    }

    /// Id of the activity instance this body runs for. Stable across replays,
    /// which makes it the holder identity for semaphores and locks.
    pub fn activity_instance_id(&self) -> Uuid {
        self.row.lock().id
    }

    /// How many times this body has been attempted, including this one.
    pub fn attempt(&self) -> u32 {
        self.row.lock().attempts
    }

    pub(crate) fn options(&self) -> &ActivityOptions {
        &self.options
    }

    /// Sibling step scoped to a loop or fan-out iteration: every activity the
    /// body creates under it carries `iteration` in its identity.
    pub(crate) fn for_iteration(&self, iteration: u32) -> Self {
        Self {
            ctx: self.ctx.with_iteration(iteration),
            row: self.row.clone(),
            options: self.options.clone(),
            outbound_calls: self.outbound_calls.clone(),
        }
    }

    /// Read a value from the activity's persisted context dictionary.
    pub fn get_context_value<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let row = self.row.lock();
        let map = row.context_as_json.as_ref()?.as_object()?;
        serde_json::from_value(map.get(key)?.clone()).ok()
    }

    /// Write a value to the activity's persisted context dictionary.
    ///
    /// The write is durable before this returns; the dictionary is how
    /// primitives remember facts (a sleep's wake time, issued request ids)
    /// across ticks.
    pub async fn set_context_value<T: Serialize>(
        &self,
        key: &str,
        value: &T,
    ) -> Result<(), ActivityFailure> {
        let json = serde_json::to_value(value)?;
        {
            let mut row = self.row.lock();
            let map = match row.context_as_json.take() {
                Some(Value::Object(map)) => {
                    let mut map = map;
                    map.insert(key.to_string(), json);
                    map
                }
                _ => {
                    let mut map = Map::new();
                    map.insert(key.to_string(), json);
                    map
                }
            };
            row.context_as_json = Some(Value::Object(map));
        }
        save_activity_row(&self.ctx.inner.store, &self.row)
            .await
            .map_err(|e| ActivityFailure::from(e).for_activity(self.activity_instance_id()))
    }

    /// Send an outbound request from inside this activity.
    ///
    /// In synchronous mode the request goes straight out through the
    /// configured HTTP sender. In asynchronous mode it is registered with the
    /// async request service and the step postpones until the response
    /// exists; replayed ticks resume with the stored response as if the call
    /// had completed synchronously.
    pub async fn send_request(&self, request: OutboundRequest) -> Outcome<OutboundResponse> {
        bridge::send_intercepted(self, request).await
    }

    /// Ordinal of the next outbound call within this body invocation.
    pub(crate) fn next_outbound_ordinal(&self) -> usize {
        self.outbound_calls.fetch_add(1, Ordering::Relaxed) as usize
    }
}
