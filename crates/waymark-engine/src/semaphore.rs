//! Persisted, cross-instance semaphore and lock coordinator
//!
//! A named resource has a persisted count of current holders and a maximum
//! capacity (1 for a lock). Raising while the resource is full postpones
//! without a retry hint: the waiter is woken by whichever holder lowers the
//! resource, never by a blind timed retry.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;
use waymark_model::{SemaphoreHolder, SemaphoreRecord, SemaphoreWaiter};

use crate::outcome::{ActivityFailure, Outcome, Postponement};
use crate::persistence::{StoreError, WorkflowStore};

/// How often a raise/lower retries after losing an optimistic-concurrency
/// race before giving up.
const MAX_CAS_ATTEMPTS: usize = 8;

/// Emitted when a `lower` promotes a waiter; the transport uses it to
/// re-trigger the woken workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WakeUp {
    pub resource_id: String,
    pub workflow_instance_id: Uuid,
}

/// Coordinator over the persisted semaphore records.
#[derive(Clone)]
pub struct SemaphoreCoordinator {
    store: Arc<dyn WorkflowStore>,
    wake_tx: Option<mpsc::UnboundedSender<WakeUp>>,
}

impl SemaphoreCoordinator {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        wake_tx: Option<mpsc::UnboundedSender<WakeUp>>,
    ) -> Self {
        Self { store, wake_tx }
    }

    /// Try to become a holder of `resource_id`.
    ///
    /// Idempotent per holder: the same holder raising twice (e.g. on replay)
    /// never double-counts. When the resource is full the holder is enqueued
    /// as a waiter and the call postpones with `try_again = false`.
    pub async fn raise(
        &self,
        resource_id: &str,
        capacity: u32,
        holder_id: Uuid,
        workflow_instance_id: Uuid,
    ) -> Outcome<()> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut record = match self.store.semaphore(resource_id).await {
                Ok(Some(record)) => record,
                Ok(None) => SemaphoreRecord::new(resource_id, capacity),
                Err(e) => return Outcome::Failed(ActivityFailure::from(e)),
            };
            record.capacity = capacity.max(1);

            if record.holds(holder_id) {
                return Outcome::Completed(());
            }

            if record.has_capacity() {
                record.waiters.retain(|w| w.holder_id != holder_id);
                record.holders.push(SemaphoreHolder {
                    holder_id,
                    workflow_instance_id,
                    raised_at: Utc::now(),
                });
                match self.store.upsert_semaphore(&record).await {
                    Ok(_) => {
                        debug!(resource_id, %holder_id, "semaphore raised");
                        return Outcome::Completed(());
                    }
                    Err(StoreError::ConcurrencyConflict { .. }) => continue,
                    Err(e) => return Outcome::Failed(ActivityFailure::from(e)),
                }
            }

            // Full: enqueue as a waiter (idempotently) and postpone until an
            // explicit wake.
            if record.waiters.iter().any(|w| w.holder_id == holder_id) {
                return Outcome::Postponed(Postponement::resource(resource_id));
            }
            record.waiters.push(SemaphoreWaiter {
                holder_id,
                workflow_instance_id,
                enqueued_at: Utc::now(),
            });
            match self.store.upsert_semaphore(&record).await {
                Ok(_) => {
                    debug!(resource_id, %holder_id, "semaphore full, enqueued waiter");
                    return Outcome::Postponed(Postponement::resource(resource_id));
                }
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Outcome::Failed(ActivityFailure::from(e)),
            }
        }

        Outcome::Failed(ActivityFailure::capability(format!(
            "could not raise semaphore '{resource_id}' after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }

    /// Release a hold on `resource_id`.
    ///
    /// Idempotent: lowering a resource the holder does not hold is a no-op.
    /// Freed capacity goes to the first waiter, which is promoted to a holder
    /// and woken through the engine's wake channel.
    pub async fn lower(&self, resource_id: &str, holder_id: Uuid) -> Result<(), StoreError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let mut record = match self.store.semaphore(resource_id).await? {
                Some(record) => record,
                None => return Ok(()),
            };

            let held = record.holds(holder_id);
            let queued = record.waiters.iter().any(|w| w.holder_id == holder_id);
            if !held && !queued {
                return Ok(());
            }

            record.holders.retain(|h| h.holder_id != holder_id);
            record.waiters.retain(|w| w.holder_id != holder_id);

            let mut woken = Vec::new();
            while record.has_capacity() && !record.waiters.is_empty() {
                let waiter = record.waiters.remove(0);
                record.holders.push(SemaphoreHolder {
                    holder_id: waiter.holder_id,
                    workflow_instance_id: waiter.workflow_instance_id,
                    raised_at: Utc::now(),
                });
                woken.push(WakeUp {
                    resource_id: resource_id.to_string(),
                    workflow_instance_id: waiter.workflow_instance_id,
                });
            }

            match self.store.upsert_semaphore(&record).await {
                Ok(_) => {
                    debug!(resource_id, %holder_id, woken = woken.len(), "semaphore lowered");
                    if let Some(tx) = &self.wake_tx {
                        for wake in woken {
                            if tx.send(wake).is_err() {
                                warn!(resource_id, "wake channel closed, dropping wake-up");
                            }
                        }
                    }
                    return Ok(());
                }
                Err(StoreError::ConcurrencyConflict { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Err(StoreError::Database(format!(
            "could not lower semaphore '{resource_id}' after {MAX_CAS_ATTEMPTS} attempts"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryWorkflowStore;

    fn coordinator() -> (SemaphoreCoordinator, mpsc::UnboundedReceiver<WakeUp>) {
        let store: Arc<dyn WorkflowStore> = Arc::new(InMemoryWorkflowStore::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (SemaphoreCoordinator::new(store, Some(tx)), rx)
    }

    #[tokio::test]
    async fn test_capacity_one_second_holder_postpones_without_retry_hint() {
        let (coordinator, _rx) = coordinator();
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();

        let outcome = coordinator
            .raise("printer", 1, first, Uuid::now_v7())
            .await;
        assert!(outcome.is_completed());

        let outcome = coordinator
            .raise("printer", 1, second, Uuid::now_v7())
            .await;
        match outcome {
            Outcome::Postponed(p) => {
                assert!(!p.try_again);
                assert_eq!(p.try_again_after, None);
            }
            other => panic!("expected postponement, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_raise_is_idempotent_per_holder() {
        let (coordinator, _rx) = coordinator();
        let holder = Uuid::now_v7();
        let instance = Uuid::now_v7();

        assert!(coordinator.raise("r", 1, holder, instance).await.is_completed());
        assert!(coordinator.raise("r", 1, holder, instance).await.is_completed());

        // A second distinct holder still finds the resource full.
        let outcome = coordinator.raise("r", 1, Uuid::now_v7(), Uuid::now_v7()).await;
        assert!(outcome.is_postponed());
    }

    #[tokio::test]
    async fn test_lower_wakes_the_first_waiter() {
        let (coordinator, mut rx) = coordinator();
        let holder = Uuid::now_v7();
        let waiter = Uuid::now_v7();
        let waiter_instance = Uuid::now_v7();

        assert!(coordinator
            .raise("r", 1, holder, Uuid::now_v7())
            .await
            .is_completed());
        assert!(coordinator
            .raise("r", 1, waiter, waiter_instance)
            .await
            .is_postponed());

        coordinator.lower("r", holder).await.unwrap();

        let wake = rx.try_recv().unwrap();
        assert_eq!(wake.workflow_instance_id, waiter_instance);
        assert_eq!(wake.resource_id, "r");

        // The promoted waiter now holds the resource.
        assert!(coordinator
            .raise("r", 1, waiter, waiter_instance)
            .await
            .is_completed());
    }

    #[tokio::test]
    async fn test_lower_is_idempotent() {
        let (coordinator, _rx) = coordinator();
        let holder = Uuid::now_v7();

        assert!(coordinator
            .raise("r", 2, holder, Uuid::now_v7())
            .await
            .is_completed());
        coordinator.lower("r", holder).await.unwrap();
        coordinator.lower("r", holder).await.unwrap();
        coordinator.lower("never-raised", holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_capacity_two_admits_two_holders() {
        let (coordinator, _rx) = coordinator();

        assert!(coordinator
            .raise("pool", 2, Uuid::now_v7(), Uuid::now_v7())
            .await
            .is_completed());
        assert!(coordinator
            .raise("pool", 2, Uuid::now_v7(), Uuid::now_v7())
            .await
            .is_completed());
        assert!(coordinator
            .raise("pool", 2, Uuid::now_v7(), Uuid::now_v7())
            .await
            .is_postponed());
    }
}
