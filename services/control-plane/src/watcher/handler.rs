//! Drives a controller from watcher changes.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use labfleet_id::ResourceId;
use labfleet_reconcile::{Clock, ReconcileResult};
use tracing::{debug, warn};

use super::{ChangeKind, ResourceChange, WatchHandler};
use crate::controllers::Controller;
use crate::resources::{Resource, ResourceSpec};
use crate::store::ResourceStore;

/// Runs `reconcile` on created, updated and self-reported stale resources,
/// `finalize` on deletions, and honours `requeue_after` hints after each tick.
pub struct ReconcileHandler<S: ResourceSpec> {
    controller: Arc<dyn Controller<S>>,
    store: Arc<dyn ResourceStore<S>>,
    clock: Arc<dyn Clock>,
    requeue: Mutex<BTreeMap<ResourceId, DateTime<Utc>>>,
    reconciled: Mutex<BTreeSet<ResourceId>>,
    pending_finalize: Mutex<BTreeMap<ResourceId, Resource<S>>>,
}

impl<S: ResourceSpec> ReconcileHandler<S> {
    pub fn new(
        controller: Arc<dyn Controller<S>>,
        store: Arc<dyn ResourceStore<S>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            controller,
            store,
            clock,
            requeue: Mutex::new(BTreeMap::new()),
            reconciled: Mutex::new(BTreeSet::new()),
            pending_finalize: Mutex::new(BTreeMap::new()),
        }
    }

    /// When `id` is next due, if a requeue is pending.
    pub fn requeue_at(&self, id: &ResourceId) -> Option<DateTime<Utc>> {
        lock(&self.requeue).get(id).copied()
    }

    /// Deleted resources whose finalizer has not succeeded yet.
    pub fn pending_finalizers(&self) -> usize {
        lock(&self.pending_finalize).len()
    }

    async fn reconcile(&self, resource: &Resource<S>) {
        let result = self.controller.reconcile(resource).await;
        self.record(resource.id(), &result);
    }

    fn record(&self, id: &ResourceId, result: &ReconcileResult) {
        if let Some(error) = &result.error {
            debug!(
                controller = self.controller.name(),
                resource = %id,
                error = %error,
                "Reconcile reported failure"
            );
        }

        lock(&self.reconciled).insert(id.clone());
        let mut requeue = lock(&self.requeue);
        match result.requeue_after {
            Some(after) => {
                let after = chrono::Duration::from_std(after).unwrap_or(chrono::Duration::MAX);
                requeue.insert(id.clone(), self.clock.now() + after);
            }
            None => {
                requeue.remove(id);
            }
        }
    }

    async fn finalize(&self, resource: &Resource<S>) {
        let id = resource.id().clone();
        lock(&self.requeue).remove(&id);

        if self.controller.finalize(resource).await {
            lock(&self.pending_finalize).remove(&id);
        } else {
            warn!(
                controller = self.controller.name(),
                resource = %id,
                "Finalize incomplete; will retry"
            );
            lock(&self.pending_finalize).insert(id, resource.clone());
        }
    }

    /// Ids whose requeue time has passed and that were not reconciled this
    /// tick.
    fn due(&self) -> Vec<ResourceId> {
        let now = self.clock.now();
        let reconciled = std::mem::take(&mut *lock(&self.reconciled));
        let mut requeue = lock(&self.requeue);

        let due: Vec<ResourceId> = requeue
            .iter()
            .filter(|(id, at)| **at <= now && !reconciled.contains(*id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &due {
            requeue.remove(id);
        }
        due
    }
}

#[async_trait]
impl<S: ResourceSpec> WatchHandler<S> for ReconcileHandler<S> {
    async fn on_change(&self, change: &ResourceChange<S>) {
        let resource = &change.resource;
        match change.kind {
            ChangeKind::Created | ChangeKind::Updated => self.reconcile(resource).await,
            ChangeKind::StatusUpdated => {
                if resource.needs_reconciliation() {
                    self.reconcile(resource).await;
                }
            }
            ChangeKind::Deleted => self.finalize(resource).await,
        }
    }

    async fn after_tick(&self) {
        let retries: Vec<Resource<S>> = lock(&self.pending_finalize).values().cloned().collect();
        for resource in retries {
            self.finalize(&resource).await;
        }

        for id in self.due() {
            match self.store.get(&id).await {
                Ok(Some(resource)) => self.reconcile(&resource).await,
                Ok(None) => {}
                Err(e) => {
                    warn!(resource = %id, error = %e, "Requeued resource could not be read");
                    let retry_at = self.clock.now() + chrono::Duration::seconds(5);
                    lock(&self.requeue).insert(id, retry_at);
                }
            }
        }
        lock(&self.reconciled).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lab_instance::tests::spec;
    use crate::resources::{InstanceType, LabInstancePhase, LabInstanceRequest, LabInstanceSpec};
    use crate::store::InMemoryStore;
    use crate::watcher::ResourceWatcher;
    use chrono::TimeZone;
    use labfleet_reconcile::ManualClock;
    use std::time::Duration;

    /// Requeues every resource after 30 s; finalize fails `failures` times.
    #[derive(Default)]
    struct Counting {
        reconciles: Mutex<Vec<String>>,
        finalizes: Mutex<usize>,
        failures: Mutex<usize>,
    }

    #[async_trait]
    impl Controller<LabInstanceSpec> for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn reconcile(&self, resource: &LabInstanceRequest) -> ReconcileResult {
            lock(&self.reconciles).push(resource.name().to_string());
            ReconcileResult::requeue(Duration::from_secs(30))
        }

        async fn finalize(&self, _resource: &LabInstanceRequest) -> bool {
            *lock(&self.finalizes) += 1;
            let mut failures = lock(&self.failures);
            if *failures > 0 {
                *failures -= 1;
                false
            } else {
                true
            }
        }
    }

    struct Harness {
        store: Arc<InMemoryStore<LabInstanceSpec>>,
        clock: Arc<ManualClock>,
        controller: Arc<Counting>,
        handler: Arc<ReconcileHandler<LabInstanceSpec>>,
        watcher: ResourceWatcher<LabInstanceSpec>,
    }

    fn harness() -> Harness {
        let store: Arc<InMemoryStore<LabInstanceSpec>> = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap(),
        ));
        let controller = Arc::new(Counting::default());
        let handler = Arc::new(ReconcileHandler::<LabInstanceSpec>::new(
            controller.clone(),
            store.clone(),
            clock.clone(),
        ));
        let mut watcher: ResourceWatcher<LabInstanceSpec> = ResourceWatcher::new(store.clone());
        watcher.add_handler(handler.clone());
        Harness {
            store,
            clock,
            controller,
            handler,
            watcher,
        }
    }

    fn lab(name: &str, at: DateTime<Utc>) -> LabInstanceRequest {
        LabInstanceRequest::create("labs", name, spec(InstanceType::Container), at).unwrap()
    }

    #[tokio::test]
    async fn test_requeue_fires_once_due() {
        let h = harness();
        let a = lab("lab-a", h.clock.now());
        h.store.save(&a).await.unwrap();

        h.watcher.tick().await.unwrap();
        assert_eq!(*lock(&h.controller.reconciles), vec!["lab-a"]);
        assert_eq!(
            h.handler.requeue_at(a.id()),
            Some(h.clock.now() + chrono::Duration::seconds(30))
        );

        h.clock.advance(Duration::from_secs(10));
        h.watcher.tick().await.unwrap();
        assert_eq!(lock(&h.controller.reconciles).len(), 1);

        h.clock.advance(Duration::from_secs(25));
        h.watcher.tick().await.unwrap();
        assert_eq!(lock(&h.controller.reconciles).len(), 2);
    }

    #[tokio::test]
    async fn test_status_update_consults_needs_reconciliation() {
        let h = harness();
        let mut a = lab("lab-a", h.clock.now());
        h.store.save(&a).await.unwrap();
        h.watcher.tick().await.unwrap();

        // Pending without assignment: not transitional, generation observed.
        a.mark_observed();
        a.status.lifecycle.error_message = Some("noise".to_string());
        h.store.save(&a).await.unwrap();
        h.watcher.tick().await.unwrap();
        assert_eq!(lock(&h.controller.reconciles).len(), 1);

        a.transition_to_phase(LabInstancePhase::Scheduling, "test", h.clock.now())
            .unwrap();
        h.store.save(&a).await.unwrap();
        h.watcher.tick().await.unwrap();
        assert_eq!(lock(&h.controller.reconciles).len(), 2);
    }

    #[tokio::test]
    async fn test_failed_finalize_is_retried() {
        let h = harness();
        *lock(&h.controller.failures) = 1;
        let a = lab("lab-a", h.clock.now());
        h.store.save(&a).await.unwrap();
        h.watcher.tick().await.unwrap();

        h.store.delete(a.id()).await.unwrap();
        h.watcher.tick().await.unwrap();
        // Deleted change failed, the after-tick retry succeeded.
        assert_eq!(*lock(&h.controller.finalizes), 2);
        assert_eq!(h.handler.pending_finalizers(), 0);
        assert!(h.handler.requeue_at(a.id()).is_none());

        h.watcher.tick().await.unwrap();
        assert_eq!(*lock(&h.controller.finalizes), 2);
    }
}
