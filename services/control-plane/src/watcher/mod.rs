//! Polling resource watcher.
//!
//! Each tick lists the store, diffs the result against the previous tick's
//! snapshot and hands every change to the registered handlers in order. The
//! snapshot is replaced wholesale after the diff.

mod handler;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use labfleet_id::ResourceId;
use tokio::sync::watch;
use tracing::{debug, info, instrument, warn};

use crate::resources::{Resource, ResourceSpec};
use crate::store::{ResourceStore, StoreError};

pub use handler::ReconcileHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    /// Id not seen last tick.
    Created,
    /// Generation or spec changed.
    Updated,
    /// Only the status changed.
    StatusUpdated,
    /// Id seen last tick but gone now.
    Deleted,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::StatusUpdated => "status_updated",
            Self::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observed change. For `Deleted` the resource is the last cached copy.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceChange<S: ResourceSpec> {
    pub kind: ChangeKind,
    pub resource: Resource<S>,
}

/// Classify `after` against its previous observation.
pub fn classify<S: ResourceSpec>(before: &Resource<S>, after: &Resource<S>) -> Option<ChangeKind> {
    if before.metadata.generation != after.metadata.generation
        || before.spec_hash() != after.spec_hash()
    {
        Some(ChangeKind::Updated)
    } else if before.status != after.status {
        Some(ChangeKind::StatusUpdated)
    } else {
        None
    }
}

/// Changes between the cached snapshot and the current listing, in listing
/// order with deletions last.
pub fn diff<S: ResourceSpec>(
    previous: &BTreeMap<ResourceId, Resource<S>>,
    current: &[Resource<S>],
) -> Vec<ResourceChange<S>> {
    let mut changes = Vec::new();
    let mut seen = BTreeSet::new();

    for resource in current {
        seen.insert(resource.id());
        let kind = match previous.get(resource.id()) {
            None => Some(ChangeKind::Created),
            Some(before) => classify(before, resource),
        };
        if let Some(kind) = kind {
            changes.push(ResourceChange {
                kind,
                resource: resource.clone(),
            });
        }
    }

    for (id, resource) in previous {
        if !seen.contains(id) {
            changes.push(ResourceChange {
                kind: ChangeKind::Deleted,
                resource: resource.clone(),
            });
        }
    }

    changes
}

/// Receives changes from a [`ResourceWatcher`].
#[async_trait]
pub trait WatchHandler<S: ResourceSpec>: Send + Sync {
    async fn on_change(&self, change: &ResourceChange<S>);

    /// Called once after every tick's changes have been dispatched.
    async fn after_tick(&self) {}
}

/// Per-tick counts.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WatchStats {
    pub observed: usize,
    pub created: usize,
    pub updated: usize,
    pub status_updated: usize,
    pub deleted: usize,
}

impl WatchStats {
    fn count(&mut self, kind: ChangeKind) {
        match kind {
            ChangeKind::Created => self.created += 1,
            ChangeKind::Updated => self.updated += 1,
            ChangeKind::StatusUpdated => self.status_updated += 1,
            ChangeKind::Deleted => self.deleted += 1,
        }
    }

    pub fn changes(&self) -> usize {
        self.created + self.updated + self.status_updated + self.deleted
    }
}

pub struct ResourceWatcher<S: ResourceSpec> {
    store: Arc<dyn ResourceStore<S>>,
    namespace: Option<String>,
    selector: Option<BTreeMap<String, String>>,
    handlers: Vec<Arc<dyn WatchHandler<S>>>,
    cache: Mutex<BTreeMap<ResourceId, Resource<S>>>,
}

impl<S: ResourceSpec> ResourceWatcher<S> {
    pub fn new(store: Arc<dyn ResourceStore<S>>) -> Self {
        Self {
            store,
            namespace: None,
            selector: None,
            handlers: Vec::new(),
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_namespace(mut self, namespace: Option<String>) -> Self {
        self.namespace = namespace;
        self
    }

    pub fn with_selector(mut self, selector: BTreeMap<String, String>) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Handlers run sequentially, in registration order.
    pub fn add_handler(&mut self, handler: Arc<dyn WatchHandler<S>>) {
        self.handlers.push(handler);
    }

    /// Resources observed on the last successful tick.
    pub fn cached(&self) -> usize {
        self.lock_cache().len()
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, BTreeMap<ResourceId, Resource<S>>> {
        self.cache.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// List, diff, replace the snapshot, dispatch.
    ///
    /// A failed listing leaves the snapshot untouched.
    #[instrument(skip(self), fields(kind = S::KIND))]
    pub async fn tick(&self) -> Result<WatchStats, StoreError> {
        let current = self
            .store
            .list(self.namespace.as_deref(), self.selector.as_ref())
            .await?;

        let changes = {
            let mut cache = self.lock_cache();
            let changes = diff(&cache, &current);
            *cache = current
                .iter()
                .map(|r| (r.id().clone(), r.clone()))
                .collect();
            changes
        };

        let mut stats = WatchStats {
            observed: current.len(),
            ..Default::default()
        };
        for change in &changes {
            stats.count(change.kind);
            debug!(resource = %change.resource.id(), change = %change.kind, "Resource changed");
            for handler in &self.handlers {
                handler.on_change(change).await;
            }
        }
        for handler in &self.handlers {
            handler.after_tick().await;
        }

        Ok(stats)
    }

    /// Tick on `interval` until shutdown is signaled.
    #[instrument(skip(self, shutdown), fields(kind = S::KIND))]
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(interval_secs = interval.as_secs(), "Starting resource watcher");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(stats) if stats.changes() > 0 => {
                            debug!(
                                observed = stats.observed,
                                created = stats.created,
                                updated = stats.updated,
                                status_updated = stats.status_updated,
                                deleted = stats.deleted,
                                "Watch tick complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "Listing failed; skipping tick"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Resource watcher shutting down");
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::lab_instance::tests::spec;
    use crate::resources::{InstanceType, LabInstancePhase, LabInstanceRequest, LabInstanceSpec};
    use crate::store::InMemoryStore;
    use chrono::Utc;

    fn lab(name: &str) -> LabInstanceRequest {
        LabInstanceRequest::create("labs", name, spec(InstanceType::Container), Utc::now()).unwrap()
    }

    fn snapshot(resources: &[LabInstanceRequest]) -> BTreeMap<ResourceId, LabInstanceRequest> {
        resources.iter().map(|r| (r.id().clone(), r.clone())).collect()
    }

    fn kinds(changes: &[ResourceChange<LabInstanceSpec>]) -> Vec<(String, ChangeKind)> {
        changes
            .iter()
            .map(|c| (c.resource.name().to_string(), c.kind))
            .collect()
    }

    #[test]
    fn test_diff_classification() {
        let (a, b, c) = (lab("lab-a"), lab("lab-b"), lab("lab-c"));
        let previous = snapshot(&[a.clone(), b.clone(), c.clone()]);

        let mut a2 = a.clone();
        a2.status.lab_id = Some("lab-00000001".to_string());
        let mut b2 = b.clone();
        let mut new_spec = b.spec.clone();
        new_spec.duration_minutes = 90;
        b2.update_spec(new_spec, Utc::now()).unwrap();
        let d = lab("lab-d");

        let changes = diff(&previous, &[a2, b2, d]);
        assert_eq!(
            kinds(&changes),
            vec![
                ("lab-a".to_string(), ChangeKind::StatusUpdated),
                ("lab-b".to_string(), ChangeKind::Updated),
                ("lab-d".to_string(), ChangeKind::Created),
                ("lab-c".to_string(), ChangeKind::Deleted),
            ]
        );
    }

    #[test]
    fn test_unchanged_resource_is_silent() {
        let a = lab("lab-a");
        assert!(diff(&snapshot(std::slice::from_ref(&a)), &[a]).is_empty());
    }

    #[test]
    fn test_spec_change_without_generation_bump_is_update() {
        let a = lab("lab-a");
        let mut edited = a.clone();
        edited.spec.template = "ccna-eigrp".to_string();
        assert_eq!(classify(&a, &edited), Some(ChangeKind::Updated));

        let mut moved = a.clone();
        moved
            .transition_to_phase(LabInstancePhase::Scheduling, "test", Utc::now())
            .unwrap();
        assert_eq!(classify(&a, &moved), Some(ChangeKind::StatusUpdated));
    }

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(String, ChangeKind)>>,
        ticks: Mutex<usize>,
    }

    #[async_trait]
    impl WatchHandler<LabInstanceSpec> for Recorder {
        async fn on_change(&self, change: &ResourceChange<LabInstanceSpec>) {
            self.seen
                .lock()
                .unwrap()
                .push((change.resource.name().to_string(), change.kind));
        }

        async fn after_tick(&self) {
            *self.ticks.lock().unwrap() += 1;
        }
    }

    #[tokio::test]
    async fn test_tick_dispatches_and_replaces_snapshot() {
        let store: Arc<InMemoryStore<LabInstanceSpec>> = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(Recorder::default());
        let mut watcher: ResourceWatcher<LabInstanceSpec> = ResourceWatcher::new(store.clone());
        watcher.add_handler(recorder.clone());

        let a = lab("lab-a");
        store.save(&a).await.unwrap();
        let stats = watcher.tick().await.unwrap();
        assert_eq!(stats.created, 1);

        let stats = watcher.tick().await.unwrap();
        assert_eq!(stats.changes(), 0);

        store.delete(a.id()).await.unwrap();
        let stats = watcher.tick().await.unwrap();
        assert_eq!(stats.deleted, 1);
        assert_eq!(watcher.cached(), 0);

        assert_eq!(
            *recorder.seen.lock().unwrap(),
            vec![
                ("lab-a".to_string(), ChangeKind::Created),
                ("lab-a".to_string(), ChangeKind::Deleted),
            ]
        );
        assert_eq!(*recorder.ticks.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_listing_keeps_snapshot() {
        let store: Arc<InMemoryStore<LabInstanceSpec>> = Arc::new(InMemoryStore::new());
        let watcher: ResourceWatcher<LabInstanceSpec> = ResourceWatcher::new(store.clone());
        store.save(&lab("lab-a")).await.unwrap();
        watcher.tick().await.unwrap();

        store.set_unavailable(true);
        assert!(watcher.tick().await.is_err());
        assert_eq!(watcher.cached(), 1);

        store.set_unavailable(false);
        assert_eq!(watcher.tick().await.unwrap().changes(), 0);
    }

    #[tokio::test]
    async fn test_namespace_filter() {
        let store: Arc<InMemoryStore<LabInstanceSpec>> = Arc::new(InMemoryStore::new());
        let watcher: ResourceWatcher<LabInstanceSpec> =
            ResourceWatcher::new(store.clone()).with_namespace(Some("labs".into()));
        store.save(&lab("lab-a")).await.unwrap();
        let other = LabInstanceRequest::create(
            "other",
            "lab-b",
            spec(InstanceType::Container),
            Utc::now(),
        )
        .unwrap();
        store.save(&other).await.unwrap();

        assert_eq!(watcher.tick().await.unwrap().observed, 1);
    }
}
