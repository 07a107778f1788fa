//! In-memory store.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use labfleet_id::ResourceId;
use tokio::sync::RwLock;

use super::{ResourceStore, StoreError};
use crate::resources::{Resource, ResourceSpec};

/// Map-backed store used by the development binary and tests.
pub struct InMemoryStore<S: ResourceSpec> {
    resources: RwLock<BTreeMap<ResourceId, Resource<S>>>,
    unavailable: AtomicBool,
}

impl<S: ResourceSpec> InMemoryStore<S> {
    pub fn new() -> Self {
        Self {
            resources: RwLock::new(BTreeMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }

    /// Make every call fail with [`StoreError::Backend`] until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.resources.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.resources.read().await.is_empty()
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(StoreError::Backend(format!("{} store is unavailable", S::KIND)))
        } else {
            Ok(())
        }
    }
}

impl<S: ResourceSpec> Default for InMemoryStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: ResourceSpec> ResourceStore<S> for InMemoryStore<S> {
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Resource<S>>, StoreError> {
        self.check_available()?;
        let resources = self.resources.read().await;
        Ok(resources
            .values()
            .filter(|r| namespace.is_none_or(|ns| r.namespace() == ns))
            .filter(|r| selector.is_none_or(|sel| r.metadata.matches_labels(sel)))
            .cloned()
            .collect())
    }

    async fn get(&self, id: &ResourceId) -> Result<Option<Resource<S>>, StoreError> {
        self.check_available()?;
        Ok(self.resources.read().await.get(id).cloned())
    }

    async fn save(&self, resource: &Resource<S>) -> Result<(), StoreError> {
        self.check_available()?;
        self.resources
            .write()
            .await
            .insert(resource.id().clone(), resource.clone());
        Ok(())
    }

    async fn delete(&self, id: &ResourceId) -> Result<bool, StoreError> {
        self.check_available()?;
        Ok(self.resources.write().await.remove(id).is_some())
    }
}
