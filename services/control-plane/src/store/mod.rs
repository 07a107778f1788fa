//! Resource store interface.
//!
//! The store is the single owner of durable state. Controllers, the watcher
//! and the scheduler fetch owned copies and write back through [`ResourceStore::save`].
//! One writer per resource id is assumed; `save` is last-writer-wins.

mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use labfleet_id::ResourceId;
use thiserror::Error;

use crate::resources::{LabInstanceSpec, Resource, ResourceSpec, WorkerPoolSpec, WorkerSpec};

pub use memory::InMemoryStore;

/// Store errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("resource not found: {0}")]
    NotFound(ResourceId),

    /// The backend could not serve the request.
    #[error("store unavailable: {0}")]
    Backend(String),
}

/// CRUD over one resource kind.
#[async_trait]
pub trait ResourceStore<S: ResourceSpec>: Send + Sync {
    /// List resources, optionally restricted to a namespace and a label
    /// selector. Results are ordered by id.
    async fn list(
        &self,
        namespace: Option<&str>,
        selector: Option<&BTreeMap<String, String>>,
    ) -> Result<Vec<Resource<S>>, StoreError>;

    async fn get(&self, id: &ResourceId) -> Result<Option<Resource<S>>, StoreError>;

    /// Insert or replace.
    async fn save(&self, resource: &Resource<S>) -> Result<(), StoreError>;

    /// Remove; returns false when the id was already absent.
    async fn delete(&self, id: &ResourceId) -> Result<bool, StoreError>;

    /// Like [`get`](Self::get) but a missing resource is an error.
    async fn require(&self, id: &ResourceId) -> Result<Resource<S>, StoreError> {
        self.get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.clone()))
    }
}

pub type LabInstanceStore = dyn ResourceStore<LabInstanceSpec>;
pub type WorkerStore = dyn ResourceStore<WorkerSpec>;
pub type WorkerPoolStore = dyn ResourceStore<WorkerPoolSpec>;
