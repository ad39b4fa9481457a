use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use crate::domain::models::experiment::PatchType;
use crate::domain::models::meta::{ObjectReference, Resource};
use crate::domain::models::selector::LabelSelector;
use crate::domain::ports::errors::StoreError;

/// Filters for listing objects of one kind
#[derive(Default, Debug, Clone)]
pub struct ListParams {
    /// Restrict to a namespace, all namespaces when unset
    pub namespace: Option<String>,
    pub selector: Option<LabelSelector>,
}

impl ListParams {
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            selector: None,
        }
    }

    #[must_use]
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = Some(selector);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

/// Change notification emitted by the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub event_type: WatchEventType,
    pub object: ObjectReference,
    /// Labels of the object at the time of the change
    pub labels: BTreeMap<String, String>,
}

/// Port for the cluster object store
///
/// Objects are unstructured JSON documents carrying `apiVersion`, `kind` and
/// `metadata`. Updates are guarded by `metadata.resourceVersion`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get an object by reference
    async fn get(&self, reference: &ObjectReference) -> Result<Value, StoreError>;

    /// List objects of a kind
    async fn list(
        &self,
        api_version: &str,
        kind: &str,
        params: &ListParams,
    ) -> Result<Vec<Value>, StoreError>;

    /// Create a new object, resolving `generateName` if needed
    async fn create(&self, object: Value) -> Result<Value, StoreError>;

    /// Replace an object, failing with `Conflict` on a stale resource version
    async fn update(&self, object: Value) -> Result<Value, StoreError>;

    /// Apply a patch to the live object
    async fn patch(
        &self,
        reference: &ObjectReference,
        patch_type: PatchType,
        data: &str,
    ) -> Result<Value, StoreError>;

    /// Delete an object (deferred while finalizers remain)
    async fn delete(&self, reference: &ObjectReference) -> Result<(), StoreError>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

/// Typed access on top of the unstructured store
#[async_trait]
pub trait ObjectStoreExt: ObjectStore {
    async fn get_resource<R: Resource + 'static>(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<R, StoreError> {
        let reference = ObjectReference::new(R::API_VERSION, R::KIND, namespace, name);
        let object = self.get(&reference).await?;
        Ok(R::from_object(object)?)
    }

    async fn list_resources<R: Resource + 'static>(
        &self,
        params: &ListParams,
    ) -> Result<Vec<R>, StoreError> {
        self.list(R::API_VERSION, R::KIND, params)
            .await?
            .into_iter()
            .map(|o| R::from_object(o).map_err(StoreError::from))
            .collect()
    }

    async fn create_resource<R: Resource + 'static>(&self, resource: &R) -> Result<R, StoreError> {
        let created = self.create(resource.to_object()?).await?;
        Ok(R::from_object(created)?)
    }

    async fn update_resource<R: Resource + 'static>(&self, resource: &R) -> Result<R, StoreError> {
        let updated = self.update(resource.to_object()?).await?;
        Ok(R::from_object(updated)?)
    }
}

impl<S: ObjectStore + ?Sized> ObjectStoreExt for S {}
