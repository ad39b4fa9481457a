//! In-memory object store
//!
//! Implements the store semantics the reconcilers rely on: optimistic
//! concurrency through `metadata.resourceVersion`, `generateName` resolution,
//! finalizer-deferred deletion, server-side patches and change notifications.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::domain::models::{ObjectReference, PatchType};
use crate::domain::ports::{ListParams, ObjectStore, StoreError, WatchEvent, WatchEventType};
use crate::services::patch::apply_patch;

const WATCH_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct StoreKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl From<&ObjectReference> for StoreKey {
    fn from(r: &ObjectReference) -> Self {
        Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone(),
            name: r.name.clone(),
        }
    }
}

fn labels_of(object: &Value) -> BTreeMap<String, String> {
    object
        .pointer("/metadata/labels")
        .and_then(Value::as_object)
        .map(|labels| {
            labels
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

fn metadata_mut(object: &mut Value) -> Result<&mut Map<String, Value>, StoreError> {
    object
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("object must be a JSON object".to_string()))?
        .entry("metadata")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| StoreError::Invalid("metadata must be an object".to_string()))
}

fn has_finalizers(object: &Value) -> bool {
    object
        .pointer("/metadata/finalizers")
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

fn is_deleting(object: &Value) -> bool {
    object
        .pointer("/metadata/deletionTimestamp")
        .is_some_and(|t| !t.is_null())
}

/// Everything except identity, metadata and status
fn content(object: &Value) -> Map<String, Value> {
    object
        .as_object()
        .map(|map| {
            map.iter()
                .filter(|(k, _)| !matches!(k.as_str(), "apiVersion" | "kind" | "metadata" | "status"))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn random_suffix() -> String {
    Uuid::new_v4().simple().to_string()[..5].to_string()
}

/// Thread-safe object store kept entirely in memory
pub struct InMemoryStore {
    objects: RwLock<HashMap<StoreKey, Value>>,
    version: AtomicU64,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            objects: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
            events,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<StoreKey, Value>> {
        self.objects.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<StoreKey, Value>> {
        self.objects.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_version(&self) -> String {
        (self.version.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    fn notify(&self, event_type: WatchEventType, object: &Value) {
        let event = WatchEvent {
            event_type,
            object: ObjectReference::from_object(object),
            labels: labels_of(object),
        };
        trace!(?event_type, object = %event.object, "store event");
        // no receivers is fine
        let _ = self.events.send(event);
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stores `next` over `current`, bumping the version and generation
    fn replace(&self, current: &Value, mut next: Value) -> Result<Value, StoreError> {
        let generation = current
            .pointer("/metadata/generation")
            .and_then(Value::as_i64)
            .unwrap_or(1);
        let generation = if content(current) == content(&next) {
            generation
        } else {
            generation + 1
        };

        let version = self.next_version();
        let meta = metadata_mut(&mut next)?;
        for field in ["uid", "creationTimestamp", "deletionTimestamp", "name", "namespace"] {
            match current.pointer(&format!("/metadata/{field}")) {
                Some(value) => meta.insert(field.to_string(), value.clone()),
                None => meta.remove(field),
            };
        }
        meta.insert("resourceVersion".into(), Value::String(version));
        meta.insert("generation".into(), json!(generation));
        Ok(next)
    }

    /// Writes the object, removing it instead when deletion was only waiting on finalizers
    fn commit(&self, objects: &mut HashMap<StoreKey, Value>, key: StoreKey, object: Value) -> Value {
        if is_deleting(&object) && !has_finalizers(&object) {
            objects.remove(&key);
            self.notify(WatchEventType::Deleted, &object);
        } else {
            objects.insert(key, object.clone());
            self.notify(WatchEventType::Modified, &object);
        }
        object
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get(&self, reference: &ObjectReference) -> Result<Value, StoreError> {
        self.read()
            .get(&StoreKey::from(reference))
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))
    }

    async fn list(&self, api_version: &str, kind: &str, params: &ListParams) -> Result<Vec<Value>, StoreError> {
        let objects = self.read();
        let mut matched: Vec<(&StoreKey, &Value)> = objects
            .iter()
            .filter(|(key, _)| key.api_version == api_version && key.kind == kind)
            .filter(|(key, _)| params.namespace.as_ref().is_none_or(|ns| &key.namespace == ns))
            .filter(|(_, object)| {
                params
                    .selector
                    .as_ref()
                    .is_none_or(|selector| selector.matches(&labels_of(object)))
            })
            .collect();
        matched.sort_by(|(a, _), (b, _)| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        Ok(matched.into_iter().map(|(_, object)| object.clone()).collect())
    }

    async fn create(&self, mut object: Value) -> Result<Value, StoreError> {
        let mut reference = ObjectReference::from_object(&object);
        if reference.api_version.is_empty() || reference.kind.is_empty() {
            return Err(StoreError::Invalid("apiVersion and kind are required".to_string()));
        }

        let mut objects = self.write();
        let meta = metadata_mut(&mut object)?;
        if reference.name.is_empty() {
            let prefix = meta
                .get("generateName")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
                .ok_or_else(|| StoreError::Invalid(format!("{} requires a name or generateName", reference.kind)))?
                .to_string();
            loop {
                reference.name = format!("{prefix}{}", random_suffix());
                if !objects.contains_key(&StoreKey::from(&reference)) {
                    break;
                }
            }
            meta.insert("name".into(), Value::String(reference.name.clone()));
        }

        let key = StoreKey::from(&reference);
        if objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists(reference.to_string()));
        }

        meta.insert("uid".into(), Value::String(Uuid::new_v4().to_string()));
        meta.insert("resourceVersion".into(), Value::String(self.next_version()));
        meta.insert("generation".into(), json!(1));
        meta.insert(
            "creationTimestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        meta.remove("deletionTimestamp");

        objects.insert(key, object.clone());
        self.notify(WatchEventType::Added, &object);
        Ok(object)
    }

    async fn update(&self, object: Value) -> Result<Value, StoreError> {
        let reference = ObjectReference::from_object(&object);
        let key = StoreKey::from(&reference);

        let mut objects = self.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))?;

        let expected = object
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let actual = current
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if !expected.is_empty() && expected != actual {
            return Err(StoreError::Conflict(reference.to_string()));
        }

        let next = self.replace(current, object)?;
        Ok(self.commit(&mut objects, key, next))
    }

    async fn patch(&self, reference: &ObjectReference, patch_type: PatchType, data: &str) -> Result<Value, StoreError> {
        let key = StoreKey::from(reference);
        let mut objects = self.write();
        let current = objects
            .get(&key)
            .ok_or_else(|| StoreError::NotFound(reference.to_string()))?;

        let patched = apply_patch(current, patch_type, data).map_err(|e| StoreError::Invalid(e.to_string()))?;
        let next = self.replace(current, patched)?;
        Ok(self.commit(&mut objects, key, next))
    }

    async fn delete(&self, reference: &ObjectReference) -> Result<(), StoreError> {
        let key = StoreKey::from(reference);
        let mut objects = self.write();
        let Some(current) = objects.get_mut(&key) else {
            return Err(StoreError::NotFound(reference.to_string()));
        };

        if !has_finalizers(current) {
            if let Some(removed) = objects.remove(&key) {
                self.notify(WatchEventType::Deleted, &removed);
            }
            return Ok(());
        }

        if !is_deleting(current) {
            let version = self.next_version();
            let meta = metadata_mut(current)?;
            meta.insert(
                "deletionTimestamp".into(),
                Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)),
            );
            meta.insert("resourceVersion".into(), Value::String(version));
            let snapshot = current.clone();
            self.notify(WatchEventType::Modified, &snapshot);
        }
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
