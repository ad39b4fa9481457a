use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::error::{PatchError, TemplateError};
use crate::domain::models::ObjectReference;
use crate::domain::ports::{StoreError, SuggestionError, WatchEvent};

/// Outcome of a successful reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Nothing left to do until the object (or something it owns) changes
    Done,
    /// Reconcile again after the delay
    Requeue(Duration),
}

impl Action {
    pub const fn requeue_after(delay: Duration) -> Self {
        Self::Requeue(delay)
    }

    pub const fn is_requeue(self) -> bool {
        matches!(self, Self::Requeue(_))
    }
}

/// Failures that abort a reconciliation pass
///
/// Anything returned here is logged by the controller and retried with
/// backoff; failures that belong to the trial are recorded as conditions
/// instead.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("suggestion service error: {0}")]
    Suggestion(#[from] SuggestionError),

    #[error("patch evaluation failed: {0}")]
    Patch(#[from] PatchError),

    #[error("template error: {0}")]
    Template(#[from] TemplateError),

    #[error("experiment {0} not found")]
    ExperimentNotFound(String),
}

impl ReconcileError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(e) => e.is_transient(),
            Self::Suggestion(e) => e.is_transient(),
            Self::ExperimentNotFound(_) => true,
            Self::Patch(_) | Self::Template(_) => false,
        }
    }
}

/// Turns an optimistic concurrency failure into an immediate requeue
pub fn requeue_conflict<T>(result: Result<T, StoreError>) -> Result<Action, ReconcileError> {
    match result {
        Ok(_) => Ok(Action::Done),
        Err(e) if e.is_conflict() => Ok(Action::Requeue(Duration::ZERO)),
        Err(e) => Err(e.into()),
    }
}

/// Namespaced name of a reconciled object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl From<&ObjectReference> for ObjectKey {
    fn from(r: &ObjectReference) -> Self {
        Self::new(r.namespace.clone(), r.name.clone())
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            f.write_str(&self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// A level-triggered reconciler for one kind of object
#[async_trait]
pub trait Reconciler: Send + Sync {
    /// API version of the primary kind
    fn api_version(&self) -> &'static str;

    /// Primary kind, events for it are reconciled directly
    fn kind(&self) -> &'static str;

    /// Converges the object named by `key` toward its declared state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError>;

    /// Primary objects affected by a change to some other object
    async fn related(&self, _event: &WatchEvent) -> Vec<ObjectKey> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflicts_requeue_immediately() {
        let result = requeue_conflict::<()>(Err(StoreError::Conflict("trial".into())));
        assert_eq!(result.unwrap(), Action::Requeue(Duration::ZERO));

        let result = requeue_conflict::<()>(Err(StoreError::Invalid("bad".into())));
        assert!(matches!(result, Err(ReconcileError::Store(_))));
    }

    #[test]
    fn test_object_key_display() {
        assert_eq!(ObjectKey::new("default", "web-001").to_string(), "default/web-001");
        assert_eq!(ObjectKey::new("", "ns").to_string(), "ns");
    }
}
