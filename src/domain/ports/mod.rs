//! Port trait definitions (Hexagonal Architecture)
//!
//! This module defines async trait interfaces that infrastructure adapters must implement:
//! - ObjectStore: cluster object persistence with optimistic concurrency
//! - SuggestionService: the external optimizer choosing assignments

pub mod errors;
pub mod object_store;
pub mod suggestion_service;

pub use errors::{StoreError, SuggestionError};
pub use object_store::{ListParams, ObjectStore, ObjectStoreExt, WatchEvent, WatchEventType};
pub use suggestion_service::{Observation, ObservedValue, Suggestion, SuggestionService};
