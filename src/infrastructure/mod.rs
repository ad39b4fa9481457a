//! Infrastructure layer module
//!
//! This module contains the adapters and ambient plumbing:
//! - Configuration management
//! - Logging infrastructure
//! - In-memory object store
//! - Suggestion service HTTP client
//!
//! Adapters satisfy the port traits defined in the domain layer.

pub mod config;
pub mod logging;
pub mod store;
pub mod suggestion;
