//! Experiment Controller - automated parameter search against live workloads
//!
//! An experiment declares parameters, metrics and templated patches. The
//! controller runs trials: each one applies an assignment of parameter values
//! to the target objects, waits for them to settle, runs a trial job,
//! captures the metrics and reports the outcome to a suggestion service that
//! picks the next assignment.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): Experiment and trial models, ports and errors
//! - **Service Layer** (`services`): Templates, patches, metric capture, stability
//! - **Application Layer** (`application`): Reconcilers and the controller work queue
//! - **Infrastructure Layer** (`infrastructure`): Config, logging and adapters
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use experiment_controller::{
//!     Controller, ConfigLoader, ExperimentReconciler, HttpSuggestionClient, InMemoryStore,
//!     MetricCapture, TrialReconciler,
//! };
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ConfigLoader::load()?;
//!     let store = Arc::new(InMemoryStore::new());
//!     let suggestions = Arc::new(HttpSuggestionClient::new(&config.suggestion)?);
//!     let capture = MetricCapture::new(&config.metrics)?;
//!
//!     Controller::new(store.clone(), &config.controller)
//!         .with_reconciler(Arc::new(TrialReconciler::new(store.clone(), capture, &config)))
//!         .with_reconciler(Arc::new(ExperimentReconciler::new(store, suggestions, &config.controller)))
//!         .run()
//!         .await
//! }
//! ```

pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{
    Action, Controller, ControllerHandle, ExperimentReconciler, ObjectKey, ReconcileError,
    Reconciler, TrialReconciler,
};
pub use domain::models::{
    Config, ControllerConfig, Experiment, LoggingConfig, MetricsConfig, SuggestionConfig, Trial,
    TrialConfig,
};
pub use domain::ports::{ObjectStore, ObjectStoreExt, SuggestionService};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use infrastructure::logging::LoggerImpl;
pub use infrastructure::store::InMemoryStore;
pub use infrastructure::suggestion::HttpSuggestionClient;
pub use services::{MetricCapture, PatchEvaluator, TemplateEngine};
