//! Domain layer for the experiment controller
//!
//! This module contains core models, port traits and error types.

pub mod error;
pub mod models;
pub mod ports;

// Re-export error types for convenient access
pub use error::{
    AssignmentError, CaptureError, ExperimentError, MetricError, PatchError, StabilityError,
    TemplateError,
};
