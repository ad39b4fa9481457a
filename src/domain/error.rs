use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::meta::ObjectReference;

/// Template parse or execution failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("template: {name}: parse error: {message}")]
    Parse { name: String, message: String },

    #[error("template: {name}: execution error: {message}")]
    Exec { name: String, message: String },
}

/// Failure turning a patch template into a patch operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatchError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Assignments(#[from] AssignmentError),

    #[error("unable to parse rendered patch: {0}")]
    Decode(String),

    #[error("invalid patch reference")]
    InvalidReference,

    #[error("trial job patch must be a strategic merge patch")]
    TrialJobPatchType,

    #[error("{patch_type} patch cannot be applied: {message}")]
    Apply { patch_type: String, message: String },
}

/// Metric capture failure carrying retry guidance
#[derive(Error, Debug, Clone, PartialEq, Eq, Default)]
#[error("{message}")]
pub struct CaptureError {
    /// Description of what went wrong
    pub message: String,
    /// URL used to capture the metric
    pub address: String,
    /// Query that failed
    pub query: String,
    /// Completion time the query was evaluated at
    pub completion_time: Option<DateTime<Utc>>,
    /// Minimum wait before the value is expected to be available
    pub retry_after: Duration,
}

impl CaptureError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    /// Data is not available yet, try again after the delay
    pub fn retry_after(retry_after: Duration) -> Self {
        Self {
            message: "metric data not yet available".to_string(),
            retry_after,
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn with_query(mut self, query: impl Into<String>, completion_time: Option<DateTime<Utc>>) -> Self {
        self.query = query.into();
        self.completion_time = completion_time;
        self
    }

    /// Returns true if the caller should wait before trying again
    pub fn is_transient(&self) -> bool {
        !self.retry_after.is_zero()
    }
}

/// Errors from evaluating one metric
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MetricError {
    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Capture(#[from] CaptureError),
}

/// A patched object has not settled (yet)
#[derive(Error, Debug, Clone, PartialEq, Eq, Default)]
#[error("{}", stability_message(.reason, .target_ref, .retry_after))]
pub struct StabilityError {
    pub reason: String,
    pub target_ref: ObjectReference,
    /// Zero means the object is not expected to ever stabilize
    pub retry_after: Duration,
}

impl StabilityError {
    pub fn retry(reason: impl Into<String>, retry_after: Duration) -> Self {
        Self {
            reason: reason.into(),
            retry_after,
            ..Default::default()
        }
    }

    pub fn fatal(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Default::default()
        }
    }

    pub fn is_transient(&self) -> bool {
        !self.retry_after.is_zero()
    }
}

fn stability_message(reason: &str, target: &ObjectReference, retry_after: &Duration) -> String {
    if retry_after.is_zero() {
        format!("{} stability error for {}: {reason}", target.kind, target.name)
    } else {
        format!("{}/{} is not ready: {reason}", target.kind, target.name)
    }
}

/// Problems with a trial's assignments relative to the experiment parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentError {
    pub unassigned: Vec<String>,
    pub undefined: Vec<String>,
    pub out_of_bounds: Vec<String>,
    pub duplicated: Vec<String>,
}

impl AssignmentError {
    pub fn is_empty(&self) -> bool {
        self.unassigned.is_empty()
            && self.undefined.is_empty()
            && self.out_of_bounds.is_empty()
            && self.duplicated.is_empty()
    }
}

impl fmt::Display for AssignmentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid assignments")?;
        let groups = [
            ("unassigned", &self.unassigned),
            ("undefined", &self.undefined),
            ("out of bounds", &self.out_of_bounds),
            ("duplicated", &self.duplicated),
        ];
        for (label, names) in groups {
            if !names.is_empty() {
                write!(f, ", {label}: {}", names.join(", "))?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for AssignmentError {}

/// Experiment definition problems
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExperimentError {
    #[error("parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    #[error("metric {name}: {reason}")]
    InvalidMetric { name: String, reason: String },
}
