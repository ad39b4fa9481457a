//! Pure engines used by the reconcilers
//!
//! Nothing in this layer talks to the object store directly except the
//! stability and metric target lookups, which take the store port as an
//! argument.

pub mod jobs;
pub mod jsonpath;
pub mod metric;
pub mod patch;
pub mod scheduling;
pub mod stability;
pub mod template;
pub mod trial_status;
pub mod validation;

pub use metric::MetricCapture;
pub use patch::PatchEvaluator;
pub use template::TemplateEngine;
