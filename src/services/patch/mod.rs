//! Patch evaluation and application
//!
//! - [`evaluator`] renders experiment patch templates into trial patch operations
//! - [`apply`] implements json, merge and strategic patch semantics
//! - [`rbac`] derives access rules from patch targets

pub mod apply;
pub mod evaluator;
pub mod rbac;

pub use apply::apply_patch;
pub use evaluator::PatchEvaluator;
pub use rbac::{experiment_rules, merge_rule, PolicyRule};
