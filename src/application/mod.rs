//! Reconcilers and the controller that drives them

pub mod controller;
pub mod experiment_reconciler;
pub mod reconcile;
pub mod trial_reconciler;

pub use controller::{Controller, ControllerHandle, WorkItem, WorkQueue};
pub use experiment_reconciler::ExperimentReconciler;
pub use reconcile::{Action, ObjectKey, ReconcileError, Reconciler};
pub use trial_reconciler::TrialReconciler;
