//! Experiment reconciler scheduling behaviour

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use experiment_controller::domain::models::{Experiment, LabelSelector, Parameter};
use experiment_controller::domain::ports::{ObjectStore, ObjectStoreExt};
use experiment_controller::services::scheduling::{PHASE_COMPLETED, PHASE_FAILED, PHASE_NEVER_RUN};
use experiment_controller::{Action, ExperimentReconciler, InMemoryStore, ObjectKey, Reconciler};
use serde_json::json;

async fn setup(experiment: &Experiment, suggestions: Arc<ScriptedSuggestions>) -> (Arc<InMemoryStore>, ExperimentReconciler) {
    setup_test_logging();
    let store = Arc::new(InMemoryStore::new());
    store.create_resource(experiment).await.unwrap();
    let reconciler = ExperimentReconciler::new(store.clone(), suggestions, &test_config().controller);
    (store, reconciler)
}

fn pooled(replicas: i32) -> Experiment {
    let mut exp = experiment("web");
    exp.spec.replicas = Some(replicas);
    exp.spec.namespace_selector = Some(LabelSelector::from_labels([("pool", "trials")]));
    exp
}

#[tokio::test]
async fn test_no_free_namespace_is_not_an_error() {
    let suggestions = ScriptedSuggestions::new([suggestion("s-1", 100)]);
    let (store, reconciler) = setup(&pooled(2), suggestions.clone()).await;
    store.create(namespace("other", json!({"pool": "batch"}))).await.unwrap();

    let action = reconciler.reconcile(&ObjectKey::new(NAMESPACE, "web")).await.unwrap();
    assert_eq!(action, Action::Done);
    assert!(trials(&store).await.is_empty());
    assert_eq!(suggestions.requests(), 0, "no suggestion is consumed without a namespace");
}

#[tokio::test]
async fn test_trials_never_share_a_namespace() {
    let suggestions = ScriptedSuggestions::new((0..4).map(|i| suggestion(&format!("s-{i}"), 100 + i)));
    let (store, reconciler) = setup(&pooled(3), suggestions.clone()).await;
    for name in ["pool-a", "pool-b"] {
        store.create(namespace(name, json!({"pool": "trials"}))).await.unwrap();
    }

    drive(&reconciler, &ObjectKey::new(NAMESPACE, "web"), 6).await;

    let created = trials(&store).await;
    assert_eq!(created.len(), 2, "only two namespaces match the selector");
    let namespaces: BTreeSet<&str> = created.iter().map(|t| t.target_namespace()).collect();
    assert_eq!(namespaces, BTreeSet::from(["pool-a", "pool-b"]));
    assert_eq!(suggestions.requests(), 2);

    let exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    assert_eq!(exp.status.active_trials, 2);
    assert_eq!(exp.status.trials_created, 2);
}

#[tokio::test]
async fn test_parallelism_caps_active_trials() {
    let mut exp = experiment("web");
    exp.spec.replicas = Some(1);
    exp.spec.parallelism = Some(3);
    let suggestions = ScriptedSuggestions::new((0..3).map(|i| suggestion(&format!("s-{i}"), 100 + i)));
    let (store, reconciler) = setup(&exp, suggestions.clone()).await;

    drive(&reconciler, &ObjectKey::new(NAMESPACE, "web"), 5).await;
    assert_eq!(trials(&store).await.len(), 1);
}

#[tokio::test]
async fn test_unavailable_suggestion_defers() {
    let suggestions = ScriptedSuggestions::new([]);
    let (store, reconciler) = setup(&experiment("web"), suggestions.clone()).await;

    let action = reconciler.reconcile(&ObjectKey::new(NAMESPACE, "web")).await.unwrap();
    let min = Duration::from_secs(test_config().controller.min_requeue_secs);
    assert_eq!(action, Action::Requeue(min));
    assert!(trials(&store).await.is_empty());

    let exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    assert_eq!(exp.status.trials_created, 0);
    assert!(exp.status.namespaces_in_use.is_empty());
}

#[tokio::test]
async fn test_gone_completes_the_experiment() {
    let suggestions = ScriptedSuggestions::new([]);
    suggestions.stop();
    let (store, reconciler) = setup(&experiment("web"), suggestions.clone()).await;

    drive(&reconciler, &ObjectKey::new(NAMESPACE, "web"), 3).await;

    let exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    assert_eq!(exp.replicas(), 0);
    assert_eq!(exp.status.phase, PHASE_COMPLETED);
    assert_eq!(suggestions.requests(), 1);
}

#[tokio::test]
async fn test_budget_stops_trial_creation() {
    let mut exp = experiment("web");
    exp.spec.budget = Some(1);
    exp.status.trials_created = 1;
    let suggestions = ScriptedSuggestions::new([suggestion("s-1", 100)]);
    let (store, reconciler) = setup(&exp, suggestions.clone()).await;

    let action = reconciler.reconcile(&ObjectKey::new(NAMESPACE, "web")).await.unwrap();
    assert_eq!(action, Action::Done);
    assert!(trials(&store).await.is_empty());
    assert_eq!(suggestions.requests(), 0);
}

#[tokio::test]
async fn test_deleting_experiment_abandons_unfinished_trials() {
    let suggestions = ScriptedSuggestions::new([suggestion("s-1", 100)]);
    let (store, reconciler) = setup(&experiment("web"), suggestions.clone()).await;
    let key = ObjectKey::new(NAMESPACE, "web");

    drive(&reconciler, &key, 2).await;
    assert_eq!(trials(&store).await.len(), 1);

    let exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    store.delete(&experiment_controller::domain::models::Resource::object_ref(&exp)).await.unwrap();

    drive(&reconciler, &key, 4).await;

    assert!(trials(&store).await.is_empty());
    assert_eq!(suggestions.abandoned(), vec!["s-1".to_string()]);
    assert!(suggestions.reports().is_empty());
    let err = store.get_resource::<Experiment>(NAMESPACE, "web").await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_invalid_experiment_creates_no_trials() {
    let mut exp = experiment("web");
    exp.spec.parameters = vec![Parameter::int_range("cpu", 1000, 100)];
    let suggestions = ScriptedSuggestions::new([suggestion("s-1", 500)]);
    let (store, reconciler) = setup(&exp, suggestions.clone()).await;
    let key = ObjectKey::new(NAMESPACE, "web");

    drive(&reconciler, &key, 3).await;
    assert!(trials(&store).await.is_empty());
    assert_eq!(suggestions.requests(), 0);

    let mut exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    assert_eq!(exp.status.phase, PHASE_FAILED);
    assert!(exp.status.message.contains("min must not exceed max"), "{}", exp.status.message);

    // fixing the definition resumes scheduling
    exp.spec.parameters = vec![Parameter::int_range("cpu", 100, 1000)];
    store.update_resource(&exp).await.unwrap();
    drive(&reconciler, &key, 3).await;
    assert_eq!(trials(&store).await.len(), 1);
    assert_eq!(suggestions.requests(), 1);
    let exp: Experiment = store.get_resource(NAMESPACE, "web").await.unwrap();
    assert!(exp.status.message.is_empty());
    assert_ne!(exp.status.phase, PHASE_NEVER_RUN);
}
