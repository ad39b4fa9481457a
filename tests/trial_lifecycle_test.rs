//! End to end trial lifecycle against the in-memory store
//!
//! The experiment reconciler creates a trial from a scripted suggestion, the
//! trial reconciler patches the target, runs the trial job and captures the
//! metric, and the finished trial is reported back upstream.

mod common;

use std::sync::Arc;

use common::*;
use experiment_controller::domain::models::{
    ConditionStatus, Experiment, Metric, SetupTask, TrialConditionType, EXPERIMENT_FINALIZER, REPORT_FINALIZER,
    SETUP_FINALIZER,
};
use experiment_controller::domain::ports::{ObjectStore, ObjectStoreExt};
use experiment_controller::services::scheduling::PHASE_IDLE;
use experiment_controller::{
    Action, ExperimentReconciler, InMemoryStore, MetricCapture, ObjectKey, Reconciler, TrialReconciler,
};

struct Harness {
    store: Arc<InMemoryStore>,
    suggestions: Arc<ScriptedSuggestions>,
    experiments: ExperimentReconciler,
    trials: TrialReconciler,
}

impl Harness {
    async fn new(suggestions: Arc<ScriptedSuggestions>) -> Self {
        Self::with_experiment(suggestions, experiment("web")).await
    }

    async fn with_experiment(suggestions: Arc<ScriptedSuggestions>, exp: Experiment) -> Self {
        setup_test_logging();
        let config = test_config();
        let store = Arc::new(InMemoryStore::new());
        store.create(target_config_map(NAMESPACE)).await.unwrap();
        store.create_resource(&exp).await.unwrap();

        let capture = MetricCapture::new(&config.metrics).unwrap();
        Self {
            experiments: ExperimentReconciler::new(store.clone(), suggestions.clone(), &config.controller),
            trials: TrialReconciler::new(store.clone(), capture, &config),
            store,
            suggestions,
        }
    }
}

#[tokio::test]
async fn test_trial_runs_to_completion_and_is_reported() {
    let h = Harness::new(ScriptedSuggestions::new([suggestion("remote-1", 500)])).await;
    let experiment_key = ObjectKey::new(NAMESPACE, "web");

    drive(&h.experiments, &experiment_key, 3).await;
    let created = trials(&h.store).await;
    assert_eq!(created.len(), 1, "exactly one trial for one replica");
    let trial = &created[0];
    assert!(trial.metadata.name.starts_with("web-"));
    assert!(trial.metadata.has_finalizer(REPORT_FINALIZER));
    assert_eq!(trial.report_name(), Some("remote-1"));

    let exp: Experiment = h.store.get_resource(NAMESPACE, "web").await.unwrap();
    assert!(exp.metadata.has_finalizer(EXPERIMENT_FINALIZER));
    assert_eq!(exp.status.trials_created, 1);
    assert_eq!(exp.status.active_trials, 1);

    // patch, settle and start the job
    let key = key_of(trial);
    drive(&h.trials, &key, 10).await;
    let target = h
        .store
        .get(&experiment_controller::domain::models::ObjectReference::new("v1", "ConfigMap", NAMESPACE, TARGET))
        .await
        .unwrap();
    assert_eq!(target["data"]["cpu"], "500m");

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_condition_true(TrialConditionType::Patched));
    assert!(trial.is_condition_true(TrialConditionType::Stable));
    assert!(!trial.is_finished());
    assert!(trial_job(&h.store, &trial).await.is_some());

    finish_job(&h.store, &trial).await;
    drive(&h.trials, &key, 10).await;

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_condition_true(TrialConditionType::Complete));
    assert!(trial.is_condition_true(TrialConditionType::Observed));
    assert!(!trial.is_failed());
    assert_eq!(trial.status.values.len(), 1);
    assert_eq!(trial.status.values[0].value, Some(500.0));
    let started = trial.status.start_time.unwrap();
    let finished = trial.status.completion_time.unwrap();
    assert_eq!((finished - started).num_seconds(), 60);

    // report upstream, then ask for the next suggestion which is not there yet
    let action = h.experiments.reconcile(&experiment_key).await.unwrap();
    assert!(action.is_requeue());
    let reports = h.suggestions.reports();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].0, "remote-1");
    assert!(!reports[0].1.failed);
    assert_eq!(reports[0].1.values[0].metric_name, "cpu");
    assert_eq!(reports[0].1.values[0].value, 500.0);

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(!trial.metadata.has_finalizer(REPORT_FINALIZER));

    let exp: Experiment = h.store.get_resource(NAMESPACE, "web").await.unwrap();
    assert_eq!(exp.status.active_trials, 0);
    assert_eq!(exp.status.phase, PHASE_IDLE);
    assert!(exp.status.namespaces_in_use.is_empty());
}

#[tokio::test]
async fn test_failed_job_is_reported_as_failure() {
    let h = Harness::new(ScriptedSuggestions::new([suggestion("remote-1", 300)])).await;
    let experiment_key = ObjectKey::new(NAMESPACE, "web");
    drive(&h.experiments, &experiment_key, 2).await;

    let trial = trials(&h.store).await.remove(0);
    let key = key_of(&trial);
    drive(&h.trials, &key, 10).await;

    let mut job = trial_job(&h.store, &trial).await.unwrap();
    job["status"] = serde_json::json!({
        "conditions": [{"type": "Failed", "status": "True", "reason": "BackoffLimitExceeded", "message": "Job has reached the specified backoff limit"}]
    });
    h.store.update(job).await.unwrap();
    drive(&h.trials, &key, 3).await;

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_failed());
    let (_, present) = trial.check_condition(TrialConditionType::Failed, ConditionStatus::True);
    assert!(present);

    h.experiments.reconcile(&experiment_key).await.unwrap();
    let reports = h.suggestions.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].1.failed);
    assert!(reports[0].1.values.is_empty());
}

#[tokio::test]
async fn test_missing_patch_target_fails_after_attempts() {
    let h = Harness::new(ScriptedSuggestions::new([suggestion("remote-1", 200)])).await;
    h.store
        .delete(&experiment_controller::domain::models::ObjectReference::new("v1", "ConfigMap", NAMESPACE, TARGET))
        .await
        .unwrap();

    let experiment_key = ObjectKey::new(NAMESPACE, "web");
    drive(&h.experiments, &experiment_key, 2).await;
    let key = key_of(&trials(&h.store).await[0]);

    drive(&h.trials, &key, 8).await;
    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_failed());
    let failed = trial
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == TrialConditionType::Failed)
        .unwrap();
    assert_eq!(failed.reason, "PatchFailed");
    assert_eq!(trial.status.patch_operations[0].attempts_remaining, 0);

    // a finished trial is left alone
    assert_eq!(h.trials.reconcile(&key).await.unwrap(), Action::Done);
}

#[tokio::test]
async fn test_metric_never_ready_fails_when_attempts_run_out() {
    let mut server = mockito::Server::new_async().await;
    let targets = server
        .mock("GET", "/api/v1/targets")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            serde_json::json!({
                "status": "success",
                "data": {"activeTargets": [{"health": "up", "lastScrape": "2020-01-01T00:00:00Z"}]}
            })
            .to_string(),
        )
        .expect(3)
        .create_async()
        .await;
    let query = server
        .mock("GET", mockito::Matcher::Regex(r"^/api/v1/query".to_string()))
        .expect(0)
        .create_async()
        .await;

    let mut exp = experiment("web");
    exp.spec.metrics = vec![prometheus_metric("latency", server.url())];
    let h = Harness::with_experiment(ScriptedSuggestions::new([suggestion("remote-1", 400)]), exp).await;
    drive(&h.experiments, &ObjectKey::new(NAMESPACE, "web"), 2).await;
    let key = key_of(&trials(&h.store).await[0]);
    drive(&h.trials, &key, 10).await;
    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    finish_job(&h.store, &trial).await;

    let mut seen = Vec::new();
    for _ in 0..20 {
        h.trials.reconcile(&key).await.unwrap();
        let mut trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
        if trial.is_finished() {
            break;
        }
        let Some(value) = trial.status.values.first_mut() else {
            continue;
        };
        if seen.last() != Some(&value.attempts_remaining) {
            seen.push(value.attempts_remaining);
        }
        assert!(value.attempts_remaining > 0, "budget spent but trial still running");
        // skip the retry-after wait
        if value.not_before.take().is_some() {
            h.store.update_resource(&trial).await.unwrap();
        }
    }

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_failed());
    let failed = trial
        .status
        .conditions
        .iter()
        .find(|c| c.condition_type == TrialConditionType::Failed)
        .unwrap();
    assert_eq!(failed.reason, "MetricFailed");
    assert_eq!(trial.status.values[0].attempts_remaining, 0);
    assert_eq!(seen, vec![2, 1]);
    targets.assert_async().await;
    query.assert_async().await;
}

#[tokio::test]
async fn test_deferred_metric_does_not_hold_back_the_others() {
    let mut server = mockito::Server::new_async().await;
    let _targets = never_scraped_prometheus(&mut server).await;

    let mut exp = experiment("web");
    exp.spec.metrics = vec![
        prometheus_metric("latency", server.url()),
        Metric::local("cpu", "{{ .Values.cpu }}"),
    ];
    let h = Harness::with_experiment(ScriptedSuggestions::new([suggestion("remote-1", 400)]), exp).await;
    drive(&h.experiments, &ObjectKey::new(NAMESPACE, "web"), 2).await;
    let key = key_of(&trials(&h.store).await[0]);
    drive(&h.trials, &key, 10).await;
    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    finish_job(&h.store, &trial).await;

    // the latency metric is waiting on its retry-after the whole time
    drive(&h.trials, &key, 6).await;

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    let value_of = |name: &str| trial.status.values.iter().find(|v| v.name == name).unwrap();
    assert_eq!(value_of("cpu").value, Some(400.0));
    assert_eq!(value_of("latency").value, None);
    assert_eq!(value_of("latency").attempts_remaining, 2);
    assert!(value_of("latency").not_before.is_some());
    assert!(!trial.is_finished());

    let action = h.trials.reconcile(&key).await.unwrap();
    assert!(action.is_requeue(), "waiting on latency, got {action:?}");
}

#[tokio::test]
async fn test_setup_teardown_runs_while_metrics_are_pending() {
    let mut server = mockito::Server::new_async().await;
    let _targets = never_scraped_prometheus(&mut server).await;

    let mut exp = experiment("web");
    exp.spec.metrics = vec![prometheus_metric("latency", server.url())];
    exp.spec.trial_template.spec.setup_tasks = vec![SetupTask {
        name: "database".to_string(),
        ..Default::default()
    }];
    let h = Harness::with_experiment(ScriptedSuggestions::new([suggestion("remote-1", 600)]), exp).await;
    drive(&h.experiments, &ObjectKey::new(NAMESPACE, "web"), 2).await;
    let key = key_of(&trials(&h.store).await[0]);

    drive(&h.trials, &key, 5).await;
    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.metadata.has_finalizer(SETUP_FINALIZER));
    complete_setup_job(&h.store, &trial, "create").await;

    drive(&h.trials, &key, 10).await;
    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_condition_true(TrialConditionType::SetupCreated));
    assert!(setup_job(&h.store, &trial, "delete").await.is_none());
    finish_job(&h.store, &trial).await;

    let mut torn_down = false;
    for _ in 0..6 {
        h.trials.reconcile(&key).await.unwrap();
        let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
        if setup_job(&h.store, &trial, "delete").await.is_some() {
            assert!(!trial.is_finished(), "teardown should not wait for the trial to finish");
            assert!(trial.status.values.iter().all(|v| v.value.is_none()));
            torn_down = true;
            break;
        }
    }
    assert!(torn_down, "delete job was never created");

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    complete_setup_job(&h.store, &trial, "delete").await;
    drive(&h.trials, &key, 2).await;

    let trial = h.store.get_resource::<experiment_controller::Trial>(NAMESPACE, &key.name).await.unwrap();
    assert!(trial.is_condition_true(TrialConditionType::SetupDeleted));
    assert!(!trial.metadata.has_finalizer(SETUP_FINALIZER));
}
