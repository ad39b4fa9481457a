//! Common test utilities for integration tests
//!
//! Provides shared fixtures, a scripted suggestion service and helpers to
//! drive reconcilers without the controller loop.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use experiment_controller::domain::models::{
    Assignment, Config, Experiment, LabelSelector, Metric, MetricType, ObjectMeta, ObjectReference,
    Parameter, PatchTemplate, PatchType, Trial, LABEL_TRIAL, LABEL_TRIAL_ROLE, ROLE_TRIAL_RUN,
};
use experiment_controller::domain::ports::{
    ListParams, ObjectStore, ObjectStoreExt, Observation, Suggestion, SuggestionError,
    SuggestionService,
};
use experiment_controller::{InMemoryStore, ObjectKey, Reconciler};

pub const NAMESPACE: &str = "default";
pub const TARGET: &str = "app-config";

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Configuration with the trial creation limiter turned off
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.controller.trial_creation_per_second = 0;
    config.controller.resync_interval_secs = 1;
    config
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Experiment tuning `cpu`, written into a config map and read back as a local metric
pub fn experiment(name: &str) -> Experiment {
    let mut exp = Experiment {
        metadata: ObjectMeta::named(NAMESPACE, name),
        ..Default::default()
    };
    exp.spec.parameters = vec![Parameter::int_range("cpu", 100, 1000)];
    exp.spec.metrics = vec![Metric::local("cpu", "{{ .Values.cpu }}")];
    exp.spec.patches = vec![PatchTemplate {
        patch_type: PatchType::Merge,
        patch: r#"{"data":{"cpu":"{{ .Values.cpu }}m"}}"#.to_string(),
        target_ref: Some(ObjectReference::new("v1", "ConfigMap", "", TARGET)),
    }];
    exp
}

/// The config map patched by [`experiment`]
pub fn target_config_map(namespace: &str) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": {"name": TARGET, "namespace": namespace},
        "data": {"cpu": "250m"}
    })
}

pub fn namespace(name: &str, labels: Value) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Namespace",
        "metadata": {"name": name, "labels": labels}
    })
}

pub fn suggestion(name: &str, cpu: i64) -> Suggestion {
    Suggestion {
        name: name.to_string(),
        assignments: vec![Assignment::new("cpu", cpu)],
        labels: Default::default(),
    }
}

pub async fn trials(store: &InMemoryStore) -> Vec<Trial> {
    store
        .list_resources::<Trial>(&ListParams::default())
        .await
        .expect("list trials")
}

pub fn key_of(trial: &Trial) -> ObjectKey {
    ObjectKey::new(trial.metadata.namespace.clone(), trial.metadata.name.clone())
}

/// Runs reconciliation passes back to back, ignoring requested delays
pub async fn drive(reconciler: &dyn Reconciler, key: &ObjectKey, passes: usize) {
    for _ in 0..passes {
        reconciler.reconcile(key).await.expect("reconcile pass");
    }
}

pub async fn trial_job(store: &InMemoryStore, trial: &Trial) -> Option<Value> {
    let params = ListParams::in_namespace(trial.metadata.namespace.clone()).with_selector(
        LabelSelector::from_labels([
            (LABEL_TRIAL, trial.metadata.name.as_str()),
            (LABEL_TRIAL_ROLE, ROLE_TRIAL_RUN),
        ]),
    );
    store
        .list("batch/v1", "Job", &params)
        .await
        .expect("list jobs")
        .into_iter()
        .next()
}

/// Marks the trial job as having run for a minute and finished successfully
pub async fn finish_job(store: &InMemoryStore, trial: &Trial) {
    let mut job = trial_job(store, trial).await.expect("trial job exists");
    let now = Utc::now();
    job["status"] = json!({
        "startTime": rfc3339(now - chrono::Duration::seconds(61)),
        "completionTime": rfc3339(now - chrono::Duration::seconds(1)),
        "succeeded": 1
    });
    store.update(job).await.expect("update job");
}

/// Setup job of the trial for `mode` (`create` or `delete`)
pub async fn setup_job(store: &InMemoryStore, trial: &Trial, mode: &str) -> Option<Value> {
    let reference = ObjectReference::new(
        "batch/v1",
        "Job",
        trial.metadata.namespace.clone(),
        format!("{}-{mode}", trial.metadata.name),
    );
    store.get(&reference).await.ok()
}

/// Marks a setup job as complete
pub async fn complete_setup_job(store: &InMemoryStore, trial: &Trial, mode: &str) {
    let mut job = setup_job(store, trial, mode).await.expect("setup job exists");
    job["status"] = json!({
        "conditions": [{"type": "Complete", "status": "True"}],
        "succeeded": 1
    });
    store.update(job).await.expect("update setup job");
}

/// Prometheus metric read from `url`
pub fn prometheus_metric(name: &str, url: String) -> Metric {
    Metric {
        name: name.to_string(),
        metric_type: MetricType::Prometheus,
        query: format!("scalar({name})"),
        url,
        ..Default::default()
    }
}

/// Serves a Prometheus target list whose only target was last scraped long ago
pub async fn never_scraped_prometheus(server: &mut mockito::ServerGuard) -> mockito::Mock {
    server
        .mock("GET", "/api/v1/targets")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "status": "success",
                "data": {"activeTargets": [{"health": "up", "lastScrape": "2020-01-01T00:00:00Z"}]}
            })
            .to_string(),
        )
        .create_async()
        .await
}

/// Suggestion service that hands out a fixed list of suggestions
#[derive(Default)]
pub struct ScriptedSuggestions {
    queue: Mutex<VecDeque<Suggestion>>,
    gone: Mutex<bool>,
    requests: AtomicUsize,
    reports: Mutex<Vec<(String, Observation)>>,
    abandoned: Mutex<Vec<String>>,
}

impl ScriptedSuggestions {
    pub fn new(suggestions: impl IntoIterator<Item = Suggestion>) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(suggestions.into_iter().collect()),
            ..Default::default()
        })
    }

    /// Every further request answers `410 Gone`
    pub fn stop(&self) {
        *self.gone.lock().unwrap() = true;
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn reports(&self) -> Vec<(String, Observation)> {
        self.reports.lock().unwrap().clone()
    }

    pub fn abandoned(&self) -> Vec<String> {
        self.abandoned.lock().unwrap().clone()
    }
}

#[async_trait]
impl SuggestionService for ScriptedSuggestions {
    async fn next_assignment(&self, _experiment: &str) -> Result<Suggestion, SuggestionError> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        if *self.gone.lock().unwrap() {
            return Err(SuggestionError::Gone);
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(SuggestionError::Unavailable {
                retry_after: Duration::from_secs(1),
            })
    }

    async fn report_observation(&self, trial: &str, observation: &Observation) -> Result<(), SuggestionError> {
        self.reports
            .lock()
            .unwrap()
            .push((trial.to_string(), observation.clone()));
        Ok(())
    }

    async fn abandon(&self, trial: &str) -> Result<(), SuggestionError> {
        self.abandoned.lock().unwrap().push(trial.to_string());
        Ok(())
    }
}

/// Polls `check` every 50ms until it returns true or `timeout` passes
pub async fn wait_for<F, Fut>(mut check: F, timeout: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}
