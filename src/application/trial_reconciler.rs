//! Trial lifecycle reconciliation
//!
//! Each pass performs at most one externally visible step and persists the
//! trial before returning, so a pass interrupted at any point resumes from
//! the recorded conditions:
//!
//! 1. setup tasks (create job, initializer, finalizer, teardown)
//! 2. patch evaluation, once per trial
//! 3. patch application with a per-operation attempt budget
//! 4. stability of every waited-on patch target
//! 5. trial job creation and observation
//! 6. metric capture, then `Complete` or `Failed`

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::reconcile::{requeue_conflict, Action, ObjectKey, ReconcileError, Reconciler};
use crate::domain::error::{CaptureError, MetricError};
use crate::domain::models::{
    Config, ConditionStatus, ControllerConfig, Experiment, LabelSelector, Metric, ObjectReference,
    RequiredMetrics, Resource, Trial, TrialConditionType, TrialConfig, TrialValue, LABEL_TRIAL, LABEL_TRIAL_ROLE,
    ROLE_TRIAL_RUN, ROLE_TRIAL_SETUP, SETUP_FINALIZER,
};
use crate::domain::ports::{ListParams, ObjectStore, ObjectStoreExt, WatchEvent};
use crate::services::jobs::{self, SetupJobState, SetupMode, JOB_API_VERSION, JOB_KIND};
use crate::services::metric::{resolve_target, MetricCapture};
use crate::services::patch::PatchEvaluator;
use crate::services::template::TemplateEngine;
use crate::services::{stability, trial_status};

/// Initializer held while setup tasks run
pub const SETUP_INITIALIZER: &str = "setup";

const SETUP_POLL: Duration = Duration::from_secs(1);
const JOB_POLL: Duration = Duration::from_secs(1);

type Step = Result<Option<Action>, ReconcileError>;

/// Drives trials through their lifecycle
pub struct TrialReconciler {
    store: Arc<dyn ObjectStore>,
    evaluator: PatchEvaluator,
    capture: MetricCapture,
    trial_config: TrialConfig,
    stabilization_timeout: Duration,
}

impl TrialReconciler {
    pub fn new(store: Arc<dyn ObjectStore>, capture: MetricCapture, config: &Config) -> Self {
        Self::with_config(store, capture, config.trial.clone(), &config.controller)
    }

    pub fn with_config(
        store: Arc<dyn ObjectStore>,
        capture: MetricCapture,
        trial_config: TrialConfig,
        controller: &ControllerConfig,
    ) -> Self {
        Self {
            store,
            evaluator: PatchEvaluator::new(TemplateEngine::new(), trial_config.patch_attempts),
            capture,
            trial_config,
            stabilization_timeout: Duration::from_secs(controller.stabilization_timeout_secs),
        }
    }

    async fn update(&self, trial: &mut Trial) -> Result<Action, ReconcileError> {
        trial_status::update_status(trial);
        match self.store.update_resource(&*trial).await {
            Err(e) if e.is_not_found() => {
                debug!(trial = %trial.metadata.name, "Trial is gone, discarding update");
                Ok(Action::Done)
            }
            result => requeue_conflict(result),
        }
    }

    async fn updated(&self, trial: &mut Trial) -> Step {
        self.update(trial).await.map(Some)
    }

    /// Persists the trial and comes back after `wait` unless the update asked for something sooner
    async fn updated_after(&self, trial: &mut Trial, wait: Option<Duration>) -> Step {
        match (self.update(trial).await?, wait) {
            (Action::Done, Some(wait)) => Ok(Some(Action::Requeue(wait))),
            (action, _) => Ok(Some(action)),
        }
    }

    async fn experiment(&self, trial: &Trial) -> Result<Experiment, ReconcileError> {
        let (namespace, name) = (trial.experiment_namespace(), trial.experiment_name());
        match self.store.get_resource::<Experiment>(namespace, name).await {
            Err(e) if e.is_not_found() => Err(ReconcileError::ExperimentNotFound(format!("{namespace}/{name}"))),
            result => Ok(result?),
        }
    }

    async fn list_jobs(&self, trial: &Trial, role: &str) -> Result<Vec<Value>, ReconcileError> {
        let selector = LabelSelector::from_labels([
            (LABEL_TRIAL, trial.metadata.name.as_str()),
            (LABEL_TRIAL_ROLE, role),
        ]);
        let params = ListParams::in_namespace(trial.metadata.namespace.clone()).with_selector(selector);
        Ok(self.store.list(JOB_API_VERSION, JOB_KIND, &params).await?)
    }

    async fn manage_setup(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        if trial.spec.setup_tasks.is_empty() {
            return Ok(None);
        }

        if let Some(action) = self.inspect_setup_jobs(trial, now).await? {
            return Ok(Some(action));
        }
        if let Some(action) = self.create_setup_job(trial, now).await? {
            return Ok(Some(action));
        }
        self.finish_setup(trial).await
    }

    async fn inspect_setup_jobs(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        for condition_type in [TrialConditionType::SetupCreated, TrialConditionType::SetupDeleted] {
            if trial.condition(condition_type).is_none() {
                trial.apply_condition(condition_type, ConditionStatus::Unknown, "", "", now);
            }
        }

        let create_name = format!("{}-{}", trial.metadata.name, SetupMode::Create.as_str());
        for job in self.list_jobs(trial, ROLE_TRIAL_SETUP).await? {
            let name = job.pointer("/metadata/name").and_then(Value::as_str).unwrap_or_default();
            let condition_type = if name == create_name {
                TrialConditionType::SetupCreated
            } else {
                TrialConditionType::SetupDeleted
            };
            if trial.is_condition_true(condition_type) {
                continue;
            }

            match jobs::setup_job_state(&job) {
                SetupJobState::Running => {
                    trial.apply_condition(condition_type, ConditionStatus::False, "", "", now);
                }
                SetupJobState::Succeeded => {
                    trial.apply_condition(condition_type, ConditionStatus::True, "", "", now);
                }
                SetupJobState::Failed(message) => {
                    let attempts = trial
                        .status
                        .setup_attempts_remaining
                        .get_or_insert(self.trial_config.setup_attempts);
                    *attempts = attempts.saturating_sub(1);

                    if condition_type == TrialConditionType::SetupCreated && *attempts > 0 && !trial.is_finished() {
                        info!(trial = %trial.metadata.name, job = name, %message, "Retrying failed setup job");
                        let reference = ObjectReference::from_object(&job);
                        if let Err(e) = self.store.delete(&reference).await {
                            if !e.is_not_found() {
                                return Err(e.into());
                            }
                        }
                        trial.apply_condition(condition_type, ConditionStatus::Unknown, "SetupRetry", &message, now);
                        return self.updated(trial).await;
                    }

                    trial.apply_condition(condition_type, ConditionStatus::True, "", "", now);
                    if !trial.is_finished() {
                        trial.apply_condition(
                            TrialConditionType::Failed,
                            ConditionStatus::True,
                            "SetupJobFailed",
                            &message,
                            now,
                        );
                    }
                }
            }
        }

        if trial.status.conditions.iter().any(|c| c.last_transition_time == now) {
            return self.updated(trial).await;
        }
        Ok(None)
    }

    /// Teardown follows the trial job, not metric capture
    fn ready_for_teardown(trial: &Trial) -> bool {
        trial.status.completion_time.is_some() || trial.is_finished() || trial.metadata.is_deleted()
    }

    async fn create_setup_job(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        let mut mode = None;

        if trial.check_condition(TrialConditionType::SetupCreated, ConditionStatus::Unknown).0 {
            let initialized = trial.add_initializer(SETUP_INITIALIZER);
            if trial.metadata.add_finalizer(SETUP_FINALIZER) || initialized {
                return self.updated(trial).await;
            }
            mode = Some(SetupMode::Create);
        }

        if trial.check_condition(TrialConditionType::SetupDeleted, ConditionStatus::Unknown).0
            && Self::ready_for_teardown(trial)
        {
            mode = Some(SetupMode::Delete);
        }

        let Some(mode) = mode else {
            return Ok(None);
        };

        let Some(job) = jobs::setup_job(trial, mode, &self.trial_config.setup_image) else {
            // every task opted out of this mode
            let condition_type = match mode {
                SetupMode::Create => TrialConditionType::SetupCreated,
                SetupMode::Delete => TrialConditionType::SetupDeleted,
            };
            trial.apply_condition(condition_type, ConditionStatus::True, "", "", now);
            return self.updated(trial).await;
        };

        debug!(trial = %trial.metadata.name, mode = mode.as_str(), "Creating setup job");
        match self.store.create(job).await {
            Ok(_) => Ok(Some(Action::Done)),
            Err(e) if e.is_already_exists() => Ok(Some(Action::Requeue(SETUP_POLL))),
            Err(e) => Err(e.into()),
        }
    }

    async fn finish_setup(&self, trial: &mut Trial) -> Step {
        if trial.check_condition(TrialConditionType::SetupCreated, ConditionStatus::False).0
            && !trial.is_finished()
            && !trial.metadata.is_deleted()
        {
            return Ok(Some(Action::Requeue(SETUP_POLL)));
        }

        if trial.is_condition_true(TrialConditionType::SetupCreated) && trial.remove_initializer(SETUP_INITIALIZER) {
            return self.updated(trial).await;
        }

        if trial.is_condition_true(TrialConditionType::SetupDeleted) && trial.metadata.remove_finalizer(SETUP_FINALIZER) {
            return self.updated(trial).await;
        }
        Ok(None)
    }

    async fn evaluate_patches(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        if !trial.status.patch_operations.is_empty() || trial.condition(TrialConditionType::Patched).is_some() {
            return Ok(None);
        }

        let experiment = self.experiment(trial).await?;
        match self.evaluator.evaluate(&experiment, trial) {
            Ok(operations) => {
                let status = if operations.iter().any(|op| op.attempts_remaining > 0) {
                    ConditionStatus::Unknown
                } else {
                    ConditionStatus::True
                };
                trial.status.patch_operations = operations;
                trial.apply_condition(TrialConditionType::Patched, status, "", "", now);
            }
            Err(e) => {
                warn!(trial = %trial.metadata.name, error = %e, "Patch evaluation failed");
                trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "PatchFailed", &e.to_string(), now);
            }
        }
        self.updated(trial).await
    }

    async fn apply_patches(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        let Some(index) = trial.status.patch_operations.iter().position(|op| op.attempts_remaining > 0) else {
            if trial.check_condition(TrialConditionType::Patched, ConditionStatus::True) == (false, true) {
                trial.apply_condition(TrialConditionType::Patched, ConditionStatus::True, "", "", now);
                return self.updated(trial).await;
            }
            return Ok(None);
        };

        let op = &trial.status.patch_operations[index];
        let result = self.store.patch(&op.target_ref, op.patch_type, &op.data).await;

        let op = &mut trial.status.patch_operations[index];
        match result {
            Ok(_) => {
                debug!(target_ref = %op.target_ref, "Applied patch");
                op.attempts_remaining = 0;
                if op.wait {
                    trial.apply_condition(TrialConditionType::Stable, ConditionStatus::Unknown, "", "", now);
                }
            }
            Err(e) => {
                op.attempts_remaining -= 1;
                warn!(target_ref = %op.target_ref, attempts_remaining = op.attempts_remaining, error = %e, "Patch failed");
                if op.attempts_remaining == 0 {
                    let message = format!("{}: {e}", op.target_ref);
                    trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "PatchFailed", &message, now);
                }
            }
        }

        trial.apply_condition(TrialConditionType::Patched, ConditionStatus::False, "", "", now);
        self.updated(trial).await
    }

    fn stabilization_expired(&self, trial: &Trial, now: DateTime<Utc>) -> bool {
        let Some(patched) = trial
            .condition(TrialConditionType::Patched)
            .filter(|c| c.status == ConditionStatus::True)
        else {
            return false;
        };
        chrono::Duration::from_std(self.stabilization_timeout)
            .is_ok_and(|timeout| patched.last_transition_time + timeout <= now)
    }

    async fn wait_for_stability(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        let mut retry_after = Duration::ZERO;
        for index in 0..trial.status.patch_operations.len() {
            if !trial.status.patch_operations[index].wait {
                continue;
            }

            let target = trial.status.patch_operations[index].target_ref.clone();
            match stability::check_target(self.store.as_ref(), &target).await {
                Ok(()) => {
                    trial.status.patch_operations[index].wait = false;
                    trial.apply_condition(TrialConditionType::Stable, ConditionStatus::False, "", "", now);
                    return self.updated(trial).await;
                }
                Err(e) if e.is_transient() && !self.stabilization_expired(trial, now) => {
                    if e.retry_after > retry_after {
                        trial.apply_condition(TrialConditionType::Stable, ConditionStatus::False, "Waiting", &e.to_string(), now);
                        retry_after = e.retry_after;
                    }
                }
                Err(e) => {
                    let message = if e.is_transient() {
                        format!("timed out waiting for stability: {e}")
                    } else {
                        e.to_string()
                    };
                    warn!(target_ref = %target, %message, "Stability check failed");
                    trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "WaitFailed", &message, now);
                    return self.updated(trial).await;
                }
            }
        }

        if !retry_after.is_zero() {
            return self.updated_after(trial, Some(retry_after)).await;
        }

        if trial.check_condition(TrialConditionType::Stable, ConditionStatus::True) == (false, true) {
            trial.apply_condition(TrialConditionType::Stable, ConditionStatus::True, "", "", now);
            return self.updated(trial).await;
        }
        Ok(None)
    }

    /// Time remaining before the trial job may be created
    fn initial_delay(trial: &Trial, now: DateTime<Utc>) -> Option<Duration> {
        if trial.spec.initial_delay_seconds <= 0 {
            return None;
        }
        let ready = trial
            .condition(TrialConditionType::Stable)
            .or_else(|| trial.condition(TrialConditionType::Patched))
            .filter(|c| c.status == ConditionStatus::True)?
            .last_transition_time;
        let start = ready + chrono::Duration::seconds(trial.spec.initial_delay_seconds);
        (start - now).to_std().ok().filter(|d| !d.is_zero())
    }

    async fn run_job(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        let trial_jobs = self.list_jobs(trial, ROLE_TRIAL_RUN).await?;

        let Some(job) = trial_jobs.first() else {
            if let Some(delay) = Self::initial_delay(trial, now) {
                return Ok(Some(Action::Requeue(delay)));
            }
            let job = match jobs::trial_job(trial, self.trial_config.approximate_runtime_secs) {
                Ok(job) => job,
                Err(e) => {
                    trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "PatchFailed", &e.to_string(), now);
                    return self.updated(trial).await;
                }
            };
            info!(trial = %trial.metadata.name, "Creating trial job");
            return match self.store.create(job).await {
                Ok(_) => Ok(Some(Action::Done)),
                Err(e) if e.is_already_exists() => Ok(Some(Action::Requeue(JOB_POLL))),
                Err(e) => Err(e.into()),
            };
        };

        let pod_selector = job
            .pointer("/spec/selector")
            .cloned()
            .and_then(|s| serde_json::from_value::<LabelSelector>(s).ok())
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| {
                LabelSelector::from_labels([
                    (LABEL_TRIAL, trial.metadata.name.as_str()),
                    (LABEL_TRIAL_ROLE, ROLE_TRIAL_RUN),
                ])
            });
        let namespace = job
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or(&trial.metadata.namespace);
        let params = ListParams::in_namespace(namespace).with_selector(pod_selector);
        let pods = self.store.list("v1", jobs::POD_KIND, &params).await?;

        let observation = jobs::observe_trial_job(job, &pods);
        if observation.pending {
            return Ok(Some(Action::Requeue(JOB_POLL)));
        }

        let mut dirty = false;
        if let Some(started) = observation.started_at {
            let start = jobs::effective_start(trial, started);
            if trial.status.start_time.is_none_or(|t| t < start) {
                trial.status.start_time = Some(start);
                dirty = true;
            }
        }
        if let Some(finished) = observation.finished_at {
            if trial.status.completion_time.is_none_or(|t| finished < t) {
                trial.status.completion_time = Some(finished);
                dirty = true;
            }
        }
        if let Some((reason, message)) = observation.failure {
            trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, &reason, &message, now);
            dirty = true;
        }

        if dirty {
            return self.updated(trial).await;
        }
        Ok(None)
    }

    fn is_required(&self, metric: &Metric) -> bool {
        match self.trial_config.required_metrics {
            RequiredMetrics::All => true,
            RequiredMetrics::Optimized => metric.is_optimized(),
        }
    }

    async fn capture_metrics(&self, trial: &mut Trial, now: DateTime<Utc>) -> Step {
        if trial.status.completion_time.is_none() {
            return Ok(None);
        }

        let experiment = self.experiment(trial).await?;
        if !experiment.spec.metrics.is_empty() && trial.condition(TrialConditionType::Observed).is_none() {
            trial.apply_condition(TrialConditionType::Observed, ConditionStatus::Unknown, "", "", now);
            return self.updated(trial).await;
        }

        for metric in &experiment.spec.metrics {
            if !trial.status.values.iter().any(|v| v.name == metric.name) {
                trial
                    .status
                    .values
                    .push(TrialValue::pending(metric.name.clone(), self.trial_config.metric_attempts));
            }
        }

        // deferred metrics are skipped so the others are still collected
        let mut deferred: Option<Duration> = None;
        for metric in &experiment.spec.metrics {
            let Some(index) = trial
                .status
                .values
                .iter()
                .position(|v| v.name == metric.name && !v.is_captured() && v.attempts_remaining > 0)
            else {
                continue;
            };

            if let Some(wait) = trial.status.values[index]
                .not_before
                .and_then(|t| (t - now).to_std().ok())
                .filter(|d| !d.is_zero())
            {
                deferred = Some(deferred.map_or(wait, |d| d.min(wait)));
                continue;
            }

            let result = match resolve_target(self.store.as_ref(), trial, metric).await {
                Ok(target) => self.capture.capture(metric, trial, target.as_ref()).await,
                Err(e) => Err(MetricError::Capture(CaptureError::new(e.to_string()))),
            };

            let value = &mut trial.status.values[index];
            value.not_before = None;
            match result {
                Ok((v, error)) => {
                    value.value = Some(v);
                    value.error = (error != 0.0).then_some(error);
                    value.attempts_remaining = 0;
                }
                Err(MetricError::Capture(e)) if e.is_transient() && value.attempts_remaining > 1 => {
                    value.attempts_remaining -= 1;
                    let retry_after = e.retry_after;
                    value.not_before = chrono::Duration::from_std(retry_after).ok().map(|d| now + d);
                    debug!(metric = %metric.name, ?retry_after, attempts_remaining = value.attempts_remaining, "Metric not ready");
                    deferred = Some(deferred.map_or(retry_after, |d| d.min(retry_after)));
                }
                Err(e) => {
                    value.attempts_remaining -= 1;
                    warn!(metric = %metric.name, attempts_remaining = value.attempts_remaining, error = %e, "Metric capture failed");
                    if value.attempts_remaining == 0 {
                        let message = format!("{}: {e}", metric.name);
                        if self.is_required(metric) {
                            trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "MetricFailed", &message, now);
                            trial.apply_condition(TrialConditionType::Observed, ConditionStatus::False, "", "", now);
                            return self.updated(trial).await;
                        }
                        warn!(trial = %trial.metadata.name, %message, "Giving up on metric");
                    }
                }
            }
        }

        if trial.status.values.iter().any(|v| !v.is_captured() && v.attempts_remaining > 0) {
            trial.apply_condition(TrialConditionType::Observed, ConditionStatus::False, "", "", now);
            return self.updated_after(trial, deferred).await;
        }

        if trial.check_condition(TrialConditionType::Observed, ConditionStatus::True) == (false, true) {
            trial.apply_condition(TrialConditionType::Observed, ConditionStatus::True, "", "", now);
        }
        trial.apply_condition(TrialConditionType::Complete, ConditionStatus::True, "", "", now);
        info!(trial = %trial.metadata.name, values = %trial_status::values(trial), "Trial completed");
        self.updated(trial).await
    }

    async fn reconcile_trial(&self, trial: &mut Trial, now: DateTime<Utc>) -> Result<Action, ReconcileError> {
        if let Some(action) = self.manage_setup(trial, now).await? {
            return Ok(action);
        }

        if trial.is_finished() || trial.metadata.is_deleted() {
            if trial_status::update_status(trial) {
                return self.update(trial).await;
            }
            return Ok(Action::Done);
        }

        if let Some(action) = self.evaluate_patches(trial, now).await? {
            return Ok(action);
        }
        if trial.has_initializer() {
            return Ok(Action::Done);
        }

        if let Some(action) = self.apply_patches(trial, now).await? {
            return Ok(action);
        }
        if let Some(action) = self.wait_for_stability(trial, now).await? {
            return Ok(action);
        }
        if let Some(action) = self.run_job(trial, now).await? {
            return Ok(action);
        }
        if let Some(action) = self.capture_metrics(trial, now).await? {
            return Ok(action);
        }
        Ok(Action::Done)
    }
}

#[async_trait]
impl Reconciler for TrialReconciler {
    fn api_version(&self) -> &'static str {
        Trial::API_VERSION
    }

    fn kind(&self) -> &'static str {
        Trial::KIND
    }

    #[instrument(skip(self), fields(trial = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let mut trial = match self.store.get_resource::<Trial>(&key.namespace, &key.name).await {
            Ok(trial) => trial,
            Err(e) if e.is_not_found() => return Ok(Action::Done),
            Err(e) => return Err(e.into()),
        };
        self.reconcile_trial(&mut trial, Utc::now()).await
    }

    /// Jobs and pods carrying the trial label map back to their trial
    async fn related(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        if event.object.kind != JOB_KIND && event.object.kind != jobs::POD_KIND {
            return Vec::new();
        }
        event
            .labels
            .get(LABEL_TRIAL)
            .map(|name| vec![ObjectKey::new(event.object.namespace.clone(), name.clone())])
            .unwrap_or_default()
    }
}
