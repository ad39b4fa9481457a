//! Experiment orchestration
//!
//! Keeps the number of active trials of an experiment at its concurrency
//! limit: finished trials are reported to the suggestion service and cleaned
//! up after their TTL, and new trials are created from fresh suggestions
//! whenever a namespace is free.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use super::reconcile::{requeue_conflict, Action, ObjectKey, ReconcileError, Reconciler};
use crate::domain::models::{
    ControllerConfig, Experiment, LabelSelector, Resource, Trial, TrialConditionType,
    ANNOTATION_REPORT_TRIAL_URL, EXPERIMENT_FINALIZER, LABEL_EXPERIMENT, REPORT_FINALIZER,
};
use crate::domain::ports::{
    ListParams, ObjectStore, ObjectStoreExt, Observation, ObservedValue, SuggestionError,
    SuggestionService, WatchEvent,
};
use crate::services::scheduling::{self, PHASE_COMPLETED};
use crate::services::{trial_status, validation};

/// Outcome of asking for the next trial
enum Suggested {
    Created,
    Deferred(Action),
}

/// Reconciles experiments against their trials and the suggestion service
///
/// The reconciler is the only writer of experiment status. Namespace claims
/// are written to the status with the experiment's resource version before the
/// trial is created, so two concurrent passes can never hand the same
/// namespace to two trials.
pub struct ExperimentReconciler {
    store: Arc<dyn ObjectStore>,
    suggestions: Arc<dyn SuggestionService>,
    limiter: Option<DefaultKeyedRateLimiter<String>>,
    min_requeue: Duration,
    max_requeue: Duration,
}

impl ExperimentReconciler {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        suggestions: Arc<dyn SuggestionService>,
        config: &ControllerConfig,
    ) -> Self {
        let limiter = NonZeroU32::new(config.trial_creation_per_second)
            .map(|rate| RateLimiter::keyed(Quota::per_second(rate)));
        Self {
            store,
            suggestions,
            limiter,
            min_requeue: Duration::from_secs(config.min_requeue_secs),
            max_requeue: Duration::from_secs(config.max_requeue_secs),
        }
    }

    async fn list_trials(&self, experiment: &Experiment) -> Result<Vec<Trial>, ReconcileError> {
        let selector = experiment
            .spec
            .selector
            .clone()
            .unwrap_or_else(|| LabelSelector::from_labels([(LABEL_EXPERIMENT, experiment.metadata.name.as_str())]));
        let params = ListParams {
            namespace: None,
            selector: Some(selector),
        };
        let trials = self.store.list_resources::<Trial>(&params).await?;
        Ok(trials
            .into_iter()
            .filter(|t| t.experiment_namespace() == experiment.metadata.namespace)
            .collect())
    }

    async fn list_namespaces(&self, experiment: &Experiment) -> Result<Vec<String>, ReconcileError> {
        let Some(selector) = &experiment.spec.namespace_selector else {
            return Ok(Vec::new());
        };
        let params = ListParams {
            namespace: None,
            selector: Some(selector.clone()),
        };
        let namespaces = self.store.list("v1", "Namespace", &params).await?;
        Ok(namespaces
            .iter()
            .filter_map(|ns| ns.pointer("/metadata/name").and_then(Value::as_str))
            .map(str::to_string)
            .collect())
    }

    /// Deletes expired trials, and unfinished ones when the experiment is going away
    async fn cleanup_trials(&self, experiment: &Experiment, trials: &[Trial], now: DateTime<Utc>) -> Result<bool, ReconcileError> {
        let mut deleted = false;
        for trial in trials {
            let abandon = experiment.metadata.is_deleted() && !trial.is_finished() && !trial.metadata.is_deleted();
            if !trial.needs_cleanup(now) && !abandon {
                continue;
            }
            debug!(trial = %trial.metadata.name, abandon, "Deleting trial");
            match self.store.delete(&trial.object_ref()).await {
                Ok(()) => deleted = true,
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    fn observation(trial: &Trial) -> Observation {
        if trial.is_failed() {
            return Observation::failed();
        }
        Observation {
            values: trial
                .status
                .values
                .iter()
                .filter_map(|v| {
                    v.value.map(|value| ObservedValue {
                        metric_name: v.name.clone(),
                        value,
                        error: v.error,
                    })
                })
                .collect(),
            failed: false,
        }
    }

    fn ignorable(error: &SuggestionError) -> bool {
        matches!(error, SuggestionError::Gone | SuggestionError::Rejected { status: 404, .. })
    }

    /// Reports a finished trial, or abandons one deleted before it finished
    async fn release_trial(&self, trial: &mut Trial) -> Result<Option<Action>, ReconcileError> {
        if !trial.metadata.has_finalizer(REPORT_FINALIZER) {
            return Ok(None);
        }

        let finished = trial.is_finished();
        if !finished && !trial.is_abandoned() {
            return Ok(None);
        }

        if let Some(name) = trial.report_name() {
            let result = if finished {
                let observation = Self::observation(trial);
                self.suggestions.report_observation(name, &observation).await
            } else {
                self.suggestions.abandon(name).await
            };
            match result {
                Ok(()) => {}
                Err(e) if Self::ignorable(&e) => debug!(trial = name, error = %e, "Suggestion already gone"),
                Err(e) => return Err(e.into()),
            }
        }

        trial.metadata.remove_finalizer(REPORT_FINALIZER);
        let action = requeue_conflict(self.store.update_resource(&*trial).await)?;
        if action.is_requeue() {
            return Ok(Some(action));
        }

        if finished {
            let failure = trial
                .status
                .conditions
                .iter()
                .find(|c| c.condition_type == TrialConditionType::Failed)
                .map(|c| c.reason.clone())
                .unwrap_or_default();
            info!(
                trial = %trial.metadata.name,
                values = %trial_status::values(trial),
                failure_reason = %failure,
                "Reported trial"
            );
        } else {
            info!(trial = %trial.metadata.name, "Abandoned trial");
        }
        Ok(None)
    }

    fn clamp_requeue(&self, retry_after: Duration) -> Duration {
        retry_after.clamp(self.min_requeue, self.max_requeue.max(self.min_requeue))
    }

    /// Time until the experiment may create another trial
    fn rate_limited(&self, experiment: &Experiment) -> Option<Duration> {
        let limiter = self.limiter.as_ref()?;
        limiter
            .check_key(&experiment.metadata.name)
            .err()
            .map(|not_until| not_until.wait_time_from(DefaultClock::default().now()))
    }

    async fn next_trial(&self, experiment: &mut Experiment, trials: &[Trial]) -> Result<Suggested, ReconcileError> {
        let namespaces = self.list_namespaces(experiment).await?;
        let Some(namespace) = scheduling::next_trial_namespace(experiment, trials, &namespaces) else {
            debug!("No namespace available for a new trial");
            return Ok(Suggested::Deferred(Action::Done));
        };

        if let Some(wait) = self.rate_limited(experiment) {
            return Ok(Suggested::Deferred(Action::Requeue(wait)));
        }

        let suggestion = match self.suggestions.next_assignment(experiment.server_name()).await {
            Ok(suggestion) => suggestion,
            Err(SuggestionError::Unavailable { retry_after }) => {
                let delay = self.clamp_requeue(retry_after);
                debug!(?delay, "Suggestion unavailable");
                return Ok(Suggested::Deferred(Action::Requeue(delay)));
            }
            Err(SuggestionError::Gone) => {
                info!("Suggestion service stopped the experiment");
                experiment.spec.replicas = Some(0);
                experiment.status.phase = PHASE_COMPLETED.to_string();
                let action = requeue_conflict(self.store.update_resource(&*experiment).await)?;
                return Ok(Suggested::Deferred(action));
            }
            Err(e) => return Err(e.into()),
        };

        // claim the namespace before the trial exists
        experiment.status.trials_created += 1;
        experiment.status.namespaces_in_use.push(namespace.clone());
        if let Err(e) = self.store.update_resource(&*experiment).await {
            self.abandon_suggestion(&suggestion.name).await;
            return match requeue_conflict::<()>(Err(e))? {
                Action::Done => Ok(Suggested::Deferred(Action::Requeue(Duration::ZERO))),
                action => Ok(Suggested::Deferred(action)),
            };
        }

        let mut trial = scheduling::populate_trial(experiment, &namespace, suggestion.assignments);
        for (key, value) in suggestion.labels {
            trial.metadata.labels.entry(key).or_insert(value);
        }
        trial
            .metadata
            .annotations
            .insert(ANNOTATION_REPORT_TRIAL_URL.to_string(), suggestion.name.clone());
        trial.metadata.add_finalizer(REPORT_FINALIZER);
        trial_status::update_status(&mut trial);

        match self.store.create_resource(&trial).await {
            Ok(created) => {
                info!(
                    trial = %created.metadata.name,
                    namespace = %created.target_namespace(),
                    assignments = %created.status.assignments,
                    report_name = %suggestion.name,
                    "Created new trial"
                );
                Ok(Suggested::Created)
            }
            Err(e) => {
                warn!(error = %e, "Trial creation failed, abandoning suggestion");
                self.abandon_suggestion(&suggestion.name).await;
                Err(e.into())
            }
        }
    }

    async fn abandon_suggestion(&self, name: &str) {
        if let Err(e) = self.suggestions.abandon(name).await {
            if !Self::ignorable(&e) {
                warn!(trial = name, error = %e, "Unable to abandon suggestion");
            }
        }
    }

    async fn reconcile_experiment(&self, mut experiment: Experiment, now: DateTime<Utc>) -> Result<Action, ReconcileError> {
        if !experiment.metadata.is_deleted() && experiment.metadata.add_finalizer(EXPERIMENT_FINALIZER) {
            match self.store.update_resource(&experiment).await {
                Ok(updated) => experiment = updated,
                Err(e) => return requeue_conflict::<()>(Err(e)),
            }
        }

        let mut trials = self.list_trials(&experiment).await?;

        if self.cleanup_trials(&experiment, &trials, now).await? {
            return Ok(Action::Requeue(Duration::ZERO));
        }

        let mut holding_finalizer = false;
        for trial in &mut trials {
            if let Some(action) = self.release_trial(trial).await? {
                return Ok(action);
            }
            holding_finalizer |= trial.metadata.has_finalizer(REPORT_FINALIZER);
        }

        let problem = validation::validate_experiment(&experiment).err().map(|e| e.to_string());
        if scheduling::update_status(&mut experiment, &trials, problem.as_deref()) {
            if let Some(message) = &problem {
                warn!(%message, "Experiment is invalid, no trials will be created");
            }
            match self.store.update_resource(&experiment).await {
                Ok(updated) => experiment = updated,
                Err(e) => return requeue_conflict::<()>(Err(e)),
            }
        }

        if experiment.metadata.is_deleted() {
            if !holding_finalizer && experiment.metadata.remove_finalizer(EXPERIMENT_FINALIZER) {
                if let Some(limiter) = &self.limiter {
                    limiter.retain_recent();
                }
                let action = requeue_conflict(self.store.update_resource(&experiment).await)?;
                info!("Unlinked experiment");
                return Ok(action);
            }
            return Ok(Action::Done);
        }

        if problem.is_some() {
            return Ok(Action::Done);
        }
        if experiment.status.active_trials >= experiment.concurrency_limit() || !experiment.within_budget() {
            return Ok(Action::Done);
        }

        match self.next_trial(&mut experiment, &trials).await? {
            Suggested::Created => Ok(Action::Done),
            Suggested::Deferred(action) => Ok(action),
        }
    }
}

#[async_trait]
impl Reconciler for ExperimentReconciler {
    fn api_version(&self) -> &'static str {
        Experiment::API_VERSION
    }

    fn kind(&self) -> &'static str {
        Experiment::KIND
    }

    #[instrument(skip(self), fields(experiment = %key))]
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, ReconcileError> {
        let experiment = match self.store.get_resource::<Experiment>(&key.namespace, &key.name).await {
            Ok(experiment) => experiment,
            Err(e) if e.is_not_found() => return Ok(Action::Done),
            Err(e) => return Err(e.into()),
        };
        self.reconcile_experiment(experiment, Utc::now()).await
    }

    /// Trial changes wake up the owning experiment
    async fn related(&self, event: &WatchEvent) -> Vec<ObjectKey> {
        if event.object.kind != Trial::KIND {
            return Vec::new();
        }
        if let Ok(trial) = self
            .store
            .get_resource::<Trial>(&event.object.namespace, &event.object.name)
            .await
        {
            return vec![ObjectKey::new(trial.experiment_namespace(), trial.experiment_name())];
        }
        event
            .labels
            .get(LABEL_EXPERIMENT)
            .map(|name| vec![ObjectKey::new(event.object.namespace.clone(), name.clone())])
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{ConditionStatus, ObjectMeta, TrialValue};

    #[test]
    fn test_failed_trials_report_no_values() {
        let mut trial = Trial {
            metadata: ObjectMeta::named("default", "web-001"),
            ..Default::default()
        };
        let mut latency = TrialValue::pending("latency", 0);
        latency.value = Some(12.5);
        latency.error = Some(0.5);
        trial.status.values = vec![latency, TrialValue::pending("cost", 1)];

        let observation = ExperimentReconciler::observation(&trial);
        assert!(!observation.failed);
        assert_eq!(
            observation.values,
            vec![ObservedValue {
                metric_name: "latency".into(),
                value: 12.5,
                error: Some(0.5),
            }]
        );

        trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "MetricFailed", "", Utc::now());
        assert_eq!(ExperimentReconciler::observation(&trial), Observation::failed());
    }

    #[test]
    fn test_missing_remote_objects_are_ignored() {
        assert!(ExperimentReconciler::ignorable(&SuggestionError::Gone));
        assert!(ExperimentReconciler::ignorable(&SuggestionError::Rejected {
            status: 404,
            message: String::new(),
        }));
        assert!(!ExperimentReconciler::ignorable(&SuggestionError::Transport("reset".into())));
    }
}
