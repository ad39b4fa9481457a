//! Builders and status readers for trial run and setup jobs
//!
//! Jobs are kept unstructured (`batch/v1` Job documents) since the job
//! template on a trial is arbitrary user content.

use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Map, Value};

use crate::domain::error::PatchError;
use crate::domain::models::trial::{
    LABEL_EXPERIMENT, LABEL_TRIAL, LABEL_TRIAL_ROLE, ROLE_TRIAL_RUN, ROLE_TRIAL_SETUP,
};
use crate::domain::models::{LabelSelector, ObjectReference, PatchType, Trial};
use crate::services::patch::apply::apply_patch;

pub const JOB_API_VERSION: &str = "batch/v1";
pub const JOB_KIND: &str = "Job";
pub const POD_KIND: &str = "Pod";

/// Setup job flavor, also passed to the setup containers as `MODE`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupMode {
    Create,
    Delete,
}

impl SetupMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Delete => "delete",
        }
    }
}

/// Whether the reference points at the job the trial itself will run
pub fn is_trial_job_reference(trial: &Trial, target: &ObjectReference) -> bool {
    if target.kind != JOB_KIND {
        return false;
    }
    if !target.api_version.is_empty() && target.api_version != JOB_API_VERSION {
        return false;
    }
    if !target.namespace.is_empty() && target.namespace != trial.metadata.namespace {
        return false;
    }
    match template_job_name(trial) {
        Some(name) => name == target.name,
        None => !target.name.is_empty() && trial.metadata.name.starts_with(&target.name),
    }
}

fn template_job_name(trial: &Trial) -> Option<&str> {
    trial
        .spec
        .job_template
        .as_ref()
        .and_then(|t| t.pointer("/metadata/name"))
        .and_then(Value::as_str)
        .filter(|n| !n.is_empty())
}

/// Labels identifying the jobs and pods of a trial
pub fn trial_labels(trial: &Trial, role: &str) -> Map<String, Value> {
    let mut labels = Map::new();
    labels.insert(LABEL_EXPERIMENT.into(), trial.experiment_name().into());
    labels.insert(LABEL_TRIAL.into(), trial.metadata.name.as_str().into());
    labels.insert(LABEL_TRIAL_ROLE.into(), role.into());
    labels
}

/// Selector for every job belonging to the trial
pub fn trial_job_selector(trial: &Trial) -> LabelSelector {
    LabelSelector::from_labels([(LABEL_TRIAL, trial.metadata.name.as_str())])
}

/// Returns the object stored at `value`, replacing anything that is not an object
fn ensure_object(value: &mut Value) -> &mut Map<String, Value> {
    if !value.is_object() {
        *value = Value::Object(Map::new());
    }
    match value {
        Value::Object(map) => map,
        _ => unreachable!("value was just replaced with an object"),
    }
}

fn object_at<'a>(value: &'a mut Value, path: &[&str]) -> &'a mut Map<String, Value> {
    let mut current = value;
    for key in path {
        current = ensure_object(current)
            .entry((*key).to_string())
            .or_insert(Value::Null);
    }
    ensure_object(current)
}

/// Formats whole seconds like Go's `time.Duration` (`2m0s`, `1h0m30s`)
pub fn format_duration(seconds: i64) -> String {
    let sign = if seconds < 0 { "-" } else { "" };
    let s = seconds.unsigned_abs();
    let (h, m, s) = (s / 3600, (s % 3600) / 60, s % 60);
    if h > 0 {
        format!("{sign}{h}h{m}m{s}s")
    } else if m > 0 {
        format!("{sign}{m}m{s}s")
    } else {
        format!("{sign}{s}s")
    }
}

/// Builds the trial run job, merging in any patches that target the job itself
pub fn trial_job(trial: &Trial, default_runtime_seconds: i64) -> Result<Value, PatchError> {
    let mut job = json!({
        "apiVersion": JOB_API_VERSION,
        "kind": JOB_KIND,
        "metadata": {},
        "spec": {"template": {"metadata": {}, "spec": {}}},
    });
    if let Some(template) = &trial.spec.job_template {
        crate::services::patch::apply::merge_patch(&mut job, template);
    }

    for path in [&["metadata", "labels"][..], &["spec", "template", "metadata", "labels"][..]] {
        object_at(&mut job, path).extend(trial_labels(trial, ROLE_TRIAL_RUN));
    }

    let metadata = object_at(&mut job, &["metadata"]);
    metadata.insert("namespace".into(), trial.metadata.namespace.as_str().into());
    if metadata.get("name").and_then(Value::as_str).unwrap_or_default().is_empty() {
        metadata.insert("name".into(), trial.metadata.name.as_str().into());
    }

    let spec = object_at(&mut job, &["spec"]);
    spec.entry("backoffLimit").or_insert(json!(0));

    let pod_spec = object_at(&mut job, &["spec", "template", "spec"]);
    pod_spec.entry("restartPolicy").or_insert(json!("Never"));
    let has_containers = pod_spec
        .get("containers")
        .and_then(Value::as_array)
        .is_some_and(|c| !c.is_empty());
    if !has_containers {
        let runtime = trial
            .spec
            .approximate_runtime_seconds
            .filter(|s| *s > 0)
            .unwrap_or(default_runtime_seconds)
            + trial.spec.start_time_offset_seconds.unwrap_or(0);
        pod_spec.insert(
            "containers".into(),
            json!([{
                "name": "default-trial-run",
                "image": "busybox",
                "command": ["/bin/sh"],
                "args": ["-c", format!(
                    "echo 'Sleeping for {}...' && sleep {runtime} && echo 'Done.'",
                    format_duration(runtime)
                )],
            }]),
        );
    }

    for op in &trial.status.patch_operations {
        if is_trial_job_reference(trial, &op.target_ref) {
            if op.patch_type != PatchType::Strategic {
                return Err(PatchError::TrialJobPatchType);
            }
            job = apply_patch(&job, PatchType::Strategic, &op.data)?;
        }
    }
    Ok(job)
}

/// Builds the setup job for the mode, or `None` when no task participates
pub fn setup_job(trial: &Trial, mode: SetupMode, default_image: &str) -> Option<Value> {
    let name = format!("{}-{}", trial.metadata.name, mode.as_str());

    let containers: Vec<Value> = trial
        .spec
        .setup_tasks
        .iter()
        .filter(|task| match mode {
            SetupMode::Create => !task.skip_create,
            SetupMode::Delete => !task.skip_delete,
        })
        .map(|task| {
            let mut env = vec![
                json!({"name": "NAMESPACE", "value": trial.metadata.namespace}),
                json!({"name": "NAME", "value": task.name}),
                json!({"name": "TRIAL", "value": trial.metadata.name}),
                json!({"name": "MODE", "value": mode.as_str()}),
            ];
            env.extend(trial.spec.assignments.iter().map(|a| {
                json!({
                    "name": a.name.to_uppercase().replace('.', "_"),
                    "value": a.value.to_string(),
                })
            }));
            let args = if task.args.is_empty() {
                vec![mode.as_str().to_string()]
            } else {
                task.args.clone()
            };
            let image = if task.image.is_empty() {
                default_image
            } else {
                task.image.as_str()
            };
            json!({
                "name": format!("{name}-{}", task.name),
                "image": image,
                "args": args,
                "env": env,
            })
        })
        .collect();

    if containers.is_empty() {
        return None;
    }

    let labels = trial_labels(trial, ROLE_TRIAL_SETUP);
    let mut pod_spec = json!({
        "restartPolicy": "Never",
        "containers": containers,
    });
    if !trial.spec.setup_service_account_name.is_empty() {
        object_at(&mut pod_spec, &[]).insert(
            "serviceAccountName".into(),
            trial.spec.setup_service_account_name.as_str().into(),
        );
    }

    Some(json!({
        "apiVersion": JOB_API_VERSION,
        "kind": JOB_KIND,
        "metadata": {
            "name": name,
            "namespace": trial.metadata.namespace,
            "labels": labels,
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {"labels": labels},
                "spec": pod_spec,
            },
        },
    }))
}

/// Progress of a setup job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SetupJobState {
    Running,
    Succeeded,
    Failed(String),
}

pub fn setup_job_state(job: &Value) -> SetupJobState {
    for c in conditions(job) {
        if c.get("status").and_then(Value::as_str) != Some("True") {
            continue;
        }
        let text = |key: &str| c.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        match c.get("type").and_then(Value::as_str) {
            Some("Complete") => return SetupJobState::Succeeded,
            Some("Failed") => {
                let reason = text("reason");
                let message = match (reason.as_str(), text("message")) {
                    ("BackoffLimitExceeded", _) => "Setup job did not complete successfully".to_string(),
                    (_, m) if !m.is_empty() => m,
                    ("", _) => "Setup job failed without reporting a reason".to_string(),
                    (r, _) => format!("Setup job failed with reason '{r}'"),
                };
                return SetupJobState::Failed(message);
            }
            _ => {}
        }
    }

    let failed = job.pointer("/status/failed").and_then(Value::as_i64).unwrap_or(0);
    if failed > 0 {
        return SetupJobState::Failed(format!("Setup job has {failed} failed pod(s)"));
    }
    SetupJobState::Running
}

/// What the trial run job and its pods say about the run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobObservation {
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `(reason, message)` when the job or one of its pods failed
    pub failure: Option<(String, String)>,
    /// Pods have not reported container times the job already has
    pub pending: bool,
}

fn conditions(object: &Value) -> impl Iterator<Item = &Value> {
    object
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn time_at(object: &Value, pointer: &str) -> Option<DateTime<Utc>> {
    object
        .pointer(pointer)
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Reads run times and failures from the trial job and the pods it owns
pub fn observe_trial_job(job: &Value, pods: &[Value]) -> JobObservation {
    let mut observation = JobObservation {
        started_at: time_at(job, "/status/startTime"),
        finished_at: time_at(job, "/status/completionTime"),
        ..Default::default()
    };

    if !pods.is_empty() {
        let mut started: Option<DateTime<Utc>> = None;
        let mut finished: Option<DateTime<Utc>> = None;
        for pod in pods {
            if pod.pointer("/status/phase").and_then(Value::as_str) == Some("Failed") {
                let reason = pod
                    .pointer("/status/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("PodFailed");
                observation.failure = Some((reason.to_string(), "trial pod failed".to_string()));
            }
            for c in conditions(pod) {
                let field = |key: &str| c.get(key).and_then(Value::as_str).unwrap_or_default();
                if field("type") == "PodScheduled" && field("status") == "False" && field("reason") == "Unschedulable" {
                    observation.failure = Some((
                        "Unschedulable".to_string(),
                        format!("trial pod: {}", field("message")),
                    ));
                }
            }

            let statuses = pod
                .pointer("/status/containerStatuses")
                .and_then(Value::as_array)
                .into_iter()
                .flatten();
            for status in statuses {
                if let Some(t) = time_at(status, "/state/running/startedAt") {
                    started = Some(started.map_or(t, |s| s.min(t)));
                } else if status.pointer("/state/terminated").is_some() {
                    if let Some(t) = time_at(status, "/state/terminated/startedAt") {
                        started = Some(started.map_or(t, |s| s.min(t)));
                    }
                    if let Some(t) = time_at(status, "/state/terminated/finishedAt") {
                        finished = Some(finished.map_or(t, |f| f.max(t)));
                    }
                }
            }
        }

        if (started.is_none() && observation.started_at.is_some())
            || (finished.is_none() && observation.finished_at.is_some())
        {
            observation.pending = true;
            return observation;
        }
        observation.started_at = started;
        observation.finished_at = finished;
    }

    for c in conditions(job) {
        let field = |key: &str| c.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
        if field("type") == "Failed" && field("status") == "True" {
            observation.failure = Some((field("reason"), field("message")));
        }
    }
    observation
}

/// Effective start time: the job start shifted by the trial's start offset
pub fn effective_start(trial: &Trial, started_at: DateTime<Utc>) -> DateTime<Utc> {
    started_at + Duration::seconds(trial.spec.start_time_offset_seconds.unwrap_or(0))
}
