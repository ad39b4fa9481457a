use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::experiment::PatchType;
use super::meta::{ObjectMeta, ObjectReference, Resource};
use super::selector::LabelSelector;

/// Label naming the owning experiment
pub const LABEL_EXPERIMENT: &str = "optimize.dev/experiment";
/// Label naming the owning trial
pub const LABEL_TRIAL: &str = "optimize.dev/trial";
/// Label distinguishing trial run jobs from setup jobs
pub const LABEL_TRIAL_ROLE: &str = "optimize.dev/trial-role";

/// Comma-delimited list of pending initializers
pub const ANNOTATION_INITIALIZER: &str = "optimize.dev/initializer";
/// Name of the trial on the suggestion service
pub const ANNOTATION_REPORT_TRIAL_URL: &str = "optimize.dev/report-trial-url";

/// Finalizer held until the trial observation is reported upstream
pub const REPORT_FINALIZER: &str = "finalizer.optimize.dev/report";
/// Finalizer held until setup teardown has run
pub const SETUP_FINALIZER: &str = "finalizer.optimize.dev/setup";

/// Role label value for the workload job
pub const ROLE_TRIAL_RUN: &str = "trialRun";
/// Role label value for setup jobs
pub const ROLE_TRIAL_SETUP: &str = "trialSetup";

/// One concrete run of an experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trial {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: TrialSpec,

    #[serde(default)]
    pub status: TrialStatus,
}

impl Resource for Trial {
    const API_VERSION: &'static str = "optimize.dev/v1";
    const KIND: &'static str = "Trial";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_ref: Option<ObjectReference>,

    /// Namespace patches are applied to, defaults to the trial namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_namespace: String,

    /// Selector for the workload job, defaults to the trial label
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(default)]
    pub assignments: Vec<Assignment>,

    /// Unstructured batch job template (`metadata` and `spec`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_template: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time_offset_seconds: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_runtime_seconds: Option<i64>,

    /// Delay between stabilization and job creation
    #[serde(default)]
    pub initial_delay_seconds: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_failure: Option<i64>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup_tasks: Vec<SetupTask>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub setup_service_account_name: String,
}

/// Work executed before (and optionally after) the trial run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupTask {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    #[serde(default)]
    pub skip_create: bool,

    #[serde(default)]
    pub skip_delete: bool,
}

/// Concrete value for one experiment parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssignmentValue {
    Int(i64),
    Double(f64),
    String(String),
}

impl AssignmentValue {
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Double(d) => Some(*d),
            Self::String(s) => s.parse().ok(),
        }
    }
}

impl fmt::Display for AssignmentValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Double(d) => write!(f, "{d}"),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for AssignmentValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for AssignmentValue {
    fn from(v: i32) -> Self {
        Self::Int(i64::from(v))
    }
}

impl From<f64> for AssignmentValue {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for AssignmentValue {
    fn from(v: &str) -> Self {
        Self::String(v.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub value: AssignmentValue,
}

impl Assignment {
    pub fn new(name: impl Into<String>, value: impl Into<AssignmentValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Rendered patch bound to a target object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchOperation {
    pub target_ref: ObjectReference,

    pub patch_type: PatchType,

    /// JSON encoded patch body
    pub data: String,

    pub attempts_remaining: u32,

    /// Block trial progress until the target stabilizes
    #[serde(default)]
    pub wait: bool,
}

/// Captured (or pending) metric slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialValue {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,

    pub attempts_remaining: u32,

    /// Capture must not be retried before this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl TrialValue {
    pub fn pending(name: impl Into<String>, attempts: u32) -> Self {
        Self {
            name: name.into(),
            value: None,
            error: None,
            attempts_remaining: attempts,
            not_before: None,
        }
    }

    pub const fn is_captured(&self) -> bool {
        self.value.is_some()
    }

    /// Out of attempts without a value
    pub const fn is_exhausted(&self) -> bool {
        self.value.is_none() && self.attempts_remaining == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialConditionType {
    Patched,
    Stable,
    SetupCreated,
    Observed,
    SetupDeleted,
    Complete,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialCondition {
    #[serde(rename = "type")]
    pub condition_type: TrialConditionType,
    pub status: ConditionStatus,
    pub last_probe_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatus {
    /// Human readable summary of the lifecycle position
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    /// Assignments formatted for display
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub assignments: String,

    /// Captured values formatted for display
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<TrialCondition>,

    #[serde(default)]
    pub patch_operations: Vec<PatchOperation>,

    #[serde(default)]
    pub values: Vec<TrialValue>,

    /// Remaining create attempts for setup tasks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub setup_attempts_remaining: Option<u32>,
}

impl Trial {
    /// Name of the owning experiment
    pub fn experiment_name(&self) -> &str {
        if let Some(r) = &self.spec.experiment_ref {
            return &r.name;
        }
        self.metadata
            .labels
            .get(LABEL_EXPERIMENT)
            .map_or(self.metadata.name.as_str(), String::as_str)
    }

    /// Namespace of the owning experiment
    pub fn experiment_namespace(&self) -> &str {
        match &self.spec.experiment_ref {
            Some(r) if !r.namespace.is_empty() => &r.namespace,
            _ => &self.metadata.namespace,
        }
    }

    /// Namespace patches and metrics are scoped to
    pub fn target_namespace(&self) -> &str {
        if self.spec.target_namespace.is_empty() {
            &self.metadata.namespace
        } else {
            &self.spec.target_namespace
        }
    }

    pub fn assignment(&self, name: &str) -> Option<&AssignmentValue> {
        self.spec
            .assignments
            .iter()
            .find(|a| a.name == name)
            .map(|a| &a.value)
    }

    pub fn assignment_map(&self) -> BTreeMap<String, AssignmentValue> {
        self.spec
            .assignments
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }

    pub fn condition(&self, condition_type: TrialConditionType) -> Option<&TrialCondition> {
        self.status
            .conditions
            .iter()
            .find(|c| c.condition_type == condition_type)
    }

    /// Returns `(matches, exists)` for the condition type and status
    pub fn check_condition(
        &self,
        condition_type: TrialConditionType,
        status: ConditionStatus,
    ) -> (bool, bool) {
        self.condition(condition_type)
            .map_or((false, false), |c| (c.status == status, true))
    }

    pub fn is_condition_true(&self, condition_type: TrialConditionType) -> bool {
        self.check_condition(condition_type, ConditionStatus::True).0
    }

    /// Records a condition, preserving the transition time when the status is unchanged
    pub fn apply_condition(
        &mut self,
        condition_type: TrialConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) {
        if let Some(c) = self
            .status
            .conditions
            .iter_mut()
            .find(|c| c.condition_type == condition_type)
        {
            if c.status != status {
                c.status = status;
                c.reason = reason.to_string();
                c.message = message.to_string();
                c.last_transition_time = now;
            } else if c.reason != reason {
                c.reason = reason.to_string();
                c.message = message.to_string();
            }
            c.last_probe_time = now;
            return;
        }

        self.status.conditions.push(TrialCondition {
            condition_type,
            status,
            last_probe_time: now,
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
        });
    }

    /// Complete or Failed is true
    pub fn is_finished(&self) -> bool {
        self.is_condition_true(TrialConditionType::Complete)
            || self.is_condition_true(TrialConditionType::Failed)
    }

    pub fn is_failed(&self) -> bool {
        self.is_condition_true(TrialConditionType::Failed)
    }

    /// Deleted before it finished
    pub fn is_abandoned(&self) -> bool {
        !self.is_finished() && self.metadata.is_deleted()
    }

    /// Still occupying its namespace: unfinished, or finished with teardown pending
    pub fn is_active(&self) -> bool {
        if !self.is_finished() {
            return true;
        }
        let (done, exists) =
            self.check_condition(TrialConditionType::SetupDeleted, ConditionStatus::True);
        exists && !done
    }

    /// Latest transition time among the terminal conditions that are true
    pub fn finish_time(&self) -> Option<DateTime<Utc>> {
        self.status
            .conditions
            .iter()
            .filter(|c| {
                c.status == ConditionStatus::True
                    && matches!(
                        c.condition_type,
                        TrialConditionType::Complete
                            | TrialConditionType::Failed
                            | TrialConditionType::SetupDeleted
                    )
            })
            .map(|c| c.last_transition_time)
            .max()
    }

    /// Whether the trial has outlived its TTL
    pub fn needs_cleanup(&self, now: DateTime<Utc>) -> bool {
        if !self.is_finished() || self.is_active() {
            return false;
        }
        let ttl = if self.is_failed() {
            self.spec
                .ttl_seconds_after_failure
                .or(self.spec.ttl_seconds_after_finished)
        } else {
            self.spec.ttl_seconds_after_finished
        };
        match (ttl, self.finish_time()) {
            (Some(ttl), Some(finished)) => finished + Duration::seconds(ttl) <= now,
            _ => false,
        }
    }

    /// Whether external initializers are still pending
    pub fn has_initializer(&self) -> bool {
        self.metadata
            .annotations
            .get(ANNOTATION_INITIALIZER)
            .is_some_and(|v| v.split(',').any(|s| !s.trim().is_empty()))
    }

    fn initializers(&self) -> Vec<String> {
        self.metadata
            .annotations
            .get(ANNOTATION_INITIALIZER)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_initializers(&mut self, initializers: &[String]) {
        if initializers.is_empty() {
            self.metadata.annotations.remove(ANNOTATION_INITIALIZER);
        } else {
            self.metadata
                .annotations
                .insert(ANNOTATION_INITIALIZER.to_string(), initializers.join(","));
        }
    }

    /// Adds a pending initializer, returning `true` if the metadata changed
    pub fn add_initializer(&mut self, initializer: &str) -> bool {
        let mut initializers = self.initializers();
        if initializers.iter().any(|i| i == initializer) {
            return false;
        }
        initializers.push(initializer.to_string());
        self.set_initializers(&initializers);
        true
    }

    /// Removes a pending initializer, returning `true` if the metadata changed
    pub fn remove_initializer(&mut self, initializer: &str) -> bool {
        let mut initializers = self.initializers();
        let before = initializers.len();
        initializers.retain(|i| i != initializer);
        if initializers.len() == before {
            return false;
        }
        self.set_initializers(&initializers);
        true
    }

    /// Remote trial name recorded when the assignment was obtained
    pub fn report_name(&self) -> Option<&str> {
        self.metadata
            .annotations
            .get(ANNOTATION_REPORT_TRIAL_URL)
            .map(String::as_str)
    }
}
