use serde::{Deserialize, Serialize};

use super::meta::{ObjectMeta, ObjectReference, Resource};
use super::selector::LabelSelector;
use super::trial::{AssignmentValue, TrialSpec};

/// Finalizer guarding experiment deletion until the suggestion service is informed
pub const EXPERIMENT_FINALIZER: &str = "finalizer.optimize.dev/server";

/// Annotation naming the experiment on the suggestion service
pub const ANNOTATION_EXPERIMENT_URL: &str = "optimize.dev/experiment-url";

/// A parameter search experiment
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: ExperimentSpec,

    #[serde(default)]
    pub status: ExperimentStatus,
}

impl Resource for Experiment {
    const API_VERSION: &'static str = "optimize.dev/v1";
    const KIND: &'static str = "Experiment";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentSpec {
    /// Number of trials that may run concurrently, zero pauses the experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Upper bound on concurrently active trials, defaults to `replicas`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<i32>,

    /// Ceiling on trials created after burn-in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget: Option<i32>,

    /// Leading trials that do not count against the budget
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burn_in: Option<i32>,

    #[serde(default)]
    pub parameters: Vec<Parameter>,

    #[serde(default)]
    pub metrics: Vec<Metric>,

    #[serde(default)]
    pub patches: Vec<PatchTemplate>,

    /// Namespaces eligible to host trials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    /// Selector identifying trials that belong to this experiment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(default)]
    pub trial_template: TrialTemplateSpec,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub phase: String,

    #[serde(default)]
    pub active_trials: i32,

    /// Trials ever created for this experiment
    #[serde(default)]
    pub trials_created: i32,

    /// Namespaces occupied by active trials as of the last claim
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces_in_use: Vec<String>,

    /// Why the experiment is not running, when it has failed
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Defaults stamped onto every generated trial
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: TrialSpec,
}

/// One dimension of the search space
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<AssignmentValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<AssignmentValue>,

    /// Enumerated domain, mutually exclusive with numeric bounds
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub baseline: Option<AssignmentValue>,
}

impl Parameter {
    /// Integer bounds
    pub fn int_range(name: impl Into<String>, min: i64, max: i64) -> Self {
        Self {
            name: name.into(),
            min: Some(AssignmentValue::Int(min)),
            max: Some(AssignmentValue::Int(max)),
            ..Default::default()
        }
    }

    /// Enumerated string domain
    pub fn categorical(name: impl Into<String>, values: &[&str]) -> Self {
        Self {
            name: name.into(),
            values: values.iter().map(|v| (*v).to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn is_categorical(&self) -> bool {
        !self.values.is_empty()
    }
}

/// Where a metric value comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    #[default]
    #[serde(alias = "", alias = "kubernetes")]
    Local,
    Prometheus,
    #[serde(rename = "jsonpath")]
    JsonPath,
}

impl MetricType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Prometheus => "prometheus",
            Self::JsonPath => "jsonpath",
        }
    }
}

/// Numeric or named port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PortRef {
    Number(u16),
    Name(String),
}

impl std::fmt::Display for PortRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// An observable outcome of a trial
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub name: String,

    #[serde(default)]
    pub minimize: bool,

    /// `Some(false)` keeps the metric as an observation outside the objective
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimize: Option<bool>,

    #[serde(rename = "type", default)]
    pub metric_type: MetricType,

    pub query: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_query: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scheme: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<PortRef>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// Explicit endpoint, bypasses service discovery when it names a host
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
}

impl Metric {
    pub fn local(name: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            query: query.into(),
            ..Default::default()
        }
    }

    /// Whether the metric participates in the optimization objective
    pub fn is_optimized(&self) -> bool {
        self.optimize.unwrap_or(true)
    }
}

/// Patch semantics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchType {
    #[default]
    #[serde(alias = "")]
    Strategic,
    Merge,
    Json,
}

impl PatchType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Strategic => "strategic",
            Self::Merge => "merge",
            Self::Json => "json",
        }
    }
}

/// Templated mutation applied to a target object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchTemplate {
    #[serde(rename = "type", default)]
    pub patch_type: PatchType,

    pub patch: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ref: Option<ObjectReference>,
}

impl Experiment {
    /// Experiments without an explicit replica count run one trial at a time
    pub fn replicas(&self) -> i32 {
        self.spec.replicas.unwrap_or(1).max(0)
    }

    /// Concurrent trial ceiling
    pub fn concurrency_limit(&self) -> i32 {
        let replicas = self.replicas();
        self.spec
            .parallelism
            .map_or(replicas, |p| p.max(0).min(replicas))
    }

    /// Whether another trial may be created given the trials already created
    pub fn within_budget(&self) -> bool {
        let Some(budget) = self.spec.budget else {
            return true;
        };
        let burn_in = self.spec.burn_in.unwrap_or(0).max(0);
        (self.status.trials_created - burn_in).max(0) < budget
    }

    pub fn metric(&self, name: &str) -> Option<&Metric> {
        self.spec.metrics.iter().find(|m| m.name == name)
    }

    /// Name of the experiment on the suggestion service
    pub fn server_name(&self) -> &str {
        self.metadata
            .annotations
            .get(ANNOTATION_EXPERIMENT_URL)
            .map_or(self.metadata.name.as_str(), String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_limit_defaults_to_replicas() {
        let mut exp = Experiment::default();
        assert_eq!(exp.concurrency_limit(), 1);

        exp.spec.replicas = Some(4);
        assert_eq!(exp.concurrency_limit(), 4);

        exp.spec.parallelism = Some(2);
        assert_eq!(exp.concurrency_limit(), 2);

        exp.spec.parallelism = Some(10);
        assert_eq!(exp.concurrency_limit(), 4);

        exp.spec.replicas = Some(0);
        assert_eq!(exp.concurrency_limit(), 0);
    }

    #[test]
    fn test_budget_excludes_burn_in() {
        let mut exp = Experiment::default();
        exp.spec.budget = Some(2);
        exp.spec.burn_in = Some(1);

        exp.status.trials_created = 2;
        assert!(exp.within_budget());

        exp.status.trials_created = 3;
        assert!(!exp.within_budget());
    }

    #[test]
    fn test_metric_type_aliases() {
        let m: Metric = serde_json::from_value(serde_json::json!({
            "name": "cost", "type": "", "query": "1"
        }))
        .unwrap();
        assert_eq!(m.metric_type, MetricType::Local);

        let m: Metric = serde_json::from_value(serde_json::json!({
            "name": "cost", "type": "jsonpath", "query": "{.x}"
        }))
        .unwrap();
        assert_eq!(m.metric_type, MetricType::JsonPath);
    }

    #[test]
    fn test_patch_type_defaults_to_strategic() {
        let p: PatchTemplate = serde_json::from_value(serde_json::json!({"patch": "{}"})).unwrap();
        assert_eq!(p.patch_type, PatchType::Strategic);
    }
}
