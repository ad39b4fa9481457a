//! Go-template compatible rendering of patch and metric templates
//!
//! Templates are evaluated against a trial view:
//!
//! - `.Trial` holds `Name`, `Namespace`, `GenerateName`, `Labels` and `Annotations`
//! - `.Values` holds the assignments by parameter name
//! - `.StartTime`, `.CompletionTime` and `.Range` (metrics only) describe the run window
//! - `.Target` (metrics only) is the object fetched for the metric, also bound
//!   as `.Pods` when it is a pod list

pub mod exec;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod utilization;
pub mod value;

use crate::domain::error::{PatchError, TemplateError};
use crate::domain::models::{AssignmentValue, Metric, PatchTemplate, Trial};

pub use functions::FuncMap;
pub use value::Value;

/// Renders templates with the trial function library
#[derive(Debug, Clone)]
pub struct TemplateEngine {
    funcs: FuncMap,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateEngine {
    pub fn new() -> Self {
        Self {
            funcs: FuncMap::standard(),
        }
    }

    /// Parses and executes `text` against `data`
    pub fn render(&self, name: &str, text: &str, data: &Value) -> Result<String, TemplateError> {
        let nodes = parser::parse(text, &|f| self.funcs.contains(f)).map_err(|message| {
            TemplateError::Parse {
                name: name.to_string(),
                message,
            }
        })?;
        exec::execute(&nodes, data, &self.funcs).map_err(|message| TemplateError::Exec {
            name: name.to_string(),
            message,
        })
    }

    /// Renders a patch template and converts the (YAML or JSON) result to JSON
    pub fn render_patch(&self, patch: &PatchTemplate, trial: &Trial) -> Result<String, PatchError> {
        let rendered = self.render("patch", &patch.patch, &patch_data(trial))?;
        let document: serde_json::Value = if rendered.trim().is_empty() {
            serde_json::Value::Null
        } else {
            serde_yaml::from_str(&rendered).map_err(|e| PatchError::Decode(e.to_string()))?
        };
        serde_json::to_string(&document).map_err(|e| PatchError::Decode(e.to_string()))
    }

    /// Renders a value (such as a target reference field) against the patch data
    pub fn render_patch_value(&self, name: &str, text: &str, trial: &Trial) -> Result<String, TemplateError> {
        if !text.contains("{{") {
            return Ok(text.to_string());
        }
        self.render(name, text, &patch_data(trial))
    }

    /// Returns the rendered metric query and error query
    pub fn render_metric_queries(
        &self,
        metric: &Metric,
        trial: &Trial,
        target: Option<&serde_json::Value>,
    ) -> Result<(String, String), TemplateError> {
        let data = metric_data(trial, target);
        let query = self.render(&metric.name, &metric.query, &data)?;
        let error_query = self.render(&metric.name, &metric.error_query, &data)?;
        Ok((query, error_query))
    }
}

fn trial_meta(trial: &Trial) -> Value {
    let strings = |map: &std::collections::BTreeMap<String, String>| {
        Value::map(map.iter().map(|(k, v)| (k.clone(), Value::from(v.as_str()))))
    };
    Value::map([
        ("Name", Value::from(trial.metadata.name.as_str())),
        ("Namespace", Value::from(trial.metadata.namespace.as_str())),
        ("GenerateName", Value::from(trial.metadata.generate_name.as_str())),
        ("Labels", strings(&trial.metadata.labels)),
        ("Annotations", strings(&trial.metadata.annotations)),
    ])
}

fn assignment_values(trial: &Trial) -> Value {
    Value::map(trial.spec.assignments.iter().map(|a| {
        let value = match &a.value {
            AssignmentValue::Int(i) => Value::Int(*i),
            AssignmentValue::Double(d) => Value::Float(*d),
            AssignmentValue::String(s) => Value::from(s.as_str()),
        };
        (a.name.clone(), value)
    }))
}

/// Template data for patch evaluation
pub fn patch_data(trial: &Trial) -> Value {
    Value::map([("Trial", trial_meta(trial)), ("Values", assignment_values(trial))])
}

/// Template data for metric evaluation
pub fn metric_data(trial: &Trial, target: Option<&serde_json::Value>) -> Value {
    let start = trial.status.start_time;
    let completion = trial.status.completion_time;
    let seconds = match (start, completion) {
        (Some(s), Some(c)) => (c - s).num_seconds().max(0),
        _ => 0,
    };

    let target = target.map_or(Value::Nil, Value::from_json);
    let pods = match &target {
        Value::Map(map) if map.get("kind") == Some(&Value::from("PodList")) => target.clone(),
        _ => Value::Nil,
    };

    Value::map([
        ("Trial", trial_meta(trial)),
        ("Values", assignment_values(trial)),
        ("StartTime", start.map_or(Value::Nil, Value::Time)),
        ("CompletionTime", completion.map_or(Value::Nil, Value::Time)),
        ("Range", Value::from(format!("{seconds}s"))),
        ("Target", target),
        ("Pods", pods),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Assignment, ObjectMeta, PatchType};
    use chrono::{TimeZone, Utc};

    fn trial() -> Trial {
        let mut trial = Trial {
            metadata: ObjectMeta::named("default", "web-001"),
            ..Default::default()
        };
        trial.spec.assignments = vec![Assignment::new("cpu", 500), Assignment::new("ratio", 0.5)];
        trial
    }

    #[test]
    fn test_render_patch_percent() {
        let engine = TemplateEngine::new();
        let patch = PatchTemplate {
            patch_type: PatchType::Strategic,
            patch: "spec:\n  template:\n    spec:\n      containers:\n      - name: app\n        resources:\n          requests:\n            cpu: \"{{ percent .Values.cpu 80 }}m\"\n".to_string(),
            target_ref: None,
        };
        let json = engine.render_patch(&patch, &trial()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(
            value["spec"]["template"]["spec"]["containers"][0]["resources"]["requests"]["cpu"],
            "400m"
        );
    }

    #[test]
    fn test_empty_patch_renders_null() {
        let engine = TemplateEngine::new();
        let patch = PatchTemplate {
            patch: "{{ if eq .Values.cpu 1 }}a: b{{ end }}".to_string(),
            ..Default::default()
        };
        assert_eq!(engine.render_patch(&patch, &trial()).unwrap(), "null");
    }

    #[test]
    fn test_metric_duration_and_range() {
        let engine = TemplateEngine::new();
        let mut trial = trial();
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        trial.status.start_time = Some(start);
        trial.status.completion_time = Some(start + chrono::Duration::seconds(30));

        let mut metric = Metric::local("duration", "{{ duration .StartTime .CompletionTime }}");
        metric.error_query = "{{ .Range }}".to_string();
        let (query, error_query) = engine.render_metric_queries(&metric, &trial, None).unwrap();
        assert_eq!(query, "30");
        assert_eq!(error_query, "30s");
    }

    #[test]
    fn test_environment_access_is_rejected() {
        let engine = TemplateEngine::new();
        let err = engine
            .render("patch", "{{ env \"HOME\" }}", &patch_data(&trial()))
            .unwrap_err();
        assert!(matches!(err, TemplateError::Parse { .. }));
        assert!(err.to_string().contains("function \"env\" not defined"));
    }

    #[test]
    fn test_pods_bound_for_pod_lists() {
        let pods = serde_json::json!({"kind": "PodList", "items": [
            {"spec": {"containers": [{"resources": {"requests": {"cpu": "250m"}}}]}}
        ]});
        let engine = TemplateEngine::new();
        let metric = Metric::local("cost", "{{ resources .Pods \"cpu=4\" }}");
        let (query, _) = engine.render_metric_queries(&metric, &trial(), Some(&pods)).unwrap();
        assert_eq!(query, "1000");
    }
}
