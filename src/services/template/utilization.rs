//! PromQL builders for common resource utilization metrics
//!
//! Each function takes the metric template data (for the trial namespace and
//! the `.Range` window) followed by extra label matchers, either variadic or
//! comma-delimited: `{{ cpuUtilization . "app=web" "tier!=db" }}`.

use std::sync::LazyLock;

use regex::Regex;

use super::value::Value;

static INVALID_LABEL_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("[^a-zA-Z0-9_]").expect("valid label pattern"));

static MATCHER_OPERATOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("=~|!=|!~|=").expect("valid operator pattern"));

const CPU_UTILIZATION: &str = r#"
scalar(
  round(
    (
      sum(
        sum(
          increase(container_cpu_usage_seconds_total{container="", image=""}[{{ .Range }}])
        ) by (pod)
        *
        on (pod) group_left
        max_over_time(kube_pod_labels{{ .MetricSelector }}[{{ .Range }}])
      )
      /
      sum(
        sum_over_time(kube_pod_container_resource_requests_cpu_cores[{{ .Range }}:1s])
        *
        on (pod) group_left
        max_over_time(kube_pod_labels{{ .MetricSelector }}[{{ .Range }}])
      )
    )
  * 100, 0.0001)
)"#;

const MEMORY_UTILIZATION: &str = r"
scalar(
  round(
    (
      avg(
        max(
          container_memory_max_usage_bytes
        ) by (pod)
        *
        on (pod) group_left
        max_over_time(kube_pod_labels{{ .MetricSelector }}[{{ .Range }}])
        /
        sum(
          kube_pod_container_resource_requests_memory_bytes
        ) by (pod)
      )
    )
  * 100, 0.0001)
)";

const CPU_REQUESTS: &str = r"
scalar(
  sum(
    avg_over_time(kube_pod_container_resource_requests_cpu_cores[{{ .Range }}])
    *
    on (pod) group_left
    max_over_time(kube_pod_labels{{ .MetricSelector }}[{{ .Range }}])
  )
)";

const MEMORY_REQUESTS: &str = r"
scalar(
  sum(
    avg_over_time(kube_pod_container_resource_requests_memory_bytes[{{ .Range }}])
    *
    on (pod) group_left
    max_over_time(kube_pod_labels{{ .MetricSelector }}[{{ .Range }}])
  )
)";

pub fn cpu_utilization(args: &[Value]) -> Result<Value, String> {
    render(args, CPU_UTILIZATION)
}

pub fn memory_utilization(args: &[Value]) -> Result<Value, String> {
    render(args, MEMORY_UTILIZATION)
}

pub fn cpu_requests(args: &[Value]) -> Result<Value, String> {
    render(args, CPU_REQUESTS)
}

pub fn memory_requests(args: &[Value]) -> Result<Value, String> {
    render(args, MEMORY_REQUESTS)
}

fn render(args: &[Value], query: &str) -> Result<Value, String> {
    let Some((data, extra)) = args.split_first() else {
        return Err("wrong number of args: want at least 1 got 0".to_string());
    };
    let namespace = data.field("Trial").field("Namespace");
    let range = data.field("Range");

    let mut matchers = vec![format!(
        "namespace=\"{}\"",
        namespace.as_str().unwrap_or_default()
    )];
    let joined = extra
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",");
    for matcher in joined.split(',').filter(|m| !m.is_empty()) {
        let (key, op, value) = split_label_matcher(matcher)?;
        matchers.push(format!("{key}{op}{value}"));
    }

    let selector = format!("{{{}}}", matchers.join(","));
    Ok(Value::Str(
        query
            .replace("{{ .MetricSelector }}", &selector)
            .replace("{{ .Range }}", range.as_str().unwrap_or_default()),
    ))
}

/// Splits `key<op>value`, quoting the value and normalizing the key to a `label_` name
fn split_label_matcher(matcher: &str) -> Result<(String, &str, String), String> {
    let found = MATCHER_OPERATOR
        .find(matcher)
        .ok_or_else(|| format!("invalid label matcher: {matcher}"))?;

    let key = matcher[..found.start()].trim();
    let mut value = matcher[found.end()..].trim().to_string();
    if !value.starts_with('"') {
        value = format!("{value:?}");
    }

    let key = if key.starts_with("label_") {
        key.to_string()
    } else {
        format!("label_{key}")
    };
    let key = INVALID_LABEL_CHARS.replace_all(&key, "_").into_owned();
    Ok((key, found.as_str(), value))
}
