//! Endpoint resolution for remote metrics

use reqwest::Url;
use serde_json::Value;

use crate::domain::error::CaptureError;
use crate::domain::models::{Metric, PortRef};

/// Scheme of the metric, lower cased and defaulted to `http`
pub fn scheme(metric: &Metric) -> Result<String, CaptureError> {
    let scheme = metric.scheme.to_lowercase();
    match scheme.as_str() {
        "" => Ok("http".to_string()),
        "http" | "https" => Ok(scheme),
        other => Err(CaptureError::new(format!("scheme must be 'http' or 'https': {other}"))),
    }
}

/// Explicit endpoint named by the metric, if its URL carries a host
pub fn explicit_url(metric: &Metric) -> Option<Url> {
    if metric.url.is_empty() {
        return None;
    }
    Url::parse(&metric.url)
        .ok()
        .filter(|u| u.host_str().is_some_and(|h| !h.is_empty()))
}

/// Resolves one endpoint URL per matching service
///
/// `target` must be a service list. Each service is addressed by its cluster
/// IP; the port is the metric's numeric port, the service port with the
/// metric's port name, or the only port the service declares.
pub fn endpoints(metric: &Metric, target: Option<&Value>) -> Result<Vec<String>, CaptureError> {
    if let Some(url) = explicit_url(metric) {
        scheme(metric)?;
        return Ok(vec![url.to_string()]);
    }

    let services = target
        .filter(|t| t.get("kind").and_then(Value::as_str) == Some("ServiceList"))
        .ok_or_else(|| CaptureError::new("expected service list"))?;

    let scheme = scheme(metric)?;
    let path = format!("/{}", metric.path.trim_start_matches('/'));

    let mut urls = Vec::new();
    let items = services.get("items").and_then(Value::as_array).into_iter().flatten();
    for service in items {
        let host = service
            .pointer("/spec/clusterIP")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if host.is_empty() || host == "None" {
            continue;
        }

        let port = resolve_port(metric, service).ok_or_else(|| {
            CaptureError::new(format!(
                "metric '{}' has unresolvable port: {}",
                metric.name,
                metric.port.as_ref().map(ToString::to_string).unwrap_or_default()
            ))
        })?;
        urls.push(format!("{scheme}://{host}:{port}{path}"));
    }

    if urls.is_empty() {
        return Err(CaptureError::new(format!(
            "unable to find metric targets for '{}'",
            metric.name
        )));
    }
    Ok(urls)
}

fn resolve_port(metric: &Metric, service: &Value) -> Option<u64> {
    if let Some(PortRef::Number(n)) = metric.port {
        if n > 0 {
            return Some(u64::from(n));
        }
    }
    let name = match &metric.port {
        Some(PortRef::Name(name)) => name.as_str(),
        _ => "",
    };
    let ports = service.pointer("/spec/ports").and_then(Value::as_array)?;
    ports
        .iter()
        .find(|p| ports.len() == 1 || p.get("name").and_then(Value::as_str) == Some(name))
        .and_then(|p| p.get("port"))
        .and_then(Value::as_u64)
        .filter(|p| *p > 0)
}
