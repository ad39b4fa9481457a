//! Metric capture
//!
//! Metric queries are rendered against the trial and then evaluated by type:
//!
//! - `local`: the rendered query is the value
//! - `prometheus`: instant query against each resolved Prometheus endpoint
//! - `jsonpath`: JSONPath query against a fetched JSON document

pub mod jsonpath;
pub mod prometheus;
pub mod url;

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tracing::{instrument, warn};

use crate::domain::error::{CaptureError, MetricError};
use crate::domain::models::{MetricsConfig, Metric, MetricType, Trial};
use crate::domain::ports::{ListParams, ObjectStore, StoreError};
use crate::services::template::TemplateEngine;

/// Result of trying one endpoint
pub(crate) enum Attempt {
    /// The endpoint could not be reached, another one may work
    Unreachable(CaptureError),
    Failed(CaptureError),
}

impl Attempt {
    fn into_error(self) -> CaptureError {
        match self {
            Self::Unreachable(e) | Self::Failed(e) => e,
        }
    }
}

/// Captures metric values for trials
#[derive(Debug, Clone)]
pub struct MetricCapture {
    client: Client,
    engine: TemplateEngine,
    not_ready_retry: Duration,
}

impl MetricCapture {
    pub fn new(config: &MetricsConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self::with_client(
            client,
            TemplateEngine::new(),
            Duration::from_secs(config.not_ready_retry_secs),
        ))
    }

    pub fn with_client(client: Client, engine: TemplateEngine, not_ready_retry: Duration) -> Self {
        Self {
            client,
            engine,
            not_ready_retry,
        }
    }

    /// Returns the metric value and its error margin
    #[instrument(skip(self, trial, target), fields(metric = %metric.name, trial = %trial.metadata.name))]
    pub async fn capture(
        &self,
        metric: &Metric,
        trial: &Trial,
        target: Option<&Value>,
    ) -> Result<(f64, f64), MetricError> {
        let (query, error_query) = self.engine.render_metric_queries(metric, trial, target)?;

        let result = match metric.metric_type {
            MetricType::Local => query
                .trim()
                .parse::<f64>()
                .map(|v| (v, 0.0))
                .map_err(|e| CaptureError::new(format!("invalid metric value {query:?}: {e}"))),
            MetricType::Prometheus => self.capture_prometheus(metric, trial, target, &query, &error_query).await,
            MetricType::JsonPath => self.capture_jsonpath(metric, target, &query).await,
        };

        result.map_err(|e| {
            if !e.is_transient() {
                warn!(
                    address = %e.address,
                    query = %e.query,
                    completion_time = ?e.completion_time,
                    error = %e,
                    "Metric capture failed"
                );
            }
            MetricError::Capture(e)
        })
    }

    async fn capture_prometheus(
        &self,
        metric: &Metric,
        trial: &Trial,
        target: Option<&Value>,
        query: &str,
        error_query: &str,
    ) -> Result<(f64, f64), CaptureError> {
        let completion_time = trial
            .status
            .completion_time
            .ok_or_else(|| CaptureError::new("trial has not completed").with_query(query, None))?;

        let mut last = None;
        for address in url::endpoints(metric, target)? {
            match prometheus::capture_one(
                &self.client,
                &address,
                query,
                error_query,
                completion_time,
                self.not_ready_retry,
            )
            .await
            {
                Ok(value) => return Ok(value),
                Err(Attempt::Failed(e)) => return Err(e),
                Err(unreachable) => last = Some(unreachable.into_error()),
            }
        }
        Err(last.unwrap_or_else(|| CaptureError::new("no metric endpoints")))
    }

    async fn capture_jsonpath(
        &self,
        metric: &Metric,
        target: Option<&Value>,
        query: &str,
    ) -> Result<(f64, f64), CaptureError> {
        let mut last = None;
        for address in url::endpoints(metric, target)? {
            match jsonpath::capture_one(&self.client, &address, query).await {
                Ok(value) => return Ok(value),
                Err(Attempt::Failed(e)) => return Err(e),
                Err(unreachable) => last = Some(unreachable.into_error()),
            }
        }
        Err(last.unwrap_or_else(|| CaptureError::new("no metric endpoints")))
    }
}

/// Fetches the object a metric is evaluated against
///
/// Local metrics with a selector see the matching pods of the trial's target
/// namespace. Remote metrics see the matching services of every namespace,
/// unless the metric names an explicit endpoint.
pub async fn resolve_target(
    store: &dyn ObjectStore,
    trial: &Trial,
    metric: &Metric,
) -> Result<Option<Value>, StoreError> {
    match metric.metric_type {
        MetricType::Local => {
            let Some(selector) = &metric.selector else {
                return Ok(None);
            };
            let params = ListParams::in_namespace(trial.target_namespace()).with_selector(selector.clone());
            let pods = store.list("v1", "Pod", &params).await?;
            Ok(Some(json!({"apiVersion": "v1", "kind": "PodList", "items": pods})))
        }
        MetricType::Prometheus | MetricType::JsonPath => {
            if url::explicit_url(metric).is_some() {
                return Ok(None);
            }
            let params = ListParams {
                namespace: None,
                selector: metric.selector.clone(),
            };
            let services = store.list("v1", "Service", &params).await?;
            Ok(Some(json!({"apiVersion": "v1", "kind": "ServiceList", "items": services})))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Assignment, ObjectMeta};
    use chrono::{TimeZone, Utc};

    fn capture() -> MetricCapture {
        MetricCapture::with_client(Client::new(), TemplateEngine::new(), Duration::from_secs(5))
    }

    fn trial() -> Trial {
        let mut trial = Trial {
            metadata: ObjectMeta::named("default", "web-001"),
            ..Default::default()
        };
        trial.spec.assignments = vec![Assignment::new("cpu", 500)];
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        trial.status.start_time = Some(start);
        trial.status.completion_time = Some(start + chrono::Duration::seconds(30));
        trial
    }

    #[tokio::test]
    async fn test_local_duration_metric() {
        let metric = Metric::local("duration", "{{ duration .StartTime .CompletionTime }}");
        let (value, error) = capture().capture(&metric, &trial(), None).await.unwrap();
        assert!((value - 30.0).abs() < f64::EPSILON);
        assert!(error.abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_local_metric_must_be_numeric() {
        let metric = Metric::local("bad", "{{ .Trial.Name }}");
        let err = capture().capture(&metric, &trial(), None).await.unwrap_err();
        assert!(matches!(err, MetricError::Capture(_)));
    }

    #[tokio::test]
    async fn test_prometheus_without_services() {
        let mut metric = Metric::local("latency", "scalar(x)");
        metric.metric_type = MetricType::Prometheus;
        let target = json!({"kind": "ServiceList", "items": []});
        let err = capture().capture(&metric, &trial(), Some(&target)).await.unwrap_err();
        assert_eq!(err.to_string(), "unable to find metric targets for 'latency'");
    }
}
