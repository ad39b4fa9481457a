//! Prometheus HTTP API capture

use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use super::Attempt;
use crate::domain::error::CaptureError;

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    status: String,
    data: Option<T>,
    #[serde(default, rename = "errorType")]
    error_type: String,
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct TargetsData {
    #[serde(default, rename = "activeTargets")]
    active_targets: Vec<ActiveTarget>,
}

#[derive(Debug, Deserialize)]
struct ActiveTarget {
    #[serde(default)]
    health: String,
    #[serde(default, rename = "lastScrape")]
    last_scrape: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(rename = "resultType")]
    result_type: String,
    result: Value,
}

/// Queries one Prometheus server for the value and optional error at `completion_time`
pub(crate) async fn capture_one(
    client: &Client,
    address: &str,
    query: &str,
    error_query: &str,
    completion_time: DateTime<Utc>,
    not_ready_retry: Duration,
) -> Result<(f64, f64), Attempt> {
    let query_time = check_ready(client, address, completion_time, not_ready_retry).await?;
    if query_time != completion_time {
        info!(address, %query_time, "Adjusted completion time for Prometheus query");
    }

    let value = query_value(client, address, query, query_time).await?;
    if value.is_nan() {
        let mut message = "metric data not available".to_string();
        if query.starts_with("scalar(") {
            message.push_str(" (the scalar function may have received an input vector whose size is not 1)");
        }
        return Err(Attempt::Failed(
            CaptureError::new(message)
                .with_address(address)
                .with_query(query, Some(completion_time)),
        ));
    }

    let mut error = 0.0;
    if !error_query.is_empty() {
        error = query_value(client, address, error_query, query_time).await?;
        if error.is_nan() {
            error = 0.0;
        }
    }
    Ok((value, error))
}

fn base(address: &str) -> &str {
    address.trim_end_matches('/')
}

async fn get<T: for<'de> Deserialize<'de>>(
    client: &Client,
    address: &str,
    endpoint: &str,
    params: &[(&str, String)],
) -> Result<T, Attempt> {
    let url = format!("{}{endpoint}", base(address));
    let response = client
        .get(&url)
        .query(params)
        .send()
        .await
        .map_err(|e| Attempt::Unreachable(CaptureError::new(e.to_string()).with_address(address)))?;

    let status = response.status();
    let body: ApiResponse<T> = response.json().await.map_err(|e| {
        Attempt::Failed(
            CaptureError::new(format!("unable to decode Prometheus response ({status}): {e}"))
                .with_address(address),
        )
    })?;
    if body.status != "success" {
        return Err(Attempt::Failed(
            CaptureError::new(format!("{}: {}", body.error_type, body.error)).with_address(address),
        ));
    }
    body.data.ok_or_else(|| {
        Attempt::Failed(CaptureError::new("Prometheus response is missing data").with_address(address))
    })
}

/// Waits for every healthy target to have been scraped after `completion_time`
///
/// Returns the time the query should be evaluated at: the newest scrape
/// time seen, which is never earlier than the completion time.
async fn check_ready(
    client: &Client,
    address: &str,
    completion_time: DateTime<Utc>,
    not_ready_retry: Duration,
) -> Result<DateTime<Utc>, Attempt> {
    let targets: TargetsData = get(client, address, "/api/v1/targets", &[]).await?;

    let mut query_time = completion_time;
    for target in targets.active_targets.iter().filter(|t| t.health == "up") {
        let Some(last_scrape) = target.last_scrape else {
            continue;
        };
        if last_scrape < completion_time {
            debug!(address, %last_scrape, "Prometheus has not scraped past the completion time");
            return Err(Attempt::Failed(
                CaptureError::retry_after(not_ready_retry)
                    .with_address(address)
                    .with_query("", Some(completion_time)),
            ));
        }
        query_time = query_time.max(last_scrape);
    }
    Ok(query_time)
}

#[allow(clippy::cast_precision_loss)]
fn unix_seconds(t: DateTime<Utc>) -> String {
    let seconds = t.timestamp() as f64 + f64::from(t.timestamp_subsec_millis()) / 1000.0;
    format!("{seconds:.3}")
}

async fn query_value(client: &Client, address: &str, query: &str, time: DateTime<Utc>) -> Result<f64, Attempt> {
    let data: QueryData = get(
        client,
        address,
        "/api/v1/query",
        &[("query", query.to_string()), ("time", unix_seconds(time))],
    )
    .await?;

    single_sample(&data.result_type, &data.result).map_err(|message| {
        Attempt::Failed(
            CaptureError::new(message)
                .with_address(address)
                .with_query(query, Some(time)),
        )
    })
}

/// Extracts the only sample of a query result
///
/// Scalars are accepted as is; vectors and matrices must hold exactly one
/// series with exactly one point.
pub fn single_sample(result_type: &str, result: &Value) -> Result<f64, String> {
    match result_type {
        "scalar" => sample_value(result),
        "vector" => {
            let series = one_series(result)?;
            sample_value(series.get("value").unwrap_or(&Value::Null))
        }
        "matrix" => {
            let series = one_series(result)?;
            match series.get("values").and_then(Value::as_array).map(Vec::as_slice) {
                Some([point]) => sample_value(point),
                Some(points) => Err(format!("expected one data point, got {}", points.len())),
                None => Err("expected one data point, got 0".to_string()),
            }
        }
        other => Err(format!("expected scalar query result, got {other}")),
    }
}

fn one_series(result: &Value) -> Result<&Value, String> {
    match result.as_array().map(Vec::as_slice) {
        Some([series]) => Ok(series),
        Some(series) => Err(format!("expected one series, got {}", series.len())),
        None => Err("expected one series, got 0".to_string()),
    }
}

fn sample_value(point: &Value) -> Result<f64, String> {
    let text = point
        .get(1)
        .and_then(Value::as_str)
        .ok_or_else(|| "malformed sample".to_string())?;
    text.parse::<f64>()
        .map_err(|e| format!("invalid sample value {text:?}: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_error_response_without_data() {
        let body = json!({"status": "error", "errorType": "bad_data", "error": "parse error"});
        let response: ApiResponse<TargetsData> = serde_json::from_value(body).unwrap();
        assert_eq!(response.status, "error");
        assert!(response.data.is_none());
        assert_eq!(response.error_type, "bad_data");
    }

    #[test]
    fn test_scalar_and_vector_samples() {
        assert_eq!(single_sample("scalar", &json!([1_700_000_000.0, "42.5"])), Ok(42.5));
        assert_eq!(
            single_sample("vector", &json!([{"metric": {}, "value": [1_700_000_000.0, "3"]}])),
            Ok(3.0)
        );
    }

    #[test]
    fn test_multiple_series_are_rejected() {
        let result = json!([
            {"metric": {"pod": "a"}, "value": [1.0, "1"]},
            {"metric": {"pod": "b"}, "value": [1.0, "2"]}
        ]);
        let err = single_sample("vector", &result).unwrap_err();
        assert!(err.starts_with("expected one series"));
    }

    #[test]
    fn test_matrix_requires_one_point() {
        let result = json!([{"metric": {}, "values": [[1.0, "1"], [2.0, "2"]]}]);
        assert!(single_sample("matrix", &result).unwrap_err().contains("one data point"));
        let result = json!([{"metric": {}, "values": [[1.0, "7"]]}]);
        assert_eq!(single_sample("matrix", &result), Ok(7.0));
    }

    #[test]
    fn test_nan_sample_parses() {
        assert!(single_sample("scalar", &json!([1.0, "NaN"])).unwrap().is_nan());
    }

    #[test]
    fn test_unix_seconds_format() {
        let t = Utc.timestamp_millis_opt(1_700_000_000_250).unwrap();
        assert_eq!(unix_seconds(t), "1700000000.250");
    }
}
