//! JSON document capture

use reqwest::header::ACCEPT;
use reqwest::{Client, StatusCode};
use serde_json::Value;

use super::Attempt;
use crate::domain::error::CaptureError;
use crate::services::jsonpath::JsonPath;

/// Fetches a JSON document and extracts the single value selected by `query`
pub(crate) async fn capture_one(client: &Client, address: &str, query: &str) -> Result<(f64, f64), Attempt> {
    let failed = |message: String| {
        Attempt::Failed(CaptureError::new(message).with_address(address).with_query(query, None))
    };

    let response = client
        .get(address)
        .header(ACCEPT, "application/json")
        .send()
        .await
        .map_err(|e| Attempt::Unreachable(CaptureError::new(e.to_string()).with_address(address)))?;

    let status = response.status();
    if status != StatusCode::OK {
        return Err(failed(format!("unexpected response status {status}")));
    }

    let document: Value = response
        .json()
        .await
        .map_err(|e| failed(format!("unable to decode JSON document: {e}")))?;

    extract(&document, query).map(|v| (v, 0.0)).map_err(failed)
}

/// Evaluates the query, which must select exactly one numeric (or numeric string) value
pub fn extract(document: &Value, query: &str) -> Result<f64, String> {
    let path = JsonPath::parse(query).map_err(|e| e.to_string())?;
    let results = path.find_results(document).map_err(|e| e.to_string())?;

    match results.as_slice() {
        [matches] if matches.len() == 1 => match &matches[0] {
            Value::Number(n) => n
                .as_f64()
                .ok_or_else(|| "could not convert match to a floating point number".to_string()),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|e| format!("could not convert match to a floating point number: {e}")),
            _ => Err("could not convert match to a floating point number".to_string()),
        },
        _ => Err(format!("query '{query}' did not match")),
    }
}
