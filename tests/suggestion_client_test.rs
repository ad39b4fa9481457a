//! HTTP suggestion client against a mock server

mod common;

use std::time::Duration;

use experiment_controller::domain::models::{AssignmentValue, RetryConfig, SuggestionConfig};
use experiment_controller::domain::ports::{Observation, ObservedValue, SuggestionError, SuggestionService};
use experiment_controller::HttpSuggestionClient;
use mockito::{Matcher, Server};
use serde_json::json;

fn client(base_url: String, max_retries: u32) -> HttpSuggestionClient {
    HttpSuggestionClient::new(&SuggestionConfig {
        base_url,
        timeout_secs: 5,
        retry: RetryConfig {
            max_retries,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    })
    .expect("Failed to create client")
}

#[tokio::test]
async fn test_next_assignment() {
    common::setup_test_logging();
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/experiments/web/trials")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "name": "trial-7",
                "assignments": [{"name": "cpu", "value": 500}, {"name": "gc", "value": "g1"}],
                "labels": {"round": "2"}
            })
            .to_string(),
        )
        .create_async()
        .await;

    let suggestion = client(format!("{}/v1", server.url()), 0)
        .next_assignment("web")
        .await
        .unwrap();

    assert_eq!(suggestion.name, "trial-7");
    assert_eq!(suggestion.assignments.len(), 2);
    assert_eq!(suggestion.assignments[0].value, AssignmentValue::from(500i64));
    assert_eq!(suggestion.labels.get("round").map(String::as_str), Some("2"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_unavailable_carries_retry_after() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/experiments/web/trials")
        .with_status(503)
        .with_header("retry-after", "30")
        .expect(1)
        .create_async()
        .await;

    let err = client(server.url(), 3).next_assignment("web").await.unwrap_err();
    assert!(matches!(
        err,
        SuggestionError::Unavailable { retry_after } if retry_after == Duration::from_secs(30)
    ));
    // unavailable is an answer, not a transport failure
    mock.assert_async().await;
}

#[tokio::test]
async fn test_gone() {
    let mut server = Server::new_async().await;
    server
        .mock("POST", "/experiments/web/trials")
        .with_status(410)
        .create_async()
        .await;

    let err = client(server.url(), 0).next_assignment("web").await.unwrap_err();
    assert!(matches!(err, SuggestionError::Gone));
}

#[tokio::test]
async fn test_server_errors_are_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/trials/trial-7")
        .with_status(502)
        .with_body("bad gateway")
        .expect(3)
        .create_async()
        .await;

    let err = client(server.url(), 2).abandon("trial-7").await.unwrap_err();
    assert!(matches!(err, SuggestionError::Rejected { status: 502, ref message } if message == "bad gateway"));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_client_errors_are_not_retried() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("DELETE", "/trials/trial-7")
        .with_status(404)
        .expect(1)
        .create_async()
        .await;

    let err = client(server.url(), 2).abandon("trial-7").await.unwrap_err();
    assert!(matches!(err, SuggestionError::Rejected { status: 404, .. }));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_report_observation() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/trials/trial-7/observation")
        .match_body(Matcher::Json(json!({
            "values": [{"metricName": "latency", "value": 12.5, "error": 0.5}],
            "failed": false
        })))
        .with_status(204)
        .create_async()
        .await;

    let observation = Observation {
        values: vec![ObservedValue {
            metric_name: "latency".to_string(),
            value: 12.5,
            error: Some(0.5),
        }],
        failed: false,
    };
    client(server.url(), 0)
        .report_observation("trial-7", &observation)
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_report_failure() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/trials/trial-7/observation")
        .match_body(Matcher::Json(json!({"failed": true})))
        .with_status(200)
        .create_async()
        .await;

    client(server.url(), 0)
        .report_observation("trial-7", &Observation::failed())
        .await
        .unwrap();
    mock.assert_async().await;
}
