//! HTTP client for the suggestion service
//!
//! Endpoints, relative to the configured base URL:
//! - `POST experiments/{experiment}/trials` returns the next [`Suggestion`]
//! - `POST trials/{trial}/observation` reports an [`Observation`]
//! - `DELETE trials/{trial}` abandons a suggestion
//!
//! `429` and `503` responses become [`SuggestionError::Unavailable`] using the
//! `Retry-After` header; `410` means the experiment no longer takes trials.
//! Transport failures and other server errors are retried with exponential
//! backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoffBuilder;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Method, Response, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::domain::models::{RetryConfig, SuggestionConfig};
use crate::domain::ports::{Observation, Suggestion, SuggestionError, SuggestionService};

/// Parses a `Retry-After` header given in seconds
fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub struct HttpSuggestionClient {
    http_client: Client,
    base_url: Url,
    retry: RetryConfig,
}

impl HttpSuggestionClient {
    pub fn new(config: &SuggestionConfig) -> Result<Self> {
        let mut base = config.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base).with_context(|| format!("Invalid suggestion URL: {base}"))?;

        let http_client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .pool_max_idle_per_host(4)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http_client,
            base_url,
            retry: config.retry.clone(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, SuggestionError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| SuggestionError::Transport(format!("cannot use {} as a base URL", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send_once<B: Serialize + Sync>(
        &self,
        method: Method,
        url: Url,
        body: Option<&B>,
    ) -> Result<Response, SuggestionError> {
        let mut request = self.http_client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| SuggestionError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let delay = retry_after(&response);
        let text = response.text().await.unwrap_or_default();
        Err(SuggestionError::from_status(status, delay, text))
    }

    /// Sends a request, retrying transient failures
    async fn send<B: Serialize + Sync>(
        &self,
        method: Method,
        segments: &[&str],
        body: Option<&B>,
    ) -> Result<Response, SuggestionError> {
        let url = self.endpoint(segments)?;
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.retry.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.retry.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        let attempts = AtomicU32::new(0);
        let (attempts, url, method) = (&attempts, &url, &method);
        backoff::future::retry(policy, move || async move {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            match self.send_once(method.clone(), url.clone(), body).await {
                Ok(response) => Ok(response),
                Err(e) if e.is_transient() && attempt < self.retry.max_retries => {
                    warn!(url = %url, attempt = attempt + 1, error = %e, "Suggestion request failed, retrying");
                    Err(backoff::Error::transient(e))
                }
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, SuggestionError> {
        response
            .json()
            .await
            .map_err(|e| SuggestionError::Decode(e.to_string()))
    }
}

#[async_trait]
impl SuggestionService for HttpSuggestionClient {
    #[instrument(skip(self))]
    async fn next_assignment(&self, experiment: &str) -> Result<Suggestion, SuggestionError> {
        let response = self
            .send::<()>(Method::POST, &["experiments", experiment, "trials"], None)
            .await?;
        let suggestion: Suggestion = Self::decode(response).await?;
        debug!(trial = %suggestion.name, "Received suggestion");
        Ok(suggestion)
    }

    #[instrument(skip(self, observation), fields(failed = observation.failed))]
    async fn report_observation(&self, trial: &str, observation: &Observation) -> Result<(), SuggestionError> {
        self.send(Method::POST, &["trials", trial, "observation"], Some(observation))
            .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn abandon(&self, trial: &str) -> Result<(), SuggestionError> {
        self.send::<()>(Method::DELETE, &["trials", trial], None).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_segments() {
        let client = HttpSuggestionClient::new(&SuggestionConfig {
            base_url: "http://localhost:8000/v1".to_string(),
            ..Default::default()
        })
        .unwrap();
        let url = client.endpoint(&["experiments", "web tuning", "trials"]).unwrap();
        assert_eq!(url.as_str(), "http://localhost:8000/v1/experiments/web%20tuning/trials");
    }

    #[test]
    fn test_rejects_bad_base_url() {
        let config = SuggestionConfig {
            base_url: "not a url".to_string(),
            ..Default::default()
        };
        assert!(HttpSuggestionClient::new(&config).is_err());
    }
}
