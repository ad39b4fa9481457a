use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Main configuration structure for the controller
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Reconciliation loop settings
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Trial execution defaults
    #[serde(default)]
    pub trial: TrialConfig,

    /// Metric backend settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Suggestion service client settings
    #[serde(default)]
    pub suggestion: SuggestionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ControllerConfig {
    /// Maximum number of concurrent reconciliations
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Interval at which every object is re-queued
    #[serde(default = "default_resync_interval_secs")]
    pub resync_interval_secs: u64,

    /// Trials an experiment may create per second
    #[serde(default = "default_trial_creation_rate")]
    pub trial_creation_per_second: u32,

    /// Wall-clock bound on waiting for a patched target to settle
    #[serde(default = "default_stabilization_timeout_secs")]
    pub stabilization_timeout_secs: u64,

    /// Lower clamp for suggestion-service retry hints
    #[serde(default = "default_min_requeue_secs")]
    pub min_requeue_secs: u64,

    /// Upper clamp for suggestion-service retry hints
    #[serde(default = "default_max_requeue_secs")]
    pub max_requeue_secs: u64,
}

const fn default_workers() -> usize {
    4
}

const fn default_resync_interval_secs() -> u64 {
    30
}

const fn default_trial_creation_rate() -> u32 {
    1
}

const fn default_stabilization_timeout_secs() -> u64 {
    600
}

const fn default_min_requeue_secs() -> u64 {
    5
}

const fn default_max_requeue_secs() -> u64 {
    120
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            resync_interval_secs: default_resync_interval_secs(),
            trial_creation_per_second: default_trial_creation_rate(),
            stabilization_timeout_secs: default_stabilization_timeout_secs(),
            min_requeue_secs: default_min_requeue_secs(),
            max_requeue_secs: default_max_requeue_secs(),
        }
    }
}

/// Which metrics decide between Complete and Failed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredMetrics {
    /// Only metrics participating in the objective
    #[default]
    Optimized,
    /// Every declared metric
    All,
}

/// Trial execution defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TrialConfig {
    #[serde(default = "default_attempts")]
    pub patch_attempts: u32,

    #[serde(default = "default_attempts")]
    pub metric_attempts: u32,

    #[serde(default = "default_attempts")]
    pub setup_attempts: u32,

    /// Runtime of the default workload when the job template has no containers
    #[serde(default = "default_approximate_runtime_secs")]
    pub approximate_runtime_secs: i64,

    /// Image used for setup task containers that do not name one
    #[serde(default = "default_setup_image")]
    pub setup_image: String,

    #[serde(default)]
    pub required_metrics: RequiredMetrics,
}

const fn default_attempts() -> u32 {
    3
}

const fn default_approximate_runtime_secs() -> i64 {
    120
}

fn default_setup_image() -> String {
    "setuptools:latest".to_string()
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            patch_attempts: default_attempts(),
            metric_attempts: default_attempts(),
            setup_attempts: default_attempts(),
            approximate_runtime_secs: default_approximate_runtime_secs(),
            setup_image: default_setup_image(),
            required_metrics: RequiredMetrics::default(),
        }
    }
}

/// Metric backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MetricsConfig {
    /// Timeout for a single metric backend request
    #[serde(default = "default_metrics_timeout_secs")]
    pub timeout_secs: u64,

    /// Delay suggested when a backend has not ingested the trial window yet
    #[serde(default = "default_not_ready_retry_secs")]
    pub not_ready_retry_secs: u64,
}

const fn default_metrics_timeout_secs() -> u64 {
    10
}

const fn default_not_ready_retry_secs() -> u64 {
    5
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_metrics_timeout_secs(),
            not_ready_retry_secs: default_not_ready_retry_secs(),
        }
    }
}

/// Suggestion service client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SuggestionConfig {
    /// Base URL of the suggestion API
    #[serde(default = "default_suggestion_url")]
    pub base_url: String,

    #[serde(default = "default_suggestion_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_suggestion_url() -> String {
    "http://localhost:8000/v1".to_string()
}

const fn default_suggestion_timeout_secs() -> u64 {
    30
}

impl Default for SuggestionConfig {
    fn default() -> Self {
        Self {
            base_url: default_suggestion_url(),
            timeout_secs: default_suggestion_timeout_secs(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_initial_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    10_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    #[default]
    Daily,
    Hourly,
    Never,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default)]
    pub format: LogFormat,

    /// Directory for log files (stdout only when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enable_stdout: bool,

    #[serde(default)]
    pub rotation: RotationPolicy,
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
            log_dir: None,
            enable_stdout: true,
            rotation: RotationPolicy::default(),
        }
    }
}
