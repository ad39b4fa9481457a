use std::path::Path;

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use thiserror::Error;

use crate::domain::models::config::Config;

/// Project-local configuration directory
pub const CONFIG_DIR: &str = ".experiment-controller";

/// Prefix of environment overrides, nested keys are separated by `__`
pub const ENV_PREFIX: &str = "EXPERIMENT_CONTROLLER_";

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid workers: {0}. Must be between 1 and 256")]
    InvalidWorkers(usize),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid {0}: must be at least 1")]
    ZeroAttempts(&'static str),

    #[error(
        "Invalid requeue bounds: min_requeue_secs ({0}) must not exceed max_requeue_secs ({1})"
    )]
    InvalidRequeueBounds(u64, u64),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be less than max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Suggestion service URL is invalid: {0}")]
    InvalidSuggestionUrl(String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .experiment-controller/config.yaml
    /// 3. .experiment-controller/local.yaml (optional overrides)
    /// 4. Environment variables (EXPERIMENT_CONTROLLER_* prefix)
    pub fn load() -> Result<Config> {
        Self::load_from_dir(".")
    }

    /// Same as [`ConfigLoader::load`] with the configuration directory under `root`
    pub fn load_from_dir(root: impl AsRef<Path>) -> Result<Config> {
        let dir = root.as_ref().join(CONFIG_DIR);
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(dir.join("config.yaml")))
            .merge(Yaml::file(dir.join("local.yaml")))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let controller = &config.controller;
        if controller.workers == 0 || controller.workers > 256 {
            return Err(ConfigError::InvalidWorkers(controller.workers));
        }
        if controller.resync_interval_secs == 0 {
            return Err(ConfigError::ValidationFailed(
                "resync_interval_secs must be positive".to_string(),
            ));
        }
        if controller.min_requeue_secs > controller.max_requeue_secs {
            return Err(ConfigError::InvalidRequeueBounds(
                controller.min_requeue_secs,
                controller.max_requeue_secs,
            ));
        }

        let trial = &config.trial;
        for (name, attempts) in [
            ("patch_attempts", trial.patch_attempts),
            ("metric_attempts", trial.metric_attempts),
            ("setup_attempts", trial.setup_attempts),
        ] {
            if attempts == 0 {
                return Err(ConfigError::ZeroAttempts(name));
            }
        }
        if trial.approximate_runtime_secs < 0 {
            return Err(ConfigError::ValidationFailed(format!(
                "approximate_runtime_secs cannot be negative ({})",
                trial.approximate_runtime_secs
            )));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let suggestion = &config.suggestion;
        if reqwest::Url::parse(&suggestion.base_url).is_err() {
            return Err(ConfigError::InvalidSuggestionUrl(suggestion.base_url.clone()));
        }
        if suggestion.retry.initial_backoff_ms >= suggestion.retry.max_backoff_ms {
            return Err(ConfigError::InvalidBackoff(
                suggestion.retry.initial_backoff_ms,
                suggestion.retry.max_backoff_ms,
            ));
        }

        Ok(())
    }
}
