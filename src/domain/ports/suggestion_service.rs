use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::models::trial::Assignment;
use crate::domain::ports::errors::SuggestionError;

/// Next assignment chosen by the suggestion service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    /// Remote name of the trial, used when reporting
    pub name: String,

    pub assignments: Vec<Assignment>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedValue {
    pub metric_name: String,
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<f64>,
}

/// Outcome of a finished trial
///
/// A failed trial carries no values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Observation {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<ObservedValue>,
    #[serde(default)]
    pub failed: bool,
}

impl Observation {
    pub fn failed() -> Self {
        Self {
            values: Vec::new(),
            failed: true,
        }
    }
}

/// Port for the external optimization service
#[async_trait]
pub trait SuggestionService: Send + Sync {
    /// Ask for the next assignment of an experiment
    async fn next_assignment(&self, experiment: &str) -> Result<Suggestion, SuggestionError>;

    /// Report the outcome of a trial
    async fn report_observation(
        &self,
        trial: &str,
        observation: &Observation,
    ) -> Result<(), SuggestionError>;

    /// Give up on a suggestion that will never be observed
    async fn abandon(&self, trial: &str) -> Result<(), SuggestionError>;
}
