use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while parsing a selector string
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SelectorError {
    #[error("invalid label selector requirement: {0}")]
    InvalidRequirement(String),

    #[error("unterminated value set in selector: {0}")]
    UnterminatedSet(String),
}

/// Set-based selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectorOperator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelectorRequirement {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl LabelSelectorRequirement {
    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => labels
                .get(&self.key)
                .is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => labels.contains_key(&self.key),
            SelectorOperator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// Label query over a set of objects
///
/// An empty selector matches everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<LabelSelectorRequirement>,
}

impl LabelSelector {
    /// Selector requiring exact matches on every supplied label
    pub fn from_labels<K: Into<String>, V: Into<String>>(
        labels: impl IntoIterator<Item = (K, V)>,
    ) -> Self {
        Self {
            match_labels: labels
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.match_labels.is_empty() && self.match_expressions.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    /// Parses the textual selector form, e.g. `app=web,tier!=db,env in (a,b),!legacy`
    pub fn parse(text: &str) -> Result<Self, SelectorError> {
        let mut selector = Self::default();
        for term in split_terms(text)? {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            selector.push_term(term)?;
        }
        Ok(selector)
    }

    fn push_term(&mut self, term: &str) -> Result<(), SelectorError> {
        let invalid = || SelectorError::InvalidRequirement(term.to_string());

        if let Some(key) = term.strip_prefix('!') {
            self.match_expressions.push(LabelSelectorRequirement {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                operator: SelectorOperator::DoesNotExist,
                values: Vec::new(),
            });
            return Ok(());
        }

        if let Some((key, value)) = term.split_once("!=") {
            self.match_expressions.push(LabelSelectorRequirement {
                key: valid_key(key.trim()).ok_or_else(invalid)?,
                operator: SelectorOperator::NotIn,
                values: vec![value.trim().to_string()],
            });
            return Ok(());
        }

        if let Some((key, value)) = term.split_once("==").or_else(|| term.split_once('=')) {
            let key = valid_key(key.trim()).ok_or_else(invalid)?;
            self.match_labels.insert(key, value.trim().to_string());
            return Ok(());
        }

        for (keyword, operator) in [(" notin ", SelectorOperator::NotIn), (" in ", SelectorOperator::In)] {
            if let Some((key, set)) = term.split_once(keyword) {
                let set = set
                    .trim()
                    .strip_prefix('(')
                    .and_then(|s| s.strip_suffix(')'))
                    .ok_or_else(invalid)?;
                self.match_expressions.push(LabelSelectorRequirement {
                    key: valid_key(key.trim()).ok_or_else(invalid)?,
                    operator,
                    values: set
                        .split(',')
                        .map(str::trim)
                        .filter(|v| !v.is_empty())
                        .map(String::from)
                        .collect(),
                });
                return Ok(());
            }
        }

        self.match_expressions.push(LabelSelectorRequirement {
            key: valid_key(term).ok_or_else(invalid)?,
            operator: SelectorOperator::Exists,
            values: Vec::new(),
        });
        Ok(())
    }
}

impl std::fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut terms: Vec<String> = self
            .match_labels
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        for r in &self.match_expressions {
            terms.push(match r.operator {
                SelectorOperator::In => format!("{} in ({})", r.key, r.values.join(",")),
                SelectorOperator::NotIn => format!("{} notin ({})", r.key, r.values.join(",")),
                SelectorOperator::Exists => r.key.clone(),
                SelectorOperator::DoesNotExist => format!("!{}", r.key),
            });
        }
        f.write_str(&terms.join(","))
    }
}

fn valid_key(key: &str) -> Option<String> {
    let ok = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'));
    ok.then(|| key.to_string())
}

/// Splits on commas that are not inside a parenthesized value set
fn split_terms(text: &str) -> Result<Vec<&str>, SelectorError> {
    let mut terms = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                terms.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(SelectorError::UnterminatedSet(text.to_string()));
    }
    terms.push(&text[start..]);
    Ok(terms)
}
