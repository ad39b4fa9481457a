//! Access rules implied by an experiment's patch targets

use serde::{Deserialize, Serialize};

use crate::domain::models::Experiment;

/// Permission rule in the shape of a cluster role rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub verbs: Vec<String>,

    #[serde(default)]
    pub api_groups: Vec<String>,

    #[serde(default)]
    pub resources: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_names: Vec<String>,
}

/// Guesses the plural resource name of a kind (`Deployment` -> `deployments`)
pub fn guess_resource(kind: &str) -> String {
    let singular = kind.to_lowercase();
    if singular.is_empty() {
        return singular;
    }
    if singular.ends_with('s') {
        format!("{singular}es")
    } else if let Some(stem) = singular.strip_suffix('y') {
        format!("{stem}ies")
    } else {
        format!("{singular}s")
    }
}

/// One `get`/`patch` rule per patch template with a target reference
pub fn patch_rules(experiment: &Experiment, include_names: bool) -> Vec<PolicyRule> {
    experiment
        .spec
        .patches
        .iter()
        .filter_map(|p| p.target_ref.as_ref())
        .map(|target| {
            let names = if include_names && !target.name.is_empty() && !target.name.contains("{{") {
                vec![target.name.clone()]
            } else {
                Vec::new()
            };
            PolicyRule {
                verbs: vec!["get".to_string(), "patch".to_string()],
                api_groups: vec![target.group().to_string()],
                resources: vec![guess_resource(&target.kind)],
                resource_names: names,
            }
        })
        .collect()
}

/// Folds `rule` into the first compatible rule, appending it otherwise
///
/// Rules are compatible when their verbs and API groups are identical and,
/// for rules restricted by name, their resources are identical too.
pub fn merge_rule(rules: &mut Vec<PolicyRule>, rule: PolicyRule) {
    let compatible = rules.iter_mut().find(|r| {
        r.verbs == rule.verbs
            && r.api_groups == rule.api_groups
            && (r.resource_names.is_empty() || r.resources == rule.resources)
    });

    let Some(existing) = compatible else {
        rules.push(rule);
        return;
    };
    for resource in rule.resources {
        if !existing.resources.contains(&resource) {
            existing.resources.push(resource);
        }
    }
    existing.resources.sort();
    for name in rule.resource_names {
        if !existing.resource_names.contains(&name) {
            existing.resource_names.push(name);
        }
    }
    existing.resource_names.sort();
}

/// Merged access rules needed to apply every patch of the experiment
pub fn experiment_rules(experiment: &Experiment, include_names: bool) -> Vec<PolicyRule> {
    let mut rules = Vec::new();
    for rule in patch_rules(experiment, include_names) {
        merge_rule(&mut rules, rule);
    }
    rules
}
