//! Trial placement and experiment status
//!
//! These functions decide where the next trial of an experiment runs and what
//! it looks like. They never talk to the store; the reconciler feeds them the
//! current trials and the candidate namespaces.

use std::collections::BTreeSet;

use crate::domain::models::{
    Assignment, AssignmentValue, Experiment, ObjectReference, Parameter, Resource, Trial,
    LABEL_EXPERIMENT,
};

pub const PHASE_CREATED: &str = "Created";
pub const PHASE_PAUSED: &str = "Paused";
pub const PHASE_NEVER_RUN: &str = "Never run";
pub const PHASE_IDLE: &str = "Idle";
pub const PHASE_RUNNING: &str = "Running";
pub const PHASE_COMPLETED: &str = "Completed";
pub const PHASE_FAILED: &str = "Failed";

/// Namespaces currently held by active trials
pub fn namespaces_in_use(trials: &[Trial]) -> BTreeSet<String> {
    trials
        .iter()
        .filter(|t| t.is_active())
        .map(|t| t.target_namespace().to_string())
        .collect()
}

/// Picks the namespace for the next trial, `None` when nothing is free
///
/// `namespaces` are the names matching the experiment's namespace selector;
/// they are only consulted when the experiment has one. Namespaces claimed in
/// the experiment status count as taken even before their trial shows up.
pub fn next_trial_namespace(experiment: &Experiment, trials: &[Trial], namespaces: &[String]) -> Option<String> {
    let active = trials.iter().filter(|t| t.is_active()).count();
    let desired = i64::from(experiment.replicas()) - i64::try_from(active).unwrap_or(i64::MAX);
    if desired <= 0 {
        return None;
    }

    let mut taken = namespaces_in_use(trials);
    taken.extend(experiment.status.namespaces_in_use.iter().cloned());
    let free = |ns: &str| (!taken.contains(ns)).then(|| ns.to_string());

    let template_namespace = &experiment.spec.trial_template.metadata.namespace;
    if !template_namespace.is_empty() {
        return free(template_namespace);
    }

    if experiment.spec.namespace_selector.is_none() {
        return free(&experiment.metadata.namespace);
    }

    namespaces.iter().find_map(|ns| free(ns))
}

/// Value of a parameter that can only take one value
pub fn parameter_constant(parameter: &Parameter) -> Option<AssignmentValue> {
    match (parameter.values.as_slice(), &parameter.min, &parameter.max) {
        ([only], _, _) => Some(AssignmentValue::String(only.clone())),
        ([], Some(min), Some(max)) if min == max => Some(max.clone()),
        _ => None,
    }
}

/// Builds a new trial from the experiment's template
///
/// The trial lives next to the experiment (or in the template namespace) and
/// targets `namespace` when the experiment spreads trials over namespaces.
pub fn populate_trial(experiment: &Experiment, namespace: &str, assignments: Vec<Assignment>) -> Trial {
    let template = &experiment.spec.trial_template;
    let mut trial = Trial {
        metadata: template.metadata.clone(),
        spec: template.spec.clone(),
        ..Default::default()
    };
    trial.metadata.resource_version.clear();
    trial.metadata.uid.clear();

    trial
        .metadata
        .labels
        .insert(LABEL_EXPERIMENT.to_string(), experiment.metadata.name.clone());
    trial.spec.experiment_ref = Some(ObjectReference::new(
        Experiment::API_VERSION,
        Experiment::KIND,
        experiment.metadata.namespace.clone(),
        experiment.metadata.name.clone(),
    ));

    if trial.metadata.name.is_empty() && trial.metadata.generate_name.is_empty() {
        trial.metadata.generate_name = format!("{}-", experiment.metadata.name);
    }
    if trial.metadata.namespace.is_empty() {
        trial.metadata.namespace = experiment.metadata.namespace.clone();
    }

    if experiment.replicas() > 1
        || experiment.spec.namespace_selector.is_some()
        || !template.metadata.namespace.is_empty()
    {
        trial.spec.target_namespace = namespace.to_string();
    }

    trial.spec.assignments = assignments;
    for parameter in &experiment.spec.parameters {
        if trial.spec.assignments.iter().any(|a| a.name == parameter.name) {
            continue;
        }
        if let Some(value) = parameter_constant(parameter) {
            trial.spec.assignments.push(Assignment {
                name: parameter.name.clone(),
                value,
            });
        }
    }
    trial
}

/// Human readable state of the experiment
pub fn summarize(experiment: &Experiment, trials: &[Trial]) -> &'static str {
    if experiment.replicas() == 0 {
        if experiment.status.phase == PHASE_COMPLETED || !experiment.within_budget() {
            return PHASE_COMPLETED;
        }
        return PHASE_PAUSED;
    }
    if trials.is_empty() {
        return if experiment.status.trials_created == 0 {
            PHASE_NEVER_RUN
        } else {
            PHASE_IDLE
        };
    }
    if trials.iter().any(Trial::is_active) {
        PHASE_RUNNING
    } else {
        PHASE_IDLE
    }
}

/// Recomputes the experiment status from its trials, returning true if anything changed
///
/// A `problem` with the experiment definition overrides the phase with
/// [`PHASE_FAILED`] and is kept as the status message.
pub fn update_status(experiment: &mut Experiment, trials: &[Trial], problem: Option<&str>) -> bool {
    let phase = if problem.is_some() {
        PHASE_FAILED
    } else {
        summarize(experiment, trials)
    };
    let message = problem.unwrap_or_default();
    let active = i32::try_from(trials.iter().filter(|t| t.is_active()).count()).unwrap_or(i32::MAX);
    let in_use: Vec<String> = namespaces_in_use(trials).into_iter().collect();

    let status = &mut experiment.status;
    let dirty = status.phase != phase
        || status.message != message
        || status.active_trials != active
        || status.namespaces_in_use != in_use;
    status.phase = phase.to_string();
    status.message = message.to_string();
    status.active_trials = active;
    status.namespaces_in_use = in_use;
    dirty
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{
        ConditionStatus, LabelSelector, ObjectMeta, TrialConditionType,
    };
    use chrono::Utc;
    use proptest::prelude::*;

    fn experiment(replicas: i32) -> Experiment {
        let mut exp = Experiment {
            metadata: ObjectMeta::named("default", "web"),
            ..Default::default()
        };
        exp.spec.replicas = Some(replicas);
        exp
    }

    fn trial_in(namespace: &str, finished: bool) -> Trial {
        let mut t = Trial {
            metadata: ObjectMeta::named("default", format!("web-{namespace}")),
            ..Default::default()
        };
        t.spec.target_namespace = namespace.to_string();
        if finished {
            t.apply_condition(TrialConditionType::Complete, ConditionStatus::True, "", "", Utc::now());
        }
        t
    }

    #[test]
    fn test_experiment_namespace_used_once() {
        let exp = experiment(1);
        assert_eq!(next_trial_namespace(&exp, &[], &[]), Some("default".to_string()));

        let trials = vec![trial_in("default", false)];
        assert_eq!(next_trial_namespace(&exp, &trials, &[]), None);

        let trials = vec![trial_in("default", true)];
        assert_eq!(next_trial_namespace(&exp, &trials, &[]), Some("default".to_string()));
    }

    #[test]
    fn test_selector_without_free_namespace() {
        let mut exp = experiment(2);
        exp.spec.namespace_selector = Some(LabelSelector::from_labels([("pool", "trials")]));

        let namespaces = vec!["a".to_string(), "b".to_string()];
        let trials = vec![trial_in("a", false)];
        assert_eq!(next_trial_namespace(&exp, &trials, &namespaces), Some("b".to_string()));

        exp.status.namespaces_in_use = vec!["b".to_string()];
        assert_eq!(next_trial_namespace(&exp, &trials, &namespaces), None);
        assert_eq!(next_trial_namespace(&exp, &trials, &[]), None);
    }

    #[test]
    fn test_populate_trial() {
        let mut exp = experiment(3);
        exp.spec.parameters = vec![
            Parameter::int_range("cpu", 100, 1000),
            Parameter::int_range("replicas", 2, 2),
            Parameter::categorical("gc", &["g1"]),
        ];

        let trial = populate_trial(&exp, "pool-1", vec![Assignment::new("cpu", 500)]);
        assert_eq!(trial.metadata.generate_name, "web-");
        assert_eq!(trial.metadata.namespace, "default");
        assert_eq!(trial.spec.target_namespace, "pool-1");
        assert_eq!(trial.metadata.labels.get(LABEL_EXPERIMENT).map(String::as_str), Some("web"));
        assert_eq!(trial.experiment_name(), "web");
        assert_eq!(
            trial.spec.assignments,
            vec![
                Assignment::new("cpu", 500),
                Assignment::new("replicas", 2),
                Assignment::new("gc", "g1"),
            ]
        );

        let single = populate_trial(&experiment(1), "default", Vec::new());
        assert!(single.spec.target_namespace.is_empty());
    }

    #[test]
    fn test_summary() {
        let mut exp = experiment(1);
        assert_eq!(summarize(&exp, &[]), PHASE_NEVER_RUN);
        assert_eq!(summarize(&exp, &[trial_in("default", false)]), PHASE_RUNNING);
        assert_eq!(summarize(&exp, &[trial_in("default", true)]), PHASE_IDLE);

        exp.spec.replicas = Some(0);
        assert_eq!(summarize(&exp, &[]), PHASE_PAUSED);

        exp.spec.budget = Some(1);
        exp.status.trials_created = 1;
        assert_eq!(summarize(&exp, &[]), PHASE_COMPLETED);
    }

    #[test]
    fn test_update_status_tracks_namespaces() {
        let mut exp = experiment(2);
        let trials = vec![trial_in("a", false), trial_in("b", true)];
        assert!(update_status(&mut exp, &trials, None));
        assert_eq!(exp.status.active_trials, 1);
        assert_eq!(exp.status.namespaces_in_use, vec!["a".to_string()]);
        assert!(!update_status(&mut exp, &trials, None));
    }

    #[test]
    fn test_problem_fails_the_experiment() {
        let mut exp = experiment(1);
        assert!(update_status(&mut exp, &[], Some("parameter cpu: min must not exceed max")));
        assert_eq!(exp.status.phase, PHASE_FAILED);
        assert_eq!(exp.status.message, "parameter cpu: min must not exceed max");
        assert!(!update_status(&mut exp, &[], Some("parameter cpu: min must not exceed max")));

        assert!(update_status(&mut exp, &[], None));
        assert_eq!(exp.status.phase, PHASE_NEVER_RUN);
        assert!(exp.status.message.is_empty());
    }

    proptest! {
        #[test]
        fn prop_chosen_namespace_is_never_active(
            replicas in 1i32..6,
            busy in proptest::collection::btree_set(0usize..6, 0..6),
        ) {
            let mut exp = experiment(replicas);
            exp.spec.namespace_selector = Some(LabelSelector::from_labels([("pool", "trials")]));
            let namespaces: Vec<String> = (0..6).map(|i| format!("ns-{i}")).collect();
            let trials: Vec<Trial> = busy.iter().map(|i| trial_in(&namespaces[*i], false)).collect();

            if let Some(ns) = next_trial_namespace(&exp, &trials, &namespaces) {
                prop_assert!(trials.iter().all(|t| t.target_namespace() != ns));
                prop_assert!(i32::try_from(trials.len()).unwrap() < replicas);
            }
        }
    }
}
