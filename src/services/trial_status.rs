//! Display summaries for trial status

use crate::domain::models::{ConditionStatus, Trial, TrialConditionType};

pub const CREATED: &str = "Created";
pub const SETTING_UP: &str = "Setting up";
pub const SETUP_CREATED: &str = "Setup Created";
pub const PATCHING: &str = "Patching";
pub const PATCHED: &str = "Patched";
pub const WAITING: &str = "Waiting";
pub const STABILIZED: &str = "Stabilized";
pub const RUNNING: &str = "Running";
pub const CAPTURING: &str = "Capturing";
pub const CAPTURED: &str = "Captured";
pub const TEARING_DOWN: &str = "Tearing Down";
pub const SETUP_DELETED: &str = "Setup Deleted";
pub const COMPLETED: &str = "Completed";
pub const FAILED: &str = "Failed";

/// Refreshes the display fields of the trial status, returning true if anything changed
pub fn update_status(trial: &mut Trial) -> bool {
    let phase = summarize(trial);
    let assignments = assignments(trial);
    let observed = values(trial);

    let mut dirty = false;
    for (field, value) in [
        (&mut trial.status.phase, phase),
        (&mut trial.status.assignments, assignments),
        (&mut trial.status.observed, observed),
    ] {
        if *field != value {
            *field = value;
            dirty = true;
        }
    }
    dirty
}

/// Lifecycle position derived from the conditions, in the order they were recorded
pub fn summarize(trial: &Trial) -> String {
    if trial.has_initializer() {
        return SETTING_UP.to_string();
    }

    let mut summary = CREATED;
    for c in &trial.status.conditions {
        let is_true = c.status == ConditionStatus::True;
        summary = match c.condition_type {
            TrialConditionType::SetupCreated if is_true => SETUP_CREATED,
            TrialConditionType::SetupCreated => SETTING_UP,
            TrialConditionType::SetupDeleted if is_true => SETUP_DELETED,
            TrialConditionType::SetupDeleted if c.status == ConditionStatus::False => TEARING_DOWN,
            TrialConditionType::SetupDeleted => summary,
            TrialConditionType::Patched if is_true => PATCHED,
            TrialConditionType::Patched => PATCHING,
            TrialConditionType::Stable if is_true && trial.status.start_time.is_some() => RUNNING,
            TrialConditionType::Stable if is_true => STABILIZED,
            TrialConditionType::Stable => WAITING,
            TrialConditionType::Observed if is_true => CAPTURED,
            TrialConditionType::Observed => CAPTURING,
            TrialConditionType::Complete if is_true => return COMPLETED.to_string(),
            TrialConditionType::Failed if is_true => return FAILED.to_string(),
            TrialConditionType::Complete | TrialConditionType::Failed => summary,
        };
    }
    summary.to_string()
}

/// `name=value` pairs of the assignments
pub fn assignments(trial: &Trial) -> String {
    trial
        .spec
        .assignments
        .iter()
        .map(|a| format!("{}={}", a.name, a.value))
        .collect::<Vec<_>>()
        .join(", ")
}

/// `name=value` pairs of the captured values
pub fn values(trial: &Trial) -> String {
    trial
        .status
        .values
        .iter()
        .filter_map(|v| v.value.map(|value| format!("{}={value}", v.name)))
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Assignment, ObjectMeta, TrialValue, ANNOTATION_INITIALIZER};
    use chrono::Utc;

    fn trial() -> Trial {
        let mut trial = Trial {
            metadata: ObjectMeta::named("default", "web-001"),
            ..Default::default()
        };
        trial.spec.assignments = vec![Assignment::new("cpu", 500), Assignment::new("memory", 2048)];
        trial
    }

    #[test]
    fn test_summary_follows_conditions() {
        let mut trial = trial();
        assert_eq!(summarize(&trial), CREATED);

        let now = Utc::now();
        trial.apply_condition(TrialConditionType::Patched, ConditionStatus::Unknown, "", "", now);
        assert_eq!(summarize(&trial), PATCHING);

        trial.apply_condition(TrialConditionType::Patched, ConditionStatus::True, "", "", now);
        trial.apply_condition(TrialConditionType::Stable, ConditionStatus::True, "", "", now);
        assert_eq!(summarize(&trial), STABILIZED);

        trial.status.start_time = Some(now);
        assert_eq!(summarize(&trial), RUNNING);

        trial.apply_condition(TrialConditionType::Observed, ConditionStatus::False, "", "", now);
        assert_eq!(summarize(&trial), CAPTURING);

        trial.apply_condition(TrialConditionType::Failed, ConditionStatus::True, "", "", now);
        assert_eq!(summarize(&trial), FAILED);
    }

    #[test]
    fn test_initializer_means_setting_up() {
        let mut trial = trial();
        trial
            .metadata
            .annotations
            .insert(ANNOTATION_INITIALIZER.to_string(), "setup".to_string());
        assert_eq!(summarize(&trial), SETTING_UP);
    }

    #[test]
    fn test_display_strings() {
        let mut trial = trial();
        let mut captured = TrialValue::pending("latency", 0);
        captured.value = Some(12.5);
        trial.status.values = vec![captured, TrialValue::pending("cost", 3)];

        assert!(update_status(&mut trial));
        assert_eq!(trial.status.assignments, "cpu=500, memory=2048");
        assert_eq!(trial.status.observed, "latency=12.5");
        assert_eq!(trial.status.phase, CREATED);
        assert!(!update_status(&mut trial));
    }
}
