//! Experiment definition and trial assignment checks

use std::collections::{BTreeMap, HashSet};

use crate::domain::error::{AssignmentError, ExperimentError};
use crate::domain::models::{AssignmentValue, Experiment, MetricType, Parameter, Trial};

/// Ensures the trial assigns every parameter exactly once and within bounds
pub fn check_assignments(trial: &Trial, experiment: &Experiment) -> Result<(), AssignmentError> {
    let mut err = AssignmentError::default();

    let mut assignments: BTreeMap<&str, &AssignmentValue> = BTreeMap::new();
    for a in &trial.spec.assignments {
        if assignments.contains_key(a.name.as_str()) {
            err.duplicated.push(a.name.clone());
        } else {
            assignments.insert(a.name.as_str(), &a.value);
        }
    }

    for p in &experiment.spec.parameters {
        match assignments.remove(p.name.as_str()) {
            Some(value) if !check_parameter_value(p, value) => err.out_of_bounds.push(p.name.clone()),
            Some(_) => {}
            None => err.unassigned.push(p.name.clone()),
        }
    }
    err.undefined = assignments.keys().map(|n| (*n).to_string()).collect();

    if err.is_empty() {
        Ok(())
    } else {
        Err(err)
    }
}

/// Whether the value lies in the parameter's domain
pub fn check_parameter_value(parameter: &Parameter, value: &AssignmentValue) -> bool {
    if parameter.is_categorical() {
        return parameter.values.iter().any(|v| *v == value.to_string());
    }
    let (Some(v), Some(min), Some(max)) = (
        numeric(value),
        parameter.min.as_ref().and_then(numeric),
        parameter.max.as_ref().and_then(numeric),
    ) else {
        return false;
    };
    min <= v && v <= max
}

fn numeric(value: &AssignmentValue) -> Option<f64> {
    match value {
        AssignmentValue::String(_) => None,
        other => other.as_f64(),
    }
}

/// Checks parameter domains and metric definitions
pub fn validate_experiment(experiment: &Experiment) -> Result<(), ExperimentError> {
    let mut seen = HashSet::new();
    for p in &experiment.spec.parameters {
        let invalid = |reason: &str| ExperimentError::InvalidParameter {
            name: p.name.clone(),
            reason: reason.to_string(),
        };
        if !seen.insert(p.name.as_str()) {
            return Err(invalid("duplicate parameter name"));
        }
        if p.is_categorical() {
            if p.min.is_some() || p.max.is_some() {
                return Err(invalid("enumerated values cannot have bounds"));
            }
            continue;
        }
        match (p.min.as_ref().and_then(numeric), p.max.as_ref().and_then(numeric)) {
            (Some(min), Some(max)) if min <= max => {}
            (Some(_), Some(_)) => return Err(invalid("min must not exceed max")),
            _ => return Err(invalid("numeric bounds or enumerated values are required")),
        }
        if let Some(baseline) = &p.baseline {
            if !check_parameter_value(p, baseline) {
                return Err(invalid("baseline is out of bounds"));
            }
        }
    }

    let mut seen = HashSet::new();
    for m in &experiment.spec.metrics {
        let invalid = |reason: &str| ExperimentError::InvalidMetric {
            name: m.name.clone(),
            reason: reason.to_string(),
        };
        if !seen.insert(m.name.as_str()) {
            return Err(invalid("duplicate metric name"));
        }
        match m.metric_type {
            MetricType::JsonPath if !(m.query.contains('{') && m.query.contains('}')) => {
                return Err(invalid("jsonpath query must contain a {...} expression"));
            }
            MetricType::Prometheus | MetricType::JsonPath
                if !m.scheme.is_empty() && !matches!(m.scheme.to_lowercase().as_str(), "http" | "https") =>
            {
                return Err(invalid("scheme must be http or https"));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Assignment, Metric};

    fn experiment() -> Experiment {
        let mut exp = Experiment::default();
        exp.spec.parameters = vec![
            Parameter::int_range("cpu", 100, 1000),
            Parameter::categorical("mode", &["fast", "slow"]),
        ];
        exp
    }

    fn trial(assignments: Vec<Assignment>) -> Trial {
        let mut t = Trial::default();
        t.spec.assignments = assignments;
        t
    }

    #[test]
    fn test_valid_assignments() {
        let t = trial(vec![Assignment::new("cpu", 500), Assignment::new("mode", "fast")]);
        assert!(check_assignments(&t, &experiment()).is_ok());
    }

    #[test]
    fn test_assignment_problems_are_collected() {
        let t = trial(vec![
            Assignment::new("cpu", 5000),
            Assignment::new("cpu", 500),
            Assignment::new("extra", 1),
        ]);
        let err = check_assignments(&t, &experiment()).unwrap_err();
        assert_eq!(err.duplicated, vec!["cpu".to_string()]);
        assert_eq!(err.out_of_bounds, vec!["cpu".to_string()]);
        assert_eq!(err.unassigned, vec!["mode".to_string()]);
        assert_eq!(err.undefined, vec!["extra".to_string()]);
    }

    #[test]
    fn test_double_bounds() {
        let mut p = Parameter::int_range("ratio", 0, 1);
        p.min = Some(AssignmentValue::Double(0.1));
        assert!(check_parameter_value(&p, &AssignmentValue::Double(0.5)));
        assert!(!check_parameter_value(&p, &AssignmentValue::Double(0.05)));
        assert!(!check_parameter_value(&p, &AssignmentValue::from("0.5")));
    }

    #[test]
    fn test_validate_experiment() {
        let mut exp = experiment();
        assert!(validate_experiment(&exp).is_ok());

        exp.spec.parameters.push(Parameter::int_range("bad", 10, 1));
        assert!(matches!(
            validate_experiment(&exp),
            Err(ExperimentError::InvalidParameter { .. })
        ));

        let mut exp = experiment();
        let mut metric = Metric::local("latency", ".p99");
        metric.metric_type = MetricType::JsonPath;
        exp.spec.metrics.push(metric);
        assert!(matches!(
            validate_experiment(&exp),
            Err(ExperimentError::InvalidMetric { .. })
        ));
    }
}
