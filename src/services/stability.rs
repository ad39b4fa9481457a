//! Rollout stability checks for patched objects.
//!
//! The checks mirror `kubectl rollout status`: a workload is stable once its
//! controller has observed the latest generation and every replica runs the
//! updated template. Pods selected by the workload are consulted to replace a
//! vague "wait" with a concrete hard failure (crash loops, unschedulable pods).

use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info};

use crate::domain::error::StabilityError;
use crate::domain::models::{LabelSelector, ObjectReference};
use crate::domain::ports::{ListParams, ObjectStore};

/// Delay before a workload that is still rolling out is checked again
pub const RETRY_AFTER: Duration = Duration::from_secs(5);

const UPDATE_STRATEGY: &str = "UpdateStrategy";

fn int(object: &Value, pointer: &str) -> Option<i64> {
    object.pointer(pointer).and_then(Value::as_i64)
}

fn text<'a>(object: &'a Value, pointer: &str) -> &'a str {
    object.pointer(pointer).and_then(Value::as_str).unwrap_or_default()
}

fn items<'a>(object: &'a Value, pointer: &str) -> impl Iterator<Item = &'a Value> {
    object
        .pointer(pointer)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

fn wait(reason: &str) -> StabilityError {
    StabilityError::retry(reason, RETRY_AFTER)
}

fn generation_observed(object: &Value) -> bool {
    int(object, "/metadata/generation").unwrap_or(0) <= int(object, "/status/observedGeneration").unwrap_or(0)
}

/// Checks a deployment rollout
pub fn check_deployment(deployment: &Value) -> Result<(), StabilityError> {
    if !generation_observed(deployment) {
        return Err(wait("ObservedGeneration"));
    }

    let deadline_exceeded = items(deployment, "/status/conditions").any(|c| {
        c.get("type").and_then(Value::as_str) == Some("Progressing")
            && c.get("reason").and_then(Value::as_str) == Some("ProgressDeadlineExceeded")
    });
    if deadline_exceeded {
        return Err(StabilityError::fatal("ProgressDeadlineExceeded"));
    }

    let updated = int(deployment, "/status/updatedReplicas").unwrap_or(0);
    if int(deployment, "/spec/replicas").is_some_and(|desired| updated < desired) {
        return Err(wait("UpdatedReplicas"));
    }
    if int(deployment, "/status/replicas").unwrap_or(0) > updated {
        return Err(wait("Replicas"));
    }
    if int(deployment, "/status/availableReplicas").unwrap_or(0) < updated {
        return Err(wait("AvailableReplicas"));
    }
    Ok(())
}

/// Checks a daemon set rollout; only rolling updates can be tracked
pub fn check_daemon_set(daemon: &Value) -> Result<(), StabilityError> {
    let strategy = text(daemon, "/spec/updateStrategy/type");
    if !strategy.is_empty() && strategy != "RollingUpdate" {
        return Err(StabilityError::fatal(UPDATE_STRATEGY));
    }
    if !generation_observed(daemon) {
        return Err(wait("ObservedGeneration"));
    }

    let desired = int(daemon, "/status/desiredNumberScheduled").unwrap_or(0);
    if int(daemon, "/status/updatedNumberScheduled").unwrap_or(0) < desired {
        return Err(wait("NumberScheduled"));
    }
    if int(daemon, "/status/numberAvailable").unwrap_or(0) < desired {
        return Err(wait("NumberAvailable"));
    }
    Ok(())
}

/// Checks a stateful set rollout, honoring a rolling update partition
pub fn check_stateful_set(sts: &Value) -> Result<(), StabilityError> {
    let strategy = text(sts, "/spec/updateStrategy/type");
    if !strategy.is_empty() && strategy != "RollingUpdate" {
        return Err(StabilityError::fatal(UPDATE_STRATEGY));
    }

    let observed = int(sts, "/status/observedGeneration").unwrap_or(0);
    if observed == 0 || !generation_observed(sts) {
        return Err(wait("ObservedGeneration"));
    }

    let desired = int(sts, "/spec/replicas");
    if desired.is_some_and(|d| int(sts, "/status/readyReplicas").unwrap_or(0) < d) {
        return Err(wait("ReadyReplicas"));
    }

    if sts.pointer("/spec/updateStrategy/rollingUpdate").is_some() {
        let partition = int(sts, "/spec/updateStrategy/rollingUpdate/partition");
        if let (Some(desired), Some(partition)) = (desired, partition) {
            if int(sts, "/status/updatedReplicas").unwrap_or(0) < desired - partition {
                return Err(wait("UpdatedReplicas"));
            }
        }
        return Ok(());
    }

    if text(sts, "/status/updateRevision") != text(sts, "/status/currentRevision") {
        return Err(wait("CurrentRevision"));
    }
    Ok(())
}

fn check_container_statuses<'a>(
    statuses: impl Iterator<Item = &'a Value>,
    restart_policy: &str,
) -> Result<(), StabilityError> {
    for status in statuses {
        if status.get("ready").and_then(Value::as_bool).unwrap_or(false) {
            continue;
        }
        let restarts = int(status, "/restartCount").unwrap_or(0);
        let waiting = text(status, "/state/waiting/reason");
        if restarts > 0 && waiting == "CrashLoopBackOff" {
            return Err(StabilityError::fatal(waiting));
        }
        let terminated = text(status, "/state/terminated/reason");
        if restart_policy == "Never" && restarts == 0 && terminated == "Error" {
            return Err(StabilityError::fatal(terminated));
        }
    }
    Ok(())
}

/// Checks the pods backing a workload
///
/// Hard failures are reported ahead of pods that only need more time.
pub fn check_pods(pods: &[Value]) -> Result<(), StabilityError> {
    for pod in pods {
        let unschedulable = items(pod, "/status/conditions").find(|c| {
            c.get("type").and_then(Value::as_str) == Some("PodScheduled")
                && c.get("status").and_then(Value::as_str) == Some("False")
                && c.get("reason").and_then(Value::as_str) == Some("Unschedulable")
        });
        if unschedulable.is_some() {
            return Err(StabilityError::fatal("Unschedulable"));
        }

        let restart_policy = text(pod, "/spec/restartPolicy");
        check_container_statuses(items(pod, "/status/initContainerStatuses"), restart_policy)?;
        check_container_statuses(items(pod, "/status/containerStatuses"), restart_policy)?;
    }

    for pod in pods {
        let not_ready = items(pod, "/status/conditions").find(|c| {
            c.get("type").and_then(Value::as_str) == Some("Ready")
                && c.get("status").and_then(Value::as_str) == Some("False")
        });
        if let Some(condition) = not_ready {
            return Err(wait(text(condition, "/reason")));
        }
    }
    Ok(())
}

/// Checks a single object by kind
///
/// Kinds without rollout semantics are reported as stable.
pub fn check_object(object: &Value) -> Result<(), StabilityError> {
    match text(object, "/kind") {
        "Deployment" => check_deployment(object),
        "DaemonSet" => check_daemon_set(object),
        "StatefulSet" => check_stateful_set(object),
        "Pod" => check_pods(std::slice::from_ref(object)),
        _ => Ok(()),
    }
}

fn has_rollout(kind: &str) -> bool {
    matches!(kind, "Deployment" | "DaemonSet" | "StatefulSet")
}

/// Waits for the target of a patch operation to stabilize
///
/// Missing targets are ignored. When the workload itself asks for a wait,
/// its pods are checked so a crash loop fails fast instead of timing out.
/// Legacy update strategies cannot be tracked and are treated as stable.
pub async fn check_target(store: &dyn ObjectStore, target: &ObjectReference) -> Result<(), StabilityError> {
    let with_target = |mut err: StabilityError| {
        err.target_ref = target.clone();
        err
    };

    match target.kind.as_str() {
        "ConfigMap" => return Ok(()),
        kind if has_rollout(kind) => {}
        _ => {
            info!(kind = %target.kind, name = %target.name, namespace = %target.namespace,
                "Stability check skipped due to unsupported object kind");
            return Ok(());
        }
    }

    let object = match store.get(target).await {
        Ok(object) => object,
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) if e.is_transient() => return Err(with_target(wait(&e.to_string()))),
        Err(e) => return Err(with_target(StabilityError::fatal(e.to_string()))),
    };

    let Err(mut err) = check_object(&object) else {
        return Ok(());
    };

    if err.is_transient() || err.reason == UPDATE_STRATEGY {
        let selector = object
            .pointer("/spec/selector")
            .cloned()
            .and_then(|s| serde_json::from_value::<LabelSelector>(s).ok());
        if let Some(selector) = selector.filter(|s| !s.is_empty()) {
            let params = ListParams::in_namespace(target.namespace.clone()).with_selector(selector);
            match store.list("v1", "Pod", &params).await {
                Ok(pods) => {
                    if let Err(pod_err) = check_pods(&pods) {
                        err = pod_err;
                    }
                }
                Err(e) => debug!(error = %e, "Unable to list pods for stability check"),
            }
        }
    }

    if err.reason == UPDATE_STRATEGY {
        debug!(kind = %target.kind, name = %target.name, "Ignoring legacy update strategy");
        return Ok(());
    }
    Err(with_target(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deployment(status: Value) -> Value {
        json!({
            "kind": "Deployment",
            "metadata": {"name": "web", "generation": 2},
            "spec": {"replicas": 3},
            "status": status
        })
    }

    #[test]
    fn test_deployment_rolled_out() {
        let d = deployment(json!({
            "observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3
        }));
        assert!(check_deployment(&d).is_ok());
    }

    #[test]
    fn test_deployment_waits_for_generation_and_replicas() {
        let d = deployment(json!({"observedGeneration": 1}));
        assert_eq!(check_deployment(&d).unwrap_err().reason, "ObservedGeneration");

        let d = deployment(json!({"observedGeneration": 2, "replicas": 4, "updatedReplicas": 3}));
        let err = check_deployment(&d).unwrap_err();
        assert_eq!(err.reason, "Replicas");
        assert_eq!(err.retry_after, RETRY_AFTER);

        let d = deployment(json!({
            "observedGeneration": 2, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 1
        }));
        assert_eq!(check_deployment(&d).unwrap_err().reason, "AvailableReplicas");
    }

    #[test]
    fn test_deployment_progress_deadline_is_fatal() {
        let d = deployment(json!({
            "observedGeneration": 2,
            "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
        }));
        let err = check_deployment(&d).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.reason, "ProgressDeadlineExceeded");
    }

    #[test]
    fn test_daemon_set_on_delete_strategy() {
        let ds = json!({"kind": "DaemonSet", "spec": {"updateStrategy": {"type": "OnDelete"}}});
        assert_eq!(check_daemon_set(&ds).unwrap_err().reason, UPDATE_STRATEGY);
    }

    #[test]
    fn test_stateful_set_partition() {
        let sts = json!({
            "kind": "StatefulSet",
            "metadata": {"generation": 1},
            "spec": {"replicas": 4, "updateStrategy": {"type": "RollingUpdate", "rollingUpdate": {"partition": 2}}},
            "status": {"observedGeneration": 1, "readyReplicas": 4, "updatedReplicas": 2}
        });
        assert!(check_stateful_set(&sts).is_ok());

        let sts = json!({
            "kind": "StatefulSet",
            "metadata": {"generation": 1},
            "spec": {"replicas": 2, "updateStrategy": {"type": "RollingUpdate"}},
            "status": {"observedGeneration": 1, "readyReplicas": 2, "updateRevision": "b", "currentRevision": "a"}
        });
        assert_eq!(check_stateful_set(&sts).unwrap_err().reason, "CurrentRevision");
    }

    #[test]
    fn test_pods_hard_failures_win() {
        let waiting = json!({"status": {"conditions": [
            {"type": "Ready", "status": "False", "reason": "ContainersNotReady"}
        ]}});
        let crashing = json!({"status": {"containerStatuses": [
            {"ready": false, "restartCount": 3, "state": {"waiting": {"reason": "CrashLoopBackOff"}}}
        ]}});

        let err = check_pods(&[waiting.clone(), crashing]).unwrap_err();
        assert_eq!(err.reason, "CrashLoopBackOff");
        assert!(!err.is_transient());

        let err = check_pods(&[waiting]).unwrap_err();
        assert_eq!(err.reason, "ContainersNotReady");
        assert!(err.is_transient());
    }

    #[test]
    fn test_unschedulable_pod() {
        let pod = json!({"status": {"conditions": [
            {"type": "PodScheduled", "status": "False", "reason": "Unschedulable"}
        ]}});
        assert_eq!(check_pods(&[pod]).unwrap_err().reason, "Unschedulable");
    }

    #[test]
    fn test_config_maps_are_always_stable() {
        assert!(check_object(&json!({"kind": "ConfigMap"})).is_ok());
    }
}
