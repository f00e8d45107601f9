//! Resource health assessment
//!
//! Built-in checks cover the common workload and networking kinds. The
//! `resource.customizations` settings can override any kind with rules
//! mapping status conditions onto a health status.

use kube::api::DynamicObject;
use serde_json::Value;

use crate::clients::settings::ResourceOverride;
use crate::clients::Settings;
use crate::crd::{HealthStatus, HealthStatusCode, API_GROUP, APPLICATION_KIND};
use crate::resource::{group_version, kind_of};

/// Kinds with a built-in health check
const BUILTIN_CHECKS: &[(&str, &str)] = &[
    ("apps", "Deployment"),
    ("apps", "StatefulSet"),
    ("apps", "DaemonSet"),
    ("apps", "ReplicaSet"),
    ("", "Pod"),
    ("batch", "Job"),
    ("", "PersistentVolumeClaim"),
    ("", "Service"),
    ("networking.k8s.io", "Ingress"),
    ("extensions", "Ingress"),
    ("autoscaling", "HorizontalPodAutoscaler"),
    ("apiregistration.k8s.io", "APIService"),
    (API_GROUP, APPLICATION_KIND),
];

/// Pod waiting reasons that never resolve by themselves
const POD_ERROR_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
    "InvalidImageName",
    "CreateContainerError",
];

pub fn has_builtin_check(group: &str, kind: &str) -> bool {
    BUILTIN_CHECKS.iter().any(|(g, k)| *g == group && *k == kind)
}

/// Whether health of the kind can be assessed at all
pub fn has_health_check(group: &str, kind: &str, settings: &Settings) -> bool {
    has_builtin_check(group, kind) || settings.override_for(group, kind).is_some()
}

fn int(obj: &DynamicObject, pointer: &str) -> Option<i64> {
    obj.data.pointer(pointer).and_then(Value::as_i64)
}

fn string<'a>(obj: &'a DynamicObject, pointer: &str) -> Option<&'a str> {
    obj.data.pointer(pointer).and_then(Value::as_str)
}

fn conditions(obj: &DynamicObject) -> &[Value] {
    obj.data
        .pointer("/status/conditions")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn condition<'a>(obj: &'a DynamicObject, type_: &str) -> Option<&'a Value> {
    conditions(obj)
        .iter()
        .find(|c| c.get("type").and_then(Value::as_str) == Some(type_))
}

fn condition_field<'a>(cond: &'a Value, field: &str) -> &'a str {
    cond.get(field).and_then(Value::as_str).unwrap_or("")
}

/// Controllers that have not observed the latest spec are still progressing
fn generation_pending(obj: &DynamicObject) -> bool {
    match (obj.metadata.generation, int(obj, "/status/observedGeneration")) {
        (Some(generation), Some(observed)) => observed < generation,
        (Some(_), None) => true,
        _ => false,
    }
}

fn progressing(message: impl Into<String>) -> HealthStatus {
    HealthStatus::new(HealthStatusCode::Progressing, message)
}

fn degraded(message: impl Into<String>) -> HealthStatus {
    HealthStatus::new(HealthStatusCode::Degraded, message)
}

fn deployment_health(obj: &DynamicObject) -> HealthStatus {
    if obj.data.pointer("/spec/paused").and_then(Value::as_bool) == Some(true) {
        return HealthStatus::new(HealthStatusCode::Suspended, "Deployment is paused");
    }
    if generation_pending(obj) {
        return progressing("Waiting for rollout to finish: observed deployment generation less than desired generation");
    }
    if let Some(cond) = condition(obj, "Progressing") {
        if condition_field(cond, "reason") == "ProgressDeadlineExceeded" {
            return degraded(format!(
                "Deployment {:?} exceeded its progress deadline",
                obj.metadata.name.as_deref().unwrap_or_default()
            ));
        }
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let updated = int(obj, "/status/updatedReplicas").unwrap_or(0);
    let current = int(obj, "/status/replicas").unwrap_or(0);
    let available = int(obj, "/status/availableReplicas").unwrap_or(0);
    if updated < desired {
        return progressing(format!(
            "Waiting for rollout to finish: {} out of {} new replicas have been updated...",
            updated, desired
        ));
    }
    if current > updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} old replicas are pending termination...",
            current - updated
        ));
    }
    if available < updated {
        return progressing(format!(
            "Waiting for rollout to finish: {} of {} updated replicas are available...",
            available, updated
        ));
    }
    HealthStatus::healthy()
}

fn stateful_set_health(obj: &DynamicObject) -> HealthStatus {
    if generation_pending(obj) {
        return progressing("Waiting for statefulset spec update to be observed...");
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let ready = int(obj, "/status/readyReplicas").unwrap_or(0);
    if ready < desired {
        return progressing(format!(
            "Waiting for {} pods to be ready...",
            desired - ready
        ));
    }
    if string(obj, "/spec/updateStrategy/type") == Some("OnDelete") {
        return HealthStatus::new(
            HealthStatusCode::Healthy,
            "statefulset has OnDelete update strategy",
        );
    }
    let current = string(obj, "/status/currentRevision");
    let update = string(obj, "/status/updateRevision");
    if current != update {
        return progressing(format!(
            "waiting for statefulset rolling update to complete {} pods at revision {}...",
            int(obj, "/status/updatedReplicas").unwrap_or(0),
            update.unwrap_or_default()
        ));
    }
    HealthStatus::healthy()
}

fn daemon_set_health(obj: &DynamicObject) -> HealthStatus {
    if generation_pending(obj) {
        return progressing("Waiting for daemon set spec update to be observed...");
    }
    if string(obj, "/spec/updateStrategy/type") == Some("OnDelete") {
        return HealthStatus::new(
            HealthStatusCode::Healthy,
            "daemon set has OnDelete update strategy",
        );
    }
    let desired = int(obj, "/status/desiredNumberScheduled").unwrap_or(0);
    let updated = int(obj, "/status/updatedNumberScheduled").unwrap_or(0);
    let available = int(obj, "/status/numberAvailable").unwrap_or(0);
    if updated < desired {
        return progressing(format!(
            "Waiting for daemon set rollout to finish: {} out of {} new pods have been updated...",
            updated, desired
        ));
    }
    if available < desired {
        return progressing(format!(
            "Waiting for daemon set rollout to finish: {} of {} updated pods are available...",
            available, desired
        ));
    }
    HealthStatus::healthy()
}

fn replica_set_health(obj: &DynamicObject) -> HealthStatus {
    if generation_pending(obj) {
        return progressing("Waiting for rollout to finish: observed replica set generation less than desired generation");
    }
    if let Some(cond) = condition(obj, "ReplicaFailure") {
        if condition_field(cond, "status") == "True" {
            return degraded(condition_field(cond, "message"));
        }
    }
    let desired = int(obj, "/spec/replicas").unwrap_or(1);
    let available = int(obj, "/status/availableReplicas").unwrap_or(0);
    if available < desired {
        return progressing(format!(
            "Waiting for rollout to finish: {} out of {} new replicas are available...",
            available, desired
        ));
    }
    HealthStatus::healthy()
}

fn waiting_error(obj: &DynamicObject) -> Option<String> {
    for field in ["/status/initContainerStatuses", "/status/containerStatuses"] {
        let Some(statuses) = obj.data.pointer(field).and_then(Value::as_array) else {
            continue;
        };
        for status in statuses {
            if let Some(waiting) = status.pointer("/state/waiting") {
                let reason = waiting.get("reason").and_then(Value::as_str).unwrap_or("");
                if POD_ERROR_REASONS.contains(&reason) {
                    let message = waiting.get("message").and_then(Value::as_str).unwrap_or(reason);
                    return Some(message.to_string());
                }
            }
        }
    }
    None
}

fn pod_health(obj: &DynamicObject) -> HealthStatus {
    let message = string(obj, "/status/message").unwrap_or("").to_string();
    match string(obj, "/status/phase").unwrap_or("") {
        "Pending" => match waiting_error(obj) {
            Some(err) => degraded(err),
            None => progressing(message),
        },
        "Succeeded" => HealthStatus::new(HealthStatusCode::Healthy, message),
        "Failed" => degraded(if message.is_empty() {
            "Pod failed".to_string()
        } else {
            message
        }),
        "Running" => {
            if let Some(err) = waiting_error(obj) {
                return degraded(err);
            }
            let restart = string(obj, "/spec/restartPolicy").unwrap_or("Always");
            let ready = condition(obj, "Ready")
                .map(|c| condition_field(c, "status") == "True")
                .unwrap_or(false);
            if restart == "Always" && ready {
                HealthStatus::new(HealthStatusCode::Healthy, message)
            } else {
                progressing(message)
            }
        }
        _ => HealthStatus::new(HealthStatusCode::Unknown, message),
    }
}

fn job_health(obj: &DynamicObject) -> HealthStatus {
    for cond in conditions(obj) {
        let is_true = condition_field(cond, "status") == "True";
        match condition_field(cond, "type") {
            "Failed" if is_true => return degraded(condition_field(cond, "message")),
            "Complete" if is_true => {
                return HealthStatus::new(HealthStatusCode::Healthy, condition_field(cond, "message"))
            }
            "Suspended" if is_true => {
                return HealthStatus::new(HealthStatusCode::Suspended, condition_field(cond, "message"))
            }
            _ => {}
        }
    }
    if obj.data.pointer("/spec/suspend").and_then(Value::as_bool) == Some(true) {
        return HealthStatus::new(HealthStatusCode::Suspended, "Job is suspended");
    }
    progressing("")
}

fn pvc_health(obj: &DynamicObject) -> HealthStatus {
    match string(obj, "/status/phase").unwrap_or("") {
        "Lost" => degraded(""),
        "Pending" => progressing(""),
        "Bound" => HealthStatus::healthy(),
        _ => HealthStatus::new(HealthStatusCode::Unknown, ""),
    }
}

fn has_load_balancer_ingress(obj: &DynamicObject) -> bool {
    obj.data
        .pointer("/status/loadBalancer/ingress")
        .and_then(Value::as_array)
        .map(|i| !i.is_empty())
        .unwrap_or(false)
}

fn service_health(obj: &DynamicObject) -> HealthStatus {
    if string(obj, "/spec/type") == Some("LoadBalancer") && !has_load_balancer_ingress(obj) {
        return progressing("");
    }
    HealthStatus::healthy()
}

fn ingress_health(obj: &DynamicObject) -> HealthStatus {
    if has_load_balancer_ingress(obj) {
        HealthStatus::healthy()
    } else {
        progressing("")
    }
}

fn hpa_health(obj: &DynamicObject) -> HealthStatus {
    for cond in conditions(obj) {
        let reason = condition_field(cond, "reason");
        if condition_field(cond, "status") == "False" && reason.starts_with("Failed") {
            return degraded(condition_field(cond, "message"));
        }
    }
    HealthStatus::healthy()
}

fn api_service_health(obj: &DynamicObject) -> HealthStatus {
    match condition(obj, "Available") {
        Some(c) if condition_field(c, "status") == "True" => {
            HealthStatus::new(HealthStatusCode::Healthy, condition_field(c, "message"))
        }
        Some(c) => progressing(format!(
            "{}: {}",
            condition_field(c, "reason"),
            condition_field(c, "message")
        )),
        None => progressing(""),
    }
}

fn application_health(obj: &DynamicObject) -> HealthStatus {
    obj.data
        .pointer("/status/health")
        .and_then(|h| serde_json::from_value::<HealthStatus>(h.clone()).ok())
        .unwrap_or_default()
}

fn override_health(obj: &DynamicObject, ov: &ResourceOverride) -> Option<HealthStatus> {
    for rule in &ov.health {
        if let Some(cond) = condition(obj, &rule.condition) {
            if condition_field(cond, "status") == rule.status {
                let message = rule
                    .message
                    .clone()
                    .unwrap_or_else(|| condition_field(cond, "message").to_string());
                return Some(HealthStatus::new(rule.health, message));
            }
        }
    }
    ov.default_health.map(|h| HealthStatus::new(h, ""))
}

/// Health of one live object, `None` when the kind has no check
pub fn resource_health(obj: &DynamicObject, settings: &Settings) -> Option<HealthStatus> {
    if obj.metadata.deletion_timestamp.is_some() {
        return Some(progressing("Pending deletion"));
    }
    let (group, _) = group_version(obj);
    let kind = kind_of(obj);
    if let Some(ov) = settings.override_for(&group, &kind) {
        if let Some(health) = override_health(obj, ov) {
            return Some(health);
        }
    }
    let health = match (group.as_str(), kind.as_str()) {
        ("apps", "Deployment") => deployment_health(obj),
        ("apps", "StatefulSet") => stateful_set_health(obj),
        ("apps", "DaemonSet") => daemon_set_health(obj),
        ("apps", "ReplicaSet") => replica_set_health(obj),
        ("", "Pod") => pod_health(obj),
        ("batch", "Job") => job_health(obj),
        ("", "PersistentVolumeClaim") => pvc_health(obj),
        ("", "Service") => service_health(obj),
        ("networking.k8s.io", "Ingress") | ("extensions", "Ingress") => ingress_health(obj),
        ("autoscaling", "HorizontalPodAutoscaler") => hpa_health(obj),
        ("apiregistration.k8s.io", "APIService") => api_service_health(obj),
        (g, k) if g == API_GROUP && k == APPLICATION_KIND => application_health(obj),
        _ => return None,
    };
    Some(health)
}

/// One managed resource as seen by the health aggregation
#[derive(Clone, Debug)]
pub struct HealthInput<'a> {
    pub group: &'a str,
    pub kind: &'a str,
    pub live: Option<&'a DynamicObject>,
    /// Hooks, skipped and ignored resources never count
    pub excluded: bool,
    /// The live object is the application being assessed
    pub self_referenced: bool,
}

/// Per-resource health plus the aggregate application health
pub fn set_app_health(
    inputs: &[HealthInput<'_>],
    settings: &Settings,
) -> (HealthStatus, Vec<Option<HealthStatus>>) {
    let mut app_health = HealthStatusCode::Healthy;
    let mut per_resource = Vec::with_capacity(inputs.len());

    for input in inputs {
        if input.excluded || input.self_referenced {
            per_resource.push(None);
            continue;
        }
        let health = match input.live {
            None => Some(HealthStatus::new(HealthStatusCode::Missing, "")),
            Some(live) => resource_health(live, settings),
        };
        per_resource.push(health.clone());
        let Some(health) = health else {
            continue;
        };

        // kinds without any health check do not turn the app Missing
        if health.status == HealthStatusCode::Missing
            && !has_health_check(input.group, input.kind, settings)
        {
            continue;
        }
        // child applications converge on their own
        if input.group == API_GROUP
            && input.kind == APPLICATION_KIND
            && matches!(
                health.status,
                HealthStatusCode::Missing | HealthStatusCode::Unknown
            )
        {
            continue;
        }
        if health.status.is_worse(app_health) {
            app_health = health.status;
        }
    }
    (HealthStatus::new(app_health, ""), per_resource)
}
