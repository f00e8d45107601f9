//! Unit tests for resource and application health assessment.

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;
    use serde_json::{json, Value};

    use crate::clients::settings::{HealthCheckRule, ResourceOverride};
    use crate::clients::Settings;
    use crate::controller::health::{resource_health, set_app_health, HealthInput};
    use crate::crd::HealthStatusCode;
    use crate::resource::GroupKind;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn object(api_version: &str, kind: &str, body: Value) -> DynamicObject {
        let mut value = json!({
            "apiVersion": api_version,
            "kind": kind,
            "metadata": {"name": "demo", "namespace": "default"},
        });
        if let (Some(target), Value::Object(extra)) = (value.as_object_mut(), body) {
            for (k, v) in extra {
                target.insert(k, v);
            }
        }
        serde_json::from_value(value).unwrap()
    }

    fn deployment(status: Value) -> DynamicObject {
        object(
            "apps/v1",
            "Deployment",
            json!({"spec": {"replicas": 2}, "status": status}),
        )
    }

    fn status_of(obj: &DynamicObject) -> HealthStatusCode {
        resource_health(obj, &Settings::default()).unwrap().status
    }

    // -----------------------------------------------------------------------
    // Built-in checks
    // -----------------------------------------------------------------------

    #[test]
    fn test_deployment_healthy() {
        let obj = deployment(json!({"replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}));
        assert_eq!(status_of(&obj), HealthStatusCode::Healthy);
    }

    #[test]
    fn test_deployment_rolling_out() {
        let obj = deployment(json!({"replicas": 3, "updatedReplicas": 1, "availableReplicas": 2}));
        assert_eq!(status_of(&obj), HealthStatusCode::Progressing);
    }

    #[test]
    fn test_deployment_deadline_exceeded() {
        let obj = deployment(json!({
            "conditions": [{"type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded"}]
        }));
        assert_eq!(status_of(&obj), HealthStatusCode::Degraded);
    }

    #[test]
    fn test_deployment_paused() {
        let obj = object(
            "apps/v1",
            "Deployment",
            json!({"spec": {"paused": true, "replicas": 1}}),
        );
        assert_eq!(status_of(&obj), HealthStatusCode::Suspended);
    }

    #[test]
    fn test_deployment_generation_not_observed() {
        let mut obj = deployment(json!({"observedGeneration": 1, "updatedReplicas": 2, "availableReplicas": 2, "replicas": 2}));
        obj.metadata.generation = Some(2);
        assert_eq!(status_of(&obj), HealthStatusCode::Progressing);
    }

    #[test]
    fn test_pod_image_pull_backoff_is_degraded() {
        let obj = object(
            "v1",
            "Pod",
            json!({"status": {
                "phase": "Pending",
                "containerStatuses": [{"name": "app", "state": {"waiting": {"reason": "ImagePullBackOff", "message": "Back-off pulling image"}}}]
            }}),
        );
        let health = resource_health(&obj, &Settings::default()).unwrap();
        assert_eq!(health.status, HealthStatusCode::Degraded);
        assert_eq!(health.message.as_deref(), Some("Back-off pulling image"));
    }

    #[test]
    fn test_pod_running_and_ready() {
        let obj = object(
            "v1",
            "Pod",
            json!({"status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}}),
        );
        assert_eq!(status_of(&obj), HealthStatusCode::Healthy);
    }

    #[test]
    fn test_job_states() {
        let failed = object(
            "batch/v1",
            "Job",
            json!({"status": {"conditions": [{"type": "Failed", "status": "True", "message": "BackoffLimitExceeded"}]}}),
        );
        assert_eq!(status_of(&failed), HealthStatusCode::Degraded);

        let complete = object(
            "batch/v1",
            "Job",
            json!({"status": {"conditions": [{"type": "Complete", "status": "True"}]}}),
        );
        assert_eq!(status_of(&complete), HealthStatusCode::Healthy);

        let running = object("batch/v1", "Job", json!({"status": {"active": 1}}));
        assert_eq!(status_of(&running), HealthStatusCode::Progressing);
    }

    #[test]
    fn test_pvc_phases() {
        let bound = object("v1", "PersistentVolumeClaim", json!({"status": {"phase": "Bound"}}));
        let lost = object("v1", "PersistentVolumeClaim", json!({"status": {"phase": "Lost"}}));
        assert_eq!(status_of(&bound), HealthStatusCode::Healthy);
        assert_eq!(status_of(&lost), HealthStatusCode::Degraded);
    }

    #[test]
    fn test_load_balancer_service_waits_for_ingress() {
        let pending = object("v1", "Service", json!({"spec": {"type": "LoadBalancer"}}));
        assert_eq!(status_of(&pending), HealthStatusCode::Progressing);

        let ready = object(
            "v1",
            "Service",
            json!({"spec": {"type": "LoadBalancer"}, "status": {"loadBalancer": {"ingress": [{"ip": "10.0.0.1"}]}}}),
        );
        assert_eq!(status_of(&ready), HealthStatusCode::Healthy);
    }

    #[test]
    fn test_hpa_failed_condition() {
        let obj = object(
            "autoscaling/v2",
            "HorizontalPodAutoscaler",
            json!({"status": {"conditions": [{"type": "ScalingActive", "status": "False", "reason": "FailedGetResourceMetric"}]}}),
        );
        assert_eq!(status_of(&obj), HealthStatusCode::Degraded);
    }

    #[test]
    fn test_child_application_reports_own_health() {
        let obj = object(
            "driftwatch.io/v1alpha1",
            "Application",
            json!({"spec": {"destination": {}}, "status": {"health": {"status": "Degraded"}}}),
        );
        assert_eq!(status_of(&obj), HealthStatusCode::Degraded);
    }

    #[test]
    fn test_deleting_object_is_progressing() {
        let mut obj = object("v1", "ConfigMap", json!({}));
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert_eq!(status_of(&obj), HealthStatusCode::Progressing);
    }

    #[test]
    fn test_unknown_kind_has_no_health() {
        let obj = object("v1", "ConfigMap", json!({}));
        assert!(resource_health(&obj, &Settings::default()).is_none());
    }

    #[test]
    fn test_override_rules_take_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert(
            GroupKind::new("example.com", "Widget"),
            ResourceOverride {
                health: vec![HealthCheckRule {
                    condition: "Ready".to_string(),
                    status: "False".to_string(),
                    health: HealthStatusCode::Degraded,
                    message: Some("widget broken".to_string()),
                }],
                default_health: Some(HealthStatusCode::Healthy),
                ..Default::default()
            },
        );
        let settings = Settings {
            resource_overrides: overrides,
            ..Default::default()
        };

        let broken = object(
            "example.com/v1",
            "Widget",
            json!({"status": {"conditions": [{"type": "Ready", "status": "False"}]}}),
        );
        let health = resource_health(&broken, &settings).unwrap();
        assert_eq!(health.status, HealthStatusCode::Degraded);
        assert_eq!(health.message.as_deref(), Some("widget broken"));

        let fine = object("example.com/v1", "Widget", json!({}));
        assert_eq!(
            resource_health(&fine, &settings).unwrap().status,
            HealthStatusCode::Healthy
        );
    }

    // -----------------------------------------------------------------------
    // Aggregation
    // -----------------------------------------------------------------------

    #[test]
    fn test_aggregate_takes_worst_status() {
        let healthy = deployment(json!({"replicas": 2, "updatedReplicas": 2, "availableReplicas": 2}));
        let degraded = object("v1", "PersistentVolumeClaim", json!({"status": {"phase": "Lost"}}));
        let inputs = vec![
            HealthInput {
                group: "apps",
                kind: "Deployment",
                live: Some(&healthy),
                excluded: false,
                self_referenced: false,
            },
            HealthInput {
                group: "",
                kind: "PersistentVolumeClaim",
                live: Some(&degraded),
                excluded: false,
                self_referenced: false,
            },
        ];
        let (app, per_resource) = set_app_health(&inputs, &Settings::default());
        assert_eq!(app.status, HealthStatusCode::Degraded);
        assert_eq!(per_resource.len(), 2);
    }

    #[test]
    fn test_missing_without_health_check_is_excluded() {
        let inputs = vec![HealthInput {
            group: "",
            kind: "ConfigMap",
            live: None,
            excluded: false,
            self_referenced: false,
        }];
        let (app, per_resource) = set_app_health(&inputs, &Settings::default());
        assert_eq!(app.status, HealthStatusCode::Healthy);
        assert_eq!(
            per_resource[0].as_ref().map(|h| h.status),
            Some(HealthStatusCode::Missing)
        );
    }

    #[test]
    fn test_missing_deployment_marks_app_missing() {
        let inputs = vec![HealthInput {
            group: "apps",
            kind: "Deployment",
            live: None,
            excluded: false,
            self_referenced: false,
        }];
        let (app, _) = set_app_health(&inputs, &Settings::default());
        assert_eq!(app.status, HealthStatusCode::Missing);
    }

    #[test]
    fn test_child_application_missing_does_not_degrade_parent() {
        let unknown = object(
            "driftwatch.io/v1alpha1",
            "Application",
            json!({"spec": {"destination": {}}}),
        );
        let inputs = vec![
            HealthInput {
                group: "driftwatch.io",
                kind: "Application",
                live: None,
                excluded: false,
                self_referenced: false,
            },
            HealthInput {
                group: "driftwatch.io",
                kind: "Application",
                live: Some(&unknown),
                excluded: false,
                self_referenced: false,
            },
        ];
        let (app, _) = set_app_health(&inputs, &Settings::default());
        assert_eq!(app.status, HealthStatusCode::Healthy);
    }

    #[test]
    fn test_hooks_and_self_references_are_skipped() {
        let failed_job = object(
            "batch/v1",
            "Job",
            json!({"status": {"conditions": [{"type": "Failed", "status": "True"}]}}),
        );
        let inputs = vec![
            HealthInput {
                group: "batch",
                kind: "Job",
                live: Some(&failed_job),
                excluded: true,
                self_referenced: false,
            },
            HealthInput {
                group: "batch",
                kind: "Job",
                live: Some(&failed_job),
                excluded: false,
                self_referenced: true,
            },
        ];
        let (app, per_resource) = set_app_health(&inputs, &Settings::default());
        assert_eq!(app.status, HealthStatusCode::Healthy);
        assert!(per_resource.iter().all(Option::is_none));
    }
}
