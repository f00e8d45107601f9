//! Post-delete hooks
//!
//! Run while an application with the cascade finalizer is deleted, after
//! its resources are gone. Each call makes one step and reports whether the
//! hooks are done.

use std::collections::HashMap;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{info, warn};

use crate::clients::executor::{PropagationPolicy, ResourceExecutor};
use crate::clients::settings::Settings;
use crate::controller::health::resource_health;
use crate::crd::{Application, HealthStatusCode, HookDeletePolicy};
use crate::error::{Error, Result};
use crate::resource::annotations::{hook_delete_policies, is_post_delete_hook};
use crate::resource::{group_version, ResourceKey};

/// Name of a post-delete hook that only carries `generateName`. Stable for
/// one deletion so repeated passes find the created hook.
fn post_delete_hook_name(generate_name: &str, revision: &str, app: &Application) -> String {
    let short: String = revision.chars().take(7).collect();
    let deleted_at = app.deletion_time().map(|t| t.timestamp()).unwrap_or_default();
    format!("{}{}-post-delete-{}", generate_name, short, deleted_at).to_lowercase()
}

fn live_hooks(live: &HashMap<ResourceKey, DynamicObject>) -> Vec<&DynamicObject> {
    live.values().filter(|o| is_post_delete_hook(o)).collect()
}

fn hook_health(obj: &DynamicObject, settings: &Settings) -> HealthStatusCode {
    resource_health(obj, settings)
        .map(|h| h.status)
        .unwrap_or(HealthStatusCode::Healthy)
}

/// Create missing hooks, then wait for them to finish.
///
/// Returns `Ok(false)` while hooks were just created or still progress.
/// Failed hooks are deleted so a fixed definition can run again, and the
/// failure is returned.
pub async fn execute_post_delete_hooks(
    executor: &dyn ResourceExecutor,
    settings: &Settings,
    app: &Application,
    instance: &str,
    revision: &str,
    targets: &[DynamicObject],
    live: &HashMap<ResourceKey, DynamicObject>,
) -> Result<bool> {
    let tracking = settings.tracking();
    let running: HashMap<ResourceKey, &DynamicObject> = live_hooks(live)
        .into_iter()
        .map(|o| (ResourceKey::from_object(o), o))
        .collect();

    let mut created = 0;
    for target in targets.iter().filter(|t| is_post_delete_hook(t)) {
        let mut hook = target.clone();
        if hook.metadata.name.as_deref().unwrap_or_default().is_empty() {
            let generate_name = hook.metadata.generate_name.clone().unwrap_or_default();
            hook.metadata.name = Some(post_delete_hook_name(&generate_name, revision, app));
        }
        if hook.namespace().unwrap_or_default().is_empty() {
            hook.metadata.namespace = Some(app.spec.destination.namespace().to_string());
        }
        if running.contains_key(&ResourceKey::from_object(&hook)) {
            continue;
        }
        tracking.set_app_instance(&mut hook, instance, true);
        info!(hook = %ResourceKey::from_object(&hook), "Creating post-delete hook");
        executor.create(&hook, false).await?;
        created += 1;
    }
    if created > 0 {
        return Ok(false);
    }

    let mut progressing = 0;
    let mut failed: Vec<&DynamicObject> = Vec::new();
    for hook in running.values() {
        match hook_health(hook, settings) {
            HealthStatusCode::Progressing => progressing += 1,
            HealthStatusCode::Degraded => failed.push(hook),
            _ => {}
        }
    }

    if !failed.is_empty() {
        let mut names = Vec::with_capacity(failed.len());
        for hook in failed {
            names.push(hook.name_any());
            let key = ResourceKey::from_object(hook);
            let (_, version) = group_version(hook);
            if let Err(e) = executor
                .delete(&key, &version, PropagationPolicy::Background, false)
                .await
            {
                if !e.is_not_found() {
                    warn!(hook = %key, error = %e, "Failed to delete failed post-delete hook");
                }
            }
        }
        names.sort();
        return Err(Error::SyncError(format!(
            "post-delete hook(s) failed: {}",
            names.join(", ")
        )));
    }
    Ok(progressing == 0)
}

/// Delete finished hooks according to their delete policy.
///
/// Returns `Ok(true)` once no hook deletion is pending.
pub async fn cleanup_post_delete_hooks(
    executor: &dyn ResourceExecutor,
    settings: &Settings,
    live: &HashMap<ResourceKey, DynamicObject>,
) -> Result<bool> {
    let mut pending = 0;
    for hook in live_hooks(live) {
        if hook.metadata.deletion_timestamp.is_some() {
            pending += 1;
            continue;
        }
        let health = hook_health(hook, settings);
        let policies = hook_delete_policies(hook);
        let delete = policies.iter().any(|p| match p {
            HookDeletePolicy::BeforeHookCreation => true,
            HookDeletePolicy::HookSucceeded => health == HealthStatusCode::Healthy,
            HookDeletePolicy::HookFailed => health == HealthStatusCode::Degraded,
        });
        if !delete {
            continue;
        }
        let key = ResourceKey::from_object(hook);
        let (_, version) = group_version(hook);
        info!(hook = %key, "Deleting post-delete hook");
        match executor
            .delete(&key, &version, PropagationPolicy::Background, false)
            .await
        {
            Ok(()) => pending += 1,
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(pending == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::fake::FakeCluster;
    use crate::crd::{ApplicationDestination, ApplicationSpec};
    use crate::resource::annotations::{ANNOTATION_HOOK, ANNOTATION_HOOK_DELETE_POLICY};
    use crate::resource::new_object;
    use serde_json::json;

    fn app() -> Application {
        Application::new(
            "guestbook",
            ApplicationSpec {
                destination: ApplicationDestination {
                    server: Some("https://kubernetes.default.svc".to_string()),
                    namespace: Some("web".to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
    }

    fn hook(name: &str, policy: Option<&str>) -> DynamicObject {
        let mut obj = new_object("batch/v1", "Job", "", name);
        obj.annotations_mut()
            .insert(ANNOTATION_HOOK.to_string(), "PostDelete".to_string());
        if let Some(p) = policy {
            obj.annotations_mut()
                .insert(ANNOTATION_HOOK_DELETE_POLICY.to_string(), p.to_string());
        }
        obj
    }

    fn with_condition(mut obj: DynamicObject, type_: &str) -> DynamicObject {
        obj.data["status"] = json!({"conditions": [{"type": type_, "status": "True"}]});
        obj
    }

    fn live_of(cluster: &FakeCluster) -> HashMap<ResourceKey, DynamicObject> {
        cluster
            .objects()
            .into_iter()
            .map(|o| (ResourceKey::from_object(&o), o))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_hooks_are_created_first() {
        let cluster = FakeCluster::new("https://kubernetes.default.svc");
        let settings = Settings::default();
        let done = execute_post_delete_hooks(
            &cluster,
            &settings,
            &app(),
            "guestbook",
            "abcdef123",
            &[hook("cleanup", None)],
            &HashMap::new(),
        )
        .await
        .unwrap();
        assert!(!done);
        let created = cluster
            .object(&ResourceKey::new("batch", "Job", "web", "cleanup"))
            .expect("hook created");
        assert_eq!(settings.tracking().app_name(&created).as_deref(), Some("guestbook"));
    }

    #[tokio::test]
    async fn test_progressing_hook_blocks() {
        let cluster = FakeCluster::new("https://kubernetes.default.svc");
        let mut running = hook("cleanup", None);
        running.metadata.namespace = Some("web".to_string());
        cluster.add_object(running);
        let done = execute_post_delete_hooks(
            &cluster,
            &Settings::default(),
            &app(),
            "guestbook",
            "abcdef123",
            &[hook("cleanup", None)],
            &live_of(&cluster),
        )
        .await
        .unwrap();
        assert!(!done);
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_failed_hook_is_deleted_and_reported() {
        let cluster = FakeCluster::new("https://kubernetes.default.svc");
        let mut failed = with_condition(hook("cleanup", None), "Failed");
        failed.metadata.namespace = Some("web".to_string());
        cluster.add_object(failed);
        let err = execute_post_delete_hooks(
            &cluster,
            &Settings::default(),
            &app(),
            "guestbook",
            "abcdef123",
            &[hook("cleanup", None)],
            &live_of(&cluster),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("post-delete hook(s) failed: cleanup"));
        assert!(cluster
            .object(&ResourceKey::new("batch", "Job", "web", "cleanup"))
            .is_none());
    }

    #[tokio::test]
    async fn test_completed_hooks_are_done() {
        let cluster = FakeCluster::new("https://kubernetes.default.svc");
        let mut done_hook = with_condition(hook("cleanup", None), "Complete");
        done_hook.metadata.namespace = Some("web".to_string());
        cluster.add_object(done_hook);
        let done = execute_post_delete_hooks(
            &cluster,
            &Settings::default(),
            &app(),
            "guestbook",
            "abcdef123",
            &[hook("cleanup", None)],
            &live_of(&cluster),
        )
        .await
        .unwrap();
        assert!(done);
    }

    #[tokio::test]
    async fn test_cleanup_respects_delete_policy() {
        let cluster = FakeCluster::new("https://kubernetes.default.svc");
        let mut keep_on_success = with_condition(hook("report", Some("HookFailed")), "Complete");
        keep_on_success.metadata.namespace = Some("web".to_string());
        let mut default_policy = with_condition(hook("cleanup", None), "Complete");
        default_policy.metadata.namespace = Some("web".to_string());
        cluster.add_object(keep_on_success);
        cluster.add_object(default_policy);

        let done = cleanup_post_delete_hooks(&cluster, &Settings::default(), &live_of(&cluster))
            .await
            .unwrap();
        assert!(!done, "a deletion was issued");
        assert!(cluster
            .object(&ResourceKey::new("batch", "Job", "web", "cleanup"))
            .is_none());
        assert!(cluster
            .object(&ResourceKey::new("batch", "Job", "web", "report"))
            .is_some());

        let done = cleanup_post_delete_hooks(&cluster, &Settings::default(), &live_of(&cluster))
            .await
            .unwrap();
        assert!(done);
    }

    #[test]
    fn test_generated_post_delete_name_is_stable() {
        let a = post_delete_hook_name("cleanup-", "ABCDEF1234", &app());
        let b = post_delete_hook_name("cleanup-", "ABCDEF1234", &app());
        assert_eq!(a, b);
        assert!(a.starts_with("cleanup-abcdef1-post-delete-"));
    }
}
