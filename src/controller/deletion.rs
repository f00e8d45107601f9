//! Cascaded deletion of an application's resources
//!
//! Each pass deletes the highest remaining sync wave and returns; the next
//! pass runs once the cluster cache reports the objects gone. Finalizers
//! are removed stage by stage so a restart resumes where it stopped.

use std::collections::HashMap;
use std::sync::Arc;

use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::finalizers::{
    cascaded_deletion, finalizers_patch, has_finalizer, propagation_policy, without,
    BACKGROUND_RESOURCES_FINALIZER, POST_DELETE_CLEANUP_FINALIZER, POST_DELETE_FINALIZER,
    RESOURCES_FINALIZER,
};
use super::project_cache::ProjectCache;
use super::state::{is_self_referenced_obj, resolve_destination, AppStateManager};
use super::sync::{cleanup_post_delete_hooks, execute_post_delete_hooks};
use crate::clients::{AppStore, Cluster, ResourceExecutor, Settings};
use crate::crd::{parse_time, AppProject, Application, API_GROUP, APPLICATION_KIND};
use crate::error::{Error, Result};
use crate::resource::annotations::{
    has_sync_option, is_helm_keep, sync_wave, ANNOTATION_DELETION_APPROVED,
    SYNC_OPTION_DELETE_DISABLED,
};
use crate::resource::tracking::ResourceTracking;
use crate::resource::{group_version, is_crd, kind_of, ResourceKey};

const CONTROLLER_FINALIZERS: &[&str] = &[
    RESOURCES_FINALIZER,
    BACKGROUND_RESOURCES_FINALIZER,
    POST_DELETE_FINALIZER,
    POST_DELETE_CLEANUP_FINALIZER,
];

/// Some resource asks for confirmation and the approval predates the deletion
fn awaiting_confirmation(app: &Application) -> bool {
    let requires = app
        .status
        .as_ref()
        .map(|s| s.resources.iter().any(|r| r.requires_deletion_confirmation))
        .unwrap_or(false);
    if !requires {
        return false;
    }
    let approved = app.annotation(ANNOTATION_DELETION_APPROVED).and_then(parse_time);
    match (approved, app.deletion_time()) {
        (Some(approved), Some(deleted)) => approved < deleted,
        _ => true,
    }
}

fn is_application_object(obj: &DynamicObject, app: &Application) -> bool {
    group_version(obj).0 == API_GROUP
        && kind_of(obj) == APPLICATION_KIND
        && obj.name_any() == app.name_any()
        && obj.namespace() == app.namespace()
}

/// Resources the application may delete on its way out
fn should_be_deleted(
    obj: &DynamicObject,
    app: &Application,
    instance: &str,
    tracking: &ResourceTracking,
) -> bool {
    !is_crd(obj)
        && !is_application_object(obj, app)
        && is_self_referenced_obj(Some(obj), None, instance, tracking)
        && !has_sync_option(obj, SYNC_OPTION_DELETE_DISABLED)
        && !is_helm_keep(obj)
}

/// Objects of the highest sync wave
fn highest_wave<'a>(objs: &[&'a DynamicObject]) -> Vec<&'a DynamicObject> {
    let Some(max) = objs.iter().map(|o| sync_wave(o)).max() else {
        return Vec::new();
    };
    objs.iter().copied().filter(|o| sync_wave(o) == max).collect()
}

async fn executor_for(
    manager: &AppStateManager,
    settings: &Settings,
    project: &AppProject,
    cluster: &Cluster,
    namespace: &str,
) -> Result<Arc<dyn ResourceExecutor>> {
    let impersonate = if settings.impersonation_enabled {
        Some(
            project
                .spec
                .destination_service_account(&cluster.server, namespace)
                .ok_or_else(|| {
                    Error::PermissionDenied(
                        "failed to find a matching service account to impersonate".to_string(),
                    )
                })?,
        )
    } else {
        None
    };
    manager
        .connector()
        .executor(cluster, impersonate.as_deref())
        .await
}

/// Live objects of the application the project lets it touch
async fn permitted_live_objects(
    manager: &AppStateManager,
    app: &Application,
    project: &AppProject,
    cluster: &Cluster,
    instance: &str,
    executor: &dyn ResourceExecutor,
) -> Result<HashMap<ResourceKey, DynamicObject>> {
    let mut live = manager
        .live()
        .get_managed_live_objs(app, instance, &cluster.server, &mut [], executor)
        .await?;
    live.retain(|key, _| {
        let namespaced = !key.namespace.is_empty();
        project.spec.is_group_kind_permitted(&key.group, &key.kind, namespaced)
            && (!namespaced
                || project
                    .spec
                    .is_destination_permitted(&cluster.server, &cluster.name, &key.namespace))
    });
    Ok(live)
}

async fn patch_finalizers(apps: &dyn AppStore, app: &Application, finalizers: &[String]) -> Result<Application> {
    let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
    apps.patch(&ns, &name, &finalizers_patch(finalizers)).await
}

/// Advance the deletion of `app` by one step.
///
/// Returns true once none of the controller's finalizers remain, meaning
/// the application is released.
#[instrument(skip_all, fields(app = %app.qualified_name()))]
pub async fn finalize_application_deletion(
    apps: &dyn AppStore,
    projects: &ProjectCache,
    manager: &AppStateManager,
    app: &Application,
) -> Result<bool> {
    let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
    let mut app = match apps.get(&ns, &name).await {
        Ok(app) => app,
        Err(e) if e.is_not_found() => return Ok(false),
        Err(e) => return Err(e),
    };
    info!("Deleting resources");
    let project = projects.get(app.spec.project_name()).await?;

    if cascaded_deletion(&app) && awaiting_confirmation(&app) {
        info!("Deletion of some resources requires confirmation");
        return Ok(false);
    }

    let cluster = match resolve_destination(manager.registry().as_ref(), &app.spec.destination).await {
        Ok(cluster) => cluster,
        Err(e) if e.is_retriable() => return Err(e),
        Err(e) => {
            warn!(error = %e, "Unable to get destination cluster");
            let remaining: Vec<String> = app
                .finalizers()
                .iter()
                .filter(|f| !CONTROLLER_FINALIZERS.contains(&f.as_str()))
                .cloned()
                .collect();
            patch_finalizers(apps, &app, &remaining).await?;
            info!("Resource entries removed from undefined cluster");
            return Ok(true);
        }
    };

    let settings = manager.settings_provider().settings().await?;
    let destination_ns = app.spec.destination.namespace().to_string();
    let executor = executor_for(manager, &settings, &project, &cluster, &destination_ns).await?;
    let instance = app.instance_name(manager.namespace());
    let tracking = settings.tracking();

    if cascaded_deletion(&app) {
        let live =
            permitted_live_objects(manager, &app, &project, &cluster, &instance, executor.as_ref())
                .await?;
        if live.values().any(|o| o.metadata.deletion_timestamp.is_some()) {
            info!(remaining = live.len(), "Waiting for resources to be deleted");
            return Ok(false);
        }

        let candidates: Vec<&DynamicObject> = live
            .values()
            .filter(|o| should_be_deleted(o, &app, &instance, &tracking))
            .collect();
        if !candidates.is_empty() {
            manager.cache().remove(&app.qualified_name());
        }
        let wave = highest_wave(&candidates);
        let policy = propagation_policy(&app);
        info!(count = wave.len(), ?policy, "Deleting application's resources");
        for obj in &wave {
            let key = ResourceKey::from_object(obj);
            let (_, version) = group_version(obj);
            match executor.delete(&key, &version, policy, false).await {
                Ok(()) => debug!(resource = %key, "Deleted resource"),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        let remaining =
            permitted_live_objects(manager, &app, &project, &cluster, &instance, executor.as_ref())
                .await?
                .values()
                .filter(|o| should_be_deleted(o, &app, &instance, &tracking))
                .count();
        if remaining > 0 {
            info!(remaining, "Resources remaining for deletion");
            return Ok(false);
        }

        let finalizers: Vec<String> = without(&app, RESOURCES_FINALIZER)
            .into_iter()
            .filter(|f| f != BACKGROUND_RESOURCES_FINALIZER)
            .collect();
        app = patch_finalizers(apps, &app, &finalizers).await?;
        info!(deleted = candidates.len(), "Successfully deleted resources");
    }

    if has_finalizer(&app, POST_DELETE_FINALIZER) {
        let live =
            permitted_live_objects(manager, &app, &project, &cluster, &instance, executor.as_ref())
                .await?;
        let sources = app.spec.get_sources();
        let comparison = manager
            .compare_app_state(&app, &project, &[], &sources, false, false, None)
            .await?;
        let revision = app
            .status
            .as_ref()
            .and_then(|s| s.sync.revision.clone())
            .unwrap_or_default();
        let done = execute_post_delete_hooks(
            executor.as_ref(),
            &settings,
            &app,
            &instance,
            &revision,
            &comparison.post_delete_hooks,
            &live,
        )
        .await?;
        if !done {
            info!("Waiting for post-delete hooks");
            return Ok(false);
        }
        app = patch_finalizers(apps, &app, &without(&app, POST_DELETE_FINALIZER)).await?;
    }

    if has_finalizer(&app, POST_DELETE_CLEANUP_FINALIZER) {
        let live =
            permitted_live_objects(manager, &app, &project, &cluster, &instance, executor.as_ref())
                .await?;
        if !cleanup_post_delete_hooks(executor.as_ref(), &settings, &live).await? {
            info!("Waiting for post-delete hooks to be cleaned up");
            return Ok(false);
        }
        app = patch_finalizers(apps, &app, &without(&app, POST_DELETE_CLEANUP_FINALIZER)).await?;
    }

    let released = !app
        .finalizers()
        .iter()
        .any(|f| CONTROLLER_FINALIZERS.contains(&f.as_str()));
    Ok(released)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ApplicationSpec, ApplicationStatus, ResourceStatus};
    use crate::resource::annotations::{ANNOTATION_SYNC_OPTIONS, ANNOTATION_SYNC_WAVE};
    use crate::resource::new_object;
    use chrono::{Duration, TimeZone, Utc};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn tracked(name: &str, wave: Option<&str>) -> DynamicObject {
        let mut obj = new_object("v1", "ConfigMap", "web", name);
        ResourceTracking::default().set_app_instance(&mut obj, "guestbook", true);
        if let Some(wave) = wave {
            obj.annotations_mut()
                .insert(ANNOTATION_SYNC_WAVE.to_string(), wave.to_string());
        }
        obj
    }

    fn deleting_app(confirmation: bool, approved: Option<&str>) -> Application {
        let mut app = Application::new("guestbook", ApplicationSpec::default());
        app.metadata.namespace = Some("driftwatch".to_string());
        app.metadata.deletion_timestamp =
            Some(Time(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        if let Some(approved) = approved {
            app.annotations_mut()
                .insert(ANNOTATION_DELETION_APPROVED.to_string(), approved.to_string());
        }
        app.status = Some(ApplicationStatus {
            resources: vec![ResourceStatus {
                kind: "ConfigMap".to_string(),
                name: "settings".to_string(),
                requires_deletion_confirmation: confirmation,
                ..Default::default()
            }],
            ..Default::default()
        });
        app
    }

    #[test]
    fn test_confirmation_gate() {
        assert!(!awaiting_confirmation(&deleting_app(false, None)));
        assert!(awaiting_confirmation(&deleting_app(true, None)));
        assert!(awaiting_confirmation(&deleting_app(true, Some("2024-05-01T11:00:00Z"))));
        assert!(!awaiting_confirmation(&deleting_app(true, Some("2024-05-01T12:00:00Z"))));
    }

    #[test]
    fn test_highest_wave_only() {
        let first = tracked("first", Some("-1"));
        let plain = tracked("plain", None);
        let last = tracked("last", Some("5"));
        let also_last = tracked("also-last", Some("5"));
        let objs = vec![&first, &plain, &last, &also_last];
        let mut names: Vec<String> = highest_wave(&objs).iter().map(|o| o.name_any()).collect();
        names.sort();
        assert_eq!(names, vec!["also-last", "last"]);
        assert!(highest_wave(&[]).is_empty());
    }

    #[test]
    fn test_kept_resources_are_not_deleted() {
        let app = deleting_app(false, None);
        let tracking = ResourceTracking::default();
        assert!(should_be_deleted(&tracked("settings", None), &app, "guestbook", &tracking));

        let mut disabled = tracked("settings", None);
        disabled
            .annotations_mut()
            .insert(ANNOTATION_SYNC_OPTIONS.to_string(), SYNC_OPTION_DELETE_DISABLED.to_string());
        assert!(!should_be_deleted(&disabled, &app, "guestbook", &tracking));

        let mut crd = new_object(
            "apiextensions.k8s.io/v1",
            "CustomResourceDefinition",
            "",
            "widgets.example.com",
        );
        ResourceTracking::default().set_app_instance(&mut crd, "guestbook", true);
        assert!(!should_be_deleted(&crd, &app, "guestbook", &tracking));
    }

    #[test]
    fn test_deletion_time_is_used_for_approval() {
        let mut app = deleting_app(true, None);
        let later = app.deletion_time().unwrap() + Duration::minutes(5);
        app.annotations_mut().insert(
            ANNOTATION_DELETION_APPROVED.to_string(),
            crate::crd::format_time(later),
        );
        assert!(!awaiting_confirmation(&app));
    }
}
