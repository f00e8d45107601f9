//! Unit tests for application state comparison.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::Duration;
    use kube::api::DynamicObject;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::clients::settings::FilteredResource;
    use crate::clients::{
        Cluster, FakeCluster, FakeConnector, Settings, StaticClusterRegistry,
        StaticManifestSource, StaticSettingsProvider,
    };
    use crate::controller::cache::{CacheEvent, ClusterTaintManager, LiveStateCache};
    use crate::controller::conditions::{
        find_condition, has_condition, CONDITION_COMPARISON_ERROR,
        CONDITION_EXCLUDED_RESOURCE_WARNING, CONDITION_REPEATED_RESOURCE_WARNING,
        CONDITION_INVALID_SPEC_ERROR, CONDITION_SHARED_RESOURCE_WARNING, CONDITION_UNKNOWN_ERROR,
    };
    use crate::controller::sharding::ClusterSharding;
    use crate::controller::state::{AppStateManager, ComparisonResult};
    use crate::crd::{
        AppProject, Application, ApplicationDestination, ApplicationSource, ApplicationSpec,
        HealthStatusCode, SyncStatusCode,
    };
    use crate::clients::projects::default_project;
    use crate::error::Error;
    use crate::resource::annotations::ANNOTATION_COMPARE_OPTIONS;
    use crate::resource::tracking::ResourceTracking;
    use crate::resource::{new_object, ResourceKey};

    const EAST: &str = "https://east.example.com";
    const WEST: &str = "https://west.example.com";

    const CONFIG_MAP: &str = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  color: blue
"#;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    struct Fixture {
        east: Arc<FakeCluster>,
        west: Arc<FakeCluster>,
        manifests: Arc<StaticManifestSource>,
        manager: AppStateManager,
        _events: mpsc::UnboundedReceiver<CacheEvent>,
    }

    fn cluster(name: &str, server: &str) -> Cluster {
        Cluster {
            id: name.to_string(),
            server: server.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    fn fixture_with(settings: Settings) -> Fixture {
        let east = Arc::new(FakeCluster::new(EAST));
        let west = Arc::new(FakeCluster::new(WEST));
        let connector = Arc::new(FakeConnector::new());
        connector.add(east.clone());
        connector.add(west.clone());
        let registry = Arc::new(StaticClusterRegistry::new(vec![
            cluster("east", EAST),
            cluster("west", WEST),
        ]));
        let (tx, rx) = mpsc::unbounded_channel();
        let settings = Arc::new(settings);
        let live = Arc::new(LiveStateCache::new(
            registry.clone(),
            connector.clone(),
            Arc::new(ClusterSharding::single()),
            Arc::new(ClusterTaintManager::new()),
            settings.clone(),
            tx,
        ));
        let manifests = Arc::new(StaticManifestSource::new());
        let manager = AppStateManager::new(
            manifests.clone(),
            live,
            registry,
            connector,
            Arc::new(StaticSettingsProvider::new((*settings).clone())),
            "driftwatch",
        );
        Fixture {
            east,
            west,
            manifests,
            manager,
            _events: rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(Settings::default())
    }

    fn app(name: &str, server: &str) -> Application {
        let mut app = Application::new(
            name,
            ApplicationSpec {
                source: Some(ApplicationSource {
                    repo_url: "https://git.example.com/deploy.git".to_string(),
                    path: Some(name.to_string()),
                    target_revision: Some("main".to_string()),
                    ..Default::default()
                }),
                destination: ApplicationDestination {
                    server: Some(server.to_string()),
                    namespace: Some("web".to_string()),
                    name: None,
                },
                ..Default::default()
            },
        );
        app.metadata.namespace = Some("driftwatch".to_string());
        app
    }

    fn project() -> AppProject {
        default_project("driftwatch")
    }

    fn tracked(app: &str, api_version: &str, kind: &str, name: &str) -> DynamicObject {
        let mut obj = new_object(api_version, kind, "web", name);
        ResourceTracking::default().set_app_instance(&mut obj, app, true);
        obj
    }

    fn settings_map(app: &str, color: &str) -> DynamicObject {
        let mut obj = tracked(app, "v1", "ConfigMap", "settings");
        obj.data["data"] = json!({ "color": color });
        obj
    }

    async fn compare(f: &Fixture, app: &Application) -> ComparisonResult {
        compare_with(f, app, false).await.unwrap()
    }

    async fn compare_with(
        f: &Fixture,
        app: &Application,
        no_revision_cache: bool,
    ) -> crate::error::Result<ComparisonResult> {
        compare_in(f, app, &project(), no_revision_cache).await
    }

    async fn compare_in(
        f: &Fixture,
        app: &Application,
        project: &AppProject,
        no_revision_cache: bool,
    ) -> crate::error::Result<ComparisonResult> {
        let sources = app.spec.get_sources();
        f.manager
            .compare_app_state(app, project, &[], &sources, false, no_revision_cache, None)
            .await
    }

    /// Project that only deploys into `web`
    fn web_only_project() -> AppProject {
        let mut project = project();
        project.spec.destinations = vec![ApplicationDestination {
            server: Some("*".to_string()),
            name: None,
            namespace: Some("web".to_string()),
        }];
        project
    }

    fn status_of<'a>(
        result: &'a ComparisonResult,
        kind: &str,
        name: &str,
    ) -> Option<&'a crate::crd::ResourceStatus> {
        result
            .resources
            .iter()
            .find(|r| r.kind == kind && r.name == name)
    }

    // -----------------------------------------------------------------------
    // Sync status
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_matching_live_state_is_synced() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "blue"));

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::Synced);
        assert_eq!(result.sync_status.revision.as_deref(), Some("rev-1"));
        assert_eq!(result.health.status, HealthStatusCode::Healthy);
        assert_eq!(result.source_type.as_deref(), Some("Directory"));
        assert!(result.conditions.is_empty());
        assert_eq!(
            status_of(&result, "ConfigMap", "settings").and_then(|r| r.status),
            Some(SyncStatusCode::Synced)
        );
    }

    #[tokio::test]
    async fn test_changed_field_is_out_of_sync() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "red"));

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::OutOfSync);
        let managed = &result.managed_resources[0];
        assert!(managed.diff.modified);
        assert!(managed.live.is_some());
    }

    #[tokio::test]
    async fn test_missing_deployment_is_out_of_sync_and_missing() {
        let f = fixture();
        f.manifests.set(
            "guestbook",
            "rev-1",
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: frontend
spec:
  replicas: 1
"#,
        );

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::OutOfSync);
        assert_eq!(result.health.status, HealthStatusCode::Missing);
        let status = status_of(&result, "Deployment", "frontend").unwrap();
        assert_eq!(status.namespace, "web");
        assert_eq!(
            status.health.as_ref().map(|h| h.status),
            Some(HealthStatusCode::Missing)
        );
    }

    #[tokio::test]
    async fn test_extraneous_resource_requires_pruning() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "blue"));
        f.east.add_object(tracked("guestbook", "v1", "ConfigMap", "leftover"));

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::OutOfSync);
        let leftover = status_of(&result, "ConfigMap", "leftover").unwrap();
        assert!(leftover.requires_pruning);
        assert_eq!(leftover.status, Some(SyncStatusCode::OutOfSync));
        // extras follow the targets
        assert_eq!(result.resources.last().map(|r| r.name.as_str()), Some("leftover"));
    }

    #[tokio::test]
    async fn test_ignore_extraneous_keeps_app_synced() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "blue"));
        let mut leftover = tracked("guestbook", "v1", "ConfigMap", "leftover");
        leftover.metadata.annotations.get_or_insert_with(Default::default).insert(
            ANNOTATION_COMPARE_OPTIONS.to_string(),
            "IgnoreExtraneous".to_string(),
        );
        f.east.add_object(leftover);

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::Synced);
        assert_eq!(
            status_of(&result, "ConfigMap", "leftover").and_then(|r| r.status),
            Some(SyncStatusCode::OutOfSync)
        );
    }

    #[tokio::test]
    async fn test_comparison_is_idempotent() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "red"));
        let app = app("guestbook", EAST);

        let first = compare(&f, &app).await;
        let second = compare(&f, &app).await;

        assert_eq!(first.sync_status, second.sync_status);
        assert_eq!(first.resources, second.resources);
        assert_eq!(first.health, second.health);
        assert!(f.east.mutations().is_empty());
    }

    // -----------------------------------------------------------------------
    // Targets
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_duplicate_targets_warn_and_last_wins() {
        let f = fixture();
        f.manifests.set(
            "guestbook",
            "rev-1",
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  color: blue
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
data:
  color: green
"#,
        );

        let result = compare(&f, &app("guestbook", EAST)).await;

        let warning = find_condition(&result.conditions, CONDITION_REPEATED_RESOURCE_WARNING)
            .expect("repeated resource warning");
        assert!(warning.message.contains("appeared 2 times"));
        assert_eq!(result.managed_resources.len(), 1);
        let target = result.managed_resources[0].target.as_ref().unwrap();
        assert_eq!(target.data["data"]["color"], "green");
    }

    #[tokio::test]
    async fn test_excluded_kind_is_dropped_with_warning() {
        let settings = Settings {
            resource_exclusions: vec![FilteredResource {
                kinds: vec!["ConfigMap".to_string()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let f = fixture_with(settings);
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);

        let result = compare(&f, &app("guestbook", EAST)).await;

        let warning = find_condition(&result.conditions, CONDITION_EXCLUDED_RESOURCE_WARNING)
            .expect("excluded resource warning");
        assert_eq!(
            warning.message,
            "Resource /ConfigMap settings is excluded in the settings"
        );
        assert!(result.resources.is_empty());
        assert_eq!(result.sync_status.status, SyncStatusCode::Synced);
    }

    #[tokio::test]
    async fn test_cluster_scoped_target_loses_namespace() {
        let f = fixture();
        f.manifests.set(
            "guestbook",
            "rev-1",
            r#"
apiVersion: rbac.authorization.k8s.io/v1
kind: ClusterRole
metadata:
  name: reader
  namespace: web
rules: []
"#,
        );

        let result = compare(&f, &app("guestbook", EAST)).await;

        let status = status_of(&result, "ClusterRole", "reader").unwrap();
        assert_eq!(status.namespace, "");
        assert_eq!(
            result.managed_resources[0].key,
            ResourceKey::new("rbac.authorization.k8s.io", "ClusterRole", "", "reader")
        );
    }

    #[tokio::test]
    async fn test_hooks_are_set_aside() {
        let f = fixture();
        f.manifests.set(
            "guestbook",
            "rev-1",
            r#"
apiVersion: batch/v1
kind: Job
metadata:
  name: migrate
  annotations:
    driftwatch.io/hook: PreSync
---
apiVersion: batch/v1
kind: Job
metadata:
  name: cleanup
  annotations:
    driftwatch.io/hook: PostDelete
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: scratch
  annotations:
    driftwatch.io/hook: Skip
"#,
        );

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.reconciliation.hooks.len(), 1);
        assert!(result.has_post_delete_hooks());
        assert!(result.resources.is_empty());
        assert_eq!(result.sync_status.status, SyncStatusCode::Synced);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_repo_error_is_swallowed_within_grace_period() {
        let f = fixture();
        f.manifests.set_unavailable("guestbook", "connection reset");
        let app = app("guestbook", EAST);

        let first = compare_with(&f, &app, false).await;
        assert!(matches!(first, Err(Error::RepoUnavailable(_))));
        let second = compare_with(&f, &app, false).await;
        assert!(matches!(second, Err(Error::RepoUnavailable(_))));

        // a hard refresh reports the failure right away
        let hard = compare_with(&f, &app, true).await.unwrap();
        assert_eq!(hard.sync_status.status, SyncStatusCode::Unknown);
        assert!(has_condition(&hard.conditions, CONDITION_COMPARISON_ERROR));
    }

    #[tokio::test]
    async fn test_repo_error_surfaces_after_grace_period() {
        let mut f = fixture();
        f.manager = f.manager.with_repo_error_grace(Duration::zero());
        f.manifests.set_unavailable("guestbook", "connection reset");
        let app = app("guestbook", EAST);

        assert!(compare_with(&f, &app, false).await.is_err());
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let result = compare_with(&f, &app, false).await.unwrap();
        assert_eq!(result.sync_status.status, SyncStatusCode::Unknown);
        let condition = find_condition(&result.conditions, CONDITION_COMPARISON_ERROR).unwrap();
        assert!(condition.message.starts_with("Failed to load target state"));

        // success resets the grace period
        f.manifests.set("guestbook", "rev-2", CONFIG_MAP);
        assert!(compare_with(&f, &app, false).await.is_ok());
        f.manifests.set_unavailable("guestbook", "connection reset");
        assert!(compare_with(&f, &app, false).await.is_err());
    }

    #[tokio::test]
    async fn test_live_state_failure_is_unknown() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.fail_discovery(Some("connection refused"));

        let result = compare(&f, &app("guestbook", EAST)).await;

        assert_eq!(result.sync_status.status, SyncStatusCode::Unknown);
        let condition = find_condition(&result.conditions, CONDITION_UNKNOWN_ERROR).unwrap();
        assert!(condition.message.starts_with("Failed to load live state"));
        assert!(result
            .resources
            .iter()
            .all(|r| r.status == Some(SyncStatusCode::Unknown)));
    }

    #[tokio::test]
    async fn test_unknown_destination_is_an_error() {
        let f = fixture();
        let result = compare_with(&f, &app("guestbook", "https://nowhere.example.com"), false).await;
        assert!(matches!(result, Err(Error::ValidationError(_))));
    }

    // -----------------------------------------------------------------------
    // Project permissions
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_target_in_denied_namespace_is_an_access_error() {
        let f = fixture();
        f.manifests.set(
            "guestbook",
            "rev-1",
            r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: vault
  namespace: secrets
data:
  token: hunter2
"#,
        );

        let result = compare_in(&f, &app("guestbook", EAST), &web_only_project(), false)
            .await
            .unwrap();

        let denied: Vec<_> = result
            .conditions
            .iter()
            .filter(|c| c.type_ == CONDITION_INVALID_SPEC_ERROR)
            .collect();
        assert_eq!(denied.len(), 1);
        assert_eq!(
            denied[0].message,
            "namespace secrets is not permitted in project 'default'"
        );
        assert_eq!(
            status_of(&result, "ConfigMap", "vault").and_then(|r| r.status),
            Some(SyncStatusCode::Unknown)
        );
    }

    #[tokio::test]
    async fn test_denied_live_object_is_reported_not_dropped_silently() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "blue"));
        let mut stray = new_object("v1", "ConfigMap", "secrets", "vault");
        ResourceTracking::default().set_app_instance(&mut stray, "guestbook", true);
        f.east.add_object(stray);

        let result = compare_in(&f, &app("guestbook", EAST), &web_only_project(), false)
            .await
            .unwrap();

        assert!(status_of(&result, "ConfigMap", "vault").is_none());
        let condition = find_condition(&result.conditions, CONDITION_INVALID_SPEC_ERROR)
            .expect("access error for live object");
        assert_eq!(
            condition.message,
            "namespace secrets is not permitted in project 'default'"
        );
    }

    // -----------------------------------------------------------------------
    // Shared resources
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_resource_tracked_by_other_app_is_shared() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("other", "blue"));

        let result = compare(&f, &app("guestbook", EAST)).await;

        let warning = find_condition(&result.conditions, CONDITION_SHARED_RESOURCE_WARNING)
            .expect("shared resource warning");
        assert_eq!(
            warning.message,
            "ConfigMap/settings is part of applications driftwatch/guestbook and other"
        );
    }

    #[tokio::test]
    async fn test_same_key_on_different_clusters_is_not_shared() {
        let f = fixture();
        f.manifests.set("east-app", "rev-1", CONFIG_MAP);
        f.manifests.set("west-app", "rev-1", CONFIG_MAP);
        let mut east_obj = settings_map("east-app", "blue");
        east_obj.metadata.uid = Some("east-uid".to_string());
        f.east.add_object(east_obj);
        let mut west_obj = settings_map("west-app", "blue");
        west_obj.metadata.uid = Some("west-uid".to_string());
        f.west.add_object(west_obj);

        let east = compare(&f, &app("east-app", EAST)).await;
        let west = compare(&f, &app("west-app", WEST)).await;

        assert!(!has_condition(&east.conditions, CONDITION_SHARED_RESOURCE_WARNING));
        assert!(!has_condition(&west.conditions, CONDITION_SHARED_RESOURCE_WARNING));
        assert_eq!(west.sync_status.status, SyncStatusCode::Synced);
    }

    #[tokio::test]
    async fn test_same_uid_claimed_by_two_apps_is_shared() {
        let f = fixture();
        f.manifests.set("east-app", "rev-1", CONFIG_MAP);
        f.manifests.set("west-app", "rev-1", CONFIG_MAP);
        let mut east_obj = settings_map("east-app", "blue");
        east_obj.metadata.uid = Some("same-uid".to_string());
        f.east.add_object(east_obj);
        let mut west_obj = settings_map("west-app", "blue");
        west_obj.metadata.uid = Some("same-uid".to_string());
        f.west.add_object(west_obj);

        compare(&f, &app("east-app", EAST)).await;
        let west = compare(&f, &app("west-app", WEST)).await;

        let warning = find_condition(&west.conditions, CONDITION_SHARED_RESOURCE_WARNING)
            .expect("shared resource warning");
        assert!(warning.message.contains("east-app"));
    }

    #[tokio::test]
    async fn test_forget_releases_claims() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(settings_map("guestbook", "blue"));
        let app = app("guestbook", EAST);

        compare(&f, &app).await;
        assert_eq!(f.manager.claims().claimed_keys("guestbook").len(), 1);
        assert!(f.manager.cache().managed_resources("driftwatch/guestbook").is_some());

        f.manager.forget(&app);
        assert!(f.manager.claims().claimed_keys("guestbook").is_empty());
        assert!(f.manager.cache().managed_resources("driftwatch/guestbook").is_none());
    }
}
