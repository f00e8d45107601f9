//! Unit tests for the application controller queues and handlers.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use async_trait::async_trait;
    use chrono::Utc;
    use futures::stream::{self, BoxStream};
    use futures::StreamExt;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::api::DynamicObject;
    use kube::ResourceExt;
    use serde_json::json;
    use tokio::sync::mpsc;

    use crate::clients::{
        AppStore, Cluster, EventType, ExecutorCall, FakeCluster, FakeConnector, InMemoryAppStore,
        ObjectEvent, ProjectStore, Settings, StaticClusterRegistry, StaticManifestSource,
        StaticProjectStore, StaticSettingsProvider,
    };
    use crate::controller::appcontroller::{ApplicationController, ControllerConfig};
    use crate::controller::cache::{CacheEvent, ClusterTaintManager, LiveStateCache};
    use crate::controller::conditions::{
        find_condition, has_condition, CONDITION_DELETION_ERROR, CONDITION_INVALID_SPEC_ERROR,
    };
    use crate::controller::finalizers::{project_has_finalizer, RESOURCES_FINALIZER};
    use crate::controller::refresh::{comparison_key, CompareWith};
    use crate::controller::sharding::ClusterSharding;
    use crate::controller::state::AppStateManager;
    use crate::crd::{
        format_time, AppProject, AppProjectSpec, Application, ApplicationDestination,
        ApplicationSource, ApplicationSpec, ApplicationStatus, Operation, OperationPhase,
        OperationState, ResourceStatus, SyncOperation, SyncOperationResult, SyncPolicy,
        SyncPolicyAutomated, SyncStatusCode, API_GROUP, APPLICATION_KIND,
    };
    use crate::resource::annotations::{ANNOTATION_SKIP_RECONCILE, ANNOTATION_SYNC_WAVE};
    use crate::resource::tracking::ResourceTracking;
    use crate::resource::{new_object, ResourceKey};

    const EAST: &str = "https://east.example.com";
    const KEY: &str = "driftwatch/guestbook";

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
        manifests: Arc<StaticManifestSource>,
        apps: Arc<InMemoryAppStore>,
        projects: Arc<StaticProjectStore>,
        controller: ApplicationController,
        state: Arc<AppStateManager>,
        sharding: Arc<ClusterSharding>,
        _events: mpsc::UnboundedReceiver<CacheEvent>,
    }

    /// Project store whose every read panics
    struct BrokenProjectStore;

    #[async_trait]
    impl ProjectStore for BrokenProjectStore {
        async fn get(&self, _name: &str) -> crate::error::Result<AppProject> {
            panic!("project store unavailable")
        }

        async fn list(&self) -> crate::error::Result<Vec<AppProject>> {
            panic!("project store unavailable")
        }

        fn watch(&self) -> BoxStream<'static, crate::error::Result<ObjectEvent<AppProject>>> {
            stream::empty().boxed()
        }
    }

    fn broken_controller(f: &Fixture) -> ApplicationController {
        ApplicationController::new(
            ControllerConfig::default(),
            f.apps.clone(),
            Arc::new(BrokenProjectStore),
            f.state.clone(),
            f.sharding.clone(),
        )
    }

    fn fixture() -> Fixture {
        let east = Arc::new(FakeCluster::new(EAST));
        let connector = Arc::new(FakeConnector::new());
        connector.add(east.clone());
        let registry = Arc::new(StaticClusterRegistry::new(vec![Cluster {
            id: "east".to_string(),
            server: EAST.to_string(),
            name: "east".to_string(),
            ..Default::default()
        }]));
        let sharding = Arc::new(ClusterSharding::single());
        let settings = Arc::new(Settings::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let live = Arc::new(LiveStateCache::new(
            registry.clone(),
            connector.clone(),
            sharding.clone(),
            Arc::new(ClusterTaintManager::new()),
            settings.clone(),
            tx,
        ));
        let manifests = Arc::new(StaticManifestSource::new());
        let state = Arc::new(AppStateManager::new(
            manifests.clone(),
            live,
            registry,
            connector,
            Arc::new(StaticSettingsProvider::new((*settings).clone())),
            "driftwatch",
        ));
        let apps = Arc::new(InMemoryAppStore::new());
        let projects = Arc::new(StaticProjectStore::new("driftwatch"));
        let config = ControllerConfig {
            resync_jitter: StdDuration::ZERO,
            ..Default::default()
        };
        let controller = ApplicationController::new(
            config,
            apps.clone(),
            projects.clone(),
            state.clone(),
            sharding.clone(),
        );
        Fixture {
            east,
            manifests,
            apps,
            projects,
            controller,
            state,
            sharding,
            _events: rx,
        }
    }

    fn app() -> Application {
        let mut app = Application::new(
            "guestbook",
            ApplicationSpec {
                source: Some(ApplicationSource {
                    repo_url: "https://git.example.com/deploy.git".to_string(),
                    path: Some("guestbook".to_string()),
                    target_revision: Some("main".to_string()),
                    ..Default::default()
                }),
                destination: ApplicationDestination {
                    server: Some(EAST.to_string()),
                    namespace: Some("web".to_string()),
                    name: None,
                },
                ..Default::default()
            },
        );
        app.metadata.namespace = Some("driftwatch".to_string());
        app
    }

    fn automated(mut app: Application, self_heal: bool) -> Application {
        app.spec.sync_policy = Some(SyncPolicy {
            automated: Some(SyncPolicyAutomated {
                prune: true,
                self_heal,
                ..Default::default()
            }),
            ..Default::default()
        });
        app
    }

    fn deleting(mut app: Application, requires_confirmation: bool) -> Application {
        app.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.to_string()]);
        app.metadata.deletion_timestamp = Some(Time(Utc::now()));
        app.status = Some(ApplicationStatus {
            resources: vec![ResourceStatus {
                version: "v1".to_string(),
                kind: "ConfigMap".to_string(),
                namespace: "web".to_string(),
                name: "settings".to_string(),
                requires_deletion_confirmation: requires_confirmation,
                ..Default::default()
            }],
            ..Default::default()
        });
        app
    }

    fn tracked(name: &str, color: &str) -> DynamicObject {
        let mut obj = new_object("v1", "ConfigMap", "web", name);
        ResourceTracking::default().set_app_instance(&mut obj, "guestbook", true);
        obj.data["data"] = json!({ "color": color });
        obj
    }

    async fn stored(f: &Fixture) -> Application {
        f.apps.get("driftwatch", "guestbook").await.unwrap()
    }

    async fn settle() {
        tokio::time::sleep(StdDuration::from_millis(50)).await;
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_out_of_sync_automated_app_starts_one_operation() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(tracked("settings", "red"));
        f.apps.insert(automated(app(), false));

        f.controller.process_app_refresh(KEY).await;
        settle().await;

        assert_eq!(f.controller.operation_queue().pending(), vec![KEY.to_string()]);
        let app = stored(&f).await;
        let sync = app.operation.and_then(|o| o.sync).expect("operation requested");
        assert!(sync.prune);
        assert_eq!(sync.revision.as_deref(), Some("rev-1"));
        let status = app.status.unwrap();
        assert_eq!(status.sync.status, SyncStatusCode::OutOfSync);
        assert!(status.reconciled_at.is_some());
        assert!(f
            .apps
            .events()
            .iter()
            .any(|e| e.reason == "OperationStarted" && e.message.contains("rev-1")));
    }

    #[tokio::test]
    async fn test_refresh_at_recent_level_is_idempotent() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(tracked("settings", "blue"));
        f.apps.insert(app());

        f.controller.process_app_refresh(KEY).await;
        let patches = f.apps.patches().len();
        assert!(patches > 0, "first refresh persists status");
        assert_eq!(stored(&f).await.status.unwrap().sync.status, SyncStatusCode::Synced);

        f.controller.refresh_requests().request(KEY, CompareWith::Recent);
        f.controller.process_app_refresh(KEY).await;

        assert_eq!(f.apps.patches().len(), patches);
        assert_eq!(f.controller.refresh_requests().peek(KEY), None);
    }

    #[tokio::test]
    async fn test_self_heal_waits_for_backoff() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        f.east.add_object(tracked("settings", "red"));
        let mut app = automated(app(), true);
        app.status = Some(ApplicationStatus {
            operation_state: Some(OperationState {
                operation: Operation {
                    sync: Some(SyncOperation {
                        self_heal_attempts_count: 1,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                phase: OperationPhase::Succeeded,
                sync_result: Some(SyncOperationResult {
                    revision: "rev-1".to_string(),
                    source: app.spec.source.clone(),
                    ..Default::default()
                }),
                started_at: format_time(Utc::now()),
                finished_at: Some(format_time(Utc::now())),
                ..Default::default()
            }),
            ..Default::default()
        });
        f.apps.insert(app);

        f.controller.process_app_refresh(KEY).await;

        let app = stored(&f).await;
        assert!(app.operation.is_none(), "self-heal deferred");
        assert!(!f.apps.patches().iter().any(|(_, p)| p.get("operation").is_some()));
        assert_eq!(app.status.unwrap().sync.status, SyncStatusCode::OutOfSync);
    }

    #[tokio::test]
    async fn test_refresh_always_requeues_operation() {
        let f = fixture();

        f.controller.process_app_refresh(KEY).await;
        settle().await;

        assert_eq!(f.controller.operation_queue().pending(), vec![KEY.to_string()]);
        assert!(f.apps.patches().is_empty());
    }

    #[tokio::test]
    async fn test_skip_reconcile_annotation() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        let mut app = app();
        app.annotations_mut()
            .insert(ANNOTATION_SKIP_RECONCILE.to_string(), "true".to_string());
        f.apps.insert(app.clone());
        assert!(!f.controller.can_process_app(&app).await);

        f.controller.process_app_refresh(KEY).await;
        assert!(f.apps.patches().is_empty());

        app.annotations_mut()
            .insert(ANNOTATION_SKIP_RECONCILE.to_string(), "no".to_string());
        assert!(f.controller.can_process_app(&app).await, "unparsable value is ignored");
    }

    #[tokio::test]
    async fn test_missing_project_reports_invalid_spec() {
        let f = fixture();
        f.manifests.set("guestbook", "rev-1", CONFIG_MAP);
        let mut app = app();
        app.spec.project = "missing".to_string();
        f.apps.insert(app);

        f.controller.process_app_refresh(KEY).await;

        let status = stored(&f).await.status.unwrap();
        assert!(has_condition(&status.conditions, CONDITION_INVALID_SPEC_ERROR));
        assert_eq!(status.sync.status, SyncStatusCode::Unknown);
        assert!(f.manifests.calls().is_empty(), "no comparison without a project");
    }

    #[tokio::test]
    async fn test_namespace_allow_list() {
        let mut f = fixture();
        assert!(f.controller.is_namespace_allowed("driftwatch"));
        assert!(!f.controller.is_namespace_allowed("team-a"));

        let config = ControllerConfig {
            application_namespaces: vec!["team-*".to_string()],
            ..Default::default()
        };
        f.controller = ApplicationController::new(
            config,
            f.apps.clone(),
            f.projects.clone(),
            f.controller.state().clone(),
            Arc::new(ClusterSharding::single()),
        );
        assert!(f.controller.is_namespace_allowed("team-a"));
        assert!(!f.controller.is_namespace_allowed("other"));
    }

    // -----------------------------------------------------------------------
    // Comparison queue and live resource events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_comparison_item_raises_refresh_level() {
        let f = fixture();
        f.controller
            .process_comparison_item(&comparison_key(KEY, CompareWith::Latest));
        assert_eq!(f.controller.refresh_requests().peek(KEY), Some(CompareWith::Latest));

        f.controller
            .process_comparison_item(&comparison_key(KEY, CompareWith::Recent));
        assert_eq!(f.controller.refresh_requests().peek(KEY), Some(CompareWith::Latest));

        settle().await;
        assert_eq!(f.controller.refresh_queue().pending(), vec![KEY.to_string()]);
    }

    #[tokio::test]
    async fn test_delayed_level_request_goes_through_comparison_queue() {
        let f = fixture();
        f.controller
            .request_app_refresh(KEY, Some(CompareWith::Latest), Some(StdDuration::from_millis(10)));
        assert_eq!(f.controller.refresh_requests().peek(KEY), None);

        settle().await;
        assert_eq!(
            f.controller.comparison_queue().pending(),
            vec![comparison_key(KEY, CompareWith::Latest)]
        );
    }

    #[tokio::test]
    async fn test_resource_update_refreshes_owner() {
        let f = fixture();
        f.controller
            .handle_app_event(ObjectEvent::Applied(app()))
            .await;

        let own = ResourceKey::new(API_GROUP, APPLICATION_KIND, "driftwatch", "guestbook");
        f.controller
            .handle_object_updated(&own, &["guestbook".to_string()], true)
            .await;
        assert_eq!(f.controller.refresh_requests().peek(KEY), None);

        let cm = ResourceKey::new("", "ConfigMap", "web", "settings");
        f.controller
            .handle_object_updated(&cm, &["guestbook".to_string()], false)
            .await;
        assert_eq!(f.controller.refresh_requests().peek(KEY), Some(CompareWith::Nothing));

        f.controller
            .handle_object_updated(&cm, &["guestbook".to_string()], true)
            .await;
        assert_eq!(f.controller.refresh_requests().peek(KEY), Some(CompareWith::Recent));
    }

    #[tokio::test]
    async fn test_unknown_owner_is_ignored() {
        let f = fixture();
        let cm = ResourceKey::new("", "ConfigMap", "web", "settings");
        f.controller
            .handle_object_updated(&cm, &["other".to_string()], true)
            .await;
        assert_eq!(f.controller.refresh_requests().peek("driftwatch/other"), None);
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_operation_without_project_fails() {
        let f = fixture();
        let mut app = app();
        app.spec.project = "missing".to_string();
        app.operation = Some(Operation {
            sync: Some(SyncOperation::default()),
            ..Default::default()
        });
        f.apps.insert(app);

        f.controller.process_app_operation(KEY).await;

        let app = stored(&f).await;
        assert!(app.operation.is_none(), "completed operation is cleared");
        let state = app.status.unwrap().operation_state.unwrap();
        assert_eq!(state.phase, OperationPhase::Error);
        assert!(state.message.starts_with("Failed to load application project"));
        assert!(state.finished_at.is_some());
        assert!(f.apps.events().iter().any(|e| {
            e.reason == "OperationCompleted"
                && e.event_type == EventType::Warning
                && e.message.starts_with("Sync operation failed")
        }));
        settle().await;
        assert_eq!(f.controller.refresh_queue().pending(), vec![KEY.to_string()]);
        assert_eq!(
            f.controller.refresh_requests().peek(KEY),
            Some(CompareWith::LatestForceResolve)
        );
    }

    #[tokio::test]
    async fn test_panic_during_operation_becomes_error_state() {
        let f = fixture();
        let mut app = app();
        app.operation = Some(Operation {
            sync: Some(SyncOperation::default()),
            ..Default::default()
        });
        f.apps.insert(app);

        broken_controller(&f).process_app_operation(KEY).await;

        let app = stored(&f).await;
        assert!(app.operation.is_none(), "errored operation is cleared");
        let state = app.status.unwrap().operation_state.unwrap();
        assert_eq!(state.phase, OperationPhase::Error);
        assert_eq!(state.message, "project store unavailable");
        assert!(state.finished_at.is_some());
    }

    // -----------------------------------------------------------------------
    // Deletion
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_deletion_waits_for_confirmation() {
        let f = fixture();
        f.east.add_object(tracked("settings", "blue"));
        f.apps.insert(deleting(app(), true));

        f.controller.process_app_operation(KEY).await;

        assert!(f.apps.patches().is_empty());
        assert!(f.east.mutations().is_empty());
        assert!(f.controller.project_queue().is_empty());
    }

    #[tokio::test]
    async fn test_deletion_with_no_resources_clears_finalizer() {
        let f = fixture();
        f.apps.insert(deleting(app(), false));

        f.controller.process_app_operation(KEY).await;

        assert_eq!(
            f.apps.patches(),
            vec![(KEY.to_string(), json!({"metadata": {"finalizers": []}}))]
        );
        assert_eq!(f.controller.project_queue().pending(), vec!["default".to_string()]);
    }

    #[tokio::test]
    async fn test_deletion_removes_highest_wave_first() {
        let f = fixture();
        f.east.add_object(tracked("settings", "blue"));
        let mut late = tracked("late", "blue");
        late.annotations_mut()
            .insert(ANNOTATION_SYNC_WAVE.to_string(), "3".to_string());
        f.east.add_object(late);
        f.apps.insert(deleting(app(), false));

        f.controller.process_app_operation(KEY).await;

        let deleted: Vec<String> = f
            .east
            .mutations()
            .into_iter()
            .filter_map(|call| match call {
                ExecutorCall::Delete { key, dry_run: false, .. } => Some(key.name),
                _ => None,
            })
            .collect();
        assert_eq!(deleted, vec!["late".to_string()]);
        assert!(f.apps.patches().is_empty(), "finalizer kept while resources remain");
    }

    #[tokio::test]
    async fn test_panic_during_deletion_sets_deletion_error() {
        let f = fixture();
        f.apps.insert(deleting(app(), false));

        broken_controller(&f).process_app_operation(KEY).await;

        let app = stored(&f).await;
        let condition = find_condition(&app.status.unwrap().conditions, CONDITION_DELETION_ERROR)
            .cloned()
            .expect("deletion error condition");
        assert_eq!(condition.message, "project store unavailable");
        assert_eq!(app.metadata.finalizers, Some(vec![RESOURCES_FINALIZER.to_string()]));
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    fn deleted_project(name: &str) -> AppProject {
        let mut project = AppProject::new(name, AppProjectSpec::default());
        project.metadata.namespace = Some("driftwatch".to_string());
        project.metadata.finalizers = Some(vec![RESOURCES_FINALIZER.to_string()]);
        project.metadata.deletion_timestamp = Some(Time(Utc::now()));
        project
    }

    #[tokio::test]
    async fn test_project_finalizer_kept_while_referenced() {
        let f = fixture();
        let project = deleted_project("team");
        assert!(project_has_finalizer(&project));
        f.projects.put(project);
        let mut app = app();
        app.spec.project = "team".to_string();
        f.apps.insert(app);

        f.controller.process_project_item("team").await.unwrap();
        assert!(f.apps.project_patches().is_empty());

        f.apps.remove("driftwatch", "guestbook");
        f.controller.process_project_item("team").await.unwrap();
        assert_eq!(
            f.apps.project_patches().get("driftwatch/team"),
            Some(&json!({"metadata": {"finalizers": []}}))
        );
    }

    #[tokio::test]
    async fn test_live_project_is_left_alone() {
        let f = fixture();
        let mut project = deleted_project("team");
        project.metadata.deletion_timestamp = None;
        f.projects.put(project);

        f.controller.process_project_item("team").await.unwrap();
        f.controller.process_project_item("absent").await.unwrap();
        assert!(f.apps.project_patches().is_empty());
    }
}
