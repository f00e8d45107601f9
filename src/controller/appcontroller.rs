//! Application controller
//!
//! Four work queues drive the controller:
//! - the refresh queue recomputes application status,
//! - the comparison queue raises the refresh level of delayed requests,
//! - the operation queue runs sync operations and deletion,
//! - the project queue releases deleted projects.
//!
//! Watch events, cluster cache events and a periodic resync feed the queues;
//! a fixed number of workers drain them. A key is never processed by two
//! workers of the same queue at once.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::{FutureExt, StreamExt};
use kube::ResourceExt;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::autosync::{
    auto_sync_decision, initiated_message, AutoSyncDecision, SelfHealConfig,
    AUTO_SYNC_CONDITION_TYPES,
};
use super::cache::CacheEvent;
use super::conditions::{
    comparison_error, find_condition, invalid_spec_error, set_conditions, sync_error,
    COMPARISON_CONDITION_TYPES, CONDITION_DELETION_ERROR, CONDITION_ORPHANED_RESOURCE_WARNING,
    CONDITION_UNKNOWN_ERROR,
    SPEC_CONDITION_TYPES,
};
use super::deletion::finalize_application_deletion;
use super::diff::create_merge_patch;
use super::finalizers::{
    finalizers_patch, project_has_finalizer, project_without_finalizer,
    reconcile_post_delete_finalizers,
};
use super::project_cache::ProjectCache;
use super::queue::WorkQueue;
use super::refresh::{
    comparison_key, need_refresh, parse_comparison_key, validate_permissions, CompareWith,
    RefreshRequests, RefreshType,
};
use super::sharding::ClusterSharding;
use super::state::{resolve_destination, AppStateManager, ComparisonResult};
use super::sync::windows::{can_sync, matching_windows};
use super::sync::{begin_retry, push_history, schedule_retry, OperationStage};
use super::tree::build_app_tree;
use crate::clients::{AppStore, EventType, ObjectEvent, ProjectStore};
use crate::crd::{
    format_time, AppProject, Application, ApplicationCondition, ApplicationStatus,
    HealthStatusCode, Operation, OperationPhase, OperationState, RevisionHistory, SyncStatusCode,
    API_GROUP, APPLICATION_KIND,
};
use crate::error::{Error, Result};
use crate::resource::annotations::{ANNOTATION_REFRESH, ANNOTATION_SKIP_RECONCILE};
use crate::resource::tracking::parse_instance_name;
use crate::resource::ResourceKey;

#[cfg(feature = "metrics")]
use super::metrics;

pub const DEFAULT_STATUS_PROCESSORS: usize = 20;
pub const DEFAULT_OPERATION_PROCESSORS: usize = 10;
pub const DEFAULT_RESYNC_PERIOD_SECS: i64 = 180;
pub const DEFAULT_RESYNC_JITTER_SECS: u64 = 60;

pub const REFRESH_QUEUE: &str = "app_reconciliation_queue";
pub const COMPARISON_QUEUE: &str = "app_comparison_type_queue";
pub const OPERATION_QUEUE: &str = "app_operation_processing_queue";
pub const PROJECT_QUEUE: &str = "project_reconciliation_queue";

const REASON_RESOURCE_UPDATED: &str = "ResourceUpdated";
const REASON_OPERATION_STARTED: &str = "OperationStarted";
const REASON_OPERATION_COMPLETED: &str = "OperationCompleted";
const REASON_STATUS_REFRESHED: &str = "StatusRefreshed";

#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Namespace the controller runs in
    pub namespace: String,
    /// Glob patterns of further namespaces whose applications are reconciled
    pub application_namespaces: Vec<String>,
    pub status_processors: usize,
    pub operation_processors: usize,
    /// Soft refresh timeout; also the period of the full resync
    pub resync_period: chrono::Duration,
    /// Hard refresh timeout, zero disables
    pub hard_resync_period: chrono::Duration,
    /// Upper bound of the random delay spreading resync refreshes
    pub resync_jitter: Duration,
    pub self_heal: SelfHealConfig,
    /// Pause between sync waves
    pub wave_delay: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: "driftwatch".to_string(),
            application_namespaces: Vec::new(),
            status_processors: DEFAULT_STATUS_PROCESSORS,
            operation_processors: DEFAULT_OPERATION_PROCESSORS,
            resync_period: chrono::Duration::seconds(DEFAULT_RESYNC_PERIOD_SECS),
            hard_resync_period: chrono::Duration::zero(),
            resync_jitter: Duration::from_secs(DEFAULT_RESYNC_JITTER_SECS),
            self_heal: SelfHealConfig::default(),
            wave_delay: super::sync::DEFAULT_WAVE_DELAY,
        }
    }
}

/// `strconv.ParseBool` compatible parsing
fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn split_key(key: &str) -> (&str, &str) {
    key.split_once('/').unwrap_or(("", key))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Automation or self-heal was switched on between two versions
fn automated_sync_enabled(old: &Application, new: &Application) -> bool {
    let flags = |app: &Application| {
        app.spec
            .sync_policy
            .as_ref()
            .filter(|p| p.is_automated())
            .map(|p| (true, p.automated.as_ref().map(|a| a.self_heal).unwrap_or(false)))
            .unwrap_or((false, false))
    };
    let (old_enabled, old_self_heal) = flags(old);
    let (new_enabled, new_self_heal) = flags(new);
    (!old_enabled && new_enabled) || (!old_self_heal && new_self_heal)
}

/// The resource is the Application object itself
fn is_application_itself(key: &ResourceKey, app_key: &str) -> bool {
    let (ns, name) = split_key(app_key);
    key.group == API_GROUP && key.kind == APPLICATION_KIND && key.name == name && key.namespace == ns
}

pub struct ApplicationController {
    config: ControllerConfig,
    apps: Arc<dyn AppStore>,
    projects: ProjectCache,
    state: Arc<AppStateManager>,
    sharding: Arc<ClusterSharding>,
    refresh_requests: RefreshRequests,
    /// Last seen version of every application, by qualified name
    known_apps: Arc<RwLock<HashMap<String, Application>>>,
    refresh_queue: WorkQueue,
    comparison_queue: WorkQueue,
    operation_queue: WorkQueue,
    project_queue: WorkQueue,
}

impl ApplicationController {
    pub fn new(
        config: ControllerConfig,
        apps: Arc<dyn AppStore>,
        projects: Arc<dyn ProjectStore>,
        state: Arc<AppStateManager>,
        sharding: Arc<ClusterSharding>,
    ) -> Self {
        Self {
            config,
            apps,
            projects: ProjectCache::new(projects),
            state,
            sharding,
            refresh_requests: RefreshRequests::new(),
            known_apps: Arc::new(RwLock::new(HashMap::new())),
            refresh_queue: WorkQueue::new(REFRESH_QUEUE),
            comparison_queue: WorkQueue::new(COMPARISON_QUEUE),
            operation_queue: WorkQueue::new(OPERATION_QUEUE),
            project_queue: WorkQueue::new(PROJECT_QUEUE),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn refresh_queue(&self) -> &WorkQueue {
        &self.refresh_queue
    }

    pub fn comparison_queue(&self) -> &WorkQueue {
        &self.comparison_queue
    }

    pub fn operation_queue(&self) -> &WorkQueue {
        &self.operation_queue
    }

    pub fn project_queue(&self) -> &WorkQueue {
        &self.project_queue
    }

    pub fn refresh_requests(&self) -> &RefreshRequests {
        &self.refresh_requests
    }

    pub fn state(&self) -> &Arc<AppStateManager> {
        &self.state
    }

    /// Whether applications in `namespace` are reconciled by this controller
    pub fn is_namespace_allowed(&self, namespace: &str) -> bool {
        namespace == self.config.namespace
            || self.config.application_namespaces.iter().any(|pattern| {
                glob::Pattern::new(pattern)
                    .map(|p| p.matches(namespace))
                    .unwrap_or(false)
            })
    }

    /// Ask for a refresh of `key`.
    ///
    /// With both a level and a delay the level is raised through the
    /// comparison queue once the delay elapses.
    pub fn request_app_refresh(&self, key: &str, level: Option<CompareWith>, after: Option<Duration>) {
        match (level, after) {
            (Some(level), Some(after)) => {
                self.comparison_queue.add_after(comparison_key(key, level), after);
            }
            (level, after) => {
                if let Some(level) = level {
                    self.refresh_requests.request(key, level);
                }
                match after {
                    Some(after) => self.refresh_queue.add_after(key, after),
                    None => self.refresh_queue.add_rate_limited(key),
                }
            }
        }
    }

    /// Namespace allowed, not opted out, destination owned by this shard.
    ///
    /// Applications with an unresolvable destination are processed so the
    /// error can be reported.
    pub async fn can_process_app(&self, app: &Application) -> bool {
        if !self.is_namespace_allowed(&app.namespace().unwrap_or_default()) {
            return false;
        }
        if let Some(skip) = app.annotation(ANNOTATION_SKIP_RECONCILE).and_then(parse_bool) {
            if skip {
                debug!(app = %app.qualified_name(), "Skipping application reconcile");
                return false;
            }
        }
        match resolve_destination(self.state.registry().as_ref(), &app.spec.destination).await {
            Ok(cluster) => self.sharding.is_managed(&cluster),
            Err(_) => true,
        }
    }

    async fn record_event(&self, app: &Application, event_type: EventType, reason: &str, message: &str) {
        if let Err(e) = self.apps.record_event(app, event_type, reason, message).await {
            warn!(app = %app.qualified_name(), error = %e, "Failed to record event");
        }
    }

    // -----------------------------------------------------------------------
    // Refresh
    // -----------------------------------------------------------------------

    /// One pass of the refresh queue. The operation queue always receives
    /// the key afterwards.
    pub async fn process_app_refresh(&self, key: &str) {
        let outcome = AssertUnwindSafe(self.refresh_app(key)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => self.refresh_queue.forget(key),
            Ok(Err(e)) => {
                warn!(app = %key, error = %e, "Failed to refresh application");
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(REFRESH_QUEUE, e.kind());
            }
            Err(panic) => {
                error!(app = %key, "Recovered from panic: {}", panic_message(panic.as_ref()));
            }
        }
        self.operation_queue.add_rate_limited(key);
    }

    #[instrument(skip_all, fields(app = %key))]
    async fn refresh_app(&self, key: &str) -> Result<()> {
        let (ns, name) = split_key(key);
        let app = match self.apps.get(ns, name).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => {
                debug!("Application no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if !self.can_process_app(&app).await {
            return Ok(());
        }

        let now = Utc::now();
        let Some(decision) = need_refresh(
            &app,
            self.config.resync_period,
            self.config.hard_resync_period,
            &self.refresh_requests,
            now,
        ) else {
            return Ok(());
        };
        info!(
            reason = %decision.reason,
            level = %decision.compare_with,
            refresh_type = decision.refresh_type.as_str(),
            "Refreshing app status"
        );
        let started = Instant::now();

        if decision.compare_with == CompareWith::Nothing && self.refresh_tree_only(&app).await? {
            return Ok(());
        }

        let mut status = app.status_or_default();
        let Some(project) = self.refresh_app_conditions(&app, &mut status).await else {
            status.sync.status = SyncStatusCode::Unknown;
            status.health.status = HealthStatusCode::Unknown;
            self.persist_app_status(&app, &status).await?;
            self.state.cache().remove(key);
            return Ok(());
        };

        let local_manifests: Option<Vec<String>> = status
            .operation_state
            .as_ref()
            .and_then(|s| s.operation.sync.as_ref())
            .map(|s| s.manifests.clone())
            .filter(|m| !m.is_empty());
        let sources = app.spec.get_sources();
        let revisions: Vec<String> = match decision.compare_with {
            CompareWith::Recent if app.spec.has_multiple_sources() => status.sync.revisions.clone(),
            CompareWith::Recent => status.sync.revision.iter().cloned().collect(),
            _ => sources
                .iter()
                .map(|s| s.target_revision_or_head().to_string())
                .collect(),
        };

        let comparison = match self
            .state
            .compare_app_state(
                &app,
                &project,
                &revisions,
                &sources,
                decision.refresh_type == RefreshType::Hard,
                decision.compare_with == CompareWith::LatestForceResolve,
                local_manifests.as_deref(),
            )
            .await
        {
            Ok(comparison) => comparison,
            Err(e @ Error::RepoUnavailable(_)) => {
                warn!("Ignoring temporary failed attempt to compare app state against repo: {}", e);
                return Ok(());
            }
            Err(e) => {
                set_conditions(
                    &mut status.conditions,
                    vec![comparison_error(e.to_string())],
                    COMPARISON_CONDITION_TYPES,
                );
                status.sync.status = SyncStatusCode::Unknown;
                self.persist_app_status(&app, &status).await?;
                return Ok(());
            }
        };

        let mut conditions = comparison.conditions.clone();
        match self
            .set_app_managed_resources(&app, &project, &comparison.server, &comparison.live_keys())
            .await
        {
            Ok(tree_conditions) => conditions.extend(tree_conditions),
            Err(e) => warn!(error = %e, "Failed to cache app resources"),
        }
        set_conditions(&mut status.conditions, conditions, COMPARISON_CONDITION_TYPES);

        let windows = matching_windows(&project.spec.sync_windows, &app);
        match can_sync(&windows, false, now) {
            Ok(true) => {
                let sync_condition = self.auto_sync(&app, &comparison).await;
                set_conditions(
                    &mut status.conditions,
                    sync_condition.into_iter().collect(),
                    AUTO_SYNC_CONDITION_TYPES,
                );
            }
            Ok(false) => info!("Sync prevented by sync window"),
            Err(e) => warn!(error = %e, "Failed to evaluate sync windows"),
        }

        if status.reconciled_at.is_none() || decision.compare_with >= CompareWith::Latest {
            let now = format_time(now);
            status.reconciled_at = Some(now.clone());
            status.observed_at = Some(now);
        }
        status.sync = comparison.sync_status.clone();
        status.health = comparison.health.clone();
        status.resources = comparison.resources.clone();
        status.resources.sort_by(|a, b| {
            (&a.group, &a.kind, &a.namespace, &a.name).cmp(&(&b.group, &b.kind, &b.namespace, &b.name))
        });
        status.source_type = comparison.source_type.clone();
        status.source_types = comparison.source_types.clone();
        self.persist_app_status(&app, &status).await?;

        if !app.is_being_deleted() {
            if let Some(finalizers) =
                reconcile_post_delete_finalizers(&app, comparison.has_post_delete_hooks())
            {
                self.apps.patch(ns, name, &finalizers_patch(&finalizers)).await?;
            }
        }

        let elapsed = started.elapsed();
        debug!(timings = ?comparison.timings, "Comparison timings");
        info!(
            time_ms = elapsed.as_millis() as u64,
            level = %decision.compare_with,
            "Reconciliation completed"
        );
        #[cfg(feature = "metrics")]
        metrics::observe_reconcile_duration_seconds(ns, &comparison.server, elapsed.as_secs_f64());
        Ok(())
    }

    /// Rebuild the resource tree from cached diffs.
    ///
    /// Returns false when the cache is cold and a full refresh is needed.
    async fn refresh_tree_only(&self, app: &Application) -> Result<bool> {
        let Some(managed) = self.state.cache().managed_resources(&app.qualified_name()) else {
            debug!("No cached managed resources, falling back to full refresh");
            return Ok(false);
        };
        let Ok(project) = self.projects.get(app.spec.project_name()).await else {
            return Ok(false);
        };
        let Ok(cluster) = resolve_destination(self.state.registry().as_ref(), &app.spec.destination).await else {
            return Ok(false);
        };
        let keys: Vec<ResourceKey> = managed
            .iter()
            .filter(|d| d.live_state.is_some())
            .map(|d| d.key.clone())
            .collect();
        let tree_conditions = self
            .set_app_managed_resources(app, &project, &cluster.server, &keys)
            .await?;
        let mut status = app.status_or_default();
        set_conditions(&mut status.conditions, tree_conditions, &[CONDITION_ORPHANED_RESOURCE_WARNING]);
        self.persist_app_status(app, &status).await?;
        Ok(true)
    }

    async fn set_app_managed_resources(
        &self,
        app: &Application,
        project: &AppProject,
        server: &str,
        managed: &[ResourceKey],
    ) -> Result<Vec<ApplicationCondition>> {
        let instance = app.instance_name(&self.config.namespace);
        let (tree, conditions) = build_app_tree(
            self.state.live(),
            server,
            &instance,
            app.spec.destination.namespace(),
            managed,
            &project.spec,
        )
        .await?;
        self.state.cache().set_tree(&app.qualified_name(), tree);
        Ok(conditions)
    }

    /// Validate the application against its project.
    ///
    /// Returns the project when the application may be compared.
    async fn refresh_app_conditions(
        &self,
        app: &Application,
        status: &mut ApplicationStatus,
    ) -> Option<AppProject> {
        let mut errors = Vec::new();
        let project = match self.projects.get(app.spec.project_name()).await {
            Ok(project) => {
                match validate_permissions(app, &project, self.state.registry().as_ref()).await {
                    Ok(conditions) => errors.extend(conditions),
                    Err(e) => errors.push(ApplicationCondition::new(CONDITION_UNKNOWN_ERROR, e.to_string())),
                }
                Some(project)
            }
            Err(e) if e.is_not_found() => {
                errors.push(invalid_spec_error(format!(
                    "Application referencing project {} which does not exist",
                    app.spec.project_name()
                )));
                None
            }
            Err(e) => {
                errors.push(ApplicationCondition::new(CONDITION_UNKNOWN_ERROR, e.to_string()));
                None
            }
        };
        let valid = errors.is_empty();
        set_conditions(&mut status.conditions, errors, SPEC_CONDITION_TYPES);
        if valid {
            project
        } else {
            None
        }
    }

    /// Write `status` when it differs from the stored one; the refresh
    /// annotation is removed in the same patch.
    pub async fn persist_app_status(&self, app: &Application, status: &ApplicationStatus) -> Result<()> {
        let old = app.status_or_default();
        if old.sync.status != status.sync.status {
            let message = format!("Updated sync status: {} -> {}", old.sync.status, status.sync.status);
            self.record_event(app, EventType::Normal, REASON_RESOURCE_UPDATED, &message).await;
        }
        if old.health.status != status.health.status {
            let message = format!(
                "Updated health status: {} -> {}",
                old.health.status, status.health.status
            );
            self.record_event(app, EventType::Normal, REASON_RESOURCE_UPDATED, &message).await;
        }

        let annotations = app.metadata.annotations.clone().unwrap_or_default();
        let mut new_annotations = annotations.clone();
        new_annotations.remove(ANNOTATION_REFRESH);
        let before = json!({
            "metadata": { "annotations": serde_json::to_value(&annotations)? },
            "status": serde_json::to_value(&old)?,
        });
        let after = json!({
            "metadata": { "annotations": serde_json::to_value(&new_annotations)? },
            "status": serde_json::to_value(status)?,
        });
        let Some(patch) = create_merge_patch(&before, &after) else {
            debug!("No status changes. Skipping patch");
            return Ok(());
        };
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        match self.apps.patch(&ns, &name, &patch).await {
            Ok(_) => {
                debug!("Updated application status");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn auto_sync(&self, app: &Application, comparison: &ComparisonResult) -> Option<ApplicationCondition> {
        let decision = auto_sync_decision(
            app,
            &comparison.sync_status,
            &comparison.resources,
            comparison.revision_updated,
            &self.config.self_heal,
            Utc::now(),
        );
        match decision {
            AutoSyncDecision::Skip(reason) => {
                debug!(%reason, "Skipping auto-sync");
                None
            }
            AutoSyncDecision::Defer { after, reason } => {
                info!(%reason, "Deferring self-heal");
                self.request_app_refresh(
                    &app.qualified_name(),
                    Some(CompareWith::Latest),
                    Some(after.to_std().unwrap_or_default()),
                );
                None
            }
            AutoSyncDecision::Blocked(condition) => {
                warn!(message = %condition.message, "Auto-sync blocked");
                Some(condition)
            }
            AutoSyncDecision::Sync { operation, revisions } => {
                match self.set_app_operation(app, operation).await {
                    Ok(true) => {
                        let message = initiated_message(&revisions);
                        info!("{}", message);
                        self.record_event(app, EventType::Normal, REASON_OPERATION_STARTED, &message)
                            .await;
                        None
                    }
                    Ok(false) => {
                        warn!("Failed to initiate auto-sync: another operation is already in progress");
                        None
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to initiate auto-sync");
                        Some(sync_error(e.to_string()))
                    }
                }
            }
        }
    }

    /// Request `operation` on the application unless one is already set
    pub async fn set_app_operation(&self, app: &Application, operation: Operation) -> Result<bool> {
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        let fresh = self.apps.get(&ns, &name).await?;
        if fresh.operation.is_some() {
            return Ok(false);
        }
        let patch = json!({
            "operation": serde_json::to_value(&operation)?,
            "status": { "operationState": Value::Null },
        });
        self.apps.patch(&ns, &name, &patch).await?;
        self.operation_queue.add(app.qualified_name());
        Ok(true)
    }

    // -----------------------------------------------------------------------
    // Comparison level requests
    // -----------------------------------------------------------------------

    pub fn process_comparison_item(&self, key: &str) {
        match parse_comparison_key(key) {
            Some((app_key, level)) => self.request_app_refresh(&app_key, Some(level), None),
            None => warn!(key, "Malformed comparison key"),
        }
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// One pass of the operation queue
    pub async fn process_app_operation(&self, key: &str) {
        let outcome = AssertUnwindSafe(self.operate_app(key)).catch_unwind().await;
        match outcome {
            Ok(Ok(())) => self.operation_queue.forget(key),
            Ok(Err(e)) => {
                warn!(app = %key, error = %e, "Failed to process application operation");
                #[cfg(feature = "metrics")]
                metrics::inc_reconcile_error(OPERATION_QUEUE, e.kind());
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(app = %key, "Recovered from panic: {}", message);
                match AssertUnwindSafe(self.fail_after_panic(key, &message)).catch_unwind().await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(app = %key, error = %e, "Failed to record recovered panic"),
                    Err(_) => error!(app = %key, "Panicked again while recording recovered panic"),
                }
            }
        }
    }

    /// Persist a panic of the operation pass as an Error operation state, or
    /// as a deletion error for applications being deleted.
    async fn fail_after_panic(&self, key: &str, message: &str) -> Result<()> {
        let (ns, name) = split_key(key);
        let mut app = match self.apps.get(ns, name).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        match app.operation.clone() {
            Some(operation) => {
                let mut state = app
                    .status
                    .as_ref()
                    .and_then(|s| s.operation_state.clone())
                    .filter(|s| !s.phase.is_completed())
                    .unwrap_or_else(|| OperationState {
                        operation,
                        started_at: format_time(Utc::now()),
                        ..Default::default()
                    });
                state.phase = OperationPhase::Error;
                state.message = message.to_string();
                state.next_retry_at = None;
                self.set_operation_state(&mut app, &mut state).await
            }
            None if app.is_being_deleted() => {
                self.set_app_condition(&app, ApplicationCondition::new(CONDITION_DELETION_ERROR, message))
                    .await
            }
            None => Ok(()),
        }
    }

    #[instrument(skip_all, fields(app = %key))]
    async fn operate_app(&self, key: &str) -> Result<()> {
        let (ns, name) = split_key(key);
        let mut app = match self.apps.get(ns, name).await {
            Ok(app) => app,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if !self.can_process_app(&app).await {
            return Ok(());
        }
        if app.operation.is_some() {
            return self.process_requested_app_operation(&mut app).await;
        }
        if app.is_being_deleted() {
            match finalize_application_deletion(self.apps.as_ref(), &self.projects, &self.state, &app).await {
                Ok(true) => {
                    self.state.forget(&app);
                    self.project_queue.add(app.spec.project_name());
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(error = %e, "Unable to delete application resources");
                    self.set_app_condition(
                        &app,
                        ApplicationCondition::new(CONDITION_DELETION_ERROR, e.to_string()),
                    )
                    .await?;
                    let message = format!("Unable to delete application resources: {}", e);
                    self.record_event(&app, EventType::Warning, REASON_STATUS_REFRESHED, &message)
                        .await;
                }
            }
        }
        Ok(())
    }

    async fn set_app_condition(&self, app: &Application, condition: ApplicationCondition) -> Result<()> {
        let mut conditions = app.status_or_default().conditions;
        if find_condition(&conditions, &condition.type_)
            .map(|c| c.message == condition.message)
            .unwrap_or(false)
        {
            return Ok(());
        }
        let types = [condition.type_.clone()];
        let types: Vec<&str> = types.iter().map(String::as_str).collect();
        set_conditions(&mut conditions, vec![condition], &types);
        let patch = json!({ "status": { "conditions": serde_json::to_value(&conditions)? } });
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        self.apps.patch(&ns, &name, &patch).await?;
        Ok(())
    }

    async fn process_requested_app_operation(&self, app: &mut Application) -> Result<()> {
        let Some(operation) = app.operation.clone() else {
            return Ok(());
        };
        let key = app.qualified_name();
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        let in_progress = app
            .status
            .as_ref()
            .and_then(|s| s.operation_state.clone())
            .filter(|s| !s.phase.is_completed());

        let mut terminating = false;
        let mut state = match in_progress {
            Some(mut state) => {
                match OperationStage::of(&state) {
                    Ok(OperationStage::Terminating) => {
                        terminating = true;
                        info!("Resuming terminating operation");
                    }
                    Ok(OperationStage::RetryPending { at, count }) => {
                        let now = Utc::now();
                        if at > now {
                            info!(retry_at = %at, attempt = count, "Skipping retrying in-progress operation");
                            let after = (at - now).to_std().unwrap_or_default();
                            self.request_app_refresh(&key, Some(CompareWith::Latest), Some(after));
                            return Ok(());
                        }
                        begin_retry(&mut state);
                        info!("{}", state.message);
                        self.set_operation_state(app, &mut state).await?;
                    }
                    Ok(_) => {
                        info!(phase = %state.phase, message = %state.message, "Resuming in-progress operation");
                    }
                    Err(e) => {
                        state.phase = OperationPhase::Error;
                        state.message = e.to_string();
                        return self.set_operation_state(app, &mut state).await;
                    }
                }
                state
            }
            None => {
                let mut state = OperationState {
                    operation: operation.clone(),
                    phase: OperationPhase::Running,
                    started_at: format_time(Utc::now()),
                    ..Default::default()
                };
                self.set_operation_state(app, &mut state).await?;
                info!("Initialized new operation");
                state
            }
        };

        let history = match self.projects.get(app.spec.project_name()).await {
            Ok(project) => {
                self.state
                    .sync_app_state(app, &project, &mut state, self.config.wave_delay)
                    .await
            }
            Err(e) => {
                state.phase = OperationPhase::Error;
                state.message = format!("Failed to load application project: {}", e);
                None
            }
        };
        if let Some(entry) = history {
            self.persist_revision_history(app, entry).await?;
        }

        if state.phase == OperationPhase::Running {
            if let Ok(fresh) = self.apps.get(&ns, &name).await {
                let fresh_phase = fresh
                    .status
                    .as_ref()
                    .and_then(|s| s.operation_state.as_ref())
                    .map(|s| s.phase);
                if fresh_phase == Some(OperationPhase::Terminating) {
                    state.phase = OperationPhase::Terminating;
                    state.message = "operation is terminating".to_string();
                }
            }
        } else if state.phase.is_failed() && !terminating {
            if let Err(e) = schedule_retry(&mut state, Utc::now()) {
                state.phase = OperationPhase::Error;
                state.message = format!("{} (failed to retry: {})", state.message, e);
            }
        }

        self.set_operation_state(app, &mut state).await?;
        let dry_run = operation.sync.as_ref().map(|s| s.dry_run).unwrap_or(false);
        if state.phase.is_completed() && !dry_run {
            self.request_app_refresh(&key, Some(CompareWith::LatestForceResolve), None);
        }
        Ok(())
    }

    async fn persist_revision_history(&self, app: &mut Application, entry: RevisionHistory) -> Result<()> {
        let mut history = app.status_or_default().history;
        push_history(&mut history, entry, app.revision_history_limit());
        let patch = json!({ "status": { "history": serde_json::to_value(&history)? } });
        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        *app = self.apps.patch(&ns, &name, &patch).await?;
        Ok(())
    }

    /// Persist `state`, clearing the requested operation once it completed
    pub async fn set_operation_state(&self, app: &mut Application, state: &mut OperationState) -> Result<()> {
        if state.phase.is_completed() {
            state.finished_at = Some(format_time(Utc::now()));
        }
        let current = app.status.as_ref().and_then(|s| s.operation_state.as_ref());
        if current == Some(&*state) && !(state.phase.is_completed() && app.operation.is_some()) {
            debug!("No operation updates necessary");
            return Ok(());
        }
        let before = match current {
            Some(current) => serde_json::to_value(current)?,
            None => Value::Null,
        };
        let after = serde_json::to_value(&*state)?;
        let state_patch = create_merge_patch(&before, &after).unwrap_or_else(|| after.clone());
        let mut patch = json!({ "status": { "operationState": state_patch } });
        if state.phase.is_completed() {
            patch["operation"] = Value::Null;
        }

        let (ns, name) = (app.namespace().unwrap_or_default(), app.name_any());
        match self.apps.patch(&ns, &name, &patch).await {
            Ok(updated) => *app = updated,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        }
        info!(phase = %state.phase, "Updated operation state");

        if state.phase.is_completed() {
            let partial = state
                .operation
                .sync
                .as_ref()
                .map(|s| !s.resources.is_empty())
                .unwrap_or(false);
            let mut parts: Vec<String> = vec![if partial {
                "Partial sync operation".to_string()
            } else {
                "Sync operation".to_string()
            }];
            if let Some(result) = &state.sync_result {
                parts.push(format!("to {}", result.revision));
            }
            let event_type = if state.phase.is_successful() {
                parts.push("succeeded".to_string());
                EventType::Normal
            } else {
                parts.push(format!("failed: {}", state.message));
                EventType::Warning
            };
            self.record_event(app, event_type, REASON_OPERATION_COMPLETED, &parts.join(" "))
                .await;
            #[cfg(feature = "metrics")]
            metrics::inc_sync(&ns, &name, app.spec.project_name(), &state.phase.to_string());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Projects
    // -----------------------------------------------------------------------

    /// Drop the finalizer of a deleted project once no application uses it
    #[instrument(skip_all, fields(project = %name))]
    pub async fn process_project_item(&self, name: &str) -> Result<()> {
        let project = match self.projects.store().get(name).await {
            Ok(project) => project,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };
        if project.metadata.deletion_timestamp.is_none() || !project_has_finalizer(&project) {
            return Ok(());
        }
        let apps = self.apps.list().await?;
        let referencing = apps
            .iter()
            .filter(|a| {
                a.spec.project_name() == name
                    && self.is_namespace_allowed(&a.namespace().unwrap_or_default())
            })
            .count();
        if referencing > 0 {
            info!(
                "Cannot remove project '{}' finalizer as is referenced by {} applications",
                name, referencing
            );
            return Ok(());
        }
        let namespace = project
            .namespace()
            .unwrap_or_else(|| self.config.namespace.clone());
        self.apps
            .patch_project(&namespace, name, &finalizers_patch(&project_without_finalizer(&project)))
            .await?;
        info!("Removed project finalizer");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn index(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Application>> {
        self.known_apps.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jitter(&self) -> Option<Duration> {
        if self.config.resync_jitter.is_zero() {
            return None;
        }
        Some(self.config.resync_jitter.mul_f64(rand::thread_rng().gen_range(0.0..1.0)))
    }

    pub async fn handle_app_event(&self, event: ObjectEvent<Application>) {
        match event {
            ObjectEvent::Applied(app) => {
                let key = app.qualified_name();
                let previous = self
                    .known_apps
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key.clone(), app.clone());
                if !self.can_process_app(&app).await {
                    return;
                }
                match previous {
                    None => {
                        self.refresh_queue.add_rate_limited(key.clone());
                        self.operation_queue.add_rate_limited(key);
                    }
                    Some(old) => {
                        let level = automated_sync_enabled(&old, &app).then(|| {
                            info!(app = %key, "Enabled automated sync");
                            CompareWith::Latest
                        });
                        let delay = if old.resource_version() == app.resource_version() {
                            self.jitter()
                        } else {
                            None
                        };
                        self.request_app_refresh(&key, level, delay);
                        match delay {
                            Some(delay) => self.operation_queue.add_after(key, delay),
                            None => self.operation_queue.add_rate_limited(key),
                        }
                    }
                }
            }
            ObjectEvent::Deleted(app) => {
                let key = app.qualified_name();
                self.known_apps
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&key);
                if !self.is_namespace_allowed(&app.namespace().unwrap_or_default()) {
                    return;
                }
                self.state.forget(&app);
                self.refresh_queue.add(key);
                self.project_queue.add(app.spec.project_name());
            }
        }
    }

    pub fn handle_project_event(&self, event: ObjectEvent<AppProject>) {
        let name = event.object().name_any();
        self.projects.invalidate(&name);
        self.project_queue.add_rate_limited(name);
    }

    /// Refresh the applications owning a changed live resource.
    ///
    /// An untracked resource refreshes the applications monitoring orphans
    /// in its namespace.
    pub async fn handle_object_updated(&self, key: &ResourceKey, apps: &[String], managed: bool) {
        let mut targets: Vec<(String, CompareWith)> = apps
            .iter()
            .map(|instance| {
                let (ns, name) = parse_instance_name(instance, &self.config.namespace);
                let level = if managed {
                    CompareWith::Recent
                } else {
                    CompareWith::Nothing
                };
                (format!("{}/{}", ns, name), level)
            })
            .collect();

        if targets.is_empty() && !key.namespace.is_empty() {
            let candidates: Vec<Application> = self
                .index()
                .values()
                .filter(|a| a.spec.destination.namespace() == key.namespace)
                .cloned()
                .collect();
            for app in candidates {
                let monitors_orphans = self
                    .projects
                    .get(app.spec.project_name())
                    .await
                    .map(|p| p.spec.orphaned_resources.is_some())
                    .unwrap_or(false);
                if monitors_orphans {
                    targets.push((app.qualified_name(), CompareWith::Nothing));
                }
            }
        }

        for (app_key, level) in targets {
            if is_application_itself(key, &app_key) {
                continue;
            }
            let app = self.index().get(&app_key).cloned();
            let Some(app) = app else {
                continue;
            };
            if !self.can_process_app(&app).await {
                continue;
            }
            debug!(app = %app_key, resource = %key, ?level, "Refreshing app for changed resource");
            self.request_app_refresh(&app_key, Some(level), None);
        }
    }

    async fn handle_cache_event(&self, event: CacheEvent) {
        match event {
            CacheEvent::ResourceUpdated { key, apps, managed, .. } => {
                self.handle_object_updated(&key, &apps, managed).await
            }
        }
    }

    /// Re-queue every known application, spread over the jitter window
    pub fn resync_apps(&self) {
        let keys: Vec<String> = self.index().keys().cloned().collect();
        debug!(apps = keys.len(), "Resyncing applications");
        for key in keys {
            let delay = self.jitter();
            self.request_app_refresh(&key, None, delay);
            match delay {
                Some(delay) => self.operation_queue.add_after(key, delay),
                None => self.operation_queue.add_rate_limited(key),
            }
        }
    }

    /// Whether any known application targets the cluster at `server`.
    /// Destinations given by name are assumed to match.
    fn has_apps_fn(&self) -> impl Fn(&str) -> bool + Send + Sync + 'static {
        let known = self.known_apps.clone();
        move |server: &str| {
            known
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .values()
                .any(|app| match app.spec.destination.server.as_deref() {
                    Some(s) if !s.is_empty() => s == server,
                    _ => true,
                })
        }
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    fn shut_down_queues(&self) {
        self.refresh_queue.shut_down();
        self.comparison_queue.shut_down();
        self.operation_queue.shut_down();
        self.project_queue.shut_down();
    }

    #[cfg(feature = "metrics")]
    fn report_queue_depths(&self) {
        for queue in [
            &self.refresh_queue,
            &self.comparison_queue,
            &self.operation_queue,
            &self.project_queue,
        ] {
            metrics::set_queue_depth(queue.name(), queue.len() as i64);
        }
    }

    /// Run watchers and workers until `shutdown` flips to true
    pub async fn run(
        self: Arc<Self>,
        mut cache_events: mpsc::UnboundedReceiver<CacheEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!(
            namespace = %self.config.namespace,
            status_processors = self.config.status_processors,
            operation_processors = self.config.operation_processors,
            "Starting application controller"
        );
        let mut tasks = JoinSet::new();

        let live = self.state.live().clone();
        tasks.spawn(live.run(shutdown.clone(), self.has_apps_fn()));

        {
            let ctrl = self.clone();
            let mut stop = shutdown.clone();
            tasks.spawn(async move {
                let mut events = ctrl.apps.watch();
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        event = events.next() => match event {
                            Some(Ok(event)) => ctrl.handle_app_event(event).await,
                            Some(Err(e)) => warn!(error = %e, "Application watch error"),
                            None => break,
                        },
                    }
                }
            });
        }

        {
            let ctrl = self.clone();
            let mut stop = shutdown.clone();
            tasks.spawn(async move {
                let mut events = ctrl.projects.store().watch();
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        event = events.next() => match event {
                            Some(Ok(event)) => ctrl.handle_project_event(event),
                            Some(Err(e)) => warn!(error = %e, "Project watch error"),
                            None => break,
                        },
                    }
                }
            });
        }

        {
            let ctrl = self.clone();
            let mut stop = shutdown.clone();
            tasks.spawn(async move {
                loop {
                    tokio::select! {
                        _ = stop.changed() => break,
                        event = cache_events.recv() => match event {
                            Some(event) => ctrl.handle_cache_event(event).await,
                            None => break,
                        },
                    }
                }
            });
        }

        if let Ok(period) = self.config.resync_period.to_std() {
            if !period.is_zero() {
                let ctrl = self.clone();
                let mut stop = shutdown.clone();
                tasks.spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.tick().await;
                    loop {
                        tokio::select! {
                            _ = stop.changed() => break,
                            _ = ticker.tick() => {
                                ctrl.resync_apps();
                                #[cfg(feature = "metrics")]
                                ctrl.report_queue_depths();
                            }
                        }
                    }
                });
            }
        }

        for _ in 0..self.config.status_processors.max(1) {
            let ctrl = self.clone();
            tasks.spawn(async move {
                while let Some(key) = ctrl.refresh_queue.get().await {
                    ctrl.process_app_refresh(&key).await;
                    ctrl.refresh_queue.done(&key);
                }
            });
        }
        for _ in 0..self.config.operation_processors.max(1) {
            let ctrl = self.clone();
            tasks.spawn(async move {
                while let Some(key) = ctrl.operation_queue.get().await {
                    ctrl.process_app_operation(&key).await;
                    ctrl.operation_queue.done(&key);
                }
            });
        }
        {
            let ctrl = self.clone();
            tasks.spawn(async move {
                while let Some(key) = ctrl.comparison_queue.get().await {
                    ctrl.process_comparison_item(&key);
                    ctrl.comparison_queue.done(&key);
                }
            });
        }
        {
            let ctrl = self.clone();
            tasks.spawn(async move {
                while let Some(key) = ctrl.project_queue.get().await {
                    if let Err(e) = ctrl.process_project_item(&key).await {
                        warn!(project = %key, error = %e, "Failed to reconcile project");
                        ctrl.project_queue.add_rate_limited(key.clone());
                    } else {
                        ctrl.project_queue.forget(&key);
                    }
                    ctrl.project_queue.done(&key);
                }
            });
        }

        let _ = shutdown.changed().await;
        info!("Shutting down application controller");
        self.shut_down_queues();
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Controller task failed");
            }
        }
        Ok(())
    }
}
