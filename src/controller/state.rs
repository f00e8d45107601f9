//! Comparison of desired and live application state
//!
//! `AppStateManager::compare_app_state` renders the desired manifests, pairs
//! them with the live objects of the destination cluster, diffs every pair
//! and rolls the per-resource results up into the application sync and
//! health status.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};

use super::cache::LiveStateCache;
use super::conditions::{
    comparison_error, invalid_spec_error, CONDITION_EXCLUDED_RESOURCE_WARNING,
    CONDITION_REPEATED_RESOURCE_WARNING, CONDITION_SHARED_RESOURCE_WARNING,
    CONDITION_UNKNOWN_ERROR,
};
use super::diff::{diff, DiffConfig, DiffResult};
use super::health::{set_app_health, HealthInput};
use super::tree::{AppStateCache, ResourceDiff};
use crate::clients::{
    ApplyOptions, Cluster, ClusterConnector, ClusterRegistry, ManifestInfo, ManifestRequest,
    ManifestSource, ResourceExecutor, Settings, SettingsProvider,
};
use crate::crd::{
    AppProject, Application, ApplicationCondition, ApplicationDestination, ApplicationSource,
    ComparedTo, HealthStatus, ResourceStatus, SyncStatus, SyncStatusCode, API_GROUP,
    APPLICATION_KIND,
};
use crate::error::{Error, Result};
use crate::resource::annotations::{
    has_annotation_option, has_compare_option, has_sync_option, is_hook, is_post_delete_hook,
    is_skip_hook, is_unsupported_helm_hook, sync_wave, ANNOTATION_COMPARE_OPTIONS,
    COMPARE_OPTION_IGNORE_EXTRANEOUS, COMPARE_OPTION_NO_SERVER_SIDE_DIFF,
    COMPARE_OPTION_SERVER_SIDE_DIFF, SYNC_OPTION_CREATE_NAMESPACE, SYNC_OPTION_DELETE_CONFIRM,
};
use crate::resource::tracking::{AppInstanceValue, ResourceTracking, TrackingMethod};
use crate::resource::{
    group_version, is_namespace, kind_of, parse_manifests, to_value, GroupKind, ResourceKey,
};

/// Default time a failing manifest source is tolerated before the
/// application is reported as broken
pub const DEFAULT_REPO_ERROR_GRACE_SECONDS: i64 = 90;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Target and live object of one resource with their diff
#[derive(Clone, Debug, Default)]
pub struct ManagedResource {
    pub key: ResourceKey,
    pub version: String,
    pub target: Option<DynamicObject>,
    pub live: Option<DynamicObject>,
    pub diff: DiffResult,
    pub hook: bool,
    pub resource_version: String,
}

impl ManagedResource {
    pub fn to_diff(&self) -> ResourceDiff {
        ResourceDiff {
            key: self.key.clone(),
            version: self.version.clone(),
            hook: self.hook,
            modified: self.diff.modified,
            target_state: self.target.as_ref().and_then(|t| to_value(t).ok()),
            live_state: self.live.as_ref().and_then(|l| to_value(l).ok()),
            normalized_live: self.diff.normalized_live.clone(),
            predicted_live: self.diff.predicted_live.clone(),
            resource_version: self.resource_version.clone(),
        }
    }
}

/// Targets paired with live objects. `target[i]` and `live[i]` describe the
/// same resource; extras carry no target.
#[derive(Clone, Debug, Default)]
pub struct ReconciliationResult {
    pub target: Vec<Option<DynamicObject>>,
    pub live: Vec<Option<DynamicObject>>,
    pub hooks: Vec<DynamicObject>,
}

/// Pair target objects with live objects by resource key.
///
/// Hook targets are set aside. Live objects without a target, live hooks
/// included, follow the targets in key order.
pub fn reconcile(
    targets: Vec<DynamicObject>,
    live: &HashMap<ResourceKey, DynamicObject>,
) -> ReconciliationResult {
    let mut result = ReconciliationResult::default();
    let mut target_keys = HashSet::new();
    for target in targets {
        if is_hook(&target) {
            result.hooks.push(target);
            continue;
        }
        let key = ResourceKey::from_object(&target);
        result.live.push(live.get(&key).cloned());
        result.target.push(Some(target));
        target_keys.insert(key);
    }

    let mut extras: Vec<(&ResourceKey, &DynamicObject)> = live
        .iter()
        .filter(|(k, _)| !target_keys.contains(*k))
        .collect();
    extras.sort_by(|a, b| a.0.cmp(b.0));
    for (_, obj) in extras {
        result.target.push(None);
        result.live.push(Some(obj.clone()));
    }
    result
}

/// Outcome of one comparison pass
#[derive(Clone, Debug, Default)]
pub struct ComparisonResult {
    pub server: String,
    pub sync_status: SyncStatus,
    pub health: HealthStatus,
    pub resources: Vec<ResourceStatus>,
    pub managed_resources: Vec<ManagedResource>,
    pub reconciliation: ReconciliationResult,
    /// Conditions raised by this pass, to be merged into the status
    pub conditions: Vec<ApplicationCondition>,
    pub source_type: Option<String>,
    pub source_types: Vec<String>,
    pub post_delete_hooks: Vec<DynamicObject>,
    /// Manifests were rendered at a revision other than the last compared one
    pub revision_updated: bool,
    /// Milliseconds spent per step
    pub timings: Vec<(&'static str, u128)>,
}

impl ComparisonResult {
    pub fn has_post_delete_hooks(&self) -> bool {
        !self.post_delete_hooks.is_empty()
    }

    /// Keys of managed resources present in the cluster
    pub fn live_keys(&self) -> Vec<ResourceKey> {
        self.managed_resources
            .iter()
            .filter(|r| r.live.is_some())
            .map(|r| r.key.clone())
            .collect()
    }
}

/// The part of the spec a comparison was made against
pub fn compared_to(app: &Application, sources: &[ApplicationSource]) -> ComparedTo {
    let multi = app.spec.has_multiple_sources();
    ComparedTo {
        source: if multi { None } else { sources.first().cloned() },
        sources: if multi { sources.to_vec() } else { Vec::new() },
        destination: app.spec.destination.clone(),
        ignore_differences: app.spec.ignore_differences.clone(),
    }
}

/// Look up the destination cluster by server URL or by name
pub async fn resolve_destination(
    registry: &dyn ClusterRegistry,
    destination: &ApplicationDestination,
) -> Result<Cluster> {
    let server = destination.server.as_deref().filter(|s| !s.is_empty());
    let name = destination.name.as_deref().filter(|n| !n.is_empty());
    let not_configured = |what: &str, e: Error| {
        if e.is_not_found() {
            Error::ValidationError(format!("cluster {} has not been configured", what))
        } else {
            e
        }
    };
    match (server, name) {
        (Some(_), Some(_)) => Err(Error::ValidationError(
            "application destination can't have both name and server defined".to_string(),
        )),
        (Some(server), None) => registry
            .get(server)
            .await
            .map_err(|e| not_configured(server, e)),
        (None, Some(name)) => registry
            .get_by_name(name)
            .await
            .map_err(|e| not_configured(name, e)),
        (None, None) => Err(Error::ValidationError(
            "application destination server and name are both empty".to_string(),
        )),
    }
}

/// Whether `live` is the object its tracking id describes.
///
/// The target, when known, decides the expected identity so that API group
/// migrations are handled.
pub fn is_self_referenced_obj(
    live: Option<&DynamicObject>,
    target: Option<&DynamicObject>,
    instance_name: &str,
    tracking: &ResourceTracking,
) -> bool {
    let Some(live) = live else {
        return true;
    };
    if tracking.method == TrackingMethod::Label {
        return true;
    }
    let expected = match target {
        Some(target) => Some(AppInstanceValue {
            app_name: instance_name.to_string(),
            group: group_version(target).0,
            kind: kind_of(target),
            namespace: target.namespace().unwrap_or_default(),
            name: target.name_any(),
        }),
        None => tracking.app_instance(live),
    };
    match expected {
        Some(aiv) => {
            let namespace = live.namespace().unwrap_or_default();
            (namespace == aiv.namespace || namespace.is_empty())
                && live.name_any() == aiv.name
                && group_version(live).0 == aiv.group
                && kind_of(live) == aiv.kind
        }
        None => true,
    }
}

fn is_managed_namespace(obj: Option<&DynamicObject>, app: &Application) -> bool {
    let Some(obj) = obj else {
        return false;
    };
    let Some(policy) = &app.spec.sync_policy else {
        return false;
    };
    is_namespace(obj)
        && obj.name_any() == app.spec.destination.namespace()
        && policy.has_option(SYNC_OPTION_CREATE_NAMESPACE)
        && policy.managed_namespace_metadata.is_some()
}

fn is_application_itself(live: Option<&DynamicObject>, app: &Application) -> bool {
    live.map(|l| {
        group_version(l).0 == API_GROUP
            && kind_of(l) == APPLICATION_KIND
            && l.name_any() == app.name_any()
            && l.namespace() == app.namespace()
    })
    .unwrap_or(false)
}

fn use_server_side_diff(app: &Application, settings: &Settings) -> bool {
    let options = app.annotation(ANNOTATION_COMPARE_OPTIONS).unwrap_or("");
    let has = |option: &str| options.split(',').any(|o| o.trim() == option);
    if has(COMPARE_OPTION_NO_SERVER_SIDE_DIFF) {
        return false;
    }
    settings.server_side_diff || has(COMPARE_OPTION_SERVER_SIDE_DIFF)
}

#[derive(Clone, Debug)]
struct Claim {
    instance: String,
    server: String,
    key: ResourceKey,
}

/// Live object UIDs claimed by each application.
///
/// Two applications managing the same UID share the object. Objects with
/// the same key on different clusters have different UIDs and never clash.
#[derive(Default)]
pub struct ResourceClaims {
    by_uid: Mutex<HashMap<String, Vec<Claim>>>,
}

impl ResourceClaims {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the claims of `instance` on `server` and return the other
    /// applications claiming one of the same objects, with the object key.
    pub fn claim(
        &self,
        instance: &str,
        server: &str,
        objects: &[(ResourceKey, String)],
    ) -> Vec<(ResourceKey, String)> {
        let mut by_uid = lock(&self.by_uid);
        for claims in by_uid.values_mut() {
            claims.retain(|c| !(c.instance == instance && c.server == server));
        }
        by_uid.retain(|_, claims| !claims.is_empty());

        let mut shared = Vec::new();
        for (key, uid) in objects {
            if uid.is_empty() {
                continue;
            }
            let claims = by_uid.entry(uid.clone()).or_default();
            for other in claims.iter().filter(|c| c.instance != instance) {
                shared.push((key.clone(), other.instance.clone()));
            }
            claims.push(Claim {
                instance: instance.to_string(),
                server: server.to_string(),
                key: key.clone(),
            });
        }
        shared.sort();
        shared.dedup();
        shared
    }

    /// Forget every claim of a deleted application
    pub fn release(&self, instance: &str) {
        let mut by_uid = lock(&self.by_uid);
        for claims in by_uid.values_mut() {
            claims.retain(|c| c.instance != instance);
        }
        by_uid.retain(|_, claims| !claims.is_empty());
    }

    /// Keys claimed by an application, for diagnostics
    pub fn claimed_keys(&self, instance: &str) -> Vec<ResourceKey> {
        let by_uid = lock(&self.by_uid);
        let mut keys: Vec<ResourceKey> = by_uid
            .values()
            .flatten()
            .filter(|c| c.instance == instance)
            .map(|c| c.key.clone())
            .collect();
        keys.sort();
        keys
    }
}

/// Rendered targets and where they came from
struct Targets {
    objects: Vec<DynamicObject>,
    infos: Vec<ManifestInfo>,
    failed: bool,
}

/// Computes comparison results for applications
pub struct AppStateManager {
    manifests: Arc<dyn ManifestSource>,
    live: Arc<LiveStateCache>,
    registry: Arc<dyn ClusterRegistry>,
    connector: Arc<dyn ClusterConnector>,
    settings: Arc<dyn SettingsProvider>,
    namespace: String,
    repo_error_grace: Duration,
    repo_errors: Mutex<HashMap<String, DateTime<Utc>>>,
    claims: ResourceClaims,
    cache: Arc<AppStateCache>,
}

impl AppStateManager {
    pub fn new(
        manifests: Arc<dyn ManifestSource>,
        live: Arc<LiveStateCache>,
        registry: Arc<dyn ClusterRegistry>,
        connector: Arc<dyn ClusterConnector>,
        settings: Arc<dyn SettingsProvider>,
        namespace: &str,
    ) -> Self {
        Self {
            manifests,
            live,
            registry,
            connector,
            settings,
            namespace: namespace.to_string(),
            repo_error_grace: Duration::seconds(DEFAULT_REPO_ERROR_GRACE_SECONDS),
            repo_errors: Mutex::new(HashMap::new()),
            claims: ResourceClaims::new(),
            cache: Arc::new(AppStateCache::new()),
        }
    }

    pub fn with_repo_error_grace(mut self, grace: Duration) -> Self {
        self.repo_error_grace = grace;
        self
    }

    pub fn cache(&self) -> &Arc<AppStateCache> {
        &self.cache
    }

    pub fn claims(&self) -> &ResourceClaims {
        &self.claims
    }

    pub fn live(&self) -> &Arc<LiveStateCache> {
        &self.live
    }

    pub fn registry(&self) -> &Arc<dyn ClusterRegistry> {
        &self.registry
    }

    pub fn connector(&self) -> &Arc<dyn ClusterConnector> {
        &self.connector
    }

    pub fn settings_provider(&self) -> &Arc<dyn SettingsProvider> {
        &self.settings
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Forget cached state of a deleted application
    pub fn forget(&self, app: &Application) {
        self.cache.remove(&app.qualified_name());
        self.claims.release(&app.instance_name(&self.namespace));
        lock(&self.repo_errors).remove(&app.qualified_name());
    }

    async fn fetch_targets(
        &self,
        app: &Application,
        project: &AppProject,
        revisions: &[String],
        sources: &[ApplicationSource],
        no_cache: bool,
        no_revision_cache: bool,
        local_manifests: Option<&[String]>,
        settings: &Settings,
        conditions: &mut Vec<ApplicationCondition>,
    ) -> Result<Targets> {
        if let Some(local) = local_manifests {
            let mut objects = Vec::new();
            for manifest in local {
                match parse_manifests(manifest) {
                    Ok(parsed) => objects.extend(parsed),
                    Err(e) => {
                        conditions.push(ApplicationCondition::new(
                            CONDITION_UNKNOWN_ERROR,
                            format!("Failed to load local manifests: {}", e),
                        ));
                        return Ok(Targets {
                            objects: Vec::new(),
                            infos: Vec::new(),
                            failed: true,
                        });
                    }
                }
            }
            return Ok(Targets {
                objects,
                infos: Vec::new(),
                failed: false,
            });
        }

        // revisions only apply when given for every source
        let revisions: Vec<String> = if revisions.len() == sources.len() {
            revisions.to_vec()
        } else {
            sources
                .iter()
                .map(|s| s.target_revision_or_head().to_string())
                .collect()
        };
        let request = ManifestRequest {
            app_name: app.instance_name(&self.namespace),
            namespace: app.spec.destination.namespace().to_string(),
            project: project.name_any(),
            sources: sources.to_vec(),
            revisions,
            app_label_key: settings.instance_label_key.clone(),
            tracking_method: settings.tracking_method.as_str().to_string(),
            no_cache,
            no_revision_cache,
        };

        let key = app.qualified_name();
        match self.manifests.get_repo_objs(&request).await {
            Ok(response) => {
                lock(&self.repo_errors).remove(&key);
                Ok(Targets {
                    objects: response.objects,
                    infos: response.manifest_infos,
                    failed: false,
                })
            }
            Err(e) => {
                conditions.push(comparison_error(format!(
                    "Failed to load target state: {}",
                    e
                )));
                if matches!(e, Error::RepoUnavailable(_)) && !no_revision_cache {
                    let now = Utc::now();
                    let mut errors = lock(&self.repo_errors);
                    match errors.get(&key) {
                        Some(first) if now - *first <= self.repo_error_grace => {
                            debug!("Ignoring repository error within grace period: {}", e);
                            return Err(e);
                        }
                        Some(_) => {}
                        None => {
                            debug!("Ignoring new repository error: {}", e);
                            errors.insert(key, now);
                            return Err(e);
                        }
                    }
                }
                Ok(Targets {
                    objects: Vec::new(),
                    infos: Vec::new(),
                    failed: true,
                })
            }
        }
    }

    /// Compare the desired state of `app` with the live state.
    ///
    /// Returns `Error::RepoUnavailable` while a manifest source failure is
    /// within its grace period; the caller should leave the status alone and
    /// retry. Every other failure is reported through the result conditions.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip_all, fields(app = %app.qualified_name()))]
    pub async fn compare_app_state(
        &self,
        app: &Application,
        project: &AppProject,
        revisions: &[String],
        sources: &[ApplicationSource],
        no_cache: bool,
        no_revision_cache: bool,
        local_manifests: Option<&[String]>,
    ) -> Result<ComparisonResult> {
        let started = Instant::now();
        let mut timings: Vec<(&'static str, u128)> = Vec::new();
        let mut checkpoint = {
            let mut last = Instant::now();
            move |name: &'static str, timings: &mut Vec<(&'static str, u128)>| {
                timings.push((name, last.elapsed().as_millis()));
                last = Instant::now();
            }
        };

        let settings = self.settings.settings().await?;
        let tracking = settings.tracking();
        let instance = app.instance_name(&self.namespace);
        let destination_ns = app.spec.destination.namespace().to_string();
        let multi = app.spec.has_multiple_sources();

        let mut sync_status = SyncStatus {
            status: SyncStatusCode::Unknown,
            compared_to: Some(compared_to(app, sources)),
            revision: if multi { None } else { revisions.first().cloned() },
            revisions: if multi { revisions.to_vec() } else { Vec::new() },
        };
        let mut conditions: Vec<ApplicationCondition> = Vec::new();

        let cluster = resolve_destination(self.registry.as_ref(), &app.spec.destination).await?;
        info!(
            cluster = %cluster.server,
            namespace = %destination_ns,
            "Comparing app state"
        );

        let targets = self
            .fetch_targets(
                app,
                project,
                revisions,
                sources,
                no_cache,
                no_revision_cache,
                local_manifests,
                &settings,
                &mut conditions,
            )
            .await?;
        let mut failed_to_load = targets.failed;
        checkpoint("git_ms", &mut timings);

        let mut post_delete_hooks = Vec::new();
        let mut objects = Vec::with_capacity(targets.objects.len());
        for obj in targets.objects {
            if is_skip_hook(&obj) || is_unsupported_helm_hook(&obj) {
                continue;
            }
            if is_post_delete_hook(&obj) {
                post_delete_hooks.push(obj);
                continue;
            }
            objects.push(obj);
        }

        let cluster_cache = match self.live.get_synced_cluster_cache(&cluster.server).await {
            Ok(cache) => Some(cache),
            Err(e) => {
                conditions.push(ApplicationCondition::new(
                    CONDITION_UNKNOWN_ERROR,
                    format!("Failed to load live state: {}", e),
                ));
                failed_to_load = true;
                None
            }
        };
        let mut scopes: HashMap<GroupKind, Option<bool>> = HashMap::new();
        for obj in objects.iter().chain(post_delete_hooks.iter()) {
            let gk = GroupKind::new(&group_version(obj).0, &kind_of(obj));
            if scopes.contains_key(&gk) {
                continue;
            }
            let namespaced = match &cluster_cache {
                Some(cache) => cache.is_namespaced(&gk).await,
                None => None,
            };
            scopes.insert(gk, namespaced);
        }

        // namespace defaulting, tracking and deduplication
        let mut order: Vec<ResourceKey> = Vec::new();
        let mut by_key: HashMap<ResourceKey, Vec<DynamicObject>> = HashMap::new();
        for (i, mut obj) in objects.into_iter().enumerate() {
            let gk = GroupKind::new(&group_version(&obj).0, &kind_of(&obj));
            let namespaced = scopes.get(&gk).copied().flatten();
            match namespaced {
                Some(false) => obj.metadata.namespace = None,
                _ => {
                    if obj.namespace().unwrap_or_default().is_empty() {
                        obj.metadata.namespace = Some(destination_ns.clone());
                    }
                }
            }
            tracking.set_app_instance(&mut obj, &instance, namespaced != Some(false));
            let mut key = ResourceKey::from_object(&obj);
            if obj.metadata.name.as_deref().unwrap_or("").is_empty() {
                if let Some(generate) = &obj.metadata.generate_name {
                    key.name = format!("{}{}", generate, i);
                }
            }
            if !by_key.contains_key(&key) {
                order.push(key.clone());
            }
            by_key.entry(key).or_default().push(obj);
        }
        let mut targets_deduped = Vec::with_capacity(order.len());
        for key in order {
            let Some(mut copies) = by_key.remove(&key) else {
                continue;
            };
            if copies.len() > 1 {
                conditions.push(ApplicationCondition::new(
                    CONDITION_REPEATED_RESOURCE_WARNING,
                    format!(
                        "Resource {} appeared {} times among application resources.",
                        key,
                        copies.len()
                    ),
                ));
            }
            if let Some(last) = copies.pop() {
                targets_deduped.push(last);
            }
        }

        let mut target_objs = Vec::with_capacity(targets_deduped.len());
        for obj in targets_deduped {
            let (group, _) = group_version(&obj);
            let kind = kind_of(&obj);
            if settings.is_excluded(&group, &kind, &cluster.server) {
                conditions.push(ApplicationCondition::new(
                    CONDITION_EXCLUDED_RESOURCE_WARNING,
                    format!(
                        "Resource {}/{} {} is excluded in the settings",
                        group,
                        kind,
                        obj.name_any()
                    ),
                ));
                continue;
            }
            target_objs.push(obj);
        }
        checkpoint("dedup_ms", &mut timings);

        let executor: Option<Arc<dyn ResourceExecutor>> =
            match self.connector.executor(&cluster, None).await {
                Ok(executor) => Some(executor),
                Err(e) => {
                    conditions.push(ApplicationCondition::new(
                        CONDITION_UNKNOWN_ERROR,
                        format!("Failed to connect to cluster: {}", e),
                    ));
                    failed_to_load = true;
                    None
                }
            };

        let mut live_by_key = HashMap::new();
        if let (Some(cache), Some(executor)) = (&cluster_cache, &executor) {
            match cache
                .get_managed_live_objs(app, &instance, &mut target_objs, executor.as_ref())
                .await
            {
                Ok(live) => live_by_key = live,
                Err(e) => {
                    conditions.push(ApplicationCondition::new(
                        CONDITION_UNKNOWN_ERROR,
                        format!("Failed to load live state: {}", e),
                    ));
                    failed_to_load = true;
                }
            }
        }

        // live objects the project does not permit are not managed
        let project_name = project.name_any();
        let mut denied = Vec::new();
        live_by_key.retain(|key, _| {
            let namespaced = !key.namespace.is_empty();
            if !project
                .spec
                .is_group_kind_permitted(&key.group, &key.kind, namespaced)
            {
                denied.push(kind_not_permitted(&key.group, &key.kind, &project_name));
                return false;
            }
            if namespaced
                && !project.spec.is_destination_permitted(
                    &cluster.server,
                    &cluster.name,
                    &key.namespace,
                )
            {
                denied.push(namespace_not_permitted(&key.namespace, &project_name));
                return false;
            }
            true
        });
        for condition in denied {
            push_unique(&mut conditions, condition);
        }

        let mut tracked_uids = Vec::new();
        for (key, live) in &live_by_key {
            match tracking.app_name(live) {
                Some(owner) if owner != instance => {
                    conditions.push(ApplicationCondition::new(
                        CONDITION_SHARED_RESOURCE_WARNING,
                        format!(
                            "{}/{} is part of applications {} and {}",
                            key.kind,
                            key.name,
                            app.qualified_name(),
                            owner.replace('_', "/")
                        ),
                    ));
                }
                Some(_) => tracked_uids.push((key.clone(), live.uid().unwrap_or_default())),
                None => {}
            }
        }
        for (key, other) in self.claims.claim(&instance, &cluster.server, &tracked_uids) {
            conditions.push(ApplicationCondition::new(
                CONDITION_SHARED_RESOURCE_WARNING,
                format!(
                    "{}/{} is part of applications {} and {}",
                    key.kind,
                    key.name,
                    app.qualified_name(),
                    other.replace('_', "/")
                ),
            ));
        }

        let reconciliation = reconcile(target_objs, &live_by_key);
        checkpoint("live_ms", &mut timings);

        let diff_config = DiffConfig::new(&app.spec.ignore_differences, &settings);
        let server_side = use_server_side_diff(app, &settings);
        let mut diffs = Vec::with_capacity(reconciliation.target.len());
        for (target, live) in reconciliation.target.iter().zip(&reconciliation.live) {
            let mut predicted = None;
            if server_side {
                if let (Some(target), Some(_), Some(executor)) = (target, live, &executor) {
                    let opts = ApplyOptions {
                        dry_run: true,
                        server_side: true,
                        ..Default::default()
                    };
                    match executor.apply(target, &opts).await {
                        Ok(obj) => predicted = Some(obj),
                        Err(e) => warn!("Server side dry run failed, diffing client side: {}", e),
                    }
                }
            }
            match diff(target.as_ref(), live.as_ref(), predicted.as_ref(), &diff_config) {
                Ok(result) => diffs.push(result),
                Err(e) => {
                    let key = target
                        .as_ref()
                        .or(live.as_ref())
                        .map(ResourceKey::from_object)
                        .unwrap_or_default();
                    conditions.push(ApplicationCondition::new(
                        CONDITION_UNKNOWN_ERROR,
                        format!("Failed to compare desired state to live state of {}: {}", key, e),
                    ));
                    diffs.push(DiffResult {
                        modified: true,
                        ..Default::default()
                    });
                }
            }
        }
        checkpoint("diff_ms", &mut timings);

        let mut sync_code = SyncStatusCode::Synced;
        let mut managed_resources = Vec::with_capacity(reconciliation.target.len());
        let mut resources = Vec::with_capacity(reconciliation.target.len());
        let mut health_inputs_meta = Vec::with_capacity(reconciliation.target.len());

        for (i, (target, live)) in reconciliation
            .target
            .iter()
            .zip(&reconciliation.live)
            .enumerate()
        {
            let Some(obj) = live.as_ref().or(target.as_ref()) else {
                continue;
            };
            let (group, version) = group_version(obj);
            let kind = kind_of(obj);
            let self_referenced =
                is_self_referenced_obj(live.as_ref(), target.as_ref(), &instance, &tracking);
            let hook = is_hook(obj);
            let managed_ns = is_managed_namespace(target.as_ref(), app) && live.is_none();
            let diff_result = diffs.get(i).cloned().unwrap_or_default();

            let mut status = ResourceStatus {
                group: group.clone(),
                version: version.clone(),
                kind: kind.clone(),
                namespace: obj.namespace().unwrap_or_default(),
                name: obj.name_any(),
                hook,
                requires_pruning: target.is_none() && live.is_some() && self_referenced && !hook,
                requires_deletion_confirmation: target
                    .as_ref()
                    .map(|t| has_sync_option(t, SYNC_OPTION_DELETE_CONFIRM))
                    .unwrap_or(false)
                    || live
                        .as_ref()
                        .map(|l| has_sync_option(l, SYNC_OPTION_DELETE_CONFIRM))
                        .unwrap_or(false),
                sync_wave: target.as_ref().map(sync_wave).unwrap_or(0),
                ..Default::default()
            };

            let skipped = hook
                || is_skip_hook(obj)
                || target.as_ref().map(is_skip_hook).unwrap_or(false)
                || !self_referenced;
            if !skipped {
                if !managed_ns && (diff_result.modified || target.is_none() || live.is_none()) {
                    status.status = Some(SyncStatusCode::OutOfSync);
                    let extraneous_ignored = target.is_none()
                        && has_compare_option(obj, COMPARE_OPTION_IGNORE_EXTRANEOUS);
                    if !extraneous_ignored {
                        sync_code = SyncStatusCode::OutOfSync;
                    }
                } else {
                    status.status = Some(SyncStatusCode::Synced);
                }
            }

            let gk = GroupKind::new(&group, &kind);
            let namespaced = match scopes.get(&gk) {
                Some(known) => *known,
                None => match &cluster_cache {
                    Some(cache) => cache.is_namespaced(&gk).await,
                    None => None,
                },
            };
            if !project
                .spec
                .is_group_kind_permitted(&group, &kind, namespaced.unwrap_or(true))
            {
                status.status = Some(SyncStatusCode::Unknown);
                if target.is_some() {
                    push_unique(&mut conditions, kind_not_permitted(&group, &kind, &project_name));
                }
            }
            if target.is_some()
                && namespaced != Some(false)
                && !status.namespace.is_empty()
                && !project.spec.is_destination_permitted(
                    &cluster.server,
                    &cluster.name,
                    &status.namespace,
                )
            {
                status.status = Some(SyncStatusCode::Unknown);
                push_unique(
                    &mut conditions,
                    namespace_not_permitted(&status.namespace, &project_name),
                );
            }
            if namespaced == Some(true) && status.namespace.is_empty() {
                conditions.push(invalid_spec_error(format!(
                    "Namespace for {} {} is missing.",
                    status.name, gk
                )));
            }
            if failed_to_load {
                status.status = Some(SyncStatusCode::Unknown);
            }

            health_inputs_meta.push((group.clone(), kind.clone(), skipped));
            managed_resources.push(ManagedResource {
                key: ResourceKey::new(&group, &kind, &status.namespace, &status.name),
                version,
                target: target.clone(),
                live: live.clone(),
                diff: diff_result,
                hook,
                resource_version: live
                    .as_ref()
                    .and_then(|l| l.resource_version())
                    .unwrap_or_default(),
            });
            resources.push(status);
        }

        if failed_to_load {
            sync_code = SyncStatusCode::Unknown;
        }
        sync_status.status = sync_code;

        let manifest_revisions: Vec<String> =
            targets.infos.iter().map(|m| m.revision.clone()).collect();
        if multi {
            sync_status.revisions = manifest_revisions.clone();
        } else if let Some(first) = manifest_revisions.first() {
            sync_status.revision = Some(first.clone());
        }
        let revision_updated = !manifest_revisions.is_empty()
            && app.status.as_ref().map(|s| s.revisions()).unwrap_or_default() != manifest_revisions;
        checkpoint("sync_ms", &mut timings);

        let inputs: Vec<HealthInput<'_>> = managed_resources
            .iter()
            .zip(&health_inputs_meta)
            .map(|(res, (group, kind, skipped))| HealthInput {
                group,
                kind,
                live: res.live.as_ref(),
                excluded: *skipped,
                self_referenced: is_application_itself(res.live.as_ref(), app),
            })
            .collect();
        let (health, per_resource) = set_app_health(&inputs, &settings);
        for (status, health) in resources.iter_mut().zip(per_resource) {
            status.health = health;
        }
        checkpoint("health_ms", &mut timings);

        self.cache.set_managed_resources(
            &app.qualified_name(),
            managed_resources.iter().map(ManagedResource::to_diff).collect(),
        );

        let (source_type, source_types) = if multi {
            (None, targets.infos.iter().map(|m| m.source_type.clone()).collect())
        } else {
            (targets.infos.first().map(|m| m.source_type.clone()), Vec::new())
        };

        debug!(
            status = ?sync_status.status,
            health = ?health.status,
            resources = resources.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Compared app state"
        );

        Ok(ComparisonResult {
            server: cluster.server,
            sync_status,
            health,
            resources,
            managed_resources,
            reconciliation,
            conditions,
            source_type,
            source_types,
            post_delete_hooks,
            revision_updated,
            timings,
        })
    }
}

/// Whether the object opts out of comparison noise through its annotations
fn kind_not_permitted(group: &str, kind: &str, project: &str) -> ApplicationCondition {
    invalid_spec_error(format!(
        "Resource {}:{} is not permitted in project {}.",
        group, kind, project
    ))
}

fn namespace_not_permitted(namespace: &str, project: &str) -> ApplicationCondition {
    invalid_spec_error(format!(
        "namespace {} is not permitted in project '{}'",
        namespace, project
    ))
}

fn push_unique(conditions: &mut Vec<ApplicationCondition>, condition: ApplicationCondition) {
    if !conditions
        .iter()
        .any(|c| c.type_ == condition.type_ && c.message == condition.message)
    {
        conditions.push(condition);
    }
}

pub fn ignores_extraneous(obj: &DynamicObject) -> bool {
    has_annotation_option(obj, ANNOTATION_COMPARE_OPTIONS, COMPARE_OPTION_IGNORE_EXTRANEOUS)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::new_object;

    fn hook(name: &str) -> DynamicObject {
        let mut obj = new_object("batch/v1", "Job", "web", name);
        obj.metadata.annotations = Some(
            [("driftwatch.io/hook".to_string(), "PreSync".to_string())]
                .into_iter()
                .collect(),
        );
        obj
    }

    #[test]
    fn test_reconcile_pairs_targets_and_sorts_extras() {
        let targets = vec![
            new_object("v1", "ConfigMap", "web", "b"),
            hook("migrate"),
            new_object("v1", "ConfigMap", "web", "a"),
        ];
        let mut live = HashMap::new();
        for name in ["a", "z", "y"] {
            let obj = new_object("v1", "ConfigMap", "web", name);
            live.insert(ResourceKey::from_object(&obj), obj);
        }
        let live_hook = hook("old-migrate");
        live.insert(ResourceKey::from_object(&live_hook), live_hook);

        let result = reconcile(targets, &live);

        assert_eq!(result.hooks.len(), 1);
        let names: Vec<String> = result
            .target
            .iter()
            .zip(&result.live)
            .map(|(t, l)| t.as_ref().or(l.as_ref()).map(|o| o.name_any()).unwrap_or_default())
            .collect();
        assert_eq!(names, vec!["b", "a", "y", "z", "old-migrate"]);
        assert!(result.live[0].is_none());
        assert!(result.live[1].is_some());
        assert!(result.target[2].is_none());
    }

    #[test]
    fn test_claims_conflict_only_on_same_uid() {
        let claims = ResourceClaims::new();
        let key = ResourceKey::new("", "ConfigMap", "web", "settings");
        assert!(claims
            .claim("east-app", "https://east", &[(key.clone(), "uid-1".to_string())])
            .is_empty());
        assert!(claims
            .claim("west-app", "https://west", &[(key.clone(), "uid-2".to_string())])
            .is_empty());

        let shared = claims.claim("other", "https://east", &[(key.clone(), "uid-1".to_string())]);
        assert_eq!(shared, vec![(key.clone(), "east-app".to_string())]);

        claims.release("east-app");
        assert!(claims
            .claim("other", "https://east", &[(key, "uid-1".to_string())])
            .is_empty());
    }

    #[test]
    fn test_reclaiming_replaces_previous_claims() {
        let claims = ResourceClaims::new();
        let a = ResourceKey::new("", "ConfigMap", "web", "a");
        let b = ResourceKey::new("", "ConfigMap", "web", "b");
        claims.claim("guestbook", "https://east", &[(a, "uid-a".to_string())]);
        claims.claim("guestbook", "https://east", &[(b.clone(), "uid-b".to_string())]);
        assert_eq!(claims.claimed_keys("guestbook"), vec![b]);
    }

    #[test]
    fn test_self_reference_follows_target_identity() {
        let tracking = ResourceTracking::default();
        let mut live = new_object("v1", "Secret", "other", "tls");
        let mut source = new_object("v1", "Secret", "web", "tls");
        tracking.set_app_instance(&mut source, "guestbook", true);
        live.metadata.annotations = source.metadata.annotations.clone();

        assert!(!is_self_referenced_obj(Some(&live), None, "guestbook", &tracking));
        assert!(is_self_referenced_obj(Some(&source), None, "guestbook", &tracking));
        assert!(is_self_referenced_obj(None, Some(&source), "guestbook", &tracking));
    }

    #[tokio::test]
    async fn test_resolve_destination() {
        use crate::clients::StaticClusterRegistry;

        let registry = StaticClusterRegistry::new(vec![Cluster {
            server: "https://east".to_string(),
            name: "east".to_string(),
            ..Default::default()
        }]);
        let by_name = ApplicationDestination {
            name: Some("east".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_destination(&registry, &by_name).await.unwrap().server,
            "https://east"
        );

        let both = ApplicationDestination {
            name: Some("east".to_string()),
            server: Some("https://east".to_string()),
            ..Default::default()
        };
        assert!(resolve_destination(&registry, &both).await.is_err());

        let unknown = ApplicationDestination {
            server: Some("https://west".to_string()),
            ..Default::default()
        };
        let err = resolve_destination(&registry, &unknown).await.unwrap_err();
        assert!(err.to_string().contains("has not been configured"));
    }
}
