//! Sync of an application: one processing pass of its sync operation

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::Utc;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{info, instrument, warn};

use super::context::{ManagedNamespace, SyncContext, SyncSettings};
use super::windows::sync_window_prevents_sync;
use crate::clients::executor::PropagationPolicy;
use crate::controller::conditions::{
    CONDITION_COMPARISON_ERROR, CONDITION_INVALID_SPEC_ERROR, CONDITION_SHARED_RESOURCE_WARNING,
};
use crate::controller::diff::{respect_ignore_differences, DiffConfig};
use crate::controller::state::{is_self_referenced_obj, resolve_destination, AppStateManager};
use crate::crd::{
    format_time, parse_time, AppProject, Application, OperationPhase, OperationState,
    RevisionHistory, SyncOperationResource, SyncOperationResult,
};
use crate::resource::annotations::{
    is_post_delete_hook, SyncOptions, ANNOTATION_DELETION_APPROVED, SYNC_OPTION_APPLY_OUT_OF_SYNC_ONLY,
    SYNC_OPTION_CREATE_NAMESPACE, SYNC_OPTION_FAIL_ON_SHARED, SYNC_OPTION_PRUNE_LAST,
    SYNC_OPTION_PRUNE_PROPAGATION, SYNC_OPTION_REPLACE, SYNC_OPTION_RESPECT_IGNORE_DIFFERENCES,
    SYNC_OPTION_SERVER_SIDE_APPLY, SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING,
    SYNC_OPTION_VALIDATE_DISABLED,
};
use crate::resource::{new_object, GroupKind, ResourceKey};

fn fail(state: &mut OperationState, phase: OperationPhase, message: impl Into<String>) {
    state.phase = phase;
    state.message = message.into();
}

/// Whether `key` is one of the resources an operation is limited to
fn contains_sync_resource(key: &ResourceKey, resources: &[SyncOperationResource]) -> bool {
    resources.iter().any(|r| {
        r.group == key.group
            && r.kind == key.kind
            && r.name == key.name
            && r.namespace
                .as_deref()
                .map(|ns| ns.is_empty() || ns == key.namespace)
                .unwrap_or(true)
    })
}

/// Deletion of pruned resources was approved after the operation started
fn is_deletion_confirmed(app: &Application, state: &OperationState) -> bool {
    let Some(approved) = app.annotation(ANNOTATION_DELETION_APPROVED).and_then(parse_time) else {
        return false;
    };
    state
        .started_at_time()
        .map(|started| approved >= started)
        .unwrap_or(false)
}

/// Append a history entry, keeping at most `limit` entries
pub fn push_history(history: &mut Vec<RevisionHistory>, mut entry: RevisionHistory, limit: usize) {
    entry.id = history.iter().map(|h| h.id + 1).max().unwrap_or(0);
    history.push(entry);
    if history.len() > limit {
        let excess = history.len() - limit;
        history.drain(..excess);
    }
}

impl AppStateManager {
    /// Advance the sync operation of `app` by one step.
    ///
    /// The outcome is written into `state`. A history entry is returned when
    /// a full, non dry-run sync succeeded.
    #[instrument(skip_all, fields(app = %app.qualified_name()))]
    pub async fn sync_app_state(
        &self,
        app: &Application,
        project: &AppProject,
        state: &mut OperationState,
        wave_delay: Duration,
    ) -> Option<RevisionHistory> {
        let Some(sync_op) = state.operation.sync.clone() else {
            fail(
                state,
                OperationPhase::Failed,
                "Invalid operation request: no operation specified",
            );
            return None;
        };

        let policy_options = SyncOptions::new(app.spec.sync_options());
        let options = policy_options.merged_with(&SyncOptions::new(&sync_op.sync_options));

        if options.has(SYNC_OPTION_FAIL_ON_SHARED) {
            let shared = app.status.as_ref().and_then(|s| {
                s.conditions
                    .iter()
                    .find(|c| c.type_ == CONDITION_SHARED_RESOURCE_WARNING)
            });
            if let Some(condition) = shared {
                fail(
                    state,
                    OperationPhase::Failed,
                    format!("Shared resource found: {}", condition.message),
                );
                return None;
            }
        }

        let multi = app.spec.has_multiple_sources();
        let (sources, revisions) = match &state.sync_result {
            Some(pinned) => {
                let sources = if multi {
                    pinned.sources.clone()
                } else {
                    pinned.source.iter().cloned().collect()
                };
                let revisions = if multi {
                    pinned.revisions.clone()
                } else {
                    vec![pinned.revision.clone()]
                };
                (sources, revisions)
            }
            None => {
                // an explicit source in the operation means a rollback
                let sources = if !sync_op.sources.is_empty() {
                    sync_op.sources.clone()
                } else if let Some(source) = &sync_op.source {
                    vec![source.clone()]
                } else {
                    app.spec.get_sources()
                };
                let revisions = if !sync_op.revisions.is_empty() {
                    sync_op.revisions.clone()
                } else if let Some(revision) = sync_op.revision.clone().filter(|r| !r.is_empty()) {
                    vec![revision]
                } else {
                    sources
                        .iter()
                        .map(|s| s.target_revision_or_head().to_string())
                        .collect()
                };
                state.sync_result = Some(SyncOperationResult {
                    revision: if multi {
                        String::new()
                    } else {
                        revisions.first().cloned().unwrap_or_default()
                    },
                    revisions: if multi { revisions.clone() } else { Vec::new() },
                    source: if multi { None } else { sources.first().cloned() },
                    sources: if multi { sources.clone() } else { Vec::new() },
                    ..Default::default()
                });
                (sources, revisions)
            }
        };

        let (blocked, reason) = sync_window_prevents_sync(app, project, Utc::now());
        if blocked {
            if state.phase == OperationPhase::Running {
                state.message = match reason {
                    Some(reason) => format!("Sync operation blocked by sync window: {}", reason),
                    None => "Sync operation blocked by sync window".to_string(),
                };
            }
            return None;
        }

        let manifests = (!sync_op.manifests.is_empty()).then_some(sync_op.manifests.as_slice());
        let comparison = match self
            .compare_app_state(app, project, &revisions, &sources, false, true, manifests)
            .await
        {
            Ok(comparison) => comparison,
            Err(e) => {
                fail(state, OperationPhase::Error, e.to_string());
                return None;
            }
        };

        let errors: Vec<&str> = comparison
            .conditions
            .iter()
            .filter(|c| {
                c.type_ == CONDITION_COMPARISON_ERROR || c.type_ == CONDITION_INVALID_SPEC_ERROR
            })
            .map(|c| c.message.as_str())
            .collect();
        if !errors.is_empty() {
            fail(state, OperationPhase::Error, errors.join(", "));
            return None;
        }

        if let Some(result) = state.sync_result.as_mut() {
            if multi {
                result.revisions = comparison.sync_status.revisions.clone();
            } else if let Some(revision) = &comparison.sync_status.revision {
                result.revision = revision.clone();
            }
        }

        let settings = match self.settings_provider().settings().await {
            Ok(settings) => settings,
            Err(e) => {
                fail(state, OperationPhase::Error, e.to_string());
                return None;
            }
        };
        let cluster = match resolve_destination(self.registry().as_ref(), &app.spec.destination).await {
            Ok(cluster) => cluster,
            Err(e) => {
                fail(state, OperationPhase::Error, e.to_string());
                return None;
            }
        };
        let destination_ns = app.spec.destination.namespace().to_string();

        let impersonate = if settings.impersonation_enabled {
            match project
                .spec
                .destination_service_account(&cluster.server, &destination_ns)
            {
                Some(sa) => Some(sa),
                None => {
                    fail(
                        state,
                        OperationPhase::Error,
                        "failed to find a matching service account to impersonate",
                    );
                    return None;
                }
            }
        } else {
            None
        };
        let executor = match self
            .connector()
            .executor(&cluster, impersonate.as_deref())
            .await
        {
            Ok(executor) => executor,
            Err(e) => {
                fail(state, OperationPhase::Error, e.to_string());
                return None;
            }
        };

        let prune_propagation = match options.get(SYNC_OPTION_PRUNE_PROPAGATION) {
            Some(value) => match value.parse::<PropagationPolicy>() {
                Ok(policy) => policy,
                Err(e) => {
                    fail(state, OperationPhase::Error, format!("{}", e));
                    return None;
                }
            },
            None => Default::default(),
        };
        let strategy = sync_op.sync_strategy.clone().unwrap_or_default();
        let opts = SyncSettings {
            dry_run: sync_op.dry_run,
            prune: sync_op.prune,
            force: strategy.force,
            skip_hooks: strategy.apply_only || manifests.is_some(),
            validate: !options.has(SYNC_OPTION_VALIDATE_DISABLED),
            replace: options.has(SYNC_OPTION_REPLACE),
            server_side_apply: options.has(SYNC_OPTION_SERVER_SIDE_APPLY),
            prune_last: options.has(SYNC_OPTION_PRUNE_LAST),
            apply_out_of_sync_only: options.has(SYNC_OPTION_APPLY_OUT_OF_SYNC_ONLY),
            skip_dry_run_on_missing: options.has(SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING),
            prune_propagation,
            prune_confirmed: is_deletion_confirmed(app, state),
            wave_delay,
        };

        let mut reconciliation = comparison.reconciliation.clone();
        if options.has(SYNC_OPTION_RESPECT_IGNORE_DIFFERENCES) {
            let config = DiffConfig::new(&app.spec.ignore_differences, &settings);
            for (target, live) in reconciliation
                .target
                .iter_mut()
                .zip(&reconciliation.live)
            {
                if let (Some(t), Some(l)) = (target.as_ref(), live.as_ref()) {
                    match respect_ignore_differences(t, l, &config) {
                        Ok(merged) => *target = Some(merged),
                        Err(e) => {
                            fail(state, OperationPhase::Error, e.to_string());
                            return None;
                        }
                    }
                }
            }
        }

        let mut kinds: HashSet<GroupKind> = HashSet::new();
        for obj in reconciliation
            .target
            .iter()
            .chain(&reconciliation.live)
            .flatten()
            .chain(&reconciliation.hooks)
        {
            kinds.insert(ResourceKey::from_object(obj).group_kind());
        }
        let mut scopes = HashMap::new();
        for gk in kinds {
            match self.live().is_namespaced(&cluster.server, &gk).await {
                Ok(Some(namespaced)) => {
                    scopes.insert(gk, namespaced);
                }
                Ok(None) => {}
                Err(e) => warn!(kind = %gk, error = %e, "Failed to resolve resource scope"),
            }
        }

        let modified: HashMap<ResourceKey, bool> = comparison
            .managed_resources
            .iter()
            .map(|r| (r.key.clone(), r.diff.modified))
            .collect();

        let tracking = settings.tracking();
        let instance = app.instance_name(self.namespace());
        let filter_resources = sync_op.resources.clone();
        let filter_tracking = tracking.clone();
        let filter_instance = instance.clone();
        let filter = Box::new(
            move |key: &ResourceKey, target: Option<&DynamicObject>, live: Option<&DynamicObject>| {
                (filter_resources.is_empty()
                    || target.map(is_post_delete_hook).unwrap_or(false)
                    || contains_sync_resource(key, &filter_resources))
                    && is_self_referenced_obj(live, target, &filter_instance, &filter_tracking)
            },
        );

        let project_name = project.name_any();
        let project_spec = project.spec.clone();
        let server = cluster.server.clone();
        let cluster_name = cluster.name.clone();
        let validator = Box::new(move |obj: &DynamicObject, namespaced: bool| {
            let key = ResourceKey::from_object(obj);
            if !project_spec.is_group_kind_permitted(&key.group, &key.kind, namespaced) {
                return Err(format!(
                    "resource {}:{} is not permitted in project {}",
                    key.group, key.kind, project_name
                ));
            }
            if namespaced
                && !project_spec.is_destination_permitted(&server, &cluster_name, &key.namespace)
            {
                return Err(format!(
                    "namespace {} is not permitted in project '{}'",
                    key.namespace, project_name
                ));
            }
            Ok(())
        });

        let revision = revisions.first().cloned().unwrap_or_default();
        let started_at = state.started_at_time().unwrap_or_else(Utc::now);
        let recorded = state
            .sync_result
            .as_ref()
            .map(|r| r.resources.clone())
            .unwrap_or_default();
        let mut ctx = SyncContext::new(
            executor,
            settings.clone(),
            &reconciliation,
            &destination_ns,
            &revision,
            started_at,
            opts,
        )
        .with_initial_state(state.phase, &state.message, recorded)
        .with_scopes(scopes)
        .with_modified(modified)
        .with_resource_filter(filter)
        .with_permission_validator(validator);

        if options.has(SYNC_OPTION_CREATE_NAMESPACE) && !destination_ns.is_empty() {
            let metadata = app
                .spec
                .sync_policy
                .as_ref()
                .and_then(|p| p.managed_namespace_metadata.clone());
            let mut namespace = new_object("v1", "Namespace", "", &destination_ns);
            if let Some(metadata) = &metadata {
                namespace.labels_mut().extend(metadata.labels.clone());
                namespace.annotations_mut().extend(metadata.annotations.clone());
            }
            tracking.set_app_instance(&mut namespace, &instance, false);
            if let Some(result) = state.sync_result.as_mut() {
                result.managed_namespace_metadata = metadata.clone();
            }
            ctx = ctx.with_managed_namespace(ManagedNamespace {
                object: namespace,
                always_apply: metadata.is_some(),
            });
        }

        if state.phase == OperationPhase::Terminating {
            ctx.terminate().await;
        } else {
            ctx.sync().await;
        }
        let (phase, message, results) = ctx.into_state();
        state.phase = phase;
        state.message = message;
        if let Some(result) = state.sync_result.as_mut() {
            result.resources = results;
        }
        info!(phase = %state.phase, message = %state.message, "Sync step finished");

        if !state.phase.is_successful() || sync_op.dry_run || !sync_op.resources.is_empty() {
            return None;
        }
        let result = state.sync_result.clone().unwrap_or_default();
        Some(RevisionHistory {
            id: 0,
            revision: result.revision,
            revisions: result.revisions,
            deployed_at: format_time(Utc::now()),
            deploy_started_at: Some(state.started_at.clone()),
            source: result.source,
            sources: result.sources,
            initiated_by: Some(state.operation.initiated_by.clone()),
        })
    }
}
