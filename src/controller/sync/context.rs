//! One step of a sync operation
//!
//! A `SyncContext` is rebuilt for every processing pass from the latest
//! comparison and the results recorded so far. `sync()` advances the
//! operation as far as it can without blocking on the cluster and leaves the
//! outcome in the phase, message and per-resource results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use kube::api::DynamicObject;
use kube::ResourceExt;
use tracing::{debug, info, warn};

use super::tasks::{
    generated_hook_name, prune_last, resource_result_key, reverse_prune_waves, sort_tasks,
    sync_phases, SyncTask,
};
use crate::clients::executor::{ApplyOptions, PropagationPolicy, ResourceExecutor};
use crate::clients::settings::Settings;
use crate::controller::health::resource_health;
use crate::controller::state::ReconciliationResult;
use crate::crd::{HealthStatusCode, OperationPhase, ResourceResult, ResultCode, SyncPhase};
use crate::resource::annotations::{
    has_sync_option, is_hook, SYNC_OPTION_FORCE, SYNC_OPTION_PRUNE_CONFIRM,
    SYNC_OPTION_PRUNE_DISABLED, SYNC_OPTION_PRUNE_LAST, SYNC_OPTION_REPLACE,
    SYNC_OPTION_SERVER_SIDE_APPLY, SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING,
    SYNC_OPTION_VALIDATE_DISABLED,
};
use crate::resource::{crd_group_kind, is_crd, join_api_version, GroupKind, ResourceKey};

pub const DEFAULT_WAVE_DELAY: Duration = Duration::from_secs(2);

/// Decides whether a resource takes part in the sync
pub type ResourceFilter =
    Box<dyn Fn(&ResourceKey, Option<&DynamicObject>, Option<&DynamicObject>) -> bool + Send + Sync>;

/// Checks an object against the project. The flag tells whether the kind
/// is namespaced.
pub type PermissionValidator =
    Box<dyn Fn(&DynamicObject, bool) -> std::result::Result<(), String> + Send + Sync>;

/// Operation wide switches
#[derive(Clone, Debug)]
pub struct SyncSettings {
    pub dry_run: bool,
    pub prune: bool,
    pub force: bool,
    pub skip_hooks: bool,
    pub validate: bool,
    pub replace: bool,
    pub server_side_apply: bool,
    pub prune_last: bool,
    pub apply_out_of_sync_only: bool,
    pub skip_dry_run_on_missing: bool,
    pub prune_propagation: PropagationPolicy,
    pub prune_confirmed: bool,
    pub wave_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            dry_run: false,
            prune: false,
            force: false,
            skip_hooks: false,
            validate: true,
            replace: false,
            server_side_apply: false,
            prune_last: false,
            apply_out_of_sync_only: false,
            skip_dry_run_on_missing: false,
            prune_propagation: PropagationPolicy::Foreground,
            prune_confirmed: false,
            wave_delay: DEFAULT_WAVE_DELAY,
        }
    }
}

/// Namespace created for the application before anything else
#[derive(Clone, Debug)]
pub struct ManagedNamespace {
    pub object: DynamicObject,
    /// Apply even when the namespace exists, to keep managed metadata current
    pub always_apply: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Successful,
    Pending,
    Failed,
}

impl RunState {
    fn merge(self, other: RunState) -> RunState {
        match (self, other) {
            (RunState::Failed, _) | (_, RunState::Failed) => RunState::Failed,
            (RunState::Pending, _) | (_, RunState::Pending) => RunState::Pending,
            _ => RunState::Successful,
        }
    }
}

fn operation_phase_for(code: ResultCode) -> OperationPhase {
    match code {
        ResultCode::Synced => OperationPhase::Running,
        ResultCode::SyncFailed => OperationPhase::Failed,
        ResultCode::Pruned | ResultCode::PruneSkipped => OperationPhase::Succeeded,
    }
}

/// `deployment.apps/frontend` style name used in result messages
fn kubectl_name(task: &SyncTask) -> String {
    if task.key.group.is_empty() {
        format!("{}/{}", task.key.kind.to_lowercase(), task.key.name)
    } else {
        format!(
            "{}.{}/{}",
            task.key.kind.to_lowercase(),
            task.key.group,
            task.key.name
        )
    }
}

pub struct SyncContext {
    executor: Arc<dyn ResourceExecutor>,
    settings: Arc<Settings>,
    opts: SyncSettings,
    resources: Vec<(ResourceKey, Option<DynamicObject>, Option<DynamicObject>)>,
    hooks: Vec<DynamicObject>,
    namespace: String,
    revision: String,
    started_at: DateTime<Utc>,
    scopes: HashMap<GroupKind, bool>,
    filter: Option<ResourceFilter>,
    permission_validator: Option<PermissionValidator>,
    modified: HashMap<ResourceKey, bool>,
    managed_namespace: Option<ManagedNamespace>,
    results: Vec<ResourceResult>,
    result_index: HashMap<String, usize>,
    phase: OperationPhase,
    message: String,
}

impl SyncContext {
    pub fn new(
        executor: Arc<dyn ResourceExecutor>,
        settings: Arc<Settings>,
        reconciliation: &ReconciliationResult,
        namespace: &str,
        revision: &str,
        started_at: DateTime<Utc>,
        opts: SyncSettings,
    ) -> Self {
        let resources = reconciliation
            .target
            .iter()
            .zip(&reconciliation.live)
            .filter_map(|(target, live)| {
                let obj = target.as_ref().or(live.as_ref())?;
                Some((ResourceKey::from_object(obj), target.clone(), live.clone()))
            })
            .collect();
        Self {
            executor,
            settings,
            opts,
            resources,
            hooks: reconciliation.hooks.clone(),
            namespace: namespace.to_string(),
            revision: revision.to_string(),
            started_at,
            scopes: HashMap::new(),
            filter: None,
            permission_validator: None,
            modified: HashMap::new(),
            managed_namespace: None,
            results: Vec::new(),
            result_index: HashMap::new(),
            phase: OperationPhase::Running,
            message: String::new(),
        }
    }

    /// Resume from the state recorded by the previous step
    pub fn with_initial_state(
        mut self,
        phase: OperationPhase,
        message: &str,
        results: Vec<ResourceResult>,
    ) -> Self {
        self.phase = phase;
        self.message = message.to_string();
        self.result_index = results
            .iter()
            .enumerate()
            .map(|(i, r)| (resource_result_key(r), i))
            .collect();
        self.results = results;
        self
    }

    /// Known kinds of the destination and whether they are namespaced
    pub fn with_scopes(mut self, scopes: HashMap<GroupKind, bool>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_resource_filter(mut self, filter: ResourceFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_permission_validator(mut self, validator: PermissionValidator) -> Self {
        self.permission_validator = Some(validator);
        self
    }

    /// Diff outcome per resource, used by `ApplyOutOfSyncOnly`
    pub fn with_modified(mut self, modified: HashMap<ResourceKey, bool>) -> Self {
        self.modified = modified;
        self
    }

    pub fn with_managed_namespace(mut self, namespace: ManagedNamespace) -> Self {
        self.managed_namespace = Some(namespace);
        self
    }

    pub fn phase(&self) -> OperationPhase {
        self.phase
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn results(&self) -> &[ResourceResult] {
        &self.results
    }

    pub fn into_state(self) -> (OperationPhase, String, Vec<ResourceResult>) {
        (self.phase, self.message, self.results)
    }

    fn started(&self) -> bool {
        !self.results.is_empty()
    }

    fn set_phase(&mut self, phase: OperationPhase, message: impl Into<String>) {
        self.phase = phase;
        self.message = message.into();
    }

    fn set_resource_result(
        &mut self,
        task: &mut SyncTask,
        status: Option<ResultCode>,
        state: Option<OperationPhase>,
        message: &str,
    ) {
        task.sync_status = status;
        task.operation_state = state;
        if !message.is_empty() {
            task.message = message.to_string();
        }
        let key = task.result_key();
        match self.result_index.get(&key) {
            Some(&i) => {
                let existing = &mut self.results[i];
                existing.status = task.sync_status;
                existing.hook_phase = task.operation_state;
                existing.message = task.message.clone();
            }
            None => {
                self.result_index.insert(key, self.results.len());
                self.results.push(task.to_result());
            }
        }
    }

    fn filter_allows(
        &self,
        key: &ResourceKey,
        target: Option<&DynamicObject>,
        live: Option<&DynamicObject>,
    ) -> bool {
        self.filter
            .as_ref()
            .map(|f| f(key, target, live))
            .unwrap_or(true)
    }

    fn live_of(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.resources
            .iter()
            .find(|(k, _, _)| k == key)
            .and_then(|(_, _, live)| live.clone())
    }

    fn has_crd_of(&self, gk: &GroupKind) -> bool {
        self.resources.iter().any(|(_, target, _)| {
            target
                .as_ref()
                .filter(|t| is_crd(t))
                .and_then(crd_group_kind)
                .map(|crd| &crd == gk)
                .unwrap_or(false)
        })
    }

    fn hook_task(&self, hook: &DynamicObject, phase: SyncPhase) -> Option<SyncTask> {
        let mut target = hook.clone();
        if target.metadata.name.as_deref().unwrap_or_default().is_empty() {
            let generate_name = target.metadata.generate_name.clone().unwrap_or_default();
            target.metadata.name = Some(generated_hook_name(
                &generate_name,
                &self.revision,
                phase,
                self.started_at.timestamp(),
            ));
        }
        if target.namespace().unwrap_or_default().is_empty() {
            let gk = ResourceKey::from_object(&target).group_kind();
            if self.scopes.get(&gk) == Some(&true) {
                target.metadata.namespace = Some(self.namespace.clone());
            }
        }
        let live = self.live_of(&ResourceKey::from_object(&target));
        SyncTask::new(phase, Some(target), live)
    }

    async fn namespace_task(&mut self, tasks: &[SyncTask]) -> Option<SyncTask> {
        let managed = self.managed_namespace.clone()?;
        let name = managed.object.name_any();
        let declared = tasks.iter().any(|t| t.is_namespace() && t.key.name == name)
            || self.hooks.iter().any(|h| {
                let key = ResourceKey::from_object(h);
                key.group.is_empty() && key.kind == "Namespace" && key.name == name
            });
        if declared {
            return None;
        }

        let key = ResourceKey::from_object(&managed.object);
        let mut task = SyncTask::new(SyncPhase::PreSync, Some(managed.object.clone()), None)?;
        match self.executor.get(&key, "v1").await {
            Ok(live) => {
                task.live = Some(live);
                let recorded = self.result_index.contains_key(&task.result_key());
                if !managed.always_apply && !recorded {
                    debug!(namespace = %name, "Namespace already exists");
                    return None;
                }
                Some(task)
            }
            Err(e) if e.is_not_found() => Some(task),
            Err(e) => {
                let message = format!("namespaceModifier error: {}", e);
                self.set_resource_result(
                    &mut task,
                    Some(ResultCode::SyncFailed),
                    Some(OperationPhase::Error),
                    &message,
                );
                Some(task)
            }
        }
    }

    /// Build the ordered task list. The flag is false when any task is
    /// invalid.
    async fn sync_tasks(&mut self) -> (Vec<SyncTask>, bool) {
        let mut tasks = Vec::new();
        for (key, target, live) in &self.resources {
            if !self.filter_allows(key, target.as_ref(), live.as_ref()) {
                continue;
            }
            let Some(obj) = target.as_ref().or(live.as_ref()) else {
                continue;
            };
            if is_hook(obj) {
                continue;
            }
            for phase in sync_phases(obj) {
                if let Some(task) = SyncTask::new(phase, target.clone(), live.clone()) {
                    tasks.push(task);
                }
            }
        }

        if !self.opts.skip_hooks {
            for hook in &self.hooks {
                for phase in sync_phases(hook) {
                    if let Some(task) = self.hook_task(hook, phase) {
                        tasks.push(task);
                    }
                }
            }
        }

        if let Some(task) = self.namespace_task(&tasks).await {
            tasks.push(task);
        }

        let mut valid = true;
        let mut invalid: Vec<(usize, String)> = Vec::new();
        for (i, task) in tasks.iter_mut().enumerate() {
            if task.sync_status == Some(ResultCode::SyncFailed) {
                valid = false;
                continue;
            }
            let gk = task.group_kind();
            match self.scopes.get(&gk) {
                Some(&namespaced) => {
                    if let (Some(validator), Some(obj)) = (&self.permission_validator, task.obj()) {
                        if let Err(message) = validator(obj, namespaced) {
                            invalid.push((i, message));
                        }
                    }
                }
                None => {
                    let skip = self.opts.skip_dry_run_on_missing
                        || task
                            .target
                            .as_ref()
                            .map(|t| has_sync_option(t, SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING))
                            .unwrap_or(false)
                        || self.has_crd_of(&gk);
                    if skip {
                        debug!(task = %task, "Skip dry-run for custom resource");
                        task.skip_dry_run = true;
                    } else {
                        invalid.push((
                            i,
                            format!("the server could not find the requested resource {}", gk),
                        ));
                    }
                }
            }
        }
        for (i, message) in invalid {
            valid = false;
            let mut task = tasks[i].clone();
            self.set_resource_result(&mut task, Some(ResultCode::SyncFailed), None, &message);
            tasks[i] = task;
        }

        reverse_prune_waves(&mut tasks);
        let all_prune_last = self.opts.prune_last;
        prune_last(&mut tasks, |t| {
            all_prune_last
                || t.live
                    .as_ref()
                    .map(|l| has_sync_option(l, SYNC_OPTION_PRUNE_LAST))
                    .unwrap_or(false)
        });
        sort_tasks(&mut tasks);

        for task in tasks.iter_mut() {
            if let Some(&i) = self.result_index.get(&task.result_key()) {
                task.apply_result(&self.results[i]);
            }
        }
        (tasks, valid)
    }

    /// Phase of a hook derived from the health of its live object
    fn hook_phase(&self, live: &DynamicObject) -> (OperationPhase, String) {
        let mut phase = OperationPhase::Succeeded;
        let mut message = format!("{} created", live.name_any());
        if let Some(health) = resource_health(live, &self.settings) {
            let health_message = health.message.clone().unwrap_or_default();
            match health.status {
                HealthStatusCode::Unknown | HealthStatusCode::Degraded => {
                    phase = OperationPhase::Failed;
                    message = health_message;
                }
                HealthStatusCode::Progressing | HealthStatusCode::Suspended => {
                    phase = OperationPhase::Running;
                    message = health_message;
                }
                HealthStatusCode::Healthy => {
                    message = health_message;
                }
                HealthStatusCode::Missing => {}
            }
        }
        (phase, message)
    }

    fn refresh_running(&mut self, tasks: &mut [SyncTask]) {
        for i in 0..tasks.len() {
            if !tasks[i].running() {
                continue;
            }
            let Some(live) = tasks[i].live.clone() else {
                continue;
            };
            let mut task = tasks[i].clone();
            if task.is_hook() {
                let (phase, message) = self.hook_phase(&live);
                let status = task.sync_status;
                self.set_resource_result(&mut task, status, Some(phase), &message);
            } else {
                let status = task.sync_status;
                match resource_health(&live, &self.settings) {
                    None => {
                        let message = task.message.clone();
                        self.set_resource_result(
                            &mut task,
                            status,
                            Some(OperationPhase::Succeeded),
                            &message,
                        );
                    }
                    Some(health) => {
                        let message = health.message.clone().unwrap_or_default();
                        match health.status {
                            HealthStatusCode::Healthy => self.set_resource_result(
                                &mut task,
                                status,
                                Some(OperationPhase::Succeeded),
                                &message,
                            ),
                            HealthStatusCode::Degraded => self.set_resource_result(
                                &mut task,
                                status,
                                Some(OperationPhase::Failed),
                                &message,
                            ),
                            _ => {}
                        }
                    }
                }
            }
            tasks[i] = task;
        }
    }

    fn filter_out_of_sync(&self, tasks: &[SyncTask], indices: Vec<usize>) -> Vec<usize> {
        indices
            .into_iter()
            .filter(|&i| {
                let t = &tasks[i];
                if t.is_hook() || t.target.is_none() || t.live.is_none() {
                    return true;
                }
                self.modified.get(&t.key).copied().unwrap_or(true)
            })
            .collect()
    }

    fn set_running_phase(&mut self, tasks: &[SyncTask], indices: &[usize], pending_deletion: bool) {
        let Some(&first) = indices.first() else {
            return;
        };
        let first = &tasks[first];
        let (mut waiting_for, and_more) = if first.is_hook() {
            ("completion of hook", "hooks")
        } else {
            ("healthy state of", "resources")
        };
        if pending_deletion {
            waiting_for = "deletion of";
        }
        let mut message = format!(
            "waiting for {} {}/{}/{}",
            waiting_for, first.key.group, first.key.kind, first.key.name
        );
        if indices.len() > 1 {
            message = format!("{} and {} more {}", message, indices.len() - 1, and_more);
        }
        self.set_phase(OperationPhase::Running, message);
    }

    async fn delete_task_object(&self, task: &SyncTask) -> crate::error::Result<()> {
        self.executor
            .delete(&task.key, &task.version, self.opts.prune_propagation, false)
            .await
    }

    async fn delete_hooks(&mut self, tasks: &mut [SyncTask], indices: &[usize]) {
        for &i in indices {
            if let Err(e) = self.delete_task_object(&tasks[i]).await {
                if !e.is_not_found() {
                    let mut task = tasks[i].clone();
                    let status = task.sync_status;
                    self.set_resource_result(
                        &mut task,
                        status,
                        Some(OperationPhase::Error),
                        &format!("failed to delete resource: {}", e),
                    );
                    tasks[i] = task;
                }
            }
        }
    }

    async fn prune_object(&self, task: &SyncTask, dry_run: bool) -> (ResultCode, String) {
        let Some(live) = task.live.as_ref() else {
            return (ResultCode::Pruned, "pruned".to_string());
        };
        if !self.opts.prune {
            return (ResultCode::PruneSkipped, "ignored (requires pruning)".to_string());
        }
        if has_sync_option(live, SYNC_OPTION_PRUNE_DISABLED) {
            return (ResultCode::PruneSkipped, "ignored (no prune)".to_string());
        }
        if dry_run {
            return (ResultCode::Pruned, "pruned (dry run)".to_string());
        }
        if live.metadata.deletion_timestamp.is_none() {
            if let Err(e) = self.delete_task_object(task).await {
                if !e.is_not_found() {
                    return (ResultCode::SyncFailed, e.to_string());
                }
            }
        }
        (ResultCode::Pruned, "pruned".to_string())
    }

    async fn apply_object(&self, task: &SyncTask, dry_run: bool) -> (ResultCode, String) {
        let Some(target) = task.target.as_ref() else {
            return (ResultCode::SyncFailed, "no desired state".to_string());
        };
        let replace = self.opts.replace || has_sync_option(target, SYNC_OPTION_REPLACE);
        let force = self.opts.force || has_sync_option(target, SYNC_OPTION_FORCE);
        let server_side = !dry_run
            && (self.opts.server_side_apply || has_sync_option(target, SYNC_OPTION_SERVER_SIDE_APPLY));
        let validate = self.opts.validate && !has_sync_option(target, SYNC_OPTION_VALIDATE_DISABLED);
        let name = kubectl_name(task);

        let result = match (replace, task.live.as_ref()) {
            (true, Some(live)) if task.is_crd() || task.is_namespace() => {
                // replacing would delete everything the object contains
                let mut update = target.clone();
                update.metadata.resource_version = live.metadata.resource_version.clone();
                let opts = ApplyOptions {
                    dry_run,
                    validate,
                    ..Default::default()
                };
                self.executor
                    .apply(&update, &opts)
                    .await
                    .map(|_| format!("{} updated", name))
            }
            (true, Some(_)) => {
                let opts = ApplyOptions {
                    dry_run,
                    force,
                    replace: true,
                    validate,
                    server_side: false,
                };
                self.executor
                    .apply(target, &opts)
                    .await
                    .map(|_| format!("{} replaced", name))
            }
            (true, None) => self
                .executor
                .create(target, dry_run)
                .await
                .map(|_| format!("{} created", name)),
            (false, live) => {
                let opts = ApplyOptions {
                    dry_run,
                    force,
                    server_side,
                    replace: false,
                    validate,
                };
                let verb = if live.is_some() { "configured" } else { "created" };
                self.executor
                    .apply(target, &opts)
                    .await
                    .map(|_| format!("{} {}", name, verb))
            }
        };

        match result {
            Ok(mut message) => {
                if dry_run {
                    message.push_str(" (dry run)");
                }
                (ResultCode::Synced, message)
            }
            Err(e) => (ResultCode::SyncFailed, e.to_string()),
        }
    }

    async fn process_create_tasks(
        &mut self,
        state: RunState,
        tasks: &mut [SyncTask],
        group: &[usize],
        dry_run: bool,
    ) -> RunState {
        let runnable: Vec<usize> = group
            .iter()
            .copied()
            .filter(|&i| !(dry_run && tasks[i].skip_dry_run))
            .collect();
        let outcomes = {
            let this = &*self;
            let view: &[SyncTask] = tasks;
            join_all(runnable.iter().map(|&i| async move {
                (i, this.apply_object(&view[i], dry_run).await)
            }))
            .await
        };

        let mut state = state;
        for (i, (code, message)) in outcomes {
            if code == ResultCode::SyncFailed {
                info!(task = %tasks[i], dry_run, message = %message, "Apply failed");
                state = state.merge(RunState::Failed);
            }
            if !dry_run || self.opts.dry_run || code == ResultCode::SyncFailed {
                let mut phase = operation_phase_for(code);
                if self.opts.dry_run && phase == OperationPhase::Running {
                    phase = OperationPhase::Succeeded;
                }
                let mut task = tasks[i].clone();
                self.set_resource_result(&mut task, Some(code), Some(phase), &message);
                tasks[i] = task;
            }
        }
        state
    }

    async fn run_tasks(&mut self, tasks: &mut [SyncTask], indices: &[usize], dry_run: bool) -> RunState {
        let dry_run = dry_run || self.opts.dry_run;
        debug!(tasks = indices.len(), dry_run, "Running tasks");
        let (prunes, creates): (Vec<usize>, Vec<usize>) =
            indices.iter().partition(|&&i| tasks[i].is_prune());

        if !self.opts.prune_confirmed {
            let waiting: Vec<String> = prunes
                .iter()
                .filter_map(|&i| {
                    let live = tasks[i].live.as_ref()?;
                    has_sync_option(live, SYNC_OPTION_PRUNE_CONFIRM).then(|| {
                        let t = &tasks[i];
                        format!(
                            "{}/{}/{}",
                            join_api_version(&t.key.group, &t.version),
                            t.key.kind,
                            t.key.name
                        )
                    })
                })
                .collect();
            if let Some(first) = waiting.first() {
                info!(resources = ?waiting, "Prune requires confirmation");
                let and_more = if waiting.len() > 1 {
                    format!(" and {} more resources", waiting.len() - 1)
                } else {
                    String::new()
                };
                self.message = format!("Waiting for pruning confirmation of {}{}", first, and_more);
                return RunState::Pending;
            }
        }

        let mut state = RunState::Successful;
        let outcomes = {
            let this = &*self;
            let view: &[SyncTask] = tasks;
            join_all(prunes.iter().map(|&i| async move {
                (i, this.prune_object(&view[i], dry_run).await)
            }))
            .await
        };
        for (i, (code, message)) in outcomes {
            if code == ResultCode::SyncFailed {
                info!(task = %tasks[i], dry_run, message = %message, "Pruning failed");
                state = state.merge(RunState::Failed);
            }
            if !dry_run || self.opts.dry_run || code == ResultCode::SyncFailed {
                let mut task = tasks[i].clone();
                self.set_resource_result(
                    &mut task,
                    Some(code),
                    Some(operation_phase_for(code)),
                    &message,
                );
                tasks[i] = task;
            }
        }
        if state != RunState::Successful {
            return state;
        }

        let delete_first: Vec<usize> = creates
            .iter()
            .copied()
            .filter(|&i| tasks[i].delete_before_creation())
            .collect();
        if !delete_first.is_empty() && !dry_run {
            for i in delete_first {
                debug!(task = %tasks[i], "Deleting previous hook");
                match self.delete_task_object(&tasks[i]).await {
                    Ok(()) => state = state.merge(RunState::Pending),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        state = state.merge(RunState::Failed);
                        let mut task = tasks[i].clone();
                        self.set_resource_result(
                            &mut task,
                            None,
                            Some(OperationPhase::Error),
                            &format!("failed to delete resource: {}", e),
                        );
                        tasks[i] = task;
                    }
                }
            }
        }
        if state != RunState::Successful {
            return state;
        }

        // objects of one kind are applied together, kinds one after another
        let mut group: Vec<usize> = Vec::new();
        for i in creates {
            if let Some(&head) = group.first() {
                if tasks[head].key.kind != tasks[i].key.kind {
                    state = self.process_create_tasks(state, tasks, &group, dry_run).await;
                    group.clear();
                }
            }
            group.push(i);
        }
        if !group.is_empty() {
            state = self.process_create_tasks(state, tasks, &group, dry_run).await;
        }
        state
    }

    async fn set_operation_failed(
        &mut self,
        tasks: &mut [SyncTask],
        sync_fail: &[usize],
        failed: &[usize],
        message: &str,
    ) {
        let reasons: Vec<&str> = failed.iter().map(|&i| tasks[i].message.as_str()).collect();
        let message = if reasons.is_empty() {
            message.to_string()
        } else {
            format!("{}, reason: {}", message, reasons.join(","))
        };
        if sync_fail.is_empty() || sync_fail.iter().all(|&i| tasks[i].completed()) {
            self.set_phase(OperationPhase::Failed, message);
            return;
        }
        debug!(tasks = sync_fail.len(), "Running sync fail tasks");
        if self.run_tasks(tasks, sync_fail, false).await == RunState::Failed {
            self.set_phase(OperationPhase::Failed, message);
        }
    }

    fn namespace_creation_task(&self, tasks: &[SyncTask]) -> Option<usize> {
        let name = self.managed_namespace.as_ref()?.object.name_any();
        tasks.iter().position(|t| {
            t.is_namespace()
                && t.key.name == name
                && t.phase == SyncPhase::PreSync
                && t.live.is_none()
                && t.pending()
        })
    }

    /// Advance the operation by one step
    pub async fn sync(&mut self) {
        info!(skip_hooks = self.opts.skip_hooks, started = self.started(), "Syncing");
        let (mut tasks, valid) = self.sync_tasks().await;
        if !valid {
            self.set_phase(
                OperationPhase::Failed,
                "one or more synchronization tasks are not valid",
            );
            return;
        }

        if !self.started() {
            let mut dry_run: Vec<usize> = (0..tasks.len()).collect();
            if let Some(ns) = self.namespace_creation_task(&tasks) {
                info!(task = %tasks[ns], "Creating namespace");
                if self.run_tasks(&mut tasks, &[ns], false).await == RunState::Failed {
                    self.set_operation_failed(&mut tasks, &[], &[ns], "the namespace failed to apply")
                        .await;
                    return;
                }
                dry_run.retain(|&i| i != ns);
            }
            if self.opts.apply_out_of_sync_only {
                dry_run = self.filter_out_of_sync(&tasks, dry_run);
            }
            debug!(tasks = dry_run.len(), "Tasks (dry-run)");
            if self.run_tasks(&mut tasks, &dry_run, true).await == RunState::Failed {
                self.set_phase(
                    OperationPhase::Failed,
                    "one or more objects failed to apply (dry run)",
                );
                return;
            }
        }

        self.refresh_running(&mut tasks);

        let multi_step = super::tasks::is_multi_step(&tasks);
        let running: Vec<usize> = (0..tasks.len())
            .filter(|&i| (multi_step || tasks[i].is_hook()) && tasks[i].running())
            .collect();
        if !running.is_empty() {
            self.set_running_phase(&tasks, &running, false);
            return;
        }

        let completed_hooks = |policy: fn(&SyncTask) -> bool, tasks: &[SyncTask]| -> Vec<usize> {
            (0..tasks.len())
                .filter(|&i| {
                    let t = &tasks[i];
                    t.is_hook() && t.live.is_some() && !t.running() && policy(t)
                })
                .collect()
        };
        let delete_on_success = completed_hooks(SyncTask::delete_on_phase_successful, &tasks);
        let delete_on_failure = completed_hooks(SyncTask::delete_on_phase_failed, &tasks);

        let (sync_fail, rest): (Vec<usize>, Vec<usize>) =
            (0..tasks.len()).partition(|&i| tasks[i].phase == SyncPhase::SyncFail);
        let sync_failed: Vec<usize> = rest
            .iter()
            .copied()
            .filter(|&i| tasks[i].sync_status == Some(ResultCode::SyncFailed))
            .collect();

        if rest
            .iter()
            .any(|&i| tasks[i].completed() && !tasks[i].successful())
        {
            self.delete_hooks(&mut tasks, &delete_on_failure).await;
            self.set_operation_failed(
                &mut tasks,
                &sync_fail,
                &sync_failed,
                "one or more synchronization tasks completed unsuccessfully",
            )
            .await;
            return;
        }

        let mut pending: Vec<usize> = rest.into_iter().filter(|&i| tasks[i].pending()).collect();
        if self.opts.apply_out_of_sync_only {
            pending = self.filter_out_of_sync(&tasks, pending);
        }
        let (Some(&first), Some(&last)) = (pending.first(), pending.last()) else {
            self.delete_hooks(&mut tasks, &delete_on_success).await;
            self.set_phase(OperationPhase::Succeeded, "successfully synced (no more tasks)");
            return;
        };

        let phase = tasks[first].phase;
        let wave = tasks[first].wave();
        let final_wave = phase == tasks[last].phase && wave == tasks[last].wave();
        let remaining: Vec<usize> = pending
            .iter()
            .copied()
            .filter(|&i| tasks[i].phase != phase || tasks[i].wave() != wave || tasks[i].is_hook())
            .collect();
        let current: Vec<usize> = pending
            .into_iter()
            .filter(|&i| tasks[i].phase == phase && tasks[i].wave() == wave)
            .collect();

        self.set_phase(OperationPhase::Running, "one or more tasks are running");
        debug!(%phase, wave, tasks = current.len(), "Wet-run");
        let state = self.run_tasks(&mut tasks, &current, false).await;

        if state != RunState::Failed && !final_wave && !self.opts.wave_delay.is_zero() {
            tokio::time::sleep(self.opts.wave_delay).await;
        }

        match state {
            RunState::Failed => {
                let failed: Vec<usize> = current
                    .iter()
                    .copied()
                    .filter(|&i| tasks[i].sync_status == Some(ResultCode::SyncFailed))
                    .collect();
                self.delete_hooks(&mut tasks, &delete_on_failure).await;
                self.set_operation_failed(
                    &mut tasks,
                    &sync_fail,
                    &failed,
                    "one or more objects failed to apply",
                )
                .await;
            }
            RunState::Successful => {
                if remaining.is_empty() {
                    self.delete_hooks(&mut tasks, &delete_on_success).await;
                    self.set_phase(OperationPhase::Succeeded, "successfully synced (all tasks run)");
                } else {
                    self.set_running_phase(&tasks, &remaining, false);
                }
            }
            RunState::Pending => {
                let deleting: Vec<usize> = (0..tasks.len())
                    .filter(|&i| tasks[i].delete_on_phase_completion())
                    .collect();
                self.set_running_phase(&tasks, &deleting, true);
            }
        }
    }

    /// Stop the operation, deleting hooks that are still running
    pub async fn terminate(&mut self) {
        debug!("Terminating");
        let (mut tasks, _) = self.sync_tasks().await;
        let mut clean = true;
        for i in 0..tasks.len() {
            if !tasks[i].is_hook() {
                continue;
            }
            let Some(live) = tasks[i].live.clone() else {
                continue;
            };
            let (phase, message) = self.hook_phase(&live);
            let mut task = tasks[i].clone();
            let status = task.sync_status;
            if phase == OperationPhase::Running {
                match self.delete_task_object(&task).await {
                    Err(e) if !e.is_not_found() => {
                        warn!(task = %task, error = %e, "Failed to delete running hook");
                        clean = false;
                        self.set_resource_result(
                            &mut task,
                            status,
                            Some(OperationPhase::Failed),
                            &format!("Failed to delete: {}", e),
                        );
                    }
                    _ => self.set_resource_result(
                        &mut task,
                        status,
                        Some(OperationPhase::Succeeded),
                        "Deleted",
                    ),
                }
            } else {
                self.set_resource_result(&mut task, status, Some(phase), &message);
            }
            tasks[i] = task;
        }
        if clean {
            self.set_phase(OperationPhase::Failed, "Operation terminated");
        } else {
            self.set_phase(OperationPhase::Error, "Operation termination had errors");
        }
    }
}

