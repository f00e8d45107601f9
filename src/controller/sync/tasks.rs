//! Sync tasks and their execution order
//!
//! A task pairs the desired object (absent for prunes) with the live object
//! (absent for creates) in one sync phase. Tasks run grouped by
//! `(phase, wave)`; the order inside a group only matters for creation of
//! dependencies, which is why namespaces and CRDs are hoisted in front of the
//! objects that need them.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt;

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::crd::{HookDeletePolicy, HookType, OperationPhase, ResourceResult, ResultCode, SyncPhase};
use crate::resource::annotations::{hook_delete_policies, hook_types, is_hook, sync_wave};
use crate::resource::{
    crd_group_kind, group_version, GroupKind, ResourceKey, CRD_GROUP, CRD_KIND, NAMESPACE_KIND,
};

/// Kinds in creation order. Kinds not listed sort after all of these.
pub const KIND_ORDER: &[&str] = &[
    "Namespace",
    "NetworkPolicy",
    "ResourceQuota",
    "LimitRange",
    "PodSecurityPolicy",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "SecretList",
    "ConfigMap",
    "StorageClass",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleList",
    "ClusterRoleBinding",
    "ClusterRoleBindingList",
    "Role",
    "RoleList",
    "RoleBinding",
    "RoleBindingList",
    "Service",
    "DaemonSet",
    "Pod",
    "ReplicationController",
    "ReplicaSet",
    "Deployment",
    "HorizontalPodAutoscaler",
    "StatefulSet",
    "Job",
    "CronJob",
    "IngressClass",
    "Ingress",
    "APIService",
];

/// One unit of work of a sync operation
#[derive(Clone, Debug)]
pub struct SyncTask {
    pub phase: SyncPhase,
    pub key: ResourceKey,
    pub version: String,
    pub target: Option<DynamicObject>,
    pub live: Option<DynamicObject>,
    /// Set when the task was moved next to a dependent
    pub wave_override: Option<i64>,
    pub skip_dry_run: bool,
    pub sync_status: Option<ResultCode>,
    pub operation_state: Option<OperationPhase>,
    pub message: String,
}

impl SyncTask {
    /// Returns `None` when neither object is given
    pub fn new(
        phase: SyncPhase,
        target: Option<DynamicObject>,
        live: Option<DynamicObject>,
    ) -> Option<Self> {
        let obj = target.as_ref().or(live.as_ref())?;
        let key = ResourceKey::from_object(obj);
        let (_, version) = group_version(obj);
        Some(Self {
            phase,
            key,
            version,
            target,
            live,
            wave_override: None,
            skip_dry_run: false,
            sync_status: None,
            operation_state: None,
            message: String::new(),
        })
    }

    /// The target when present, else the live object
    pub fn obj(&self) -> Option<&DynamicObject> {
        self.target.as_ref().or(self.live.as_ref())
    }

    pub fn group_kind(&self) -> GroupKind {
        self.key.group_kind()
    }

    pub fn is_prune(&self) -> bool {
        self.target.is_none()
    }

    pub fn is_hook(&self) -> bool {
        self.obj().map(is_hook).unwrap_or(false)
    }

    pub fn is_namespace(&self) -> bool {
        self.key.group.is_empty() && self.key.kind == NAMESPACE_KIND
    }

    pub fn is_crd(&self) -> bool {
        self.key.group == CRD_GROUP && self.key.kind == CRD_KIND
    }

    /// Hook type matching the phase the task runs in
    pub fn hook_type(&self) -> Option<HookType> {
        if !self.is_hook() {
            return None;
        }
        self.obj().and_then(|obj| {
            hook_types(obj)
                .into_iter()
                .find(|t| t.sync_phase() == Some(self.phase))
        })
    }

    pub fn wave(&self) -> i64 {
        self.wave_override
            .unwrap_or_else(|| self.obj().map(sync_wave).unwrap_or(0))
    }

    pub fn pending(&self) -> bool {
        self.operation_state.is_none()
    }

    pub fn running(&self) -> bool {
        self.operation_state == Some(OperationPhase::Running)
    }

    pub fn completed(&self) -> bool {
        self.operation_state
            .map(OperationPhase::is_completed)
            .unwrap_or(false)
    }

    pub fn successful(&self) -> bool {
        self.operation_state == Some(OperationPhase::Succeeded)
    }

    fn has_delete_policy(&self, policy: HookDeletePolicy) -> bool {
        self.is_hook()
            && self
                .obj()
                .map(|o| hook_delete_policies(o).contains(&policy))
                .unwrap_or(false)
    }

    /// A pending hook whose previous run must be removed first
    pub fn delete_before_creation(&self) -> bool {
        self.live.is_some()
            && self.pending()
            && self.has_delete_policy(HookDeletePolicy::BeforeHookCreation)
    }

    pub fn delete_on_phase_successful(&self) -> bool {
        self.live.is_some() && self.has_delete_policy(HookDeletePolicy::HookSucceeded)
    }

    pub fn delete_on_phase_failed(&self) -> bool {
        self.live.is_some() && self.has_delete_policy(HookDeletePolicy::HookFailed)
    }

    pub fn delete_on_phase_completion(&self) -> bool {
        self.delete_on_phase_successful() || self.delete_on_phase_failed()
    }

    /// Identity of the task across sync steps
    pub fn result_key(&self) -> String {
        result_key(&self.key, self.phase)
    }

    /// Copy the outcome recorded by an earlier step
    pub fn apply_result(&mut self, result: &ResourceResult) {
        self.sync_status = result.status;
        self.operation_state = result.hook_phase;
        self.message = result.message.clone();
    }

    pub fn to_result(&self) -> ResourceResult {
        ResourceResult {
            group: self.key.group.clone(),
            version: self.version.clone(),
            kind: self.key.kind.clone(),
            namespace: self.key.namespace.clone(),
            name: self.key.name.clone(),
            status: self.sync_status,
            message: self.message.clone(),
            hook_type: self.hook_type(),
            hook_phase: self.operation_state,
            sync_phase: Some(self.phase),
        }
    }
}

impl fmt::Display for SyncTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{} phase={} wave={} prune={} hook={}",
            self.key.group,
            self.key.kind,
            self.key.namespace,
            self.key.name,
            self.phase,
            self.wave(),
            self.is_prune(),
            self.is_hook()
        )
    }
}

pub fn result_key(key: &ResourceKey, phase: SyncPhase) -> String {
    format!("{}:{}", key, phase)
}

/// Key of a recorded result, matching [`SyncTask::result_key`]
pub fn resource_result_key(result: &ResourceResult) -> String {
    result_key(
        &ResourceKey::new(&result.group, &result.kind, &result.namespace, &result.name),
        result.sync_phase.unwrap_or_default(),
    )
}

/// Phases an object takes part in. Plain resources only sync.
pub fn sync_phases(obj: &DynamicObject) -> Vec<SyncPhase> {
    if !is_hook(obj) {
        return vec![SyncPhase::Sync];
    }
    let mut phases: Vec<SyncPhase> = hook_types(obj)
        .into_iter()
        .filter_map(HookType::sync_phase)
        .collect();
    phases.sort();
    phases.dedup();
    phases
}

/// Name for a hook that only carries `generateName`.
///
/// The name is stable for one operation so later steps find the object
/// created by the first one.
pub fn generated_hook_name(
    generate_name: &str,
    revision: &str,
    phase: SyncPhase,
    started_at_unix: i64,
) -> String {
    let short: String = revision.chars().take(7).collect();
    format!(
        "{}{}",
        generate_name,
        format!("{}-{}-{}", short, phase, started_at_unix).to_lowercase()
    )
}

fn kind_position(kind: &str) -> Option<usize> {
    KIND_ORDER.iter().position(|k| *k == kind)
}

/// Rank of a task among the kinds. A custom resource whose definition is
/// part of the same sync ranks right after `CustomResourceDefinition`.
fn kind_rank(task: &SyncTask, synced_crds: &HashSet<GroupKind>) -> (usize, usize) {
    if let Some(pos) = kind_position(&task.key.kind) {
        return (pos, 0);
    }
    if synced_crds.contains(&task.group_kind()) {
        if let Some(pos) = kind_position(CRD_KIND) {
            return (pos, 1);
        }
    }
    (KIND_ORDER.len(), 0)
}

fn compare_tasks(a: &SyncTask, b: &SyncTask, synced_crds: &HashSet<GroupKind>) -> Ordering {
    a.phase
        .cmp(&b.phase)
        .then_with(|| a.wave().cmp(&b.wave()))
        .then_with(|| kind_rank(a, synced_crds).cmp(&kind_rank(b, synced_crds)))
        .then_with(|| a.key.kind.cmp(&b.key.kind))
        .then_with(|| a.key.group.cmp(&b.key.group))
        .then_with(|| a.key.namespace.cmp(&b.key.namespace))
        .then_with(|| a.key.name.cmp(&b.key.name))
}

/// Group kinds defined by the CRDs among the tasks
fn synced_crds(tasks: &[SyncTask]) -> HashSet<GroupKind> {
    tasks
        .iter()
        .filter(|t| !t.is_prune() && t.is_crd())
        .filter_map(|t| t.target.as_ref().and_then(crd_group_kind))
        .collect()
}

/// Sort tasks into execution order.
///
/// Afterwards a namespace or CRD that would run later than an object
/// depending on it is moved in front of that object, taking over its phase
/// and wave.
pub fn sort_tasks(tasks: &mut Vec<SyncTask>) {
    let crds = synced_crds(tasks);
    tasks.sort_by(|a, b| compare_tasks(a, b, &crds));

    hoist_dependencies(
        tasks,
        |t| t.is_namespace().then(|| t.key.name.clone()),
        |t| (!t.key.namespace.is_empty()).then(|| t.key.namespace.clone()),
    );
    hoist_dependencies(
        tasks,
        |t| {
            t.is_crd()
                .then(|| t.target.as_ref().and_then(crd_group_kind))
                .flatten()
                .map(|gk| gk.to_string())
        },
        |t| Some(t.group_kind().to_string()),
    );
}

fn hoist_dependencies<D, R>(tasks: &mut Vec<SyncTask>, provides: D, requires: R)
where
    D: Fn(&SyncTask) -> Option<String>,
    R: Fn(&SyncTask) -> Option<String>,
{
    let mut first_user: HashMap<String, usize> = HashMap::new();
    let mut i = 0;
    while i < tasks.len() {
        if tasks[i].is_prune() {
            i += 1;
            continue;
        }
        if let Some(dep) = provides(&tasks[i]) {
            if let Some(&index) = first_user.get(&dep) {
                let phase = tasks[index].phase;
                let wave = tasks[index].wave();
                let mut task = tasks.remove(i);
                task.phase = phase;
                task.wave_override = Some(wave);
                tasks.insert(index, task);
                for pos in first_user.values_mut() {
                    if *pos >= index {
                        *pos += 1;
                    }
                }
            }
        } else if let Some(dep) = requires(&tasks[i]) {
            first_user.entry(dep).or_insert(i);
        }
        i += 1;
    }
}

/// Mirror the waves of prune tasks so the highest wave is deleted first
pub fn reverse_prune_waves(tasks: &mut [SyncTask]) {
    let mut waves: Vec<i64> = tasks
        .iter()
        .filter(|t| t.is_prune())
        .map(SyncTask::wave)
        .collect();
    waves.sort_unstable();
    waves.dedup();
    if waves.len() < 2 {
        return;
    }
    let mirrored: HashMap<i64, i64> = waves
        .iter()
        .zip(waves.iter().rev())
        .map(|(from, to)| (*from, *to))
        .collect();
    for task in tasks.iter_mut().filter(|t| t.is_prune()) {
        let wave = task.wave();
        if let Some(to) = mirrored.get(&wave) {
            task.wave_override = Some(*to);
        }
    }
}

/// Move prune tasks behind the last wave of the Sync phase
pub fn prune_last<F>(tasks: &mut [SyncTask], applies: F)
where
    F: Fn(&SyncTask) -> bool,
{
    let last_wave = tasks
        .iter()
        .filter(|t| t.phase == SyncPhase::Sync)
        .map(SyncTask::wave)
        .fold(0, i64::max)
        + 1;
    for task in tasks.iter_mut().filter(|t| t.is_prune() && applies(t)) {
        task.wave_override = Some(last_wave);
    }
}

/// `(phase, wave)` of the first task
pub fn first_group(tasks: &[SyncTask]) -> Option<(SyncPhase, i64)> {
    tasks.first().map(|t| (t.phase, t.wave()))
}

/// Whether the tasks span more than one `(phase, wave)` group
pub fn is_multi_step(tasks: &[SyncTask]) -> bool {
    match (tasks.first(), tasks.last()) {
        (Some(first), Some(last)) => first.phase != last.phase || first.wave() != last.wave(),
        _ => false,
    }
}

/// Short description of a task for operation messages
pub fn describe(task: &SyncTask) -> String {
    let obj_name = task
        .obj()
        .map(|o| o.name_any())
        .unwrap_or_else(|| task.key.name.clone());
    if task.key.group.is_empty() {
        format!("{}/{}", task.key.kind, obj_name)
    } else {
        format!("{}/{}/{}", task.key.group, task.key.kind, obj_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::new_object;
    use serde_json::json;

    fn task(api_version: &str, kind: &str, namespace: &str, name: &str) -> SyncTask {
        SyncTask::new(
            SyncPhase::Sync,
            Some(new_object(api_version, kind, namespace, name)),
            None,
        )
        .unwrap()
    }

    fn with_wave(mut t: SyncTask, wave: i64) -> SyncTask {
        if let Some(target) = t.target.as_mut() {
            target.annotations_mut().insert(
                "driftwatch.io/sync-wave".to_string(),
                wave.to_string(),
            );
        }
        t
    }

    fn names(tasks: &[SyncTask]) -> Vec<String> {
        tasks.iter().map(|t| t.key.name.clone()).collect()
    }

    #[test]
    fn test_task_requires_an_object() {
        assert!(SyncTask::new(SyncPhase::Sync, None, None).is_none());
    }

    #[test]
    fn test_kind_order_within_wave() {
        let mut tasks = vec![
            task("networking.k8s.io/v1", "Ingress", "web", "ingress"),
            task("apps/v1", "Deployment", "web", "deploy"),
            task("v1", "Service", "web", "svc"),
            task("v1", "ConfigMap", "web", "cm"),
            task("example.com/v1", "Widget", "web", "widget"),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["cm", "svc", "deploy", "ingress", "widget"]);
    }

    #[test]
    fn test_wave_before_kind() {
        let mut tasks = vec![
            with_wave(task("v1", "ConfigMap", "web", "late"), 1),
            task("apps/v1", "Deployment", "web", "early"),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["early", "late"]);
    }

    #[test]
    fn test_phase_before_wave() {
        let mut hook = new_object("batch/v1", "Job", "web", "migrate");
        hook.annotations_mut()
            .insert("driftwatch.io/hook".to_string(), "PreSync".to_string());
        hook.annotations_mut()
            .insert("driftwatch.io/sync-wave".to_string(), "5".to_string());
        let mut tasks = vec![
            task("v1", "ConfigMap", "web", "cm"),
            SyncTask::new(SyncPhase::PreSync, Some(hook), None).unwrap(),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["migrate", "cm"]);
        assert_eq!(tasks[0].hook_type(), Some(HookType::PreSync));
    }

    #[test]
    fn test_namespace_hoisted_to_first_user() {
        let mut tasks = vec![
            with_wave(task("v1", "Namespace", "", "web"), 3),
            with_wave(task("v1", "ConfigMap", "web", "cm"), -1),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["web", "cm"]);
        assert_eq!(tasks[0].wave(), -1);
    }

    #[test]
    fn test_custom_resource_follows_its_crd() {
        let mut crd = new_object("apiextensions.k8s.io/v1", "CustomResourceDefinition", "", "widgets.example.com");
        crd.data = json!({"spec": {"group": "example.com", "names": {"kind": "Widget"}}});
        let mut tasks = vec![
            task("apps/v1", "Deployment", "web", "deploy"),
            task("example.com/v1", "Widget", "web", "widget"),
            SyncTask::new(SyncPhase::Sync, Some(crd), None).unwrap(),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["widgets.example.com", "widget", "deploy"]);
    }

    #[test]
    fn test_crd_hoisted_across_waves() {
        let mut crd = new_object("apiextensions.k8s.io/v1", "CustomResourceDefinition", "", "widgets.example.com");
        crd.data = json!({"spec": {"group": "example.com", "names": {"kind": "Widget"}}});
        crd.annotations_mut()
            .insert("driftwatch.io/sync-wave".to_string(), "2".to_string());
        let mut tasks = vec![
            SyncTask::new(SyncPhase::Sync, Some(crd), None).unwrap(),
            task("example.com/v1", "Widget", "web", "widget"),
        ];
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["widgets.example.com", "widget"]);
        assert_eq!(tasks[0].wave(), 0);
    }

    #[test]
    fn test_prune_waves_are_mirrored() {
        let prune = |name: &str, wave: i64| {
            let mut live = new_object("v1", "ConfigMap", "web", name);
            live.annotations_mut()
                .insert("driftwatch.io/sync-wave".to_string(), wave.to_string());
            SyncTask::new(SyncPhase::Sync, None, Some(live)).unwrap()
        };
        let mut tasks = vec![prune("a", 0), prune("b", 1), prune("c", 5)];
        reverse_prune_waves(&mut tasks);
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["c", "b", "a"]);
        assert_eq!(tasks[0].wave(), 0);
    }

    #[test]
    fn test_prune_last_runs_after_sync_waves() {
        let mut live = new_object("v1", "ConfigMap", "web", "old");
        live.annotations_mut()
            .insert("driftwatch.io/sync-options".to_string(), "PruneLast=true".to_string());
        let mut tasks = vec![
            SyncTask::new(SyncPhase::Sync, None, Some(live)).unwrap(),
            with_wave(task("apps/v1", "Deployment", "web", "deploy"), 2),
        ];
        prune_last(&mut tasks, |t| {
            t.live
                .as_ref()
                .map(|l| crate::resource::annotations::has_sync_option(l, "PruneLast=true"))
                .unwrap_or(false)
        });
        sort_tasks(&mut tasks);
        assert_eq!(names(&tasks), vec!["deploy", "old"]);
        assert_eq!(tasks[1].wave(), 3);
    }

    #[test]
    fn test_generated_hook_name() {
        assert_eq!(
            generated_hook_name("db-migrate-", "ABCDEF1234", SyncPhase::PreSync, 1700000000),
            "db-migrate-abcdef1-presync-1700000000"
        );
    }

    #[test]
    fn test_multi_step() {
        let tasks = vec![
            task("v1", "ConfigMap", "web", "a"),
            with_wave(task("v1", "ConfigMap", "web", "b"), 1),
        ];
        assert!(is_multi_step(&tasks));
        assert!(!is_multi_step(&tasks[..1]));
        assert_eq!(first_group(&tasks), Some((SyncPhase::Sync, 0)));
    }

    #[test]
    fn test_result_keys_match() {
        let t = task("apps/v1", "Deployment", "web", "frontend");
        assert_eq!(t.result_key(), resource_result_key(&t.to_result()));
    }
}
