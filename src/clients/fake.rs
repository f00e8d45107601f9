//! In-memory cluster used by tests: serves list/watch and executes changes

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::DynamicObject;
use kube::core::GroupVersionKind;
use serde_json::Value;
use tokio::sync::broadcast;

use super::backend::{ApiKind, ClusterBackend, WatchEvent};
use super::clusters::{Cluster, ClusterConnector};
use super::executor::{ApplyOptions, PropagationPolicy, ResourceExecutor};
use crate::error::{Error, Result};
use crate::resource::{from_value, to_value, GroupKind, ResourceKey};

/// Call made through the executor
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExecutorCall {
    Get(ResourceKey),
    Apply { key: ResourceKey, dry_run: bool, server_side: bool },
    Create { key: ResourceKey, dry_run: bool },
    Patch { key: ResourceKey, dry_run: bool },
    Delete { key: ResourceKey, policy: PropagationPolicy, dry_run: bool },
}

impl ExecutorCall {
    pub fn is_dry_run(&self) -> bool {
        match self {
            ExecutorCall::Get(_) => false,
            ExecutorCall::Apply { dry_run, .. }
            | ExecutorCall::Create { dry_run, .. }
            | ExecutorCall::Patch { dry_run, .. }
            | ExecutorCall::Delete { dry_run, .. } => *dry_run,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

const DEFAULT_KINDS: &[(&str, &str, &str, bool)] = &[
    ("", "v1", "Namespace", false),
    ("", "v1", "ConfigMap", true),
    ("", "v1", "Secret", true),
    ("", "v1", "Service", true),
    ("", "v1", "ServiceAccount", true),
    ("", "v1", "Pod", true),
    ("", "v1", "PersistentVolumeClaim", true),
    ("apps", "v1", "Deployment", true),
    ("apps", "v1", "ReplicaSet", true),
    ("apps", "v1", "StatefulSet", true),
    ("apps", "v1", "DaemonSet", true),
    ("batch", "v1", "Job", true),
    ("networking.k8s.io", "v1", "Ingress", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", false),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", false),
    ("driftwatch.io", "v1alpha1", "Application", true),
];

/// A cluster held in memory
pub struct FakeCluster {
    server: String,
    kinds: Mutex<Vec<ApiKind>>,
    objects: Mutex<BTreeMap<ResourceKey, DynamicObject>>,
    failing_lists: Mutex<HashSet<GroupKind>>,
    failing_applies: Mutex<HashMap<ResourceKey, String>>,
    blocked_deletions: Mutex<HashSet<ResourceKey>>,
    calls: Mutex<Vec<ExecutorCall>>,
    discovery_error: Mutex<Option<String>>,
    events: broadcast::Sender<(GroupKind, WatchEvent)>,
    counter: AtomicU64,
}

impl FakeCluster {
    pub fn new(server: &str) -> Self {
        let (events, _) = broadcast::channel(1024);
        let kinds = DEFAULT_KINDS
            .iter()
            .map(|(g, v, k, namespaced)| ApiKind::new(&GroupVersionKind::gvk(g, v, k), *namespaced))
            .collect();
        Self {
            server: server.to_string(),
            kinds: Mutex::new(kinds),
            objects: Mutex::new(BTreeMap::new()),
            failing_lists: Mutex::new(HashSet::new()),
            failing_applies: Mutex::new(HashMap::new()),
            blocked_deletions: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
            discovery_error: Mutex::new(None),
            events,
            counter: AtomicU64::new(1),
        }
    }

    pub fn server(&self) -> &str {
        &self.server
    }

    pub fn register_kind(&self, group: &str, version: &str, kind: &str, namespaced: bool) {
        lock(&self.kinds).push(ApiKind::new(&GroupVersionKind::gvk(group, version, kind), namespaced));
    }

    /// Store an object as if created by someone else
    pub fn add_object(&self, obj: DynamicObject) -> DynamicObject {
        self.store(obj)
    }

    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        lock(&self.objects).get(key).cloned()
    }

    pub fn objects(&self) -> Vec<DynamicObject> {
        lock(&self.objects).values().cloned().collect()
    }

    pub fn remove_object(&self, key: &ResourceKey) {
        if let Some(obj) = lock(&self.objects).remove(key) {
            let _ = self
                .events
                .send((key.group_kind(), WatchEvent::Deleted(obj)));
        }
    }

    pub fn calls(&self) -> Vec<ExecutorCall> {
        lock(&self.calls).clone()
    }

    /// Calls that changed state, dry runs and reads excluded
    pub fn mutations(&self) -> Vec<ExecutorCall> {
        self.calls()
            .into_iter()
            .filter(|c| !c.is_dry_run() && !matches!(c, ExecutorCall::Get(_)))
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    pub fn fail_list(&self, gk: GroupKind) {
        lock(&self.failing_lists).insert(gk);
    }

    pub fn heal_list(&self, gk: &GroupKind) {
        lock(&self.failing_lists).remove(gk);
    }

    pub fn fail_apply(&self, key: ResourceKey, message: &str) {
        lock(&self.failing_applies).insert(key, message.to_string());
    }

    pub fn fail_discovery(&self, message: Option<&str>) {
        *lock(&self.discovery_error) = message.map(String::from);
    }

    /// Deletes of `key` only set the deletion timestamp
    pub fn block_deletion(&self, key: ResourceKey) {
        lock(&self.blocked_deletions).insert(key);
    }

    fn record(&self, call: ExecutorCall) {
        lock(&self.calls).push(call);
    }

    fn prepared(&self, mut obj: DynamicObject) -> DynamicObject {
        let key = ResourceKey::from_object(&obj);
        let existing = lock(&self.objects).get(&key).cloned();
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        match existing {
            Some(live) => {
                obj.metadata.uid = live.metadata.uid.clone();
                obj.metadata.creation_timestamp = live.metadata.creation_timestamp.clone();
                if obj.metadata.owner_references.is_none() {
                    obj.metadata.owner_references = live.metadata.owner_references.clone();
                }
            }
            None => {
                if obj.metadata.uid.is_none() {
                    obj.metadata.uid = Some(format!("uid-{}", n));
                }
                if obj.metadata.creation_timestamp.is_none() {
                    obj.metadata.creation_timestamp = Some(Time(Utc::now()));
                }
            }
        }
        obj.metadata.resource_version = Some(n.to_string());
        obj
    }

    fn store(&self, obj: DynamicObject) -> DynamicObject {
        let obj = self.prepared(obj);
        let key = ResourceKey::from_object(&obj);
        lock(&self.objects).insert(key.clone(), obj.clone());
        let _ = self
            .events
            .send((key.group_kind(), WatchEvent::Applied(obj.clone())));
        obj
    }

    fn check_apply(&self, key: &ResourceKey) -> Result<()> {
        if let Some(message) = lock(&self.failing_applies).get(key) {
            return Err(Error::SyncError(message.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl ResourceExecutor for FakeCluster {
    async fn get(&self, key: &ResourceKey, _version: &str) -> Result<DynamicObject> {
        self.record(ExecutorCall::Get(key.clone()));
        self.object(key)
            .ok_or_else(|| Error::not_found(&key.kind, key.to_string()))
    }

    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        self.record(ExecutorCall::Apply {
            key: key.clone(),
            dry_run: opts.dry_run,
            server_side: opts.server_side,
        });
        self.check_apply(&key)?;
        if opts.dry_run {
            return Ok(self.prepared(obj.clone()));
        }
        Ok(self.store(obj.clone()))
    }

    async fn create(&self, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        self.record(ExecutorCall::Create {
            key: key.clone(),
            dry_run,
        });
        self.check_apply(&key)?;
        if lock(&self.objects).contains_key(&key) {
            return Err(Error::SyncError(format!("{} already exists", key)));
        }
        if dry_run {
            return Ok(self.prepared(obj.clone()));
        }
        Ok(self.store(obj.clone()))
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        _version: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        self.record(ExecutorCall::Patch {
            key: key.clone(),
            dry_run,
        });
        let live = self
            .object(key)
            .ok_or_else(|| Error::not_found(&key.kind, key.to_string()))?;
        let mut value = to_value(&live)?;
        json_patch::merge(&mut value, patch);
        let patched = from_value(value)?;
        if dry_run {
            return Ok(patched);
        }
        Ok(self.store(patched))
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        _version: &str,
        policy: PropagationPolicy,
        dry_run: bool,
    ) -> Result<()> {
        self.record(ExecutorCall::Delete {
            key: key.clone(),
            policy,
            dry_run,
        });
        let Some(mut live) = self.object(key) else {
            return Err(Error::not_found(&key.kind, key.to_string()));
        };
        if dry_run {
            return Ok(());
        }
        if lock(&self.blocked_deletions).contains(key) {
            if live.metadata.deletion_timestamp.is_none() {
                live.metadata.deletion_timestamp = Some(Time(Utc::now()));
                lock(&self.objects).insert(key.clone(), live.clone());
                let _ = self
                    .events
                    .send((key.group_kind(), WatchEvent::Applied(live)));
            }
            return Ok(());
        }
        self.remove_object(key);
        Ok(())
    }

    async fn convert_version(&self, obj: DynamicObject, _version: &str) -> Result<DynamicObject> {
        Ok(obj)
    }
}

#[async_trait]
impl ClusterBackend for FakeCluster {
    async fn discover(&self) -> Result<Vec<ApiKind>> {
        if let Some(message) = lock(&self.discovery_error).clone() {
            return Err(Error::ClusterUnavailable {
                server: self.server.clone(),
                message,
            });
        }
        Ok(lock(&self.kinds).clone())
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let gk = kind.group_kind();
        if lock(&self.failing_lists).contains(&gk) {
            return Err(Error::ClusterUnavailable {
                server: self.server.clone(),
                message: format!("conversion webhook for {} failed", gk),
            });
        }
        Ok(lock(&self.objects)
            .iter()
            .filter(|(k, _)| k.group_kind() == gk)
            .filter(|(k, _)| match namespace {
                Some(ns) if kind.namespaced => k.namespace == ns,
                _ => true,
            })
            .map(|(_, o)| o.clone())
            .collect())
    }

    fn watch(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let gk = kind.group_kind();
        let namespace = namespace.map(String::from).filter(|_| kind.namespaced);
        let rx = self.events.subscribe();
        stream::unfold(rx, move |mut rx| {
            let gk = gk.clone();
            let namespace = namespace.clone();
            async move {
                loop {
                    match rx.recv().await {
                        Ok((event_gk, event)) if event_gk == gk => {
                            let in_scope = match (&namespace, &event) {
                                (Some(ns), WatchEvent::Applied(o) | WatchEvent::Deleted(o)) => {
                                    o.metadata.namespace.as_deref() == Some(ns.as_str())
                                }
                                _ => true,
                            };
                            if in_scope {
                                return Some((Ok(event), rx));
                            }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => return None,
                    }
                }
            }
        })
        .boxed()
    }

    async fn server_version(&self) -> Result<String> {
        Ok("v1.30.0".to_string())
    }
}

/// Connector handing out registered fake clusters
#[derive(Default)]
pub struct FakeConnector {
    clusters: Mutex<HashMap<String, Arc<FakeCluster>>>,
    impersonated: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, cluster: Arc<FakeCluster>) {
        lock(&self.clusters).insert(cluster.server().to_string(), cluster);
    }

    pub fn cluster(&self, server: &str) -> Option<Arc<FakeCluster>> {
        lock(&self.clusters).get(server).cloned()
    }

    /// Users impersonated by executors handed out so far
    pub fn impersonated(&self) -> Vec<String> {
        lock(&self.impersonated).clone()
    }

    fn lookup(&self, cluster: &Cluster) -> Result<Arc<FakeCluster>> {
        self.cluster(&cluster.server)
            .ok_or_else(|| Error::ClusterUnavailable {
                server: cluster.server.clone(),
                message: "no such fake cluster".to_string(),
            })
    }
}

#[async_trait]
impl ClusterConnector for FakeConnector {
    async fn backend(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterBackend>> {
        Ok(self.lookup(cluster)?)
    }

    async fn executor(
        &self,
        cluster: &Cluster,
        impersonate: Option<&str>,
    ) -> Result<Arc<dyn ResourceExecutor>> {
        if let Some(user) = impersonate {
            lock(&self.impersonated).push(user.to_string());
        }
        Ok(self.lookup(cluster)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::new_object;

    #[tokio::test]
    async fn test_apply_assigns_identity() {
        let cluster = FakeCluster::new("https://fake");
        let obj = new_object("v1", "ConfigMap", "web", "settings");
        let created = cluster.apply(&obj, &ApplyOptions::default()).await.unwrap();
        assert!(created.metadata.uid.is_some());

        let again = cluster.apply(&obj, &ApplyOptions::default()).await.unwrap();
        assert_eq!(again.metadata.uid, created.metadata.uid);
        assert_ne!(again.metadata.resource_version, created.metadata.resource_version);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_store() {
        let cluster = FakeCluster::new("https://fake");
        let obj = new_object("v1", "ConfigMap", "web", "settings");
        let opts = ApplyOptions {
            dry_run: true,
            ..Default::default()
        };
        cluster.apply(&obj, &opts).await.unwrap();
        assert!(cluster.objects().is_empty());
        assert!(cluster.mutations().is_empty());
    }

    #[tokio::test]
    async fn test_blocked_deletion_sets_timestamp() {
        let cluster = FakeCluster::new("https://fake");
        let obj = cluster.add_object(new_object("v1", "ConfigMap", "web", "settings"));
        let key = ResourceKey::from_object(&obj);
        cluster.block_deletion(key.clone());
        cluster
            .delete(&key, "v1", PropagationPolicy::Foreground, false)
            .await
            .unwrap();
        assert!(cluster.object(&key).unwrap().metadata.deletion_timestamp.is_some());
    }

    #[tokio::test]
    async fn test_failing_list() {
        let cluster = FakeCluster::new("https://fake");
        let kind = ApiKind::new(&GroupVersionKind::gvk("", "v1", "ConfigMap"), true);
        cluster.fail_list(kind.group_kind());
        assert!(cluster.list(&kind, None).await.is_err());
        cluster.heal_list(&kind.group_kind());
        assert!(cluster.list(&kind, None).await.is_ok());
    }
}
