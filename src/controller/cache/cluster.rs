//! Live resource cache of a single cluster

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use kube::api::DynamicObject;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use super::graph::{ResourceGraph, ResourceNode};
use super::taint::ClusterTaintManager;
use super::CacheEvent;
use crate::clients::{ApiKind, Cluster, ClusterBackend, ResourceExecutor, Settings, WatchEvent};
use crate::crd::Application;
use crate::error::{Error, Result};
use crate::resource::{group_version, kind_of, GroupKind, ResourceKey};

/// Kinds whose updates never trigger a refresh
const HIGH_CHURN_KINDS: &[(&str, &str)] = &[("", "Endpoints"), ("discovery.k8s.io", "EndpointSlice")];

/// Identifier of a kind in taint sets and logs
pub fn gvk_key(kind: &ApiKind) -> String {
    let r = &kind.resource;
    if r.group.is_empty() {
        format!("{}/{}", r.version, r.kind)
    } else {
        format!("{}/{}/{}", r.group, r.version, r.kind)
    }
}

fn is_high_churn(key: &ResourceKey) -> bool {
    HIGH_CHURN_KINDS
        .iter()
        .any(|(g, k)| key.group == *g && key.kind == *k)
}

/// Point in time view of a cluster cache
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClusterInfo {
    pub server: String,
    pub name: String,
    pub server_version: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
    pub resources_count: usize,
    pub apis_count: usize,
    pub last_error: Option<String>,
    pub tainted: Vec<String>,
}

#[derive(Default)]
struct CacheState {
    graph: ResourceGraph,
    kinds: HashMap<GroupKind, ApiKind>,
    synced_at: Option<DateTime<Utc>>,
    valid: bool,
    last_error: Option<String>,
    server_version: Option<String>,
    watches: Vec<JoinHandle<()>>,
    generation: u64,
}

impl CacheState {
    fn stop_watches(&mut self) {
        for handle in self.watches.drain(..) {
            handle.abort();
        }
    }
}

/// Resource graph of one cluster kept current by watches
pub struct ClusterCache {
    cluster: std::sync::RwLock<Cluster>,
    backend: Arc<dyn ClusterBackend>,
    settings: std::sync::RwLock<Arc<Settings>>,
    taints: Arc<ClusterTaintManager>,
    events: mpsc::UnboundedSender<CacheEvent>,
    resync: Duration,
    state: RwLock<CacheState>,
}

impl ClusterCache {
    pub fn new(
        cluster: Cluster,
        backend: Arc<dyn ClusterBackend>,
        settings: Arc<Settings>,
        taints: Arc<ClusterTaintManager>,
        events: mpsc::UnboundedSender<CacheEvent>,
        resync: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster: std::sync::RwLock::new(cluster),
            backend,
            settings: std::sync::RwLock::new(settings),
            taints,
            events,
            resync,
            state: RwLock::new(CacheState::default()),
        })
    }

    pub fn cluster(&self) -> Cluster {
        self.cluster
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn set_cluster(&self, cluster: Cluster) {
        *self
            .cluster
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = cluster;
    }

    fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    fn server(&self) -> String {
        self.cluster().server
    }

    pub async fn synced_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.synced_at
    }

    /// Mark the cache stale. The graph is kept until the next sync replaces it.
    pub async fn invalidate(&self, settings: Option<Arc<Settings>>) {
        if let Some(settings) = settings {
            *self
                .settings
                .write()
                .unwrap_or_else(std::sync::PoisonError::into_inner) = settings;
        }
        let mut state = self.state.write().await;
        state.valid = false;
        state.stop_watches();
    }

    /// Stop watches and forget everything
    pub async fn shutdown(&self) {
        let mut state = self.state.write().await;
        state.stop_watches();
        state.valid = false;
        state.graph = ResourceGraph::new();
    }

    fn needs_sync(&self, state: &CacheState, now: DateTime<Utc>) -> bool {
        !state.valid
            || match state.synced_at {
                Some(at) => at + self.resync < now,
                None => true,
            }
    }

    /// Discover, list and watch every kind unless the cache is already fresh
    #[instrument(skip(self), fields(server = %self.server()))]
    pub async fn ensure_synced(self: &Arc<Self>) -> Result<()> {
        if !self.needs_sync(&*self.state.read().await, Utc::now()) {
            return Ok(());
        }
        let mut state = self.state.write().await;
        if !self.needs_sync(&state, Utc::now()) {
            return Ok(());
        }
        state.stop_watches();
        state.generation += 1;

        let cluster = self.cluster();
        let settings = self.settings();

        let discovered = match self.backend.discover().await {
            Ok(kinds) => kinds,
            Err(e) => {
                state.last_error = Some(e.to_string());
                warn!("Discovery failed: {}", e);
                return Err(Error::ClusterUnavailable {
                    server: cluster.server.clone(),
                    message: e.to_string(),
                });
            }
        };
        state.server_version = self.backend.server_version().await.ok();

        let kinds: Vec<ApiKind> = discovered
            .into_iter()
            .filter(|k| !settings.is_excluded(&k.resource.group, &k.resource.kind, &cluster.server))
            .collect();

        let mut graph = ResourceGraph::new();
        let mut watches = Vec::new();
        for kind in &kinds {
            // scope stays known for target validation, but nothing is listed
            if !kind.namespaced && !cluster.sees_cluster_resources() {
                continue;
            }
            let namespaces: Vec<Option<String>> = if kind.namespaced && !cluster.namespaces.is_empty() {
                cluster.namespaces.iter().cloned().map(Some).collect()
            } else {
                vec![None]
            };
            let gvk = gvk_key(kind);
            let mut listed = true;
            for ns in &namespaces {
                match self.backend.list(kind, ns.as_deref()).await {
                    Ok(objects) => {
                        for obj in &objects {
                            graph.upsert(ResourceNode::from_object(obj, &settings));
                        }
                    }
                    Err(e) => {
                        warn!(gvk = %gvk, "List failed, continuing with partial cache: {}", e);
                        self.taints.mark(&cluster.server, &gvk);
                        listed = false;
                    }
                }
            }
            if !listed {
                continue;
            }
            self.taints.clear(&cluster.server, &gvk);
            for ns in namespaces {
                watches.push(self.spawn_watch(kind.clone(), ns, state.generation));
            }
        }

        info!(
            resources = graph.len(),
            apis = kinds.len(),
            "Cluster cache synced"
        );
        state.graph = graph;
        state.kinds = kinds
            .into_iter()
            .map(|k| (k.group_kind(), k))
            .collect();
        state.watches = watches;
        state.synced_at = Some(Utc::now());
        state.last_error = None;
        state.valid = true;
        Ok(())
    }

    fn spawn_watch(self: &Arc<Self>, kind: ApiKind, namespace: Option<String>, generation: u64) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut stream = self.backend.watch(&kind, namespace.as_deref());
        tokio::spawn(async move {
            while let Some(event) = stream.next().await {
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                match event {
                    Ok(event) => {
                        if !cache.process_event(&kind, namespace.as_deref(), event, generation).await {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(gvk = %gvk_key(&kind), "Watch error: {}", e);
                    }
                }
            }
            debug!(gvk = %gvk_key(&kind), "Watch stopped");
        })
    }

    /// Apply a watch event to the graph. Returns false once the watch is stale.
    pub async fn process_event(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
        event: WatchEvent,
        generation: u64,
    ) -> bool {
        let settings = self.settings();
        let server = self.server();
        let mut state = self.state.write().await;
        if state.generation != generation {
            return false;
        }
        #[cfg(feature = "metrics")]
        {
            let gk = kind.group_kind();
            crate::controller::metrics::inc_cluster_event(&server, &format!("{}/{}", gk.group, gk.kind));
        }

        let mut notifications: Vec<(ResourceKey, Vec<String>, bool)> = Vec::new();
        match event {
            WatchEvent::Applied(obj) => {
                let node = ResourceNode::from_object(&obj, &settings);
                let key = node.key.clone();
                let old_app = state.graph.app_of(&key);
                let managed = node.app_name.is_some();
                let new_hash = node.manifest_hash.clone();
                let new_health = node.health.clone();
                let old = state.graph.upsert(node);
                let unchanged = old
                    .as_ref()
                    .map(|o| o.manifest_hash == new_hash && o.health == new_health)
                    .unwrap_or(false);
                if !is_high_churn(&key) && !(unchanged && settings.ignore_resource_updates_enabled) {
                    let mut apps: Vec<String> = old_app.into_iter().collect();
                    if let Some(app) = state.graph.app_of(&key) {
                        if !apps.contains(&app) {
                            apps.push(app);
                        }
                    }
                    notifications.push((key, apps, managed));
                }
            }
            WatchEvent::Deleted(obj) => {
                let key = ResourceKey::from_object(&obj);
                let app = state.graph.app_of(&key);
                if let Some(old) = state.graph.remove(&key) {
                    if !is_high_churn(&key) {
                        notifications.push((key, app.into_iter().collect(), old.app_name.is_some()));
                    }
                }
            }
            WatchEvent::Restarted(objects) => {
                let nodes: Vec<ResourceNode> = objects
                    .iter()
                    .map(|o| ResourceNode::from_object(o, &settings))
                    .collect();
                let gk = kind.group_kind();
                let before: HashMap<ResourceKey, Option<String>> = state
                    .graph
                    .nodes()
                    .filter(|n| n.key.group_kind() == gk)
                    .map(|n| n.key.clone())
                    .collect::<Vec<_>>()
                    .into_iter()
                    .map(|k| {
                        let app = state.graph.app_of(&k);
                        (k, app)
                    })
                    .collect();
                let changed = state.graph.replace_kind(
                    &kind.resource.group,
                    &kind.resource.kind,
                    namespace.filter(|_| kind.namespaced),
                    nodes,
                );
                for key in changed {
                    let mut apps: Vec<String> = before.get(&key).cloned().flatten().into_iter().collect();
                    if let Some(app) = state.graph.app_of(&key) {
                        if !apps.contains(&app) {
                            apps.push(app);
                        }
                    }
                    if !is_high_churn(&key) {
                        notifications.push((key, apps, true));
                    }
                }
                self.taints.clear(&server, &gvk_key(kind));
            }
        }
        drop(state);

        for (key, apps, managed) in notifications {
            if apps.is_empty() {
                continue;
            }
            let event = CacheEvent::ResourceUpdated {
                server: server.clone(),
                key,
                apps,
                managed,
            };
            if let Err(e) = self.events.send(event) {
                debug!(server = %server, "Dropped resource update, no receiver: {:?}", e.0);
            }
        }
        true
    }

    /// Current watch generation, for feeding events by hand
    pub async fn generation(&self) -> u64 {
        self.state.read().await.generation
    }

    pub async fn is_namespaced(&self, gk: &GroupKind) -> Option<bool> {
        self.state.read().await.kinds.get(gk).map(|k| k.namespaced)
    }

    pub async fn api_kind(&self, gk: &GroupKind) -> Option<ApiKind> {
        self.state.read().await.kinds.get(gk).cloned()
    }

    pub async fn node(&self, key: &ResourceKey) -> Option<ResourceNode> {
        self.state.read().await.graph.get(key)
    }

    /// Live objects managed by `app`, keyed like the targets.
    ///
    /// Targets without a namespace use the destination namespace when their
    /// kind is namespaced. Objects missing from the cache body are fetched
    /// through `executor`.
    #[instrument(skip_all, fields(app = %instance_name))]
    pub async fn get_managed_live_objs(
        &self,
        app: &Application,
        instance_name: &str,
        targets: &mut [DynamicObject],
        executor: &dyn ResourceExecutor,
    ) -> Result<HashMap<ResourceKey, DynamicObject>> {
        let cluster = self.cluster();
        let destination_ns = app.spec.destination.namespace().to_string();

        let mut managed = HashMap::new();
        let mut fetch = Vec::new();
        {
            let state = self.state.read().await;
            for target in targets.iter_mut() {
                let gk = GroupKind::new(&group_version(target).0, &kind_of(target));
                let namespaced = state.kinds.get(&gk).map(|k| k.namespaced);
                match namespaced {
                    Some(true) if target.metadata.namespace.as_deref().unwrap_or("").is_empty() => {
                        target.metadata.namespace = Some(destination_ns.clone());
                    }
                    Some(false) => {
                        if !cluster.sees_cluster_resources() {
                            return Err(Error::ValidationError(format!(
                                "cluster level {} {} can not be managed when in namespaced mode",
                                gk, target.metadata.name.as_deref().unwrap_or_default()
                            )));
                        }
                        target.metadata.namespace = None;
                    }
                    _ => {}
                }
                let key = ResourceKey::from_object(target);
                match state.graph.get(&key) {
                    Some(node) => match node.resource {
                        Some(body) => {
                            managed.insert(key, body);
                        }
                        None => fetch.push((key, group_version(target).1)),
                    },
                    None => {
                        let tainted = state
                            .kinds
                            .get(&gk)
                            .map(|k| self.taints.is_tainted(&cluster.server, &gvk_key(k)))
                            .unwrap_or(false);
                        if namespaced.is_none() || tainted {
                            fetch.push((key, group_version(target).1));
                        }
                    }
                }
            }
            for node in state.graph.nodes() {
                if node.is_app_root() && node.app_name.as_deref() == Some(instance_name) {
                    if let Some(body) = &node.resource {
                        managed
                            .entry(node.key.clone())
                            .or_insert_with(|| body.clone());
                    }
                }
            }
        }

        for (key, version) in fetch {
            match executor.get(&key, &version).await {
                Ok(obj) => {
                    managed.insert(key, obj);
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(managed)
    }

    /// Walk the hierarchy below `keys`; nodes are copies
    pub async fn iterate_hierarchy_v2<F>(&self, keys: &[ResourceKey], f: F)
    where
        F: FnMut(&ResourceNode) -> bool,
    {
        self.state.read().await.graph.iterate_hierarchy_v2(keys, f);
    }

    pub async fn namespace_top_level_resources(&self, namespace: &str) -> Vec<ResourceNode> {
        self.state.read().await.graph.namespace_top_level(namespace)
    }

    pub async fn info(&self) -> ClusterInfo {
        let cluster = self.cluster();
        let state = self.state.read().await;
        ClusterInfo {
            server: cluster.server.clone(),
            name: cluster.name.clone(),
            server_version: state.server_version.clone(),
            synced_at: state.synced_at,
            resources_count: state.graph.len(),
            apis_count: state.kinds.len(),
            last_error: state.last_error.clone(),
            tainted: self.taints.tainted(&cluster.server),
        }
    }
}

impl Drop for ClusterCache {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.try_write() {
            state.stop_watches();
        }
    }
}
