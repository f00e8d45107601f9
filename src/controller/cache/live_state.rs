//! Cluster caches for every destination, routed by server URL

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Duration;
use futures::StreamExt;
use kube::api::DynamicObject;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::cluster::{ClusterCache, ClusterInfo};
use super::graph::ResourceNode;
use super::taint::ClusterTaintManager;
use super::CacheEvent;
use crate::clients::{
    Cluster, ClusterConnector, ClusterEvent, ClusterRegistry, ResourceExecutor, Settings,
};
use crate::controller::sharding::ClusterSharding;
use crate::crd::Application;
use crate::error::Result;
use crate::resource::{GroupKind, ResourceKey};

/// Default period after which a cluster cache relists everything
pub const DEFAULT_CLUSTER_RESYNC_HOURS: i64 = 12;

pub struct LiveStateCache {
    registry: Arc<dyn ClusterRegistry>,
    connector: Arc<dyn ClusterConnector>,
    sharding: Arc<ClusterSharding>,
    taints: Arc<ClusterTaintManager>,
    settings: RwLock<Arc<Settings>>,
    caches: Arc<RwLock<HashMap<String, Arc<ClusterCache>>>>,
    events: mpsc::UnboundedSender<CacheEvent>,
    resync: Duration,
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl LiveStateCache {
    pub fn new(
        registry: Arc<dyn ClusterRegistry>,
        connector: Arc<dyn ClusterConnector>,
        sharding: Arc<ClusterSharding>,
        taints: Arc<ClusterTaintManager>,
        settings: Arc<Settings>,
        events: mpsc::UnboundedSender<CacheEvent>,
    ) -> Self {
        Self {
            registry,
            connector,
            sharding,
            taints,
            settings: RwLock::new(settings),
            caches: Arc::new(RwLock::new(HashMap::new())),
            events,
            resync: Duration::hours(DEFAULT_CLUSTER_RESYNC_HOURS),
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn taints(&self) -> &Arc<ClusterTaintManager> {
        &self.taints
    }

    fn cached(&self, server: &str) -> Option<Arc<ClusterCache>> {
        read(&self.caches).get(server).cloned()
    }

    /// Synced cache of a cluster, created on first use
    pub async fn get_synced_cluster_cache(&self, server: &str) -> Result<Arc<ClusterCache>> {
        let cache = match self.cached(server) {
            Some(cache) => cache,
            None => {
                let cluster = self.registry.get(server).await?;
                let backend = self.connector.backend(&cluster).await?;
                let created = ClusterCache::new(
                    cluster,
                    backend,
                    read(&self.settings).clone(),
                    self.taints.clone(),
                    self.events.clone(),
                    self.resync,
                );
                // a concurrent caller may have won the race
                write(&self.caches)
                    .entry(server.to_string())
                    .or_insert(created)
                    .clone()
            }
        };
        cache.ensure_synced().await?;
        Ok(cache)
    }

    pub async fn get_managed_live_objs(
        &self,
        app: &Application,
        instance_name: &str,
        server: &str,
        targets: &mut [DynamicObject],
        executor: &dyn ResourceExecutor,
    ) -> Result<HashMap<ResourceKey, DynamicObject>> {
        let cache = self.get_synced_cluster_cache(server).await?;
        cache
            .get_managed_live_objs(app, instance_name, targets, executor)
            .await
    }

    pub async fn is_namespaced(&self, server: &str, gk: &GroupKind) -> Result<Option<bool>> {
        let cache = self.get_synced_cluster_cache(server).await?;
        Ok(cache.is_namespaced(gk).await)
    }

    /// Walk the hierarchy below a single resource
    pub async fn iterate_hierarchy<F>(&self, server: &str, key: &ResourceKey, f: F) -> Result<()>
    where
        F: FnMut(&ResourceNode) -> bool,
    {
        self.iterate_hierarchy_v2(server, std::slice::from_ref(key), f).await
    }

    pub async fn iterate_hierarchy_v2<F>(&self, server: &str, keys: &[ResourceKey], f: F) -> Result<()>
    where
        F: FnMut(&ResourceNode) -> bool,
    {
        let cache = self.get_synced_cluster_cache(server).await?;
        cache.iterate_hierarchy_v2(keys, f).await;
        Ok(())
    }

    pub async fn get_namespace_top_level_resources(
        &self,
        server: &str,
        namespace: &str,
    ) -> Result<Vec<ResourceNode>> {
        let cache = self.get_synced_cluster_cache(server).await?;
        Ok(cache.namespace_top_level_resources(namespace).await)
    }

    /// Mark every cache stale with new settings, keeping the graphs
    pub async fn invalidate(&self, settings: Arc<Settings>) {
        *write(&self.settings) = settings.clone();
        let caches: Vec<Arc<ClusterCache>> = read(&self.caches).values().cloned().collect();
        for cache in caches {
            self.taints.clear_cluster(&cache.cluster().server);
            cache.invalidate(Some(settings.clone())).await;
        }
        info!("Invalidated live state cache");
    }

    /// React to a change in the cluster registry.
    ///
    /// `has_apps` tells whether any application targets the cluster.
    pub async fn handle_cluster_event(&self, event: ClusterEvent, has_apps: bool) {
        match event {
            ClusterEvent::Added(cluster) => {
                self.sharding.log_assignment(&cluster);
                if has_apps && self.sharding.is_managed(&cluster) {
                    self.warm_up(cluster.server.clone());
                }
            }
            ClusterEvent::Modified(cluster) => self.handle_cluster_modified(cluster).await,
            ClusterEvent::Deleted(server) => {
                let removed = write(&self.caches).remove(&server);
                if let Some(cache) = removed {
                    cache.shutdown().await;
                }
                self.taints.clear_cluster(&server);
                info!(server = %server, "Dropped cluster cache");
            }
        }
    }

    async fn handle_cluster_modified(&self, cluster: Cluster) {
        let Some(cache) = self.cached(&cluster.server) else {
            return;
        };
        if !self.sharding.is_managed(&cluster) {
            write(&self.caches).remove(&cluster.server);
            cache.shutdown().await;
            info!(server = %cluster.server, "Cluster moved to another shard");
            return;
        }

        let old = cache.cluster();
        let synced_at = cache.synced_at().await;
        #[cfg(feature = "metrics")]
        if let Some(synced) = synced_at {
            crate::controller::metrics::set_cluster_cache_age(
                &cluster.server,
                (chrono::Utc::now() - synced).num_seconds(),
            );
        }
        let hard_refresh = match (cluster.refresh_requested_at, synced_at) {
            (Some(requested), Some(synced)) => requested > synced,
            (Some(_), None) => true,
            _ => false,
        };
        let changed = old.connection_changed(&cluster);
        cache.set_cluster(cluster.clone());

        if hard_refresh && self.taints.has_taints(&cluster.server) {
            let before = self.taints.tainted(&cluster.server);
            cache.invalidate(None).await;
            match cache.ensure_synced().await {
                Ok(()) => {
                    let after = self.taints.tainted(&cluster.server);
                    let recovered: Vec<&String> = before.iter().filter(|g| !after.contains(g)).collect();
                    info!(server = %cluster.server, ?recovered, "Hard refresh of tainted cluster");
                }
                Err(e) => warn!(server = %cluster.server, "Hard refresh failed: {}", e),
            }
        } else if hard_refresh || changed {
            cache.invalidate(None).await;
            self.warm_up(cluster.server.clone());
        }
    }

    fn warm_up(&self, server: String) {
        let registry = self.registry.clone();
        let connector = self.connector.clone();
        let settings = read(&self.settings).clone();
        let taints = self.taints.clone();
        let events = self.events.clone();
        let caches = self.caches.clone();
        let resync = self.resync;
        tokio::spawn(async move {
            let existing = read(&caches).get(&server).cloned();
            let cache = match existing {
                Some(cache) => cache,
                None => {
                    let cluster = match registry.get(&server).await {
                        Ok(c) => c,
                        Err(e) => {
                            warn!(server = %server, "Cannot warm up cluster cache: {}", e);
                            return;
                        }
                    };
                    let backend = match connector.backend(&cluster).await {
                        Ok(b) => b,
                        Err(e) => {
                            warn!(server = %server, "Cannot connect to cluster: {}", e);
                            return;
                        }
                    };
                    let created = ClusterCache::new(cluster, backend, settings, taints, events, resync);
                    write(&caches)
                        .entry(server.clone())
                        .or_insert(created)
                        .clone()
                }
            };
            if let Err(e) = cache.ensure_synced().await {
                warn!(server = %server, "Background sync failed: {}", e);
            }
        });
    }

    pub async fn cluster_infos(&self) -> Vec<ClusterInfo> {
        let caches: Vec<Arc<ClusterCache>> = read(&self.caches).values().cloned().collect();
        let mut infos = Vec::with_capacity(caches.len());
        for cache in caches {
            infos.push(cache.info().await);
        }
        infos.sort_by(|a, b| a.server.cmp(&b.server));
        infos
    }

    /// Follow cluster registry events until shutdown.
    ///
    /// `has_apps` answers whether applications target a server.
    pub async fn run<F>(self: Arc<Self>, mut shutdown: watch::Receiver<bool>, has_apps: F)
    where
        F: Fn(&str) -> bool + Send + Sync,
    {
        match self.registry.list().await {
            Ok(clusters) => self.sharding.update(&clusters),
            Err(e) => error!("Failed to list clusters: {}", e),
        }
        let mut events = self.registry.watch();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("Live state cache stopping");
                    break;
                }
                event = events.next() => {
                    let Some(event) = event else {
                        warn!("Cluster watch ended");
                        break;
                    };
                    match event {
                        Ok(event) => {
                            if let Ok(clusters) = self.registry.list().await {
                                self.sharding.update(&clusters);
                            }
                            let server = match &event {
                                ClusterEvent::Added(c) | ClusterEvent::Modified(c) => c.server.clone(),
                                ClusterEvent::Deleted(s) => s.clone(),
                            };
                            self.handle_cluster_event(event, has_apps(&server)).await;
                        }
                        Err(e) => warn!("Cluster watch error: {}", e),
                    }
                }
            }
        }
    }
}
