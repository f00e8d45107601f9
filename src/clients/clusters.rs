//! Cluster registry: destination clusters declared as labeled Secrets

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::watcher;
use kube::{Client, Config, ResourceExt};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use super::backend::{ClusterBackend, KubeBackend};
use super::executor::{KubeExecutor, ResourceExecutor, ThrottledExecutor};
use crate::crd::parse_time;
use crate::error::{Error, Result};
use crate::resource::annotations::ANNOTATION_REFRESH;

pub const IN_CLUSTER_SERVER: &str = "https://kubernetes.default.svc";
pub const IN_CLUSTER_NAME: &str = "in-cluster";
pub const CLUSTER_SECRET_TYPE_LABEL: &str = "driftwatch.io/secret-type";
pub const CLUSTER_SECRET_TYPE: &str = "cluster";

/// A destination cluster and how to reach it
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    /// Name of the backing Secret, empty for the implicit in-cluster entry
    pub id: String,
    pub server: String,
    pub name: String,
    /// Namespaces the controller may see, empty for all
    pub namespaces: Vec<String>,
    pub cluster_resources: bool,
    /// Manual shard assignment
    pub shard: Option<i64>,
    pub refresh_requested_at: Option<DateTime<Utc>>,
    pub project: String,
    /// Kubeconfig YAML, absent for the in-cluster entry
    pub kubeconfig: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl Cluster {
    pub fn in_cluster() -> Self {
        Self {
            server: IN_CLUSTER_SERVER.to_string(),
            name: IN_CLUSTER_NAME.to_string(),
            cluster_resources: true,
            ..Default::default()
        }
    }

    pub fn is_in_cluster(&self) -> bool {
        self.server == IN_CLUSTER_SERVER
    }

    /// Whether a cache built for `self` is stale for `other`
    pub fn connection_changed(&self, other: &Cluster) -> bool {
        self.server != other.server
            || self.kubeconfig != other.kubeconfig
            || self.namespaces != other.namespaces
            || self.cluster_resources != other.cluster_resources
    }

    /// Cluster scoped kinds are visible unless restricted to namespaces
    pub fn sees_cluster_resources(&self) -> bool {
        self.namespaces.is_empty() || self.cluster_resources
    }

    /// Parse a cluster Secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let mut fields: BTreeMap<String, String> = BTreeMap::new();
        if let Some(data) = &secret.data {
            for (k, v) in data {
                fields.insert(k.clone(), String::from_utf8_lossy(&v.0).into_owned());
            }
        }
        if let Some(data) = &secret.string_data {
            fields.extend(data.clone());
        }
        let server = fields
            .get("server")
            .cloned()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                Error::ConfigError(format!("cluster secret {} has no server", secret.name_any()))
            })?;
        let shard = match fields.get("shard") {
            Some(s) if !s.is_empty() => Some(s.trim().parse::<i64>().map_err(|_| {
                Error::ConfigError(format!("invalid shard '{}' in {}", s, secret.name_any()))
            })?),
            _ => None,
        };
        Ok(Self {
            id: secret.name_any(),
            name: fields.get("name").cloned().unwrap_or_else(|| server.clone()),
            server,
            namespaces: fields
                .get("namespaces")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            cluster_resources: fields.get("clusterResources").map(String::as_str) == Some("true"),
            shard,
            refresh_requested_at: secret
                .annotations()
                .get(ANNOTATION_REFRESH)
                .and_then(|v| parse_time(v)),
            project: fields.get("project").cloned().unwrap_or_default(),
            kubeconfig: fields.get("config").cloned().filter(|c| !c.is_empty()),
            labels: secret.labels().clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ClusterEvent {
    Added(Cluster),
    Modified(Cluster),
    /// Server URL of the removed cluster
    Deleted(String),
}

#[async_trait]
pub trait ClusterRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<Cluster>>;

    /// Cluster by server URL
    async fn get(&self, server: &str) -> Result<Cluster>;

    async fn get_by_name(&self, name: &str) -> Result<Cluster>;

    /// Clusters scoped to one project
    async fn project_clusters(&self, project: &str) -> Result<Vec<Cluster>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|c| c.project == project)
            .collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<ClusterEvent>>;
}

/// Registry backed by cluster Secrets in the controller namespace
pub struct SecretClusterRegistry {
    api: Api<Secret>,
}

impl SecretClusterRegistry {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }

    fn selector() -> String {
        format!("{}={}", CLUSTER_SECRET_TYPE_LABEL, CLUSTER_SECRET_TYPE)
    }
}

fn with_in_cluster(mut clusters: Vec<Cluster>) -> Vec<Cluster> {
    if !clusters.iter().any(Cluster::is_in_cluster) {
        clusters.insert(0, Cluster::in_cluster());
    }
    clusters
}

#[async_trait]
impl ClusterRegistry for SecretClusterRegistry {
    async fn list(&self) -> Result<Vec<Cluster>> {
        let secrets = self
            .api
            .list(&ListParams::default().labels(&Self::selector()))
            .await?;
        let mut clusters = Vec::new();
        for secret in &secrets.items {
            match Cluster::from_secret(secret) {
                Ok(c) => clusters.push(c),
                Err(e) => warn!("Skipping cluster secret {}: {}", secret.name_any(), e),
            }
        }
        Ok(with_in_cluster(clusters))
    }

    async fn get(&self, server: &str) -> Result<Cluster> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.server == server)
            .ok_or_else(|| Error::not_found("Cluster", server))
    }

    async fn get_by_name(&self, name: &str) -> Result<Cluster> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::not_found("Cluster", name))
    }

    fn watch(&self) -> BoxStream<'static, Result<ClusterEvent>> {
        // secret name -> cluster, to classify applies and recover the server on delete
        let known: Arc<Mutex<HashMap<String, Cluster>>> = Arc::new(Mutex::new(HashMap::new()));
        let relisted: Arc<Mutex<Vec<Cluster>>> = Arc::new(Mutex::new(Vec::new()));
        let config = watcher::Config::default().labels(&Self::selector());

        watcher(self.api.clone(), config)
            .flat_map(move |event| {
                let mut known = known.lock().unwrap_or_else(PoisonError::into_inner);
                let mut relisted = relisted.lock().unwrap_or_else(PoisonError::into_inner);
                let mut out: Vec<Result<ClusterEvent>> = Vec::new();
                match event {
                    Ok(watcher::Event::Apply(secret)) => match Cluster::from_secret(&secret) {
                        Ok(cluster) => {
                            let prev = known.insert(cluster.id.clone(), cluster.clone());
                            out.push(Ok(match prev {
                                Some(_) => ClusterEvent::Modified(cluster),
                                None => ClusterEvent::Added(cluster),
                            }));
                        }
                        Err(e) => warn!("Ignoring cluster secret {}: {}", secret.name_any(), e),
                    },
                    Ok(watcher::Event::Delete(secret)) => {
                        if let Some(cluster) = known.remove(&secret.name_any()) {
                            out.push(Ok(ClusterEvent::Deleted(cluster.server)));
                        }
                    }
                    Ok(watcher::Event::Init) => relisted.clear(),
                    Ok(watcher::Event::InitApply(secret)) => {
                        if let Ok(cluster) = Cluster::from_secret(&secret) {
                            relisted.push(cluster);
                        }
                    }
                    Ok(watcher::Event::InitDone) => {
                        let fresh: HashMap<String, Cluster> = relisted
                            .drain(..)
                            .map(|c| (c.id.clone(), c))
                            .collect();
                        for (id, old) in known.iter() {
                            if !fresh.contains_key(id) {
                                out.push(Ok(ClusterEvent::Deleted(old.server.clone())));
                            }
                        }
                        for (id, cluster) in &fresh {
                            out.push(Ok(match known.get(id) {
                                Some(old) if old == cluster => continue,
                                Some(_) => ClusterEvent::Modified(cluster.clone()),
                                None => ClusterEvent::Added(cluster.clone()),
                            }));
                        }
                        *known = fresh;
                    }
                    Err(e) => out.push(Err(Error::ConfigError(format!(
                        "cluster secret watch failed: {}",
                        e
                    )))),
                }
                stream::iter(out)
            })
            .boxed()
    }
}

/// Registry over a fixed cluster list
#[derive(Default)]
pub struct StaticClusterRegistry {
    clusters: Mutex<Vec<Cluster>>,
}

impl StaticClusterRegistry {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: Mutex::new(with_in_cluster(clusters)),
        }
    }

    pub fn upsert(&self, cluster: Cluster) {
        let mut clusters = self.clusters.lock().unwrap_or_else(PoisonError::into_inner);
        clusters.retain(|c| c.server != cluster.server);
        clusters.push(cluster);
    }
}

#[async_trait]
impl ClusterRegistry for StaticClusterRegistry {
    async fn list(&self) -> Result<Vec<Cluster>> {
        Ok(self
            .clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn get(&self, server: &str) -> Result<Cluster> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.server == server)
            .ok_or_else(|| Error::not_found("Cluster", server))
    }

    async fn get_by_name(&self, name: &str) -> Result<Cluster> {
        self.list()
            .await?
            .into_iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::not_found("Cluster", name))
    }

    fn watch(&self) -> BoxStream<'static, Result<ClusterEvent>> {
        let events: Vec<Result<ClusterEvent>> = self
            .clusters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .map(|c| Ok(ClusterEvent::Added(c)))
            .collect();
        stream::iter(events).chain(stream::pending()).boxed()
    }
}

/// Builds the per-cluster list/watch backend and executor
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    async fn backend(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterBackend>>;

    /// Executor for `cluster`, optionally impersonating a service account
    async fn executor(
        &self,
        cluster: &Cluster,
        impersonate: Option<&str>,
    ) -> Result<Arc<dyn ResourceExecutor>>;
}

/// Connector producing kube clients from cluster credentials
pub struct KubeConnector {
    permits: Arc<Semaphore>,
}

impl KubeConnector {
    pub fn new(parallelism: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(parallelism.max(1))),
        }
    }

    async fn config(cluster: &Cluster) -> Result<Config> {
        match &cluster.kubeconfig {
            Some(raw) => {
                let kubeconfig = Kubeconfig::from_yaml(raw)
                    .map_err(|e| Error::ConfigError(format!("cluster {}: {}", cluster.name, e)))?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::ConfigError(format!("cluster {}: {}", cluster.name, e)))
            }
            None => Config::infer()
                .await
                .map_err(|e| Error::ConfigError(format!("in-cluster config: {}", e))),
        }
    }

    async fn client(cluster: &Cluster, impersonate: Option<&str>) -> Result<Client> {
        let mut config = Self::config(cluster).await?;
        if let Some(user) = impersonate {
            debug!("Impersonating {} on {}", user, cluster.server);
            config.auth_info.impersonate = Some(user.to_string());
        }
        Ok(Client::try_from(config)?)
    }
}

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn backend(&self, cluster: &Cluster) -> Result<Arc<dyn ClusterBackend>> {
        let client = Self::client(cluster, None).await?;
        Ok(Arc::new(KubeBackend::new(client, &cluster.server)))
    }

    async fn executor(
        &self,
        cluster: &Cluster,
        impersonate: Option<&str>,
    ) -> Result<Arc<dyn ResourceExecutor>> {
        let client = Self::client(cluster, impersonate).await?;
        Ok(Arc::new(ThrottledExecutor::new(
            Arc::new(KubeExecutor::new(client, &cluster.server)),
            self.permits.clone(),
        )))
    }
}
