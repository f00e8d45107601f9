//! List/watch access to one cluster, consumed by the cluster cache

use async_trait::async_trait;
use futures::future::ready;
use futures::stream::BoxStream;
use futures::StreamExt;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{verbs, Discovery, Scope};
use kube::runtime::watcher;
use kube::Client;
use tracing::debug;

use crate::error::{Error, Result};
use crate::resource::GroupKind;

/// A served API kind
#[derive(Clone, Debug)]
pub struct ApiKind {
    pub resource: ApiResource,
    pub namespaced: bool,
}

impl ApiKind {
    pub fn new(gvk: &GroupVersionKind, namespaced: bool) -> Self {
        Self {
            resource: ApiResource::from_gvk(gvk),
            namespaced,
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.resource.group, &self.resource.kind)
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(
            &self.resource.group,
            &self.resource.version,
            &self.resource.kind,
        )
    }
}

#[derive(Clone, Debug)]
pub enum WatchEvent {
    Applied(DynamicObject),
    Deleted(DynamicObject),
    /// The watch relisted; the objects replace everything known for the kind
    Restarted(Vec<DynamicObject>),
}

#[async_trait]
pub trait ClusterBackend: Send + Sync {
    /// Listable and watchable kinds served by the cluster
    async fn discover(&self) -> Result<Vec<ApiKind>>;

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>>;

    fn watch(&self, kind: &ApiKind, namespace: Option<&str>)
        -> BoxStream<'static, Result<WatchEvent>>;

    async fn server_version(&self) -> Result<String>;
}

/// Backend talking to a real API server
pub struct KubeBackend {
    client: Client,
    server: String,
}

impl KubeBackend {
    pub fn new(client: Client, server: &str) -> Self {
        Self {
            client,
            server: server.to_string(),
        }
    }

    fn api(&self, kind: &ApiKind, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if kind.namespaced => {
                Api::namespaced_with(self.client.clone(), ns, &kind.resource)
            }
            _ => Api::all_with(self.client.clone(), &kind.resource),
        }
    }
}

#[async_trait]
impl ClusterBackend for KubeBackend {
    async fn discover(&self) -> Result<Vec<ApiKind>> {
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut kinds = Vec::new();
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if !caps.supports_operation(verbs::LIST) || !caps.supports_operation(verbs::WATCH) {
                    continue;
                }
                kinds.push(ApiKind {
                    resource: ar,
                    namespaced: matches!(caps.scope, Scope::Namespaced),
                });
            }
        }
        debug!("Discovered {} watchable kinds on {}", kinds.len(), self.server);
        Ok(kinds)
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
        let list = self
            .api(kind, namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list
            .items
            .into_iter()
            .map(|mut obj| {
                obj.types = Some(kube::core::TypeMeta {
                    api_version: kind.resource.api_version.clone(),
                    kind: kind.resource.kind.clone(),
                });
                obj
            })
            .collect())
    }

    fn watch(
        &self,
        kind: &ApiKind,
        namespace: Option<&str>,
    ) -> BoxStream<'static, Result<WatchEvent>> {
        let api = self.api(kind, namespace);
        let server = self.server.clone();
        let types = kube::core::TypeMeta {
            api_version: kind.resource.api_version.clone(),
            kind: kind.resource.kind.clone(),
        };
        let typed = move |mut obj: DynamicObject| {
            obj.types = Some(types.clone());
            obj
        };

        watcher(api, watcher::Config::default())
            .scan(Vec::new(), move |relisted, event| {
                let out = match event {
                    Ok(watcher::Event::Apply(obj)) => Some(Ok(WatchEvent::Applied(typed(obj)))),
                    Ok(watcher::Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(typed(obj)))),
                    Ok(watcher::Event::Init) => {
                        relisted.clear();
                        None
                    }
                    Ok(watcher::Event::InitApply(obj)) => {
                        relisted.push(typed(obj));
                        None
                    }
                    Ok(watcher::Event::InitDone) => {
                        Some(Ok(WatchEvent::Restarted(std::mem::take(relisted))))
                    }
                    Err(e) => Some(Err(Error::ClusterUnavailable {
                        server: server.clone(),
                        message: e.to_string(),
                    })),
                };
                ready(Some(out))
            })
            .filter_map(ready)
            .boxed()
    }

    async fn server_version(&self) -> Result<String> {
        let info = self.client.apiserver_version().await?;
        Ok(info.git_version)
    }
}
