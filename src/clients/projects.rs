//! AppProject lookup

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::Api;
use kube::runtime::watcher;
use kube::{Client, ResourceExt};

use super::ObjectEvent;
use crate::crd::{AppProject, AppProjectSpec, ApplicationDestination, ProjectGroupKind};
use crate::error::{Error, Result};

pub const DEFAULT_PROJECT: &str = "default";

/// The implicit project allowing any source, destination and kind
pub fn default_project(namespace: &str) -> AppProject {
    let mut project = AppProject::new(
        DEFAULT_PROJECT,
        AppProjectSpec {
            source_repos: vec!["*".to_string()],
            destinations: vec![ApplicationDestination {
                server: Some("*".to_string()),
                name: Some("*".to_string()),
                namespace: Some("*".to_string()),
            }],
            cluster_resource_whitelist: vec![ProjectGroupKind {
                group: "*".to_string(),
                kind: "*".to_string(),
            }],
            ..Default::default()
        },
    );
    project.metadata.namespace = Some(namespace.to_string());
    project
}

#[async_trait]
pub trait ProjectStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<AppProject>;

    async fn list(&self) -> Result<Vec<AppProject>>;

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<AppProject>>>;
}

/// Projects read from the controller namespace
pub struct KubeProjectStore {
    api: Api<AppProject>,
    namespace: String,
}

impl KubeProjectStore {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ProjectStore for KubeProjectStore {
    async fn get(&self, name: &str) -> Result<AppProject> {
        match self.api.get_opt(name).await? {
            Some(project) => Ok(project),
            None if name == DEFAULT_PROJECT => Ok(default_project(&self.namespace)),
            None => Err(Error::not_found("AppProject", name)),
        }
    }

    async fn list(&self) -> Result<Vec<AppProject>> {
        Ok(self.api.list(&Default::default()).await?.items)
    }

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<AppProject>>> {
        watcher(self.api.clone(), watcher::Config::default())
            .flat_map(|event| stream::iter(ObjectEvent::from_watcher(event)))
            .boxed()
    }
}

/// Fixed project set, seeded with the default project
pub struct StaticProjectStore {
    namespace: String,
    projects: RwLock<HashMap<String, AppProject>>,
}

impl StaticProjectStore {
    pub fn new(namespace: &str) -> Self {
        let mut projects = HashMap::new();
        projects.insert(DEFAULT_PROJECT.to_string(), default_project(namespace));
        Self {
            namespace: namespace.to_string(),
            projects: RwLock::new(projects),
        }
    }

    pub fn insert(&self, name: &str, spec: AppProjectSpec) {
        let mut project = AppProject::new(name, spec);
        project.metadata.namespace = Some(self.namespace.clone());
        self.projects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), project);
    }

    /// Store a fully built project, metadata included
    pub fn put(&self, project: AppProject) {
        self.projects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(project.name_any(), project);
    }
}

#[async_trait]
impl ProjectStore for StaticProjectStore {
    async fn get(&self, name: &str) -> Result<AppProject> {
        self.projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("AppProject", name))
    }

    async fn list(&self) -> Result<Vec<AppProject>> {
        Ok(self
            .projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect())
    }

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<AppProject>>> {
        stream::pending().boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_project_permits_everything() {
        let store = StaticProjectStore::new("driftwatch");
        let project = store.get(DEFAULT_PROJECT).await.unwrap();
        assert!(project
            .spec
            .is_destination_permitted("https://prod.example.com", "prod", "web"));
        assert!(project.spec.is_group_kind_permitted("rbac.authorization.k8s.io", "ClusterRole", false));
        assert!(project.spec.is_source_permitted("https://github.com/org/repo.git"));
    }

    #[tokio::test]
    async fn test_missing_project() {
        let store = StaticProjectStore::new("driftwatch");
        assert!(store.get("team-a").await.unwrap_err().is_not_found());
        store.insert("team-a", AppProjectSpec::default());
        assert!(store.get("team-a").await.is_ok());
    }
}
