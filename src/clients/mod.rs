//! Collaborators of the reconciliation engine
//!
//! Each collaborator is a trait with a production implementation talking
//! to the API server or the manifest server, and an in-memory one used by
//! tests.

pub mod apps;
pub mod backend;
pub mod clusters;
pub mod executor;
pub mod fake;
pub mod projects;
pub mod repo;
pub mod settings;

use kube::runtime::watcher;

use crate::error::{Error, Result};

pub use apps::{AppStore, EventType, InMemoryAppStore, KubeAppStore};
pub use backend::{ApiKind, ClusterBackend, KubeBackend, WatchEvent};
pub use clusters::{
    Cluster, ClusterConnector, ClusterEvent, ClusterRegistry, KubeConnector,
    SecretClusterRegistry, StaticClusterRegistry, IN_CLUSTER_NAME, IN_CLUSTER_SERVER,
};
pub use executor::{
    ApplyOptions, KubeExecutor, PropagationPolicy, ResourceExecutor, ThrottledExecutor,
};
pub use fake::{ExecutorCall, FakeCluster, FakeConnector};
pub use projects::{KubeProjectStore, ProjectStore, StaticProjectStore};
pub use repo::{
    HttpManifestSource, ManifestInfo, ManifestRequest, ManifestResponse, ManifestSource,
    StaticManifestSource,
};
pub use settings::{
    ConfigMapSettingsProvider, Settings, SettingsProvider, StaticSettingsProvider,
};

/// Change to a watched controller-side object
#[derive(Clone, Debug)]
pub enum ObjectEvent<T> {
    Applied(T),
    Deleted(T),
}

impl<T> ObjectEvent<T> {
    /// Flatten a watcher event. Relist markers carry no object and are dropped.
    pub fn from_watcher(
        event: std::result::Result<watcher::Event<T>, watcher::Error>,
    ) -> Vec<Result<ObjectEvent<T>>> {
        match event {
            Ok(watcher::Event::Apply(obj)) | Ok(watcher::Event::InitApply(obj)) => {
                vec![Ok(ObjectEvent::Applied(obj))]
            }
            Ok(watcher::Event::Delete(obj)) => vec![Ok(ObjectEvent::Deleted(obj))],
            Ok(watcher::Event::Init) | Ok(watcher::Event::InitDone) => Vec::new(),
            Err(e) => vec![Err(Error::ClusterUnavailable {
                server: IN_CLUSTER_SERVER.to_string(),
                message: e.to_string(),
            })],
        }
    }

    pub fn object(&self) -> &T {
        match self {
            ObjectEvent::Applied(o) | ObjectEvent::Deleted(o) => o,
        }
    }
}
