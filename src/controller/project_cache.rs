//! Load-once cache of AppProjects

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;
use tracing::debug;

use crate::clients::ProjectStore;
use crate::crd::AppProject;
use crate::error::Result;

/// Projects by name. Concurrent lookups of a missing project share one load;
/// failed loads are not cached.
pub struct ProjectCache {
    store: Arc<dyn ProjectStore>,
    cells: Mutex<HashMap<String, Arc<OnceCell<AppProject>>>>,
}

impl ProjectCache {
    pub fn new(store: Arc<dyn ProjectStore>) -> Self {
        Self {
            store,
            cells: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<OnceCell<AppProject>>>> {
        self.cells.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn get(&self, name: &str) -> Result<AppProject> {
        let cell = self.lock().entry(name.to_string()).or_default().clone();
        let project = cell
            .get_or_try_init(|| async {
                debug!(project = name, "Loading project");
                self.store.get(name).await
            })
            .await?;
        Ok(project.clone())
    }

    /// Drop the cached copy so the next lookup reloads it
    pub fn invalidate(&self, name: &str) {
        self.lock().remove(name);
    }

    pub fn store(&self) -> &Arc<dyn ProjectStore> {
        &self.store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::StaticProjectStore;
    use crate::crd::AppProjectSpec;

    #[tokio::test]
    async fn test_project_is_loaded_once_until_invalidated() {
        let store = Arc::new(StaticProjectStore::new("driftwatch"));
        store.insert(
            "web",
            AppProjectSpec {
                source_repos: vec!["https://git.example.com/*".to_string()],
                ..Default::default()
            },
        );
        let cache = ProjectCache::new(store.clone());
        assert_eq!(cache.get("web").await.unwrap().spec.source_repos.len(), 1);

        store.insert("web", AppProjectSpec::default());
        assert_eq!(
            cache.get("web").await.unwrap().spec.source_repos.len(),
            1,
            "cached copy served"
        );

        cache.invalidate("web");
        assert!(cache.get("web").await.unwrap().spec.source_repos.is_empty());
    }

    #[tokio::test]
    async fn test_missing_project_is_not_cached() {
        let store = Arc::new(StaticProjectStore::new("driftwatch"));
        let cache = ProjectCache::new(store.clone());
        assert!(cache.get("web").await.unwrap_err().is_not_found());

        store.insert("web", AppProjectSpec::default());
        assert!(cache.get("web").await.is_ok());
    }
}
