//! Application and AppProject persistence

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::runtime::watcher;
use kube::{Client, Resource, ResourceExt};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::warn;

use super::ObjectEvent;
use crate::crd::{AppProject, Application};
use crate::error::{Error, Result};

const FIELD_MANAGER: &str = "driftwatch-controller";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Normal,
    Warning,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            EventType::Normal => "Normal",
            EventType::Warning => "Warning",
        }
    }
}

#[async_trait]
pub trait AppStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> Result<Application>;

    async fn list(&self) -> Result<Vec<Application>>;

    /// JSON merge patch of an application
    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<Application>;

    async fn patch_project(&self, namespace: &str, name: &str, patch: &Value) -> Result<()>;

    async fn record_event(
        &self,
        app: &Application,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()>;

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<Application>>>;
}

/// Applications stored in the API server
pub struct KubeAppStore {
    client: Client,
    apps: Api<Application>,
}

impl KubeAppStore {
    pub fn new(client: Client) -> Self {
        Self {
            apps: Api::all(client.clone()),
            client,
        }
    }
}

#[async_trait]
impl AppStore for KubeAppStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Application> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await?
            .ok_or_else(|| Error::not_found("Application", format!("{}/{}", namespace, name)))
    }

    async fn list(&self) -> Result<Vec<Application>> {
        Ok(self.apps.list(&Default::default()).await?.items)
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<Application> {
        let api: Api<Application> = Api::namespaced(self.client.clone(), namespace);
        Ok(api
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_project(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        let api: Api<AppProject> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
            .await?;
        Ok(())
    }

    async fn record_event(
        &self,
        app: &Application,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        let namespace = app.namespace().unwrap_or_else(|| "default".to_string());
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        let time = chrono::Utc::now();
        let event = Event {
            metadata: kube::api::ObjectMeta {
                generate_name: Some(format!("{}-", app.name_any())),
                ..Default::default()
            },
            type_: Some(event_type.as_str().to_string()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            involved_object: app.object_ref(&()),
            first_timestamp: Some(Time(time)),
            last_timestamp: Some(Time(time)),
            count: Some(1),
            ..Default::default()
        };

        events
            .create(&PostParams::default(), &event)
            .await
            .map_err(Error::KubeError)?;
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<Application>>> {
        watcher(self.apps.clone(), watcher::Config::default())
            .flat_map(|event| stream::iter(ObjectEvent::from_watcher(event)))
            .boxed()
    }
}

/// Event recorded by the in-memory store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedEvent {
    pub app: String,
    pub event_type: EventType,
    pub reason: String,
    pub message: String,
}

/// Application store kept in memory, recording every patch
pub struct InMemoryAppStore {
    apps: Mutex<BTreeMap<String, Application>>,
    projects: Mutex<BTreeMap<String, Value>>,
    patches: Mutex<Vec<(String, Value)>>,
    events: Mutex<Vec<RecordedEvent>>,
    changes: broadcast::Sender<ObjectEvent<Application>>,
}

impl Default for InMemoryAppStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            apps: Mutex::new(BTreeMap::new()),
            projects: Mutex::new(BTreeMap::new()),
            patches: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            changes,
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl InMemoryAppStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, app: Application) {
        lock(&self.apps).insert(app.qualified_name(), app.clone());
        let _ = self.changes.send(ObjectEvent::Applied(app));
    }

    pub fn remove(&self, namespace: &str, name: &str) {
        if let Some(app) = lock(&self.apps).remove(&format!("{}/{}", namespace, name)) {
            let _ = self.changes.send(ObjectEvent::Deleted(app));
        }
    }

    /// Patches issued so far as `(namespace/name, patch)`
    pub fn patches(&self) -> Vec<(String, Value)> {
        lock(&self.patches).clone()
    }

    pub fn project_patches(&self) -> BTreeMap<String, Value> {
        lock(&self.projects).clone()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl AppStore for InMemoryAppStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<Application> {
        let key = format!("{}/{}", namespace, name);
        lock(&self.apps)
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found("Application", key))
    }

    async fn list(&self) -> Result<Vec<Application>> {
        Ok(lock(&self.apps).values().cloned().collect())
    }

    async fn patch(&self, namespace: &str, name: &str, patch: &Value) -> Result<Application> {
        let key = format!("{}/{}", namespace, name);
        let updated = {
            let mut apps = lock(&self.apps);
            let app = apps
                .get_mut(&key)
                .ok_or_else(|| Error::not_found("Application", key.clone()))?;
            let mut value = serde_json::to_value(&*app)?;
            json_patch::merge(&mut value, patch);
            let updated: Application = serde_json::from_value(value)?;
            *app = updated.clone();
            updated
        };
        lock(&self.patches).push((key, patch.clone()));
        let _ = self.changes.send(ObjectEvent::Applied(updated.clone()));
        Ok(updated)
    }

    async fn patch_project(&self, namespace: &str, name: &str, patch: &Value) -> Result<()> {
        lock(&self.projects).insert(format!("{}/{}", namespace, name), patch.clone());
        Ok(())
    }

    async fn record_event(
        &self,
        app: &Application,
        event_type: EventType,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        lock(&self.events).push(RecordedEvent {
            app: app.qualified_name(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }

    fn watch(&self) -> BoxStream<'static, Result<ObjectEvent<Application>>> {
        let existing: Vec<Result<ObjectEvent<Application>>> = lock(&self.apps)
            .values()
            .cloned()
            .map(|a| Ok(ObjectEvent::Applied(a)))
            .collect();
        let rx = self.changes.subscribe();
        let live = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((Ok(event), rx)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Application watch lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        stream::iter(existing).chain(live).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ApplicationSpec;
    use serde_json::json;

    fn app() -> Application {
        let mut app = Application::new("guestbook", ApplicationSpec::default());
        app.metadata.namespace = Some("driftwatch".to_string());
        app
    }

    #[tokio::test]
    async fn test_in_memory_patch() {
        let store = InMemoryAppStore::new();
        store.insert(app());
        let patched = store
            .patch(
                "driftwatch",
                "guestbook",
                &json!({"metadata": {"annotations": {"team": "web"}}}),
            )
            .await
            .unwrap();
        assert_eq!(patched.annotation("team"), Some("web"));
        assert_eq!(store.patches().len(), 1);
    }

    #[tokio::test]
    async fn test_in_memory_patch_null_removes_field() {
        let store = InMemoryAppStore::new();
        let mut seeded = app();
        seeded
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .extend([
                ("team".to_string(), "web".to_string()),
                ("tier".to_string(), "gold".to_string()),
            ]);
        store.insert(seeded);
        let patched = store
            .patch(
                "driftwatch",
                "guestbook",
                &json!({"metadata": {"annotations": {"team": null, "tier": "silver"}}}),
            )
            .await
            .unwrap();
        assert_eq!(patched.annotation("team"), None);
        assert_eq!(patched.annotation("tier"), Some("silver"));
    }

    #[tokio::test]
    async fn test_patch_missing_app() {
        let store = InMemoryAppStore::new();
        let err = store
            .patch("driftwatch", "missing", &json!({}))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
