//! Resource executor: the only path through which the controller changes a cluster

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use kube::api::{
    Api, DeleteParams, DynamicObject, Patch, PatchParams, PostParams,
    PropagationPolicy as KubePropagationPolicy,
};
use kube::core::{ApiResource, GroupVersionKind};
use kube::discovery::{self, Scope};
use kube::{Client, ResourceExt};
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, instrument};

use crate::controller::diff::merge_patch;
use crate::error::{Error, Result};
use crate::resource::annotations::ANNOTATION_LAST_APPLIED;
use crate::resource::{gvk_of, to_value, ResourceKey};

/// Field manager recorded on server-side applies
pub const FIELD_MANAGER: &str = "driftwatch-controller";

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PropagationPolicy {
    #[default]
    Foreground,
    Background,
    Orphan,
}

impl FromStr for PropagationPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "foreground" => Ok(PropagationPolicy::Foreground),
            "background" => Ok(PropagationPolicy::Background),
            "orphan" => Ok(PropagationPolicy::Orphan),
            other => Err(Error::ValidationError(format!(
                "unknown propagation policy '{}'",
                other
            ))),
        }
    }
}

impl From<PropagationPolicy> for KubePropagationPolicy {
    fn from(p: PropagationPolicy) -> Self {
        match p {
            PropagationPolicy::Foreground => KubePropagationPolicy::Foreground,
            PropagationPolicy::Background => KubePropagationPolicy::Background,
            PropagationPolicy::Orphan => KubePropagationPolicy::Orphan,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    pub dry_run: bool,
    /// Delete and recreate when the object cannot be patched
    pub force: bool,
    pub server_side: bool,
    pub replace: bool,
    pub validate: bool,
}

/// Capability to read and mutate objects in one cluster
#[async_trait]
pub trait ResourceExecutor: Send + Sync {
    async fn get(&self, key: &ResourceKey, version: &str) -> Result<DynamicObject>;

    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject>;

    async fn create(&self, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject>;

    /// JSON merge patch
    async fn patch(
        &self,
        key: &ResourceKey,
        version: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<DynamicObject>;

    async fn delete(
        &self,
        key: &ResourceKey,
        version: &str,
        policy: PropagationPolicy,
        dry_run: bool,
    ) -> Result<()>;

    /// Re-read an object at another API version
    async fn convert_version(&self, obj: DynamicObject, version: &str) -> Result<DynamicObject>;
}

fn kube_to_error(e: kube::Error, key: &ResourceKey) -> Error {
    match e {
        kube::Error::Api(resp) if resp.code == 404 => Error::not_found(&key.kind, key.to_string()),
        other => Error::KubeError(other),
    }
}

/// Executor backed by a kube client and API discovery
pub struct KubeExecutor {
    client: Client,
    server: String,
    resources: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl KubeExecutor {
    pub fn new(client: Client, server: &str) -> Self {
        Self {
            client,
            server: server.to_string(),
            resources: RwLock::new(HashMap::new()),
        }
    }

    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        let cache_key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(found) = self.resources.read().await.get(&cache_key) {
            return Ok(found.clone());
        }
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk).await?;
        let namespaced = matches!(caps.scope, Scope::Namespaced);
        self.resources
            .write()
            .await
            .insert(cache_key, (ar.clone(), namespaced));
        Ok((ar, namespaced))
    }

    async fn api_for(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        let (ar, namespaced) = self.resolve(gvk).await?;
        if namespaced {
            if namespace.is_empty() {
                return Err(Error::ValidationError(format!(
                    "namespace required for {}",
                    gvk.kind
                )));
            }
            Ok(Api::namespaced_with(self.client.clone(), namespace, &ar))
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    fn key_gvk(key: &ResourceKey, version: &str) -> GroupVersionKind {
        GroupVersionKind::gvk(&key.group, version, &key.kind)
    }

    #[cfg(feature = "metrics")]
    fn record<T>(&self, verb: &str, kind: &str, result: &Result<T>) {
        let status = match result {
            Ok(_) => "ok",
            Err(e) if e.is_not_found() => "not_found",
            Err(_) => "error",
        };
        crate::controller::metrics::inc_k8s_request(&self.server, verb, kind, status);
    }

    #[cfg(not(feature = "metrics"))]
    fn record<T>(&self, _verb: &str, _kind: &str, _result: &Result<T>) {}

    async fn apply_object(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        let gvk = gvk_of(obj);
        let api = self.api_for(&gvk, &key.namespace).await?;
        let name = obj.name_any();

        if opts.server_side {
            let mut pp = PatchParams::apply(FIELD_MANAGER).force();
            pp.dry_run = opts.dry_run;
            if !opts.validate {
                pp.field_validation = Some(kube::api::ValidationDirective::Ignore);
            }
            return api
                .patch(&name, &pp, &Patch::Apply(obj))
                .await
                .map_err(|e| kube_to_error(e, &key));
        }

        if opts.replace {
            let pp = PostParams {
                dry_run: opts.dry_run,
                field_manager: Some(FIELD_MANAGER.to_string()),
            };
            return match api.get_opt(&name).await? {
                Some(live) => {
                    let mut replacement = obj.clone();
                    replacement.metadata.resource_version = live.resource_version();
                    api.replace(&name, &pp, &replacement)
                        .await
                        .map_err(|e| kube_to_error(e, &key))
                }
                None => api
                    .create(&pp, obj)
                    .await
                    .map_err(|e| kube_to_error(e, &key)),
            };
        }

        match self.client_side_apply(&api, obj, &key, opts.dry_run).await {
            Err(Error::KubeError(kube::Error::Api(resp)))
                if opts.force && !opts.dry_run && (resp.code == 422 || resp.code == 409) =>
            {
                debug!("Recreating {} after rejected patch: {}", key, resp.message);
                let dp = DeleteParams {
                    propagation_policy: Some(KubePropagationPolicy::Foreground),
                    ..Default::default()
                };
                api.delete(&name, &dp)
                    .await
                    .map_err(|e| kube_to_error(e, &key))?;
                let pp = PostParams {
                    dry_run: false,
                    field_manager: Some(FIELD_MANAGER.to_string()),
                };
                api.create(&pp, obj)
                    .await
                    .map_err(|e| kube_to_error(e, &key))
            }
            other => other,
        }
    }

    /// Client-side apply: create, or three-way merge against the
    /// last-applied annotation
    async fn client_side_apply(
        &self,
        api: &Api<DynamicObject>,
        obj: &DynamicObject,
        key: &ResourceKey,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let mut desired = obj.clone();
        desired.annotations_mut().remove(ANNOTATION_LAST_APPLIED);
        let applied = serde_json::to_string(&desired)?;
        desired
            .annotations_mut()
            .insert(ANNOTATION_LAST_APPLIED.to_string(), applied);

        let name = obj.name_any();
        match api.get_opt(&name).await? {
            None => {
                let pp = PostParams {
                    dry_run,
                    field_manager: Some(FIELD_MANAGER.to_string()),
                };
                api.create(&pp, &desired)
                    .await
                    .map_err(|e| kube_to_error(e, key))
            }
            Some(live) => {
                let last = live
                    .annotations()
                    .get(ANNOTATION_LAST_APPLIED)
                    .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
                let patch = merge_patch(last.as_ref(), &to_value(&desired)?);
                let mut pp = PatchParams::default();
                pp.dry_run = dry_run;
                api.patch(&name, &pp, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| kube_to_error(e, key))
            }
        }
    }
}

#[async_trait]
impl ResourceExecutor for KubeExecutor {
    async fn get(&self, key: &ResourceKey, version: &str) -> Result<DynamicObject> {
        let api = self.api_for(&Self::key_gvk(key, version), &key.namespace).await?;
        let result = api.get(&key.name).await.map_err(|e| kube_to_error(e, key));
        self.record("get", &key.kind, &result);
        result
    }

    #[instrument(skip(self, obj), fields(name = %obj.name_any(), namespace = obj.namespace()))]
    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        let result = self.apply_object(obj, opts).await;
        self.record("apply", &ResourceKey::from_object(obj).kind, &result);
        result
    }

    async fn create(&self, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject> {
        let key = ResourceKey::from_object(obj);
        let api = self.api_for(&gvk_of(obj), &key.namespace).await?;
        let pp = PostParams {
            dry_run,
            field_manager: Some(FIELD_MANAGER.to_string()),
        };
        let result = api.create(&pp, obj).await.map_err(|e| kube_to_error(e, &key));
        self.record("create", &key.kind, &result);
        result
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        version: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        let api = self.api_for(&Self::key_gvk(key, version), &key.namespace).await?;
        let mut pp = PatchParams::default();
        pp.dry_run = dry_run;
        let result = api
            .patch(&key.name, &pp, &Patch::Merge(patch))
            .await
            .map_err(|e| kube_to_error(e, key));
        self.record("patch", &key.kind, &result);
        result
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        version: &str,
        policy: PropagationPolicy,
        dry_run: bool,
    ) -> Result<()> {
        let api = self.api_for(&Self::key_gvk(key, version), &key.namespace).await?;
        let dp = DeleteParams {
            dry_run,
            propagation_policy: Some(policy.into()),
            ..Default::default()
        };
        let result = api
            .delete(&key.name, &dp)
            .await
            .map(|_| ())
            .map_err(|e| kube_to_error(e, key));
        self.record("delete", &key.kind, &result);
        result
    }

    async fn convert_version(&self, obj: DynamicObject, version: &str) -> Result<DynamicObject> {
        let gvk = gvk_of(&obj);
        if gvk.version == version {
            return Ok(obj);
        }
        self.get(&ResourceKey::from_object(&obj), version).await
    }
}

/// Bounds the number of concurrent calls into an executor
pub struct ThrottledExecutor {
    inner: Arc<dyn ResourceExecutor>,
    permits: Arc<Semaphore>,
}

impl ThrottledExecutor {
    pub fn new(inner: Arc<dyn ResourceExecutor>, permits: Arc<Semaphore>) -> Self {
        Self { inner, permits }
    }
}

macro_rules! throttled {
    ($self:ident, $call:expr) => {{
        let _permit = $self
            .permits
            .acquire()
            .await
            .map_err(|_| Error::Cancelled)?;
        $call.await
    }};
}

#[async_trait]
impl ResourceExecutor for ThrottledExecutor {
    async fn get(&self, key: &ResourceKey, version: &str) -> Result<DynamicObject> {
        throttled!(self, self.inner.get(key, version))
    }

    async fn apply(&self, obj: &DynamicObject, opts: &ApplyOptions) -> Result<DynamicObject> {
        throttled!(self, self.inner.apply(obj, opts))
    }

    async fn create(&self, obj: &DynamicObject, dry_run: bool) -> Result<DynamicObject> {
        throttled!(self, self.inner.create(obj, dry_run))
    }

    async fn patch(
        &self,
        key: &ResourceKey,
        version: &str,
        patch: &Value,
        dry_run: bool,
    ) -> Result<DynamicObject> {
        throttled!(self, self.inner.patch(key, version, patch, dry_run))
    }

    async fn delete(
        &self,
        key: &ResourceKey,
        version: &str,
        policy: PropagationPolicy,
        dry_run: bool,
    ) -> Result<()> {
        throttled!(self, self.inner.delete(key, version, policy, dry_run))
    }

    async fn convert_version(&self, obj: DynamicObject, version: &str) -> Result<DynamicObject> {
        throttled!(self, self.inner.convert_version(obj, version))
    }
}
