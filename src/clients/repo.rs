//! Manifest source client
//!
//! Desired state is produced by an external manifest server. The controller
//! only consumes rendered manifests and the revision they were rendered at.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::crd::ApplicationSource;
use crate::error::{Error, Result};
use crate::resource::parse_manifests;

/// Request for the rendered manifests of every source of one application
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestRequest {
    pub app_name: String,
    pub namespace: String,
    pub project: String,
    pub sources: Vec<ApplicationSource>,
    /// Revision per source; empty entries resolve the source's target revision
    pub revisions: Vec<String>,
    pub app_label_key: String,
    pub tracking_method: String,
    pub no_cache: bool,
    pub no_revision_cache: bool,
}

/// Rendered output of one source
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestInfo {
    pub revision: String,
    #[serde(default)]
    pub manifests: Vec<String>,
    #[serde(default)]
    pub source_type: String,
}

#[derive(Clone, Debug, Default)]
pub struct ManifestResponse {
    pub objects: Vec<DynamicObject>,
    pub manifest_infos: Vec<ManifestInfo>,
}

impl ManifestResponse {
    pub fn from_infos(manifest_infos: Vec<ManifestInfo>) -> Result<Self> {
        let mut objects = Vec::new();
        for info in &manifest_infos {
            for manifest in &info.manifests {
                objects.extend(parse_manifests(manifest)?);
            }
        }
        Ok(Self {
            objects,
            manifest_infos,
        })
    }

    pub fn revisions(&self) -> Vec<String> {
        self.manifest_infos.iter().map(|m| m.revision.clone()).collect()
    }

    pub fn source_types(&self) -> Vec<String> {
        self.manifest_infos
            .iter()
            .map(|m| m.source_type.clone())
            .collect()
    }
}

#[async_trait]
pub trait ManifestSource: Send + Sync {
    /// Render every source of an application.
    ///
    /// `Error::RepoUnavailable` marks transient failures, `Error::ManifestError`
    /// marks manifests that will not render until the source changes.
    async fn get_repo_objs(&self, request: &ManifestRequest) -> Result<ManifestResponse>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestsWire {
    #[serde(default)]
    sources: Vec<ManifestInfo>,
}

#[derive(Deserialize)]
struct ErrorWire {
    #[serde(default)]
    message: String,
}

/// JSON client for the manifest server
pub struct HttpManifestSource {
    client: Client,
    base_url: String,
}

impl HttpManifestSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ManifestSource for HttpManifestSource {
    #[instrument(skip(self, request), fields(app = %request.app_name, namespace = %request.namespace))]
    async fn get_repo_objs(&self, request: &ManifestRequest) -> Result<ManifestResponse> {
        let url = format!("{}/api/v1/manifests", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| Error::RepoUnavailable(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(Error::RepoUnavailable(format!(
                "manifest server returned {}",
                status
            )));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorWire>(&body)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(Error::ManifestError(format!(
                "manifest generation failed ({}): {}",
                status, message
            )));
        }

        let wire: ManifestsWire = response
            .json()
            .await
            .map_err(|e| Error::ManifestError(format!("malformed manifest response: {}", e)))?;
        debug!("Received {} rendered sources", wire.sources.len());
        ManifestResponse::from_infos(wire.sources)
    }
}

/// Manifest source serving fixed manifests per application
#[derive(Default)]
pub struct StaticManifestSource {
    manifests: Mutex<HashMap<String, Result<Vec<ManifestInfo>, String>>>,
    calls: Mutex<Vec<ManifestRequest>>,
}

impl StaticManifestSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `yaml` at `revision` for the application `name`
    pub fn set(&self, name: &str, revision: &str, yaml: &str) {
        let info = ManifestInfo {
            revision: revision.to_string(),
            manifests: vec![yaml.to_string()],
            source_type: "Directory".to_string(),
        };
        self.manifests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), Ok(vec![info]));
    }

    /// Fail every request for `name` as unavailable
    pub fn set_unavailable(&self, name: &str, message: &str) {
        self.manifests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name.to_string(), Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<ManifestRequest> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ManifestSource for StaticManifestSource {
    async fn get_repo_objs(&self, request: &ManifestRequest) -> Result<ManifestResponse> {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        let entry = self
            .manifests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&request.app_name)
            .cloned();
        match entry {
            Some(Ok(infos)) => ManifestResponse::from_infos(infos),
            Some(Err(message)) => Err(Error::RepoUnavailable(message)),
            None => Ok(ManifestResponse::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> ManifestRequest {
        ManifestRequest {
            app_name: "guestbook".to_string(),
            namespace: "driftwatch".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_renders_manifests() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/manifests"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sources": [{
                    "revision": "abc123",
                    "sourceType": "Directory",
                    "manifests": ["apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: settings\n"]
                }]
            })))
            .mount(&mock_server)
            .await;

        let source = HttpManifestSource::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        let response = source.get_repo_objs(&request()).await.unwrap();
        assert_eq!(response.objects.len(), 1);
        assert_eq!(response.revisions(), vec!["abc123".to_string()]);
        assert_eq!(response.source_types(), vec!["Directory".to_string()]);
    }

    #[tokio::test]
    async fn test_server_error_is_transient() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&mock_server)
            .await;

        let source = HttpManifestSource::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        let err = source.get_repo_objs(&request()).await.unwrap_err();
        assert!(matches!(err, Error::RepoUnavailable(_)));
        assert!(err.is_retriable());
    }

    #[tokio::test]
    async fn test_bad_request_is_manifest_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"message": "kustomize build failed"})),
            )
            .mount(&mock_server)
            .await;

        let source = HttpManifestSource::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        let err = source.get_repo_objs(&request()).await.unwrap_err();
        match err {
            Error::ManifestError(msg) => assert!(msg.contains("kustomize build failed")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_malformed_manifest() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "sources": [{"revision": "abc", "manifests": ["metadata:\n  name: x\n"]}]
            })))
            .mount(&mock_server)
            .await;

        let source = HttpManifestSource::new(&mock_server.uri(), Duration::from_secs(5)).unwrap();
        let err = source.get_repo_objs(&request()).await.unwrap_err();
        assert!(matches!(err, Error::ManifestError(_)));
    }

    #[tokio::test]
    async fn test_static_source_records_calls() {
        let source = StaticManifestSource::new();
        source.set(
            "guestbook",
            "v1",
            "apiVersion: v1\nkind: Service\nmetadata:\n  name: web\n",
        );
        let response = source.get_repo_objs(&request()).await.unwrap();
        assert_eq!(response.objects.len(), 1);
        assert_eq!(source.calls().len(), 1);
    }
}
