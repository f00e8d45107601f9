//! Application Custom Resource Definition
//!
//! An Application binds a manifest source to a destination cluster and
//! namespace. Besides `spec` and `status` it carries a top-level
//! `operation` field holding the requested sync, so the resource type is
//! written out by hand instead of using `#[derive(CustomResource)]`.

use std::borrow::Cow;

use chrono::{DateTime, Utc};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::{Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::types::{
    ApplicationDestination, ApplicationSource, ApplicationStatus, Info, Operation,
    ResourceIgnoreDifferences, SyncPolicy,
};
use crate::error::{Error, Result};

pub const API_GROUP: &str = "driftwatch.io";
pub const API_VERSION: &str = "v1alpha1";
pub const APPLICATION_KIND: &str = "Application";
pub const APPLICATION_PLURAL: &str = "applications";

/// Default number of entries kept in `status.history`
pub const DEFAULT_REVISION_HISTORY_LIMIT: i64 = 10;

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ApplicationSource>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<ApplicationSource>,

    pub destination: ApplicationDestination,

    #[serde(default = "default_project")]
    pub project: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_policy: Option<SyncPolicy>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignore_differences: Vec<ResourceIgnoreDifferences>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub info: Vec<Info>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revision_history_limit: Option<i64>,
}

fn default_project() -> String {
    "default".to_string()
}

impl ApplicationSpec {
    pub fn has_multiple_sources(&self) -> bool {
        !self.sources.is_empty()
    }

    /// All configured sources, whether declared singly or as a list
    pub fn get_sources(&self) -> Vec<ApplicationSource> {
        if self.has_multiple_sources() {
            return self.sources.clone();
        }
        self.source.iter().cloned().collect()
    }

    /// Project name, `default` when unset
    pub fn project_name(&self) -> &str {
        if self.project.is_empty() {
            "default"
        } else {
            &self.project
        }
    }

    pub fn sync_options(&self) -> &[String] {
        self.sync_policy
            .as_ref()
            .map(|p| p.sync_options.as_slice())
            .unwrap_or(&[])
    }
}

/// A GitOps application
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    #[schemars(skip)]
    #[serde(default)]
    pub metadata: ObjectMeta,

    pub spec: ApplicationSpec,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ApplicationStatus>,
}

impl Resource for Application {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(APPLICATION_KIND)
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(API_GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(API_VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(APPLICATION_PLURAL)
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Application {
    pub fn new(name: &str, spec: ApplicationSpec) -> Self {
        Self {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            operation: None,
            status: None,
        }
    }

    /// `namespace/name` key used by the work queues
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Value recorded in tracking labels and annotations.
    ///
    /// Applications living in the controller namespace are tracked by bare
    /// name, others as `namespace_name`.
    pub fn instance_name(&self, controller_namespace: &str) -> String {
        let namespace = self.namespace().unwrap_or_default();
        if namespace.is_empty() || namespace == controller_namespace {
            self.name_any()
        } else {
            format!("{}_{}", namespace, self.name_any())
        }
    }

    pub fn status_or_default(&self) -> ApplicationStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn deletion_time(&self) -> Option<DateTime<Utc>> {
        self.metadata.deletion_timestamp.as_ref().map(|t| t.0)
    }

    pub fn revision_history_limit(&self) -> usize {
        self.spec
            .revision_history_limit
            .unwrap_or(DEFAULT_REVISION_HISTORY_LIMIT)
            .max(0) as usize
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Build the CustomResourceDefinition for installation
    pub fn crd() -> Result<CustomResourceDefinition> {
        let generator = schemars::gen::SchemaSettings::openapi3()
            .with(|s| {
                s.inline_subschemas = true;
                s.meta_schema = None;
            })
            .into_generator();
        let schema = generator.into_root_schema_for::<Application>();
        let schema = serde_json::to_value(schema)?;

        let crd = json!({
            "apiVersion": "apiextensions.k8s.io/v1",
            "kind": "CustomResourceDefinition",
            "metadata": { "name": format!("{}.{}", APPLICATION_PLURAL, API_GROUP) },
            "spec": {
                "group": API_GROUP,
                "names": {
                    "kind": APPLICATION_KIND,
                    "plural": APPLICATION_PLURAL,
                    "singular": "application",
                    "shortNames": ["app", "apps"],
                },
                "scope": "Namespaced",
                "versions": [{
                    "name": API_VERSION,
                    "served": true,
                    "storage": true,
                    "schema": { "openAPIV3Schema": schema },
                    "additionalPrinterColumns": [
                        {"name": "Sync Status", "type": "string", "jsonPath": ".status.sync.status"},
                        {"name": "Health Status", "type": "string", "jsonPath": ".status.health.status"},
                        {"name": "Revision", "type": "string", "jsonPath": ".status.sync.revision", "priority": 10},
                        {"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"},
                    ],
                }],
            },
        });
        serde_json::from_value(crd).map_err(Error::SerializationError)
    }
}
