//! Helpers for working with untyped Kubernetes objects
//!
//! Manifests and live objects are carried around as `DynamicObject` and
//! identified by `ResourceKey`.

pub mod annotations;
pub mod tracking;

use std::fmt;

use kube::api::DynamicObject;
use kube::core::{GroupVersionKind, TypeMeta};
use kube::ResourceExt;
use serde::Deserialize;
use serde_json::Value;

use crate::error::{Error, Result};

pub const NAMESPACE_KIND: &str = "Namespace";
pub const CRD_KIND: &str = "CustomResourceDefinition";
pub const CRD_GROUP: &str = "apiextensions.k8s.io";

/// Kind and API group without a version
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    pub group: String,
    pub kind: String,
}

impl GroupKind {
    pub fn new(group: &str, kind: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}/{}", self.group, self.kind)
        }
    }
}

/// Identity of a resource independent of its API version
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(group: &str, kind: &str, namespace: &str, name: &str) -> Self {
        Self {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    pub fn from_object(obj: &DynamicObject) -> Self {
        let (group, _) = group_version(obj);
        Self {
            group,
            kind: kind_of(obj),
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        }
    }

    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(&self.group, &self.kind)
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.group, self.kind, self.namespace, self.name)
    }
}

/// Split an `apiVersion` into group and version
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.rsplit_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

pub fn join_api_version(group: &str, version: &str) -> String {
    if group.is_empty() {
        version.to_string()
    } else {
        format!("{}/{}", group, version)
    }
}

pub fn group_version(obj: &DynamicObject) -> (String, String) {
    obj.types
        .as_ref()
        .map(|t| split_api_version(&t.api_version))
        .unwrap_or_default()
}

pub fn kind_of(obj: &DynamicObject) -> String {
    obj.types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default()
}

pub fn gvk_of(obj: &DynamicObject) -> GroupVersionKind {
    let (group, version) = group_version(obj);
    GroupVersionKind::gvk(&group, &version, &kind_of(obj))
}

pub fn is_namespace(obj: &DynamicObject) -> bool {
    kind_of(obj) == NAMESPACE_KIND && group_version(obj).0.is_empty()
}

pub fn is_crd(obj: &DynamicObject) -> bool {
    kind_of(obj) == CRD_KIND && group_version(obj).0 == CRD_GROUP
}

/// Group and kind served by a CRD object
pub fn crd_group_kind(obj: &DynamicObject) -> Option<GroupKind> {
    let spec = obj.data.get("spec")?;
    let group = spec.get("group")?.as_str()?;
    let kind = spec.get("names")?.get("kind")?.as_str()?;
    Some(GroupKind::new(group, kind))
}

/// Full JSON representation of an object
pub fn to_value(obj: &DynamicObject) -> Result<Value> {
    serde_json::to_value(obj).map_err(Error::SerializationError)
}

pub fn from_value(value: Value) -> Result<DynamicObject> {
    serde_json::from_value(value).map_err(Error::SerializationError)
}

/// Parse a multi-document YAML or JSON string into objects.
///
/// `List` documents are flattened and empty documents skipped.
pub fn parse_manifests(raw: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for doc in serde_yaml::Deserializer::from_str(raw) {
        let yaml = serde_yaml::Value::deserialize(doc)?;
        let value = serde_json::to_value(yaml)?;
        if value.is_null() {
            continue;
        }
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or_default();
        if kind.ends_with("List") {
            if let Some(items) = value.get("items").and_then(Value::as_array) {
                for item in items {
                    objects.push(from_value(item.clone())?);
                }
                continue;
            }
        }
        if value.get("apiVersion").is_none() || value.get("kind").is_none() {
            return Err(Error::ManifestError(
                "object is missing apiVersion or kind".to_string(),
            ));
        }
        objects.push(from_value(value)?);
    }
    Ok(objects)
}

/// Build a `DynamicObject` with type information set
pub fn new_object(api_version: &str, kind: &str, namespace: &str, name: &str) -> DynamicObject {
    let mut obj = DynamicObject {
        types: Some(TypeMeta {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
        }),
        metadata: Default::default(),
        data: Value::Object(Default::default()),
    };
    obj.metadata.name = Some(name.to_string());
    if !namespace.is_empty() {
        obj.metadata.namespace = Some(namespace.to_string());
    }
    obj
}

/// Images referenced by the pod template or pod spec of an object
pub fn images_of(obj: &DynamicObject) -> Vec<String> {
    let spec = match kind_of(obj).as_str() {
        "Pod" => obj.data.get("spec"),
        "CronJob" => obj
            .data
            .pointer("/spec/jobTemplate/spec/template/spec"),
        _ => obj.data.pointer("/spec/template/spec"),
    };
    let mut images = Vec::new();
    if let Some(spec) = spec {
        for field in ["initContainers", "containers"] {
            if let Some(containers) = spec.get(field).and_then(Value::as_array) {
                for c in containers {
                    if let Some(image) = c.get("image").and_then(Value::as_str) {
                        images.push(image.to_string());
                    }
                }
            }
        }
    }
    images
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_api_version() {
        assert_eq!(
            split_api_version("apps/v1"),
            ("apps".to_string(), "v1".to_string())
        );
        assert_eq!(split_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn test_parse_multi_document_yaml() {
        let raw = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: a
---
---
apiVersion: v1
kind: List
items:
- apiVersion: v1
  kind: Service
  metadata:
    name: b
"#;
        let objs = parse_manifests(raw).unwrap();
        assert_eq!(objs.len(), 2);
        assert_eq!(kind_of(&objs[1]), "Service");
    }

    #[test]
    fn test_parse_rejects_untyped_document() {
        assert!(parse_manifests("metadata:\n  name: x\n").is_err());
    }

    #[test]
    fn test_resource_key_from_object() {
        let obj = new_object("apps/v1", "Deployment", "web", "frontend");
        let key = ResourceKey::from_object(&obj);
        assert_eq!(key, ResourceKey::new("apps", "Deployment", "web", "frontend"));
        assert_eq!(key.to_string(), "apps/Deployment/web/frontend");
    }

    #[test]
    fn test_crd_group_kind() {
        let mut crd = new_object("apiextensions.k8s.io/v1", CRD_KIND, "", "widgets.example.com");
        crd.data = serde_json::json!({"spec": {"group": "example.com", "names": {"kind": "Widget"}}});
        assert!(is_crd(&crd));
        assert_eq!(crd_group_kind(&crd), Some(GroupKind::new("example.com", "Widget")));
    }
}
