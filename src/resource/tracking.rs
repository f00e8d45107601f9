//! Resource tracking: recording which application owns a live object
//!
//! Objects are tracked either by the instance label, by the tracking-id
//! annotation `<app>:<group>/<kind>:<namespace>/<name>`, or both.

use std::fmt;
use std::str::FromStr;

use kube::api::DynamicObject;
use kube::ResourceExt;

use super::annotations::{ANNOTATION_INSTALLATION_ID, ANNOTATION_TRACKING_ID};
use super::{group_version, kind_of};
use crate::error::{Error, Result};

pub const DEFAULT_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";

/// Label values are capped by the API server
const MAX_LABEL_VALUE_LEN: usize = 63;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum TrackingMethod {
    Label,
    #[default]
    Annotation,
    AnnotationAndLabel,
}

impl TrackingMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackingMethod::Label => "label",
            TrackingMethod::Annotation => "annotation",
            TrackingMethod::AnnotationAndLabel => "annotation+label",
        }
    }
}

impl FromStr for TrackingMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "label" => Ok(TrackingMethod::Label),
            "annotation" | "" => Ok(TrackingMethod::Annotation),
            "annotation+label" => Ok(TrackingMethod::AnnotationAndLabel),
            other => Err(Error::ConfigError(format!(
                "unknown tracking method '{}'",
                other
            ))),
        }
    }
}

/// Parsed value of the tracking-id annotation
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppInstanceValue {
    pub app_name: String,
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl AppInstanceValue {
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.splitn(3, ':');
        let app_name = parts.next()?;
        let group_kind = parts.next()?;
        let ns_name = parts.next()?;
        let (group, kind) = group_kind.split_once('/')?;
        let (namespace, name) = ns_name.split_once('/')?;
        if app_name.is_empty() || kind.is_empty() || name.is_empty() {
            return None;
        }
        Some(Self {
            app_name: app_name.to_string(),
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }
}

impl fmt::Display for AppInstanceValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}:{}/{}",
            self.app_name, self.group, self.kind, self.namespace, self.name
        )
    }
}

/// Reads and writes tracking metadata according to the configured method
#[derive(Clone, Debug)]
pub struct ResourceTracking {
    pub method: TrackingMethod,
    pub label_key: String,
    pub installation_id: Option<String>,
}

impl Default for ResourceTracking {
    fn default() -> Self {
        Self {
            method: TrackingMethod::default(),
            label_key: DEFAULT_INSTANCE_LABEL.to_string(),
            installation_id: None,
        }
    }
}

impl ResourceTracking {
    /// Tracking-id annotation value of an object, if it parses
    pub fn app_instance(&self, obj: &DynamicObject) -> Option<AppInstanceValue> {
        if let Some(id) = &self.installation_id {
            if obj.annotations().get(ANNOTATION_INSTALLATION_ID) != Some(id) {
                return None;
            }
        }
        obj.annotations()
            .get(ANNOTATION_TRACKING_ID)
            .and_then(|v| AppInstanceValue::parse(v))
    }

    /// Name of the application instance tracking the object
    pub fn app_name(&self, obj: &DynamicObject) -> Option<String> {
        match self.method {
            TrackingMethod::Label => obj.labels().get(&self.label_key).cloned(),
            TrackingMethod::Annotation | TrackingMethod::AnnotationAndLabel => {
                self.app_instance(obj).map(|v| v.app_name)
            }
        }
        .filter(|n| !n.is_empty())
    }

    /// Record `app_name` as the owner of `obj`.
    ///
    /// Cluster scoped objects keep an empty namespace in the tracking id.
    pub fn set_app_instance(&self, obj: &mut DynamicObject, app_name: &str, namespaced: bool) {
        let (group, _) = group_version(obj);
        let value = AppInstanceValue {
            app_name: app_name.to_string(),
            group,
            kind: kind_of(obj),
            namespace: if namespaced {
                obj.namespace().unwrap_or_default()
            } else {
                String::new()
            },
            name: obj.name_any(),
        };

        if matches!(
            self.method,
            TrackingMethod::Annotation | TrackingMethod::AnnotationAndLabel
        ) {
            let annotations = obj.annotations_mut();
            annotations.insert(ANNOTATION_TRACKING_ID.to_string(), value.to_string());
            if let Some(id) = &self.installation_id {
                annotations.insert(ANNOTATION_INSTALLATION_ID.to_string(), id.clone());
            }
        }
        if matches!(
            self.method,
            TrackingMethod::Label | TrackingMethod::AnnotationAndLabel
        ) {
            let label: String = app_name.chars().take(MAX_LABEL_VALUE_LEN).collect();
            obj.labels_mut().insert(self.label_key.clone(), label);
        }
    }

    /// Whether the tracking id of `live` points at `live` itself.
    ///
    /// Objects copied by other controllers keep the annotation of their
    /// source and must not be treated as managed.
    pub fn is_self_referenced(&self, live: &DynamicObject) -> bool {
        if self.method == TrackingMethod::Label {
            return true;
        }
        let Some(value) = self.app_instance(live) else {
            return true;
        };
        let (group, _) = group_version(live);
        value.group == group
            && value.kind == kind_of(live)
            && value.name == live.name_any()
            && (value.namespace.is_empty() || value.namespace == live.namespace().unwrap_or_default())
    }
}

/// Split an instance name into the application `(namespace, name)`
pub fn parse_instance_name(instance: &str, default_namespace: &str) -> (String, String) {
    match instance.split_once('_') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (default_namespace.to_string(), instance.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::new_object;

    #[test]
    fn test_instance_value_round_trip_format() {
        let value = AppInstanceValue::parse("guestbook:apps/Deployment:web/frontend").unwrap();
        assert_eq!(value.group, "apps");
        assert_eq!(value.namespace, "web");
        assert_eq!(value.to_string(), "guestbook:apps/Deployment:web/frontend");

        let core = AppInstanceValue::parse("guestbook:/Namespace:/web").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.namespace, "");
    }

    #[test]
    fn test_malformed_instance_value() {
        assert!(AppInstanceValue::parse("guestbook").is_none());
        assert!(AppInstanceValue::parse("guestbook:apps/Deployment").is_none());
    }

    #[test]
    fn test_annotation_tracking() {
        let tracking = ResourceTracking::default();
        let mut obj = new_object("apps/v1", "Deployment", "web", "frontend");
        tracking.set_app_instance(&mut obj, "guestbook", true);
        assert_eq!(tracking.app_name(&obj).as_deref(), Some("guestbook"));
        assert!(tracking.is_self_referenced(&obj));
    }

    #[test]
    fn test_copied_annotation_is_not_self_referenced() {
        let tracking = ResourceTracking::default();
        let mut source = new_object("v1", "Secret", "web", "tls");
        tracking.set_app_instance(&mut source, "guestbook", true);
        let mut copy = new_object("v1", "Secret", "other", "tls");
        copy.metadata.annotations = source.metadata.annotations.clone();
        assert!(!tracking.is_self_referenced(&copy));
    }

    #[test]
    fn test_label_tracking() {
        let tracking = ResourceTracking {
            method: TrackingMethod::Label,
            ..Default::default()
        };
        let mut obj = new_object("v1", "ConfigMap", "web", "settings");
        tracking.set_app_instance(&mut obj, "guestbook", true);
        assert_eq!(
            obj.labels().get(DEFAULT_INSTANCE_LABEL).map(String::as_str),
            Some("guestbook")
        );
        assert_eq!(tracking.app_name(&obj).as_deref(), Some("guestbook"));
    }

    #[test]
    fn test_installation_id_mismatch() {
        let tracking = ResourceTracking {
            installation_id: Some("prod".to_string()),
            ..Default::default()
        };
        let mut obj = new_object("v1", "ConfigMap", "web", "settings");
        ResourceTracking::default().set_app_instance(&mut obj, "guestbook", true);
        assert!(tracking.app_name(&obj).is_none());
    }

    #[test]
    fn test_parse_instance_name() {
        assert_eq!(
            parse_instance_name("team_guestbook", "driftwatch"),
            ("team".to_string(), "guestbook".to_string())
        );
        assert_eq!(
            parse_instance_name("guestbook", "driftwatch"),
            ("driftwatch".to_string(), "guestbook".to_string())
        );
    }
}
