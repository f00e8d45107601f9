//! Three-way diff between desired manifests and live objects
//!
//! The predicted live state is what the API server would hold after
//! applying the target: live merged with a patch computed from the
//! last-applied configuration and the target. A resource is modified when
//! the normalized predicted state differs from the normalized live state,
//! so server-populated defaults never show up as drift.

use kube::api::DynamicObject;
use serde_json::{Map, Value};

use crate::clients::Settings;
use crate::crd::ResourceIgnoreDifferences;
use crate::error::{Error, Result};
use crate::resource::annotations::ANNOTATION_LAST_APPLIED;
use crate::resource::to_value;

const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

/// Metadata written by the API server, never part of the desired state
const SERVER_METADATA: &[&str] = &[
    "managedFields",
    "resourceVersion",
    "uid",
    "generation",
    "creationTimestamp",
    "selfLink",
    "deletionTimestamp",
    "deletionGracePeriodSeconds",
];

#[derive(Clone, Debug, Default, PartialEq)]
pub struct DiffResult {
    pub modified: bool,
    pub normalized_live: Value,
    pub predicted_live: Value,
}

/// Ignore rule resolved for diffing
#[derive(Clone, Debug, PartialEq)]
pub struct IgnoreRule {
    pub group: String,
    pub kind: String,
    pub name: Option<String>,
    pub namespace: Option<String>,
    pub pointers: Vec<String>,
    pub managers: Vec<String>,
}

impl IgnoreRule {
    pub fn from_spec(spec: &ResourceIgnoreDifferences) -> Self {
        Self {
            group: spec.group.clone(),
            kind: spec.kind.clone(),
            name: spec.name.clone().filter(|n| !n.is_empty()),
            namespace: spec.namespace.clone().filter(|n| !n.is_empty()),
            pointers: spec.json_pointers.clone(),
            managers: spec.managed_fields_managers.clone(),
        }
    }

    fn matches(&self, group: &str, kind: &str, namespace: &str, name: &str) -> bool {
        let glob = |pattern: &str, value: &str| {
            pattern == "*"
                || pattern == value
                || glob::Pattern::new(pattern)
                    .map(|p| p.matches(value))
                    .unwrap_or(false)
        };
        glob(&self.group, group)
            && glob(&self.kind, kind)
            && self.name.as_deref().map(|n| glob(n, name)).unwrap_or(true)
            && self
                .namespace
                .as_deref()
                .map(|n| glob(n, namespace))
                .unwrap_or(true)
    }

    fn validate(&self) -> Result<()> {
        for pointer in &self.pointers {
            if !pointer.is_empty() && !pointer.starts_with('/') {
                return Err(Error::ValidationError(format!(
                    "invalid JSON pointer '{}' in ignoreDifferences for {}",
                    pointer, self.kind
                )));
            }
        }
        Ok(())
    }
}

/// Normalisation settings for one application
#[derive(Clone, Debug, Default)]
pub struct DiffConfig {
    rules: Vec<IgnoreRule>,
    ignore_aggregated_roles: bool,
}

impl DiffConfig {
    pub fn new(app_rules: &[ResourceIgnoreDifferences], settings: &Settings) -> Self {
        let mut rules: Vec<IgnoreRule> = app_rules.iter().map(IgnoreRule::from_spec).collect();
        for (gk, ov) in &settings.resource_overrides {
            if !ov.ignore_differences.is_empty() {
                rules.push(IgnoreRule {
                    group: gk.group.clone(),
                    kind: gk.kind.clone(),
                    name: None,
                    namespace: None,
                    pointers: ov.ignore_differences.clone(),
                    managers: Vec::new(),
                });
            }
        }
        Self {
            rules,
            ignore_aggregated_roles: settings.ignore_aggregated_roles,
        }
    }

    /// Rules applying to an object
    fn rules_for(&self, value: &Value) -> Vec<&IgnoreRule> {
        let api_version = value.get("apiVersion").and_then(Value::as_str).unwrap_or("");
        let group = api_version.rsplit_once('/').map(|(g, _)| g).unwrap_or("");
        let kind = value.get("kind").and_then(Value::as_str).unwrap_or("");
        let namespace = value
            .pointer("/metadata/namespace")
            .and_then(Value::as_str)
            .unwrap_or("");
        let name = value
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or("");
        self.rules
            .iter()
            .filter(|r| r.matches(group, kind, namespace, name))
            .collect()
    }

    /// Remove ignored and server-owned fields.
    ///
    /// `live` supplies managed field ownership for manager based rules.
    pub fn normalize(&self, value: &Value, live: Option<&Value>) -> Result<Value> {
        let mut out = value.clone();
        if let Some(meta) = out.get_mut("metadata").and_then(Value::as_object_mut) {
            for field in SERVER_METADATA {
                meta.remove(*field);
            }
            if let Some(annotations) = meta.get_mut("annotations").and_then(Value::as_object_mut) {
                annotations.remove(ANNOTATION_LAST_APPLIED);
                if annotations.is_empty() {
                    meta.remove("annotations");
                }
            }
            if meta.get("labels").and_then(Value::as_object).map(Map::is_empty) == Some(true) {
                meta.remove("labels");
            }
        }
        if let Some(obj) = out.as_object_mut() {
            obj.remove("status");
        }

        for rule in self.rules_for(value) {
            rule.validate()?;
            for pointer in &rule.pointers {
                remove_pointer(&mut out, pointer);
            }
            if !rule.managers.is_empty() {
                if let Some(live) = live {
                    for path in managed_paths(live, &rule.managers) {
                        remove_path(&mut out, &path);
                    }
                }
            }
        }

        if self.ignore_aggregated_roles && is_aggregated_role(value, live) {
            if let Some(obj) = out.as_object_mut() {
                obj.remove("rules");
            }
        }
        Ok(out)
    }
}

/// Aggregated ClusterRoles get their rules filled in by the API server
fn is_aggregated_role(value: &Value, live: Option<&Value>) -> bool {
    let is_role = value.get("kind").and_then(Value::as_str) == Some("ClusterRole")
        && value
            .get("apiVersion")
            .and_then(Value::as_str)
            .map(|v| v.starts_with(RBAC_GROUP))
            .unwrap_or(false);
    is_role
        && (value.get("aggregationRule").is_some()
            || live.map(|l| l.get("aggregationRule").is_some()).unwrap_or(false))
}

fn unescape(segment: &str) -> String {
    segment.replace("~1", "/").replace("~0", "~")
}

/// Remove the value at an RFC 6901 pointer, if present
pub fn remove_pointer(value: &mut Value, pointer: &str) {
    let path: Vec<String> = pointer
        .split('/')
        .skip(1)
        .map(unescape)
        .collect();
    remove_path(value, &path);
}

fn remove_path(value: &mut Value, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        let next = match current {
            Value::Object(map) => map.get_mut(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return,
        }
    }
    match current {
        Value::Object(map) => {
            map.remove(last);
        }
        Value::Array(items) => {
            if let Ok(i) = last.parse::<usize>() {
                if i < items.len() {
                    items.remove(i);
                }
            }
        }
        _ => {}
    }
}

/// Leaf field paths owned by the given managers according to `managedFields`
fn managed_paths(live: &Value, managers: &[String]) -> Vec<Vec<String>> {
    let mut paths = Vec::new();
    let Some(entries) = live.pointer("/metadata/managedFields").and_then(Value::as_array) else {
        return paths;
    };
    for entry in entries {
        let manager = entry.get("manager").and_then(Value::as_str).unwrap_or("");
        if !managers.iter().any(|m| m == manager) {
            continue;
        }
        if let Some(fields) = entry.get("fieldsV1") {
            collect_field_paths(fields, &mut Vec::new(), &mut paths);
        }
    }
    paths
}

fn collect_field_paths(fields: &Value, prefix: &mut Vec<String>, out: &mut Vec<Vec<String>>) {
    let Some(map) = fields.as_object() else {
        return;
    };
    let children: Vec<(&String, &Value)> = map.iter().filter(|(k, _)| k.as_str() != ".").collect();
    if children.is_empty() {
        if !prefix.is_empty() {
            out.push(prefix.clone());
        }
        return;
    }
    for (key, child) in children {
        // list element keys (k:, v:, i:) cannot be mapped onto a path
        let Some(field) = key.strip_prefix("f:") else {
            continue;
        };
        prefix.push(field.to_string());
        collect_field_paths(child, prefix, out);
        prefix.pop();
    }
}

/// Patch turning `last_applied` into `target`: target fields plus nulls for
/// fields dropped since the last apply
pub fn merge_patch(last_applied: Option<&Value>, target: &Value) -> Value {
    match last_applied {
        Some(last) => patch_between(last, target, true).unwrap_or_else(|| target.clone()),
        None => target.clone(),
    }
}

/// Minimal merge patch turning `original` into `modified`, `None` when they
/// are equal. Removed keys become nulls; arrays and scalars are replaced whole.
pub fn create_merge_patch(original: &Value, modified: &Value) -> Option<Value> {
    patch_between(original, modified, false)
}

fn patch_between(original: &Value, modified: &Value, keep_unchanged: bool) -> Option<Value> {
    match (original, modified) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (k, v) in new {
                let entry = match old.get(k) {
                    Some(prev) => patch_between(prev, v, keep_unchanged),
                    None => Some(v.clone()),
                };
                if let Some(entry) = entry {
                    patch.insert(k.clone(), entry);
                }
            }
            for k in old.keys() {
                if !new.contains_key(k) {
                    patch.insert(k.clone(), Value::Null);
                }
            }
            (keep_unchanged || !patch.is_empty()).then_some(Value::Object(patch))
        }
        (old, new) if old == new && !keep_unchanged => None,
        (_, new) => Some(new.clone()),
    }
}

/// Apply a patch the way the API server merges lists of named items:
/// elements are matched by `name`, equal length lists pairwise.
fn apply_predicted(live: &mut Value, patch: &Value) {
    match (live, patch) {
        (Value::Object(live_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                if v.is_null() {
                    live_map.remove(k);
                    continue;
                }
                match live_map.get_mut(k) {
                    Some(existing) => apply_predicted(existing, v),
                    None => {
                        live_map.insert(k.clone(), strip_nulls(v));
                    }
                }
            }
        }
        (Value::Array(live_items), Value::Array(patch_items)) => {
            let named = |items: &[Value]| {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|i| i.get("name").and_then(Value::as_str).is_some())
            };
            if named(patch_items) && named(live_items) {
                let mut merged = Vec::with_capacity(patch_items.len());
                for item in patch_items {
                    let name = item.get("name");
                    let mut base = live_items
                        .iter()
                        .find(|l| l.get("name") == name)
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new()));
                    apply_predicted(&mut base, item);
                    merged.push(base);
                }
                *live_items = merged;
            } else if live_items.len() == patch_items.len() {
                for (l, p) in live_items.iter_mut().zip(patch_items) {
                    apply_predicted(l, p);
                }
            } else {
                *live_items = patch_items.iter().map(strip_nulls).collect();
            }
        }
        (live, patch) => *live = strip_nulls(patch),
    }
}

fn strip_nulls(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_nulls).collect()),
        other => other.clone(),
    }
}

/// Live state predicted after applying `target` client side
pub fn predict_live(target: &Value, live: &Value) -> Value {
    let last_applied = live
        .pointer(&format!(
            "/metadata/annotations/{}",
            ANNOTATION_LAST_APPLIED.replace('~', "~0").replace('/', "~1")
        ))
        .and_then(Value::as_str)
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok());
    let patch = merge_patch(last_applied.as_ref(), target);
    let mut predicted = live.clone();
    apply_predicted(&mut predicted, &patch);
    predicted
}

/// Diff a target against its live counterpart.
///
/// `server_predicted` replaces the client side prediction when a server
/// side dry run was performed.
pub fn diff(
    target: Option<&DynamicObject>,
    live: Option<&DynamicObject>,
    server_predicted: Option<&DynamicObject>,
    config: &DiffConfig,
) -> Result<DiffResult> {
    match (target, live) {
        (Some(target), Some(live)) => {
            let target_value = to_value(target)?;
            let live_value = to_value(live)?;
            let predicted = match server_predicted {
                Some(p) => to_value(p)?,
                None => predict_live(&target_value, &live_value),
            };
            let normalized_live = config.normalize(&live_value, Some(&live_value))?;
            let predicted_live = config.normalize(&predicted, Some(&live_value))?;
            Ok(DiffResult {
                modified: normalized_live != predicted_live,
                normalized_live,
                predicted_live,
            })
        }
        (Some(target), None) => {
            let target_value = to_value(target)?;
            Ok(DiffResult {
                modified: true,
                normalized_live: Value::Null,
                predicted_live: config.normalize(&target_value, None)?,
            })
        }
        (None, Some(live)) => {
            let live_value = to_value(live)?;
            Ok(DiffResult {
                modified: true,
                normalized_live: config.normalize(&live_value, Some(&live_value))?,
                predicted_live: Value::Null,
            })
        }
        (None, None) => Ok(DiffResult::default()),
    }
}

/// Target with fields ignored by `RespectIgnoreDifferences` taken from live
pub fn respect_ignore_differences(
    target: &DynamicObject,
    live: &DynamicObject,
    config: &DiffConfig,
) -> Result<DynamicObject> {
    let target_value = to_value(target)?;
    let live_value = to_value(live)?;
    let mut merged = target_value.clone();
    for rule in config.rules_for(&target_value) {
        rule.validate()?;
        for pointer in &rule.pointers {
            match live_value.pointer(pointer) {
                Some(v) => set_pointer(&mut merged, pointer, v.clone()),
                None => remove_pointer(&mut merged, pointer),
            }
        }
    }
    crate::resource::from_value(merged)
}

fn set_pointer(value: &mut Value, pointer: &str, new: Value) {
    let path: Vec<String> = pointer.split('/').skip(1).map(unescape).collect();
    let Some((last, parents)) = path.split_last() else {
        return;
    };
    let mut current = value;
    for segment in parents {
        if !current.is_object() {
            return;
        }
        current = match current.as_object_mut() {
            Some(map) => map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new())),
            None => return,
        };
    }
    if let Some(map) = current.as_object_mut() {
        map.insert(last.clone(), new);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::from_value;
    use serde_json::json;

    fn deployment(replicas: i64, extra: Value) -> DynamicObject {
        let mut value = json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "replicas": replicas,
                "template": {"spec": {"containers": [{"name": "web", "image": "nginx:1.25"}]}}
            }
        });
        apply_predicted(&mut value, &extra);
        from_value(value).unwrap()
    }

    #[test]
    fn test_server_defaults_are_not_drift() {
        let target = deployment(2, json!({}));
        let live = deployment(
            2,
            json!({
                "metadata": {"uid": "1", "resourceVersion": "9", "generation": 3},
                "spec": {
                    "progressDeadlineSeconds": 600,
                    "template": {"spec": {"containers": [{"name": "web", "imagePullPolicy": "IfNotPresent"}]}}
                },
                "status": {"replicas": 2}
            }),
        );
        let res = diff(Some(&target), Some(&live), None, &DiffConfig::default()).unwrap();
        assert!(!res.modified);
    }

    #[test]
    fn test_changed_field_is_drift() {
        let target = deployment(3, json!({}));
        let live = deployment(2, json!({}));
        let res = diff(Some(&target), Some(&live), None, &DiffConfig::default()).unwrap();
        assert!(res.modified);
        assert_eq!(res.predicted_live.pointer("/spec/replicas"), Some(&json!(3)));
    }

    #[test]
    fn test_field_removed_since_last_apply_is_drift() {
        let target = deployment(2, json!({}));
        let last = deployment(2, json!({"metadata": {"labels": {"tier": "frontend"}}}));
        let last_raw = serde_json::to_string(&last).unwrap();
        let live = deployment(
            2,
            json!({"metadata": {
                "labels": {"tier": "frontend"},
                "annotations": {ANNOTATION_LAST_APPLIED: last_raw}
            }}),
        );
        let res = diff(Some(&target), Some(&live), None, &DiffConfig::default()).unwrap();
        assert!(res.modified);
    }

    #[test]
    fn test_ignore_differences_pointer() {
        let target = deployment(3, json!({}));
        let live = deployment(5, json!({}));
        let rules = vec![ResourceIgnoreDifferences {
            group: "apps".to_string(),
            kind: "Deployment".to_string(),
            json_pointers: vec!["/spec/replicas".to_string()],
            ..Default::default()
        }];
        let config = DiffConfig::new(&rules, &Settings::default());
        let res = diff(Some(&target), Some(&live), None, &config).unwrap();
        assert!(!res.modified);
    }

    #[test]
    fn test_invalid_pointer_fails_only_matching_resource() {
        let rules = vec![ResourceIgnoreDifferences {
            group: "apps".to_string(),
            kind: "Deployment".to_string(),
            json_pointers: vec!["spec.replicas".to_string()],
            ..Default::default()
        }];
        let config = DiffConfig::new(&rules, &Settings::default());
        let target = deployment(3, json!({}));
        assert!(diff(Some(&target), Some(&target.clone()), None, &config).is_err());

        let cm: DynamicObject = from_value(json!({
            "apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": "a"}
        }))
        .unwrap();
        assert!(diff(Some(&cm), Some(&cm.clone()), None, &config).is_ok());
    }

    #[test]
    fn test_managed_fields_manager_rule() {
        let target = deployment(3, json!({}));
        let live = deployment(
            7,
            json!({"metadata": {"managedFields": [{
                "manager": "kube-controller-manager",
                "fieldsV1": {"f:spec": {"f:replicas": {}}}
            }]}}),
        );
        let rules = vec![ResourceIgnoreDifferences {
            group: "apps".to_string(),
            kind: "Deployment".to_string(),
            managed_fields_managers: vec!["kube-controller-manager".to_string()],
            ..Default::default()
        }];
        let config = DiffConfig::new(&rules, &Settings::default());
        assert!(!diff(Some(&target), Some(&live), None, &config).unwrap().modified);
    }

    #[test]
    fn test_aggregated_cluster_role_rules_ignored() {
        let target: DynamicObject = from_value(json!({
            "apiVersion": "rbac.authorization.k8s.io/v1",
            "kind": "ClusterRole",
            "metadata": {"name": "view-all"},
            "aggregationRule": {"clusterRoleSelectors": [{"matchLabels": {"agg": "true"}}]},
            "rules": []
        }))
        .unwrap();
        let mut live = target.clone();
        live.data["rules"] = json!([{"apiGroups": [""], "resources": ["pods"], "verbs": ["get"]}]);
        let config = DiffConfig::new(&[], &Settings::default());
        assert!(!diff(Some(&target), Some(&live), None, &config).unwrap().modified);
    }

    #[test]
    fn test_missing_sides_are_modified() {
        let target = deployment(1, json!({}));
        assert!(diff(Some(&target), None, None, &DiffConfig::default()).unwrap().modified);
        assert!(diff(None, Some(&target), None, &DiffConfig::default()).unwrap().modified);
    }

    #[test]
    fn test_merge_patch_nulls_removed_fields() {
        let patch = merge_patch(
            Some(&json!({"a": 1, "b": {"c": 1, "d": 2}})),
            &json!({"b": {"c": 1}}),
        );
        assert_eq!(patch, json!({"a": null, "b": {"c": 1, "d": null}}));
    }

    #[test]
    fn test_create_merge_patch_is_minimal() {
        let old = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        let new = json!({"b": {"c": 2, "d": 4}, "e": [1], "f": "x"});
        let patch = create_merge_patch(&old, &new).unwrap();
        assert_eq!(patch, json!({"a": null, "b": {"d": 4}, "e": [1], "f": "x"}));

        let mut applied = old.clone();
        json_patch::merge(&mut applied, &patch);
        assert_eq!(applied, new);
        assert_eq!(create_merge_patch(&new, &new), None);
    }

    #[test]
    fn test_apply_patch_restores_drifted_fields() {
        let last = json!({"spec": {"replicas": 2, "paused": true}});
        let target = json!({"spec": {"replicas": 2}});
        let mut live = json!({"spec": {"replicas": 7, "paused": true, "minReadySeconds": 5}});
        json_patch::merge(&mut live, &merge_patch(Some(&last), &target));
        assert_eq!(live, json!({"spec": {"replicas": 2, "minReadySeconds": 5}}));
    }

    #[test]
    fn test_respect_ignore_differences_keeps_live_value() {
        let target = deployment(3, json!({}));
        let live = deployment(9, json!({}));
        let rules = vec![ResourceIgnoreDifferences {
            group: "apps".to_string(),
            kind: "Deployment".to_string(),
            json_pointers: vec!["/spec/replicas".to_string()],
            ..Default::default()
        }];
        let config = DiffConfig::new(&rules, &Settings::default());
        let merged = respect_ignore_differences(&target, &live, &config).unwrap();
        assert_eq!(merged.data.pointer("/spec/replicas"), Some(&json!(9)));
    }
}
