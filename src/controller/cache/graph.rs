//! Arena of cached resources with owner edges stored as key lists

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};
use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::clients::Settings;
use crate::controller::health::resource_health;
use crate::crd::{HealthStatus, Info};
use crate::resource::{
    group_version, images_of, is_crd, kind_of, split_api_version, ResourceKey,
};

/// Metadata fields that change without the object changing meaningfully
const VOLATILE_METADATA: &[&str] = &["resourceVersion", "managedFields", "generation"];

/// Owner reference of a cached node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerRef {
    pub group: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
}

/// A cached resource
#[derive(Clone, Debug)]
pub struct ResourceNode {
    pub key: ResourceKey,
    pub version: String,
    pub uid: String,
    pub resource_version: String,
    pub owner_refs: Vec<OwnerRef>,
    pub info: Vec<Info>,
    pub images: Vec<String>,
    pub health: Option<HealthStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub manifest_hash: String,
    /// Instance name from the tracking metadata
    pub app_name: Option<String>,
    /// Full body, kept for application roots and CRDs only
    pub resource: Option<DynamicObject>,
    pub parents: Vec<ResourceKey>,
    pub children: Vec<ResourceKey>,
}

impl ResourceNode {
    pub fn from_object(obj: &DynamicObject, settings: &Settings) -> Self {
        let (_, version) = group_version(obj);
        let tracking = settings.tracking();
        let app_name = tracking
            .app_name(obj)
            .filter(|_| tracking.is_self_referenced(obj));
        let owner_refs: Vec<OwnerRef> = obj
            .owner_references()
            .iter()
            .map(|r| OwnerRef {
                group: split_api_version(&r.api_version).0,
                kind: r.kind.clone(),
                name: r.name.clone(),
                uid: r.uid.clone(),
            })
            .collect();
        let keep_body = is_crd(obj) || (app_name.is_some() && owner_refs.is_empty());

        Self {
            key: ResourceKey::from_object(obj),
            version,
            uid: obj.uid().unwrap_or_default(),
            resource_version: obj.resource_version().unwrap_or_default(),
            info: info_of(obj),
            images: images_of(obj),
            health: resource_health(obj, settings),
            created_at: obj.metadata.creation_timestamp.as_ref().map(|t| t.0),
            manifest_hash: manifest_hash(obj, settings),
            app_name,
            resource: keep_body.then(|| obj.clone()),
            owner_refs,
            parents: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Nodes without owners that are tracked to an application
    pub fn is_app_root(&self) -> bool {
        self.app_name.is_some() && self.owner_refs.is_empty()
    }

    fn owned_by(&self, owner: &ResourceNode) -> bool {
        self.key.namespace == owner.key.namespace || owner.key.namespace.is_empty()
    }

    fn references(&self, owner: &ResourceNode) -> bool {
        self.owned_by(owner)
            && self.owner_refs.iter().any(|r| {
                if !r.uid.is_empty() && !owner.uid.is_empty() {
                    r.uid == owner.uid
                } else {
                    r.kind == owner.key.kind && r.group == owner.key.group && r.name == owner.key.name
                }
            })
    }
}

/// Hash of the object without status and volatile metadata.
///
/// Fields listed under `ignoreResourceUpdates` for the kind are removed too.
pub fn manifest_hash(obj: &DynamicObject, settings: &Settings) -> String {
    let mut value = serde_json::to_value(obj).unwrap_or(Value::Null);
    if let Some(map) = value.as_object_mut() {
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            for field in VOLATILE_METADATA {
                meta.remove(*field);
            }
        }
    }
    let (group, _) = group_version(obj);
    if let Some(ov) = settings.override_for(&group, &kind_of(obj)) {
        for pointer in &ov.ignore_resource_updates {
            crate::controller::diff::remove_pointer(&mut value, pointer);
        }
    }
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

fn info_of(obj: &DynamicObject) -> Vec<Info> {
    let mut info = Vec::new();
    let mut push = |name: &str, value: Option<&str>| {
        if let Some(value) = value.filter(|v| !v.is_empty()) {
            info.push(Info {
                name: name.to_string(),
                value: value.to_string(),
            });
        }
    };
    match kind_of(obj).as_str() {
        "Pod" => {
            push("Status Reason", obj.data.pointer("/status/reason").and_then(Value::as_str));
            push("Phase", obj.data.pointer("/status/phase").and_then(Value::as_str));
        }
        "Service" => push("Type", obj.data.pointer("/spec/type").and_then(Value::as_str)),
        "Ingress" => push(
            "Host",
            obj.data.pointer("/spec/rules/0/host").and_then(Value::as_str),
        ),
        _ => {}
    }
    info
}

/// Resource graph of one cluster
#[derive(Default)]
pub struct ResourceGraph {
    nodes: HashMap<ResourceKey, ResourceNode>,
}

impl ResourceGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, key: &ResourceKey) -> Option<ResourceNode> {
        self.nodes.get(key).cloned()
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &ResourceNode> {
        self.nodes.values()
    }

    /// Insert or replace a node and relink its edges. Returns the previous node.
    pub fn upsert(&mut self, mut node: ResourceNode) -> Option<ResourceNode> {
        let old = self.unlink(&node.key);

        node.parents = self
            .nodes
            .values()
            .filter(|owner| node.references(owner))
            .map(|owner| owner.key.clone())
            .collect();
        node.children = self
            .nodes
            .values()
            .filter(|child| child.references(&node))
            .map(|child| child.key.clone())
            .collect();

        for parent in &node.parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.push(node.key.clone());
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parents.push(node.key.clone());
            }
        }
        self.nodes.insert(node.key.clone(), node);
        old
    }

    /// Remove a node and unlink it from parents and children
    pub fn remove(&mut self, key: &ResourceKey) -> Option<ResourceNode> {
        self.unlink(key)
    }

    fn unlink(&mut self, key: &ResourceKey) -> Option<ResourceNode> {
        let node = self.nodes.remove(key)?;
        for parent in &node.parents {
            if let Some(p) = self.nodes.get_mut(parent) {
                p.children.retain(|k| k != key);
            }
        }
        for child in &node.children {
            if let Some(c) = self.nodes.get_mut(child) {
                c.parents.retain(|k| k != key);
            }
        }
        Some(node)
    }

    /// Application instance a node belongs to, walking up owner edges
    pub fn app_of(&self, key: &ResourceKey) -> Option<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![key.clone()];
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let Some(node) = self.nodes.get(&current) else {
                continue;
            };
            if let Some(app) = &node.app_name {
                return Some(app.clone());
            }
            stack.extend(node.parents.iter().cloned());
        }
        None
    }

    /// Nodes of a namespace without owners
    pub fn namespace_top_level(&self, namespace: &str) -> Vec<ResourceNode> {
        self.nodes
            .values()
            .filter(|n| n.key.namespace == namespace && n.owner_refs.is_empty())
            .cloned()
            .collect()
    }

    /// Depth-first walk over child edges starting at `keys`.
    ///
    /// Keys are visited per namespace. `f` returning false prunes the
    /// branch below the node. Ownership cycles are reported and skipped.
    pub fn iterate_hierarchy_v2<F>(&self, keys: &[ResourceKey], mut f: F)
    where
        F: FnMut(&ResourceNode) -> bool,
    {
        let mut by_namespace: BTreeMap<&str, Vec<&ResourceKey>> = BTreeMap::new();
        for key in keys {
            by_namespace.entry(key.namespace.as_str()).or_default().push(key);
        }

        let mut done: HashSet<ResourceKey> = HashSet::new();
        for (_, keys) in by_namespace {
            for key in keys {
                let mut in_progress = HashSet::new();
                self.visit(key, &mut in_progress, &mut done, &mut f);
            }
        }
    }

    fn visit<F>(
        &self,
        key: &ResourceKey,
        in_progress: &mut HashSet<ResourceKey>,
        done: &mut HashSet<ResourceKey>,
        f: &mut F,
    ) where
        F: FnMut(&ResourceNode) -> bool,
    {
        if done.contains(key) {
            return;
        }
        if in_progress.contains(key) {
            warn!("Circular ownership detected at {}", key);
            return;
        }
        let Some(node) = self.nodes.get(key) else {
            return;
        };
        in_progress.insert(key.clone());
        if f(node) {
            for child in &node.children {
                self.visit(child, in_progress, done, f);
            }
        }
        in_progress.remove(key);
        done.insert(key.clone());
    }

    /// Replace all nodes of a kind, optionally limited to one namespace.
    ///
    /// Returns the keys whose manifest hash changed, appeared or vanished.
    pub fn replace_kind(
        &mut self,
        group: &str,
        kind: &str,
        namespace: Option<&str>,
        nodes: Vec<ResourceNode>,
    ) -> Vec<ResourceKey> {
        let in_scope = |k: &ResourceKey| {
            k.group == group && k.kind == kind && namespace.map(|ns| k.namespace == ns).unwrap_or(true)
        };
        let fresh: HashSet<ResourceKey> = nodes.iter().map(|n| n.key.clone()).collect();
        let stale: Vec<ResourceKey> = self
            .nodes
            .keys()
            .filter(|k| in_scope(k) && !fresh.contains(*k))
            .cloned()
            .collect();

        let mut changed = Vec::new();
        for key in stale {
            self.remove(&key);
            changed.push(key);
        }
        for node in nodes {
            let key = node.key.clone();
            let hash = node.manifest_hash.clone();
            match self.upsert(node) {
                Some(old) if old.manifest_hash == hash => {}
                _ => changed.push(key),
            }
        }
        changed
    }
}
