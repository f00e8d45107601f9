//! Resource tree of an application and the per-application state cache
//!
//! The tree and the managed resource diffs are stored separately so that a
//! topology-only refresh can rebuild the tree without diffing again.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use serde_json::Value;
use tracing::debug;

use super::cache::{LiveStateCache, ResourceNode};
use super::conditions::CONDITION_ORPHANED_RESOURCE_WARNING;
use crate::crd::{AppProjectSpec, ApplicationCondition};
use crate::error::Result;
use crate::resource::ResourceKey;

/// Diff of one managed resource as kept between refreshes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResourceDiff {
    pub key: ResourceKey,
    pub version: String,
    pub hook: bool,
    pub modified: bool,
    pub target_state: Option<Value>,
    pub live_state: Option<Value>,
    pub normalized_live: Value,
    pub predicted_live: Value,
    pub resource_version: String,
}

/// Live resources reachable from the managed roots, plus orphans
#[derive(Clone, Debug, Default)]
pub struct ApplicationTree {
    pub nodes: Vec<ResourceNode>,
    pub orphaned_nodes: Vec<ResourceNode>,
}

impl ApplicationTree {
    /// Sort nodes so that equal trees compare equal
    pub fn normalize(&mut self) {
        self.nodes.sort_by(|a, b| a.key.cmp(&b.key));
        self.orphaned_nodes.sort_by(|a, b| a.key.cmp(&b.key));
    }

    pub fn keys(&self) -> Vec<ResourceKey> {
        self.nodes.iter().map(|n| n.key.clone()).collect()
    }

    /// Container images used anywhere in the tree
    pub fn images(&self) -> Vec<String> {
        let mut images: Vec<String> = self
            .nodes
            .iter()
            .flat_map(|n| n.images.iter().cloned())
            .collect();
        images.sort();
        images.dedup();
        images
    }
}

/// Objects created by Kubernetes itself in every namespace
pub fn is_known_orphan_exclusion(key: &ResourceKey) -> bool {
    if !key.group.is_empty() {
        return false;
    }
    match key.kind.as_str() {
        "Service" => key.name == "kubernetes" && key.namespace == "default",
        "ServiceAccount" => key.name == "default",
        "ConfigMap" => key.name == "kube-root-ca.crt",
        _ => false,
    }
}

/// Build the tree below `managed` and collect orphans of the destination
/// namespace when the project monitors them.
///
/// The walk stops at resources tracked by another application and at kinds
/// the project does not permit.
pub async fn build_app_tree(
    live: &LiveStateCache,
    server: &str,
    instance_name: &str,
    destination_namespace: &str,
    managed: &[ResourceKey],
    project: &AppProjectSpec,
) -> Result<(ApplicationTree, Vec<ApplicationCondition>)> {
    let roots: HashSet<ResourceKey> = managed.iter().cloned().collect();
    let mut tree = ApplicationTree::default();

    live.iterate_hierarchy_v2(server, managed, |node| {
        let permitted = project.is_group_kind_permitted(
            &node.key.group,
            &node.key.kind,
            !node.key.namespace.is_empty(),
        );
        let foreign = node
            .app_name
            .as_deref()
            .map(|app| app != instance_name)
            .unwrap_or(false);
        if !permitted || (foreign && !roots.contains(&node.key)) {
            return false;
        }
        tree.nodes.push(node.clone());
        true
    })
    .await?;

    let mut conditions = Vec::new();
    if let Some(monitor) = &project.orphaned_resources {
        if !destination_namespace.is_empty() {
            let seen: HashSet<ResourceKey> = tree.keys().into_iter().collect();
            let candidates = live
                .get_namespace_top_level_resources(server, destination_namespace)
                .await?;
            for node in candidates {
                if node.app_name.is_some()
                    || seen.contains(&node.key)
                    || is_known_orphan_exclusion(&node.key)
                    || project.is_orphan_ignored(&node.key.group, &node.key.kind, &node.key.name)
                {
                    continue;
                }
                tree.orphaned_nodes.push(node);
            }
            if monitor.is_warn() && !tree.orphaned_nodes.is_empty() {
                conditions.push(ApplicationCondition::new(
                    CONDITION_ORPHANED_RESOURCE_WARNING,
                    format!(
                        "Application has {} orphaned resources",
                        tree.orphaned_nodes.len()
                    ),
                ));
            }
        }
    }

    tree.normalize();
    debug!(
        nodes = tree.nodes.len(),
        orphans = tree.orphaned_nodes.len(),
        "Built application tree"
    );
    Ok((tree, conditions))
}

#[derive(Clone, Debug, Default)]
struct Entry {
    tree: Option<ApplicationTree>,
    managed_resources: Option<Vec<ResourceDiff>>,
}

/// Last computed tree and diffs per application, keyed by qualified name
#[derive(Default)]
pub struct AppStateCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl AppStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<F: FnOnce(&mut Entry)>(&self, app: &str, f: F) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        f(entries.entry(app.to_string()).or_default());
    }

    fn entry(&self, app: &str) -> Option<Entry> {
        self.entries
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(app)
            .cloned()
    }

    pub fn set_tree(&self, app: &str, tree: ApplicationTree) {
        self.update(app, |e| e.tree = Some(tree));
    }

    pub fn tree(&self, app: &str) -> Option<ApplicationTree> {
        self.entry(app).and_then(|e| e.tree)
    }

    pub fn set_managed_resources(&self, app: &str, diffs: Vec<ResourceDiff>) {
        self.update(app, |e| e.managed_resources = Some(diffs));
    }

    pub fn managed_resources(&self, app: &str) -> Option<Vec<ResourceDiff>> {
        self.entry(app).and_then(|e| e.managed_resources)
    }

    pub fn remove(&self, app: &str) {
        self.entries
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(app);
    }
}
