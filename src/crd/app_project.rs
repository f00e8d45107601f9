//! AppProject Custom Resource Definition
//!
//! Projects group applications and restrict where and what they may deploy.

use glob::Pattern;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    ApplicationDestination, ApplicationDestinationServiceAccount,
    OrphanedResourcesMonitorSettings, ProjectGroupKind, SyncWindow,
};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "driftwatch.io",
    version = "v1alpha1",
    kind = "AppProject",
    namespaced,
    shortname = "proj",
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct AppProjectSpec {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub source_repos: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destinations: Vec<ApplicationDestination>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Cluster scoped kinds applications may deploy. Empty denies all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_resource_whitelist: Vec<ProjectGroupKind>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cluster_resource_blacklist: Vec<ProjectGroupKind>,

    /// Namespaced kinds applications may deploy. Empty allows all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_resource_whitelist: Vec<ProjectGroupKind>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespace_resource_blacklist: Vec<ProjectGroupKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphaned_resources: Option<OrphanedResourcesMonitorSettings>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sync_windows: Vec<SyncWindow>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub destination_service_accounts: Vec<ApplicationDestinationServiceAccount>,
}

fn glob_match(pattern: &str, value: &str) -> bool {
    if pattern == value || pattern == "*" {
        return true;
    }
    Pattern::new(pattern)
        .map(|p| p.matches(value))
        .unwrap_or(false)
}

fn group_kind_matches(entry: &ProjectGroupKind, group: &str, kind: &str) -> bool {
    glob_match(&entry.group, group) && glob_match(&entry.kind, kind)
}

impl AppProjectSpec {
    /// Whether resources of the given kind may be deployed by the project
    pub fn is_group_kind_permitted(&self, group: &str, kind: &str, namespaced: bool) -> bool {
        if namespaced {
            let allowed = self.namespace_resource_whitelist.is_empty()
                || self
                    .namespace_resource_whitelist
                    .iter()
                    .any(|e| group_kind_matches(e, group, kind));
            let denied = self
                .namespace_resource_blacklist
                .iter()
                .any(|e| group_kind_matches(e, group, kind));
            allowed && !denied
        } else {
            let allowed = self
                .cluster_resource_whitelist
                .iter()
                .any(|e| group_kind_matches(e, group, kind));
            let denied = self
                .cluster_resource_blacklist
                .iter()
                .any(|e| group_kind_matches(e, group, kind));
            allowed && !denied
        }
    }

    /// Whether the project allows deploying into the destination.
    ///
    /// `server` must already be resolved from the destination name.
    pub fn is_destination_permitted(&self, server: &str, cluster_name: &str, namespace: &str) -> bool {
        let mut allowed = false;
        for dest in &self.destinations {
            let server_pattern = dest.server.as_deref().unwrap_or("");
            let name_pattern = dest.name.as_deref().unwrap_or("");
            let ns_pattern = dest.namespace.as_deref().unwrap_or("");

            let (server_pattern, server_negated) = strip_negation(server_pattern);
            let (name_pattern, name_negated) = strip_negation(name_pattern);
            let (ns_pattern, ns_negated) = strip_negation(ns_pattern);

            let cluster_match = (!server_pattern.is_empty() && glob_match(server_pattern, server))
                || (!name_pattern.is_empty() && glob_match(name_pattern, cluster_name));
            let matched = cluster_match && glob_match(ns_pattern, namespace);

            // a negated entry that matches denies regardless of order
            if server_negated || name_negated || ns_negated {
                if matched {
                    return false;
                }
            } else if matched {
                allowed = true;
            }
        }
        allowed
    }

    /// Whether applications may use the repository URL
    pub fn is_source_permitted(&self, repo_url: &str) -> bool {
        let normalized = normalize_repo(repo_url);
        let mut allowed = false;
        for pattern in &self.source_repos {
            let (pattern, negated) = strip_negation(pattern);
            let matched = glob_match(&normalize_repo(pattern), &normalized);
            if negated && matched {
                return false;
            }
            if !negated && matched {
                allowed = true;
            }
        }
        allowed
    }

    /// Whether a live object of the given kind may be reported as orphaned
    pub fn is_orphan_ignored(&self, group: &str, kind: &str, name: &str) -> bool {
        self.orphaned_resources
            .as_ref()
            .map(|o| {
                o.ignore.iter().any(|i| {
                    glob_match(if i.group.is_empty() { "*" } else { &i.group }, group)
                        && glob_match(if i.kind.is_empty() { "*" } else { &i.kind }, kind)
                        && glob_match(if i.name.is_empty() { "*" } else { &i.name }, name)
                })
            })
            .unwrap_or(false)
    }

    /// Service account to impersonate for the destination, if configured
    pub fn destination_service_account(&self, server: &str, namespace: &str) -> Option<String> {
        self.destination_service_accounts
            .iter()
            .find(|sa| {
                glob_match(&sa.server, server)
                    && glob_match(sa.namespace.as_deref().unwrap_or("*"), namespace)
            })
            .map(|sa| {
                if sa.default_service_account.contains(':') {
                    sa.default_service_account.clone()
                } else {
                    format!(
                        "system:serviceaccount:{}:{}",
                        namespace, sa.default_service_account
                    )
                }
            })
    }
}

fn strip_negation(pattern: &str) -> (&str, bool) {
    match pattern.strip_prefix('!') {
        Some(rest) => (rest, true),
        None => (pattern, false),
    }
}

fn normalize_repo(url: &str) -> String {
    url.trim_end_matches('/')
        .trim_end_matches(".git")
        .to_lowercase()
}
