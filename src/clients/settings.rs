//! Controller settings loaded from the `driftwatch-cm` ConfigMap

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::crd::HealthStatusCode;
use crate::error::{Error, Result};
use crate::resource::tracking::{ResourceTracking, TrackingMethod, DEFAULT_INSTANCE_LABEL};
use crate::resource::GroupKind;

pub const SETTINGS_CONFIG_MAP: &str = "driftwatch-cm";

/// Maps a status condition of a resource onto a health status
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckRule {
    /// Condition type looked up in `status.conditions`
    pub condition: String,
    /// Condition status that triggers the rule
    pub status: String,
    pub health: HealthStatusCode,
    #[serde(default)]
    pub message: Option<String>,
}

/// Per kind customisation of health and diffing
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverride {
    /// Rules evaluated in order, the first match wins
    #[serde(default)]
    pub health: Vec<HealthCheckRule>,

    /// Health when no rule matches
    #[serde(default)]
    pub default_health: Option<HealthStatusCode>,

    #[serde(default)]
    pub ignore_differences: Vec<String>,

    /// JSON pointers ignored when deciding whether a watch event matters
    #[serde(default)]
    pub ignore_resource_updates: Vec<String>,
}

/// Kinds excluded from watching and syncing
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FilteredResource {
    #[serde(default)]
    pub api_groups: Vec<String>,
    #[serde(default)]
    pub kinds: Vec<String>,
    #[serde(default)]
    pub clusters: Vec<String>,
}

fn list_matches(patterns: &[String], value: &str) -> bool {
    patterns.is_empty()
        || patterns.iter().any(|p| {
            p == value
                || glob::Pattern::new(p)
                    .map(|g| g.matches(value))
                    .unwrap_or(false)
        })
}

impl FilteredResource {
    pub fn matches(&self, group: &str, kind: &str, cluster: &str) -> bool {
        list_matches(&self.api_groups, group)
            && list_matches(&self.kinds, kind)
            && list_matches(&self.clusters, cluster)
    }
}

/// Runtime settings of the controller
#[derive(Clone, Debug)]
pub struct Settings {
    pub resource_overrides: HashMap<GroupKind, ResourceOverride>,
    pub tracking_method: TrackingMethod,
    pub instance_label_key: String,
    pub installation_id: Option<String>,
    pub resource_exclusions: Vec<FilteredResource>,
    pub resource_inclusions: Vec<FilteredResource>,
    pub ignore_resource_updates_enabled: bool,
    pub impersonation_enabled: bool,
    pub server_side_diff: bool,
    pub ignore_aggregated_roles: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            resource_overrides: HashMap::new(),
            tracking_method: TrackingMethod::default(),
            instance_label_key: DEFAULT_INSTANCE_LABEL.to_string(),
            installation_id: None,
            resource_exclusions: default_exclusions(),
            resource_inclusions: Vec::new(),
            ignore_resource_updates_enabled: true,
            impersonation_enabled: false,
            server_side_diff: false,
            ignore_aggregated_roles: true,
        }
    }
}

/// High churn kinds that are never worth watching
fn default_exclusions() -> Vec<FilteredResource> {
    let exclude = |group: &str, kinds: &[&str]| FilteredResource {
        api_groups: vec![group.to_string()],
        kinds: kinds.iter().map(|k| k.to_string()).collect(),
        clusters: Vec::new(),
    };
    vec![
        exclude("", &["Event"]),
        exclude("events.k8s.io", &["Event"]),
        exclude("metrics.k8s.io", &["*"]),
        exclude("coordination.k8s.io", &["Lease"]),
        exclude("authentication.k8s.io", &["*"]),
        exclude("authorization.k8s.io", &["*"]),
        exclude("certificates.k8s.io", &["CertificateSigningRequest"]),
    ]
}

impl Settings {
    pub fn tracking(&self) -> ResourceTracking {
        ResourceTracking {
            method: self.tracking_method,
            label_key: self.instance_label_key.clone(),
            installation_id: self.installation_id.clone(),
        }
    }

    pub fn is_excluded(&self, group: &str, kind: &str, cluster: &str) -> bool {
        if self
            .resource_exclusions
            .iter()
            .any(|f| f.matches(group, kind, cluster))
        {
            return true;
        }
        !self.resource_inclusions.is_empty()
            && !self
                .resource_inclusions
                .iter()
                .any(|f| f.matches(group, kind, cluster))
    }

    pub fn override_for(&self, group: &str, kind: &str) -> Option<&ResourceOverride> {
        self.resource_overrides.get(&GroupKind::new(group, kind))
    }

    /// Parse settings from ConfigMap data
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let mut settings = Settings::default();

        if let Some(raw) = data.get("resource.customizations") {
            let parsed: BTreeMap<String, ResourceOverride> = serde_yaml::from_str(raw)?;
            for (key, value) in parsed {
                // keys are `group/Kind`, or `Kind` for the core group
                let gk = match key.rsplit_once('/') {
                    Some((group, kind)) => GroupKind::new(group, kind),
                    None => GroupKind::new("", &key),
                };
                settings.resource_overrides.insert(gk, value);
            }
        }
        if let Some(method) = data.get("application.resourceTrackingMethod") {
            settings.tracking_method = method.parse()?;
        }
        if let Some(key) = data.get("application.instanceLabelKey") {
            if !key.is_empty() {
                settings.instance_label_key = key.clone();
            }
        }
        if let Some(id) = data.get("installationID") {
            if !id.is_empty() {
                settings.installation_id = Some(id.clone());
            }
        }
        if let Some(raw) = data.get("resource.exclusions") {
            let mut extra: Vec<FilteredResource> = serde_yaml::from_str(raw)?;
            settings.resource_exclusions.append(&mut extra);
        }
        if let Some(raw) = data.get("resource.inclusions") {
            settings.resource_inclusions = serde_yaml::from_str(raw)?;
        }
        settings.ignore_resource_updates_enabled =
            parse_bool(data, "resource.ignoreResourceUpdatesEnabled", true)?;
        settings.impersonation_enabled =
            parse_bool(data, "application.sync.impersonation.enabled", false)?;
        settings.server_side_diff = parse_bool(data, "controller.diff.server.side", false)?;
        settings.ignore_aggregated_roles =
            parse_bool(data, "resource.compareoptions.ignoreAggregatedRoles", true)?;

        Ok(settings)
    }

    /// Load settings from a ConfigMap manifest on disk
    pub fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read {}: {}", path.display(), e)))?;
        let cm: ConfigMap = serde_yaml::from_str(&raw)?;
        Settings::from_data(&cm.data.unwrap_or_default())
    }
}

fn parse_bool(data: &BTreeMap<String, String>, key: &str, default: bool) -> Result<bool> {
    match data.get(key).map(|v| v.trim()) {
        None | Some("") => Ok(default),
        Some(v) => v
            .parse()
            .map_err(|_| Error::ConfigError(format!("{} must be true or false, got '{}'", key, v))),
    }
}

/// Source of controller settings
#[async_trait]
pub trait SettingsProvider: Send + Sync {
    async fn settings(&self) -> Result<Arc<Settings>>;
}

/// Settings fixed at construction
pub struct StaticSettingsProvider {
    settings: Arc<Settings>,
}

impl StaticSettingsProvider {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
        }
    }
}

#[async_trait]
impl SettingsProvider for StaticSettingsProvider {
    async fn settings(&self) -> Result<Arc<Settings>> {
        Ok(self.settings.clone())
    }
}

/// Settings read from the ConfigMap, cached until `reload` is called
pub struct ConfigMapSettingsProvider {
    api: Api<ConfigMap>,
    current: RwLock<Option<Arc<Settings>>>,
}

impl ConfigMapSettingsProvider {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            current: RwLock::new(None),
        }
    }

    /// Re-read the ConfigMap. Returns true when the settings changed.
    pub async fn reload(&self) -> Result<bool> {
        let data = match self.api.get_opt(SETTINGS_CONFIG_MAP).await? {
            Some(cm) => cm.data.unwrap_or_default(),
            None => {
                debug!("ConfigMap {} not found, using defaults", SETTINGS_CONFIG_MAP);
                BTreeMap::new()
            }
        };
        let parsed = Settings::from_data(&data)?;
        let mut current = self.current.write().await;
        let changed = current
            .as_ref()
            .map(|c| !same_settings(c, &parsed))
            .unwrap_or(true);
        *current = Some(Arc::new(parsed));
        Ok(changed)
    }
}

fn same_settings(a: &Settings, b: &Settings) -> bool {
    a.resource_overrides == b.resource_overrides
        && a.tracking_method == b.tracking_method
        && a.instance_label_key == b.instance_label_key
        && a.installation_id == b.installation_id
        && a.resource_exclusions == b.resource_exclusions
        && a.resource_inclusions == b.resource_inclusions
        && a.ignore_resource_updates_enabled == b.ignore_resource_updates_enabled
        && a.impersonation_enabled == b.impersonation_enabled
        && a.server_side_diff == b.server_side_diff
        && a.ignore_aggregated_roles == b.ignore_aggregated_roles
}

#[async_trait]
impl SettingsProvider for ConfigMapSettingsProvider {
    async fn settings(&self) -> Result<Arc<Settings>> {
        if let Some(current) = self.current.read().await.as_ref() {
            return Ok(current.clone());
        }
        if let Err(e) = self.reload().await {
            warn!("Failed to load settings, using defaults: {}", e);
            return Ok(Arc::new(Settings::default()));
        }
        Ok(self
            .current
            .read()
            .await
            .clone()
            .unwrap_or_else(|| Arc::new(Settings::default())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_exclude_events() {
        let settings = Settings::default();
        assert!(settings.is_excluded("", "Event", "https://kubernetes.default.svc"));
        assert!(!settings.is_excluded("apps", "Deployment", "https://kubernetes.default.svc"));
    }

    #[test]
    fn test_parse_customizations() {
        let mut data = BTreeMap::new();
        data.insert(
            "resource.customizations".to_string(),
            r#"
example.com/Widget:
  health:
  - condition: Ready
    status: "True"
    health: Healthy
  - condition: Ready
    status: "False"
    health: Degraded
  defaultHealth: Progressing
"#
            .to_string(),
        );
        data.insert(
            "application.resourceTrackingMethod".to_string(),
            "label".to_string(),
        );
        let settings = Settings::from_data(&data).unwrap();
        let o = settings.override_for("example.com", "Widget").unwrap();
        assert_eq!(o.health.len(), 2);
        assert_eq!(o.default_health, Some(HealthStatusCode::Progressing));
        assert_eq!(settings.tracking_method, TrackingMethod::Label);
    }

    #[test]
    fn test_invalid_bool_is_config_error() {
        let mut data = BTreeMap::new();
        data.insert("controller.diff.server.side".to_string(), "yes".to_string());
        assert!(matches!(
            Settings::from_data(&data),
            Err(Error::ConfigError(_))
        ));
    }

    #[test]
    fn test_inclusions_restrict_kinds() {
        let mut data = BTreeMap::new();
        data.insert(
            "resource.inclusions".to_string(),
            "- apiGroups: [\"apps\"]\n  kinds: [\"*\"]\n".to_string(),
        );
        let settings = Settings::from_data(&data).unwrap();
        assert!(!settings.is_excluded("apps", "Deployment", "c"));
        assert!(settings.is_excluded("", "ConfigMap", "c"));
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: driftwatch-cm\ndata:\n  installationID: prod\n"
        )
        .unwrap();
        let settings = Settings::load_file(file.path()).unwrap();
        assert_eq!(settings.installation_id.as_deref(), Some("prod"));
    }
}
