//! Well-known annotations and their parsing

use kube::api::DynamicObject;
use kube::ResourceExt;

use crate::crd::{HookDeletePolicy, HookType};

pub const ANNOTATION_SYNC_WAVE: &str = "driftwatch.io/sync-wave";
pub const ANNOTATION_HOOK: &str = "driftwatch.io/hook";
pub const ANNOTATION_HOOK_DELETE_POLICY: &str = "driftwatch.io/hook-delete-policy";
pub const ANNOTATION_SYNC_OPTIONS: &str = "driftwatch.io/sync-options";
pub const ANNOTATION_COMPARE_OPTIONS: &str = "driftwatch.io/compare-options";
pub const ANNOTATION_REFRESH: &str = "driftwatch.io/refresh";
pub const ANNOTATION_DELETION_APPROVED: &str = "driftwatch.io/deletion-approved";
pub const ANNOTATION_SKIP_RECONCILE: &str = "driftwatch.io/skip-reconcile";
pub const ANNOTATION_TRACKING_ID: &str = "driftwatch.io/tracking-id";
pub const ANNOTATION_INSTALLATION_ID: &str = "driftwatch.io/installation-id";
pub const ANNOTATION_LAST_APPLIED: &str = "kubectl.kubernetes.io/last-applied-configuration";

pub const HELM_HOOK: &str = "helm.sh/hook";
pub const HELM_HOOK_WEIGHT: &str = "helm.sh/hook-weight";
pub const HELM_HOOK_DELETE_POLICY: &str = "helm.sh/hook-delete-policy";
pub const HELM_RESOURCE_POLICY: &str = "helm.sh/resource-policy";

pub const SYNC_OPTION_PRUNE_DISABLED: &str = "Prune=false";
pub const SYNC_OPTION_PRUNE_CONFIRM: &str = "Prune=confirm";
pub const SYNC_OPTION_DELETE_DISABLED: &str = "Delete=false";
pub const SYNC_OPTION_DELETE_CONFIRM: &str = "Delete=confirm";
pub const SYNC_OPTION_PRUNE_LAST: &str = "PruneLast=true";
pub const SYNC_OPTION_APPLY_OUT_OF_SYNC_ONLY: &str = "ApplyOutOfSyncOnly=true";
pub const SYNC_OPTION_CREATE_NAMESPACE: &str = "CreateNamespace=true";
pub const SYNC_OPTION_SERVER_SIDE_APPLY: &str = "ServerSideApply=true";
pub const SYNC_OPTION_REPLACE: &str = "Replace=true";
pub const SYNC_OPTION_FORCE: &str = "Force=true";
pub const SYNC_OPTION_VALIDATE_DISABLED: &str = "Validate=false";
pub const SYNC_OPTION_FAIL_ON_SHARED: &str = "FailOnSharedResource=true";
pub const SYNC_OPTION_RESPECT_IGNORE_DIFFERENCES: &str = "RespectIgnoreDifferences=true";
pub const SYNC_OPTION_SKIP_DRY_RUN_ON_MISSING: &str = "SkipDryRunOnMissingResource=true";
pub const SYNC_OPTION_PRUNE_PROPAGATION: &str = "PrunePropagationPolicy";

pub const COMPARE_OPTION_IGNORE_EXTRANEOUS: &str = "IgnoreExtraneous";
pub const COMPARE_OPTION_SERVER_SIDE_DIFF: &str = "ServerSideDiff=true";
pub const COMPARE_OPTION_NO_SERVER_SIDE_DIFF: &str = "ServerSideDiff=false";

fn annotation<'a>(obj: &'a DynamicObject, key: &str) -> Option<&'a str> {
    obj.annotations().get(key).map(String::as_str)
}

/// Whether a comma separated option annotation contains `option`
pub fn has_annotation_option(obj: &DynamicObject, key: &str, option: &str) -> bool {
    annotation(obj, key)
        .map(|v| v.split(',').any(|o| o.trim() == option))
        .unwrap_or(false)
}

pub fn has_sync_option(obj: &DynamicObject, option: &str) -> bool {
    has_annotation_option(obj, ANNOTATION_SYNC_OPTIONS, option)
}

pub fn has_compare_option(obj: &DynamicObject, option: &str) -> bool {
    has_annotation_option(obj, ANNOTATION_COMPARE_OPTIONS, option)
}

/// Parsed list of `Key=value` sync options
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncOptions(Vec<String>);

impl SyncOptions {
    pub fn new<I, S>(options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            options
                .into_iter()
                .map(|o| o.as_ref().trim().to_string())
                .filter(|o| !o.is_empty())
                .collect(),
        )
    }

    pub fn has(&self, option: &str) -> bool {
        self.0.iter().any(|o| o == option)
    }

    /// Value of a `Key=value` option
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.iter().find_map(|o| {
            o.split_once('=')
                .filter(|(k, _)| *k == key)
                .map(|(_, v)| v)
        })
    }

    /// Merge resource level options over these, resource options win per key
    pub fn merged_with(&self, other: &SyncOptions) -> SyncOptions {
        let mut merged: Vec<String> = self
            .0
            .iter()
            .filter(|o| {
                let key = o.split('=').next().unwrap_or_default();
                !other.0.iter().any(|x| x.split('=').next() == Some(key))
            })
            .cloned()
            .collect();
        merged.extend(other.0.iter().cloned());
        SyncOptions(merged)
    }

    pub fn of_object(obj: &DynamicObject) -> Self {
        annotation(obj, ANNOTATION_SYNC_OPTIONS)
            .map(|v| SyncOptions::new(v.split(',')))
            .unwrap_or_default()
    }
}

/// Helm hook names mapped onto sync hook types
fn helm_hook_types(value: &str) -> Vec<HookType> {
    let mut types = Vec::new();
    for hook in value.split(',') {
        let mapped = match hook.trim() {
            "crd-install" | "pre-install" | "pre-upgrade" => Some(HookType::PreSync),
            "post-install" | "post-upgrade" => Some(HookType::PostSync),
            "post-delete" => Some(HookType::PostDelete),
            _ => None,
        };
        if let Some(t) = mapped {
            if !types.contains(&t) {
                types.push(t);
            }
        }
    }
    types
}

/// Hook types declared on an object. Empty for regular resources.
pub fn hook_types(obj: &DynamicObject) -> Vec<HookType> {
    if let Some(value) = annotation(obj, ANNOTATION_HOOK) {
        let mut types: Vec<HookType> = value.split(',').filter_map(HookType::parse).collect();
        types.dedup();
        return types;
    }
    annotation(obj, HELM_HOOK)
        .map(helm_hook_types)
        .unwrap_or_default()
}

/// Hooks run as part of a sync, excluding `Skip` markers
pub fn is_hook(obj: &DynamicObject) -> bool {
    hook_types(obj)
        .iter()
        .any(|t| *t != HookType::Skip && *t != HookType::PostDelete)
        || is_post_delete_hook(obj)
}

pub fn is_skip_hook(obj: &DynamicObject) -> bool {
    hook_types(obj).contains(&HookType::Skip)
}

pub fn is_post_delete_hook(obj: &DynamicObject) -> bool {
    hook_types(obj).contains(&HookType::PostDelete)
}

/// Helm hooks with no sync counterpart (`test`, `pre-delete`, ...) are ignored
pub fn is_unsupported_helm_hook(obj: &DynamicObject) -> bool {
    annotation(obj, ANNOTATION_HOOK).is_none()
        && annotation(obj, HELM_HOOK).is_some()
        && hook_types(obj).is_empty()
}

/// Delete policies of a hook, `BeforeHookCreation` when unset
pub fn hook_delete_policies(obj: &DynamicObject) -> Vec<HookDeletePolicy> {
    let raw = annotation(obj, ANNOTATION_HOOK_DELETE_POLICY)
        .or_else(|| annotation(obj, HELM_HOOK_DELETE_POLICY));
    let mut policies: Vec<HookDeletePolicy> = raw
        .map(|v| v.split(',').filter_map(HookDeletePolicy::parse).collect())
        .unwrap_or_default();
    if policies.is_empty() {
        policies.push(HookDeletePolicy::BeforeHookCreation);
    }
    policies
}

/// Sync wave of an object. Helm hook weights apply to Helm hooks.
pub fn sync_wave(obj: &DynamicObject) -> i64 {
    if let Some(wave) = annotation(obj, ANNOTATION_SYNC_WAVE).and_then(|v| v.trim().parse().ok()) {
        return wave;
    }
    if annotation(obj, HELM_HOOK).is_some() {
        if let Some(weight) = annotation(obj, HELM_HOOK_WEIGHT).and_then(|v| v.trim().parse().ok()) {
            return weight;
        }
    }
    0
}

/// Objects annotated `helm.sh/resource-policy: keep` survive deletion
pub fn is_helm_keep(obj: &DynamicObject) -> bool {
    annotation(obj, HELM_RESOURCE_POLICY) == Some("keep")
}
