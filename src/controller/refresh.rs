//! Refresh decisions
//!
//! Decides whether an application status must be recomputed and how deep
//! the comparison goes, and validates the application against its project
//! before any comparison runs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Duration, Utc};
use kube::ResourceExt;

use super::conditions::invalid_spec_error;
use super::state::resolve_destination;
use crate::clients::ClusterRegistry;
use crate::crd::{AppProject, Application, ApplicationCondition};
use crate::error::Result;
use crate::resource::annotations::ANNOTATION_REFRESH;

/// How much of the application state a refresh recomputes
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CompareWith {
    /// Rebuild the resource tree from cached diffs
    Nothing,
    /// Compare against the revisions resolved last time
    Recent,
    /// Compare against the latest revisions
    #[default]
    Latest,
    /// Compare against the latest revisions, bypassing the revision cache
    LatestForceResolve,
}

impl CompareWith {
    pub fn as_i32(self) -> i32 {
        match self {
            CompareWith::Nothing => 0,
            CompareWith::Recent => 1,
            CompareWith::Latest => 2,
            CompareWith::LatestForceResolve => 3,
        }
    }

    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            0 => Some(CompareWith::Nothing),
            1 => Some(CompareWith::Recent),
            2 => Some(CompareWith::Latest),
            3 => Some(CompareWith::LatestForceResolve),
            _ => None,
        }
    }
}

impl fmt::Display for CompareWith {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i32())
    }
}

/// Key of the comparison-type queue: `namespace/name/level`
pub fn comparison_key(app_key: &str, level: CompareWith) -> String {
    format!("{}/{}", app_key, level)
}

/// Split a comparison-type key into the application key and level
pub fn parse_comparison_key(key: &str) -> Option<(String, CompareWith)> {
    let (app_key, level) = key.rsplit_once('/')?;
    if !app_key.contains('/') {
        return None;
    }
    let level = CompareWith::from_i32(level.parse().ok()?)?;
    Some((app_key.to_string(), level))
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RefreshType {
    #[default]
    Normal,
    Hard,
}

impl RefreshType {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshType::Normal => "normal",
            RefreshType::Hard => "hard",
        }
    }
}

/// Refresh requested through the refresh annotation
pub fn requested_refresh(app: &Application) -> Option<RefreshType> {
    match app.annotation(ANNOTATION_REFRESH)? {
        "hard" => Some(RefreshType::Hard),
        _ => Some(RefreshType::Normal),
    }
}

/// Comparison levels requested by the controller itself, keyed by
/// application key. Each request is consumed by the next refresh.
#[derive(Default)]
pub struct RefreshRequests {
    levels: Mutex<HashMap<String, CompareWith>>,
}

impl RefreshRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, CompareWith>> {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a request, keeping the deepest level asked for
    pub fn request(&self, key: &str, level: CompareWith) {
        let mut levels = self.lock();
        let entry = levels.entry(key.to_string()).or_insert(level);
        if level > *entry {
            *entry = level;
        }
    }

    pub fn take(&self, key: &str) -> Option<CompareWith> {
        self.lock().remove(key)
    }

    pub fn peek(&self, key: &str) -> Option<CompareWith> {
        self.lock().get(key).copied()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RefreshDecision {
    pub refresh_type: RefreshType,
    pub compare_with: CompareWith,
    pub reason: String,
}

/// Whether the sources in the spec still match the last comparison
fn current_source_equals_compared(app: &Application) -> bool {
    let Some(compared) = app.status.as_ref().and_then(|s| s.sync.compared_to.as_ref()) else {
        return false;
    };
    if app.spec.has_multiple_sources() {
        compared.sources == app.spec.sources
    } else {
        compared.source == app.spec.source
    }
}

/// Managed namespace metadata differs from what the last sync applied
pub fn has_changed_managed_namespace_metadata(app: &Application) -> bool {
    let desired = app
        .spec
        .sync_policy
        .as_ref()
        .and_then(|p| p.managed_namespace_metadata.as_ref());
    let Some(result) = app
        .status
        .as_ref()
        .and_then(|s| s.operation_state.as_ref())
        .and_then(|s| s.sync_result.as_ref())
    else {
        return false;
    };
    desired.is_some() && desired != result.managed_namespace_metadata.as_ref()
}

/// Decide whether `app` needs a refresh.
///
/// A controller request is only consumed when no other trigger applies.
pub fn need_refresh(
    app: &Application,
    soft_timeout: Duration,
    hard_timeout: Duration,
    requests: &RefreshRequests,
    now: DateTime<Utc>,
) -> Option<RefreshDecision> {
    let status = app.status.clone().unwrap_or_default();
    let reconciled_at = status.reconciled_at_time();
    let expired_after = |timeout: Duration| match reconciled_at {
        Some(at) => timeout > Duration::zero() && at + timeout < now,
        None => true,
    };
    let soft_expired = expired_after(soft_timeout);
    let hard_expired = hard_timeout > Duration::zero() && expired_after(hard_timeout);
    let reconciled_str = status.reconciled_at.clone().unwrap_or_else(|| "never".to_string());

    let decision = |refresh_type, compare_with, reason: String| RefreshDecision {
        refresh_type,
        compare_with,
        reason,
    };

    if let Some(refresh_type) = requested_refresh(app) {
        return Some(decision(
            refresh_type,
            CompareWith::LatestForceResolve,
            format!("{} refresh requested", refresh_type.as_str()),
        ));
    }
    if !current_source_equals_compared(app) {
        let reason = if app.spec.has_multiple_sources() {
            "at least one of the spec.sources differs"
        } else {
            "spec.source differs"
        };
        return Some(decision(
            RefreshType::Normal,
            CompareWith::LatestForceResolve,
            reason.to_string(),
        ));
    }
    if reconciled_at.is_none() {
        return Some(decision(
            RefreshType::Normal,
            CompareWith::Latest,
            "comparison expired, requesting refresh. reconciledAt: never".to_string(),
        ));
    }
    if hard_expired {
        return Some(decision(
            RefreshType::Hard,
            CompareWith::Latest,
            format!(
                "comparison expired, requesting hard refresh. reconciledAt: {}, expiry: {}s",
                reconciled_str,
                hard_timeout.num_seconds()
            ),
        ));
    }
    if soft_expired {
        return Some(decision(
            RefreshType::Normal,
            CompareWith::Latest,
            format!(
                "comparison expired, requesting refresh. reconciledAt: {}, expiry: {}s",
                reconciled_str,
                soft_timeout.num_seconds()
            ),
        ));
    }
    let compared = status.sync.compared_to.clone().unwrap_or_default();
    if compared.destination != app.spec.destination {
        return Some(decision(
            RefreshType::Normal,
            CompareWith::Latest,
            "spec.destination differs".to_string(),
        ));
    }
    if has_changed_managed_namespace_metadata(app) {
        return Some(decision(
            RefreshType::Normal,
            CompareWith::Latest,
            "spec.syncPolicy.managedNamespaceMetadata differs".to_string(),
        ));
    }
    if compared.ignore_differences != app.spec.ignore_differences {
        return Some(decision(
            RefreshType::Normal,
            CompareWith::Latest,
            "spec.ignoreDifferences differs".to_string(),
        ));
    }
    requests.take(&app.qualified_name()).map(|level| {
        decision(
            RefreshType::Normal,
            level,
            "controller refresh requested".to_string(),
        )
    })
}

/// Check the application against its project.
///
/// Returns the conditions to report; an empty list means the application
/// may be compared.
pub async fn validate_permissions(
    app: &Application,
    project: &AppProject,
    registry: &dyn ClusterRegistry,
) -> Result<Vec<ApplicationCondition>> {
    let mut conditions = Vec::new();
    let sources = app.spec.get_sources();
    if sources.is_empty() {
        conditions.push(invalid_spec_error("spec.source or spec.sources must be specified"));
    }
    for source in &sources {
        if source.repo_url.is_empty() {
            conditions.push(invalid_spec_error("spec.source.repoURL is required"));
            continue;
        }
        if !project.spec.is_source_permitted(&source.repo_url) {
            conditions.push(invalid_spec_error(format!(
                "application repo {} is not permitted in project '{}'",
                source.repo_url,
                project.name_any()
            )));
        }
    }

    let destination = &app.spec.destination;
    match resolve_destination(registry, destination).await {
        Ok(cluster) => {
            if !project.spec.is_destination_permitted(
                &cluster.server,
                &cluster.name,
                destination.namespace(),
            ) {
                conditions.push(invalid_spec_error(format!(
                    "application destination server '{}' and namespace '{}' do not match any of the allowed destinations in project '{}'",
                    cluster.server,
                    destination.namespace(),
                    project.name_any()
                )));
            }
        }
        Err(e) if e.is_retriable() => return Err(e),
        Err(e) => conditions.push(invalid_spec_error(match e {
            crate::error::Error::ValidationError(message) => message,
            other => other.to_string(),
        })),
    }
    Ok(conditions)
}
