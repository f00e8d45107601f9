//! Automated sync decisions
//!
//! `auto_sync_decision` inspects a fresh comparison and decides whether an
//! automated sync operation should be started. It never touches the API;
//! the controller carries out the decision.

use chrono::{DateTime, Duration, Utc};

use super::conditions::{sync_error, CONDITION_SYNC_ERROR};
use super::sync::Backoff;
use crate::crd::{
    Application, ApplicationCondition, Operation, OperationInitiator, OperationPhase,
    ResourceStatus, RetryStrategy, SyncOperation, SyncOperationResource, SyncStatus,
    SyncStatusCode,
};

/// Retry limit of automated operations when the policy sets none
pub const DEFAULT_AUTOMATED_RETRY_LIMIT: i64 = 5;

pub const DEFAULT_SELF_HEAL_BACKOFF_SECS: i64 = 2;
pub const DEFAULT_SELF_HEAL_BACKOFF_FACTOR: f64 = 3.0;
pub const DEFAULT_SELF_HEAL_BACKOFF_CAP_SECS: i64 = 300;
pub const DEFAULT_SELF_HEAL_COOLDOWN_SECS: i64 = 330;

/// Pacing of repeated self-heal attempts
#[derive(Clone, Debug)]
pub struct SelfHealConfig {
    /// Fixed wait after the last operation, used when no backoff is set
    pub timeout: Duration,
    /// Growing wait keyed by the number of consecutive attempts
    pub backoff: Option<Backoff>,
    /// Quiet period after which the attempt count starts over
    pub cooldown: Duration,
}

impl Default for SelfHealConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::zero(),
            backoff: Some(Backoff {
                base: Duration::seconds(DEFAULT_SELF_HEAL_BACKOFF_SECS),
                factor: DEFAULT_SELF_HEAL_BACKOFF_FACTOR,
                max: Duration::seconds(DEFAULT_SELF_HEAL_BACKOFF_CAP_SECS),
            }),
            cooldown: Duration::seconds(DEFAULT_SELF_HEAL_COOLDOWN_SECS),
        }
    }
}

impl SelfHealConfig {
    /// Wait still required before attempt number `attempts + 1`
    fn remaining(&self, app: &Application, attempts: i64, now: DateTime<Utc>) -> Duration {
        let Some(state) = app.status.as_ref().and_then(|s| s.operation_state.as_ref()) else {
            return Duration::zero();
        };
        let since = state.finished_at_time().map(|finished| now - finished);
        let wait = match &self.backoff {
            None => self.timeout,
            Some(_) if attempts <= 0 => Duration::zero(),
            Some(backoff) => backoff.delay(attempts - 1),
        };
        match since {
            Some(since) => wait - since,
            None => wait,
        }
    }

    /// The last operation succeeded and the cool-down has passed since
    fn cooldown_elapsed(&self, app: &Application, now: DateTime<Utc>) -> bool {
        let Some(state) = app.status.as_ref().and_then(|s| s.operation_state.as_ref()) else {
            return true;
        };
        let Some(finished) = state.finished_at_time() else {
            return true;
        };
        now - finished >= self.cooldown && state.phase.is_successful()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum AutoSyncDecision {
    /// Nothing to do
    Skip(String),
    /// Self-heal must wait; refresh again after the delay
    Defer { after: Duration, reason: String },
    /// Syncing is refused, reported as a `SyncError` condition
    Blocked(ApplicationCondition),
    /// Start this operation
    Sync { operation: Operation, revisions: Vec<String> },
}

/// Previous attempt at the desired revisions with the current sources.
///
/// A revision change without changes to the rendered manifests counts as
/// already attempted.
fn already_attempted_sync(
    app: &Application,
    desired: &[String],
    revision_updated: bool,
) -> Option<(Vec<String>, OperationPhase)> {
    let state = app.status.as_ref()?.operation_state.as_ref()?;
    let result = state.sync_result.as_ref()?;
    let last: Vec<String> = if !result.revisions.is_empty() {
        result.revisions.clone()
    } else if !result.revision.is_empty() {
        vec![result.revision.clone()]
    } else {
        Vec::new()
    };
    if last != desired && revision_updated {
        return None;
    }
    let same_source = if app.spec.has_multiple_sources() {
        app.spec.sources == result.sources
    } else {
        app.spec.source == result.source
    };
    if !same_source {
        return None;
    }
    Some((last, state.phase))
}

fn describe(revisions: &[String]) -> String {
    revisions.join(", ")
}

/// Decide whether a comparison leads to an automated sync
pub fn auto_sync_decision(
    app: &Application,
    sync_status: &SyncStatus,
    resources: &[ResourceStatus],
    revision_updated: bool,
    config: &SelfHealConfig,
    now: DateTime<Utc>,
) -> AutoSyncDecision {
    let Some(policy) = app.spec.sync_policy.as_ref().filter(|p| p.is_automated()) else {
        return AutoSyncDecision::Skip("automated sync is disabled".to_string());
    };
    let automated = policy.automated.clone().unwrap_or_default();
    if app.operation.is_some() {
        return AutoSyncDecision::Skip("another operation is in progress".to_string());
    }
    if app.is_being_deleted() {
        return AutoSyncDecision::Skip("deletion in progress".to_string());
    }
    if sync_status.status != SyncStatusCode::OutOfSync {
        return AutoSyncDecision::Skip(format!("application status is {}", sync_status.status));
    }

    if !automated.prune {
        let prune_only = resources
            .iter()
            .all(|r| r.status == Some(SyncStatusCode::Synced) || r.requires_pruning);
        if prune_only {
            return AutoSyncDecision::Skip(
                "need to prune extra resources only but automated prune is disabled".to_string(),
            );
        }
    }

    let multi = app.spec.has_multiple_sources();
    let desired: Vec<String> = if multi {
        sync_status.revisions.clone()
    } else {
        sync_status.revision.iter().cloned().collect()
    };

    let mut sync = SyncOperation {
        revision: if multi { None } else { sync_status.revision.clone() },
        revisions: if multi { sync_status.revisions.clone() } else { Vec::new() },
        prune: automated.prune,
        source: if multi { None } else { app.spec.source.clone() },
        sources: if multi { app.spec.sources.clone() } else { Vec::new() },
        sync_options: policy.sync_options.clone(),
        ..Default::default()
    };

    if let Some((last, phase)) = already_attempted_sync(app, &desired, revision_updated) {
        if !phase.is_successful() {
            let message = app
                .status
                .as_ref()
                .and_then(|s| s.operation_state.as_ref())
                .map(|s| s.message.clone())
                .unwrap_or_default();
            return AutoSyncDecision::Blocked(sync_error(format!(
                "Failed last sync attempt to {}: {}",
                describe(&last),
                message
            )));
        }
        if !automated.self_heal {
            return AutoSyncDecision::Skip(format!(
                "most recent sync already to {}",
                describe(&desired)
            ));
        }

        if !config.cooldown_elapsed(app, now) {
            sync.self_heal_attempts_count = app
                .status
                .as_ref()
                .and_then(|s| s.operation_state.as_ref())
                .and_then(|s| s.operation.sync.as_ref())
                .map(|s| s.self_heal_attempts_count)
                .unwrap_or(0);
        }
        let remaining = config.remaining(app, sync.self_heal_attempts_count, now);
        if remaining > Duration::zero() {
            return AutoSyncDecision::Defer {
                after: remaining,
                reason: format!(
                    "already attempted sync to {}, retrying in {}s",
                    describe(&last),
                    remaining.num_seconds()
                ),
            };
        }

        sync.self_heal_attempts_count += 1;
        sync.resources = resources
            .iter()
            .filter(|r| r.status != Some(SyncStatusCode::Synced))
            .map(|r| SyncOperationResource {
                group: r.group.clone(),
                kind: r.kind.clone(),
                name: r.name.clone(),
                namespace: if r.namespace.is_empty() {
                    None
                } else {
                    Some(r.namespace.clone())
                },
            })
            .collect();
    }

    if automated.prune && !automated.allow_empty {
        let all_pruned = resources.iter().all(|r| r.requires_pruning);
        if all_pruned {
            return AutoSyncDecision::Blocked(sync_error(format!(
                "Skipping sync attempt to {}: auto-sync will wipe out all resources",
                describe(&desired)
            )));
        }
    }

    let retry = policy.retry.clone().unwrap_or(RetryStrategy {
        limit: DEFAULT_AUTOMATED_RETRY_LIMIT,
        ..Default::default()
    });
    AutoSyncDecision::Sync {
        operation: Operation {
            sync: Some(sync),
            initiated_by: OperationInitiator {
                username: None,
                automated: true,
            },
            retry: Some(retry),
            ..Default::default()
        },
        revisions: desired,
    }
}

/// Event message of a started automated sync
pub fn initiated_message(revisions: &[String]) -> String {
    format!("Initiated automated sync to '{}'", describe(revisions))
}

/// Only the `SyncError` condition type is owned by automated sync
pub const AUTO_SYNC_CONDITION_TYPES: &[&str] = &[CONDITION_SYNC_ERROR];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        format_time, ApplicationDestination, ApplicationSource, ApplicationSpec,
        ApplicationStatus, OperationState, SyncOperationResult, SyncPolicy, SyncPolicyAutomated,
    };
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    fn source() -> ApplicationSource {
        ApplicationSource {
            repo_url: "https://git.example.com/deploy.git".to_string(),
            path: Some("guestbook".to_string()),
            ..Default::default()
        }
    }

    fn app(prune: bool, self_heal: bool) -> Application {
        let mut app = Application::new(
            "guestbook",
            ApplicationSpec {
                source: Some(source()),
                destination: ApplicationDestination {
                    server: Some("https://kubernetes.default.svc".to_string()),
                    namespace: Some("web".to_string()),
                    name: None,
                },
                sync_policy: Some(SyncPolicy {
                    automated: Some(SyncPolicyAutomated {
                        prune,
                        self_heal,
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        );
        app.metadata.namespace = Some("driftwatch".to_string());
        app
    }

    fn out_of_sync(revision: &str) -> SyncStatus {
        SyncStatus {
            status: SyncStatusCode::OutOfSync,
            revision: Some(revision.to_string()),
            ..Default::default()
        }
    }

    fn resource(name: &str, status: SyncStatusCode, requires_pruning: bool) -> ResourceStatus {
        ResourceStatus {
            version: "v1".to_string(),
            kind: "ConfigMap".to_string(),
            namespace: "web".to_string(),
            name: name.to_string(),
            status: Some(status),
            requires_pruning,
            ..Default::default()
        }
    }

    /// Last operation synced `revision` with `phase`, finished `ago` before now
    fn with_last_sync(
        mut app: Application,
        revision: &str,
        phase: OperationPhase,
        ago: Duration,
        attempts: i64,
    ) -> Application {
        app.status = Some(ApplicationStatus {
            operation_state: Some(OperationState {
                operation: Operation {
                    sync: Some(SyncOperation {
                        self_heal_attempts_count: attempts,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                phase,
                message: "one or more objects failed to apply".to_string(),
                sync_result: Some(SyncOperationResult {
                    revision: revision.to_string(),
                    source: Some(source()),
                    ..Default::default()
                }),
                started_at: format_time(now() - ago - Duration::seconds(5)),
                finished_at: Some(format_time(now() - ago)),
                retry_count: 0,
                next_retry_at: None,
            }),
            ..Default::default()
        });
        app
    }

    fn decide(app: &Application, status: &SyncStatus, resources: &[ResourceStatus]) -> AutoSyncDecision {
        auto_sync_decision(app, status, resources, true, &SelfHealConfig::default(), now())
    }

    #[test]
    fn test_out_of_sync_starts_pruning_sync() {
        let resources = [resource("settings", SyncStatusCode::OutOfSync, false)];
        match decide(&app(true, false), &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Sync { operation, revisions } => {
                let sync = operation.sync.unwrap();
                assert!(sync.prune);
                assert_eq!(sync.revision.as_deref(), Some("abc123"));
                assert!(sync.resources.is_empty());
                assert!(operation.initiated_by.automated);
                assert_eq!(operation.retry.unwrap().limit, DEFAULT_AUTOMATED_RETRY_LIMIT);
                assert_eq!(initiated_message(&revisions), "Initiated automated sync to 'abc123'");
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_skips_when_not_out_of_sync_or_busy() {
        let resources = [resource("settings", SyncStatusCode::OutOfSync, false)];
        let synced = SyncStatus {
            status: SyncStatusCode::Synced,
            ..Default::default()
        };
        assert!(matches!(
            decide(&app(true, false), &synced, &resources),
            AutoSyncDecision::Skip(_)
        ));

        let mut busy = app(true, false);
        busy.operation = Some(Operation::default());
        assert!(matches!(
            decide(&busy, &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Skip(_)
        ));

        let mut manual = app(true, false);
        manual.spec.sync_policy = None;
        assert!(matches!(
            decide(&manual, &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Skip(_)
        ));
    }

    #[test]
    fn test_prune_only_drift_needs_automated_prune() {
        let resources = [
            resource("kept", SyncStatusCode::Synced, false),
            resource("extra", SyncStatusCode::OutOfSync, true),
        ];
        assert!(matches!(
            decide(&app(false, false), &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Skip(reason) if reason.contains("prune")
        ));
        assert!(matches!(
            decide(&app(true, false), &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Sync { .. }
        ));
    }

    #[test]
    fn test_would_prune_everything_is_blocked() {
        let resources = [resource("extra", SyncStatusCode::OutOfSync, true)];
        match decide(&app(true, false), &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Blocked(condition) => {
                assert_eq!(condition.type_, CONDITION_SYNC_ERROR);
                assert!(condition.message.contains("wipe out all resources"));
            }
            other => panic!("unexpected decision {:?}", other),
        }

        let mut allow = app(true, false);
        if let Some(a) = allow.spec.sync_policy.as_mut().and_then(|p| p.automated.as_mut()) {
            a.allow_empty = true;
        }
        assert!(matches!(
            decide(&allow, &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Sync { .. }
        ));
    }

    #[test]
    fn test_failed_attempt_raises_sync_error() {
        let app = with_last_sync(app(true, false), "abc123", OperationPhase::Failed, Duration::minutes(1), 0);
        let resources = [resource("settings", SyncStatusCode::OutOfSync, false)];
        match decide(&app, &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Blocked(condition) => assert_eq!(
                condition.message,
                "Failed last sync attempt to abc123: one or more objects failed to apply"
            ),
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_new_revision_is_synced_again() {
        let app = with_last_sync(app(true, false), "abc123", OperationPhase::Succeeded, Duration::minutes(1), 0);
        let resources = [resource("settings", SyncStatusCode::OutOfSync, false)];
        assert!(matches!(
            decide(&app, &out_of_sync("def456"), &resources),
            AutoSyncDecision::Sync { .. }
        ));
        // a new revision without manifest changes counts as attempted
        assert!(matches!(
            auto_sync_decision(
                &app,
                &out_of_sync("def456"),
                &resources,
                false,
                &SelfHealConfig::default(),
                now()
            ),
            AutoSyncDecision::Skip(_)
        ));
    }

    #[test]
    fn test_self_heal_suppressed_without_self_heal() {
        let app = with_last_sync(app(true, false), "abc123", OperationPhase::Succeeded, Duration::minutes(1), 0);
        let resources = [resource("settings", SyncStatusCode::OutOfSync, false)];
        assert!(matches!(
            decide(&app, &out_of_sync("abc123"), &resources),
            AutoSyncDecision::Skip(reason) if reason.contains("most recent sync already")
        ));
    }

    #[test]
    fn test_self_heal_syncs_only_drifted_resources() {
        let app = with_last_sync(app(true, true), "abc123", OperationPhase::Succeeded, Duration::minutes(10), 0);
        let resources = [
            resource("kept", SyncStatusCode::Synced, false),
            resource("drifted", SyncStatusCode::OutOfSync, false),
        ];
        match decide(&app, &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Sync { operation, .. } => {
                let sync = operation.sync.unwrap();
                assert_eq!(sync.self_heal_attempts_count, 1);
                let names: Vec<&str> = sync.resources.iter().map(|r| r.name.as_str()).collect();
                assert_eq!(names, vec!["drifted"]);
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_self_heal_backs_off_within_cooldown() {
        // third attempt inside the cool-down: 2s * 3^1 = 6s since the last one
        let app = with_last_sync(app(true, true), "abc123", OperationPhase::Succeeded, Duration::seconds(1), 2);
        let resources = [resource("drifted", SyncStatusCode::OutOfSync, false)];
        match decide(&app, &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Defer { after, .. } => assert_eq!(after, Duration::seconds(5)),
            other => panic!("unexpected decision {:?}", other),
        }

        let app = with_last_sync(self::app(true, true), "abc123", OperationPhase::Succeeded, Duration::seconds(7), 2);
        match decide(&app, &out_of_sync("abc123"), &resources) {
            AutoSyncDecision::Sync { operation, .. } => {
                assert_eq!(operation.sync.unwrap().self_heal_attempts_count, 3)
            }
            other => panic!("unexpected decision {:?}", other),
        }
    }

    #[test]
    fn test_fixed_self_heal_timeout() {
        let config = SelfHealConfig {
            timeout: Duration::seconds(5),
            backoff: None,
            cooldown: Duration::zero(),
        };
        let app = with_last_sync(app(true, true), "abc123", OperationPhase::Succeeded, Duration::seconds(2), 0);
        let resources = [resource("drifted", SyncStatusCode::OutOfSync, false)];
        assert!(matches!(
            auto_sync_decision(&app, &out_of_sync("abc123"), &resources, true, &config, now()),
            AutoSyncDecision::Defer { after, .. } if after == Duration::seconds(3)
        ));
    }
}
