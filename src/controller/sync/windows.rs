//! Sync windows: cron scheduled periods that allow or deny syncing
//!
//! Schedules use the five field cron format and are evaluated in UTC.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use glob::Pattern;
use tracing::warn;

use super::retry::parse_duration;
use crate::crd::{AppProject, Application, SyncWindow};
use crate::error::{Error, Result};

pub const WINDOW_ALLOW: &str = "allow";
pub const WINDOW_DENY: &str = "deny";

fn glob_match(pattern: &str, value: &str) -> bool {
    pattern == value
        || Pattern::new(pattern)
            .map(|p| p.matches(value))
            .unwrap_or(false)
}

/// Map a standard day-of-week field (0 or 7 = Sunday) onto the numbering
/// of the `cron` crate (1 = Sunday).
fn convert_day_of_week(field: &str) -> String {
    let shift = |n: &str| -> String {
        match n.parse::<u32>() {
            Ok(v) => ((v % 7) + 1).to_string(),
            Err(_) => n.to_string(),
        }
    };
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((r, s)) => (r, Some(s)),
                None => (part, None),
            };
            let converted = match range.split_once('-') {
                Some((from, "7")) => format!("{}-7,1", shift(from)),
                Some((from, to)) => format!("{}-{}", shift(from), shift(to)),
                None => shift(range),
            };
            match step {
                Some(s) => format!("{}/{}", converted, s),
                None => converted,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a five field cron expression
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(Error::ValidationError(format!(
            "cannot parse schedule '{}': expected 5 fields",
            expr
        )));
    }
    let full = format!(
        "0 {} {} {} {} {}",
        fields[0],
        fields[1],
        fields[2],
        fields[3],
        convert_day_of_week(fields[4])
    );
    Schedule::from_str(&full)
        .map_err(|e| Error::ValidationError(format!("cannot parse schedule '{}': {}", expr, e)))
}

/// Whether the window is open at `now`
pub fn is_active(window: &SyncWindow, now: DateTime<Utc>) -> Result<bool> {
    let schedule = parse_schedule(&window.schedule)?;
    let duration = parse_duration(&window.duration).map_err(|_| {
        Error::ValidationError(format!("cannot parse duration '{}'", window.duration))
    })?;
    if let Some(tz) = window.time_zone.as_deref() {
        if !tz.is_empty() && tz != "UTC" && tz != "Etc/UTC" {
            warn!(time_zone = %tz, "Sync window time zones other than UTC are not supported, using UTC");
        }
    }
    Ok(schedule
        .after(&(now - duration))
        .next()
        .map(|start| start < now)
        .unwrap_or(false))
}

/// Windows that apply to the application.
///
/// Applications, clusters and namespaces are matched in that order; without
/// `and_operator` the first match wins, with it every configured list must
/// match.
pub fn matching_windows<'a>(windows: &'a [SyncWindow], app: &Application) -> Vec<&'a SyncWindow> {
    let name = app.metadata.name.as_deref().unwrap_or_default();
    let dest = &app.spec.destination;
    let mut matching = Vec::new();

    for window in windows {
        let mut matched = false;
        let mut is_set = false;

        if !window.applications.is_empty() {
            is_set = true;
            matched = window.applications.iter().any(|a| glob_match(a, name));
        }
        if window.and_operator && is_set && !matched {
            continue;
        } else if !window.and_operator && matched {
            matching.push(window);
            continue;
        }

        if !window.clusters.is_empty() {
            is_set = true;
            matched = window.clusters.iter().any(|c| {
                dest.name.as_deref().map(|n| !n.is_empty() && glob_match(c, n)).unwrap_or(false)
                    || dest.server.as_deref().map(|s| !s.is_empty() && glob_match(c, s)).unwrap_or(false)
            });
        }
        if window.and_operator && is_set && !matched {
            continue;
        } else if !window.and_operator && matched {
            matching.push(window);
            continue;
        }

        if !window.namespaces.is_empty() {
            matched = window
                .namespaces
                .iter()
                .any(|n| glob_match(n, dest.namespace()));
        }
        if matched {
            matching.push(window);
        }
    }
    matching
}

/// Whether the windows allow a sync at `now`.
///
/// An active deny wins unless every deny allows manual syncs. When allow
/// windows exist but none is open, only manual syncs permitted by all of
/// them may proceed.
pub fn can_sync(windows: &[&SyncWindow], is_manual: bool, now: DateTime<Utc>) -> Result<bool> {
    if windows.is_empty() {
        return Ok(true);
    }
    let mut active = Vec::new();
    let mut inactive_allows = Vec::new();
    for window in windows {
        if is_active(window, now)? {
            active.push(*window);
        } else if window.kind == WINDOW_ALLOW {
            inactive_allows.push(*window);
        }
    }

    let denies: Vec<&SyncWindow> = active
        .iter()
        .copied()
        .filter(|w| w.kind == WINDOW_DENY)
        .collect();
    if !denies.is_empty() {
        return Ok(is_manual && denies.iter().all(|w| w.manual_sync));
    }
    if active.iter().any(|w| w.kind == WINDOW_ALLOW) {
        return Ok(true);
    }
    if !inactive_allows.is_empty() {
        return Ok(is_manual && inactive_allows.iter().all(|w| w.manual_sync));
    }
    Ok(true)
}

/// Whether the project's windows block syncing the application now.
///
/// Invalid windows block with the parse error as the reason.
pub fn sync_window_prevents_sync(
    app: &Application,
    project: &AppProject,
    now: DateTime<Utc>,
) -> (bool, Option<String>) {
    let windows = matching_windows(&project.spec.sync_windows, app);
    let is_manual = app
        .status
        .as_ref()
        .and_then(|s| s.operation_state.as_ref())
        .map(|s| !s.operation.initiated_by.automated)
        .unwrap_or(false);
    match can_sync(&windows, is_manual, now) {
        Ok(allowed) => (!allowed, None),
        Err(e) => (true, Some(format!("invalid sync windows: {}", e))),
    }
}
