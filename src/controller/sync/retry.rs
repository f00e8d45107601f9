//! Retry of failed sync operations
//!
//! A failed attempt with retries left goes back to `Running` with
//! `nextRetryAt` persisted. The marker is read back as
//! [`OperationStage::RetryPending`] until the backoff has elapsed.

use chrono::{DateTime, Duration, Utc};

use crate::crd::{OperationPhase, OperationState, RetryStrategy};
use crate::error::{Error, Result};

pub const DEFAULT_RETRY_DURATION_SECS: i64 = 5;
pub const DEFAULT_RETRY_FACTOR: f64 = 2.0;
pub const DEFAULT_RETRY_MAX_DURATION_SECS: i64 = 180;

/// Parse `90`, `5s`, `250ms`, `3m` or `1h30m` into a duration.
///
/// A bare number counts seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<i64>() {
        return Ok(Duration::seconds(secs));
    }
    let invalid = || Error::ValidationError(format!("invalid duration '{}'", value));
    if value.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::zero();
    let mut rest = value;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let amount: f64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];
        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let millis = match &rest[..unit_len] {
            "ms" => amount,
            "s" => amount * 1_000.0,
            "m" => amount * 60_000.0,
            "h" => amount * 3_600_000.0,
            _ => return Err(invalid()),
        };
        total = total + Duration::milliseconds(millis as i64);
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Exponential backoff between attempts
#[derive(Clone, Debug, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: Duration::seconds(DEFAULT_RETRY_DURATION_SECS),
            factor: DEFAULT_RETRY_FACTOR,
            max: Duration::seconds(DEFAULT_RETRY_MAX_DURATION_SECS),
        }
    }
}

impl Backoff {
    pub fn from_strategy(strategy: Option<&RetryStrategy>) -> Result<Self> {
        let mut backoff = Backoff::default();
        let Some(spec) = strategy.and_then(|s| s.backoff.as_ref()) else {
            return Ok(backoff);
        };
        if let Some(duration) = spec.duration.as_deref().filter(|d| !d.is_empty()) {
            backoff.base = parse_duration(duration)?;
        }
        if let Some(max) = spec.max_duration.as_deref().filter(|d| !d.is_empty()) {
            backoff.max = parse_duration(max)?;
        }
        if let Some(factor) = spec.factor {
            backoff.factor = factor;
        }
        Ok(backoff)
    }

    /// `min(max, base * factor^count)`
    pub fn delay(&self, count: i64) -> Duration {
        let exponent = i32::try_from(count.max(0)).unwrap_or(i32::MAX);
        let millis = self.base.num_milliseconds() as f64 * self.factor.powi(exponent);
        let max = self.max.num_milliseconds() as f64;
        let capped = if max > 0.0 { millis.min(max) } else { millis };
        if !capped.is_finite() || capped >= i64::MAX as f64 {
            return self.max;
        }
        Duration::milliseconds(capped as i64)
    }

    pub fn next_retry_at(&self, last_attempt: DateTime<Utc>, count: i64) -> DateTime<Utc> {
        last_attempt + self.delay(count)
    }
}

/// Whether another attempt is allowed after `retry_count` retries
pub fn retries_left(strategy: Option<&RetryStrategy>, retry_count: i64) -> bool {
    strategy
        .map(|s| s.limit < 0 || retry_count < s.limit)
        .unwrap_or(false)
}

/// Where an operation stands between two processing passes
#[derive(Clone, Debug, PartialEq)]
pub enum OperationStage {
    /// An attempt is in flight or about to start
    InProgress,
    /// Termination was requested and cleanup has not finished
    Terminating,
    /// A failed attempt waits for its backoff to elapse
    RetryPending { at: DateTime<Utc>, count: i64 },
    Completed(OperationPhase),
}

impl OperationStage {
    pub fn of(state: &OperationState) -> Result<Self> {
        match state.phase {
            OperationPhase::Terminating => Ok(OperationStage::Terminating),
            phase if phase.is_completed() => Ok(OperationStage::Completed(phase)),
            _ => match state.next_retry_at.as_deref() {
                Some(raw) => {
                    let at = state.next_retry_at_time().ok_or_else(|| {
                        Error::ValidationError(format!("invalid retry time '{}'", raw))
                    })?;
                    Ok(OperationStage::RetryPending {
                        at,
                        count: state.retry_count,
                    })
                }
                None => Ok(OperationStage::InProgress),
            },
        }
    }
}

/// Turn a failed attempt into a pending retry when the policy allows it.
///
/// Returns whether a retry was scheduled.
pub fn schedule_retry(state: &mut OperationState, now: DateTime<Utc>) -> Result<bool> {
    if !state.phase.is_failed() {
        return Ok(false);
    }
    let strategy = state.operation.retry.as_ref();
    if !retries_left(strategy, state.retry_count) {
        if state.retry_count > 0 {
            state.message = format!("{} (retried {} times).", state.message, state.retry_count);
        }
        return Ok(false);
    }
    let backoff = Backoff::from_strategy(strategy)?;
    let at = backoff.next_retry_at(now, state.retry_count);
    state.finished_at = Some(crate::crd::format_time(now));
    state.next_retry_at = Some(crate::crd::format_time(at));
    state.phase = OperationPhase::Running;
    state.retry_count += 1;
    state.message = format!(
        "{}. Retrying attempt #{} at {}.",
        state.message,
        state.retry_count,
        at.format("%H:%M:%S")
    );
    Ok(true)
}

/// Start the attempt a pending retry was waiting for
pub fn begin_retry(state: &mut OperationState) {
    let mut extra = "";
    if state.operation.retry.as_ref().map(|r| r.refresh).unwrap_or(false) {
        extra = " with latest revisions";
        if let Some(sync) = state.operation.sync.as_mut() {
            sync.revision = None;
            sync.revisions.clear();
        }
    }
    state.message = format!("Retrying operation{}. Attempt #{}", extra, state.retry_count);
    state.finished_at = None;
    state.next_retry_at = None;
    state.sync_result = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{Backoff as BackoffSpec, Operation, SyncOperation};

    fn strategy(limit: i64, duration: &str, factor: f64, max: &str) -> RetryStrategy {
        RetryStrategy {
            limit,
            backoff: Some(BackoffSpec {
                duration: Some(duration.to_string()),
                factor: Some(factor),
                max_duration: Some(max.to_string()),
            }),
            refresh: false,
        }
    }

    fn failed_state(retry: Option<RetryStrategy>) -> OperationState {
        OperationState {
            operation: Operation {
                sync: Some(SyncOperation {
                    revision: Some("abc".to_string()),
                    ..Default::default()
                }),
                retry,
                ..Default::default()
            },
            phase: OperationPhase::Failed,
            message: "one or more objects failed to apply".to_string(),
            started_at: "2026-01-01T00:00:00Z".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("90").unwrap(), Duration::seconds(90));
        assert_eq!(parse_duration("5s").unwrap(), Duration::seconds(5));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::milliseconds(250));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::minutes(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5 parsecs").is_err());
        assert!(parse_duration("m").is_err());
    }

    #[test]
    fn test_default_backoff() {
        let backoff = Backoff::default();
        assert_eq!(backoff.delay(0), Duration::seconds(5));
        assert_eq!(backoff.delay(1), Duration::seconds(10));
        assert_eq!(backoff.delay(10), Duration::minutes(3));
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        let s = strategy(-1, "1ms", 1.5, "2s");
        let backoff = Backoff::from_strategy(Some(&s)).unwrap();
        let start = Utc::now();
        let mut previous = start;
        for count in 0..64 {
            let at = backoff.next_retry_at(start, count);
            assert!(at >= previous, "attempt {} went backwards", count);
            assert!(at - start <= Duration::seconds(2));
            previous = at;
        }
        assert_eq!(previous - start, Duration::seconds(2));
    }

    #[test]
    fn test_retries_left() {
        assert!(!retries_left(None, 0));
        assert!(retries_left(Some(&strategy(2, "1s", 2.0, "1m")), 1));
        assert!(!retries_left(Some(&strategy(2, "1s", 2.0, "1m")), 2));
        assert!(retries_left(Some(&strategy(-1, "1s", 2.0, "1m")), 1000));
    }

    #[test]
    fn test_schedule_retry_then_resume() {
        let mut state = failed_state(Some(strategy(3, "5s", 2.0, "3m")));
        let now = Utc::now();

        assert!(schedule_retry(&mut state, now).unwrap());
        assert_eq!(state.phase, OperationPhase::Running);
        assert_eq!(state.retry_count, 1);
        assert!(state.message.contains("Retrying attempt #1"));

        match OperationStage::of(&state).unwrap() {
            OperationStage::RetryPending { at, count } => {
                assert_eq!(count, 1);
                assert!(at > now);
            }
            other => panic!("unexpected stage {:?}", other),
        }

        begin_retry(&mut state);
        assert!(state.finished_at.is_none());
        assert!(state.next_retry_at.is_none());
        assert_eq!(OperationStage::of(&state).unwrap(), OperationStage::InProgress);
    }

    #[test]
    fn test_finished_running_state_without_marker_is_in_progress() {
        let mut state = failed_state(Some(strategy(3, "5s", 2.0, "3m")));
        state.phase = OperationPhase::Running;
        state.retry_count = 2;
        state.finished_at = Some("2026-01-01T00:01:00Z".to_string());
        assert_eq!(OperationStage::of(&state).unwrap(), OperationStage::InProgress);

        state.next_retry_at = Some("2026-01-01T00:01:20Z".to_string());
        assert_eq!(
            OperationStage::of(&state).unwrap(),
            OperationStage::RetryPending {
                at: crate::crd::parse_time("2026-01-01T00:01:20Z").unwrap(),
                count: 2,
            }
        );
    }

    #[test]
    fn test_unparsable_retry_marker_is_an_error() {
        let mut state = failed_state(None);
        state.phase = OperationPhase::Running;
        state.next_retry_at = Some("soon".to_string());
        assert!(OperationStage::of(&state).is_err());
    }

    #[test]
    fn test_no_retry_without_strategy() {
        let mut state = failed_state(None);
        assert!(!schedule_retry(&mut state, Utc::now()).unwrap());
        assert_eq!(
            OperationStage::of(&state).unwrap(),
            OperationStage::Completed(OperationPhase::Failed)
        );
    }

    #[test]
    fn test_exhausted_retries_are_reported() {
        let mut state = failed_state(Some(strategy(1, "5s", 2.0, "3m")));
        state.retry_count = 1;
        assert!(!schedule_retry(&mut state, Utc::now()).unwrap());
        assert!(state.message.ends_with("(retried 1 times)."));
    }

    #[test]
    fn test_refresh_drops_pinned_revision() {
        let mut s = strategy(3, "5s", 2.0, "3m");
        s.refresh = true;
        let mut state = failed_state(Some(s));
        schedule_retry(&mut state, Utc::now()).unwrap();
        begin_retry(&mut state);
        assert!(state.message.contains("with latest revisions"));
        assert_eq!(
            state.operation.sync.as_ref().and_then(|s| s.revision.clone()),
            None
        );
    }
}
