//! Application condition helpers
//!
//! Conditions are the only channel through which reconciliation failures
//! reach users. Each refresh re-evaluates a known set of condition types
//! and leaves every other type untouched.

use chrono::Utc;

use crate::crd::{format_time, ApplicationCondition};

pub const CONDITION_COMPARISON_ERROR: &str = "ComparisonError";
pub const CONDITION_INVALID_SPEC_ERROR: &str = "InvalidSpecError";
pub const CONDITION_SYNC_ERROR: &str = "SyncError";
pub const CONDITION_DELETION_ERROR: &str = "DeletionError";
pub const CONDITION_UNKNOWN_ERROR: &str = "UnknownError";
pub const CONDITION_SHARED_RESOURCE_WARNING: &str = "SharedResourceWarning";
pub const CONDITION_ORPHANED_RESOURCE_WARNING: &str = "OrphanedResourceWarning";
pub const CONDITION_REPEATED_RESOURCE_WARNING: &str = "RepeatedResourceWarning";
pub const CONDITION_EXCLUDED_RESOURCE_WARNING: &str = "ExcludedResourceWarning";

/// Condition types owned by the comparison step
pub const COMPARISON_CONDITION_TYPES: &[&str] = &[
    CONDITION_COMPARISON_ERROR,
    CONDITION_SHARED_RESOURCE_WARNING,
    CONDITION_REPEATED_RESOURCE_WARNING,
    CONDITION_EXCLUDED_RESOURCE_WARNING,
    CONDITION_ORPHANED_RESOURCE_WARNING,
];

/// Condition types owned by spec validation
pub const SPEC_CONDITION_TYPES: &[&str] = &[CONDITION_INVALID_SPEC_ERROR, CONDITION_UNKNOWN_ERROR];

/// Replace the conditions of the evaluated types with `new`.
///
/// A condition that keeps its type and message keeps its transition time.
/// Conditions of other types are left untouched. Returns whether anything
/// changed.
pub fn set_conditions(
    conditions: &mut Vec<ApplicationCondition>,
    new: Vec<ApplicationCondition>,
    evaluated_types: &[&str],
) -> bool {
    let before = conditions.clone();
    let now = format_time(Utc::now());

    let mut result: Vec<ApplicationCondition> = conditions
        .iter()
        .filter(|c| !evaluated_types.contains(&c.type_.as_str()))
        .cloned()
        .collect();

    for mut condition in new {
        if result
            .iter()
            .any(|c| c.type_ == condition.type_ && c.message == condition.message)
        {
            continue;
        }
        match before
            .iter()
            .find(|c| c.type_ == condition.type_ && c.message == condition.message)
        {
            Some(existing) => condition.last_transition_time = existing.last_transition_time.clone(),
            None => {
                if condition.last_transition_time.is_none() {
                    condition.last_transition_time = Some(now.clone());
                }
            }
        }
        result.push(condition);
    }

    result.sort_by(|a, b| a.type_.cmp(&b.type_).then_with(|| a.message.cmp(&b.message)));
    let mut sorted_before = before;
    sorted_before.sort_by(|a, b| a.type_.cmp(&b.type_).then_with(|| a.message.cmp(&b.message)));

    let changed = sorted_before != result;
    *conditions = result;
    changed
}

/// Find a condition by type
pub fn find_condition<'a>(
    conditions: &'a [ApplicationCondition],
    type_: &str,
) -> Option<&'a ApplicationCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

pub fn has_condition(conditions: &[ApplicationCondition], type_: &str) -> bool {
    find_condition(conditions, type_).is_some()
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<ApplicationCondition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Conditions that block a sync from starting
pub fn blocking_conditions(conditions: &[ApplicationCondition]) -> Vec<&ApplicationCondition> {
    conditions
        .iter()
        .filter(|c| {
            c.type_ == CONDITION_COMPARISON_ERROR || c.type_ == CONDITION_INVALID_SPEC_ERROR
        })
        .collect()
}

pub fn comparison_error(message: impl Into<String>) -> ApplicationCondition {
    ApplicationCondition::new(CONDITION_COMPARISON_ERROR, message)
}

pub fn invalid_spec_error(message: impl Into<String>) -> ApplicationCondition {
    ApplicationCondition::new(CONDITION_INVALID_SPEC_ERROR, message)
}

pub fn sync_error(message: impl Into<String>) -> ApplicationCondition {
    ApplicationCondition::new(CONDITION_SYNC_ERROR, message)
}
