//! Finalizer handling for Application and AppProject cleanup
//!
//! Finalizers ensure that when an Application is deleted:
//! 1. The resources it deployed are deleted, highest sync wave first
//! 2. Post-delete hooks run once those resources are gone
//! 3. Finished post-delete hooks are cleaned up
//!
//! An AppProject keeps its finalizer until no Application references it.

use kube::ResourceExt;
use serde_json::{json, Value};

use crate::clients::PropagationPolicy;
use crate::crd::{AppProject, Application};

/// Cascade deletion with foreground propagation
pub const RESOURCES_FINALIZER: &str = "resources-finalizer.driftwatch.io";

/// Cascade deletion with background propagation
pub const BACKGROUND_RESOURCES_FINALIZER: &str = "resources-finalizer.driftwatch.io/background";

/// Post-delete hooks must run before the application goes away
pub const POST_DELETE_FINALIZER: &str = "post-delete-finalizer.driftwatch.io";

/// Finished post-delete hooks must be cleaned up
pub const POST_DELETE_CLEANUP_FINALIZER: &str = "post-delete-finalizer.driftwatch.io/cleanup";

/// Check if the application has the given finalizer
pub fn has_finalizer(app: &Application, finalizer: &str) -> bool {
    app.finalizers().iter().any(|f| f == finalizer)
}

/// Deleting the application deletes its resources
pub fn cascaded_deletion(app: &Application) -> bool {
    has_finalizer(app, RESOURCES_FINALIZER) || has_finalizer(app, BACKGROUND_RESOURCES_FINALIZER)
}

/// Propagation used when deleting the application's resources
pub fn propagation_policy(app: &Application) -> PropagationPolicy {
    if has_finalizer(app, BACKGROUND_RESOURCES_FINALIZER) {
        PropagationPolicy::Background
    } else {
        PropagationPolicy::Foreground
    }
}

/// Finalizers of `app` with `finalizer` removed
pub fn without(app: &Application, finalizer: &str) -> Vec<String> {
    app.finalizers()
        .iter()
        .filter(|f| f.as_str() != finalizer)
        .cloned()
        .collect()
}

/// Finalizers of `app` with `finalizer` appended when missing
pub fn with(app: &Application, finalizer: &str) -> Vec<String> {
    let mut finalizers: Vec<String> = app.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == finalizer) {
        finalizers.push(finalizer.to_string());
    }
    finalizers
}

/// Merge patch replacing the finalizer list
pub fn finalizers_patch(finalizers: &[String]) -> Value {
    json!({
        "metadata": {
            "finalizers": finalizers
        }
    })
}

/// Finalizers matching whether the application renders post-delete hooks.
///
/// Returns `None` when nothing changes.
pub fn reconcile_post_delete_finalizers(app: &Application, has_hooks: bool) -> Option<Vec<String>> {
    let has_main = has_finalizer(app, POST_DELETE_FINALIZER);
    let has_cleanup = has_finalizer(app, POST_DELETE_CLEANUP_FINALIZER);
    if has_hooks == has_main && has_hooks == has_cleanup {
        return None;
    }
    let mut finalizers: Vec<String> = app
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != POST_DELETE_FINALIZER && f.as_str() != POST_DELETE_CLEANUP_FINALIZER)
        .cloned()
        .collect();
    if has_hooks {
        finalizers.push(POST_DELETE_FINALIZER.to_string());
        finalizers.push(POST_DELETE_CLEANUP_FINALIZER.to_string());
    }
    Some(finalizers)
}

/// Check if the project carries the finalizer guarding referenced projects
pub fn project_has_finalizer(project: &AppProject) -> bool {
    project.finalizers().iter().any(|f| f == RESOURCES_FINALIZER)
}

/// Finalizers of the project without the resources finalizer
pub fn project_without_finalizer(project: &AppProject) -> Vec<String> {
    project
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != RESOURCES_FINALIZER)
        .cloned()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ApplicationSpec;

    fn app(finalizers: &[&str]) -> Application {
        let mut app = Application::new("guestbook", ApplicationSpec::default());
        app.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        app
    }

    #[test]
    fn test_cascade_and_propagation() {
        assert!(!cascaded_deletion(&app(&[])));
        assert!(cascaded_deletion(&app(&[RESOURCES_FINALIZER])));
        assert_eq!(
            propagation_policy(&app(&[RESOURCES_FINALIZER])),
            PropagationPolicy::Foreground
        );
        assert_eq!(
            propagation_policy(&app(&[BACKGROUND_RESOURCES_FINALIZER])),
            PropagationPolicy::Background
        );
    }

    #[test]
    fn test_without_keeps_foreign_finalizers() {
        let app = app(&["example.com/audit", RESOURCES_FINALIZER]);
        assert_eq!(without(&app, RESOURCES_FINALIZER), vec!["example.com/audit"]);
        assert_eq!(
            finalizers_patch(&without(&app, RESOURCES_FINALIZER)),
            json!({"metadata": {"finalizers": ["example.com/audit"]}})
        );
    }

    #[test]
    fn test_with_is_idempotent() {
        let app = app(&[RESOURCES_FINALIZER]);
        assert_eq!(with(&app, RESOURCES_FINALIZER), vec![RESOURCES_FINALIZER]);
        assert_eq!(with(&app, POST_DELETE_FINALIZER).len(), 2);
    }

    #[test]
    fn test_post_delete_finalizers_follow_hooks() {
        let plain = app(&[RESOURCES_FINALIZER]);
        assert_eq!(reconcile_post_delete_finalizers(&plain, false), None);
        assert_eq!(
            reconcile_post_delete_finalizers(&plain, true),
            Some(vec![
                RESOURCES_FINALIZER.to_string(),
                POST_DELETE_FINALIZER.to_string(),
                POST_DELETE_CLEANUP_FINALIZER.to_string(),
            ])
        );

        let hooked = app(&[RESOURCES_FINALIZER, POST_DELETE_FINALIZER, POST_DELETE_CLEANUP_FINALIZER]);
        assert_eq!(reconcile_post_delete_finalizers(&hooked, true), None);
        assert_eq!(
            reconcile_post_delete_finalizers(&hooked, false),
            Some(vec![RESOURCES_FINALIZER.to_string()])
        );
    }
}
