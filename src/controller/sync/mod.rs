//! Sync engine
//!
//! Drives a sync operation towards completion one step at a time. Each step
//! is computed from the latest comparison and the per-resource results
//! recorded by earlier steps, so a restarted controller resumes where the
//! previous one stopped.

mod app;
pub mod context;
pub mod hooks;
pub mod retry;
pub mod tasks;
pub mod windows;


pub use app::push_history;
pub use context::{ManagedNamespace, SyncContext, SyncSettings, DEFAULT_WAVE_DELAY};
pub use hooks::{cleanup_post_delete_hooks, execute_post_delete_hooks};
pub use retry::{begin_retry, schedule_retry, Backoff, OperationStage};
pub use tasks::{sort_tasks, SyncTask};
pub use windows::sync_window_prevents_sync;

/// Environment variable overriding the delay between sync waves
pub const WAVE_DELAY_ENV: &str = "DRIFTWATCH_SYNC_WAVE_DELAY";

/// Delay between waves, from the environment when set. Accepts a bare
/// number of seconds or a duration such as `500ms`.
pub fn wave_delay_from_env() -> std::time::Duration {
    std::env::var(WAVE_DELAY_ENV)
        .ok()
        .and_then(|v| retry::parse_duration(&v).ok())
        .and_then(|d| d.to_std().ok())
        .unwrap_or(DEFAULT_WAVE_DELAY)
}
