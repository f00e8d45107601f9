//! Controller module for Application reconciliation
//!
//! This module contains the queue driven controller loop, the comparison of
//! desired and live state, the sync engine and cascaded deletion.

pub mod appcontroller;
#[cfg(test)]
mod appcontroller_test;
pub mod autosync;
pub mod cache;
pub mod conditions;
mod deletion;
pub mod diff;
pub mod finalizers;
pub mod health;
#[cfg(test)]
mod health_test;
#[cfg(feature = "metrics")]
pub mod metrics;
mod project_cache;
pub mod queue;
pub mod refresh;
pub mod sharding;
pub mod state;
#[cfg(test)]
mod state_test;
pub mod sync;
pub mod tree;

pub use appcontroller::{ApplicationController, ControllerConfig};
pub use cache::{CacheEvent, ClusterTaintManager, LiveStateCache};
pub use deletion::finalize_application_deletion;
pub use project_cache::ProjectCache;
pub use queue::WorkQueue;
pub use sharding::{ClusterSharding, ShardingAlgorithm};
pub use state::{AppStateManager, ComparisonResult};
