//! In-memory mirror of live cluster state
//!
//! Each destination cluster gets a `ClusterCache` holding an arena graph of
//! every watched resource. Changes to resources tracked by an application
//! are reported to the scheduler as `CacheEvent`s.

mod cluster;
mod graph;
mod live_state;
mod taint;


pub use cluster::{gvk_key, ClusterCache, ClusterInfo};
pub use graph::{manifest_hash, OwnerRef, ResourceGraph, ResourceNode};
pub use live_state::{LiveStateCache, DEFAULT_CLUSTER_RESYNC_HOURS};
pub use taint::{ClusterTaintManager, TAINT_EXPIRY_MINUTES};

use crate::resource::ResourceKey;

/// Notification from a cluster cache to the scheduler
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    ResourceUpdated {
        server: String,
        key: ResourceKey,
        /// Instance names of the applications owning the resource before and after
        apps: Vec<String>,
        /// The resource itself is tracked, not only one of its ancestors
        managed: bool,
    },
}
