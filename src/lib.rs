//! driftwatch: a GitOps reconciliation controller for Kubernetes
//!
//! The controller watches `Application` resources, compares the manifests
//! rendered from a Git revision with the live state of the destination
//! cluster, and syncs the two when asked to or when automated sync is on.

pub mod clients;
pub mod controller;
pub mod crd;
pub mod error;
pub mod resource;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
