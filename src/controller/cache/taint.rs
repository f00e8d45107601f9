//! Quarantine of API kinds whose list calls fail on a cluster

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

/// Taints are forgotten after this long so a stuck kind is retried
pub const TAINT_EXPIRY_MINUTES: i64 = 30;

/// Tainted kinds keyed by cluster server URL
pub struct ClusterTaintManager {
    taints: Mutex<HashMap<String, HashMap<String, DateTime<Utc>>>>,
    expiry: Duration,
}

impl Default for ClusterTaintManager {
    fn default() -> Self {
        Self::with_expiry(Duration::minutes(TAINT_EXPIRY_MINUTES))
    }
}

impl ClusterTaintManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_expiry(expiry: Duration) -> Self {
        Self {
            taints: Mutex::new(HashMap::new()),
            expiry,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<String, DateTime<Utc>>>> {
        self.taints
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn mark(&self, server: &str, gvk: &str) {
        self.mark_at(server, gvk, Utc::now());
    }

    pub fn mark_at(&self, server: &str, gvk: &str, at: DateTime<Utc>) {
        let mut taints = self.lock();
        let first = !taints
            .get(server)
            .map(|t| t.contains_key(gvk))
            .unwrap_or(false);
        taints
            .entry(server.to_string())
            .or_default()
            .insert(gvk.to_string(), at);
        if first {
            warn!(server = %server, gvk = %gvk, "Tainted resource kind after list failure");
        }
    }

    pub fn clear(&self, server: &str, gvk: &str) {
        let mut taints = self.lock();
        if let Some(cluster) = taints.get_mut(server) {
            if cluster.remove(gvk).is_some() {
                info!(server = %server, gvk = %gvk, "Resource kind recovered");
            }
            if cluster.is_empty() {
                taints.remove(server);
            }
        }
    }

    pub fn clear_cluster(&self, server: &str) {
        self.lock().remove(server);
    }

    /// Tainted kinds of a cluster that have not expired at `now`
    pub fn tainted_at(&self, server: &str, now: DateTime<Utc>) -> Vec<String> {
        let mut taints = self.lock();
        let Some(cluster) = taints.get_mut(server) else {
            return Vec::new();
        };
        cluster.retain(|_, at| *at + self.expiry > now);
        let mut gvks: Vec<String> = cluster.keys().cloned().collect();
        if cluster.is_empty() {
            taints.remove(server);
        }
        gvks.sort();
        gvks
    }

    pub fn tainted(&self, server: &str) -> Vec<String> {
        self.tainted_at(server, Utc::now())
    }

    pub fn is_tainted(&self, server: &str, gvk: &str) -> bool {
        self.tainted(server).iter().any(|g| g == gvk)
    }

    pub fn has_taints(&self, server: &str) -> bool {
        !self.tainted(server).is_empty()
    }
}
