//! Prometheus metrics for the driftwatch controller
//!
//! # Exported metrics
//! The `/metrics` endpoint (when built with `--features metrics`) exports the following metrics:
//! - `driftwatch_app_reconcile_seconds` (histogram): application refresh duration labeled by namespace and destination server.
//! - `driftwatch_app_sync_total` (counter): completed sync operations labeled by namespace/name/project/phase.
//! - `driftwatch_app_k8s_request_total` (counter): API requests issued against destination clusters.
//! - `driftwatch_cluster_events_total` (counter): watch events processed per cluster and group/kind.
//! - `driftwatch_workqueue_depth` (gauge): keys waiting in each work queue.
//! - `driftwatch_reconcile_errors_total` (counter): failed queue items labeled by queue and error kind.
//! - `driftwatch_cluster_cache_age_seconds` (gauge): time since the last full sync of a cluster cache.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub namespace: String,
    pub dest_server: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct SyncLabels {
    pub namespace: String,
    pub name: String,
    pub project: String,
    pub phase: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RequestLabels {
    pub server: String,
    pub verb: String,
    pub kind: String,
    pub status: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterEventLabels {
    pub server: String,
    pub group_kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct QueueLabels {
    pub queue: String,
}

/// Labels for controller error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Queue the failing item came from, e.g. "app_operation_processing_queue"
    pub queue: String,
    /// Error kind/category, e.g. "kube", "validation", "unknown"
    pub kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ClusterLabels {
    pub server: String,
}

/// Histogram tracking refresh duration (seconds)
pub static RECONCILE_DURATION_SECONDS: Lazy<Family<ReconcileLabels, Histogram>> = Lazy::new(|| {
    fn reconcile_histogram() -> Histogram {
        // 10ms .. ~330s across 16 buckets.
        Histogram::new(exponential_buckets(0.01, 2.0, 16))
    }

    Family::new_with_constructor(reconcile_histogram)
});

pub static SYNC_TOTAL: Lazy<Family<SyncLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static K8S_REQUEST_TOTAL: Lazy<Family<RequestLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLUSTER_EVENTS_TOTAL: Lazy<Family<ClusterEventLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static QUEUE_DEPTH: Lazy<Family<QueueLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

/// Counter tracking failed queue items
pub static RECONCILE_ERRORS_TOTAL: Lazy<Family<ErrorLabels, Counter<u64, AtomicU64>>> =
    Lazy::new(Family::default);

pub static CLUSTER_CACHE_AGE_SECONDS: Lazy<Family<ClusterLabels, Gauge<i64, AtomicI64>>> =
    Lazy::new(Family::default);

pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let mut registry = Registry::default();

    registry.register(
        "driftwatch_app_reconcile_seconds",
        "Application refresh duration in seconds",
        RECONCILE_DURATION_SECONDS.clone(),
    );
    registry.register(
        "driftwatch_app_sync_total",
        "Number of completed sync operations",
        SYNC_TOTAL.clone(),
    );
    registry.register(
        "driftwatch_app_k8s_request_total",
        "Number of kubernetes requests executed against destination clusters",
        K8S_REQUEST_TOTAL.clone(),
    );
    registry.register(
        "driftwatch_cluster_events_total",
        "Number of processed cluster watch events",
        CLUSTER_EVENTS_TOTAL.clone(),
    );
    registry.register(
        "driftwatch_workqueue_depth",
        "Number of keys waiting in a work queue",
        QUEUE_DEPTH.clone(),
    );
    registry.register(
        "driftwatch_reconcile_errors_total",
        "Total number of failed queue items",
        RECONCILE_ERRORS_TOTAL.clone(),
    );
    registry.register(
        "driftwatch_cluster_cache_age_seconds",
        "Seconds since the cluster cache was last fully synced",
        CLUSTER_CACHE_AGE_SECONDS.clone(),
    );

    registry
});

/// Observe a refresh duration in seconds.
pub fn observe_reconcile_duration_seconds(namespace: &str, dest_server: &str, seconds: f64) {
    let labels = ReconcileLabels {
        namespace: namespace.to_string(),
        dest_server: dest_server.to_string(),
    };
    RECONCILE_DURATION_SECONDS
        .get_or_create(&labels)
        .observe(seconds);
}

/// Count a completed sync operation.
pub fn inc_sync(namespace: &str, name: &str, project: &str, phase: &str) {
    let labels = SyncLabels {
        namespace: namespace.to_string(),
        name: name.to_string(),
        project: project.to_string(),
        phase: phase.to_string(),
    };
    SYNC_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_k8s_request(server: &str, verb: &str, kind: &str, status: &str) {
    let labels = RequestLabels {
        server: server.to_string(),
        verb: verb.to_string(),
        kind: kind.to_string(),
        status: status.to_string(),
    };
    K8S_REQUEST_TOTAL.get_or_create(&labels).inc();
}

pub fn inc_cluster_event(server: &str, group_kind: &str) {
    let labels = ClusterEventLabels {
        server: server.to_string(),
        group_kind: group_kind.to_string(),
    };
    CLUSTER_EVENTS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_queue_depth(queue: &str, depth: i64) {
    let labels = QueueLabels {
        queue: queue.to_string(),
    };
    QUEUE_DEPTH.get_or_create(&labels).set(depth);
}

/// Increment the reconcile error counter.
pub fn inc_reconcile_error(queue: &str, kind: &str) {
    let labels = ErrorLabels {
        queue: queue.to_string(),
        kind: kind.to_string(),
    };
    RECONCILE_ERRORS_TOTAL.get_or_create(&labels).inc();
}

pub fn set_cluster_cache_age(server: &str, seconds: i64) {
    let labels = ClusterLabels {
        server: server.to_string(),
    };
    CLUSTER_CACHE_AGE_SECONDS.get_or_create(&labels).set(seconds);
}
