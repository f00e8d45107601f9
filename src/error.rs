//! Error types for the driftwatch controller

use thiserror::Error;

/// Result type alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors produced while reconciling applications
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Finalizer error: {0}")]
    FinalizerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("Repository unavailable: {0}")]
    RepoUnavailable(String),

    #[error("Invalid manifests: {0}")]
    ManifestError(String),

    #[error("Cluster {server} unavailable: {message}")]
    ClusterUnavailable { server: String, message: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Sync error: {0}")]
    SyncError(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Build a not-found error for the given kind and name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Whether the error is transient and the work item should be retried soon
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::KubeError(kube::Error::Api(resp)) => {
                matches!(resp.code, 409 | 429 | 500 | 503 | 504)
                    || is_retryable_message(&resp.message)
            }
            // transport level failures
            Error::KubeError(_) => true,
            Error::HttpError(_) | Error::RepoUnavailable(_) | Error::ClusterUnavailable { .. } => {
                true
            }
            Error::SyncError(msg) => is_retryable_message(msg),
            _ => false,
        }
    }

    /// Whether the error means the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Short label used for error metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Error::KubeError(_) => "kube",
            Error::FinalizerError(_) => "finalizer",
            Error::ConfigError(_) => "config",
            Error::ValidationError(_) => "validation",
            Error::HttpError(_) => "http",
            Error::SerializationError(_) | Error::YamlError(_) => "serialization",
            Error::NotFound { .. } => "not_found",
            Error::RepoUnavailable(_) => "repo",
            Error::ManifestError(_) => "manifest",
            Error::ClusterUnavailable { .. } => "cluster",
            Error::PermissionDenied(_) => "permission",
            Error::SyncError(_) => "sync",
            Error::Cancelled => "cancelled",
        }
    }
}

/// Message fragments of API server failures that go away on their own
const RETRYABLE_FRAGMENTS: &[&str] = &[
    "too many requests",
    "timeout",
    "service unavailable",
    "exceeded quota",
    "the object has been modified",
    "goaway",
    "connection reset by peer",
    "tls handshake timeout",
    "i/o timeout",
    "internal error",
];

/// Classify a raw error message as transient
pub fn is_retryable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    RETRYABLE_FRAGMENTS.iter().any(|f| lower.contains(f))
}
