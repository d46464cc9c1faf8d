//! Error types for the controller.
//!
//! Defines custom error types with classification for retry behavior.
//! Nothing here is fatal to the process: the controller runs indefinitely
//! and heals on a later sync.

use std::time::Duration;
use thiserror::Error;

use crate::state::GroupResource;

/// Error type for controller operations
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// Optimistic-concurrency conflict on a secret update. Retried
    /// internally, never surfaced to the operator status.
    #[error("conflict updating {0}")]
    Conflict(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A key-secret that does not parse into a key state
    #[error("invalid key secret: {0}")]
    InvalidKeySecret(String),

    /// A deployed encryption-config secret that does not parse
    #[error("invalid encryption config: {0}")]
    InvalidEncryptionConfig(String),

    /// A migration run reported a terminal failure for one resource
    #[error("migration of {gr} failed: {message}")]
    Migration { gr: GroupResource, message: String },

    /// Several per-resource errors from one sync
    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),
}

fn format_aggregate(errors: &[Error]) -> String {
    let parts: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
    parts.join("; ")
}

impl Error {
    /// Collapse per-resource errors into a single value: none, the sole
    /// error, or an aggregate.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// Check if this error indicates a not-found condition
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(e)) if e.code == 404)
    }

    /// Check if this error is an optimistic-concurrency conflict
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::Kube(kube::Error::Api(e)) => e.code == 409,
            _ => false,
        }
    }

    /// Check if this error should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube(e) => {
                // Retry on network errors, rate limiting, and server errors
                matches!(
                    e,
                    kube::Error::Api(api_err) if api_err.code >= 500 || api_err.code == 429 || api_err.code == 409
                ) || matches!(e, kube::Error::Service(_))
            }
            Error::Conflict(_) => true,
            Error::Migration { .. } | Error::Aggregate(_) => true,
            Error::Serialization(_)
            | Error::InvalidKeySecret(_)
            | Error::InvalidEncryptionConfig(_) => false,
        }
    }

    /// Get the recommended requeue duration for this error
    pub fn requeue_after(&self) -> Duration {
        if self.is_retryable() {
            Duration::from_secs(30)
        } else {
            Duration::from_secs(300)
        }
    }
}

/// Result type alias for controller operations
pub type Result<T> = std::result::Result<T, Error>;
