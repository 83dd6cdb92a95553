//! Error types for the keel control plane

use thiserror::Error;

/// Main error type for keel operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration or malformed join token. Fatal, never retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// A network peer (join endpoint, lease store) was unreachable.
    /// Retried within the caller's policy.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A supervised process exhausted its restart budget.
    #[error("supervision exhausted for {name} after {restarts} restarts")]
    SupervisionExhausted {
        /// Name of the supervised process
        name: String,
        /// Restarts performed before giving up
        restarts: u32,
    },

    /// Certificate issuance or parsing failure. Fatal for the
    /// requesting component's Init.
    #[error("certificate error: {0}")]
    Certificate(#[from] crate::pki::PkiError),

    /// An operation was attempted in a lifecycle state that forbids it
    /// (e.g. registering a component after the manager started).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// One or more components failed to stop. Stop is best-effort, so
    /// individual failures are collected rather than short-circuited.
    #[error("failed to stop components: {}", failures.join("; "))]
    Stop {
        /// Per-component failure descriptions
        failures: Vec<String>,
    },

    /// Filesystem error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a transient network error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::TransientNetwork(msg.into())
    }

    /// Create an invalid-state error with the given message
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Whether this error may resolve on its own and is worth retrying
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}
