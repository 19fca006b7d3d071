//! Cluster orchestration errors.

use thiserror::Error;

pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors raised by a [`ClusterOrchestrator`](crate::ClusterOrchestrator).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} {name} not found in namespace {namespace}")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("{kind} {name} already exists in namespace {namespace}")]
    AlreadyExists {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    /// Writing into an environment failed; carries the transport's stderr.
    #[error("exec into {pod} failed: {diagnostic}")]
    Exec { pod: String, diagnostic: String },

    #[error("cluster API error: {0}")]
    Api(String),

    #[error("cluster client configuration error: {0}")]
    Config(String),

    #[error("timed out waiting for {0}")]
    Timeout(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }
}
