//! Audit error types.

use thiserror::Error;

/// Errors raised by audit sink backends.
///
/// These never escape an [`Auditor`](crate::Auditor); they are logged there.
#[derive(Debug, Error)]
pub enum AuditError {
    #[error("audit backend unavailable at {url} after {attempts} attempts")]
    Unavailable { url: String, attempts: u32 },

    #[error("invalid audit endpoint: {0}")]
    InvalidEndpoint(#[from] url::ParseError),

    #[error("unsupported audit endpoint scheme {0:?} (only http is supported)")]
    UnsupportedEndpoint(String),

    #[error("audit request failed: {0}")]
    Request(String),

    #[error("audit request timed out")]
    Timeout,

    #[error("audit backend rejected record with status {0}")]
    Rejected(u16),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("audit store error: {0}")]
    Store(#[from] kiln_state::StateError),
}
