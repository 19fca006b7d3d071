//! The audit capability handed to the pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use kiln_core::{AuditRecord, Severity};
use tracing::{debug, warn};

use crate::error::AuditError;

/// A backend that stores audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Short backend name for log lines.
    fn name(&self) -> &'static str;

    /// Store one record.
    async fn record(&self, record: &AuditRecord) -> Result<(), AuditError>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Reported by [`Auditor::readiness`] for health endpoints.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum AuditReadiness {
    Disabled,
    Ready { backend: &'static str },
    Unreachable { backend: &'static str, error: String },
}

#[derive(Clone)]
enum Backend {
    Disabled,
    Enabled(Arc<dyn AuditSink>),
}

/// Cloneable audit handle. Recording never fails from the caller's view.
#[derive(Clone)]
pub struct Auditor {
    backend: Backend,
}

impl Default for Auditor {
    fn default() -> Self {
        Self::disabled()
    }
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("backend", &self.backend_name())
            .finish()
    }
}

impl Auditor {
    /// An auditor that drops every record.
    pub fn disabled() -> Self {
        Self {
            backend: Backend::Disabled,
        }
    }

    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            backend: Backend::Enabled(sink),
        }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.backend, Backend::Enabled(_))
    }

    pub fn backend_name(&self) -> &'static str {
        match &self.backend {
            Backend::Disabled => "disabled",
            Backend::Enabled(sink) => sink.name(),
        }
    }

    /// Record an event stamped with the current time.
    pub async fn record(
        &self,
        namespace: Option<&str>,
        user: &str,
        message: impl Into<String>,
        severity: Severity,
    ) {
        self.record_event(AuditRecord::new(namespace, user, message, severity))
            .await;
    }

    /// Record a prepared event.
    pub async fn record_event(&self, record: AuditRecord) {
        match &self.backend {
            Backend::Disabled => {
                debug!(user = %record.user, "audit disabled, skipping record");
            }
            Backend::Enabled(sink) => {
                if let Err(e) = sink.record(&record).await {
                    warn!(
                        backend = sink.name(),
                        user = %record.user,
                        error = %e,
                        "audit record dropped"
                    );
                }
            }
        }
    }

    pub async fn readiness(&self) -> AuditReadiness {
        match &self.backend {
            Backend::Disabled => AuditReadiness::Disabled,
            Backend::Enabled(sink) => match sink.ping().await {
                Ok(()) => AuditReadiness::Ready {
                    backend: sink.name(),
                },
                Err(e) => AuditReadiness::Unreachable {
                    backend: sink.name(),
                    error: e.to_string(),
                },
            },
        }
    }
}
