//! Promotion executor — replaces a user's production pair.
//!
//! Each resource is deleted (a missing resource is fine) and then
//! created fresh from its template, application first. Failures on
//! either step are logged, audited and collected; they never stop the
//! remaining steps. The caller decides what the collected failures mean
//! for the run's status.
//!
//! Cancellation is honoured only before the first delete. Once the pair
//! starts changing it is replaced to the end, so a resource is never
//! left deleted without its create having been attempted.

use kiln_audit::Auditor;
use kiln_cluster::{ClusterOrchestrator, ProductionTemplates, WorkloadSpec};
use kiln_core::Severity;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, PipelineResult, PromotionError};

/// What a promotion did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PromotionReport {
    /// Resources created, in order.
    pub created: Vec<String>,
    pub failures: Vec<PromotionError>,
}

impl PromotionReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct PromotionExecutor {
    templates: ProductionTemplates,
}

impl PromotionExecutor {
    pub fn new(templates: ProductionTemplates) -> Self {
        Self { templates }
    }

    /// Replace the production pair for `user_id` with one running `code`.
    ///
    /// Only cancellation is returned as an error, and only when the
    /// token is already cancelled on entry; no cluster call is made then.
    pub async fn promote(
        &self,
        cluster: &dyn ClusterOrchestrator,
        auditor: &Auditor,
        namespace: &str,
        user_id: &str,
        code: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<PromotionReport> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let mut report = PromotionReport::default();

        for spec in self.templates.pair(user_id, code) {
            let (created, failures) = self.replace(cluster, namespace, &spec).await;
            for failure in failures {
                warn!(
                    %namespace,
                    user = %user_id,
                    resource = %failure.resource(),
                    error = %failure,
                    "promotion step failed"
                );
                let severity = match failure {
                    PromotionError::Delete { .. } => Severity::Warning,
                    PromotionError::Create { .. } => Severity::Error,
                };
                auditor
                    .record(
                        Some(namespace),
                        user_id,
                        format!("Production deployment failed: {failure}"),
                        severity,
                    )
                    .await;
                report.failures.push(failure);
            }
            if created {
                report.created.push(spec.name);
            }
        }

        if report.is_clean() {
            info!(%namespace, user = %user_id, "production pair replaced");
        }
        Ok(report)
    }

    /// Delete then create one resource. Returns whether the create
    /// succeeded and every step that failed.
    async fn replace(
        &self,
        cluster: &dyn ClusterOrchestrator,
        namespace: &str,
        spec: &WorkloadSpec,
    ) -> (bool, Vec<PromotionError>) {
        let name = &spec.name;
        let mut failures = Vec::new();

        match cluster.delete_workload(namespace, name).await {
            Ok(()) => {
                debug!(%namespace, %name, role = spec.role.as_str(), "previous resource deleted");
            }
            Err(e) if e.is_not_found() => {
                debug!(%namespace, %name, "no previous resource");
            }
            Err(source) => failures.push(PromotionError::Delete {
                name: name.clone(),
                source,
            }),
        }

        let created = match cluster.create_workload(namespace, spec).await {
            Ok(()) => {
                debug!(%namespace, %name, image = %spec.image, "resource created");
                true
            }
            Err(source) => {
                failures.push(PromotionError::Create {
                    name: name.clone(),
                    source,
                });
                false
            }
        };
        (created, failures)
    }
}
