//! Pipeline controller — runs one submission end to end.

use std::sync::Arc;

use kiln_audit::Auditor;
use kiln_cluster::{ClusterError, ClusterOrchestrator};
use kiln_core::{
    DeploymentRequest, DeploymentResult, PromotionPolicy, ResourceNames, Severity, validate_user_id,
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info, info_span, warn};

use crate::cancel;
use crate::error::{PipelineError, PipelineResult};
use crate::locks::UserLocks;
use crate::promotion::PromotionExecutor;
use crate::readiness::ReadinessPoller;
use crate::settings::PipelineSettings;
use crate::verdict::{Verdict, VerdictEvaluator};

/// Shared, cloneable pipeline. One instance serves every request.
#[derive(Clone)]
pub struct Pipeline {
    cluster: Arc<dyn ClusterOrchestrator>,
    auditor: Auditor,
    settings: Arc<PipelineSettings>,
    poller: ReadinessPoller,
    evaluator: Arc<VerdictEvaluator>,
    promotion: Arc<PromotionExecutor>,
    locks: UserLocks,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("auditor", &self.auditor)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn new(
        cluster: Arc<dyn ClusterOrchestrator>,
        auditor: Auditor,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            cluster,
            auditor,
            poller: ReadinessPoller::new(settings.poll_attempts, settings.poll_interval),
            evaluator: Arc::new(VerdictEvaluator::new(
                settings.sentinel.clone(),
                settings.failure_markers.clone(),
            )),
            promotion: Arc::new(PromotionExecutor::new(settings.templates.clone())),
            settings: Arc::new(settings),
            locks: UserLocks::new(),
        }
    }

    pub fn auditor(&self) -> &Auditor {
        &self.auditor
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    pub fn namespace_for(&self, user_id: &str) -> String {
        self.settings.namespace.namespace_for(user_id)
    }

    /// Run the full pipeline for one submission.
    ///
    /// Errors are only returned for failures before a verdict (and for
    /// promotion failures under the fail-closed policy). A failed test
    /// run is `Ok` with status `tests_failed`.
    pub async fn run(
        &self,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<DeploymentResult> {
        let user_id = request.user_id.as_str();
        if let Err(e) = validate_user_id(user_id) {
            warn!(user = %user_id, error = %e, "rejecting deployment request");
            self.auditor
                .record(None, user_id, format!("Deployment rejected: {e}"), Severity::Error)
                .await;
            return Err(e.into());
        }

        let namespace = self.namespace_for(user_id);
        let span = info_span!("deployment", user = %user_id, %namespace);
        async {
            let _guard = cancel::guard(cancel, self.locks.acquire(user_id)).await?;
            info!(code_bytes = request.code.len(), "deployment started");

            let logs = match self.prepare(&namespace, request, cancel).await {
                Ok(logs) => logs,
                Err(e) if e.is_cancelled() => {
                    warn!("deployment cancelled before verdict");
                    return Err(e);
                }
                Err(e) => {
                    error!(error = %e, "deployment failed");
                    self.auditor
                        .record(Some(&namespace), user_id, e.to_string(), Severity::Error)
                        .await;
                    return Err(e);
                }
            };

            match self.evaluator.evaluate(&logs) {
                Verdict::Fail { excerpt } => {
                    info!("tests failed");
                    cancel::guard(
                        cancel,
                        self.auditor.record(
                            Some(&namespace),
                            user_id,
                            format!("Test failed with logs: {excerpt}"),
                            Severity::Error,
                        ),
                    )
                    .await?;
                    Ok(DeploymentResult::tests_failed(&namespace))
                }
                Verdict::Pass => {
                    info!("tests passed, promoting");
                    self.promote(&namespace, request, cancel).await?;
                    Ok(DeploymentResult::deployed(&namespace))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Steps up to the verdict: provision, wait, inject, settle, read logs.
    async fn prepare(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let user_id = request.user_id.as_str();
        let environment = ResourceNames::for_user(user_id).test_environment;
        let cluster = self.cluster.as_ref();

        cancel::guard(cancel, cluster.ensure_namespace(namespace))
            .await?
            .map_err(|source| PipelineError::Provisioning {
                resource: format!("namespace {namespace}"),
                source,
            })?;

        cancel::guard(cancel, cluster.ensure_test_environment(namespace, user_id))
            .await?
            .map_err(|source| PipelineError::Provisioning {
                resource: format!("test environment {environment}"),
                source,
            })?;

        self.poller.wait(cluster, namespace, user_id, cancel).await?;

        cancel::guard(cancel, cluster.inject_payload(namespace, user_id, &request.code))
            .await?
            .map_err(|source| PipelineError::Injection {
                environment: environment.clone(),
                source,
            })?;
        info!(%environment, "code injected");

        cancel::sleep(cancel, self.settings.settle_delay).await?;

        cancel::guard(cancel, cluster.fetch_logs(namespace, user_id))
            .await?
            .map_err(|source: ClusterError| PipelineError::Unexpected {
                step: "fetch logs",
                source,
            })
    }

    /// Replace the production pair and apply the promotion policy.
    async fn promote(
        &self,
        namespace: &str,
        request: &DeploymentRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<()> {
        let report = self
            .promotion
            .promote(
                self.cluster.as_ref(),
                &self.auditor,
                namespace,
                &request.user_id,
                &request.code,
                cancel,
            )
            .await?;

        if report.is_clean() {
            info!("production deployed");
            return Ok(());
        }
        match self.settings.promotion_policy {
            PromotionPolicy::FailOpen => {
                warn!(
                    failures = report.failures.len(),
                    "production deployment failed, proceeding (fail-open)"
                );
                Ok(())
            }
            PromotionPolicy::FailClosed => Err(PipelineError::Promotion {
                failures: report.failures,
            }),
        }
    }
}
