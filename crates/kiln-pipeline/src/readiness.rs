//! Readiness poller — bounded wait for a test environment.
//!
//! The poller queries the environment up to `attempts` times, `interval`
//! apart. Status query failures count as attempts but are never fatal on
//! their own. An environment that never reports ready (a crash loop, a
//! stuck image pull) ends in `TimedOut`.

use std::time::Duration;

use kiln_cluster::ClusterOrchestrator;
use kiln_core::{EnvironmentStatus, ResourceNames};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel;
use crate::error::{PipelineError, PipelineResult};

/// Poller state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// `attempt` queries made so far without success.
    Waiting { attempt: u32 },
    Ready { attempts: u32 },
    TimedOut { attempts: u32 },
}

impl ReadinessState {
    /// Fold one observation into the state. `ready` is `None` when the
    /// status query failed.
    pub fn observe(self, ready: Option<bool>, limit: u32) -> Self {
        let ReadinessState::Waiting { attempt } = self else {
            return self;
        };
        let attempt = attempt + 1;
        if ready == Some(true) {
            ReadinessState::Ready { attempts: attempt }
        } else if attempt >= limit {
            ReadinessState::TimedOut { attempts: attempt }
        } else {
            ReadinessState::Waiting { attempt }
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReadinessState::Waiting { .. })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadinessPoller {
    attempts: u32,
    interval: Duration,
}

impl ReadinessPoller {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Wait until the user's environment is running with every container
    /// ready. Returns the number of queries it took.
    pub async fn wait(
        &self,
        cluster: &dyn ClusterOrchestrator,
        namespace: &str,
        user_id: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<u32> {
        let environment = ResourceNames::for_user(user_id).test_environment;
        let mut state = ReadinessState::Waiting { attempt: 0 };

        loop {
            let status = cancel::guard(cancel, cluster.environment_status(namespace, user_id)).await?;
            let ready = match &status {
                Ok(status) => {
                    log_status(&environment, status);
                    Some(status.is_ready())
                }
                Err(e) => {
                    warn!(%environment, error = %e, "environment status query failed");
                    None
                }
            };

            state = state.observe(ready, self.attempts);
            match state {
                ReadinessState::Ready { attempts } => {
                    info!(%environment, attempts, "environment ready");
                    return Ok(attempts);
                }
                ReadinessState::TimedOut { attempts } => {
                    warn!(%environment, attempts, "environment never became ready");
                    return Err(PipelineError::ReadinessTimeout {
                        environment,
                        attempts,
                    });
                }
                ReadinessState::Waiting { .. } => {
                    cancel::sleep(cancel, self.interval).await?;
                }
            }
        }
    }
}

fn log_status(environment: &str, status: &EnvironmentStatus) {
    debug!(
        %environment,
        phase = ?status.phase,
        containers = status.container_ready.len(),
        ready = status.container_ready.iter().filter(|r| **r).count(),
        "environment status"
    );
}
