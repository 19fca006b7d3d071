//! Pipeline error taxonomy.
//!
//! Everything here is raised before a verdict is reached, except
//! `Promotion`, which only surfaces under the fail-closed policy. A
//! failed test run is not an error; it is a `tests_failed` result.

use kiln_cluster::ClusterError;
use kiln_core::UserIdError;
use thiserror::Error;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Namespace or test environment could not be created.
    #[error("provisioning {resource} failed: {source}")]
    Provisioning {
        resource: String,
        #[source]
        source: ClusterError,
    },

    #[error("environment {environment} not ready after {attempts} attempts")]
    ReadinessTimeout { environment: String, attempts: u32 },

    #[error("code injection into {environment} failed: {source}")]
    Injection {
        environment: String,
        #[source]
        source: ClusterError,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(#[from] UserIdError),

    #[error("deployment cancelled")]
    Cancelled,

    #[error("promotion failed: {}", summarize(.failures))]
    Promotion { failures: Vec<PromotionError> },

    #[error("unexpected failure during {step}: {source}")]
    Unexpected {
        step: &'static str,
        #[source]
        source: ClusterError,
    },
}

impl PipelineError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }
}

/// A failed operation on one production resource.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PromotionError {
    #[error("delete {name}: {source}")]
    Delete {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("create {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: ClusterError,
    },
}

impl PromotionError {
    pub fn resource(&self) -> &str {
        match self {
            PromotionError::Delete { name, .. } | PromotionError::Create { name, .. } => name,
        }
    }
}

fn summarize(failures: &[PromotionError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_names_environment() {
        let err = PipelineError::ReadinessTimeout {
            environment: "alice-test".to_string(),
            attempts: 60,
        };
        assert_eq!(err.to_string(), "environment alice-test not ready after 60 attempts");
    }

    #[test]
    fn promotion_lists_every_failure() {
        let err = PipelineError::Promotion {
            failures: vec![
                PromotionError::Delete {
                    name: "a-prod".to_string(),
                    source: ClusterError::Api("forbidden".to_string()),
                },
                PromotionError::Create {
                    name: "a-prod-db".to_string(),
                    source: ClusterError::Api("quota".to_string()),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("delete a-prod: cluster API error: forbidden"));
        assert!(text.contains("create a-prod-db: cluster API error: quota"));
    }

    #[test]
    fn injection_keeps_diagnostic() {
        let err = PipelineError::Injection {
            environment: "a-test".to_string(),
            source: ClusterError::Exec {
                pod: "a-test".to_string(),
                diagnostic: "container not found".to_string(),
            },
        };
        assert!(err.to_string().contains("container not found"));
    }
}
