//! Shared types used across Kiln crates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of the user who owns a submission (and its environments).
pub type UserId = String;

// ── Requests and results ──────────────────────────────────────────

/// A single code submission. Lives for the duration of one pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeploymentRequest {
    pub user_id: UserId,
    pub code: String,
}

impl DeploymentRequest {
    pub fn new(user_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            code: code.into(),
        }
    }
}

/// Outcome of a pipeline run that reached a verdict.
///
/// Failures before the verdict are reported as errors by the pipeline,
/// so `Error` only appears when a transport adapter renders one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Deployed,
    TestsFailed,
    Error,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Deployed => "deployed",
            DeploymentStatus::TestsFailed => "tests_failed",
            DeploymentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result returned to the caller. Never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeploymentResult {
    pub status: DeploymentStatus,
    pub namespace: String,
}

impl DeploymentResult {
    pub fn deployed(namespace: &str) -> Self {
        Self {
            status: DeploymentStatus::Deployed,
            namespace: namespace.to_string(),
        }
    }

    pub fn tests_failed(namespace: &str) -> Self {
        Self {
            status: DeploymentStatus::TestsFailed,
            namespace: namespace.to_string(),
        }
    }
}

// ── Environment status ────────────────────────────────────────────

/// Lifecycle phase of a test environment as reported by the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl EnvironmentPhase {
    /// Map a cluster-reported phase string onto a phase.
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => EnvironmentPhase::Pending,
            "Running" => EnvironmentPhase::Running,
            "Succeeded" => EnvironmentPhase::Succeeded,
            "Failed" => EnvironmentPhase::Failed,
            _ => EnvironmentPhase::Unknown,
        }
    }
}

/// Point-in-time status of a test environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentStatus {
    pub phase: EnvironmentPhase,
    /// One readiness flag per container.
    pub container_ready: Vec<bool>,
}

impl EnvironmentStatus {
    pub fn new(phase: EnvironmentPhase, container_ready: Vec<bool>) -> Self {
        Self {
            phase,
            container_ready,
        }
    }

    /// Running with every container reporting ready.
    ///
    /// An empty readiness list counts as ready, matching how the cluster
    /// reports a running pod before container statuses are populated.
    pub fn is_ready(&self) -> bool {
        self.phase == EnvironmentPhase::Running && self.container_ready.iter().all(|r| *r)
    }
}

// ── Audit ─────────────────────────────────────────────────────────

/// Severity attached to an audit record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

/// A structured business event. Write-only from the pipeline's view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditRecord {
    pub namespace: Option<String>,
    pub user: String,
    pub message: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(namespace: Option<&str>, user: &str, message: impl Into<String>, severity: Severity) -> Self {
        Self {
            namespace: namespace.map(str::to_string),
            user: user.to_string(),
            message: message.into(),
            severity,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_serializes_wire_shape() {
        let json = serde_json::to_string(&DeploymentResult::deployed("user-test")).unwrap();
        assert_eq!(json, r#"{"status":"deployed","namespace":"user-test"}"#);

        let json = serde_json::to_string(&DeploymentResult::tests_failed("ns")).unwrap();
        assert!(json.contains(r#""status":"tests_failed""#));
    }

    #[test]
    fn ready_requires_running_and_all_containers() {
        assert!(EnvironmentStatus::new(EnvironmentPhase::Running, vec![true, true]).is_ready());
        assert!(EnvironmentStatus::new(EnvironmentPhase::Running, vec![]).is_ready());
        assert!(!EnvironmentStatus::new(EnvironmentPhase::Running, vec![true, false]).is_ready());
        assert!(!EnvironmentStatus::new(EnvironmentPhase::Pending, vec![true]).is_ready());
    }

    #[test]
    fn phase_parse_falls_back_to_unknown() {
        assert_eq!(EnvironmentPhase::parse("Running"), EnvironmentPhase::Running);
        assert_eq!(EnvironmentPhase::parse("CrashLoopBackOff"), EnvironmentPhase::Unknown);
    }

    #[test]
    fn severity_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Severity::Error).unwrap(), r#""ERROR""#);
        assert_eq!(Severity::Warning.as_str(), "WARNING");
    }
}
