//! The capability set the pipeline consumes.

use async_trait::async_trait;
use kiln_core::EnvironmentStatus;

use crate::error::ClusterResult;
use crate::template::WorkloadSpec;

/// Creates, inspects and mutates the cluster resources owned by users.
///
/// Implementations are shared between concurrent pipeline runs and must
/// be internally synchronized. No state is cached between calls.
#[async_trait]
pub trait ClusterOrchestrator: Send + Sync {
    /// Create the namespace if it does not exist.
    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<()>;

    /// Create the user's test environment if it does not exist.
    async fn ensure_test_environment(&self, namespace: &str, user_id: &str) -> ClusterResult<()>;

    /// Current phase and container readiness of the test environment.
    async fn environment_status(
        &self,
        namespace: &str,
        user_id: &str,
    ) -> ClusterResult<EnvironmentStatus>;

    /// Overwrite the environment's working payload with `code`.
    async fn inject_payload(&self, namespace: &str, user_id: &str, code: &str) -> ClusterResult<()>;

    /// Raw log text of the test environment.
    async fn fetch_logs(&self, namespace: &str, user_id: &str) -> ClusterResult<String>;

    /// Delete a production workload. Missing workloads yield `NotFound`.
    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()>;

    /// Create a production workload. Existing workloads yield `AlreadyExists`.
    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ClusterResult<()>;
}
