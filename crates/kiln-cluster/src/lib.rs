//! kiln-cluster — the cluster orchestration capability used by the pipeline.
//!
//! The pipeline never talks to a cluster API directly. It drives a
//! [`ClusterOrchestrator`], which has two implementations:
//!
//! - **`KubeOrchestrator`** — Kubernetes via `kube`; test environments are
//!   pods, production resources are Deployments, code injection goes
//!   through `kubectl exec`.
//! - **`SimulatedCluster`** — in-memory, scriptable; used by tests and for
//!   local development without a cluster.
//!
//! Resource names come from [`kiln_core::ResourceNames`], so every call is
//! keyed by `(namespace, user_id)` or `(namespace, workload name)`.

pub mod error;
pub mod kubernetes;
pub mod memory;
pub mod orchestrator;
pub mod template;

pub use error::{ClusterError, ClusterResult};
pub use kubernetes::{KubeOrchestrator, KubeSettings};
pub use memory::{EnvironmentBehavior, Operation, SimulatedCluster};
pub use orchestrator::ClusterOrchestrator;
pub use template::{ProductionTemplates, WorkloadRole, WorkloadSpec};
