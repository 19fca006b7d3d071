//! In-memory simulated cluster.
//!
//! Holds namespaces, test environments and production workloads in a
//! mutex-guarded map. Environments run a tiny simulated interpreter on
//! injection so logs look like the real test image's output: every run
//! starts with [`RUN_MARKER`], followed by printed lines or a traceback.
//!
//! Behavior is scriptable per user (slow start, crash loop) and every
//! capability can be made to fail a given number of times.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use kiln_core::{EnvironmentPhase, EnvironmentStatus, ResourceNames};
use tracing::debug;

use crate::error::{ClusterError, ClusterResult};
use crate::orchestrator::ClusterOrchestrator;
use crate::template::WorkloadSpec;

/// Line the test image prints before every execution of the payload.
pub const RUN_MARKER: &str = "Code updated, running...";

/// Orchestrator capability, used for fault injection and call counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    EnsureNamespace,
    EnsureEnvironment,
    Status,
    Inject,
    FetchLogs,
    DeleteWorkload,
    CreateWorkload,
}

/// How a user's test environment reports status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvironmentBehavior {
    /// Pending for the given number of status polls, then running and ready.
    ReadyAfter(u32),
    /// Running but its container never becomes ready.
    CrashLoop,
}

impl Default for EnvironmentBehavior {
    fn default() -> Self {
        Self::ReadyAfter(0)
    }
}

#[derive(Debug, Default)]
struct Environment {
    polls: u32,
    payload: Option<String>,
    log: String,
}

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    /// Keyed by (namespace, user_id).
    environments: HashMap<(String, String), Environment>,
    /// Keyed by (namespace, workload name).
    workloads: BTreeMap<(String, String), WorkloadSpec>,
    behaviors: HashMap<String, EnvironmentBehavior>,
    faults: HashMap<Operation, u32>,
    calls: HashMap<Operation, u32>,
}

impl State {
    /// Count the call and consume one pending fault, if any.
    fn enter(&mut self, op: Operation) -> bool {
        *self.calls.entry(op).or_default() += 1;
        match self.faults.get_mut(&op) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

/// A cluster that lives entirely in process memory.
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    state: Mutex<State>,
}

impl SimulatedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`set_behavior`](Self::set_behavior).
    pub fn with_behavior(self, user_id: &str, behavior: EnvironmentBehavior) -> Self {
        self.set_behavior(user_id, behavior);
        self
    }

    pub fn set_behavior(&self, user_id: &str, behavior: EnvironmentBehavior) {
        self.lock().behaviors.insert(user_id.to_string(), behavior);
    }

    /// Make the next `times` calls of `op` fail.
    pub fn fail(&self, op: Operation, times: u32) {
        self.lock().faults.insert(op, times);
    }

    /// Number of calls made to `op` so far.
    pub fn calls(&self, op: Operation) -> u32 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    pub fn environment_count(&self) -> usize {
        self.lock().environments.len()
    }

    /// Current payload of a user's test environment.
    pub fn payload(&self, namespace: &str, user_id: &str) -> Option<String> {
        self.lock()
            .environments
            .get(&(namespace.to_string(), user_id.to_string()))
            .and_then(|env| env.payload.clone())
    }

    /// Append raw text to an environment's log.
    pub fn append_log(&self, namespace: &str, user_id: &str, text: &str) {
        if let Some(env) = self
            .lock()
            .environments
            .get_mut(&(namespace.to_string(), user_id.to_string()))
        {
            env.log.push_str(text);
        }
    }

    /// All production workloads in a namespace, ordered by name.
    pub fn workloads(&self, namespace: &str) -> Vec<WorkloadSpec> {
        self.lock()
            .workloads
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn workload(&self, namespace: &str, name: &str) -> Option<WorkloadSpec> {
        self.lock()
            .workloads
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn fault(op: Operation, namespace: &str, subject: &str) -> ClusterError {
        match op {
            Operation::Inject => ClusterError::Exec {
                pod: subject.to_string(),
                diagnostic: "error: unable to upgrade connection: container not found".to_string(),
            },
            _ => ClusterError::Api(format!(
                "simulated {op:?} failure for {subject} in {namespace}"
            )),
        }
    }

    fn environment_not_found(namespace: &str, user_id: &str) -> ClusterError {
        ClusterError::NotFound {
            kind: "pod",
            name: ResourceNames::for_user(user_id).test_environment,
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl ClusterOrchestrator for SimulatedCluster {
    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::EnsureNamespace) {
            return Err(Self::fault(Operation::EnsureNamespace, namespace, namespace));
        }
        if state.namespaces.insert(namespace.to_string()) {
            debug!(%namespace, "simulated namespace created");
        }
        Ok(())
    }

    async fn ensure_test_environment(&self, namespace: &str, user_id: &str) -> ClusterResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::EnsureEnvironment) {
            return Err(Self::fault(Operation::EnsureEnvironment, namespace, user_id));
        }
        if !state.namespaces.contains(namespace) {
            return Err(ClusterError::NotFound {
                kind: "namespace",
                name: namespace.to_string(),
                namespace: namespace.to_string(),
            });
        }
        let key = (namespace.to_string(), user_id.to_string());
        if !state.environments.contains_key(&key) {
            state.environments.insert(
                key,
                Environment {
                    log: "Test environment started, waiting for code\n".to_string(),
                    ..Default::default()
                },
            );
            debug!(%namespace, %user_id, "simulated test environment created");
        }
        Ok(())
    }

    async fn environment_status(
        &self,
        namespace: &str,
        user_id: &str,
    ) -> ClusterResult<EnvironmentStatus> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::Status) {
            return Err(Self::fault(Operation::Status, namespace, user_id));
        }
        let behavior = state.behaviors.get(user_id).copied().unwrap_or_default();
        let env = state
            .environments
            .get_mut(&(namespace.to_string(), user_id.to_string()))
            .ok_or_else(|| Self::environment_not_found(namespace, user_id))?;
        env.polls += 1;

        let status = match behavior {
            EnvironmentBehavior::ReadyAfter(pending) if env.polls > pending => {
                EnvironmentStatus::new(EnvironmentPhase::Running, vec![true])
            }
            EnvironmentBehavior::ReadyAfter(_) => {
                EnvironmentStatus::new(EnvironmentPhase::Pending, vec![false])
            }
            EnvironmentBehavior::CrashLoop => {
                EnvironmentStatus::new(EnvironmentPhase::Running, vec![false])
            }
        };
        Ok(status)
    }

    async fn inject_payload(&self, namespace: &str, user_id: &str, code: &str) -> ClusterResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        let pod = ResourceNames::for_user(user_id).test_environment;
        if state.enter(Operation::Inject) {
            return Err(Self::fault(Operation::Inject, namespace, &pod));
        }
        let env = state
            .environments
            .get_mut(&(namespace.to_string(), user_id.to_string()))
            .ok_or_else(|| Self::environment_not_found(namespace, user_id))?;
        env.payload = Some(code.to_string());
        env.log.push_str(RUN_MARKER);
        env.log.push('\n');
        env.log.push_str(&simulate_run(code));
        Ok(())
    }

    async fn fetch_logs(&self, namespace: &str, user_id: &str) -> ClusterResult<String> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::FetchLogs) {
            return Err(Self::fault(Operation::FetchLogs, namespace, user_id));
        }
        state
            .environments
            .get(&(namespace.to_string(), user_id.to_string()))
            .map(|env| env.log.clone())
            .ok_or_else(|| Self::environment_not_found(namespace, user_id))
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::DeleteWorkload) {
            return Err(Self::fault(Operation::DeleteWorkload, namespace, name));
        }
        match state
            .workloads
            .remove(&(namespace.to_string(), name.to_string()))
        {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind: "deployment",
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
        }
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ClusterResult<()> {
        tokio::task::yield_now().await;
        let mut state = self.lock();
        if state.enter(Operation::CreateWorkload) {
            return Err(Self::fault(Operation::CreateWorkload, namespace, &spec.name));
        }
        let key = (namespace.to_string(), spec.name.clone());
        if state.workloads.contains_key(&key) {
            return Err(ClusterError::AlreadyExists {
                kind: "deployment",
                name: spec.name.clone(),
                namespace: namespace.to_string(),
            });
        }
        state.workloads.insert(key, spec.clone());
        Ok(())
    }
}

/// Simulated interpreter: `print(...)` lines echo their argument, a
/// `raise` line emits a traceback, an unterminated `print(` is a syntax
/// error. Execution stops at the first failure.
fn simulate_run(code: &str) -> String {
    let mut out = String::new();
    for (index, raw) in code.lines().enumerate() {
        let line = raw.trim();
        let lineno = index + 1;
        if let Some(rest) = line.strip_prefix("print(") {
            match rest.strip_suffix(')') {
                Some(arg) => {
                    out.push_str(arg.trim().trim_matches(|c| c == '"' || c == '\''));
                    out.push('\n');
                }
                None => {
                    out.push_str(&format!(
                        "  File \"/app/code.py\", line {lineno}\n    {line}\nSyntaxError: unexpected EOF while parsing\n"
                    ));
                    break;
                }
            }
        } else if let Some(exception) = line.strip_prefix("raise ") {
            let (kind, message) = match exception.split_once('(') {
                Some((kind, args)) => (
                    kind.trim(),
                    args.trim_end_matches(')').trim_matches(|c| c == '"' || c == '\''),
                ),
                None => (exception.trim(), ""),
            };
            out.push_str(&format!(
                "Traceback (most recent call last):\n  File \"/app/code.py\", line {lineno}, in <module>\n{kind}: {message}\n"
            ));
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::WorkloadRole;

    fn workload(name: &str) -> WorkloadSpec {
        WorkloadSpec {
            name: name.to_string(),
            role: WorkloadRole::Application,
            container: "prod".to_string(),
            image: "python:3.9-slim".to_string(),
            command: None,
            env: Vec::new(),
        }
    }

    #[tokio::test]
    async fn ensure_calls_are_idempotent() {
        let cluster = SimulatedCluster::new();
        cluster.ensure_namespace("user-a").await.unwrap();
        cluster.ensure_namespace("user-a").await.unwrap();
        cluster.ensure_test_environment("user-a", "a").await.unwrap();
        cluster.ensure_test_environment("user-a", "a").await.unwrap();

        assert_eq!(cluster.namespaces(), vec!["user-a".to_string()]);
        assert_eq!(cluster.environment_count(), 1);
    }

    #[tokio::test]
    async fn environment_requires_namespace() {
        let cluster = SimulatedCluster::new();
        let err = cluster.ensure_test_environment("missing", "a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn ready_after_pending_polls() {
        let cluster = SimulatedCluster::new().with_behavior("a", EnvironmentBehavior::ReadyAfter(2));
        cluster.ensure_namespace("ns").await.unwrap();
        cluster.ensure_test_environment("ns", "a").await.unwrap();

        assert!(!cluster.environment_status("ns", "a").await.unwrap().is_ready());
        assert!(!cluster.environment_status("ns", "a").await.unwrap().is_ready());
        assert!(cluster.environment_status("ns", "a").await.unwrap().is_ready());
        assert_eq!(cluster.calls(Operation::Status), 3);
    }

    #[tokio::test]
    async fn crash_loop_never_ready() {
        let cluster = SimulatedCluster::new().with_behavior("a", EnvironmentBehavior::CrashLoop);
        cluster.ensure_namespace("ns").await.unwrap();
        cluster.ensure_test_environment("ns", "a").await.unwrap();
        for _ in 0..10 {
            let status = cluster.environment_status("ns", "a").await.unwrap();
            assert_eq!(status.phase, EnvironmentPhase::Running);
            assert!(!status.is_ready());
        }
    }

    #[tokio::test]
    async fn injection_overwrites_payload_and_logs_run() {
        let cluster = SimulatedCluster::new();
        cluster.ensure_namespace("ns").await.unwrap();
        cluster.ensure_test_environment("ns", "a").await.unwrap();

        cluster.inject_payload("ns", "a", "print('one')").await.unwrap();
        cluster.inject_payload("ns", "a", "print(\"two\")").await.unwrap();

        assert_eq!(cluster.payload("ns", "a").as_deref(), Some("print(\"two\")"));
        let log = cluster.fetch_logs("ns", "a").await.unwrap();
        assert_eq!(log.matches(RUN_MARKER).count(), 2);
        assert!(log.ends_with("two\n"));
    }

    #[tokio::test]
    async fn injected_fault_carries_diagnostic() {
        let cluster = SimulatedCluster::new();
        cluster.ensure_namespace("ns").await.unwrap();
        cluster.ensure_test_environment("ns", "a").await.unwrap();
        cluster.fail(Operation::Inject, 1);

        let err = cluster.inject_payload("ns", "a", "x").await.unwrap_err();
        assert!(matches!(err, ClusterError::Exec { ref pod, .. } if pod == "a-test"));
        // Fault consumed.
        cluster.inject_payload("ns", "a", "x").await.unwrap();
    }

    #[tokio::test]
    async fn workloads_delete_and_create() {
        let cluster = SimulatedCluster::new();
        assert!(cluster.delete_workload("ns", "a-prod").await.unwrap_err().is_not_found());

        cluster.create_workload("ns", &workload("a-prod")).await.unwrap();
        let err = cluster.create_workload("ns", &workload("a-prod")).await.unwrap_err();
        assert!(err.is_already_exists());

        cluster.delete_workload("ns", "a-prod").await.unwrap();
        assert!(cluster.workload("ns", "a-prod").is_none());
    }

    #[test]
    fn simulated_run_output() {
        assert_eq!(simulate_run("print(\"Hello, this is working code\")"), "Hello, this is working code\n");
        assert!(simulate_run("print(\"This is broken code\"").contains("SyntaxError"));

        let out = simulate_run("print('a')\nraise ValueError('bad input')\nprint('b')");
        assert!(out.starts_with("a\nTraceback (most recent call last):"));
        assert!(out.contains("ValueError: bad input"));
        assert!(!out.contains("\nb\n"));
    }
}
