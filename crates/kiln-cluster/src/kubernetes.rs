//! Kubernetes orchestrator.
//!
//! Namespaces and test pods are ensured with get-then-create. Production
//! workloads are single-replica Deployments labelled by their own name.
//! Code injection streams the payload over `kubectl exec -i` stdin, so
//! the code is never interpolated into a shell command line.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, Namespace, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kiln_core::{EnvironmentPhase, EnvironmentStatus, ResourceNames};
use kube::api::{Api, DeleteParams, LogParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::orchestrator::ClusterOrchestrator;
use crate::template::WorkloadSpec;

const TEST_CONTAINER: &str = "test";

/// Connection and manifest settings for [`KubeOrchestrator`].
#[derive(Debug, Clone)]
pub struct KubeSettings {
    /// Explicit kubeconfig; in-cluster or default discovery when unset.
    pub kubeconfig: Option<PathBuf>,
    pub test_image: String,
    /// Path inside the test container the payload is written to.
    pub payload_path: String,
    /// `kubectl` binary used for exec.
    pub kubectl: String,
    /// Upper bound on waiting for a deleted Deployment to disappear.
    pub delete_wait: Duration,
    pub delete_poll: Duration,
}

impl Default for KubeSettings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            test_image: "nowdurodola/test-base:latest".to_string(),
            payload_path: "/app/code.py".to_string(),
            kubectl: "kubectl".to_string(),
            delete_wait: Duration::from_secs(30),
            delete_poll: Duration::from_millis(500),
        }
    }
}

/// [`ClusterOrchestrator`] backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeOrchestrator {
    client: Client,
    settings: KubeSettings,
}

impl KubeOrchestrator {
    pub fn new(client: Client, settings: KubeSettings) -> Self {
        Self { client, settings }
    }

    /// Build a client from the configured kubeconfig, or infer one.
    pub async fn connect(settings: KubeSettings) -> ClusterResult<Self> {
        let config = match &settings.kubeconfig {
            Some(path) => {
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Config(format!("read kubeconfig {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };
        let cluster_url = config.cluster_url.to_string();
        let client = Client::try_from(config).map_err(|e| ClusterError::Config(e.to_string()))?;
        info!(%cluster_url, "kubernetes client ready");
        Ok(Self::new(client, settings))
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn wait_until_gone(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        let api = self.deployments(namespace);
        let deadline = tokio::time::Instant::now() + self.settings.delete_wait;
        loop {
            let existing = api
                .get_opt(name)
                .await
                .map_err(|e| map_kube_error(e, "deployment", name, namespace))?;
            if existing.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ClusterError::Timeout(format!(
                    "deployment {name} in {namespace} to be deleted"
                )));
            }
            tokio::time::sleep(self.settings.delete_poll).await;
        }
    }
}

/// Translate a kube error into the orchestrator's taxonomy.
fn map_kube_error(err: kube::Error, kind: &'static str, name: &str, namespace: &str) -> ClusterError {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => ClusterError::NotFound {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => ClusterError::AlreadyExists {
            kind,
            name: name.to_string(),
            namespace: namespace.to_string(),
        },
        kube::Error::Api(resp) => {
            ClusterError::Api(format!("{kind} {name}: {} ({})", resp.message, resp.code))
        }
        other => ClusterError::Api(format!("{kind} {name}: {other}")),
    }
}

fn labels(app: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("app".to_string(), app.to_string())])
}

fn namespace_manifest(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn test_pod_manifest(name: &str, image: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels("test")),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: TEST_CONTAINER.to_string(),
                image: Some(image.to_string()),
                image_pull_policy: Some("IfNotPresent".to_string()),
                ..Default::default()
            }],
            restart_policy: Some("Always".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn deployment_manifest(spec: &WorkloadSpec) -> Deployment {
    let env: Vec<EnvVar> = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            ..Default::default()
        })
        .collect();

    Deployment {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: Some(labels(&spec.name)),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels(&spec.name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(&spec.name)),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: spec.container.clone(),
                        image: Some(spec.image.clone()),
                        command: spec.command.clone(),
                        env: (!env.is_empty()).then_some(env),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_status(pod: &Pod) -> EnvironmentStatus {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .map(EnvironmentPhase::parse)
        .unwrap_or(EnvironmentPhase::Unknown);
    let ready = status
        .and_then(|s| s.container_statuses.as_ref())
        .map(|cs| cs.iter().map(|c| c.ready).collect())
        .unwrap_or_default();
    EnvironmentStatus::new(phase, ready)
}

#[async_trait]
impl ClusterOrchestrator for KubeOrchestrator {
    async fn ensure_namespace(&self, namespace: &str) -> ClusterResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let existing = api
            .get_opt(namespace)
            .await
            .map_err(|e| map_kube_error(e, "namespace", namespace, namespace))?;
        if existing.is_some() {
            debug!(%namespace, "namespace exists");
            return Ok(());
        }
        match api
            .create(&PostParams::default(), &namespace_manifest(namespace))
            .await
        {
            Ok(_) => {
                info!(%namespace, "namespace created");
                Ok(())
            }
            Err(e) => match map_kube_error(e, "namespace", namespace, namespace) {
                // Lost a creation race; the namespace exists.
                ClusterError::AlreadyExists { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn ensure_test_environment(&self, namespace: &str, user_id: &str) -> ClusterResult<()> {
        let pod = ResourceNames::for_user(user_id).test_environment;
        let api = self.pods(namespace);
        let existing = api
            .get_opt(&pod)
            .await
            .map_err(|e| map_kube_error(e, "pod", &pod, namespace))?;
        if existing.is_some() {
            debug!(%namespace, %pod, "test environment exists");
            return Ok(());
        }
        let manifest = test_pod_manifest(&pod, &self.settings.test_image);
        match api.create(&PostParams::default(), &manifest).await {
            Ok(_) => {
                info!(%namespace, %pod, image = %self.settings.test_image, "test environment created");
                Ok(())
            }
            Err(e) => match map_kube_error(e, "pod", &pod, namespace) {
                ClusterError::AlreadyExists { .. } => Ok(()),
                other => Err(other),
            },
        }
    }

    async fn environment_status(
        &self,
        namespace: &str,
        user_id: &str,
    ) -> ClusterResult<EnvironmentStatus> {
        let pod = ResourceNames::for_user(user_id).test_environment;
        let current = self
            .pods(namespace)
            .get(&pod)
            .await
            .map_err(|e| map_kube_error(e, "pod", &pod, namespace))?;
        Ok(pod_status(&current))
    }

    async fn inject_payload(&self, namespace: &str, user_id: &str, code: &str) -> ClusterResult<()> {
        let pod = ResourceNames::for_user(user_id).test_environment;
        let script = format!("cat > {}", self.settings.payload_path);

        let mut command = tokio::process::Command::new(&self.settings.kubectl);
        command
            .args(["exec", "-i", &pod, "-n", namespace, "-c", TEST_CONTAINER])
            .args(["--", "/bin/sh", "-c", &script])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = &self.settings.kubeconfig {
            command.env("KUBECONFIG", path);
        }

        let exec_error = |diagnostic: String| ClusterError::Exec {
            pod: pod.clone(),
            diagnostic,
        };

        let mut child = command
            .spawn()
            .map_err(|e| exec_error(format!("spawn {}: {e}", self.settings.kubectl)))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(code.as_bytes())
                .await
                .map_err(|e| exec_error(format!("write payload: {e}")))?;
            // Closing stdin ends `cat`.
            drop(stdin);
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|e| exec_error(format!("wait for kubectl: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let diagnostic = if stderr.is_empty() {
                format!("kubectl exited with {}", output.status)
            } else {
                stderr
            };
            return Err(exec_error(diagnostic));
        }
        if !stderr.is_empty() {
            warn!(%namespace, %pod, %stderr, "kubectl exec wrote to stderr");
        }
        info!(%namespace, %pod, bytes = code.len(), "payload injected");
        Ok(())
    }

    async fn fetch_logs(&self, namespace: &str, user_id: &str) -> ClusterResult<String> {
        let pod = ResourceNames::for_user(user_id).test_environment;
        let params = LogParams {
            container: Some(TEST_CONTAINER.to_string()),
            ..Default::default()
        };
        self.pods(namespace)
            .logs(&pod, &params)
            .await
            .map_err(|e| map_kube_error(e, "pod", &pod, namespace))
    }

    async fn delete_workload(&self, namespace: &str, name: &str) -> ClusterResult<()> {
        self.deployments(namespace)
            .delete(name, &DeleteParams::background())
            .await
            .map_err(|e| map_kube_error(e, "deployment", name, namespace))?;
        debug!(%namespace, %name, "deployment delete accepted");
        // A create issued while the old object is still terminating would conflict.
        self.wait_until_gone(namespace, name).await?;
        info!(%namespace, %name, "deployment deleted");
        Ok(())
    }

    async fn create_workload(&self, namespace: &str, spec: &WorkloadSpec) -> ClusterResult<()> {
        self.deployments(namespace)
            .create(&PostParams::default(), &deployment_manifest(spec))
            .await
            .map_err(|e| map_kube_error(e, "deployment", &spec.name, namespace))?;
        info!(%namespace, name = %spec.name, image = %spec.image, "deployment created");
        Ok(())
    }
}
