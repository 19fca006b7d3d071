//! kiln.toml configuration.
//!
//! Every section is optional. Secrets and endpoints can be supplied through
//! the environment, which takes precedence over the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::duration::parse_duration;
use crate::naming::NamespaceStrategy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid duration for {field}: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KilnConfig {
    pub pipeline: PipelineSection,
    pub cluster: ClusterSection,
    pub audit: AuditSection,
    pub server: ServerSection,
}

/// What happens to the reported status when promotion fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionPolicy {
    /// Promotion failures are audited; the run still reports `deployed`.
    #[default]
    FailOpen,
    /// Promotion failures surface as a pipeline error.
    FailClosed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSection {
    pub poll_attempts: u32,
    pub poll_interval: String,
    pub settle_delay: String,
    pub promotion_policy: PromotionPolicy,
    pub sentinel: String,
    pub failure_markers: Vec<String>,
    pub namespace: NamespaceStrategy,
}

impl Default for PipelineSection {
    fn default() -> Self {
        Self {
            poll_attempts: 60,
            poll_interval: "1s".to_string(),
            settle_delay: "2s".to_string(),
            promotion_policy: PromotionPolicy::FailOpen,
            sentinel: "Code updated, running...".to_string(),
            failure_markers: vec!["Error".to_string(), "Traceback".to_string()],
            namespace: NamespaceStrategy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterBackend {
    #[default]
    Kubernetes,
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub backend: ClusterBackend,
    pub kubeconfig: Option<PathBuf>,
    pub test_image: String,
    pub app_image: String,
    pub store_image: String,
    pub payload_path: String,
    pub store_password: String,
}

impl Default for ClusterSection {
    fn default() -> Self {
        Self {
            backend: ClusterBackend::Kubernetes,
            kubeconfig: None,
            test_image: "nowdurodola/test-base:latest".to_string(),
            app_image: "python:3.9-slim".to_string(),
            store_image: "postgres:13".to_string(),
            payload_path: "/app/code.py".to_string(),
            store_password: "password".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditBackend {
    #[default]
    Elasticsearch,
    Local,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditSection {
    pub backend: AuditBackend,
    pub elasticsearch_url: String,
    pub index: String,
    pub connect_attempts: u32,
    pub connect_interval: String,
    pub request_timeout: String,
    pub data_dir: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            backend: AuditBackend::Elasticsearch,
            elasticsearch_url: "http://elasticsearch:9200".to_string(),
            index: "orchestration-logs".to_string(),
            connect_attempts: 70,
            connect_interval: "2s".to_string(),
            request_timeout: "5s".to_string(),
            data_dir: PathBuf::from("/var/lib/kiln"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    pub api_key: String,
    pub secret_salt: String,
    pub webhook_secret: Option<String>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 8000,
            api_key: String::new(),
            secret_salt: String::new(),
            webhook_secret: None,
        }
    }
}

impl KilnConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: KilnConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary lookup (the process env in production).
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup("KUBECONFIG") {
            self.cluster.kubeconfig = Some(PathBuf::from(path));
        }
        if let Some(password) = lookup("KILN_STORE_PASSWORD") {
            self.cluster.store_password = password;
        }
        if let Some(url) = lookup("ELASTICSEARCH_HOST") {
            self.audit.elasticsearch_url = url;
        }
        if let Some(key) = lookup("API_KEY") {
            self.server.api_key = key;
        }
        if let Some(salt) = lookup("SECRET_SALT") {
            self.server.secret_salt = salt;
        }
        if let Some(secret) = lookup("GITLAB_SECRET") {
            self.server.webhook_secret = Some(secret);
        }
    }

    /// Check cross-field constraints and that every duration parses.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.poll_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "pipeline.poll_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.pipeline.sentinel.is_empty() {
            return Err(ConfigError::Invalid {
                field: "pipeline.sentinel",
                reason: "must not be empty".to_string(),
            });
        }
        if self.pipeline.failure_markers.iter().any(String::is_empty) {
            return Err(ConfigError::Invalid {
                field: "pipeline.failure_markers",
                reason: "markers must not be empty".to_string(),
            });
        }
        self.pipeline.poll_interval()?;
        self.pipeline.settle_delay()?;
        self.audit.connect_interval()?;
        self.audit.request_timeout()?;
        Ok(())
    }
}

fn duration_field(field: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::InvalidDuration {
        field,
        value: value.to_string(),
    })
}

impl PipelineSection {
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("pipeline.poll_interval", &self.poll_interval)
    }

    pub fn settle_delay(&self) -> Result<Duration, ConfigError> {
        duration_field("pipeline.settle_delay", &self.settle_delay)
    }
}

impl AuditSection {
    pub fn connect_interval(&self) -> Result<Duration, ConfigError> {
        duration_field("audit.connect_interval", &self.connect_interval)
    }

    pub fn request_timeout(&self) -> Result<Duration, ConfigError> {
        duration_field("audit.request_timeout", &self.request_timeout)
    }
}
