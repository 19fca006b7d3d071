//! Production workload templates.
//!
//! A user's production pair is an application process running the
//! verified code and a backing data store. Both are rebuilt from these
//! templates on every promotion.

use kiln_core::ResourceNames;
use serde::{Deserialize, Serialize};

/// Which half of the production pair a workload is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadRole {
    Application,
    BackingStore,
}

impl WorkloadRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadRole::Application => "application",
            WorkloadRole::BackingStore => "backing_store",
        }
    }
}

/// A single-replica workload to create in a namespace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    pub role: WorkloadRole,
    pub container: String,
    pub image: String,
    pub command: Option<Vec<String>>,
    pub env: Vec<(String, String)>,
}

/// Images and settings used to build the production pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductionTemplates {
    pub app_image: String,
    pub store_image: String,
    pub store_password: String,
}

impl ProductionTemplates {
    /// The application workload: runs `code` once, then idles so the
    /// process stays up.
    pub fn application(&self, user_id: &str, code: &str) -> WorkloadSpec {
        let names = ResourceNames::for_user(user_id);
        let program = format!("{code}\nimport time\nwhile True:\n    time.sleep(60)\n");
        WorkloadSpec {
            name: names.application,
            role: WorkloadRole::Application,
            container: "prod".to_string(),
            image: self.app_image.clone(),
            command: Some(vec!["python".to_string(), "-c".to_string(), program]),
            env: Vec::new(),
        }
    }

    /// The backing store workload.
    pub fn backing_store(&self, user_id: &str) -> WorkloadSpec {
        let names = ResourceNames::for_user(user_id);
        WorkloadSpec {
            name: names.backing_store,
            role: WorkloadRole::BackingStore,
            container: "prod-db".to_string(),
            image: self.store_image.clone(),
            command: None,
            env: vec![(
                "POSTGRES_PASSWORD".to_string(),
                self.store_password.clone(),
            )],
        }
    }

    /// Both workloads, application first.
    pub fn pair(&self, user_id: &str, code: &str) -> [WorkloadSpec; 2] {
        [self.application(user_id, code), self.backing_store(user_id)]
    }
}
