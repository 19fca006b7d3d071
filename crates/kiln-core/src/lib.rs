//! kiln-core — shared types for the Kiln deployment pipeline.
//!
//! Holds the request/result types exchanged with transport adapters, the
//! audit record shape, environment status as reported by the cluster,
//! deterministic resource naming, and the `kiln.toml` configuration model.

pub mod config;
pub mod duration;
pub mod naming;
pub mod types;

pub use config::{AuditBackend, ClusterBackend, ConfigError, KilnConfig, PromotionPolicy};
pub use naming::{NamespaceStrategy, ResourceNames, UserIdError, sanitize_user_id, validate_user_id};
pub use types::*;
