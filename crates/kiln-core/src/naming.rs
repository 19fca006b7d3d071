//! Deterministic resource naming.
//!
//! Every cluster resource the pipeline touches is named from the user
//! identifier alone, so repeated submissions land on the same objects.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const MAX_USER_ID_LEN: usize = 40;

/// How the namespace for a user is chosen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum NamespaceStrategy {
    /// One namespace per user: `{prefix}{user_id}`.
    PerUser { prefix: String },
    /// Every user shares a single namespace.
    Fixed { name: String },
}

impl Default for NamespaceStrategy {
    fn default() -> Self {
        Self::PerUser {
            prefix: "user-".to_string(),
        }
    }
}

impl NamespaceStrategy {
    pub fn namespace_for(&self, user_id: &str) -> String {
        match self {
            NamespaceStrategy::PerUser { prefix } => format!("{prefix}{user_id}"),
            NamespaceStrategy::Fixed { name } => name.clone(),
        }
    }
}

/// Names of the resources keyed by a user identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceNames {
    pub test_environment: String,
    pub application: String,
    pub backing_store: String,
}

impl ResourceNames {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            test_environment: format!("{user_id}-test"),
            application: format!("{user_id}-prod"),
            backing_store: format!("{user_id}-prod-db"),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum UserIdError {
    #[error("user id is empty")]
    Empty,
    #[error("user id is longer than {MAX_USER_ID_LEN} characters")]
    TooLong,
    #[error("user id {0:?} must be lowercase alphanumeric or '-', starting and ending alphanumeric")]
    InvalidCharacters(String),
}

/// Check that a user identifier can be embedded in resource names.
pub fn validate_user_id(user_id: &str) -> Result<(), UserIdError> {
    if user_id.is_empty() {
        return Err(UserIdError::Empty);
    }
    if user_id.len() > MAX_USER_ID_LEN {
        return Err(UserIdError::TooLong);
    }
    let allowed = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-';
    let edge_ok = |c: Option<char>| c.is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !user_id.chars().all(allowed)
        || !edge_ok(user_id.chars().next())
        || !edge_ok(user_id.chars().last())
    {
        return Err(UserIdError::InvalidCharacters(user_id.to_string()));
    }
    Ok(())
}

/// Turn an arbitrary handle (e.g. a forge username) into a valid user id.
///
/// Returns `None` when nothing usable is left after sanitizing.
pub fn sanitize_user_id(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed: String = out.trim_matches('-').chars().take(MAX_USER_ID_LEN).collect();
    let trimmed = trimmed.trim_end_matches('-').to_string();
    validate_user_id(&trimmed).ok().map(|_| trimmed)
}
