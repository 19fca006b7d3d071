//! GitLab webhook intake.
//!
//! Push events name a repository and the pushing user. The handler
//! derives a resource-safe user id and acknowledges the trigger;
//! fetching the repository is left to an external collaborator.

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use kiln_core::sanitize_user_id;
use serde_json::Value;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::handlers::error_response;

pub const GITLAB_TOKEN_HEADER: &str = "x-gitlab-token";

/// Constant-time token comparison.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    !expected.is_empty() && bool::from(expected.as_bytes().ct_eq(presented.as_bytes()))
}

/// What a push event asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushTrigger {
    pub repo_url: String,
    pub user_id: String,
}

/// Reasons a payload cannot be turned into a trigger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    /// Not a push event; carries the `object_kind` if any.
    Ignored(Option<String>),
    MissingRepository,
    MissingUser,
}

/// Extract the repository URL and user identity from a push payload.
pub fn parse_push(payload: &Value) -> Result<PushTrigger, PushError> {
    let kind = payload.get("object_kind").and_then(Value::as_str);
    if kind != Some("push") {
        return Err(PushError::Ignored(kind.map(str::to_string)));
    }
    let repo_url = payload
        .pointer("/repository/git_http_url")
        .and_then(Value::as_str)
        .filter(|url| !url.is_empty())
        .ok_or(PushError::MissingRepository)?;
    let user_id = payload
        .get("user_username")
        .and_then(Value::as_str)
        .and_then(sanitize_user_id)
        .ok_or(PushError::MissingUser)?;
    Ok(PushTrigger {
        repo_url: repo_url.to_string(),
        user_id,
    })
}

/// POST /webhook
pub async fn gitlab_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let presented = headers
        .get(GITLAB_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let authorized = state
        .webhook_secret
        .as_deref()
        .is_some_and(|secret| token_matches(secret, presented));
    if !authorized {
        warn!("webhook rejected: invalid token");
        return error_response("Invalid GitLab token", StatusCode::FORBIDDEN).into_response();
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            debug!(error = %e, "webhook body is not JSON");
            return error_response(&format!("invalid JSON body: {e}"), StatusCode::BAD_REQUEST)
                .into_response();
        }
    };

    match parse_push(&payload) {
        Ok(trigger) => {
            info!(repo_url = %trigger.repo_url, user = %trigger.user_id, "push event received");
            Json(serde_json::json!({
                "status": "Triggering deployment",
                "repo_url": trigger.repo_url,
                "user_id": trigger.user_id,
            }))
            .into_response()
        }
        Err(PushError::Ignored(kind)) => {
            debug!(?kind, "ignoring webhook event");
            Json(serde_json::json!({ "status": "ignored" })).into_response()
        }
        Err(PushError::MissingRepository) => error_response(
            "push event without repository.git_http_url",
            StatusCode::UNPROCESSABLE_ENTITY,
        )
        .into_response(),
        Err(PushError::MissingUser) => error_response(
            "push event without a usable user_username",
            StatusCode::UNPROCESSABLE_ENTITY,
        )
        .into_response(),
    }
}
