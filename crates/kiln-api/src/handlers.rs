//! REST handlers.
//!
//! Responses use the `{ success, data, error }` envelope.

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use kiln_core::DeploymentRequest;
use kiln_pipeline::PipelineError;
use tracing::{debug, error, info, warn};

use crate::AppState;

const DEFAULT_AUDIT_LIMIT: usize = 50;
const MAX_AUDIT_LIMIT: usize = 1000;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for a pipeline failure.
pub(crate) fn status_for(error: &PipelineError) -> StatusCode {
    match error {
        PipelineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        PipelineError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
        PipelineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        PipelineError::Provisioning { .. }
        | PipelineError::Injection { .. }
        | PipelineError::Promotion { .. }
        | PipelineError::Unexpected { .. } => StatusCode::BAD_GATEWAY,
    }
}

// ── Deployments ────────────────────────────────────────────────

/// POST /api/v1/deployments
pub async fn create_deployment(
    State(state): State<AppState>,
    body: Result<Json<DeploymentRequest>, JsonRejection>,
) -> impl IntoResponse {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!(error = %rejection.body_text(), "deployment body rejected");
            return error_response(&rejection.body_text(), rejection.status()).into_response();
        }
    };

    // The run lives in its own task. If this future is dropped the guard
    // cancels the token and the run stops at its next suspension point.
    let cancel = state.shutdown.child_token();
    let _cancel_on_drop = cancel.clone().drop_guard();
    let pipeline = state.pipeline.clone();
    let user_id = request.user_id.clone();
    let run = tokio::spawn(async move { pipeline.run(&request, &cancel).await });

    match run.await {
        Ok(Ok(result)) => {
            info!(user = %user_id, status = %result.status, "deployment request finished");
            ApiResponse::ok(result).into_response()
        }
        Ok(Err(e)) => {
            warn!(user = %user_id, error = %e, "deployment request failed");
            error_response(&e.to_string(), status_for(&e)).into_response()
        }
        Err(e) => {
            error!(user = %user_id, error = %e, "deployment task failed");
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

// ── Audit ──────────────────────────────────────────────────────

#[derive(Debug, serde::Deserialize)]
pub struct AuditQuery {
    pub limit: Option<usize>,
    pub user: Option<String>,
}

/// GET /api/v1/audit
pub async fn list_audit(
    State(state): State<AppState>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    let Some(store) = state.audit_store.clone() else {
        return error_response("local audit store is not enabled", StatusCode::NOT_FOUND)
            .into_response();
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_AUDIT_LIMIT)
        .clamp(1, MAX_AUDIT_LIMIT);

    let listed = tokio::task::spawn_blocking(move || match query.user {
        Some(user) => store.list_for_user(&user, limit),
        None => store.list_recent(limit),
    })
    .await;

    match listed {
        Ok(Ok(records)) => ApiResponse::ok(records).into_response(),
        Ok(Err(e)) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Health ─────────────────────────────────────────────────────

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let audit = state.pipeline.auditor().readiness().await;
    Json(serde_json::json!({
        "status": "ok",
        "audit": audit,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_core::UserIdError;

    #[test]
    fn pipeline_errors_map_to_statuses() {
        assert_eq!(
            status_for(&PipelineError::InvalidRequest(UserIdError::Empty)),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&PipelineError::ReadinessTimeout {
                environment: "a-test".to_string(),
                attempts: 60
            }),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(status_for(&PipelineError::Cancelled), StatusCode::SERVICE_UNAVAILABLE);
    }
}
