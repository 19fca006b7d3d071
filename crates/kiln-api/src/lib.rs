//! kiln-api — HTTP surface for Kiln.
//!
//! Accepts code submissions over a WebSocket or REST, exposes the local
//! audit log and a health probe, and receives GitLab push webhooks.
//!
//! # Routes
//!
//! | Method | Path | Auth | Description |
//! |---|---|---|---|
//! | GET | `/ws/code` | API key | WebSocket: one JSON request per text frame |
//! | POST | `/api/v1/deployments` | API key | Run the pipeline for one submission |
//! | GET | `/api/v1/audit` | API key | Locally stored audit records |
//! | GET | `/healthz` | none | Liveness and audit backend readiness |
//! | POST | `/webhook` | GitLab token | Push event intake |

pub mod auth;
pub mod handlers;
pub mod webhook;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use kiln_pipeline::Pipeline;
use kiln_state::AuditStore;
use tokio_util::sync::CancellationToken;

pub use auth::ApiKeyAuth;

/// Shared state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Pipeline,
    pub auth: Arc<ApiKeyAuth>,
    /// Expected `X-Gitlab-Token`; webhooks are refused when unset.
    pub webhook_secret: Option<Arc<str>>,
    /// Present only with the local audit backend.
    pub audit_store: Option<AuditStore>,
    /// Parent of every run's cancellation token; cancelled on shutdown.
    pub shutdown: CancellationToken,
}

/// Build the complete router.
pub fn build_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/deployments", post(handlers::create_deployment))
        .route("/audit", get(handlers::list_audit));

    let protected = Router::new()
        .nest("/api/v1", api_routes)
        .route("/ws/code", get(ws::ws_code))
        .route_layer(from_fn_with_state(state.clone(), auth::require_api_key));

    Router::new()
        .merge(protected)
        .route("/healthz", get(handlers::healthz))
        .route("/webhook", post(webhook::gitlab_webhook))
        .with_state(state)
}
