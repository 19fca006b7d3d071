//! Shared-key authentication.
//!
//! Clients send the key in `X-API-Key`. Both the configured and the
//! presented key are run through HMAC-SHA256 keyed with a salt, and the
//! digests are compared in constant time.

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::debug;

use crate::AppState;
use crate::handlers::error_response;

type HmacSha256 = Hmac<Sha256>;

pub const API_KEY_HEADER: &str = "x-api-key";

/// Verifies presented API keys against the configured one.
pub struct ApiKeyAuth {
    salt: Vec<u8>,
    /// HMAC of the configured key; `None` when no key is configured.
    expected: Option<Vec<u8>>,
}

impl std::fmt::Debug for ApiKeyAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiKeyAuth")
            .field("configured", &self.expected.is_some())
            .finish()
    }
}

impl ApiKeyAuth {
    pub fn new(api_key: &str, salt: &str) -> Self {
        let salt = salt.as_bytes().to_vec();
        let expected = (!api_key.is_empty()).then(|| digest(&salt, api_key));
        Self { salt, expected }
    }

    pub fn is_configured(&self) -> bool {
        self.expected.is_some()
    }

    /// Constant-time check of a presented key. Always false when no key
    /// is configured.
    pub fn verify(&self, presented: &str) -> bool {
        let Some(expected) = &self.expected else {
            return false;
        };
        if presented.is_empty() {
            return false;
        }
        match HmacSha256::new_from_slice(&self.salt) {
            Ok(mut mac) => {
                mac.update(presented.as_bytes());
                mac.verify_slice(expected).is_ok()
            }
            Err(_) => false,
        }
    }
}

fn digest(salt: &[u8], value: &str) -> Vec<u8> {
    // HMAC accepts keys of any length.
    match HmacSha256::new_from_slice(salt) {
        Ok(mut mac) => {
            mac.update(value.as_bytes());
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

/// Middleware rejecting requests without a valid `X-API-Key` with 403.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if presented.is_empty() {
        debug!(path = %request.uri().path(), "missing API key");
        return error_response("Invalid or missing API Key", StatusCode::FORBIDDEN).into_response();
    }
    if !state.auth.verify(presented) {
        debug!(path = %request.uri().path(), "API key rejected");
        return error_response("Invalid or missing API Key", StatusCode::FORBIDDEN).into_response();
    }
    next.run(request).await
}
