use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::GatewayState;

pub const ADMIN_API_KEY_VAR: &str = "ADMIN_API_KEY";

/// Accepted gateway keys, parsed from the comma-separated `ADMIN_API_KEY`.
#[derive(Debug, Clone, Default)]
pub struct AdminKeys {
    keys: Vec<String>,
}

impl AdminKeys {
    pub fn from_env() -> Self {
        match std::env::var(ADMIN_API_KEY_VAR) {
            Ok(raw) => Self::parse(&raw),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(raw: &str) -> Self {
        Self {
            keys: raw
                .split(',')
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn accepts(&self, candidate: &str) -> bool {
        self.keys.iter().any(|key| key == candidate)
    }
}

pub(crate) async fn require_api_key(
    State(state): State<GatewayState>,
    request: Request,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());

    let Some(presented) = presented else {
        return unauthorized("missing_api_key", "missing x-api-key header");
    };
    if !state.admin_keys.accepts(presented) {
        return unauthorized("invalid_api_key", "invalid api key");
    }
    next.run(request).await
}

fn unauthorized(code: &str, message: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": message,
            "type": "authentication",
            "code": code,
        }
    });
    (StatusCode::UNAUTHORIZED, Json(body)).into_response()
}
