use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::ApiError;
use crate::GatewayState;

pub(crate) async fn health(State(state): State<GatewayState>) -> Response {
    let status = state.gateway.health_status();
    let code = if status.any_pool_usable() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status)).into_response()
}

pub(crate) async fn providers_status(State(state): State<GatewayState>) -> Response {
    let status = state.gateway.provider_status();
    let metrics = state.gateway.all_pool_metrics();
    Json(serde_json::json!({
        "pools": status,
        "metrics": metrics,
    }))
    .into_response()
}

pub(crate) async fn reset_provider(
    State(state): State<GatewayState>,
    Path((model, provider)): Path<(String, String)>,
) -> Response {
    match state.gateway.reset_provider(&model, &provider) {
        Ok(()) => Json(serde_json::json!({
            "status": "ok",
            "model": model,
            "provider": provider,
        }))
        .into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
