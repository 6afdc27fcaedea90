mod auth;
mod chat;
mod error;
mod health;
mod models;

pub use auth::AdminKeys;

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::Response;
use axum::routing::{get, post, MethodRouter};
use axum::Router;

use poolgate_core::Gateway;

#[derive(Clone)]
pub struct GatewayState {
    pub gateway: Arc<Gateway>,
    pub admin_keys: Arc<AdminKeys>,
    pub request_timeout: Duration,
    pub streaming_timeout: Duration,
}

impl GatewayState {
    pub fn new(gateway: Arc<Gateway>, admin_keys: AdminKeys) -> Self {
        let timeouts = gateway.runtime().config.timeout.clone();
        Self {
            gateway,
            admin_keys: Arc::new(admin_keys),
            request_timeout: Duration::from_millis(timeouts.request_timeout_ms),
            streaming_timeout: Duration::from_millis(timeouts.streaming_timeout_ms),
        }
    }
}

/// Build the public HTTP surface. All `/v1` and `/admin` routes sit behind
/// the shared-key check; `/health` is open. Every route is registered with
/// and without a trailing slash.
pub fn gateway_router(state: GatewayState) -> Router {
    let protected = Router::new()
        .merge(route_pair("/v1/models", get(models::list)))
        .merge(route_pair(
            "/v1/chat/completions",
            post(chat::chat_completions),
        ))
        .merge(route_pair("/v1/completions", post(chat::completions)))
        .merge(route_pair(
            "/admin/providers/status",
            get(health::providers_status),
        ))
        .merge(route_pair(
            "/admin/providers/{model}/{provider}/reset",
            post(health::reset_provider),
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_api_key,
        ));

    Router::new()
        .merge(route_pair("/health", get(health::health)))
        .merge(protected)
        .layer(middleware::from_fn(cors))
        .with_state(state)
}

fn route_pair(path: &str, method_router: MethodRouter<GatewayState>) -> Router<GatewayState> {
    let with_slash = format!("{path}/");
    Router::new()
        .route(path, method_router.clone())
        .route(&with_slash, method_router)
}

/// Wildcard CORS; preflights answer 204 immediately.
async fn cors(
    request: axum::extract::Request,
    next: middleware::Next,
) -> Response {
    if request.method() == Method::OPTIONS {
        let mut response = Response::new(axum::body::Body::empty());
        *response.status_mut() = StatusCode::NO_CONTENT;
        apply_cors_headers(&mut response);
        return response;
    }
    let mut response = next.run(request).await;
    apply_cors_headers(&mut response);
    response
}

fn apply_cors_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, PUT, DELETE, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("content-type, x-api-key, authorization"),
    );
}
