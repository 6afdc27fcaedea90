use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use poolgate_core::bootstrap::build_runtime;
use poolgate_core::Gateway;
use poolgate_provider_core::GatewayConfig;
use poolgate_provider_impl::HttpClientConfig;
use poolgate_router::{gateway_router, AdminKeys, GatewayState};

const API_KEY: &str = "test-admin-key";

fn test_router() -> axum::Router {
    let config: GatewayConfig = serde_json::from_value(serde_json::json!({
        "pools": [{
            "id": "primary",
            "name": "primary",
            "providers": [{
                "name": "local-stub",
                "kind": "openai",
                "apiKey": "sk-test-12345678",
                // Nothing listens here; dispatch fails fast with a
                // connection error and no retries.
                "apiBase": "http://127.0.0.1:9/v1",
                "modelName": "gpt-4o",
                "maxRetries": 0,
                "timeoutMs": 1000,
            }],
        }],
        "models": { "gpt-4o": { "primaryPoolId": "primary" } },
        "timeout": { "minTimeoutMs": 200 },
    }))
    .expect("config");
    let runtime = build_runtime(config, HttpClientConfig::default()).expect("runtime");
    let gateway = Arc::new(Gateway::new(runtime));
    gateway_router(GatewayState::new(gateway, AdminKeys::parse(API_KEY)))
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.expect("body").to_bytes();
    serde_json::from_slice(&bytes).expect("json body")
}

#[tokio::test]
async fn missing_api_key_is_rejected() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "missing_api_key");
}

#[tokio::test]
async fn unknown_api_key_is_rejected() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/v1/models")
                .header("x-api-key", "wrong")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], "invalid_api_key");
}

#[tokio::test]
async fn models_list_includes_configured_models() {
    let router = test_router();
    for uri in ["/v1/models", "/v1/models/"] {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .uri(uri)
                    .header("x-api-key", API_KEY)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK, "uri {uri}");
        let body = body_json(response).await;
        assert_eq!(body["object"], "list");
        assert_eq!(body["data"][0]["id"], "gpt-4o");
        assert_eq!(body["data"][0]["object"], "model");
    }
}

#[tokio::test]
async fn preflight_answers_immediately_with_cors() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/v1/chat/completions")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response
            .headers()
            .get(header::ACCESS_CONTROL_ALLOW_ORIGIN)
            .and_then(|value| value.to_str().ok()),
        Some("*")
    );
}

#[tokio::test]
async fn health_is_open_and_reports_pools() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["pools"][0]["poolId"], "primary");
    assert_eq!(body["models"]["gpt-4o"], "primary");
}

#[tokio::test]
async fn unknown_model_returns_404_before_any_upstream_call() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .header("x-api-key", API_KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"model":"nope","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "model_not_found");
}

#[tokio::test]
async fn exhausted_chain_surfaces_503_envelope() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .header("x-api-key", API_KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    r#"{"model":"gpt-4o","messages":[{"role":"user","content":"hi"}]}"#,
                ))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "all_providers_failed");
    assert_eq!(body["error"]["retryable"], true);
}

#[tokio::test]
async fn empty_messages_fail_validation() {
    let router = test_router();
    let response = router
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/v1/chat/completions")
                .header("x-api-key", API_KEY)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(r#"{"model":"gpt-4o","messages":[]}"#))
                .expect("request"),
        )
        .await
        .expect("response");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert_eq!(body["error"]["type"], "validation");
}
