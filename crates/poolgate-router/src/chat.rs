use std::convert::Infallible;
use std::time::Duration;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value as JsonValue;
use tokio_stream::wrappers::ReceiverStream;

use poolgate_common::{GatewayError, RequestContext};
use poolgate_protocol::chat::ChatCompletionRequestBody;
use poolgate_protocol::completion::{CompletionRequestBody, CompletionResponse};
use poolgate_provider_core::ByteStream;

use crate::error::ApiError;
use crate::GatewayState;

const SSE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);
const SSE_HEARTBEAT_FRAME: &[u8] = b": keep-alive\n\n";

struct DispatchMeta {
    provider: String,
    pool: String,
    fallback: bool,
}

pub(crate) async fn chat_completions(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Response {
    let request: ChatCompletionRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return ApiError(GatewayError::Validation(format!("invalid json: {err}")))
                .into_response();
        }
    };
    if request.messages.is_empty() {
        return ApiError(GatewayError::Validation(
            "messages must not be empty".to_string(),
        ))
        .into_response();
    }

    if request.is_stream() {
        stream_chat(state, request).await
    } else {
        json_chat(state, request).await
    }
}

/// Legacy text completions are rewritten into a single-user-message chat
/// request before dispatch and projected back on the way out.
pub(crate) async fn completions(
    State(state): State<GatewayState>,
    body: Bytes,
) -> Response {
    let request: CompletionRequestBody = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return ApiError(GatewayError::Validation(format!("invalid json: {err}")))
                .into_response();
        }
    };
    let chat_request = request.into_chat();

    if chat_request.is_stream() {
        return stream_chat(state, chat_request).await;
    }

    let ctx = RequestContext::new(state.request_timeout);
    match state.gateway.chat_completion(&chat_request, &ctx).await {
        Err(err) => ApiError(err).into_response(),
        Ok(dispatched) => {
            let meta = DispatchMeta {
                provider: dispatched.used_provider,
                pool: dispatched.used_pool,
                fallback: dispatched.used_fallback,
            };
            let completion = CompletionResponse::from_chat(dispatched.value.response);
            let mut response = (StatusCode::OK, Json(completion)).into_response();
            apply_dispatch_headers(&mut response, &meta);
            response
        }
    }
}

async fn json_chat(state: GatewayState, request: ChatCompletionRequestBody) -> Response {
    let ctx = RequestContext::new(state.request_timeout);
    match state.gateway.chat_completion(&request, &ctx).await {
        Err(err) => ApiError(err).into_response(),
        Ok(dispatched) => {
            let meta = DispatchMeta {
                provider: dispatched.used_provider,
                pool: dispatched.used_pool,
                fallback: dispatched.used_fallback,
            };
            let mut value = match serde_json::to_value(&dispatched.value.response) {
                Ok(value) => value,
                Err(err) => {
                    return ApiError(GatewayError::Internal(err.to_string())).into_response();
                }
            };
            if let JsonValue::Object(map) = &mut value {
                map.insert(
                    "_metadata".to_string(),
                    serde_json::json!({
                        "usedFallback": meta.fallback,
                        "usedProvider": meta.provider,
                    }),
                );
            }
            let mut response = (StatusCode::OK, Json(value)).into_response();
            apply_dispatch_headers(&mut response, &meta);
            response
        }
    }
}

async fn stream_chat(state: GatewayState, request: ChatCompletionRequestBody) -> Response {
    let ctx = RequestContext::new(state.streaming_timeout);
    match state.gateway.stream_chat_completion(&request, &ctx).await {
        Err(err) => ApiError(err).into_response(),
        Ok(dispatched) => {
            let meta = DispatchMeta {
                provider: dispatched.used_provider,
                pool: dispatched.used_pool,
                fallback: dispatched.used_fallback,
            };
            let mut response = Response::new(Body::from_stream(with_heartbeat(dispatched.value)));
            let headers = response.headers_mut();
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static("text/event-stream"),
            );
            headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
            headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
            apply_dispatch_headers(&mut response, &meta);
            response
        }
    }
}

fn apply_dispatch_headers(response: &mut Response, meta: &DispatchMeta) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&meta.provider) {
        headers.insert("X-Used-Provider", value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.pool) {
        headers.insert("X-Used-Pool", value);
    }
    if meta.fallback {
        headers.insert("X-Used-Fallback", HeaderValue::from_static("true"));
    }
}

/// Forward upstream frames verbatim, inserting a comment frame whenever the
/// stream idles past the heartbeat interval.
fn with_heartbeat(mut upstream: ByteStream) -> impl Stream<Item = Result<Bytes, Infallible>> {
    let (tx, out) = tokio::sync::mpsc::channel::<Bytes>(16);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                chunk = upstream.recv() => {
                    let Some(chunk) = chunk else {
                        break;
                    };
                    if tx.send(chunk).await.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(SSE_HEARTBEAT_INTERVAL) => {
                    if tx.send(Bytes::from_static(SSE_HEARTBEAT_FRAME)).await.is_err() {
                        break;
                    }
                }
            }
        }
    });
    ReceiverStream::new(out).map(Ok)
}
