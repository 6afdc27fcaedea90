use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;
use wreq::Method;

use poolgate_common::RequestContext;
use poolgate_protocol::chat::{
    ChatChoice, ChatCompletionRequestBody, ChatCompletionResponse, ChatMessage, ChatRole,
    MessageContent, Usage,
};
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{
    ByteStream, ChatOutcome, Credential, MergeMode, ModelRegistry, ProviderAdapter, ProviderConfig,
    ProviderKind, ProviderResult, TimeoutConfig,
};

use crate::client::{HttpBody, HttpClient, HttpRequest};
use crate::retry::{with_retries, RetryPolicy};
use crate::support::{
    build_url, error_from_response, provider_op_timeout, take_bytes, CredentialSource,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(crate) struct AnthropicAdapter {
    config: ProviderConfig,
    credentials: CredentialSource,
    client: HttpClient,
    registry: Arc<ModelRegistry>,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl AnthropicAdapter {
    pub(crate) fn new(
        config: ProviderConfig,
        credentials: CredentialSource,
        client: HttpClient,
        registry: Arc<ModelRegistry>,
        timeouts: TimeoutConfig,
    ) -> Self {
        let retry = RetryPolicy::new(
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
        );
        Self {
            config,
            credentials,
            client,
            registry,
            timeouts,
            retry,
        }
    }

    fn headers(&self, credential: &Credential) -> ProviderResult<Vec<(String, String)>> {
        let api_key = match credential {
            Credential::Simple(simple) => simple.api_key.clone(),
            other => {
                return Err(ProviderError::invalid_config(format!(
                    "anthropic provider requires a simple credential, got {}",
                    other.kind()
                )));
            }
        };
        let mut headers = vec![
            ("x-api-key".to_string(), api_key),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("Content-Type".to_string(), "application/json".to_string()),
            ("Accept".to_string(), "application/json".to_string()),
        ];
        for (name, value) in &self.config.headers {
            headers.push((name.clone(), value.clone()));
        }
        Ok(headers)
    }

    /// Build the `/v1/messages` body: system turns are hoisted to the
    /// top-level `system` field, everything else keeps conversation order.
    fn messages_body(
        &self,
        request: &ChatCompletionRequestBody,
        mode: MergeMode,
    ) -> ProviderResult<Bytes> {
        let mut caller = self.config.provider_params.clone();
        for (key, value) in request.caller_params() {
            caller.insert(key, value);
        }
        let merged =
            self.registry
                .effective_params(&self.config, &self.config.model_name, &caller, mode);
        for warning in &merged.warnings {
            tracing::warn!(provider = %self.config.name, "{warning}");
        }

        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                ChatRole::System | ChatRole::Developer => {
                    if let Some(text) = message.text() {
                        system_parts.push(text);
                    }
                }
                ChatRole::User | ChatRole::Tool => {
                    messages.push(serde_json::json!({
                        "role": "user",
                        "content": message.text().unwrap_or_default(),
                    }));
                }
                ChatRole::Assistant => {
                    messages.push(serde_json::json!({
                        "role": "assistant",
                        "content": message.text().unwrap_or_default(),
                    }));
                }
            }
        }

        let mut body = JsonMap::new();
        body.insert(
            "model".to_string(),
            JsonValue::String(self.config.model_name.clone()),
        );
        if !system_parts.is_empty() {
            body.insert(
                "system".to_string(),
                JsonValue::String(system_parts.join("\n\n")),
            );
        }
        body.insert("messages".to_string(), JsonValue::Array(messages));
        if mode == MergeMode::Stream {
            body.insert("stream".to_string(), JsonValue::Bool(true));
        }
        for (key, value) in merged.params {
            // The wire type is an array even when a single sequence was given.
            if key == "stop_sequences" {
                body.insert(key, normalize_stop_sequences(value));
            } else {
                body.insert(key, value);
            }
        }

        serde_json::to_vec(&JsonValue::Object(body))
            .map(Bytes::from)
            .map_err(|err| ProviderError::from_message(err.to_string()))
    }

    async fn post_messages(
        &self,
        body: Bytes,
        is_stream: bool,
        ctx: &RequestContext,
    ) -> ProviderResult<crate::client::HttpResponse> {
        let op_timeout = provider_op_timeout(&self.config, &self.timeouts, ctx);
        let credential = self
            .credentials
            .resolve(
                ctx,
                Duration::from_millis(self.timeouts.credential_timeout_ms),
            )
            .await?;
        let request = HttpRequest {
            method: Method::POST,
            url: build_url(&self.config.api_base, "/v1/messages"),
            headers: self.headers(&credential)?,
            body: Some(body),
            is_stream,
        };

        with_retries(&self.retry, ctx, |_attempt| {
            let request = request.clone();
            async move {
                let response = self.client.send(request, ctx, op_timeout).await?;
                if (200..300).contains(&response.status) {
                    Ok(response)
                } else {
                    Err(error_from_response(&self.config.name, response).await)
                }
            }
        })
        .await
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Anthropic
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ChatOutcome> {
        let body = self.messages_body(request, MergeMode::Chat)?;
        let response = self.post_messages(body, false, ctx).await?;
        let bytes = take_bytes(response.body).await;
        let parsed: MessagesResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::from_message(format!("invalid upstream json: {err}")))?;
        let response = chat_response_from(parsed, &self.config.model_name);
        let usage = response.usage.clone();
        Ok(ChatOutcome { response, usage })
    }

    async fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ByteStream> {
        let body = self.messages_body(request, MergeMode::Stream)?;
        let response = self.post_messages(body, true, ctx).await?;
        match response.body {
            HttpBody::Stream(stream) => Ok(stream),
            HttpBody::Bytes(bytes) => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.try_send(bytes);
                Ok(rx)
            }
        }
    }

    async fn health_check(&self, ctx: &RequestContext) -> ProviderResult<bool> {
        let op_timeout = provider_op_timeout(&self.config, &self.timeouts, ctx);
        let credential = self
            .credentials
            .resolve(
                ctx,
                Duration::from_millis(self.timeouts.credential_timeout_ms),
            )
            .await?;

        if self.config.health_check_params.is_some() {
            let probe = ChatCompletionRequestBody {
                messages: vec![ChatMessage::user("ping")],
                model: self.config.model_name.clone(),
                stream: None,
                stream_options: None,
                temperature: None,
                top_p: None,
                max_tokens: Some(1),
                max_completion_tokens: None,
                n: None,
                stop: None,
                presence_penalty: None,
                frequency_penalty: None,
                seed: None,
                user: None,
                tools: None,
                tool_choice: None,
                response_format: None,
                extra: JsonMap::new(),
            };
            let body = self.messages_body(&probe, MergeMode::HealthCheck)?;
            let request = HttpRequest {
                method: Method::POST,
                url: build_url(&self.config.api_base, "/v1/messages"),
                headers: self.headers(&credential)?,
                body: Some(body),
                is_stream: false,
            };
            let response = self.client.send(request, ctx, op_timeout).await?;
            return Ok((200..300).contains(&response.status));
        }

        let request = HttpRequest {
            method: Method::GET,
            url: build_url(&self.config.api_base, "/v1/models"),
            headers: self.headers(&credential)?,
            body: None,
            is_stream: false,
        };
        let response = self.client.send(request, ctx, op_timeout).await?;
        Ok((200..300).contains(&response.status))
    }
}

fn normalize_stop_sequences(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(single) => JsonValue::Array(vec![JsonValue::String(single)]),
        other => other,
    }
}

pub(crate) fn map_stop_reason(reason: &str) -> &'static str {
    match reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "stop_sequence" => "stop",
        "tool_use" => "tool_calls",
        _ => "stop",
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesResponse {
    id: String,
    content: Vec<ContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<MessagesUsage>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
}

pub(crate) fn chat_response_from(parsed: MessagesResponse, model: &str) -> ChatCompletionResponse {
    let text = parsed
        .content
        .iter()
        .filter(|block| block.kind == "text")
        .filter_map(|block| block.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    let usage = parsed.usage.map(|usage| Usage {
        prompt_tokens: usage.input_tokens,
        completion_tokens: usage.output_tokens,
        total_tokens: usage.input_tokens + usage.output_tokens,
        extra: JsonMap::new(),
    });
    ChatCompletionResponse {
        id: parsed.id,
        object: "chat.completion".to_string(),
        created: OffsetDateTime::now_utc().unix_timestamp(),
        model: model.to_string(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: ChatRole::Assistant,
                content: Some(MessageContent::Text(text)),
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: parsed
                .stop_reason
                .as_deref()
                .map(|reason| map_stop_reason(reason).to_string()),
            logprobs: None,
        }],
        usage,
        system_fingerprint: None,
        extra: JsonMap::new(),
    }
}
