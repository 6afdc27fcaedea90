use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};
use wreq::Method;

use poolgate_common::RequestContext;
use poolgate_protocol::chat::{ChatCompletionRequestBody, ChatCompletionResponse};
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{
    ByteStream, ChatOutcome, MergeMode, ModelRegistry, ProviderAdapter, ProviderConfig,
    ProviderKind, ProviderResult, TimeoutConfig,
};

use crate::client::{HttpBody, HttpClient, HttpRequest};
use crate::retry::{with_retries, RetryPolicy};
use crate::support::{
    base_headers, build_url, error_from_response, provider_op_timeout, take_bytes,
    CredentialSource,
};

/// Adapter for OpenAI-compatible chat endpoints. Besides `openai` proper it
/// serves the together/runpod/alibaba/azure/vertex/custom kinds, all of which
/// speak the same wire shape behind different base URLs.
pub(crate) struct OpenAiAdapter {
    config: ProviderConfig,
    credentials: CredentialSource,
    client: HttpClient,
    registry: Arc<ModelRegistry>,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl OpenAiAdapter {
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

    fn chat_body(
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

        let mut body = JsonMap::new();
        body.insert(
            "model".to_string(),
            JsonValue::String(self.config.model_name.clone()),
        );
        body.insert(
            "messages".to_string(),
            serde_json::to_value(&request.messages)
                .map_err(|err| ProviderError::from_message(err.to_string()))?,
        );
        if mode == MergeMode::Stream {
            body.insert("stream".to_string(), JsonValue::Bool(true));
            if let Some(options) = &request.stream_options {
                if let Ok(value) = serde_json::to_value(options) {
                    body.insert("stream_options".to_string(), value);
                }
            }
        }
        for (key, value) in merged.params {
            body.insert(key, value);
        }

        serde_json::to_vec(&JsonValue::Object(body))
            .map(Bytes::from)
            .map_err(|err| ProviderError::from_message(err.to_string()))
    }

    async fn post_chat(
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
            url: build_url(&self.config.api_base, "/chat/completions"),
            headers: base_headers(&self.config, &credential),
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
impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProviderKind {
        self.config.kind
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ChatOutcome> {
        let body = self.chat_body(request, MergeMode::Chat)?;
        let response = self.post_chat(body, false, ctx).await?;
        let bytes = take_bytes(response.body).await;
        let response: ChatCompletionResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ProviderError::from_message(format!("invalid upstream json: {err}")))?;
        let usage = response.usage.clone();
        Ok(ChatOutcome { response, usage })
    }

    async fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ByteStream> {
        let body = self.chat_body(request, MergeMode::Stream)?;
        let response = self.post_chat(body, true, ctx).await?;
        match response.body {
            HttpBody::Stream(stream) => Ok(stream),
            HttpBody::Bytes(bytes) => {
                // Upstream answered without chunking; surface it as a one-shot stream.
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
                messages: vec![poolgate_protocol::chat::ChatMessage::user("ping")],
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
            let body = self.chat_body(&probe, MergeMode::HealthCheck)?;
            let request = HttpRequest {
                method: Method::POST,
                url: build_url(&self.config.api_base, "/chat/completions"),
                headers: base_headers(&self.config, &credential),
                body: Some(body),
                is_stream: false,
            };
            let response = self.client.send(request, ctx, op_timeout).await?;
            return Ok((200..300).contains(&response.status));
        }

        let request = HttpRequest {
            method: Method::GET,
            url: build_url(&self.config.api_base, "/models"),
            headers: base_headers(&self.config, &credential),
            body: None,
            is_stream: false,
        };
        let response = self.client.send(request, ctx, op_timeout).await?;
        Ok((200..300).contains(&response.status))
    }
}
