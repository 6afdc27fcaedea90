mod families;
mod sigv4;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;
use wreq::Method;

use poolgate_common::RequestContext;
use poolgate_protocol::chat::ChatCompletionRequestBody;
use poolgate_protocol::sse::done_frame;
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{
    ByteStream, ChatOutcome, Credential, MergeMode, ModelRegistry, ProviderAdapter, ProviderConfig,
    ProviderKind, ProviderResult, TimeoutConfig,
};

use crate::client::{HttpBody, HttpClient, HttpRequest};
use crate::retry::{with_retries, RetryPolicy};
use crate::support::{error_from_response, provider_op_timeout, take_bytes, CredentialSource};

use families::{translator_for, FamilyTranslator};
use sigv4::SigV4Signer;

const RUNTIME_SERVICE: &str = "bedrock";
const SUPPORTED_BEDROCK_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-2",
    "ca-central-1",
    "eu-west-1",
    "eu-west-2",
    "eu-west-3",
    "eu-central-1",
    "eu-north-1",
    "ap-northeast-1",
    "ap-northeast-2",
    "ap-south-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "sa-east-1",
];

pub(crate) struct BedrockAdapter {
    config: ProviderConfig,
    credentials: CredentialSource,
    client: HttpClient,
    registry: Arc<ModelRegistry>,
    timeouts: TimeoutConfig,
    retry: RetryPolicy,
}

impl BedrockAdapter {
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

    fn translator(&self) -> ProviderResult<&'static dyn FamilyTranslator> {
        translator_for(&self.config.model_name).ok_or_else(|| {
            ProviderError::invalid_config(format!(
                "no bedrock model family translator for {}",
                self.config.model_name
            ))
        })
    }

    fn merged_params(
        &self,
        request: &ChatCompletionRequestBody,
        mode: MergeMode,
    ) -> JsonMap<String, JsonValue> {
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
        merged.params
    }

    async fn signer(&self, ctx: &RequestContext) -> ProviderResult<(SigV4Signer, String)> {
        let credential = self
            .credentials
            .resolve(
                ctx,
                Duration::from_millis(self.timeouts.credential_timeout_ms),
            )
            .await?;
        let (keys, region) = match credential {
            Credential::Aws(aws) => (
                (
                    aws.access_key_id.clone(),
                    aws.secret_access_key.clone(),
                    aws.session_token.clone(),
                ),
                aws.region.clone(),
            ),
            Credential::AwsInstanceProfile { region }
            | Credential::AwsWebIdentity { region } => {
                // Ambient identities are materialized into the process
                // environment by the runtime that owns them.
                let access = std::env::var("AWS_ACCESS_KEY_ID").map_err(|_| {
                    ProviderError::invalid_config(
                        "ambient aws credentials are not present in the environment",
                    )
                })?;
                let secret = std::env::var("AWS_SECRET_ACCESS_KEY").map_err(|_| {
                    ProviderError::invalid_config(
                        "ambient aws credentials are not present in the environment",
                    )
                })?;
                let token = std::env::var("AWS_SESSION_TOKEN").ok();
                ((access, secret, token), region)
            }
            other => {
                return Err(ProviderError::invalid_config(format!(
                    "bedrock provider requires an aws credential, got {}",
                    other.kind()
                )));
            }
        };

        if !SUPPORTED_BEDROCK_REGIONS.contains(&region.as_str()) {
            return Err(ProviderError::invalid_config(format!(
                "region {region} is not a supported bedrock region"
            )));
        }

        Ok((
            SigV4Signer {
                access_key_id: keys.0,
                secret_access_key: keys.1,
                session_token: keys.2,
                region: region.clone(),
                service: RUNTIME_SERVICE.to_string(),
            },
            region,
        ))
    }

    async fn invoke(
        &self,
        path_suffix: &str,
        body: Bytes,
        is_stream: bool,
        ctx: &RequestContext,
    ) -> ProviderResult<crate::client::HttpResponse> {
        let op_timeout = provider_op_timeout(&self.config, &self.timeouts, ctx);
        let (signer, region) = self.signer(ctx).await?;
        let url = format!(
            "https://bedrock-runtime.{region}.amazonaws.com/model/{}/{path_suffix}",
            self.config.model_name
        );

        with_retries(&self.retry, ctx, |_attempt| {
            // Signatures are time-based, so each attempt signs afresh.
            let mut headers = vec![
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Accept".to_string(), "application/json".to_string()),
            ];
            for (name, value) in &self.config.headers {
                headers.push((name.clone(), value.clone()));
            }
            let body = body.clone();
            let url = url.clone();
            let signer = &signer;
            async move {
                signer.sign("POST", &url, &mut headers, &body, OffsetDateTime::now_utc())?;
                let request = HttpRequest {
                    method: Method::POST,
                    url,
                    headers,
                    body: Some(body),
                    is_stream,
                };
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
impl ProviderAdapter for BedrockAdapter {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn kind(&self) -> ProviderKind {
        ProviderKind::Bedrock
    }

    fn model_name(&self) -> &str {
        &self.config.model_name
    }

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ChatOutcome> {
        let translator = self.translator()?;
        let params = self.merged_params(request, MergeMode::Chat);
        let body = translator.build_body(request, &params)?;
        let body = serde_json::to_vec(&body)
            .map(Bytes::from)
            .map_err(|err| ProviderError::from_message(err.to_string()))?;

        let response = self.invoke("invoke", body, false, ctx).await?;
        let bytes = take_bytes(response.body).await;
        let response = translator.parse_response(&bytes, &self.config.model_name)?;
        let usage = response.usage.clone();
        Ok(ChatOutcome { response, usage })
    }

    async fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ByteStream> {
        let translator = self.translator()?;
        let params = self.merged_params(request, MergeMode::Stream);
        let body = translator.build_body(request, &params)?;
        let body = serde_json::to_vec(&body)
            .map(Bytes::from)
            .map_err(|err| ProviderError::from_message(err.to_string()))?;

        let response = self
            .invoke("invoke-with-response-stream", body, true, ctx)
            .await?;
        let upstream = match response.body {
            HttpBody::Stream(stream) => stream,
            HttpBody::Bytes(bytes) => {
                let (tx, rx) = tokio::sync::mpsc::channel(1);
                let _ = tx.try_send(bytes);
                rx
            }
        };

        // Re-frame the binary event stream as SSE before it reaches the proxy.
        let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
        let mut upstream = upstream;
        tokio::spawn(async move {
            let mut decoder = EventStreamDecoder::default();
            while let Some(chunk) = upstream.recv().await {
                for payload in decoder.push(&chunk) {
                    let Some(frame) = translator.chunk_to_sse(&payload) else {
                        continue;
                    };
                    if tx.send(frame).await.is_err() {
                        return;
                    }
                }
            }
            let _ = tx.send(done_frame()).await;
        });
        Ok(rx)
    }

    async fn health_check(&self, ctx: &RequestContext) -> ProviderResult<bool> {
        if self.config.health_check_params.is_some() {
            let probe: ChatCompletionRequestBody = serde_json::from_value(serde_json::json!({
                "model": self.config.model_name,
                "messages": [{"role": "user", "content": "ping"}],
                "max_tokens": 1,
            }))
            .map_err(|err| ProviderError::from_message(err.to_string()))?;
            return self.chat_completion(&probe, ctx).await.map(|_| true);
        }

        // Without probe parameters, list foundation models on the control plane.
        let op_timeout = provider_op_timeout(&self.config, &self.timeouts, ctx);
        let (signer, region) = self.signer(ctx).await?;
        let url = format!("https://bedrock.{region}.amazonaws.com/foundation-models");
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];
        signer.sign("GET", &url, &mut headers, b"", OffsetDateTime::now_utc())?;
        let request = HttpRequest {
            method: Method::GET,
            url,
            headers,
            body: None,
            is_stream: false,
        };
        let response = self.client.send(request, ctx, op_timeout).await?;
        Ok((200..300).contains(&response.status))
    }
}

/// Minimal decoder for the AWS event-stream framing used by
/// `invoke-with-response-stream`: extracts each frame's JSON payload and
/// unwraps the base64 `bytes` field carrying the model chunk.
#[derive(Default)]
struct EventStreamDecoder {
    buf: Vec<u8>,
}

impl EventStreamDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        loop {
            if self.buf.len() < 16 {
                break;
            }
            let total = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            if total < 16 || total > 16 * 1024 * 1024 {
                // Corrupt frame; drop the buffer rather than loop forever.
                self.buf.clear();
                break;
            }
            if self.buf.len() < total {
                break;
            }
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
            let payload_start = 12 + headers_len;
            let payload_end = total - 4;
            if payload_start <= payload_end {
                let payload = &self.buf[payload_start..payload_end];
                if let Some(decoded) = unwrap_chunk_payload(payload) {
                    out.push(decoded);
                }
            }
            self.buf.drain(..total);
        }
        out
    }
}

fn unwrap_chunk_payload(payload: &[u8]) -> Option<Vec<u8>> {
    let value: JsonValue = serde_json::from_slice(payload).ok()?;
    let encoded = value.get("bytes")?.as_str()?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(payload: &[u8]) -> Vec<u8> {
        let headers: &[u8] = &[];
        let total = 12 + headers.len() + payload.len() + 4;
        let mut out = Vec::with_capacity(total);
        out.extend_from_slice(&(total as u32).to_be_bytes());
        out.extend_from_slice(&(headers.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0]); // prelude crc (unchecked)
        out.extend_from_slice(headers);
        out.extend_from_slice(payload);
        out.extend_from_slice(&[0, 0, 0, 0]); // message crc (unchecked)
        out
    }

    #[test]
    fn decoder_extracts_base64_chunks_across_partial_reads() {
        let chunk = serde_json::json!({"type": "content_block_delta", "delta": {"text": "hi"}});
        let encoded = base64::engine::general_purpose::STANDARD
            .encode(serde_json::to_vec(&chunk).unwrap());
        let payload = serde_json::to_vec(&serde_json::json!({ "bytes": encoded })).unwrap();
        let bytes = frame(&payload);

        let mut decoder = EventStreamDecoder::default();
        let (head, tail) = bytes.split_at(bytes.len() / 2);
        assert!(decoder.push(head).is_empty());
        let decoded = decoder.push(tail);
        assert_eq!(decoded.len(), 1);
        let value: JsonValue = serde_json::from_slice(&decoded[0]).unwrap();
        assert_eq!(value["type"], "content_block_delta");
    }

    #[test]
    fn corrupt_frames_do_not_stall_the_decoder() {
        let mut decoder = EventStreamDecoder::default();
        assert!(decoder.push(&[0xFF; 32]).is_empty());
        assert!(decoder.buf.is_empty());
    }
}
