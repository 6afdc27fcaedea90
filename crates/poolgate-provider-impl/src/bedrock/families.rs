use bytes::Bytes;
use serde::Deserialize;
use serde_json::{Map as JsonMap, Value as JsonValue};
use time::OffsetDateTime;

use poolgate_protocol::chat::{
    ChatChoice, ChatCompletionRequestBody, ChatCompletionResponse, ChatMessage, ChatRole,
    MessageContent, Usage,
};
use poolgate_protocol::sse::data_frame;
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::ProviderResult;

use crate::anthropic::{chat_response_from, MessagesResponse};

/// Request/response translation for one Bedrock model family, keyed by the
/// model id prefix (`anthropic.`, `amazon.titan`, `meta.llama`).
pub(crate) trait FamilyTranslator: Send + Sync {
    fn build_body(
        &self,
        request: &ChatCompletionRequestBody,
        params: &JsonMap<String, JsonValue>,
    ) -> ProviderResult<JsonValue>;

    fn parse_response(&self, body: &[u8], model: &str) -> ProviderResult<ChatCompletionResponse>;

    /// Wrap a decoded stream payload as an SSE frame. Payloads are forwarded
    /// provider-native; `None` drops the chunk.
    fn chunk_to_sse(&self, payload: &[u8]) -> Option<Bytes> {
        Some(data_frame(payload))
    }
}

pub(crate) fn translator_for(model_id: &str) -> Option<&'static dyn FamilyTranslator> {
    if model_id.starts_with("anthropic.") || model_id.contains(".anthropic.") {
        return Some(&AnthropicFamily);
    }
    if model_id.starts_with("amazon.titan") {
        return Some(&TitanFamily);
    }
    if model_id.starts_with("meta.llama") {
        return Some(&LlamaFamily);
    }
    None
}

struct AnthropicFamily;

impl FamilyTranslator for AnthropicFamily {
    fn build_body(
        &self,
        request: &ChatCompletionRequestBody,
        params: &JsonMap<String, JsonValue>,
    ) -> ProviderResult<JsonValue> {
        let mut system_parts = Vec::new();
        let mut messages = Vec::new();
        for message in &request.messages {
            match message.role {
                ChatRole::System | ChatRole::Developer => {
                    if let Some(text) = message.text() {
                        system_parts.push(text);
                    }
                }
                ChatRole::Assistant => messages.push(serde_json::json!({
                    "role": "assistant",
                    "content": message.text().unwrap_or_default(),
                })),
                ChatRole::User | ChatRole::Tool => messages.push(serde_json::json!({
                    "role": "user",
                    "content": message.text().unwrap_or_default(),
                })),
            }
        }

        let mut body = JsonMap::new();
        body.insert(
            "anthropic_version".to_string(),
            JsonValue::String("bedrock-2023-05-31".to_string()),
        );
        if !system_parts.is_empty() {
            body.insert(
                "system".to_string(),
                JsonValue::String(system_parts.join("\n\n")),
            );
        }
        body.insert("messages".to_string(), JsonValue::Array(messages));
        for (key, value) in params {
            if key == "stop_sequences" {
                let value = match value {
                    JsonValue::String(single) => {
                        JsonValue::Array(vec![JsonValue::String(single.clone())])
                    }
                    other => other.clone(),
                };
                body.insert(key.clone(), value);
                continue;
            }
            body.insert(key.clone(), value.clone());
        }
        if !body.contains_key("max_tokens") {
            body.insert("max_tokens".to_string(), serde_json::json!(4096));
        }
        Ok(JsonValue::Object(body))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> ProviderResult<ChatCompletionResponse> {
        let parsed: MessagesResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::from_message(format!("invalid bedrock json: {err}")))?;
        Ok(chat_response_from(parsed, model))
    }
}

struct TitanFamily;

#[derive(Debug, Deserialize)]
struct TitanResponse {
    #[serde(rename = "inputTextTokenCount", default)]
    input_text_token_count: i64,
    results: Vec<TitanResult>,
}

#[derive(Debug, Deserialize)]
struct TitanResult {
    #[serde(rename = "tokenCount", default)]
    token_count: i64,
    #[serde(rename = "outputText", default)]
    output_text: String,
    #[serde(rename = "completionReason", default)]
    completion_reason: Option<String>,
}

impl FamilyTranslator for TitanFamily {
    fn build_body(
        &self,
        request: &ChatCompletionRequestBody,
        params: &JsonMap<String, JsonValue>,
    ) -> ProviderResult<JsonValue> {
        let prompt = flatten_prompt(request);
        let mut generation = JsonMap::new();
        copy_param(params, "max_tokens", "maxTokenCount", &mut generation);
        copy_param(params, "temperature", "temperature", &mut generation);
        copy_param(params, "top_p", "topP", &mut generation);
        copy_param(params, "stop_sequences", "stopSequences", &mut generation);
        Ok(serde_json::json!({
            "inputText": prompt,
            "textGenerationConfig": JsonValue::Object(generation),
        }))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> ProviderResult<ChatCompletionResponse> {
        let parsed: TitanResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::from_message(format!("invalid bedrock json: {err}")))?;
        let result = parsed
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::from_message("bedrock response had no results"))?;
        let finish_reason = match result.completion_reason.as_deref() {
            Some("LENGTH") => "length",
            _ => "stop",
        };
        Ok(simple_chat_response(
            model,
            result.output_text,
            finish_reason,
            parsed.input_text_token_count,
            result.token_count,
        ))
    }
}

struct LlamaFamily;

#[derive(Debug, Deserialize)]
struct LlamaResponse {
    #[serde(default)]
    generation: String,
    #[serde(default)]
    prompt_token_count: i64,
    #[serde(default)]
    generation_token_count: i64,
    #[serde(default)]
    stop_reason: Option<String>,
}

impl FamilyTranslator for LlamaFamily {
    fn build_body(
        &self,
        request: &ChatCompletionRequestBody,
        params: &JsonMap<String, JsonValue>,
    ) -> ProviderResult<JsonValue> {
        let mut body = JsonMap::new();
        body.insert(
            "prompt".to_string(),
            JsonValue::String(flatten_prompt(request)),
        );
        copy_param(params, "max_tokens", "max_gen_len", &mut body);
        copy_param(params, "temperature", "temperature", &mut body);
        copy_param(params, "top_p", "top_p", &mut body);
        Ok(JsonValue::Object(body))
    }

    fn parse_response(&self, body: &[u8], model: &str) -> ProviderResult<ChatCompletionResponse> {
        let parsed: LlamaResponse = serde_json::from_slice(body)
            .map_err(|err| ProviderError::from_message(format!("invalid bedrock json: {err}")))?;
        let finish_reason = match parsed.stop_reason.as_deref() {
            Some("length") => "length",
            _ => "stop",
        };
        Ok(simple_chat_response(
            model,
            parsed.generation,
            finish_reason,
            parsed.prompt_token_count,
            parsed.generation_token_count,
        ))
    }
}

fn flatten_prompt(request: &ChatCompletionRequestBody) -> String {
    request
        .messages
        .iter()
        .filter_map(|message| {
            let text = message.text()?;
            let role = match message.role {
                ChatRole::System | ChatRole::Developer => "System",
                ChatRole::User | ChatRole::Tool => "User",
                ChatRole::Assistant => "Assistant",
            };
            Some(format!("{role}: {text}"))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn copy_param(
    params: &JsonMap<String, JsonValue>,
    from: &str,
    to: &str,
    target: &mut JsonMap<String, JsonValue>,
) {
    if let Some(value) = params.get(from) {
        target.insert(to.to_string(), value.clone());
    }
}

fn simple_chat_response(
    model: &str,
    text: String,
    finish_reason: &str,
    prompt_tokens: i64,
    completion_tokens: i64,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: format!("chatcmpl-{}", uuid_ish(model, &text)),
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
            finish_reason: Some(finish_reason.to_string()),
            logprobs: None,
        }],
        usage: Some(Usage {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
            extra: JsonMap::new(),
        }),
        system_fingerprint: None,
        extra: JsonMap::new(),
    }
}

fn uuid_ish(model: &str, text: &str) -> String {
    // Stable-enough id for a synthesized response envelope.
    let mut hash = 0xcbf29ce484222325u64;
    for byte in model.bytes().chain(text.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{hash:016x}")
}
