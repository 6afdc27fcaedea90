use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ChatCompletionRequestBody {
    /// A list of messages comprising the conversation so far.
    /// Must contain at least 1 message (enforced by the HTTP layer).
    pub messages: Vec<ChatMessage>,
    /// Logical model name resolved against the gateway's model table.
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Range is 0..=2.0 (not enforced here).
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Range is 0.0..=1.0 (not enforced here).
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_completion_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Range is -2.0..=2.0 (not enforced here).
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    /// Range is -2.0..=2.0 (not enforced here).
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<JsonValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<JsonValue>,
    /// Provider-specific extensions (e.g. `enable_thinking`). Forwarded to
    /// adapters and merged with model-registry defaults on a best-effort basis.
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

impl ChatCompletionRequestBody {
    pub fn is_stream(&self) -> bool {
        self.stream.unwrap_or(false)
    }

    /// Caller-supplied tuning parameters as a flat JSON map, the shape the
    /// model-registry merge operates on. Structural fields (messages, model,
    /// stream) are excluded.
    pub fn caller_params(&self) -> JsonMap<String, JsonValue> {
        let mut out = JsonMap::new();
        macro_rules! put {
            ($key:literal, $value:expr) => {
                if let Some(value) = &$value {
                    if let Ok(json) = serde_json::to_value(value) {
                        out.insert($key.to_string(), json);
                    }
                }
            };
        }
        put!("temperature", self.temperature);
        put!("top_p", self.top_p);
        put!("max_tokens", self.max_tokens);
        put!("max_completion_tokens", self.max_completion_tokens);
        put!("n", self.n);
        put!("stop", self.stop);
        put!("presence_penalty", self.presence_penalty);
        put!("frequency_penalty", self.frequency_penalty);
        put!("seed", self.seed);
        put!("tools", self.tools);
        put!("tool_choice", self.tool_choice);
        put!("response_format", self.response_format);
        for (key, value) in &self.extra {
            out.insert(key.clone(), value.clone());
        }
        out
    }
}

/// Up to 4 stop sequences are allowed, but this limit is not enforced here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopConfiguration {
    Single(String),
    Many(Vec<String>),
}

impl StopConfiguration {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            StopConfiguration::Single(stop) => vec![stop],
            StopConfiguration::Many(stops) => stops,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_usage: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<MessageContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: Some(MessageContent::Text(content.into())),
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn text(&self) -> Option<String> {
        match &self.content {
            Some(MessageContent::Text(text)) => Some(text.clone()),
            Some(MessageContent::Parts(parts)) => {
                let joined: Vec<&str> = parts
                    .iter()
                    .filter_map(|part| part.text.as_deref())
                    .collect();
                if joined.is_empty() {
                    None
                } else {
                    Some(joined.join(""))
                }
            }
            None => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    Developer,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_fingerprint: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChoice {
    pub index: i64,
    pub message: ChatMessage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<JsonValue>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_land_in_extra() {
        let body: ChatCompletionRequestBody = serde_json::from_str(
            r#"{"model":"qwen2.5-72b-instruct","messages":[{"role":"user","content":"hi"}],
                "temperature":0.3,"enable_thinking":false}"#,
        )
        .unwrap();
        assert_eq!(body.extra["enable_thinking"], false);
        let params = body.caller_params();
        assert_eq!(params["temperature"], 0.3);
        assert_eq!(params["enable_thinking"], false);
    }

    #[test]
    fn stop_accepts_string_and_array() {
        let single: StopConfiguration = serde_json::from_str(r#""END""#).unwrap();
        assert_eq!(single.into_vec(), vec!["END".to_string()]);
        let many: StopConfiguration = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(many.into_vec().len(), 2);
    }

    #[test]
    fn message_text_joins_parts() {
        let message: ChatMessage = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}"#,
        )
        .unwrap();
        assert_eq!(message.text().unwrap(), "ab");
    }
}
