use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::chat::{
    ChatCompletionRequestBody, ChatCompletionResponse, ChatMessage, StopConfiguration,
    StreamOptions, Usage,
};

/// Legacy text-completion request. The gateway rewrites it into a chat
/// request with a single user message before dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequestBody {
    pub model: String,
    pub prompt: PromptInput,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopConfiguration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: JsonMap<String, JsonValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PromptInput {
    Text(String),
    Many(Vec<String>),
}

impl PromptInput {
    pub fn joined(&self) -> String {
        match self {
            PromptInput::Text(text) => text.clone(),
            PromptInput::Many(parts) => parts.join("\n"),
        }
    }
}

impl CompletionRequestBody {
    pub fn into_chat(self) -> ChatCompletionRequestBody {
        ChatCompletionRequestBody {
            messages: vec![ChatMessage::user(self.prompt.joined())],
            model: self.model,
            stream: self.stream,
            stream_options: None::<StreamOptions>,
            temperature: self.temperature,
            top_p: self.top_p,
            max_tokens: self.max_tokens,
            max_completion_tokens: None,
            n: self.n,
            stop: self.stop,
            presence_penalty: self.presence_penalty,
            frequency_penalty: self.frequency_penalty,
            seed: None,
            user: self.user,
            tools: None,
            tool_choice: None,
            response_format: None,
            extra: self.extra,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub text: String,
    pub index: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<JsonValue>,
}

impl CompletionResponse {
    /// Project a chat completion back into the legacy text shape.
    pub fn from_chat(response: ChatCompletionResponse) -> Self {
        let choices = response
            .choices
            .into_iter()
            .map(|choice| CompletionChoice {
                text: choice.message.text().unwrap_or_default(),
                index: choice.index,
                finish_reason: choice.finish_reason,
                logprobs: choice.logprobs,
            })
            .collect();
        Self {
            id: response.id,
            object: "text_completion".to_string(),
            created: response.created,
            model: response.model,
            choices,
            usage: response.usage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::ChatRole;

    #[test]
    fn rewrite_produces_single_user_message() {
        let body: CompletionRequestBody = serde_json::from_str(
            r#"{"model":"gpt-3.5-turbo-instruct","prompt":"Say hi","max_tokens":16}"#,
        )
        .unwrap();
        let chat = body.into_chat();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.messages[0].role, ChatRole::User);
        assert_eq!(chat.messages[0].text().unwrap(), "Say hi");
        assert_eq!(chat.max_tokens, Some(16));
    }

    #[test]
    fn array_prompts_are_joined() {
        let prompt: PromptInput = serde_json::from_str(r#"["a","b"]"#).unwrap();
        assert_eq!(prompt.joined(), "a\nb");
    }
}
