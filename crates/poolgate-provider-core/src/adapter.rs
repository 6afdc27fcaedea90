use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use poolgate_common::RequestContext;
use poolgate_protocol::chat::{ChatCompletionRequestBody, ChatCompletionResponse, Usage};

use crate::config::ProviderKind;
use crate::error::ProviderResult;

/// Upstream body bytes, delivered as they arrive. The sender side is owned
/// by the adapter's transport task; dropping the receiver cancels it.
pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

#[derive(Debug)]
pub struct ChatOutcome {
    pub response: ChatCompletionResponse,
    pub usage: Option<Usage>,
}

/// Uniform surface the dispatch engine drives. One instance per configured
/// provider inside a pool; construction happens in the provider factory.
///
/// Every operation honors the context's deadline and cancellation: adapters
/// attach the signal to their HTTP calls and stop retrying once cancelled.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Configured provider name (unique within its pool).
    fn name(&self) -> &str;

    fn kind(&self) -> ProviderKind;

    /// Upstream model identifier requests are rewritten to.
    fn model_name(&self) -> &str;

    async fn chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ChatOutcome>;

    /// SSE byte stream, forwarded verbatim by the streaming proxy.
    async fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> ProviderResult<ByteStream>;

    /// Cheap availability probe: `GET /models`, or a 1-token chat call when
    /// the provider is configured with health-check parameters.
    async fn health_check(&self, ctx: &RequestContext) -> ProviderResult<bool>;
}

pub type ProviderHandle = Arc<dyn ProviderAdapter>;
