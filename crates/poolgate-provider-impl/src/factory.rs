use std::sync::Arc;

use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{
    CredentialRegistry, ModelRegistry, ProviderConfig, ProviderHandle, ProviderKind,
    ProviderResult, StoreKey, TimeoutConfig,
};

use crate::anthropic::AnthropicAdapter;
use crate::bedrock::BedrockAdapter;
use crate::client::HttpClient;
use crate::openai::OpenAiAdapter;
use crate::support::CredentialSource;

/// Builds provider adapters on demand for the dispatch engine. One factory
/// per gateway; adapters share the HTTP client and model registry.
pub struct ProviderFactory {
    client: HttpClient,
    registry: Arc<ModelRegistry>,
    credentials: Arc<CredentialRegistry>,
    timeouts: TimeoutConfig,
}

impl ProviderFactory {
    pub fn new(
        client: HttpClient,
        registry: Arc<ModelRegistry>,
        credentials: Arc<CredentialRegistry>,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            client,
            registry,
            credentials,
            timeouts,
        }
    }

    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.credentials
    }

    pub fn create(&self, config: &ProviderConfig) -> ProviderResult<ProviderHandle> {
        config
            .validate()
            .map_err(ProviderError::invalid_config)?;
        let source = self.credential_source(config)?;

        let adapter: ProviderHandle = match config.kind {
            ProviderKind::Anthropic => Arc::new(AnthropicAdapter::new(
                config.clone(),
                source,
                self.client.clone(),
                self.registry.clone(),
                self.timeouts.clone(),
            )),
            ProviderKind::Bedrock => Arc::new(BedrockAdapter::new(
                config.clone(),
                source,
                self.client.clone(),
                self.registry.clone(),
                self.timeouts.clone(),
            )),
            // Everything else speaks the OpenAI-compatible wire shape.
            ProviderKind::OpenAI
            | ProviderKind::Together
            | ProviderKind::Runpod
            | ProviderKind::Alibaba
            | ProviderKind::Azure
            | ProviderKind::Vertex
            | ProviderKind::Custom => Arc::new(OpenAiAdapter::new(
                config.clone(),
                source,
                self.client.clone(),
                self.registry.clone(),
                self.timeouts.clone(),
            )),
        };
        Ok(adapter)
    }

    fn credential_source(&self, config: &ProviderConfig) -> ProviderResult<CredentialSource> {
        if let Some(reference) = &config.credentials_ref {
            let store = self
                .credentials
                .get(StoreKey::from(reference))
                .map_err(|err| ProviderError::invalid_config(err.to_string()))?;
            return Ok(CredentialSource::Store(store));
        }
        if let Some(api_key) = &config.api_key {
            return Ok(CredentialSource::direct_key(api_key));
        }
        Err(ProviderError::invalid_config(
            "provider has neither credentialsRef nor apiKey",
        ))
    }
}
