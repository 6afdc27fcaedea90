use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use serde_json::{Map as JsonMap, Value as JsonValue};

use poolgate_common::{GatewayError, RequestContext};
use poolgate_protocol::chat::ChatCompletionRequestBody;
use poolgate_provider_core::{ByteStream, ChatOutcome, CredentialRegistry, GatewayConfig};

use crate::health::manager::ProviderHealthManager;
use crate::health::provider_key;
use crate::pool::health::{PoolHealthReport, PoolStatus};
use crate::pool::{Dispatched, PoolManager, PoolMetricsSnapshot};
use crate::stream::StreamingProxy;

/// Everything built from one validated config snapshot. Reloads build a new
/// runtime and swap it in; in-flight requests keep the runtime they started
/// with through the `Arc`.
pub struct EngineRuntime {
    pub config: Arc<GatewayConfig>,
    pub pool_manager: Arc<PoolManager>,
    pub health: Arc<ProviderHealthManager>,
    pub credentials: Arc<CredentialRegistry>,
    pub streaming: StreamingProxy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub status: PoolStatus,
    pub pools: Vec<PoolHealthReport>,
    pub models: HashMap<String, String>,
}

impl HealthStatus {
    pub fn any_pool_usable(&self) -> bool {
        self.pools
            .iter()
            .any(|pool| pool.status != PoolStatus::Unhealthy)
    }
}

/// Top-level dispatch entry the HTTP adapter drives.
pub struct Gateway {
    runtime: ArcSwap<EngineRuntime>,
}

impl Gateway {
    pub fn new(runtime: EngineRuntime) -> Self {
        Self {
            runtime: ArcSwap::from_pointee(runtime),
        }
    }

    pub fn runtime(&self) -> Arc<EngineRuntime> {
        self.runtime.load_full()
    }

    /// Swap in a runtime built from a newly validated config snapshot.
    pub fn apply_runtime(&self, runtime: EngineRuntime) {
        self.runtime.store(Arc::new(runtime));
    }

    pub fn is_model_supported(&self, model: &str) -> bool {
        self.runtime().pool_manager.is_model_supported(model)
    }

    pub fn supported_models(&self) -> Vec<String> {
        self.runtime().pool_manager.models()
    }

    pub fn model_pool_mapping(&self) -> HashMap<String, String> {
        self.runtime().pool_manager.model_to_pool().clone()
    }

    pub fn pool_names(&self) -> Vec<String> {
        self.runtime().pool_manager.pool_names()
    }

    pub async fn chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> Result<Dispatched<ChatOutcome>, GatewayError> {
        let runtime = self.runtime();
        let request = self.prepared(&runtime, request)?;
        runtime
            .pool_manager
            .execute_with_pool_fallback(&request.model, ctx, |adapter| {
                let request = &request;
                async move { adapter.chat_completion(request, ctx).await }
            })
            .await
    }

    /// Streaming dispatch; the returned byte stream is already piped through
    /// the streaming proxy and honors the context.
    pub async fn stream_chat_completion(
        &self,
        request: &ChatCompletionRequestBody,
        ctx: &RequestContext,
    ) -> Result<Dispatched<ByteStream>, GatewayError> {
        let runtime = self.runtime();
        let request = self.prepared(&runtime, request)?;
        let dispatched = runtime
            .pool_manager
            .execute_with_pool_fallback(&request.model, ctx, |adapter| {
                let request = &request;
                async move { adapter.stream_chat_completion(request, ctx).await }
            })
            .await?;

        let Dispatched {
            value,
            used_provider,
            used_pool,
            used_fallback,
        } = dispatched;
        Ok(Dispatched {
            value: runtime.streaming.pump(value, ctx.clone()),
            used_provider,
            used_pool,
            used_fallback,
        })
    }

    fn prepared(
        &self,
        runtime: &EngineRuntime,
        request: &ChatCompletionRequestBody,
    ) -> Result<ChatCompletionRequestBody, GatewayError> {
        if !runtime.pool_manager.is_model_supported(&request.model) {
            return Err(GatewayError::ModelNotFound(request.model.clone()));
        }
        let mut request = request.clone();
        if let Some(binding) = runtime.config.models.get(&request.model) {
            if let Some(defaults) = &binding.default_parameters {
                apply_model_defaults(&mut request, defaults);
            }
        }
        Ok(request)
    }

    pub fn health_status(&self) -> HealthStatus {
        let runtime = self.runtime();
        let pools = runtime.pool_manager.all_pool_health();
        let status = if pools.iter().any(|pool| pool.status == PoolStatus::Healthy) {
            PoolStatus::Healthy
        } else if pools.iter().any(|pool| pool.status == PoolStatus::Degraded) {
            PoolStatus::Degraded
        } else {
            PoolStatus::Unhealthy
        };
        HealthStatus {
            status,
            pools,
            models: runtime.pool_manager.model_to_pool().clone(),
        }
    }

    pub fn all_pool_health(&self) -> Vec<PoolHealthReport> {
        self.runtime().pool_manager.all_pool_health()
    }

    pub fn all_pool_metrics(&self) -> HashMap<String, PoolMetricsSnapshot> {
        self.runtime().pool_manager.all_pool_metrics()
    }

    pub fn provider_status(
        &self,
    ) -> HashMap<String, Vec<ProviderStatusEntry>> {
        let runtime = self.runtime();
        let mut out: HashMap<String, Vec<ProviderStatusEntry>> = HashMap::new();
        for report in runtime.pool_manager.all_pool_health() {
            let entries = report
                .providers
                .iter()
                .map(|provider| {
                    let key = provider_key(&report.pool_id, &provider.name);
                    ProviderStatusEntry {
                        name: provider.name.clone(),
                        state: runtime.health.provider_state(&key).as_str().to_string(),
                        available: provider.is_healthy,
                        error_rate: provider.error_rate,
                        average_response_time_ms: provider.response_time_ms,
                        consecutive_failures: provider.consecutive_failures,
                    }
                })
                .collect();
            out.insert(report.pool_id, entries);
        }
        out
    }

    /// Reset the breaker of the named provider within the model's chain.
    pub fn reset_provider(&self, model: &str, provider: &str) -> Result<(), GatewayError> {
        let runtime = self.runtime();
        if !runtime.pool_manager.is_model_supported(model) {
            return Err(GatewayError::ModelNotFound(model.to_string()));
        }
        let pool_id = runtime
            .pool_manager
            .pool_owning_provider(model, provider)
            .ok_or_else(|| GatewayError::ProviderNotFound(provider.to_string()))?;
        let key = provider_key(&pool_id, provider);
        runtime.health.reset_provider(&key);
        runtime.pool_manager.invalidate_pool_health(&pool_id);
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStatusEntry {
    pub name: String,
    pub state: String,
    pub available: bool,
    pub error_rate: f64,
    pub average_response_time_ms: f64,
    pub consecutive_failures: u32,
}

/// Model-level defaults fill gaps the caller left; the caller always wins.
fn apply_model_defaults(
    request: &mut ChatCompletionRequestBody,
    defaults: &JsonMap<String, JsonValue>,
) {
    let caller = request.caller_params();
    for (key, value) in defaults {
        if !caller.contains_key(key) && !request.extra.contains_key(key) {
            request.extra.insert(key.clone(), value.clone());
        }
    }
}
