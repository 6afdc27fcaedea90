pub mod health;
mod select;

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use serde::Serialize;

use poolgate_common::{GatewayError, RequestContext};
use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{GatewayConfig, PoolDefinition, ProviderHandle};
use poolgate_provider_impl::ProviderFactory;

use crate::breaker::{BreakerError, CircuitBreaker};
use crate::health::manager::ProviderHealthManager;
use crate::health::provider_key;
use crate::pool::health::{compute_pool_health, PoolHealthReport, PoolStatus};
use crate::pool::select::{select_provider, PoolBalancer};

const POOL_HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// A successful dispatch, annotated with where it actually ran.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub value: T,
    pub used_provider: String,
    pub used_pool: String,
    pub used_fallback: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolMetricsSnapshot {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
}

struct ProviderSlot {
    config: poolgate_provider_core::ProviderConfig,
    adapter: OnceLock<ProviderHandle>,
}

impl ProviderSlot {
    fn adapter(&self, factory: &ProviderFactory) -> Result<ProviderHandle, ProviderError> {
        if let Some(adapter) = self.adapter.get() {
            return Ok(adapter.clone());
        }
        let adapter = factory.create(&self.config)?;
        // A racing initializer is fine; both produced equivalent adapters.
        let _ = self.adapter.set(adapter.clone());
        Ok(adapter)
    }
}

struct PoolRuntime {
    definition: PoolDefinition,
    breaker: CircuitBreaker,
    balancer: PoolBalancer,
    slots: Vec<ProviderSlot>,
    metrics: Mutex<PoolMetricsSnapshot>,
}

/// Maps models to pools, selects providers inside a pool, and walks the
/// fallback chain when a pool fails.
pub struct PoolManager {
    pools: HashMap<String, Arc<PoolRuntime>>,
    model_to_pool: HashMap<String, String>,
    health: Arc<ProviderHealthManager>,
    factory: Arc<ProviderFactory>,
    health_cache: Mutex<HashMap<String, PoolHealthReport>>,
    health_cache_ttl: Duration,
}

impl PoolManager {
    pub fn new(
        config: &GatewayConfig,
        factory: Arc<ProviderFactory>,
        health: Arc<ProviderHealthManager>,
    ) -> Self {
        let mut pools = HashMap::new();
        for definition in &config.pools {
            let slots = definition
                .providers
                .iter()
                .map(|provider| ProviderSlot {
                    config: provider.clone(),
                    adapter: OnceLock::new(),
                })
                .collect();
            pools.insert(
                definition.id.clone(),
                Arc::new(PoolRuntime {
                    breaker: CircuitBreaker::new(definition.circuit_breaker.clone()),
                    balancer: PoolBalancer::new(),
                    slots,
                    metrics: Mutex::new(PoolMetricsSnapshot::default()),
                    definition: definition.clone(),
                }),
            );
        }
        let model_to_pool = config
            .models
            .iter()
            .map(|(model, binding)| (model.clone(), binding.primary_pool_id.clone()))
            .collect();
        Self {
            pools,
            model_to_pool,
            health,
            factory,
            health_cache: Mutex::new(HashMap::new()),
            health_cache_ttl: POOL_HEALTH_CACHE_TTL,
        }
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn models(&self) -> Vec<String> {
        let mut models: Vec<String> = self.model_to_pool.keys().cloned().collect();
        models.sort();
        models
    }

    pub fn model_to_pool(&self) -> &HashMap<String, String> {
        &self.model_to_pool
    }

    pub fn is_model_supported(&self, model: &str) -> bool {
        self.model_to_pool.contains_key(model)
    }

    /// Pool owning `provider` for the given model's chain, if any.
    pub fn pool_owning_provider(&self, model: &str, provider: &str) -> Option<String> {
        self.chain_for(model)
            .into_iter()
            .find(|pool_id| {
                self.pools
                    .get(pool_id)
                    .is_some_and(|pool| {
                        pool.definition
                            .providers
                            .iter()
                            .any(|candidate| candidate.name == provider)
                    })
            })
    }

    /// Primary pool followed by a depth-first walk of fallbacks. Cycles stop
    /// descent at the revisit; duplicates across branches stay in order and
    /// are deduplicated at attempt time.
    pub fn chain_for(&self, model: &str) -> Vec<String> {
        let Some(primary) = self.model_to_pool.get(model) else {
            return Vec::new();
        };
        let mut chain = Vec::new();
        let mut path = Vec::new();
        self.walk(primary, &mut chain, &mut path);
        chain
    }

    fn walk(&self, pool_id: &str, chain: &mut Vec<String>, path: &mut Vec<String>) {
        if path.iter().any(|visited| visited == pool_id) {
            tracing::warn!(pool = pool_id, "fallback cycle detected, stopping descent");
            return;
        }
        let Some(pool) = self.pools.get(pool_id) else {
            return;
        };
        chain.push(pool_id.to_string());
        path.push(pool_id.to_string());
        for fallback in &pool.definition.fallback_pool_ids {
            self.walk(fallback, chain, path);
        }
        path.pop();
    }

    /// Try the fallback chain until one pool serves the request.
    pub async fn execute_with_pool_fallback<T, F, Fut>(
        &self,
        model: &str,
        ctx: &RequestContext,
        op: F,
    ) -> Result<Dispatched<T>, GatewayError>
    where
        F: Fn(ProviderHandle) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let chain = self.chain_for(model);
        if chain.is_empty() {
            return Err(GatewayError::NoPoolsConfigured(model.to_string()));
        }

        let mut attempted: Vec<String> = Vec::new();
        for pool_id in chain {
            if attempted.iter().any(|tried| tried == &pool_id) {
                continue;
            }
            attempted.push(pool_id.clone());
            if ctx.is_cancelled() {
                return Err(GatewayError::ProviderTimeout("request cancelled".to_string()));
            }

            match self.execute_with_pool(&pool_id, ctx, &op).await {
                Ok((value, used_provider)) => {
                    return Ok(Dispatched {
                        value,
                        used_provider,
                        used_pool: pool_id,
                        used_fallback: attempted.len() > 1,
                    });
                }
                Err(err) => {
                    tracing::warn!(pool = %pool_id, model, error = %err, "pool attempt failed");
                    self.invalidate_pool_health(&pool_id);
                }
            }
        }

        Err(GatewayError::AllPoolsFailed {
            model: model.to_string(),
            attempted,
        })
    }

    /// Run one request inside a single pool: health gate, pool breaker,
    /// provider selection, provider breaker, then the operation.
    pub async fn execute_with_pool<T, F, Fut>(
        &self,
        pool_id: &str,
        ctx: &RequestContext,
        op: &F,
    ) -> Result<(T, String), GatewayError>
    where
        F: Fn(ProviderHandle) -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let pool = self
            .pools
            .get(pool_id)
            .ok_or_else(|| GatewayError::Internal(format!("unknown pool: {pool_id}")))?;

        let report = self.pool_health(pool_id);
        if matches!(report.map(|r| r.status), Some(PoolStatus::Unhealthy)) {
            return Err(GatewayError::AllProvidersFailed {
                pool: pool_id.to_string(),
            });
        }

        {
            let mut metrics = lock(&pool.metrics);
            metrics.requests += 1;
        }

        let outcome = pool
            .breaker
            .execute(|| async {
                let (adapter, provider_name) = self.pick_provider(pool)?;
                let key = provider_key(pool_id, &provider_name);
                let _connection = pool.balancer.track_connection(&provider_name);

                let report = self
                    .health
                    .execute_with_provider(&key, || op(adapter))
                    .await;
                match report.result {
                    Ok(value) => Ok((value, provider_name)),
                    Err(BreakerError::Open { retry_after }) => {
                        Err(ProviderError::from_message(format!(
                            "provider {provider_name} circuit open, retry in {}s",
                            retry_after.as_secs()
                        )))
                    }
                    Err(BreakerError::Operation(err)) => Err(err),
                }
            })
            .await;

        match outcome.result {
            Ok((value, provider_name)) => {
                let mut metrics = lock(&pool.metrics);
                metrics.successes += 1;
                Ok((value, provider_name))
            }
            Err(BreakerError::Open { .. }) => {
                let mut metrics = lock(&pool.metrics);
                metrics.failures += 1;
                Err(GatewayError::AllProvidersFailed {
                    pool: pool_id.to_string(),
                })
            }
            Err(BreakerError::Operation(err)) => {
                let mut metrics = lock(&pool.metrics);
                metrics.failures += 1;
                Err(err.to_gateway())
            }
        }
    }

    fn pick_provider(
        &self,
        pool: &PoolRuntime,
    ) -> Result<(ProviderHandle, String), ProviderError> {
        let healthy: Vec<&poolgate_provider_core::ProviderConfig> = pool
            .definition
            .providers
            .iter()
            .filter(|provider| {
                self.health
                    .is_provider_available(&provider_key(&pool.definition.id, &provider.name))
            })
            .collect();

        let chosen = select_provider(
            pool.definition.routing_strategy,
            &healthy,
            &pool.balancer,
            |name| {
                let metrics = self
                    .health
                    .provider_metrics(&provider_key(&pool.definition.id, name));
                if metrics.total_requests == 0 {
                    f64::INFINITY
                } else {
                    metrics.average_response_time_ms
                }
            },
        )
        .ok_or_else(|| {
            ProviderError::from_message(format!(
                "no healthy providers in pool {}",
                pool.definition.id
            ))
        })?;

        let slot = pool
            .definition
            .providers
            .iter()
            .position(|provider| provider.name == chosen.name)
            .and_then(|index| pool.slots.get(index))
            .ok_or_else(|| ProviderError::from_message("provider slot missing"))?;
        let adapter = slot.adapter(&self.factory)?;
        Ok((adapter, chosen.name.clone()))
    }

    /// Cached pool health; recomputed after the TTL or an invalidation.
    pub fn pool_health(&self, pool_id: &str) -> Option<PoolHealthReport> {
        let pool = self.pools.get(pool_id)?;
        let mut cache = lock(&self.health_cache);
        if let Some(report) = cache.get(pool_id) {
            if report.computed_at.elapsed() < self.health_cache_ttl {
                return Some(report.clone());
            }
        }
        let report = compute_pool_health(&pool.definition, &self.health);
        cache.insert(pool_id.to_string(), report.clone());
        Some(report)
    }

    pub fn invalidate_pool_health(&self, pool_id: &str) {
        lock(&self.health_cache).remove(pool_id);
    }

    pub fn all_pool_health(&self) -> Vec<PoolHealthReport> {
        let mut reports: Vec<PoolHealthReport> = self
            .pool_names()
            .iter()
            .filter_map(|pool_id| self.pool_health(pool_id))
            .collect();
        reports.sort_by(|a, b| a.pool_id.cmp(&b.pool_id));
        reports
    }

    pub fn pool_metrics(&self, pool_id: &str) -> Option<PoolMetricsSnapshot> {
        self.pools
            .get(pool_id)
            .map(|pool| lock(&pool.metrics).clone())
    }

    pub fn all_pool_metrics(&self) -> HashMap<String, PoolMetricsSnapshot> {
        self.pools
            .iter()
            .map(|(pool_id, pool)| (pool_id.clone(), lock(&pool.metrics).clone()))
            .collect()
    }

    /// Register every configured provider with the health scheduler.
    pub fn register_health_tasks(&self, scheduler: &crate::health::scheduler::HealthCheckScheduler) {
        for (pool_id, pool) in &self.pools {
            for slot in &pool.slots {
                match slot.adapter(&self.factory) {
                    Ok(adapter) => {
                        scheduler.register_task(
                            slot.config.model_name.clone(),
                            provider_key(pool_id, &slot.config.name),
                            slot.config.priority,
                            adapter,
                            Some(Duration::from_millis(slot.config.timeout_ms)),
                        );
                    }
                    Err(err) => {
                        tracing::warn!(
                            pool = %pool_id,
                            provider = %slot.config.name,
                            error = %err,
                            "skipping health task for unbuildable provider"
                        );
                    }
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use poolgate_protocol::chat::{ChatCompletionRequestBody, ChatCompletionResponse};
    use poolgate_provider_core::{
        BreakerSettings, ByteStream, ChatOutcome, ModelRegistry, ProviderAdapter, ProviderKind,
        ProviderResult,
    };
    use poolgate_provider_impl::{HttpClient, HttpClientConfig};

    struct ScriptedAdapter {
        name: String,
        fail_with_status: Option<u16>,
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        fn name(&self) -> &str {
            &self.name
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAI
        }
        fn model_name(&self) -> &str {
            "gpt-4o"
        }
        async fn chat_completion(
            &self,
            _request: &ChatCompletionRequestBody,
            _ctx: &RequestContext,
        ) -> ProviderResult<ChatOutcome> {
            if let Some(status) = self.fail_with_status {
                return Err(ProviderError::from_status(status, "scripted failure"));
            }
            let response: ChatCompletionResponse = serde_json::from_value(serde_json::json!({
                "id": "chatcmpl-test",
                "object": "chat.completion",
                "created": 1,
                "model": "gpt-4o",
                "choices": [{
                    "index": 0,
                    "message": {"role": "assistant", "content": "ok"},
                    "finish_reason": "stop",
                }],
            }))
            .expect("static response");
            Ok(ChatOutcome {
                response,
                usage: None,
            })
        }
        async fn stream_chat_completion(
            &self,
            _request: &ChatCompletionRequestBody,
            _ctx: &RequestContext,
        ) -> ProviderResult<ByteStream> {
            Err(ProviderError::unsupported("stream"))
        }
        async fn health_check(&self, _ctx: &RequestContext) -> ProviderResult<bool> {
            Ok(self.fail_with_status.is_none())
        }
    }

    fn test_config() -> GatewayConfig {
        serde_json::from_value(serde_json::json!({
            "pools": [
                {
                    "id": "A",
                    "name": "primary",
                    "providers": [
                        {"name": "pA1", "kind": "openai", "apiKey": "sk-test-12345678",
                         "apiBase": "https://a1.invalid/v1", "modelName": "gpt-4o"},
                        {"name": "pA2", "kind": "openai", "apiKey": "sk-test-12345678",
                         "apiBase": "https://a2.invalid/v1", "modelName": "gpt-4o"},
                    ],
                    "fallbackPoolIds": ["B"],
                },
                {
                    "id": "B",
                    "name": "backup",
                    "providers": [
                        {"name": "pB1", "kind": "openai", "apiKey": "sk-test-12345678",
                         "apiBase": "https://b1.invalid/v1", "modelName": "gpt-4o"},
                    ],
                },
            ],
            "models": {"gpt-4o": {"primaryPoolId": "A"}},
        }))
        .unwrap()
    }

    fn manager_with_scripted_adapters(
        config: &GatewayConfig,
        failing: &[&str],
    ) -> PoolManager {
        let client = HttpClient::new(HttpClientConfig::default()).expect("client");
        let factory = Arc::new(ProviderFactory::new(
            client,
            Arc::new(ModelRegistry::builtin()),
            Arc::new(poolgate_provider_core::CredentialRegistry::new()),
            config.timeout.clone(),
        ));
        let health = Arc::new(ProviderHealthManager::new(BreakerSettings::default()));
        let manager = PoolManager::new(config, factory, health);
        for pool in manager.pools.values() {
            for slot in &pool.slots {
                let fail = failing.contains(&slot.config.name.as_str());
                let _ = slot.adapter.set(Arc::new(ScriptedAdapter {
                    name: slot.config.name.clone(),
                    fail_with_status: fail.then_some(503),
                }));
            }
        }
        manager
    }

    fn chat_request() -> ChatCompletionRequestBody {
        serde_json::from_value(serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fallback_reaches_the_backup_pool() {
        let config = test_config();
        let manager = manager_with_scripted_adapters(&config, &["pA1", "pA2"]);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let request = chat_request();

        let dispatched = manager
            .execute_with_pool_fallback("gpt-4o", &ctx, |adapter| {
                let request = &request;
                let ctx = &ctx;
                async move { adapter.chat_completion(request, ctx).await }
            })
            .await
            .expect("backup pool should serve");

        assert_eq!(dispatched.used_pool, "B");
        assert_eq!(dispatched.used_provider, "pB1");
        assert!(dispatched.used_fallback);
    }

    #[tokio::test]
    async fn primary_success_reports_no_fallback() {
        let config = test_config();
        let manager = manager_with_scripted_adapters(&config, &[]);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let request = chat_request();

        let dispatched = manager
            .execute_with_pool_fallback("gpt-4o", &ctx, |adapter| {
                let request = &request;
                let ctx = &ctx;
                async move { adapter.chat_completion(request, ctx).await }
            })
            .await
            .expect("primary pool should serve");

        assert_eq!(dispatched.used_pool, "A");
        assert!(!dispatched.used_fallback);
        let metrics = manager.pool_metrics("A").unwrap();
        assert_eq!(metrics.successes, 1);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_all_attempted_pools() {
        let config = test_config();
        let manager = manager_with_scripted_adapters(&config, &["pA1", "pA2", "pB1"]);
        let ctx = RequestContext::new(Duration::from_secs(5));
        let request = chat_request();

        let err = manager
            .execute_with_pool_fallback("gpt-4o", &ctx, |adapter| {
                let request = &request;
                let ctx = &ctx;
                async move { adapter.chat_completion(request, ctx).await }
            })
            .await
            .expect_err("every pool fails");

        match err {
            GatewayError::AllPoolsFailed { attempted, .. } => {
                assert_eq!(attempted, vec!["A".to_string(), "B".to_string()]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unknown_model_yields_no_pools() {
        let config = test_config();
        let manager = manager_with_scripted_adapters(&config, &[]);
        let ctx = RequestContext::new(Duration::from_secs(5));

        let err = manager
            .execute_with_pool_fallback("unknown-model", &ctx, |adapter| async move {
                adapter.chat_completion(&chat_request(), &RequestContext::new(Duration::from_secs(1))).await
            })
            .await
            .expect_err("unknown model");
        assert!(matches!(err, GatewayError::NoPoolsConfigured(_)));
    }

    #[test]
    fn fallback_cycles_stop_at_the_revisit() {
        let config: GatewayConfig = serde_json::from_value(serde_json::json!({
            "pools": [
                {"id": "A", "name": "a", "fallbackPoolIds": ["B"], "providers": [
                    {"name": "p", "kind": "openai", "apiKey": "sk-test-12345678",
                     "apiBase": "https://x.invalid/v1", "modelName": "m"}]},
                {"id": "B", "name": "b", "fallbackPoolIds": ["A"], "providers": [
                    {"name": "p", "kind": "openai", "apiKey": "sk-test-12345678",
                     "apiBase": "https://x.invalid/v1", "modelName": "m"}]},
            ],
            "models": {"m": {"primaryPoolId": "A"}},
        }))
        .unwrap();
        let manager = manager_with_scripted_adapters(&config, &[]);
        assert_eq!(manager.chain_for("m"), vec!["A".to_string(), "B".to_string()]);
    }
}
