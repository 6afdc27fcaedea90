pub mod model_table;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

/// Validated configuration snapshot. The gateway holds one of these behind
/// an `ArcSwap` and replaces it wholesale on reload; it is never mutated.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GatewayConfig {
    pub server: ServerConfig,
    pub log: LogConfig,
    pub pools: Vec<PoolDefinition>,
    /// Logical model name → pool binding.
    pub models: BTreeMap<String, ModelConfig>,
    pub timeout: TimeoutConfig,
    pub credential_stores: CredentialStoresConfig,
}

impl GatewayConfig {
    pub fn pool(&self, pool_id: &str) -> Option<&PoolDefinition> {
        self.pools.iter().find(|pool| pool.id == pool_id)
    }

    /// Structural validation: one message per offender, all collected before
    /// failing so an operator sees the full list.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        let mut seen_pools = std::collections::BTreeSet::new();
        for pool in &self.pools {
            if !seen_pools.insert(pool.id.as_str()) {
                errors.push(format!("duplicate pool id: {}", pool.id));
            }
            if pool.providers.is_empty() {
                errors.push(format!("pool {} has no providers", pool.id));
            }
            for fallback in &pool.fallback_pool_ids {
                if !self.pools.iter().any(|candidate| &candidate.id == fallback) {
                    errors.push(format!(
                        "pool {} references unknown fallback pool: {fallback}",
                        pool.id
                    ));
                }
            }
            let mut seen_providers = std::collections::BTreeSet::new();
            for provider in &pool.providers {
                if !seen_providers.insert(provider.name.as_str()) {
                    errors.push(format!(
                        "pool {} has duplicate provider name: {}",
                        pool.id, provider.name
                    ));
                }
                if let Err(message) = provider.validate() {
                    errors.push(format!("pool {} provider {}: {message}", pool.id, provider.name));
                }
            }
        }

        for (model, binding) in &self.models {
            if self.pool(&binding.primary_pool_id).is_none() {
                errors.push(format!(
                    "model {model} references unknown pool: {}",
                    binding.primary_pool_id
                ));
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8787,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogConfig {
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Deadline plumbing knobs. Provider budgets are derived from the request
/// context: `remaining × provider_timeout_multiplier`, clamped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimeoutConfig {
    pub request_timeout_ms: u64,
    pub provider_timeout_multiplier: f64,
    pub min_timeout_ms: u64,
    pub max_timeout_ms: u64,
    pub credential_timeout_ms: u64,
    pub streaming_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 300_000,
            provider_timeout_multiplier: 0.8,
            min_timeout_ms: 1_000,
            max_timeout_ms: 600_000,
            credential_timeout_ms: 10_000,
            streaming_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    OpenAI,
    Anthropic,
    Bedrock,
    Together,
    Runpod,
    Alibaba,
    Azure,
    Vertex,
    Custom,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAI => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Together => "together",
            ProviderKind::Runpod => "runpod",
            ProviderKind::Alibaba => "alibaba",
            ProviderKind::Azure => "azure",
            ProviderKind::Vertex => "vertex",
            ProviderKind::Custom => "custom",
        }
    }
}

/// Reference to a credential store, by registry name or numeric id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialsRef {
    Id(i64),
    Name(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<CredentialsRef>,
    /// Direct key, mutually exclusive with `credentials_ref`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_base: String,
    pub model_name: String,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limits: Option<JsonValue>,
    #[serde(default)]
    pub provider_params: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health_check_params: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_params: Option<JsonMap<String, JsonValue>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_per_token: Option<f64>,
    #[serde(default = "default_true")]
    pub use_model_defaults: bool,
}

fn default_priority() -> u8 {
    5
}
fn default_weight() -> u32 {
    1
}
fn default_timeout_ms() -> u64 {
    60_000
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_true() -> bool {
    true
}

impl ProviderConfig {
    pub fn validate(&self) -> Result<(), String> {
        match (&self.credentials_ref, &self.api_key) {
            (Some(_), Some(_)) => {
                return Err("credentialsRef and apiKey are mutually exclusive".to_string());
            }
            (None, None) => {
                return Err("one of credentialsRef or apiKey is required".to_string());
            }
            _ => {}
        }
        if !(1..=10).contains(&self.priority) {
            return Err(format!("priority {} outside 1..=10", self.priority));
        }
        if self.weight < 1 {
            return Err("weight must be at least 1".to_string());
        }
        if self.api_base.is_empty() {
            return Err("apiBase is required".to_string());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    Weighted,
    CostOptimized,
    FastestResponse,
    RoundRobin,
    LeastConnections,
}

impl Default for RoutingStrategy {
    fn default() -> Self {
        RoutingStrategy::Weighted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDefinition {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub fallback_pool_ids: Vec<String>,
    #[serde(default)]
    pub routing_strategy: RoutingStrategy,
    #[serde(default)]
    pub circuit_breaker: BreakerSettings,
    #[serde(default)]
    pub health_thresholds: HealthThresholds,
}

/// Circuit breaker tuning, shared by pool-level and provider-level breakers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub monitoring_window_ms: u64,
    pub min_requests_threshold: u32,
    pub error_threshold_pct: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permanent_failure_handling: Option<PermanentFailureSettings>,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            reset_timeout_ms: 60_000,
            monitoring_window_ms: 300_000,
            min_requests_threshold: 5,
            error_threshold_pct: 50.0,
            permanent_failure_handling: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PermanentFailureSettings {
    pub enabled: bool,
    /// Regexes matched case-insensitively against error messages.
    pub error_patterns: Vec<String>,
    pub timeout_multiplier: f64,
    pub base_timeout_ms: u64,
    pub max_backoff_multiplier: u32,
}

impl Default for PermanentFailureSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            error_patterns: Vec::new(),
            timeout_multiplier: 5.0,
            base_timeout_ms: 300_000,
            max_backoff_multiplier: 4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthThresholds {
    pub error_rate_pct: f64,
    pub response_time_ms: u64,
    pub consecutive_failures: u32,
    pub min_healthy_providers: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            error_rate_pct: 25.0,
            response_time_ms: 10_000,
            consecutive_failures: 3,
            min_healthy_providers: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    pub primary_pool_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_parameters: Option<JsonMap<String, JsonValue>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreType {
    Simple,
    Aws,
    Google,
    Azure,
    Oauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreSource {
    Env,
    File,
    Vault,
    AwsSecrets,
    Inline,
}

impl Default for StoreSource {
    fn default() -> Self {
        StoreSource::Env
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialStoreConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub store_type: StoreType,
    #[serde(default)]
    pub source: StoreSource,
    /// Type-specific settings (key material, env var names, region, …).
    #[serde(default)]
    pub config: JsonMap<String, JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_ttl_seconds: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation: Option<JsonValue>,
}

/// Credential stores accept both an object keyed by store name and a list of
/// entries carrying their own `id`/`name`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CredentialStoresConfig {
    Named(BTreeMap<String, CredentialStoreConfig>),
    Listed(Vec<CredentialStoreConfig>),
}

impl Default for CredentialStoresConfig {
    fn default() -> Self {
        CredentialStoresConfig::Named(BTreeMap::new())
    }
}

impl CredentialStoresConfig {
    /// Normalize to `(name, config)` pairs; map keys win over embedded names.
    pub fn entries(&self) -> Result<Vec<(String, CredentialStoreConfig)>, String> {
        match self {
            CredentialStoresConfig::Named(map) => Ok(map
                .iter()
                .map(|(name, config)| {
                    let mut config = config.clone();
                    config.name = Some(name.clone());
                    (name.clone(), config)
                })
                .collect()),
            CredentialStoresConfig::Listed(list) => {
                let mut out = Vec::with_capacity(list.len());
                for config in list {
                    let Some(name) = config.name.clone() else {
                        return Err("credential store entry is missing a name".to_string());
                    };
                    out.push((name, config.clone()));
                }
                Ok(out)
            }
        }
    }
}
