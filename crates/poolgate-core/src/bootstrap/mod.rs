use std::sync::Arc;
use std::time::Duration;

use poolgate_provider_core::{
    CredentialRegistry, CredentialsRef, GatewayConfig, ModelRegistry, StoreKey,
};
use poolgate_provider_impl::{HttpClient, HttpClientConfig, ProviderFactory};

use crate::engine::EngineRuntime;
use crate::health::manager::ProviderHealthManager;
use crate::pool::PoolManager;
use crate::stream::StreamingProxy;

/// Build an engine runtime from a config snapshot, collecting one error per
/// offender so a broken deploy reports everything at once.
pub fn build_runtime(
    config: GatewayConfig,
    http: HttpClientConfig,
) -> Result<EngineRuntime, Vec<String>> {
    config.validate()?;

    let entries = config
        .credential_stores
        .entries()
        .map_err(|err| vec![err])?;
    let credentials = Arc::new(CredentialRegistry::from_configs(&entries)?);

    // Providers referencing unknown stores fail startup, listed per offender.
    let mut errors = Vec::new();
    for pool in &config.pools {
        for provider in &pool.providers {
            if let Some(reference) = &provider.credentials_ref {
                if credentials.get(StoreKey::from(reference)).is_err() {
                    let shown = match reference {
                        CredentialsRef::Name(name) => name.clone(),
                        CredentialsRef::Id(id) => id.to_string(),
                    };
                    errors.push(format!(
                        "pool {} provider {} references unknown credential store: {shown}",
                        pool.id, provider.name
                    ));
                }
            }
        }
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let client = HttpClient::new(http).map_err(|err| vec![err.to_string()])?;
    let registry = Arc::new(ModelRegistry::builtin());
    let factory = Arc::new(ProviderFactory::new(
        client,
        registry,
        credentials.clone(),
        config.timeout.clone(),
    ));
    let health = Arc::new(ProviderHealthManager::new(Default::default()));
    let pool_manager = Arc::new(PoolManager::new(&config, factory, health.clone()));
    let streaming = StreamingProxy::new(Duration::from_millis(config.timeout.streaming_timeout_ms));

    Ok(EngineRuntime {
        config: Arc::new(config),
        pool_manager,
        health,
        credentials,
        streaming,
    })
}

/// Reload from a config source: validate, rebuild, then swap atomically.
/// In-flight requests keep the runtime they started with.
pub async fn reload(
    gateway: &crate::engine::Gateway,
    source: &dyn crate::config_source::ConfigSource,
    http: HttpClientConfig,
) -> Result<(), Vec<String>> {
    let config = source.load().await.map_err(|err| vec![err.to_string()])?;
    let runtime = build_runtime(config, http)?;
    prevalidate_credentials(&runtime.credentials).await?;
    gateway.apply_runtime(runtime);
    tracing::info!("configuration reloaded");
    Ok(())
}

/// Resolve every registered store once so bad key material fails startup
/// instead of the first request.
pub async fn prevalidate_credentials(credentials: &CredentialRegistry) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    for name in credentials.names() {
        let Ok(store) = credentials.get(StoreKey::Name(&name)) else {
            continue;
        };
        if let Err(err) = store.validate().await {
            errors.push(format!("credential store {name}: {err}"));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}
