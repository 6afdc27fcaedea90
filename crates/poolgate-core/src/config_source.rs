use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;

use poolgate_provider_core::GatewayConfig;

/// Delivers validated configuration snapshots. The transport behind a
/// source (file watch, pub/sub, …) is its own concern; the gateway only
/// consumes immutable snapshots.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self) -> anyhow::Result<GatewayConfig>;
}

/// JSON file on disk, the default source for the bundled binary.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn load(&self) -> anyhow::Result<GatewayConfig> {
        let raw = tokio::fs::read(&self.path)
            .await
            .with_context(|| format!("read config file {}", self.path.display()))?;
        let config: GatewayConfig = serde_json::from_slice(&raw)
            .with_context(|| format!("parse config file {}", self.path.display()))?;
        if let Err(errors) = config.validate() {
            anyhow::bail!("invalid configuration:\n  - {}", errors.join("\n  - "));
        }
        Ok(config)
    }
}
