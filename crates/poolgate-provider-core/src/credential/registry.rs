use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::aws::AwsStoreBackend;
use super::simple::SimpleStoreBackend;
use super::store::{CachedStore, StoreBackend};
use super::CredentialError;
use crate::config::{CredentialStoreConfig, CredentialsRef, StoreType};

/// Lookup key for a registered store. String keys that parse as integers
/// also resolve through the id map.
#[derive(Debug, Clone, Copy)]
pub enum StoreKey<'a> {
    Name(&'a str),
    Id(i64),
}

impl<'a> From<&'a CredentialsRef> for StoreKey<'a> {
    fn from(value: &'a CredentialsRef) -> Self {
        match value {
            CredentialsRef::Name(name) => StoreKey::Name(name),
            CredentialsRef::Id(id) => StoreKey::Id(*id),
        }
    }
}

/// Stores by name with a bijective id↔name side table.
#[derive(Default)]
pub struct CredentialRegistry {
    by_name: HashMap<String, Arc<CachedStore>>,
    id_to_name: HashMap<i64, String>,
}

impl CredentialRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configuration entries; fails with one error per
    /// offending store.
    pub fn from_configs(
        entries: &[(String, CredentialStoreConfig)],
    ) -> Result<Self, Vec<String>> {
        let mut registry = Self::new();
        let mut errors = Vec::new();
        for (name, config) in entries {
            if let Err(err) = registry.register_config(name, config) {
                errors.push(format!("credential store {name}: {err}"));
            }
        }
        if errors.is_empty() { Ok(registry) } else { Err(errors) }
    }

    pub fn register_config(
        &mut self,
        name: &str,
        config: &CredentialStoreConfig,
    ) -> Result<(), CredentialError> {
        let backend: Box<dyn StoreBackend> = match config.store_type {
            StoreType::Simple => Box::new(SimpleStoreBackend::from_config(name, &config.config)?),
            StoreType::Aws => Box::new(AwsStoreBackend::from_config(name, &config.config)?),
            other => {
                return Err(CredentialError::Init(format!(
                    "unsupported store type: {other:?}"
                )));
            }
        };
        let ttl = config.cache_ttl_seconds.map(Duration::from_secs);
        self.register(config.id, Arc::new(CachedStore::new(backend, ttl)))
    }

    pub fn register(
        &mut self,
        id: Option<i64>,
        store: Arc<CachedStore>,
    ) -> Result<(), CredentialError> {
        let name = store.name().to_string();
        if self.by_name.contains_key(&name) {
            return Err(CredentialError::Duplicate(name));
        }
        if let Some(id) = id {
            if self.id_to_name.contains_key(&id) {
                return Err(CredentialError::Duplicate(format!("id {id}")));
            }
            self.id_to_name.insert(id, name.clone());
        }
        self.by_name.insert(name, store);
        Ok(())
    }

    pub fn get(&self, key: StoreKey<'_>) -> Result<Arc<CachedStore>, CredentialError> {
        match key {
            StoreKey::Name(name) => {
                if let Some(store) = self.by_name.get(name) {
                    return Ok(store.clone());
                }
                // Numeric strings fall through to the id map.
                if let Ok(id) = name.parse::<i64>() {
                    return self.get(StoreKey::Id(id));
                }
                Err(CredentialError::NotFound(name.to_string()))
            }
            StoreKey::Id(id) => {
                let name = self
                    .id_to_name
                    .get(&id)
                    .ok_or_else(|| CredentialError::NotFound(format!("id {id}")))?;
                self.by_name
                    .get(name)
                    .cloned()
                    .ok_or_else(|| CredentialError::NotFound(name.clone()))
            }
        }
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispose every store concurrently.
    pub async fn dispose(&self) {
        let mut tasks = tokio::task::JoinSet::new();
        for store in self.by_name.values() {
            let store = store.clone();
            tasks.spawn(async move { store.dispose().await });
        }
        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn simple_config(id: Option<i64>, key: &str) -> CredentialStoreConfig {
        serde_json::from_value(json!({
            "id": id,
            "type": "simple",
            "source": "inline",
            "config": { "apiKey": key },
        }))
        .unwrap()
    }

    #[test]
    fn id_and_name_resolve_to_the_same_store() {
        let mut registry = CredentialRegistry::new();
        registry
            .register_config("openai-prod", &simple_config(Some(7), "sk-abcdef123456"))
            .unwrap();

        let by_name = registry.get(StoreKey::Name("openai-prod")).unwrap();
        let by_id = registry.get(StoreKey::Id(7)).unwrap();
        let by_numeric_string = registry.get(StoreKey::Name("7")).unwrap();
        assert!(Arc::ptr_eq(&by_name, &by_id));
        assert!(Arc::ptr_eq(&by_name, &by_numeric_string));

        assert!(matches!(
            registry.get(StoreKey::Name("missing")),
            Err(CredentialError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_name_and_id_are_rejected() {
        let mut registry = CredentialRegistry::new();
        registry
            .register_config("a", &simple_config(Some(1), "sk-abcdef123456"))
            .unwrap();
        assert!(matches!(
            registry.register_config("a", &simple_config(None, "sk-abcdef123456")),
            Err(CredentialError::Duplicate(_))
        ));
        assert!(matches!(
            registry.register_config("b", &simple_config(Some(1), "sk-abcdef123456")),
            Err(CredentialError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn stores_resolve_through_registry() {
        let mut registry = CredentialRegistry::new();
        registry
            .register_config("main", &simple_config(None, "sk-abcdef123456"))
            .unwrap();
        let store = registry.get(StoreKey::Name("main")).unwrap();
        let credential = store.resolve().await.unwrap();
        assert_eq!(credential.kind(), "simple");
        registry.dispose().await;
    }
}
