use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::{Credential, CredentialError};
use crate::config::StoreType;

/// Type-specific store behavior. `CachedStore` wraps a backend and owns
/// initialization and cache lifecycle; backends stay stateless where they can.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    fn name(&self) -> &str;

    fn store_type(&self) -> StoreType;

    async fn do_initialize(&self) -> Result<(), CredentialError> {
        Ok(())
    }

    async fn do_resolve(&self) -> Result<Credential, CredentialError>;

    async fn do_validate(&self, credential: &Credential) -> Result<(), CredentialError> {
        credential.validate()
    }

    async fn do_dispose(&self) {}
}

struct CacheState {
    initialized: bool,
    cached: Option<(Credential, Instant)>,
}

/// Lazy-initializing store with optional TTL caching of the resolved
/// credential. The cache is dropped when the TTL elapses or the credential
/// reports itself expired.
pub struct CachedStore {
    backend: Box<dyn StoreBackend>,
    cache_ttl: Option<Duration>,
    state: Mutex<CacheState>,
}

impl CachedStore {
    pub fn new(backend: Box<dyn StoreBackend>, cache_ttl: Option<Duration>) -> Self {
        Self {
            backend,
            cache_ttl,
            state: Mutex::new(CacheState {
                initialized: false,
                cached: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        self.backend.name()
    }

    pub fn store_type(&self) -> StoreType {
        self.backend.store_type()
    }

    pub async fn resolve(&self) -> Result<Credential, CredentialError> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            self.backend.do_initialize().await?;
            state.initialized = true;
        }

        if let Some((credential, resolved_at)) = &state.cached {
            let ttl_ok = self
                .cache_ttl
                .map(|ttl| resolved_at.elapsed() < ttl)
                .unwrap_or(true);
            if ttl_ok && !credential.is_expired() {
                return Ok(credential.clone());
            }
            state.cached = None;
        }

        let credential = self.backend.do_resolve().await?;
        self.backend.do_validate(&credential).await?;
        state.cached = Some((credential.clone(), Instant::now()));
        Ok(credential)
    }

    /// Validate without touching the cache (used at startup).
    pub async fn validate(&self) -> Result<(), CredentialError> {
        let credential = self.resolve().await?;
        self.backend.do_validate(&credential).await
    }

    pub async fn invalidate(&self) {
        self.state.lock().await.cached = None;
    }

    pub async fn dispose(&self) {
        self.invalidate().await;
        self.backend.do_dispose().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::credential::SimpleCredential;

    struct CountingBackend {
        resolves: Arc<AtomicU32>,
    }

    #[async_trait]
    impl StoreBackend for CountingBackend {
        fn name(&self) -> &str {
            "counting"
        }

        fn store_type(&self) -> StoreType {
            StoreType::Simple
        }

        async fn do_resolve(&self) -> Result<Credential, CredentialError> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::Simple(SimpleCredential {
                api_key: "sk-cached-key".to_string(),
            }))
        }
    }

    fn counting_store(ttl: Option<Duration>) -> (CachedStore, Arc<AtomicU32>) {
        let resolves = Arc::new(AtomicU32::new(0));
        let store = CachedStore::new(
            Box::new(CountingBackend {
                resolves: resolves.clone(),
            }),
            ttl,
        );
        (store, resolves)
    }

    #[tokio::test]
    async fn ttl_cache_avoids_repeated_resolution() {
        let (store, resolves) = counting_store(Some(Duration::from_secs(60)));
        store.resolve().await.unwrap();
        store.resolve().await.unwrap();
        assert_eq!(resolves.load(Ordering::SeqCst), 1);

        store.invalidate().await;
        store.resolve().await.unwrap();
        assert_eq!(resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn elapsed_ttl_forces_fresh_resolution() {
        let (store, resolves) = counting_store(Some(Duration::from_millis(20)));
        store.resolve().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        store.resolve().await.unwrap();
        assert_eq!(resolves.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn no_ttl_caches_until_invalidated() {
        let (store, resolves) = counting_store(None);
        store.resolve().await.unwrap();
        store.resolve().await.unwrap();
        assert_eq!(resolves.load(Ordering::SeqCst), 1);
    }
}
