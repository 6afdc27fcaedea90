pub mod adapter;
pub mod config;
pub mod credential;
pub mod error;

pub use adapter::{ByteStream, ChatOutcome, ProviderAdapter, ProviderHandle};
pub use config::{
    BreakerSettings, CredentialStoreConfig, CredentialStoresConfig, CredentialsRef, GatewayConfig,
    HealthThresholds, LogConfig, ModelConfig, PermanentFailureSettings, PoolDefinition,
    ProviderConfig, ProviderKind, RoutingStrategy, ServerConfig, StoreSource, StoreType,
    TimeoutConfig,
};
pub use config::model_table::{MergeMode, MergedParams, ModelRegistry};
pub use credential::{
    AwsCredential, CachedStore, Credential, CredentialError, CredentialRegistry, SimpleCredential,
    StoreBackend, StoreKey,
};
pub use error::{ErrorClass, ProviderError, ProviderResult};
