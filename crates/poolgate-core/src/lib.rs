pub mod bootstrap;
pub mod breaker;
pub mod config_source;
pub mod engine;
pub mod health;
pub mod pool;
pub mod stream;

pub use breaker::{BreakerError, BreakerPhase, BreakerReport, CircuitBreaker};
pub use engine::{EngineRuntime, Gateway, HealthStatus, ProviderStatusEntry};
pub use health::manager::{ProviderHealthManager, ProviderMetrics};
pub use health::scheduler::{HealthCheckScheduler, SchedulerConfig, SchedulerMetrics};
pub use pool::health::{PoolHealthReport, PoolStatus};
pub use pool::{Dispatched, PoolManager, PoolMetricsSnapshot};
pub use stream::{StreamingProxy, CLIENT_DISCONNECT_REASON};
