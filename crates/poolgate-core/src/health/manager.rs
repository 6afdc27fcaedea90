use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::BreakerSettings;

use crate::breaker::{BreakerPhase, BreakerReport, CircuitBreaker};

/// Exponential moving average weight for response times.
const EMA_ALPHA: f64 = 0.1;

#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub average_response_time_ms: f64,
    pub error_rate: f64,
    pub consecutive_failures: u32,
    pub total_requests: u64,
    pub failed_requests: u64,
}

struct ProviderEntry {
    breaker: CircuitBreaker,
    metrics: Mutex<ProviderMetrics>,
}

impl ProviderEntry {
    fn record(&self, success: bool, elapsed: Duration) {
        let mut metrics = match self.metrics.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        metrics.total_requests += 1;
        if success {
            metrics.consecutive_failures = 0;
            let sample = elapsed.as_secs_f64() * 1_000.0;
            if metrics.average_response_time_ms == 0.0 {
                metrics.average_response_time_ms = sample;
            } else {
                metrics.average_response_time_ms =
                    metrics.average_response_time_ms * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA;
            }
        } else {
            metrics.failed_requests += 1;
            metrics.consecutive_failures += 1;
        }
        metrics.error_rate = metrics.failed_requests as f64 / metrics.total_requests as f64;
    }
}

/// Owns one circuit breaker (plus rolling metrics) per provider instance,
/// keyed by `{pool_id}-{provider_name}`.
pub struct ProviderHealthManager {
    settings: BreakerSettings,
    providers: RwLock<HashMap<String, Arc<ProviderEntry>>>,
}

impl ProviderHealthManager {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            providers: RwLock::new(HashMap::new()),
        }
    }

    fn entry(&self, provider_id: &str) -> Arc<ProviderEntry> {
        if let Some(entry) = self.read_guard().get(provider_id) {
            return entry.clone();
        }
        let mut guard = self.write_guard();
        guard
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(ProviderEntry {
                    breaker: CircuitBreaker::new(self.settings.clone()),
                    metrics: Mutex::new(ProviderMetrics::default()),
                })
            })
            .clone()
    }

    /// Run `op` under the provider's breaker, recording latency and outcome.
    pub async fn execute_with_provider<T, F, Fut>(
        &self,
        provider_id: &str,
        op: F,
    ) -> BreakerReport<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let entry = self.entry(provider_id);
        let report = entry.breaker.execute(op).await;
        match &report.result {
            Ok(_) => entry.record(true, report.elapsed),
            Err(crate::breaker::BreakerError::Operation(_)) => entry.record(false, report.elapsed),
            // Short-circuited calls never reached the provider.
            Err(crate::breaker::BreakerError::Open { .. }) => {}
        }
        report
    }

    /// Out-of-band observation: the health scheduler reports probe results
    /// through this so the breaker sees them alongside live traffic.
    pub async fn observe(&self, provider_id: &str, success: bool, elapsed: Duration, detail: &str) {
        let entry = self.entry(provider_id);
        if success {
            entry.breaker.execute(|| async { Ok::<_, ProviderError>(()) }).await;
        } else {
            let message = detail.to_string();
            entry
                .breaker
                .execute(|| async { Err::<(), _>(ProviderError::from_message(message)) })
                .await;
        }
        entry.record(success, elapsed);
    }

    pub fn is_provider_available(&self, provider_id: &str) -> bool {
        match self.read_guard().get(provider_id) {
            Some(entry) => entry.breaker.is_available(),
            // Unknown providers have never failed.
            None => true,
        }
    }

    pub fn provider_state(&self, provider_id: &str) -> BreakerPhase {
        match self.read_guard().get(provider_id) {
            Some(entry) => entry.breaker.phase(),
            None => BreakerPhase::Closed,
        }
    }

    pub fn provider_metrics(&self, provider_id: &str) -> ProviderMetrics {
        match self.read_guard().get(provider_id) {
            Some(entry) => match entry.metrics.lock() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            },
            None => ProviderMetrics::default(),
        }
    }

    pub fn reset_provider(&self, provider_id: &str) {
        if let Some(entry) = self.read_guard().get(provider_id) {
            entry.breaker.reset();
            let mut metrics = match entry.metrics.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *metrics = ProviderMetrics::default();
        }
    }

    pub fn provider_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.read_guard().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn read_guard(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<ProviderEntry>>> {
        match self.providers.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_guard(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<ProviderEntry>>> {
        match self.providers.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ProviderHealthManager {
        ProviderHealthManager::new(BreakerSettings {
            min_requests_threshold: 3,
            error_threshold_pct: 50.0,
            ..BreakerSettings::default()
        })
    }

    #[tokio::test]
    async fn failures_open_the_provider_breaker() {
        let manager = manager();
        for _ in 0..3 {
            manager
                .execute_with_provider("pool-a-openai", || async {
                    Err::<(), _>(ProviderError::from_status(503, "down"))
                })
                .await;
        }
        assert_eq!(
            manager.provider_state("pool-a-openai"),
            BreakerPhase::Open
        );
        assert!(!manager.is_provider_available("pool-a-openai"));
        // Another provider in the same pool is unaffected.
        assert!(manager.is_provider_available("pool-a-backup"));
    }

    #[tokio::test]
    async fn metrics_track_latency_and_error_rate() {
        let manager = manager();
        manager
            .execute_with_provider("pool-a-p1", || async {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok::<_, ProviderError>(())
            })
            .await;
        manager
            .execute_with_provider("pool-a-p1", || async {
                Err::<(), _>(ProviderError::from_status(500, "boom"))
            })
            .await;

        let metrics = manager.provider_metrics("pool-a-p1");
        assert_eq!(metrics.total_requests, 2);
        assert_eq!(metrics.failed_requests, 1);
        assert_eq!(metrics.consecutive_failures, 1);
        assert!(metrics.error_rate > 0.49 && metrics.error_rate < 0.51);
        assert!(metrics.average_response_time_ms > 0.0);
    }

    #[tokio::test]
    async fn reset_clears_state_and_metrics() {
        let manager = manager();
        for _ in 0..3 {
            manager
                .execute_with_provider("pool-a-p1", || async {
                    Err::<(), _>(ProviderError::from_status(500, "boom"))
                })
                .await;
        }
        manager.reset_provider("pool-a-p1");
        assert_eq!(manager.provider_state("pool-a-p1"), BreakerPhase::Closed);
        assert_eq!(manager.provider_metrics("pool-a-p1").total_requests, 0);
    }
}
