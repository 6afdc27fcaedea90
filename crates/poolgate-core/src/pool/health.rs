use serde::Serialize;
use tokio::time::Instant;

use poolgate_provider_core::PoolDefinition;

use crate::health::manager::ProviderHealthManager;
use crate::health::provider_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHealthSnapshot {
    pub name: String,
    pub is_healthy: bool,
    pub response_time_ms: f64,
    pub error_rate: f64,
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolHealthReport {
    pub pool_id: String,
    pub status: PoolStatus,
    pub score: u32,
    pub healthy_providers: usize,
    pub total_providers: usize,
    pub average_response_time_ms: f64,
    pub average_error_rate: f64,
    pub providers: Vec<ProviderHealthSnapshot>,
    #[serde(skip)]
    pub computed_at: Instant,
}

/// Score starts at 100 and is penalized against the pool's thresholds;
/// the status is what fallback decisions key off.
pub(crate) fn compute_pool_health(
    pool: &PoolDefinition,
    health: &ProviderHealthManager,
) -> PoolHealthReport {
    let mut providers = Vec::with_capacity(pool.providers.len());
    for provider in &pool.providers {
        let key = provider_key(&pool.id, &provider.name);
        let metrics = health.provider_metrics(&key);
        providers.push(ProviderHealthSnapshot {
            name: provider.name.clone(),
            is_healthy: health.is_provider_available(&key),
            response_time_ms: metrics.average_response_time_ms,
            error_rate: metrics.error_rate,
            consecutive_failures: metrics.consecutive_failures,
        });
    }

    let healthy: Vec<&ProviderHealthSnapshot> =
        providers.iter().filter(|p| p.is_healthy).collect();
    let healthy_count = healthy.len();
    let average_response_time_ms = if healthy.is_empty() {
        0.0
    } else {
        healthy.iter().map(|p| p.response_time_ms).sum::<f64>() / healthy.len() as f64
    };
    let average_error_rate = if healthy.is_empty() {
        0.0
    } else {
        healthy.iter().map(|p| p.error_rate).sum::<f64>() / healthy.len() as f64
    };

    let thresholds = &pool.health_thresholds;
    let mut score: i32 = 100;
    if average_response_time_ms > thresholds.response_time_ms as f64 {
        score -= 30;
    }
    if average_error_rate * 100.0 > thresholds.error_rate_pct {
        score -= 40;
    }
    if healthy_count < thresholds.min_healthy_providers {
        score -= 50;
    }
    let score = score.max(0) as u32;

    let status = if healthy_count < thresholds.min_healthy_providers {
        PoolStatus::Unhealthy
    } else if score < 70 {
        PoolStatus::Degraded
    } else {
        PoolStatus::Healthy
    };

    PoolHealthReport {
        pool_id: pool.id.clone(),
        status,
        score,
        healthy_providers: healthy_count,
        total_providers: providers.len(),
        average_response_time_ms,
        average_error_rate,
        providers,
        computed_at: Instant::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use poolgate_provider_core::BreakerSettings;
    use std::time::Duration;

    fn pool_with_two_providers() -> PoolDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "primary",
            "name": "primary",
            "providers": [
                {
                    "name": "p1",
                    "kind": "openai",
                    "apiKey": "sk-test-12345678",
                    "apiBase": "https://example.com/v1",
                    "modelName": "gpt-4o",
                },
                {
                    "name": "p2",
                    "kind": "openai",
                    "apiKey": "sk-test-12345678",
                    "apiBase": "https://example.com/v1",
                    "modelName": "gpt-4o",
                },
            ],
            "healthThresholds": {
                "errorRatePct": 25.0,
                "responseTimeMs": 1000,
                "consecutiveFailures": 3,
                "minHealthyProviders": 1,
            },
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_pool_reports_healthy_with_full_score() {
        let pool = pool_with_two_providers();
        let health = ProviderHealthManager::new(BreakerSettings::default());
        let report = compute_pool_health(&pool, &health);
        assert_eq!(report.status, PoolStatus::Healthy);
        assert_eq!(report.score, 100);
        assert_eq!(report.healthy_providers, 2);
    }

    #[tokio::test]
    async fn unavailable_providers_push_the_pool_unhealthy() {
        let pool = pool_with_two_providers();
        let health = ProviderHealthManager::new(BreakerSettings {
            min_requests_threshold: 1,
            error_threshold_pct: 50.0,
            ..BreakerSettings::default()
        });
        for provider in ["primary-p1", "primary-p2"] {
            health
                .observe(provider, false, Duration::from_millis(5), "503 down")
                .await;
        }
        let report = compute_pool_health(&pool, &health);
        assert_eq!(report.status, PoolStatus::Unhealthy);
        assert_eq!(report.healthy_providers, 0);
        assert!(report.score <= 50);
    }
}
