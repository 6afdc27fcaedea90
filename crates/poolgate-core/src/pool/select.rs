use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use rand::Rng;

use poolgate_provider_core::{ProviderConfig, RoutingStrategy};

/// Per-pool load-balancing state. Round-robin advances atomically; the
/// connection table backs `least_connections`.
#[derive(Default)]
pub(crate) struct PoolBalancer {
    round_robin: AtomicUsize,
    connections: Mutex<HashMap<String, usize>>,
}

impl PoolBalancer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connections_for(&self, provider: &str) -> usize {
        *lock(&self.connections).get(provider).unwrap_or(&0)
    }

    /// Increment the in-flight count for `provider`; the guard decrements on
    /// drop so both success and failure paths release.
    pub(crate) fn track_connection<'a>(&'a self, provider: &str) -> ConnectionGuard<'a> {
        *lock(&self.connections)
            .entry(provider.to_string())
            .or_insert(0) += 1;
        ConnectionGuard {
            balancer: self,
            provider: provider.to_string(),
        }
    }
}

pub(crate) struct ConnectionGuard<'a> {
    balancer: &'a PoolBalancer,
    provider: String,
}

impl Drop for ConnectionGuard<'_> {
    fn drop(&mut self) {
        let mut connections = lock(&self.balancer.connections);
        if let Some(count) = connections.get_mut(&self.provider) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Pick one provider among the healthy candidates. Ties break on config
/// order; `response_time` supplies health-manager latency (infinity when
/// unmeasured).
pub(crate) fn select_provider<'a>(
    strategy: RoutingStrategy,
    candidates: &[&'a ProviderConfig],
    balancer: &PoolBalancer,
    response_time: impl Fn(&str) -> f64,
) -> Option<&'a ProviderConfig> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        RoutingStrategy::Weighted => {
            let total: u64 = candidates.iter().map(|c| u64::from(c.weight.max(1))).sum();
            let mut roll = rand::rng().random_range(0..total);
            for candidate in candidates.iter().copied() {
                let weight = u64::from(candidate.weight.max(1));
                if roll < weight {
                    return Some(candidate);
                }
                roll -= weight;
            }
            candidates.last().copied()
        }
        // Missing cost counts as zero, so un-priced providers win.
        RoutingStrategy::CostOptimized => candidates
            .iter()
            .copied()
            .fold(None::<&ProviderConfig>, |best, candidate| match best {
                None => Some(candidate),
                Some(current) => {
                    let current_cost = current.cost_per_token.unwrap_or(0.0);
                    let candidate_cost = candidate.cost_per_token.unwrap_or(0.0);
                    if candidate_cost < current_cost {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            }),
        RoutingStrategy::FastestResponse => candidates
            .iter()
            .copied()
            .fold(None::<(&ProviderConfig, f64)>, |best, candidate| {
                let time = response_time(&candidate.name);
                match best {
                    None => Some((candidate, time)),
                    Some((current, current_time)) if time < current_time => {
                        Some((candidate, time))
                    }
                    Some(best) => Some(best),
                }
            })
            .map(|(candidate, _)| candidate),
        RoutingStrategy::RoundRobin => {
            let index = balancer.round_robin.fetch_add(1, Ordering::Relaxed) % candidates.len();
            candidates.get(index).copied()
        }
        RoutingStrategy::LeastConnections => candidates
            .iter()
            .copied()
            .fold(None::<(&ProviderConfig, usize)>, |best, candidate| {
                let count = balancer.connections_for(&candidate.name);
                match best {
                    None => Some((candidate, count)),
                    Some((current, current_count)) if count < current_count => {
                        Some((candidate, count))
                    }
                    Some(best) => Some(best),
                }
            })
            .map(|(candidate, _)| candidate),
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
    use std::collections::HashMap;

    fn provider(name: &str, weight: u32, cost: Option<f64>) -> ProviderConfig {
        serde_json::from_value(serde_json::json!({
            "name": name,
            "kind": "openai",
            "apiKey": "sk-test-12345678",
            "apiBase": "https://example.com/v1",
            "modelName": "gpt-4o",
            "weight": weight,
            "costPerToken": cost,
        }))
        .unwrap()
    }

    #[test]
    fn round_robin_is_fair_over_a_full_rotation() {
        let providers = [
            provider("a", 1, None),
            provider("b", 1, None),
            provider("c", 1, None),
        ];
        let refs: Vec<&ProviderConfig> = providers.iter().collect();
        let balancer = PoolBalancer::new();

        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..30 {
            let chosen =
                select_provider(RoutingStrategy::RoundRobin, &refs, &balancer, |_| 0.0)
                    .unwrap();
            *counts.entry(chosen.name.clone()).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 10);
        assert_eq!(counts["b"], 10);
        assert_eq!(counts["c"], 10);
    }

    #[test]
    fn cost_optimized_prefers_cheapest_and_treats_missing_as_zero() {
        let providers = [
            provider("paid", 1, Some(0.002)),
            provider("cheap", 1, Some(0.0005)),
            provider("unpriced", 1, None),
        ];
        let refs: Vec<&ProviderConfig> = providers.iter().collect();
        let balancer = PoolBalancer::new();
        let chosen =
            select_provider(RoutingStrategy::CostOptimized, &refs, &balancer, |_| 0.0).unwrap();
        assert_eq!(chosen.name, "unpriced");

        let priced_only: Vec<&ProviderConfig> = providers[..2].iter().collect();
        let chosen =
            select_provider(RoutingStrategy::CostOptimized, &priced_only, &balancer, |_| 0.0)
                .unwrap();
        assert_eq!(chosen.name, "cheap");
    }

    #[test]
    fn fastest_response_treats_unmeasured_as_slowest() {
        let providers = [provider("slow", 1, None), provider("fast", 1, None)];
        let refs: Vec<&ProviderConfig> = providers.iter().collect();
        let balancer = PoolBalancer::new();
        let chosen = select_provider(RoutingStrategy::FastestResponse, &refs, &balancer, |name| {
            match name {
                "slow" => 900.0,
                "fast" => 120.0,
                _ => f64::INFINITY,
            }
        })
        .unwrap();
        assert_eq!(chosen.name, "fast");
    }

    #[test]
    fn weighted_selection_respects_weights_statistically() {
        let providers = [provider("heavy", 9, None), provider("light", 1, None)];
        let refs: Vec<&ProviderConfig> = providers.iter().collect();
        let balancer = PoolBalancer::new();
        let mut heavy = 0;
        for _ in 0..500 {
            let chosen =
                select_provider(RoutingStrategy::Weighted, &refs, &balancer, |_| 0.0).unwrap();
            if chosen.name == "heavy" {
                heavy += 1;
            }
        }
        // Expected ~450; allow a generous band.
        assert!(heavy > 380, "heavy chosen {heavy} times");
    }

    #[test]
    fn least_connections_tracks_guards() {
        let providers = [provider("a", 1, None), provider("b", 1, None)];
        let refs: Vec<&ProviderConfig> = providers.iter().collect();
        let balancer = PoolBalancer::new();

        let guard = balancer.track_connection("a");
        let chosen =
            select_provider(RoutingStrategy::LeastConnections, &refs, &balancer, |_| 0.0)
                .unwrap();
        assert_eq!(chosen.name, "b");

        drop(guard);
        assert_eq!(balancer.connections_for("a"), 0);
        let chosen =
            select_provider(RoutingStrategy::LeastConnections, &refs, &balancer, |_| 0.0)
                .unwrap();
        assert_eq!(chosen.name, "a");
    }
}
