use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use poolgate_common::RequestContext;
use poolgate_provider_core::ProviderHandle;

use crate::breaker::BreakerPhase;
use crate::health::manager::ProviderHealthManager;

const EMA_ALPHA: f64 = 0.1;
const NORMAL_STAGGER: Duration = Duration::from_millis(50);
const BACKGROUND_DELAY: Duration = Duration::from_millis(500);
const BACKGROUND_STAGGER: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent_checks: usize,
    pub primary_interval: Duration,
    pub fallback_interval: Duration,
    pub failed_interval: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub enable_prioritization: bool,
    pub enable_adaptive_intervals: bool,
    pub default_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: 20,
            primary_interval: Duration::from_secs(60),
            fallback_interval: Duration::from_secs(120),
            failed_interval: Duration::from_secs(15),
            max_retries: 2,
            retry_delay: Duration::from_secs(2),
            enable_prioritization: true,
            enable_adaptive_intervals: true,
            default_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerMetrics {
    pub total_checks: u64,
    pub successful_checks: u64,
    pub failed_checks: u64,
    pub timed_out_checks: u64,
    pub average_response_time_ms: f64,
    pub queue_length: usize,
    pub checks_per_second: f64,
}

struct TaskState {
    model: String,
    priority: u8,
    adapter: ProviderHandle,
    retry_count: u32,
    last_attempt: Option<Instant>,
    timeout: Duration,
}

/// Bounded-concurrency health prober. A counting semaphore admits probes;
/// due tasks are prioritized (unhealthy first) and staggered so a large
/// fleet never probes in one burst while recovering providers stay fresh.
pub struct HealthCheckScheduler {
    config: SchedulerConfig,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<String, TaskState>>,
    health: Arc<ProviderHealthManager>,
    metrics: Mutex<SchedulerMetrics>,
}

impl HealthCheckScheduler {
    pub fn new(config: SchedulerConfig, health: Arc<ProviderHealthManager>) -> Self {
        let permits = config.max_concurrent_checks.max(1);
        Self {
            config,
            semaphore: Arc::new(Semaphore::new(permits)),
            tasks: Mutex::new(HashMap::new()),
            health,
            metrics: Mutex::new(SchedulerMetrics::default()),
        }
    }

    pub fn register_task(
        &self,
        model: impl Into<String>,
        provider_id: impl Into<String>,
        priority: u8,
        adapter: ProviderHandle,
        timeout: Option<Duration>,
    ) {
        let mut tasks = lock(&self.tasks);
        tasks.insert(
            provider_id.into(),
            TaskState {
                model: model.into(),
                priority,
                adapter,
                retry_count: 0,
                last_attempt: None,
                timeout: timeout.unwrap_or(self.config.default_timeout),
            },
        );
    }

    pub fn remove_task(&self, provider_id: &str) {
        lock(&self.tasks).remove(provider_id);
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    pub fn metrics(&self) -> SchedulerMetrics {
        lock(&self.metrics).clone()
    }

    pub fn tick_period(&self) -> Duration {
        let shortest = self
            .config
            .primary_interval
            .min(self.config.fallback_interval)
            .min(self.config.failed_interval);
        (shortest / 3).max(Duration::from_millis(100))
    }

    /// Drive the scheduler until the task is aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.tick_period());
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.run_cycle().await;
            }
        })
    }

    /// One scheduling tick: select due tasks, order them, dispatch in bands.
    pub async fn run_cycle(self: &Arc<Self>) {
        let now = Instant::now();
        let mut due: Vec<(String, BreakerPhase, u8, Option<Instant>)> = Vec::new();
        {
            let tasks = lock(&self.tasks);
            for (provider_id, task) in tasks.iter() {
                let phase = self.health.provider_state(provider_id);
                let interval = self.interval_for(provider_id, phase, task.priority);
                let is_due = match task.last_attempt {
                    Some(last) => now.saturating_duration_since(last) >= interval,
                    None => true,
                };
                if is_due {
                    due.push((provider_id.clone(), phase, task.priority, task.last_attempt));
                }
            }
        }

        if self.config.enable_prioritization {
            due.sort_by(|a, b| {
                phase_rank(a.1)
                    .cmp(&phase_rank(b.1))
                    .then(a.2.cmp(&b.2))
                    .then(compare_attempts(a.3, b.3))
            });
        }

        {
            let mut metrics = lock(&self.metrics);
            metrics.queue_length = due.len();
            metrics.checks_per_second = due.len() as f64 / self.tick_period().as_secs_f64();
        }

        let mut normal_index = 0u32;
        let mut background_index = 0u32;
        for (provider_id, phase, priority, _) in due {
            let delay = if phase != BreakerPhase::Closed || priority <= 2 {
                Duration::ZERO
            } else if priority <= 5 {
                let delay = NORMAL_STAGGER * normal_index;
                normal_index += 1;
                delay
            } else {
                let delay = BACKGROUND_DELAY + BACKGROUND_STAGGER * background_index;
                background_index += 1;
                delay
            };
            tokio::spawn(Arc::clone(self).run_probe(provider_id, delay));
        }
    }

    async fn run_probe(self: Arc<Self>, provider_id: String, delay: Duration) {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };

        let Some((adapter, timeout, model)) = ({
            let mut tasks = lock(&self.tasks);
            tasks.get_mut(&provider_id).map(|task| {
                task.last_attempt = Some(Instant::now());
                (task.adapter.clone(), task.timeout, task.model.clone())
            })
        }) else {
            return;
        };

        let ctx = RequestContext::new(timeout);
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, adapter.health_check(&ctx)).await;
        let elapsed = started.elapsed();

        let (success, timed_out, detail) = match outcome {
            Ok(Ok(true)) => (true, false, String::new()),
            Ok(Ok(false)) => (false, false, "health check reported unhealthy".to_string()),
            Ok(Err(err)) => (false, false, err.to_string()),
            Err(_) => (false, true, "health check timeout".to_string()),
        };

        self.record_result(&provider_id, success, timed_out, elapsed)
            .await;
        self.health
            .observe(&provider_id, success, elapsed, &detail)
            .await;

        if success {
            if let Some(task) = lock(&self.tasks).get_mut(&provider_id) {
                task.retry_count = 0;
            }
            return;
        }

        tracing::debug!(provider = %provider_id, model = %model, %detail, "health check failed");
        let retry_count = {
            let mut tasks = lock(&self.tasks);
            match tasks.get_mut(&provider_id) {
                Some(task) => {
                    task.retry_count += 1;
                    task.retry_count
                }
                None => return,
            }
        };
        if retry_count < self.config.max_retries {
            let scheduler = Arc::clone(&self);
            let delay = self.config.retry_delay * retry_count;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                // Mark due so the next cycle picks it up immediately.
                if let Some(task) = lock(&scheduler.tasks).get_mut(&provider_id) {
                    task.last_attempt = None;
                }
            });
        }
    }

    async fn record_result(
        &self,
        _provider_id: &str,
        success: bool,
        timed_out: bool,
        elapsed: Duration,
    ) {
        let mut metrics = lock(&self.metrics);
        metrics.total_checks += 1;
        if success {
            metrics.successful_checks += 1;
        } else if timed_out {
            metrics.timed_out_checks += 1;
            metrics.failed_checks += 1;
        } else {
            metrics.failed_checks += 1;
        }
        let sample = elapsed.as_secs_f64() * 1_000.0;
        if metrics.average_response_time_ms == 0.0 {
            metrics.average_response_time_ms = sample;
        } else {
            metrics.average_response_time_ms =
                metrics.average_response_time_ms * (1.0 - EMA_ALPHA) + sample * EMA_ALPHA;
        }
    }

    /// Probe period for one task. Adaptive mode tightens intervals for
    /// failing and recovering providers and relaxes them by priority.
    fn interval_for(&self, provider_id: &str, phase: BreakerPhase, priority: u8) -> Duration {
        if !self.config.enable_adaptive_intervals {
            if phase != BreakerPhase::Closed {
                return self.config.failed_interval;
            }
            return if priority <= 5 {
                self.config.primary_interval
            } else {
                self.config.fallback_interval
            };
        }

        let consecutive_failures = self
            .health
            .provider_metrics(provider_id)
            .consecutive_failures;
        if phase == BreakerPhase::Open || consecutive_failures > 0 {
            let n = consecutive_failures.max(1);
            let growth = 1.5f64.powi(n as i32 - 1).min(4.0);
            return self
                .config
                .failed_interval
                .mul_f64(growth)
                .min(self.config.primary_interval);
        }
        if phase == BreakerPhase::HalfOpen {
            return self.config.primary_interval.mul_f64(0.75);
        }
        if priority <= 3 {
            return self.config.primary_interval;
        }
        if priority <= 6 {
            return self.config.primary_interval.mul_f64(1.25);
        }
        self.config.fallback_interval
    }
}

fn phase_rank(phase: BreakerPhase) -> u8 {
    match phase {
        BreakerPhase::Open => 0,
        BreakerPhase::HalfOpen => 1,
        BreakerPhase::Closed => 2,
    }
}

fn compare_attempts(a: Option<Instant>, b: Option<Instant>) -> std::cmp::Ordering {
    match (a, b) {
        (None, None) => std::cmp::Ordering::Equal,
        // Never-attempted tasks sort first.
        (None, Some(_)) => std::cmp::Ordering::Less,
        (Some(_), None) => std::cmp::Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
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
    use async_trait::async_trait;
    use poolgate_protocol::chat::ChatCompletionRequestBody;
    use poolgate_provider_core::error::ProviderError;
    use poolgate_provider_core::{
        BreakerSettings, ByteStream, ChatOutcome, ProviderAdapter, ProviderKind, ProviderResult,
    };
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct ProbeAdapter {
        healthy: AtomicBool,
        checks: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for ProbeAdapter {
        fn name(&self) -> &str {
            "probe"
        }
        fn kind(&self) -> ProviderKind {
            ProviderKind::OpenAI
        }
        fn model_name(&self) -> &str {
            "gpt-4o"
        }
        async fn chat_completion(
            &self,
            _request: &ChatCompletionRequestBody,
            _ctx: &RequestContext,
        ) -> ProviderResult<ChatOutcome> {
            Err(ProviderError::unsupported("chat"))
        }
        async fn stream_chat_completion(
            &self,
            _request: &ChatCompletionRequestBody,
            _ctx: &RequestContext,
        ) -> ProviderResult<ByteStream> {
            Err(ProviderError::unsupported("stream"))
        }
        async fn health_check(&self, _ctx: &RequestContext) -> ProviderResult<bool> {
            self.checks.fetch_add(1, Ordering::SeqCst);
            Ok(self.healthy.load(Ordering::SeqCst))
        }
    }

    fn scheduler_with(config: SchedulerConfig) -> (Arc<HealthCheckScheduler>, Arc<ProviderHealthManager>) {
        let health = Arc::new(ProviderHealthManager::new(BreakerSettings::default()));
        (
            Arc::new(HealthCheckScheduler::new(config, health.clone())),
            health,
        )
    }

    #[tokio::test]
    async fn probes_report_into_the_health_manager() {
        let (scheduler, health) = scheduler_with(SchedulerConfig {
            retry_delay: Duration::from_millis(1),
            ..SchedulerConfig::default()
        });
        let adapter = Arc::new(ProbeAdapter {
            healthy: AtomicBool::new(false),
            checks: AtomicU32::new(0),
        });
        scheduler.register_task("gpt-4o", "pool-a-probe", 1, adapter.clone(), None);

        scheduler.run_cycle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(adapter.checks.load(Ordering::SeqCst), 1);
        let metrics = health.provider_metrics("pool-a-probe");
        assert_eq!(metrics.consecutive_failures, 1);
        let scheduler_metrics = scheduler.metrics();
        assert_eq!(scheduler_metrics.total_checks, 1);
        assert_eq!(scheduler_metrics.failed_checks, 1);
    }

    #[tokio::test]
    async fn successful_probe_resets_retry_count() {
        let (scheduler, health) = scheduler_with(SchedulerConfig::default());
        let adapter = Arc::new(ProbeAdapter {
            healthy: AtomicBool::new(true),
            checks: AtomicU32::new(0),
        });
        scheduler.register_task("gpt-4o", "pool-a-probe", 1, adapter.clone(), None);
        scheduler.run_cycle().await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(scheduler.metrics().successful_checks, 1);
        assert_eq!(health.provider_metrics("pool-a-probe").consecutive_failures, 0);
    }

    #[tokio::test]
    async fn adaptive_intervals_follow_the_contract() {
        let (scheduler, health) = scheduler_with(SchedulerConfig {
            primary_interval: Duration::from_secs(60),
            fallback_interval: Duration::from_secs(120),
            failed_interval: Duration::from_secs(15),
            ..SchedulerConfig::default()
        });

        // Healthy, high priority.
        assert_eq!(
            scheduler.interval_for("p", BreakerPhase::Closed, 2),
            Duration::from_secs(60)
        );
        // Healthy, mid priority: 60 × 1.25.
        assert_eq!(
            scheduler.interval_for("p", BreakerPhase::Closed, 5),
            Duration::from_secs(75)
        );
        // Healthy, low priority.
        assert_eq!(
            scheduler.interval_for("p", BreakerPhase::Closed, 9),
            Duration::from_secs(120)
        );
        // Half-open: 60 × 0.75.
        assert_eq!(
            scheduler.interval_for("p", BreakerPhase::HalfOpen, 2),
            Duration::from_secs(45)
        );

        // One failure: failed interval × 1.5^0.
        health.observe("failing", false, Duration::from_millis(5), "boom").await;
        assert_eq!(
            scheduler.interval_for("failing", BreakerPhase::Closed, 2),
            Duration::from_secs(15)
        );
        // Growth caps at 4× and never exceeds the primary interval.
        for _ in 0..10 {
            health.observe("failing", false, Duration::from_millis(5), "boom").await;
        }
        assert_eq!(
            scheduler.interval_for("failing", BreakerPhase::Open, 2),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn tick_period_is_a_third_of_the_shortest_interval() {
        let (scheduler, _) = scheduler_with(SchedulerConfig {
            primary_interval: Duration::from_secs(60),
            fallback_interval: Duration::from_secs(120),
            failed_interval: Duration::from_secs(15),
            ..SchedulerConfig::default()
        });
        assert_eq!(scheduler.tick_period(), Duration::from_secs(5));
    }
}
