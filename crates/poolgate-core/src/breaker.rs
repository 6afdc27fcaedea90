use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use regex::RegexBuilder;
use tokio::time::Instant;

use poolgate_provider_core::error::ProviderError;
use poolgate_provider_core::{BreakerSettings, ErrorClass};

const RECENT_ERRORS_CAP: usize = 100;
const TRANSITIONS_CAP: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerPhase {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerPhase::Closed => "closed",
            BreakerPhase::Open => "open",
            BreakerPhase::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
pub enum BreakerError {
    /// Short-circuited without invoking the operation.
    Open { retry_after: Duration },
    Operation(ProviderError),
}

#[derive(Debug)]
pub struct BreakerReport<T> {
    pub result: Result<T, BreakerError>,
    pub phase: BreakerPhase,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub at: Instant,
    pub message: String,
    pub class: ErrorClass,
}

#[derive(Debug, Clone)]
pub struct TransitionRecord {
    pub at: Instant,
    pub from: BreakerPhase,
    pub to: BreakerPhase,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct BreakerSnapshot {
    pub phase: BreakerPhase,
    pub failures: u32,
    pub request_count: u32,
    pub success_count: u32,
    pub immediate_trips: u32,
    pub last_failure_age: Option<Duration>,
    pub next_attempt_in: Option<Duration>,
    pub recent_error_count: usize,
    pub transition_count: usize,
}

#[derive(Debug)]
struct BreakerState {
    phase: BreakerPhase,
    failures: u32,
    request_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    next_attempt_at: Option<Instant>,
    /// Immediate (permanent-failure) trips observed so far; drives backoff doubling.
    immediate_trips: u32,
    recent_errors: VecDeque<ErrorRecord>,
    transitions: VecDeque<TransitionRecord>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            failures: 0,
            request_count: 0,
            success_count: 0,
            last_failure_at: None,
            next_attempt_at: None,
            immediate_trips: 0,
            recent_errors: VecDeque::new(),
            transitions: VecDeque::new(),
        }
    }

    fn transition(&mut self, to: BreakerPhase, reason: impl Into<String>) {
        let from = self.phase;
        self.phase = to;
        self.transitions.push_back(TransitionRecord {
            at: Instant::now(),
            from,
            to,
            reason: reason.into(),
        });
        if self.transitions.len() > TRANSITIONS_CAP {
            // Half-trim so the log keeps older context without growing.
            let drop = self.transitions.len() / 2;
            self.transitions.drain(..drop);
        }
    }

    fn prune_errors(&mut self, window: Duration) {
        let cutoff = Instant::now().checked_sub(window);
        if let Some(cutoff) = cutoff {
            while let Some(front) = self.recent_errors.front() {
                if front.at > cutoff {
                    break;
                }
                self.recent_errors.pop_front();
            }
        }
        while self.recent_errors.len() > RECENT_ERRORS_CAP {
            self.recent_errors.pop_front();
        }
    }
}

/// Three-phase circuit breaker guarding one provider or one pool.
///
/// Trip causes: error-rate over the request threshold, or a single
/// permanently-classified failure (`not_found`/`authentication`, or any
/// configured error pattern) when permanent-failure handling is enabled.
pub struct CircuitBreaker {
    settings: BreakerSettings,
    patterns: Vec<regex::Regex>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings) -> Self {
        let patterns = settings
            .permanent_failure_handling
            .as_ref()
            .map(|handling| {
                handling
                    .error_patterns
                    .iter()
                    .filter_map(|pattern| {
                        match RegexBuilder::new(pattern).case_insensitive(true).build() {
                            Ok(regex) => Some(regex),
                            Err(err) => {
                                tracing::warn!(%pattern, %err, "ignoring invalid error pattern");
                                None
                            }
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            settings,
            patterns,
            state: Mutex::new(BreakerState::new()),
        }
    }

    pub async fn execute<T, F, Fut>(&self, op: F) -> BreakerReport<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if !self.settings.enabled {
            let started = Instant::now();
            let result = op().await.map_err(BreakerError::Operation);
            return BreakerReport {
                result,
                phase: self.phase(),
                elapsed: started.elapsed(),
            };
        }

        // Admission: promote open → half-open once the timeout elapsed.
        {
            let mut state = self.lock();
            state.prune_errors(Duration::from_millis(self.settings.monitoring_window_ms));
            if state.phase == BreakerPhase::Open {
                let now = Instant::now();
                match state.next_attempt_at {
                    Some(at) if now >= at => {
                        state.transition(BreakerPhase::HalfOpen, "reset timeout elapsed");
                    }
                    Some(at) => {
                        let retry_after = at.saturating_duration_since(now);
                        return BreakerReport {
                            result: Err(BreakerError::Open { retry_after }),
                            phase: BreakerPhase::Open,
                            elapsed: Duration::ZERO,
                        };
                    }
                    None => {
                        state.transition(BreakerPhase::HalfOpen, "missing next attempt time");
                    }
                }
            }
        }

        let started = Instant::now();
        let result = op().await;
        let elapsed = started.elapsed();

        match result {
            Ok(value) => {
                let phase = self.on_success();
                BreakerReport {
                    result: Ok(value),
                    phase,
                    elapsed,
                }
            }
            Err(err) => {
                let phase = self.on_failure(&err);
                BreakerReport {
                    result: Err(BreakerError::Operation(err)),
                    phase,
                    elapsed,
                }
            }
        }
    }

    fn on_success(&self) -> BreakerPhase {
        let mut state = self.lock();
        match state.phase {
            BreakerPhase::HalfOpen => {
                state.transition(BreakerPhase::Closed, "probe succeeded");
                state.failures = 0;
                state.request_count = 0;
                state.success_count = 0;
                state.immediate_trips = 0;
                state.next_attempt_at = None;
            }
            _ => {
                state.request_count += 1;
                state.success_count += 1;
            }
        }
        state.phase
    }

    fn on_failure(&self, err: &ProviderError) -> BreakerPhase {
        let mut state = self.lock();
        state.request_count += 1;
        state.failures += 1;
        state.last_failure_at = Some(Instant::now());
        state.recent_errors.push_back(ErrorRecord {
            at: Instant::now(),
            message: err.message.clone(),
            class: err.class,
        });
        state.prune_errors(Duration::from_millis(self.settings.monitoring_window_ms));

        if state.phase == BreakerPhase::HalfOpen {
            // Any probe failure reopens; permanent failures keep their backoff.
            let timeout = if self.is_permanent_failure(err) {
                let timeout = self.immediate_timeout(state.immediate_trips);
                state.immediate_trips += 1;
                timeout
            } else {
                Duration::from_millis(self.settings.reset_timeout_ms)
            };
            state.next_attempt_at = Some(Instant::now() + timeout);
            state.transition(BreakerPhase::Open, "probe failed");
            return state.phase;
        }

        if self.is_permanent_failure(err) {
            let timeout = self.immediate_timeout(state.immediate_trips);
            state.immediate_trips += 1;
            state.next_attempt_at = Some(Instant::now() + timeout);
            state.transition(
                BreakerPhase::Open,
                format!("permanent failure ({})", err.class),
            );
            return state.phase;
        }

        if state.request_count >= self.settings.min_requests_threshold {
            let rate = state.failures as f64 / state.request_count as f64;
            if rate >= self.settings.error_threshold_pct / 100.0 {
                let next =
                    Instant::now() + Duration::from_millis(self.settings.reset_timeout_ms);
                state.next_attempt_at = Some(next);
                state.transition(
                    BreakerPhase::Open,
                    format!("error rate {:.0}%", rate * 100.0),
                );
            }
        }
        state.phase
    }

    fn is_permanent_failure(&self, err: &ProviderError) -> bool {
        let Some(handling) = &self.settings.permanent_failure_handling else {
            return false;
        };
        if !handling.enabled {
            return false;
        }
        if err.class.trips_immediately() {
            return true;
        }
        self.patterns
            .iter()
            .any(|pattern| pattern.is_match(&err.message))
    }

    /// Immediate-trip open duration: `max(reset × multiplier, base)` doubled
    /// per prior trip up to the backoff cap.
    fn immediate_timeout(&self, trips_so_far: u32) -> Duration {
        let Some(handling) = &self.settings.permanent_failure_handling else {
            return Duration::from_millis(self.settings.reset_timeout_ms);
        };
        let base = (self.settings.reset_timeout_ms as f64 * handling.timeout_multiplier)
            .max(handling.base_timeout_ms as f64);
        let exponent = trips_so_far.min(handling.max_backoff_multiplier);
        Duration::from_millis((base * f64::from(2u32.saturating_pow(exponent))) as u64)
    }

    pub fn phase(&self) -> BreakerPhase {
        self.lock().phase
    }

    /// Open breakers count as available again once their timeout elapsed
    /// (the next execute runs the half-open probe).
    pub fn is_available(&self) -> bool {
        let state = self.lock();
        match state.phase {
            BreakerPhase::Open => state
                .next_attempt_at
                .is_some_and(|at| Instant::now() >= at),
            _ => true,
        }
    }

    /// Reset to closed. The immediate-trip count survives so a permanent
    /// failure that recurs right after a reset keeps its doubled backoff;
    /// only a successful half-open probe clears it.
    pub fn reset(&self) {
        let mut state = self.lock();
        state.transition(BreakerPhase::Closed, "manual reset");
        state.failures = 0;
        state.request_count = 0;
        state.success_count = 0;
        state.next_attempt_at = None;
        state.recent_errors.clear();
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let state = self.lock();
        BreakerSnapshot {
            phase: state.phase,
            failures: state.failures,
            request_count: state.request_count,
            success_count: state.success_count,
            immediate_trips: state.immediate_trips,
            last_failure_age: state.last_failure_at.map(|at| at.elapsed()),
            next_attempt_in: state
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            recent_error_count: state.recent_errors.len(),
            transition_count: state.transitions.len(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
