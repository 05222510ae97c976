//! Retry and circuit breaking around engine calls.
//!
//! [`ResilientExecutor`] retries transient [`TenantError`]s with a
//! configurable backoff and trips a circuit breaker after repeated
//! infrastructure failures. While the circuit is open, calls fail fast with
//! [`TenantError::ServiceUnavailable`] without touching the engine.
//!
//! ## Example
//!
//! ```rust,ignore
//! let executor = ResilientExecutor::new("tenant-engine")
//!     .with_retry(RetryPolicy::new(3).backoff(BackoffStrategy::exponential(Duration::from_millis(50))))
//!     .with_circuit_breaker(CircuitBreakerConfig::default().failure_threshold(5));
//!
//! let exists = executor.execute(|| engine.database_exists("TenantDB_ACME")).await?;
//! ```

use crate::error::{ErrorKind, TenantError, TenantResult};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Delay between attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    None,
    Constant(Duration),
    /// Delay multiplied by `multiplier` after each attempt, capped at `max`
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

impl BackoffStrategy {
    pub fn constant(delay: Duration) -> Self {
        Self::Constant(delay)
    }

    pub fn exponential(initial: Duration) -> Self {
        Self::Exponential {
            initial,
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }

    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match self {
            Self::None => Duration::ZERO,
            Self::Constant(d) => *d,
            Self::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let factor = multiplier.powi(attempt as i32);
                let millis = (initial.as_millis() as f64 * factor) as u64;
                Duration::from_millis(millis).min(*max)
            }
        }
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(100))
    }
}

/// Retry policy. Only transient errors are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Attempts including the first one
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Default::default()
        }
    }

    /// Single attempt.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: BackoffStrategy::None,
        }
    }

    pub fn backoff(mut self, backoff: BackoffStrategy) -> Self {
        self.backoff = backoff;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive infrastructure failures before the circuit opens
    pub failure_threshold: u32,
    /// Successful probes needed to close a half-open circuit
    pub success_threshold: u32,
    /// Time the circuit stays open before allowing probes
    pub reset_timeout: Duration,
    /// Concurrent probes allowed while half-open
    pub half_open_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            reset_timeout: Duration::from_secs(30),
            half_open_requests: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn half_open_requests(mut self, count: u32) -> Self {
        self.half_open_requests = count.max(1);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    opened_at: Option<Instant>,
    failures: u32,
    successes: u32,
    probes_in_flight: u32,
    /// Bumped on every transition into half-open.
    generation: u64,
}

/// Half-open call slot. Released on drop if the call never reported back.
struct HalfOpenSlot<'a> {
    executor: &'a ResilientExecutor,
    generation: Option<u64>,
}

impl HalfOpenSlot<'_> {
    fn settle(mut self, failed: bool) {
        self.generation = None;
        if failed {
            self.executor.record_failure();
        } else {
            self.executor.record_success();
        }
    }
}

impl Drop for HalfOpenSlot<'_> {
    fn drop(&mut self) {
        let Some(generation) = self.generation else {
            return;
        };
        let mut breaker = self.executor.breaker.lock();
        if breaker.state == CircuitState::HalfOpen && breaker.generation == generation {
            breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
            debug!(name = %self.executor.name, "Abandoned half-open call released");
        }
    }
}

/// Call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutorStats {
    pub attempts: u64,
    pub retries: u64,
    pub rejections: u64,
}

/// Retry plus circuit breaker
#[derive(Debug)]
pub struct ResilientExecutor {
    name: String,
    retry: RetryPolicy,
    config: CircuitBreakerConfig,
    breaker: Mutex<Breaker>,
    stats: Mutex<ExecutorStats>,
}

impl Default for ResilientExecutor {
    fn default() -> Self {
        Self::new("tenant-engine")
    }
}

impl ResilientExecutor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retry: RetryPolicy::default(),
            config: CircuitBreakerConfig::default(),
            breaker: Mutex::new(Breaker {
                state: CircuitState::Closed,
                opened_at: None,
                failures: 0,
                successes: 0,
                probes_in_flight: 0,
                generation: 0,
            }),
            stats: Mutex::new(ExecutorStats::default()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CircuitState {
        let mut breaker = self.breaker.lock();
        self.maybe_half_open(&mut breaker);
        breaker.state
    }

    pub fn stats(&self) -> ExecutorStats {
        *self.stats.lock()
    }

    /// Run `op` under the retry policy and the circuit breaker.
    pub async fn execute<F, Fut, T>(&self, mut op: F) -> TenantResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = TenantResult<T>>,
    {
        let mut attempt = 0;
        loop {
            let Some(slot) = self.try_acquire() else {
                self.stats.lock().rejections += 1;
                debug!(name = %self.name, "Circuit open, call rejected");
                return Err(TenantError::ServiceUnavailable(format!(
                    "circuit '{}' is open",
                    self.name
                )));
            };
            self.stats.lock().attempts += 1;

            let result = op().await;
            slot.settle(matches!(&result, Err(e) if e.kind() == ErrorKind::Infrastructure));

            let error = match result {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(name = %self.name, attempt = attempt + 1, "Retry succeeded");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            attempt += 1;
            if !error.is_transient() || attempt >= self.retry.max_attempts {
                if attempt > 1 {
                    warn!(name = %self.name, attempts = attempt, error = %error, "Retries exhausted");
                }
                return Err(error);
            }

            let delay = self.retry.backoff.delay_for_attempt(attempt - 1);
            debug!(name = %self.name, attempt, delay = ?delay, error = %error, "Transient failure, retrying");
            self.stats.lock().retries += 1;
            if delay > Duration::ZERO {
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn maybe_half_open(&self, breaker: &mut Breaker) {
        if breaker.state != CircuitState::Open {
            return;
        }
        if let Some(opened_at) = breaker.opened_at
            && opened_at.elapsed() >= self.config.reset_timeout
        {
            debug!(name = %self.name, "Circuit transitioning to half-open");
            breaker.state = CircuitState::HalfOpen;
            breaker.successes = 0;
            breaker.probes_in_flight = 0;
            breaker.generation += 1;
        }
    }

    fn try_acquire(&self) -> Option<HalfOpenSlot<'_>> {
        let mut breaker = self.breaker.lock();
        self.maybe_half_open(&mut breaker);
        let generation = match breaker.state {
            CircuitState::Closed => None,
            CircuitState::Open => return None,
            CircuitState::HalfOpen => {
                if breaker.probes_in_flight >= self.config.half_open_requests {
                    return None;
                }
                breaker.probes_in_flight += 1;
                Some(breaker.generation)
            }
        };
        Some(HalfOpenSlot {
            executor: self,
            generation,
        })
    }

    fn record_success(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::Closed => breaker.failures = 0,
            CircuitState::HalfOpen => {
                breaker.probes_in_flight = breaker.probes_in_flight.saturating_sub(1);
                breaker.successes += 1;
                if breaker.successes >= self.config.success_threshold {
                    info!(name = %self.name, "Circuit closed");
                    breaker.state = CircuitState::Closed;
                    breaker.opened_at = None;
                    breaker.failures = 0;
                    breaker.successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self) {
        let mut breaker = self.breaker.lock();
        match breaker.state {
            CircuitState::Closed => {
                breaker.failures += 1;
                if breaker.failures >= self.config.failure_threshold {
                    self.open(&mut breaker);
                }
            }
            CircuitState::HalfOpen => self.open(&mut breaker),
            CircuitState::Open => {}
        }
    }

    fn open(&self, breaker: &mut Breaker) {
        warn!(name = %self.name, failures = breaker.failures, "Circuit opened");
        breaker.state = CircuitState::Open;
        breaker.opened_at = Some(Instant::now());
        breaker.successes = 0;
        breaker.probes_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_delays() {
        let backoff = BackoffStrategy::Exponential {
            initial: Duration::from_millis(100),
            multiplier: 2.0,
            max: Duration::from_millis(500),
        };
        assert_eq!(backoff.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(backoff.delay_for_attempt(5), Duration::from_millis(500));
        assert_eq!(BackoffStrategy::None.delay_for_attempt(3), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let executor = ResilientExecutor::new("test")
            .with_retry(RetryPolicy::new(3).backoff(BackoffStrategy::constant(Duration::from_millis(10))));
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(|| async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TenantError::transient("timeout"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(executor.stats().retries, 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let executor = ResilientExecutor::new("test").with_retry(RetryPolicy::new(5));
        let calls = AtomicU32::new(0);

        let result: TenantResult<()> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TenantError::PreconditionFailed("code mismatch".to_string()))
            })
            .await;

        assert!(matches!(result, Err(TenantError::PreconditionFailed(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_opens_and_recovers() {
        let executor = ResilientExecutor::new("test")
            .with_retry(RetryPolicy::none())
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(2)
                    .success_threshold(1)
                    .reset_timeout(Duration::from_secs(5)),
            );

        for _ in 0..2 {
            let _: TenantResult<()> = executor
                .execute(|| async { Err(TenantError::infrastructure("down")) })
                .await;
        }
        assert_eq!(executor.state(), CircuitState::Open);

        let calls = AtomicU32::new(0);
        let rejected: TenantResult<()> = executor
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(rejected, Err(TenantError::ServiceUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(executor.stats().rejections, 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(executor.state(), CircuitState::HalfOpen);

        executor.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(executor.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let executor = ResilientExecutor::new("test")
            .with_retry(RetryPolicy::none())
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(1)
                    .reset_timeout(Duration::from_secs(1)),
            );

        let _: TenantResult<()> = executor
            .execute(|| async { Err(TenantError::transient("down")) })
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let _: TenantResult<()> = executor
            .execute(|| async { Err(TenantError::transient("still down")) })
            .await;
        assert_eq!(executor.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_half_open_call_frees_its_slot() {
        let executor = ResilientExecutor::new("test")
            .with_retry(RetryPolicy::none())
            .with_circuit_breaker(
                CircuitBreakerConfig::default()
                    .failure_threshold(1)
                    .success_threshold(1)
                    .reset_timeout(Duration::from_secs(1)),
            );

        let _: TenantResult<()> = executor
            .execute(|| async { Err(TenantError::infrastructure("down")) })
            .await;
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(executor.state(), CircuitState::HalfOpen);

        // Dropped before the engine answers, as a cancelled caller would.
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            executor.execute(|| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, TenantError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(executor.state(), CircuitState::HalfOpen);

        executor.execute(|| async { Ok(()) }).await.unwrap();
        assert_eq!(executor.state(), CircuitState::Closed);
        assert_eq!(executor.stats().rejections, 0);
    }

    #[tokio::test]
    async fn test_not_found_does_not_trip_circuit() {
        let executor = ResilientExecutor::new("test")
            .with_circuit_breaker(CircuitBreakerConfig::default().failure_threshold(1));

        let _: TenantResult<()> = executor
            .execute(|| async { Err(TenantError::NotFound("db".to_string())) })
            .await;
        assert_eq!(executor.state(), CircuitState::Closed);
    }
}
