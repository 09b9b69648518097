//! Provider base: configuration, metrics, circuit breaker and retry.
//!
//! Every external-model provider embeds a [`ProviderCore`] and routes
//! its domain calls through [`ProviderCore::with_retry`]. The core owns
//! the three-state circuit breaker, the retry/backoff policy and the
//! latency metrics, so a concrete provider only implements its wire
//! calls.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;

/// What to do when the model's accelerator runs out of memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeviceFallback {
    /// Surface the error.
    #[default]
    None,

    /// Reconnect once with the device swapped to CPU.
    GpuToCpu,
}

/// Base configuration shared by all providers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Per-request timeout.
    pub timeout: Duration,

    /// Retries after the first attempt for retryable errors.
    pub retry_attempts: u32,

    /// Initial retry delay.
    pub retry_delay: Duration,

    /// Exponential backoff multiplier.
    pub retry_backoff: f64,

    /// Backoff cap.
    pub retry_max_delay: Duration,

    pub device_fallback: DeviceFallback,

    /// Consecutive failures that open the circuit.
    pub circuit_failure_threshold: u32,

    /// Time the circuit stays open before a recovery probe.
    pub circuit_recovery_timeout: Duration,

    /// Concurrent probes allowed while half-open.
    pub circuit_half_open_max_calls: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
            retry_backoff: 2.0,
            retry_max_delay: Duration::from_secs(30),
            device_fallback: DeviceFallback::None,
            circuit_failure_threshold: 3,
            circuit_recovery_timeout: Duration::from_secs(30),
            circuit_half_open_max_calls: 1,
        }
    }
}

/// Failures a provider operation can produce.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    /// Circuit breaker is open (or half-open probes are exhausted).
    #[error("provider '{0}' unavailable")]
    Unavailable(String),

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// CUDA/accelerator out-of-memory class error.
    #[error("GPU out of memory: {0}")]
    GpuOutOfMemory(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("invalid response: {0}")]
    Decode(String),

    #[error("provider not connected")]
    NotConnected,
}

impl ProviderError {
    /// Whether the retry wrapper should try again.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionLost(_) | Self::Timeout(_))
    }

    #[must_use]
    pub const fn is_gpu_error(&self) -> bool {
        matches!(self, Self::GpuOutOfMemory(_))
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(Duration::from_secs(30))
        } else if err.is_connect() {
            Self::ConnectionLost(err.to_string())
        } else {
            Self::Http(err.to_string())
        }
    }
}

/// Aggregate request metrics for one provider.
#[derive(Debug, Clone, Default)]
pub struct ProviderMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ms: f64,
    pub min_latency_ms: Option<f64>,
    pub max_latency_ms: f64,
    pub last_error: Option<String>,
    pub last_error_at: Option<Instant>,
    pub last_success_at: Option<Instant>,
}

impl ProviderMetrics {
    #[must_use]
    pub fn avg_latency_ms(&self) -> f64 {
        if self.successful_requests == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.total_latency_ms / self.successful_requests as f64
        }
    }

    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        {
            self.successful_requests as f64 / self.total_requests as f64
        }
    }

    fn record_success(&mut self, latency_ms: f64) {
        self.total_requests += 1;
        self.successful_requests += 1;
        self.total_latency_ms += latency_ms;
        self.min_latency_ms = Some(self.min_latency_ms.map_or(latency_ms, |m| m.min(latency_ms)));
        if latency_ms > self.max_latency_ms {
            self.max_latency_ms = latency_ms;
        }
        self.last_success_at = Some(Instant::now());
    }

    fn record_failure(&mut self, error: &ProviderError) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Instant::now());
    }
}

/// Provider health as reported by `health_check`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    #[default]
    Unknown,
}

/// Result of a health check.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
}

impl HealthCheck {
    #[must_use]
    pub const fn healthy(latency_ms: f64) -> Self {
        Self {
            status: HealthStatus::Healthy,
            latency_ms: Some(latency_ms),
            message: None,
        }
    }

    #[must_use]
    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            latency_ms: None,
            message: Some(message.into()),
        }
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_in_flight: u32,
}

/// Three-state failure isolation: CLOSED → OPEN → HALF_OPEN → CLOSED.
///
/// Transition rules:
/// * Nth consecutive failure while closed opens the circuit.
/// * An open circuit fails calls fast until the recovery timeout
///   elapses, then a bounded number of half-open probes is admitted.
/// * A successful probe closes the circuit and resets the counter;
///   a failed probe re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_max_calls: u32,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: impl Into<String>, config: &ProviderConfig) -> Self {
        Self {
            name: name.into(),
            failure_threshold: config.circuit_failure_threshold,
            recovery_timeout: config.circuit_recovery_timeout,
            half_open_max_calls: config.circuit_half_open_max_calls,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_in_flight: 0,
            }),
        }
    }

    /// Gate a call. Handles OPEN → HALF_OPEN on elapsed recovery
    /// timeout; admits half-open probes up to the configured bound.
    pub fn check(&self) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock();

        if inner.state == CircuitState::Open {
            let recovered = inner
                .last_failure
                .is_some_and(|at| at.elapsed() >= self.recovery_timeout);
            if recovered {
                inner.state = CircuitState::HalfOpen;
                inner.half_open_in_flight = 0;
                tracing::info!(provider = %self.name, "Circuit breaker OPEN -> HALF_OPEN");
            }
        }

        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => Err(ProviderError::Unavailable(self.name.clone())),
            CircuitState::HalfOpen => {
                if inner.half_open_in_flight >= self.half_open_max_calls {
                    return Err(ProviderError::Unavailable(self.name.clone()));
                }
                inner.half_open_in_flight += 1;
                Ok(())
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.last_failure = None;
                inner.half_open_in_flight = 0;
                tracing::info!(provider = %self.name, "Circuit breaker HALF_OPEN -> CLOSED");
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    /// Record a failed call.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failure_count += 1;
        inner.last_failure = Some(Instant::now());

        match inner.state {
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                tracing::warn!(provider = %self.name, "Circuit breaker HALF_OPEN -> OPEN");
            }
            CircuitState::Closed if inner.failure_count >= self.failure_threshold => {
                inner.state = CircuitState::Open;
                tracing::warn!(
                    provider = %self.name,
                    failures = inner.failure_count,
                    "Circuit breaker CLOSED -> OPEN"
                );
            }
            _ => {}
        }
    }

    /// Current state, without side effects.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Manual reset to closed (operator action).
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure = None;
        inner.half_open_in_flight = 0;
    }
}

/// Shared plumbing every provider embeds.
#[derive(Debug)]
pub struct ProviderCore {
    name: String,
    config: ProviderConfig,
    metrics: Mutex<ProviderMetrics>,
    breaker: CircuitBreaker,
    connected: AtomicBool,
    cpu_fallback_done: AtomicBool,
}

impl ProviderCore {
    #[must_use]
    pub fn new(name: impl Into<String>, config: ProviderConfig) -> Self {
        let name = name.into();
        Self {
            breaker: CircuitBreaker::new(name.clone(), &config),
            name,
            config,
            metrics: Mutex::new(ProviderMetrics::default()),
            connected: AtomicBool::new(false),
            cpu_fallback_done: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn config(&self) -> &ProviderConfig {
        &self.config
    }

    #[must_use]
    pub fn metrics(&self) -> ProviderMetrics {
        self.metrics.lock().clone()
    }

    #[must_use]
    pub const fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            tracing::info!(provider = %self.name, "Provider connected");
        } else {
            tracing::info!(provider = %self.name, "Provider disconnected");
        }
    }

    /// Claim the one-shot CPU fallback after a GPU error.
    ///
    /// Returns `true` exactly once per provider instance, and only
    /// when the config opts into `GpuToCpu`.
    pub fn claim_cpu_fallback(&self, error: &ProviderError) -> bool {
        error.is_gpu_error()
            && self.config.device_fallback == DeviceFallback::GpuToCpu
            && !self.cpu_fallback_done.swap(true, Ordering::SeqCst)
    }

    /// Run an operation through the breaker, retry policy and metrics.
    ///
    /// Retryable errors (connection lost, timeout) back off
    /// exponentially with ±25% jitter up to `retry_attempts` extra
    /// tries; everything else fails immediately. Outcomes feed both
    /// the metrics and the breaker.
    pub async fn with_retry<T, F, Fut>(&self, operation: F) -> Result<T, ProviderError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.breaker.check()?;

        let mut attempt: u32 = 0;
        loop {
            let start = Instant::now();
            match operation().await {
                Ok(value) => {
                    let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
                    self.metrics.lock().record_success(latency_ms);
                    self.breaker.record_success();
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < self.config.retry_attempts => {
                    let delay = self.backoff_delay(attempt);
                    tracing::warn!(
                        provider = %self.name,
                        attempt = attempt + 1,
                        max = self.config.retry_attempts,
                        delay_ms = delay.as_millis(),
                        error = %e,
                        "Retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    self.metrics.lock().record_failure(&e);
                    self.breaker.record_failure();
                    return Err(e);
                }
            }
        }
    }

    /// `min(delay · backoff^attempt, max) × (1 ± 25% jitter)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self
            .config
            .retry_delay
            .mul_f64(self.config.retry_backoff.powi(attempt.min(16) as i32))
            .min(self.config.retry_max_delay);
        base.mul_f64(rand::thread_rng().gen_range(0.75..=1.25))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> ProviderConfig {
        ProviderConfig {
            retry_attempts: 2,
            retry_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(4),
            circuit_failure_threshold: 3,
            circuit_recovery_timeout: Duration::from_millis(100),
            circuit_half_open_max_calls: 1,
            ..ProviderConfig::default()
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("test", &fast_config())
    }

    #[test]
    fn threshold_failures_open_the_circuit() {
        let cb = breaker();
        assert_eq!(cb.state(), CircuitState::Closed);

        for _ in 0..3 {
            assert!(cb.check().is_ok());
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.check(), Err(ProviderError::Unavailable(_))));
    }

    #[test]
    fn success_resets_the_consecutive_counter() {
        let cb = breaker();
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // Only two consecutive failures since the success.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn open_recovers_to_half_open_then_closed() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        assert_eq!(cb.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(150));

        // Recovery timeout elapsed: the next check admits one probe.
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // The probe cap holds while the first is in flight.
        assert!(matches!(cb.check(), Err(ProviderError::Unavailable(_))));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(150));
        assert!(cb.check().is_ok());
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn failure_count_restarts_after_recovery() {
        // Breaker scenario: F,F,F -> OPEN; probe succeeds -> CLOSED;
        // the next failure counts from zero.
        let cb = breaker();
        for _ in 0..3 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(150));
        cb.check().unwrap();
        cb.record_success();

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn with_retry_retries_only_retryable_errors() {
        let core = ProviderCore::new("test", fast_config());
        let calls = std::sync::atomic::AtomicU32::new(0);

        let result: Result<(), _> = core
            .with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::ConnectionLost("refused".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3); // 1 + 2 retries

        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = core
            .with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ProviderError::Decode("bad json".to_string())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1); // no retry
    }

    #[tokio::test]
    async fn with_retry_records_metrics_and_feeds_the_breaker() {
        let core = ProviderCore::new("test", fast_config());

        for _ in 0..3 {
            let _: Result<(), _> = core
                .with_retry(|| async { Err(ProviderError::Decode("boom".to_string())) })
                .await;
        }

        let metrics = core.metrics();
        assert_eq!(metrics.failed_requests, 3);
        assert_eq!(core.breaker().state(), CircuitState::Open);

        // OPEN fails fast without invoking the operation.
        let calls = std::sync::atomic::AtomicU32::new(0);
        let result: Result<(), _> = core
            .with_retry(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;
        assert!(matches!(result, Err(ProviderError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn with_retry_success_records_latency() {
        let core = ProviderCore::new("test", fast_config());
        let value = core.with_retry(|| async { Ok(41 + 1) }).await.unwrap();
        assert_eq!(value, 42);

        let metrics = core.metrics();
        assert_eq!(metrics.successful_requests, 1);
        assert!(metrics.min_latency_ms.is_some());
        assert!((metrics.success_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn cpu_fallback_claims_once() {
        let config = ProviderConfig {
            device_fallback: DeviceFallback::GpuToCpu,
            ..fast_config()
        };
        let core = ProviderCore::new("test", config);
        let oom = ProviderError::GpuOutOfMemory("CUDA out of memory".to_string());

        assert!(core.claim_cpu_fallback(&oom));
        assert!(!core.claim_cpu_fallback(&oom));

        let other = ProviderError::Decode("x".to_string());
        assert!(!core.claim_cpu_fallback(&other));
    }
}
