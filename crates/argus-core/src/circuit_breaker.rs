//! Circuit breaker for the external extraction services (LLM oracle, OCR).
//!
//! When a service keeps failing, the breaker opens and the cascade treats
//! the corresponding strategy as abstaining instead of paying its deadline
//! on every page.
//!
//! ```text
//! CLOSED --[N failures]--> OPEN --[recovery timeout]--> HALF_OPEN
//!   ^                       ^                               |
//!   |                       +----------[failure]------------+
//!   +--------------------[M successes]----------------------+
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected immediately.
    Open,
    /// Probe calls are let through to test recovery.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit.
    pub failure_threshold: u32,

    /// Successful probes in half-open state needed to close the circuit.
    pub success_threshold: u32,

    /// Time to wait before moving from Open to Half-Open.
    #[serde(with = "crate::config::millis")]
    pub recovery_timeout: Duration,

    /// On a rate-limit failure, multiply the recovery timeout by this factor.
    pub rate_limit_backoff_multiplier: f32,

    /// Upper bound for the extended recovery timeout.
    #[serde(with = "crate::config::millis")]
    pub max_recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            rate_limit_backoff_multiplier: 2.0,
            max_recovery_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    last_error: Option<String>,
    recovery_timeout: Duration,
}

impl BreakerInner {
    fn remaining_open(&self) -> Duration {
        self.opened_at
            .map(|t| self.recovery_timeout.saturating_sub(t.elapsed()))
            .unwrap_or(self.recovery_timeout)
    }
}

/// Statistics about circuit breaker state for monitoring.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
    pub time_until_half_open: Option<Duration>,
}

/// Error type for calls made through the breaker.
#[derive(Debug)]
pub enum CircuitBreakerError {
    /// The circuit is open; the service was not called.
    Open { name: String, retry_after: Duration },
    /// The call was made and failed.
    Inner(AppError),
}

impl std::fmt::Display for CircuitBreakerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitBreakerError::Open { name, retry_after } => write!(
                f,
                "Circuit breaker '{}' is open. Retry after {} seconds.",
                name,
                retry_after.as_secs()
            ),
            CircuitBreakerError::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for CircuitBreakerError {}

/// Thread-safe circuit breaker, shared by all clones.
#[derive(Clone)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        let inner = BreakerInner {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            last_error: None,
            recovery_timeout: config.recovery_timeout,
        };
        Self {
            name: name.into(),
            config,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!(circuit = %self.name, "Recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Returns the current state, applying a due Open → HalfOpen transition.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let mut inner = self.lock_inner();
        self.maybe_half_open(&mut inner);
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
            time_until_half_open: (inner.state == CircuitState::Open)
                .then(|| inner.remaining_open()),
        }
    }

    /// Runs `operation` unless the circuit is open, recording the outcome.
    ///
    /// Only errors for which [`AppError::should_trip_circuit`] holds count
    /// as failures.
    pub async fn call<F, T, Fut>(&self, operation: F) -> Result<T, CircuitBreakerError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        {
            let mut inner = self.lock_inner();
            self.maybe_half_open(&mut inner);
            if inner.state == CircuitState::Open {
                return Err(CircuitBreakerError::Open {
                    name: self.name.clone(),
                    retry_after: inner.remaining_open(),
                });
            }
        }

        let result = operation().await;
        match &result {
            Ok(_) => self.record_success(),
            Err(e) if e.should_trip_circuit() => self.record_failure(e),
            Err(_) => {}
        }
        result.map_err(CircuitBreakerError::Inner)
    }

    pub fn record_success(&self) {
        let mut inner = self.lock_inner();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    tracing::info!(
                        circuit = %self.name,
                        "Circuit breaker closing after {} successful probes",
                        inner.success_count
                    );
                    inner.state = CircuitState::Closed;
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.last_error = None;
                    inner.recovery_timeout = self.config.recovery_timeout;
                }
            }
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&self, error: &AppError) {
        let mut inner = self.lock_inner();
        let is_rate_limit = matches!(
            error,
            AppError::RateLimitExceeded
                | AppError::LlmError {
                    status_code: 429,
                    ..
                }
        );
        inner.last_error = Some(error.to_string());

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        error = %error,
                        "Circuit breaker opening"
                    );
                    self.open(&mut inner, is_rate_limit);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(
                    circuit = %self.name,
                    error = %error,
                    "Circuit breaker probe failed, reopening"
                );
                inner.success_count = 0;
                self.open(&mut inner, is_rate_limit);
            }
            CircuitState::Open => {}
        }
    }

    fn open(&self, inner: &mut BreakerInner, is_rate_limit: bool) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        if is_rate_limit {
            let extended = inner
                .recovery_timeout
                .mul_f32(self.config.rate_limit_backoff_multiplier);
            inner.recovery_timeout = extended.min(self.config.max_recovery_timeout);
            tracing::info!(
                circuit = %self.name,
                recovery_timeout_secs = inner.recovery_timeout.as_secs(),
                "Extended recovery timeout due to rate limit"
            );
        }
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && let Some(opened_at) = inner.opened_at
            && opened_at.elapsed() >= inner.recovery_timeout
        {
            tracing::info!(circuit = %self.name, "Circuit breaker half-open");
            inner.state = CircuitState::HalfOpen;
            inner.success_count = 0;
        }
    }
}
