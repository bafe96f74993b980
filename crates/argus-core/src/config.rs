//! Engine configuration: defaults, JSON file, `ARGUS_*` environment overrides,
//! and a hot-reloadable shared snapshot.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::cascade::CascadeConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::AppError;
use crate::pool::PoolConfig;
use crate::task_store::StoreConfig;
use crate::throttle::ThrottleConfig;
use crate::worker::WorkerConfig;

/// Serde helper storing a [`Duration`] as whole milliseconds.
pub mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Complete engine configuration.
///
/// `worker` and `cascade` settings are read from the live snapshot on every
/// task, so a reload takes effect immediately. `pool`, `throttle`, `store`
/// and `breaker` are consumed when the components are built and keep their
/// startup values across reloads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub worker: WorkerConfig,
    pub pool: PoolConfig,
    pub cascade: CascadeConfig,
    pub store: StoreConfig,
    pub throttle: ThrottleConfig,
    pub breaker: CircuitBreakerConfig,
}

impl EngineConfig {
    /// Defaults overridden by `ARGUS_*` environment variables.
    pub fn from_env() -> Result<Self, AppError> {
        let mut config = Self::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file, then applies environment overrides.
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Failed to read config {}: {e}", path.display()))
        })?;
        let mut config: Self = serde_json::from_str(&raw).map_err(|e| {
            AppError::ConfigError(format!("Invalid config {}: {e}", path.display()))
        })?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// `from_file` when a path is given, `from_env` otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        match path {
            Some(path) => Self::from_file(path),
            None => Self::from_env(),
        }
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), AppError> {
        let env = Overrides { lookup };

        env.set("ARGUS_MAX_WORKERS", &mut self.worker.max_workers)?;
        env.set_millis("ARGUS_FETCH_TIMEOUT_MS", &mut self.worker.fetch_timeout)?;
        env.set("ARGUS_PER_DOMAIN_LIMIT", &mut self.throttle.per_domain_limit)?;
        env.set_millis("ARGUS_DOMAIN_DELAY_MS", &mut self.throttle.delay)?;
        env.set_millis("ARGUS_ACQUIRE_TIMEOUT_MS", &mut self.pool.acquire_timeout)?;
        env.set_millis("ARGUS_LEASE_TIMEOUT_MS", &mut self.pool.lease_timeout)?;
        env.set("ARGUS_ACCEPTANCE_THRESHOLD", &mut self.cascade.acceptance_threshold)?;
        env.set_millis("ARGUS_LLM_TIMEOUT_MS", &mut self.cascade.llm_timeout)?;
        env.set_millis("ARGUS_OCR_TIMEOUT_MS", &mut self.cascade.ocr_timeout)?;
        env.set("ARGUS_MAX_ATTEMPTS", &mut self.store.default_max_attempts)?;
        env.set_millis("ARGUS_RETRY_BASE_MS", &mut self.store.retry.base_delay)?;
        env.set_millis("ARGUS_RETRY_MAX_MS", &mut self.store.retry.max_delay)?;

        let mut freshness_secs = self.store.freshness_window.as_secs();
        env.set("ARGUS_FRESHNESS_WINDOW_SECS", &mut freshness_secs)?;
        self.store.freshness_window = Duration::from_secs(freshness_secs);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.worker.max_workers == 0 {
            return Err(AppError::ConfigError("max_workers must be at least 1".into()));
        }
        if self.throttle.per_domain_limit == 0 {
            return Err(AppError::ConfigError(
                "per_domain_limit must be at least 1".into(),
            ));
        }
        if self.store.default_max_attempts == 0 {
            return Err(AppError::ConfigError("max_attempts must be at least 1".into()));
        }
        if self.store.retry.base_delay > self.store.retry.max_delay {
            return Err(AppError::ConfigError(
                "retry base delay must not exceed the maximum delay".into(),
            ));
        }
        for (name, value) in [
            ("affinity_min_health", self.pool.affinity_min_health),
            ("retirement_threshold", self.pool.retirement_threshold),
            ("recovery_health", self.pool.recovery_health),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(AppError::ConfigError(format!(
                    "{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if self.worker.fetch_timeout.is_zero() || self.pool.acquire_timeout.is_zero() {
            return Err(AppError::ConfigError("timeouts must be non-zero".into()));
        }
        let max_hold = self.max_lease_hold();
        if self.pool.lease_timeout <= max_hold {
            return Err(AppError::ConfigError(format!(
                "lease_timeout ({:?}) must exceed the longest paced fetch ({max_hold:?})",
                self.pool.lease_timeout
            )));
        }
        self.cascade.validate()
    }

    /// Longest time a worker can hold an identity lease: pacing behind every
    /// other in-flight request on the domain, then the full fetch deadline.
    /// The pool reaper must never fire before this.
    pub fn max_lease_hold(&self) -> Duration {
        let spacing = self.throttle.delay.saturating_add(self.throttle.jitter);
        let queued = u32::try_from(self.throttle.per_domain_limit).unwrap_or(u32::MAX);
        spacing
            .checked_mul(queued)
            .unwrap_or(Duration::MAX)
            .saturating_add(self.worker.fetch_timeout)
    }

    /// Copies the construction-time sections from `current`. Returns whether
    /// any of them differed.
    fn keep_fixed_sections(&mut self, current: &EngineConfig) -> bool {
        let changed = self.pool != current.pool
            || self.throttle != current.throttle
            || self.store != current.store
            || self.breaker != current.breaker;
        self.pool = current.pool.clone();
        self.throttle = current.throttle.clone();
        self.store = current.store.clone();
        self.breaker = current.breaker.clone();
        changed
    }
}

struct Overrides<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Overrides<F> {
    fn set<T: FromStr>(&self, key: &str, target: &mut T) -> Result<(), AppError> {
        if let Some(raw) = (self.lookup)(key) {
            *target = raw
                .trim()
                .parse()
                .map_err(|_| AppError::ConfigError(format!("Invalid {key} '{raw}'")))?;
        }
        Ok(())
    }

    fn set_millis(&self, key: &str, target: &mut Duration) -> Result<(), AppError> {
        let mut ms = target.as_millis() as u64;
        self.set(key, &mut ms)?;
        *target = Duration::from_millis(ms);
        Ok(())
    }
}

/// Shared, swappable configuration snapshot.
///
/// Readers take an `Arc` of the current snapshot; [`SharedConfig::replace`]
/// publishes a new one. A snapshot is never mutated in place.
#[derive(Clone)]
pub struct SharedConfig {
    tx: Arc<watch::Sender<Arc<EngineConfig>>>,
}

impl SharedConfig {
    pub fn new(config: EngineConfig) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(config));
        Self { tx: Arc::new(tx) }
    }

    pub fn snapshot(&self) -> Arc<EngineConfig> {
        self.tx.borrow().clone()
    }

    /// Validates and publishes `config`. The previous snapshot stays live on error.
    ///
    /// Pool, throttle, store and breaker settings are carried over from the
    /// current snapshot, so validation runs against the values the running
    /// components actually use.
    pub fn replace(&self, mut config: EngineConfig) -> Result<(), AppError> {
        if config.keep_fixed_sections(&self.snapshot()) {
            tracing::warn!(
                "Pool, throttle, store and breaker changes need a restart; keeping current values"
            );
        }
        config.validate()?;
        self.tx.send_replace(Arc::new(config));
        tracing::info!("Engine configuration reloaded");
        Ok(())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<EngineConfig>> {
        self.tx.subscribe()
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig")
            .field("current", &*self.snapshot())
            .finish()
    }
}
