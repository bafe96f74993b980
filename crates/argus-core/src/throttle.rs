//! Per-domain admission control and request spacing.
//!
//! Two limits apply to every domain:
//!
//! - at most `per_domain_limit` fetches in flight, enforced with a
//!   non-blocking semaphore permit so a worker that loses the race can
//!   hand the task back instead of idling on one domain;
//! - a minimum `delay` (plus random jitter) between consecutive request
//!   starts, to stay polite towards the target.
//!
//! State for a domain is created on first admission and dropped by
//! [`DomainThrottle::evict_idle`] once nothing is in flight and the pacing
//! window has passed.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use argus_core::throttle::{DomainThrottle, ThrottleConfig};
//!
//! # async fn run() {
//! let throttle = DomainThrottle::new(
//!     ThrottleConfig::new(2, Duration::from_secs(1)).with_jitter(Duration::from_millis(500)),
//! );
//! if let Some(_permit) = throttle.try_admit("shop.example") {
//!     throttle.pace("shop.example").await;
//!     // fetch while the permit is held
//! }
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for per-domain throttling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Maximum concurrent fetches against one domain.
    pub per_domain_limit: usize,

    /// Minimum delay between consecutive request starts on the same domain.
    #[serde(with = "crate::config::millis")]
    pub delay: Duration,

    /// Maximum random jitter added on top of `delay` (uniform [0, jitter]).
    ///
    /// Set to `Duration::ZERO` to disable.
    #[serde(with = "crate::config::millis")]
    pub jitter: Duration,
}

impl ThrottleConfig {
    pub fn new(per_domain_limit: usize, delay: Duration) -> Self {
        Self {
            per_domain_limit,
            delay,
            jitter: Duration::ZERO,
        }
    }

    /// Add random jitter (uniform [0, jitter]) on top of the base delay.
    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Compute the effective delay for a single wait (delay + random jitter).
    fn effective_delay(&self) -> Duration {
        if self.jitter.is_zero() {
            return self.delay;
        }
        let jitter_ms = rand::thread_rng().gen_range(0..self.jitter.as_millis() as u64);
        self.delay + Duration::from_millis(jitter_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            per_domain_limit: 2,
            delay: Duration::from_secs(1),
            jitter: Duration::from_millis(500),
        }
    }
}

/// Slot held while a fetch against `domain` is in flight. Dropping it frees the slot.
#[derive(Debug)]
pub struct DomainPermit {
    domain: String,
    _permit: OwnedSemaphorePermit,
}

impl DomainPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

struct DomainState {
    slots: Arc<Semaphore>,
    /// Reserved start time of the most recent request.
    last_start: Option<Instant>,
}

/// Per-domain concurrency limiter and pacer, shared by all workers.
#[derive(Clone)]
pub struct DomainThrottle {
    config: ThrottleConfig,
    domains: Arc<Mutex<HashMap<String, DomainState>>>,
}

impl DomainThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            domains: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    fn lock_domains(&self) -> MutexGuard<'_, HashMap<String, DomainState>> {
        self.domains.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Domain throttle recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Takes a concurrency slot for `domain` without waiting.
    pub fn try_admit(&self, domain: &str) -> Option<DomainPermit> {
        let limit = self.config.per_domain_limit.max(1);
        // Acquired under the lock so eviction never drops a semaphore mid-admission.
        let permit = self
            .lock_domains()
            .entry(domain.to_string())
            .or_insert_with(|| DomainState {
                slots: Arc::new(Semaphore::new(limit)),
                last_start: None,
            })
            .slots
            .clone()
            .try_acquire_owned()
            .ok()?;
        Some(DomainPermit {
            domain: domain.to_string(),
            _permit: permit,
        })
    }

    /// Domains whose concurrency slots are all taken.
    pub fn saturated_domains(&self) -> Vec<String> {
        self.lock_domains()
            .iter()
            .filter(|(_, state)| state.slots.available_permits() == 0)
            .map(|(domain, _)| domain.clone())
            .collect()
    }

    /// Number of domains with live admission state.
    pub fn tracked_domains(&self) -> usize {
        self.lock_domains().len()
    }

    /// Drops domains with no fetch in flight whose last request started more
    /// than `delay + jitter` ago. Returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let limit = self.config.per_domain_limit.max(1);
        let spacing = self.config.delay.saturating_add(self.config.jitter);
        let now = Instant::now();
        let mut domains = self.lock_domains();
        let before = domains.len();
        domains.retain(|_, state| {
            let busy = state.slots.available_permits() < limit;
            let pacing = state
                .last_start
                .is_some_and(|last| now.saturating_duration_since(last) < spacing);
            busy || pacing
        });
        before - domains.len()
    }

    /// Waits until the per-domain delay since the previous request start has elapsed.
    ///
    /// The start slot is reserved under the lock, so concurrent callers on the
    /// same domain are spaced out rather than released together.
    pub async fn pace(&self, domain: &str) {
        let wait = {
            let mut domains = self.lock_domains();
            let Some(state) = domains.get_mut(domain) else {
                return;
            };
            let now = Instant::now();
            let start = match state.last_start {
                Some(last) => (last + self.config.effective_delay()).max(now),
                None => now,
            };
            state.last_start = Some(start);
            start - now
        };

        if !wait.is_zero() {
            tracing::debug!(%domain, sleep_ms = %wait.as_millis(), "Throttling request");
            tokio::time::sleep(wait).await;
        }
    }
}
