use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FailureKind;
use crate::models::StrategyKind;

/// Status of a fetch task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Leased,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Leased,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Leased => "leased",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Held by a worker (claimed but not yet finished).
    pub fn is_in_flight(&self) -> bool {
        matches!(self, TaskStatus::Leased | TaskStatus::Running)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(TaskStatus::Pending),
            "leased" => Ok(TaskStatus::Leased),
            "running" => Ok(TaskStatus::Running),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(format!("Unknown task status: {}", s)),
        }
    }
}

/// Retry backoff: `base * 2^(attempts-1)`, capped at `max_delay`, plus
/// uniform jitter in `[0, delay]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    #[serde(with = "crate::config::millis")]
    pub base_delay: Duration,
    #[serde(with = "crate::config::millis")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(30 * 60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Deterministic part of the delay after the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }

    /// Delay with jitter applied, in `[delay, 2 * delay]`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64);
        delay + Duration::from_millis(extra_ms)
    }

    /// Earliest time a task may be claimed again after `attempt` failures.
    pub fn next_eligible(&self, attempt: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + TimeDelta::from_std(self.backoff(attempt)).unwrap_or(TimeDelta::MAX)
    }
}

/// A fetch task in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Canonical URL.
    pub url: String,
    pub domain: String,
    pub status: TaskStatus,
    /// Higher is claimed sooner.
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<FailureKind>,
    /// Strategy that was running when the last failure happened, if any.
    pub failed_strategy: Option<StrategyKind>,
    pub not_before: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        url: impl Into<String>,
        domain: impl Into<String>,
        priority: i32,
        max_attempts: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            url: url.into(),
            domain: domain.into(),
            status: TaskStatus::Pending,
            priority,
            attempts: 0,
            max_attempts,
            last_error: None,
            error_kind: None,
            failed_strategy: None,
            not_before: None,
            worker_id: None,
            result_id: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Pending and past its `not_before`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before.is_none_or(|t| t <= now)
    }
}

/// Request to enqueue a URL.
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    pub url: String,
    pub priority: i32,
    pub max_attempts: Option<u32>,
}

impl EnqueueRequest {
    pub const DEFAULT_PRIORITY: i32 = 5;

    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            priority: Self::DEFAULT_PRIORITY,
            max_attempts: None,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = Some(max);
        self
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    Created(Task),
    /// The canonical URL is already active or was seen within the freshness window.
    DuplicateSkipped { canonical_url: String },
}

impl EnqueueOutcome {
    pub fn is_created(&self) -> bool {
        matches!(self, EnqueueOutcome::Created(_))
    }
}

/// A failed attempt, as reported by a worker.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub kind: FailureKind,
    pub message: String,
    pub strategy: Option<StrategyKind>,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            strategy: None,
        }
    }

    pub fn with_strategy(mut self, strategy: Option<StrategyKind>) -> Self {
        self.strategy = strategy;
        self
    }
}

impl From<&crate::error::AppError> for TaskFailure {
    fn from(err: &crate::error::AppError) -> Self {
        Self::new(err.failure_kind(), err.to_string())
    }
}

/// Result of `mark_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    RetryScheduled { not_before: DateTime<Utc> },
    Exhausted,
}

/// Task counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub pending: u64,
    pub leased: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl TaskCounts {
    pub fn add(&mut self, status: TaskStatus, n: u64) {
        match status {
            TaskStatus::Pending => self.pending += n,
            TaskStatus::Leased => self.leased += n,
            TaskStatus::Running => self.running += n,
            TaskStatus::Completed => self.completed += n,
            TaskStatus::Failed => self.failed += n,
        }
    }

    pub fn get(&self, status: TaskStatus) -> u64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Leased => self.leased,
            TaskStatus::Running => self.running,
            TaskStatus::Completed => self.completed,
            TaskStatus::Failed => self.failed,
        }
    }

    pub fn total(&self) -> u64 {
        self.pending + self.leased + self.running + self.completed + self.failed
    }
}
