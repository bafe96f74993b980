use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::task::{
    EnqueueOutcome, EnqueueRequest, FailOutcome, RetryConfig, Task, TaskCounts, TaskFailure,
    TaskStatus,
};

/// Settings shared by every [`TaskStore`] implementation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// A URL seen within this window is not enqueued again.
    #[serde(with = "crate::config::millis")]
    pub freshness_window: Duration,
    /// Attempts granted to tasks that do not ask for a specific limit.
    pub default_max_attempts: u32,
    pub retry: RetryConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            freshness_window: Duration::from_secs(24 * 60 * 60),
            default_max_attempts: 3,
            retry: RetryConfig::default(),
        }
    }
}

/// Durable queue of fetch tasks with a per-URL uniqueness guarantee.
///
/// Status changes are check-and-set: every transition names the status it
/// expects to find and fails with [`AppError::InvalidTransition`] otherwise.
/// `completed` and `failed` are final.
pub trait TaskStore: Send + Sync + Clone {
    /// Canonicalizes the URL and creates a `pending` task unless the URL is
    /// already active or was seen within the freshness window. The dedup
    /// decision and the creation are one atomic step.
    fn enqueue(
        &self,
        request: EnqueueRequest,
    ) -> impl Future<Output = Result<EnqueueOutcome, AppError>> + Send;

    /// Atomically claims the eligible task with the highest priority
    /// (earliest `created_at` on ties) and moves it to `leased`.
    ///
    /// Tasks whose domain is in `excluded_domains` are skipped.
    fn claim_next(
        &self,
        worker_id: &str,
        excluded_domains: &[String],
    ) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// `leased` → `running`.
    fn mark_running(&self, task_id: Uuid) -> impl Future<Output = Result<(), AppError>> + Send;

    /// `running` → `completed`, attaching the stored result.
    fn mark_completed(
        &self,
        task_id: Uuid,
        result_id: Uuid,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Consumes an attempt. Reschedules with backoff while attempts remain,
    /// otherwise moves the task to `failed`.
    fn mark_failed(
        &self,
        task_id: Uuid,
        failure: &TaskFailure,
    ) -> impl Future<Output = Result<FailOutcome, AppError>> + Send;

    /// Returns an in-flight task to `pending` without consuming an attempt.
    fn release(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release all tasks held by a specific worker (for graceful shutdown).
    fn release_worker_tasks(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Returns tasks stuck in flight for longer than `older_than` to `pending`.
    fn recover_stale(
        &self,
        older_than: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get(&self, task_id: Uuid) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Most recent task for the canonical form of `url`.
    fn get_by_url(&self, url: &str)
    -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> impl Future<Output = Result<Vec<Task>, AppError>> + Send;

    fn counts(&self) -> impl Future<Output = Result<TaskCounts, AppError>> + Send;

    /// Drops dedup entries not seen within the freshness window. The dedup
    /// decision is unchanged: an expired entry no longer suppresses anything.
    fn evict_expired_dedup(&self) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Deletes terminal tasks last updated more than `older_than` ago, along
    /// with expired dedup entries.
    fn purge_terminal(
        &self,
        older_than: Duration,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;
}
