//! In-process [`TaskStore`] and [`ResultStore`] used by the CLI's offline mode and by tests.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use uuid::Uuid;

use crate::dedup::{self, DedupCache, DedupEntry};
use crate::error::AppError;
use crate::models::{NewResult, StoredResult};
use crate::task::{
    EnqueueOutcome, EnqueueRequest, FailOutcome, Task, TaskCounts, TaskFailure, TaskStatus,
};
use crate::task_store::{StoreConfig, TaskStore};
use crate::traits::ResultStore;

struct StoreInner {
    /// Insertion order doubles as `created_at` order.
    tasks: Vec<Task>,
    dedup: DedupCache,
}

impl StoreInner {
    fn find_mut(&mut self, task_id: Uuid) -> Result<&mut Task, AppError> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| AppError::NotFound(format!("task {task_id}")))
    }
}

/// [`TaskStore`] backed by a single mutex over tasks and the dedup cache.
#[derive(Clone)]
pub struct InMemoryTaskStore {
    config: StoreConfig,
    inner: Arc<Mutex<StoreInner>>,
}

impl InMemoryTaskStore {
    pub fn new(config: StoreConfig) -> Self {
        let dedup = DedupCache::new(config.freshness_window);
        Self {
            config,
            inner: Arc::new(Mutex::new(StoreInner {
                tasks: Vec::new(),
                dedup,
            })),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Task store recovered from poisoned mutex");
            poisoned.into_inner()
        })
    }

    /// Dedup entry for a URL, if it has been enqueued before.
    pub fn dedup_entry(&self, url: &str) -> Result<Option<DedupEntry>, AppError> {
        let canonical = dedup::canonicalize_url(url)?;
        Ok(self.lock_inner().dedup.get(&canonical).cloned())
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}

fn expect_status(task: &Task, expected: &[TaskStatus], to: TaskStatus) -> Result<(), AppError> {
    if expected.contains(&task.status) {
        Ok(())
    } else {
        Err(AppError::InvalidTransition {
            task_id: task.id,
            from: task.status.to_string(),
            to: to.to_string(),
        })
    }
}

fn to_delta(d: Duration) -> TimeDelta {
    TimeDelta::from_std(d).unwrap_or(TimeDelta::MAX)
}

impl TaskStore for InMemoryTaskStore {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, AppError> {
        let canonical = dedup::canonicalize_url(&request.url)?;
        let domain = dedup::domain_of(&canonical)?;
        let now = Utc::now();

        let mut inner = self.lock_inner();
        let seen_recently = inner.dedup.observe(&canonical, now);
        let active = inner
            .tasks
            .iter()
            .any(|t| t.url == canonical && !t.status.is_terminal());

        if seen_recently || active {
            tracing::debug!(url = %canonical, active, "Duplicate enqueue skipped");
            return Ok(EnqueueOutcome::DuplicateSkipped {
                canonical_url: canonical,
            });
        }

        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .max(1);
        let task = Task::new(canonical, domain, request.priority, max_attempts);
        inner.tasks.push(task.clone());
        Ok(EnqueueOutcome::Created(task))
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        excluded_domains: &[String],
    ) -> Result<Option<Task>, AppError> {
        let now = Utc::now();
        let mut inner = self.lock_inner();

        let mut best: Option<usize> = None;
        for (idx, task) in inner.tasks.iter().enumerate() {
            if !task.is_eligible(now) || excluded_domains.contains(&task.domain) {
                continue;
            }
            // Strictly greater keeps the earliest task among equal priorities.
            if best.is_none_or(|b| task.priority > inner.tasks[b].priority) {
                best = Some(idx);
            }
        }

        Ok(best.map(|idx| {
            let task = &mut inner.tasks[idx];
            task.status = TaskStatus::Leased;
            task.worker_id = Some(worker_id.to_string());
            task.updated_at = now;
            task.clone()
        }))
    }

    async fn mark_running(&self, task_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        let task = inner.find_mut(task_id)?;
        expect_status(task, &[TaskStatus::Leased], TaskStatus::Running)?;
        let now = Utc::now();
        task.status = TaskStatus::Running;
        task.started_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn mark_completed(&self, task_id: Uuid, result_id: Uuid) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        let task = inner.find_mut(task_id)?;
        expect_status(task, &[TaskStatus::Running], TaskStatus::Completed)?;
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.result_id = Some(result_id);
        task.completed_at = Some(now);
        task.updated_at = now;
        task.worker_id = None;
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: Uuid,
        failure: &TaskFailure,
    ) -> Result<FailOutcome, AppError> {
        let mut inner = self.lock_inner();
        let task = inner.find_mut(task_id)?;
        expect_status(
            task,
            &[TaskStatus::Leased, TaskStatus::Running],
            TaskStatus::Failed,
        )?;

        let now = Utc::now();
        task.attempts += 1;
        task.last_error = Some(failure.message.clone());
        task.error_kind = Some(failure.kind);
        task.failed_strategy = failure.strategy;
        task.worker_id = None;
        task.updated_at = now;

        if task.attempts < failure.kind.attempt_limit(task.max_attempts) {
            let not_before = self.config.retry.next_eligible(task.attempts, now);
            task.status = TaskStatus::Pending;
            task.not_before = Some(not_before);
            Ok(FailOutcome::RetryScheduled { not_before })
        } else {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(now);
            Ok(FailOutcome::Exhausted)
        }
    }

    async fn release(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let mut inner = self.lock_inner();
        let task = inner.find_mut(task_id)?;
        expect_status(
            task,
            &[TaskStatus::Leased, TaskStatus::Running],
            TaskStatus::Pending,
        )?;
        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.not_before = not_before;
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut inner = self.lock_inner();
        let now = Utc::now();
        let mut count = 0u64;
        for task in inner.tasks.iter_mut() {
            if task.status.is_in_flight() && task.worker_id.as_deref() == Some(worker_id) {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, AppError> {
        let mut inner = self.lock_inner();
        let now = Utc::now();
        let cutoff = now - to_delta(older_than);
        let mut count = 0u64;
        for task in inner.tasks.iter_mut() {
            if task.status.is_in_flight() && task.updated_at < cutoff {
                tracing::warn!(task_id = %task.id, worker_id = ?task.worker_id, "Recovering stale task");
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        let inner = self.lock_inner();
        Ok(inner.tasks.iter().find(|t| t.id == task_id).cloned())
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<Task>, AppError> {
        let canonical = dedup::canonicalize_url(url)?;
        let inner = self.lock_inner();
        Ok(inner
            .tasks
            .iter()
            .rev()
            .find(|t| t.url == canonical)
            .cloned())
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, AppError> {
        let inner = self.lock_inner();
        Ok(inner
            .tasks
            .iter()
            .rev()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<TaskCounts, AppError> {
        let inner = self.lock_inner();
        let mut counts = TaskCounts::default();
        for task in &inner.tasks {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, older_than: Duration) -> Result<u64, AppError> {
        let cutoff = Utc::now() - to_delta(older_than);
        let purged = {
            let mut inner = self.lock_inner();
            let before = inner.tasks.len();
            inner
                .tasks
                .retain(|t| !(t.status.is_terminal() && t.updated_at < cutoff));
            (before - inner.tasks.len()) as u64
        };
        self.evict_expired_dedup().await?;
        Ok(purged)
    }

    async fn evict_expired_dedup(&self) -> Result<u64, AppError> {
        let cutoff = Utc::now() - to_delta(self.config.freshness_window);
        Ok(self.lock_inner().dedup.evict_older_than(cutoff) as u64)
    }
}

/// [`ResultStore`] kept in memory, newest last.
#[derive(Clone, Default)]
pub struct InMemoryResultStore {
    results: Arc<Mutex<Vec<StoredResult>>>,
}

impl InMemoryResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<StoredResult> {
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ResultStore for InMemoryResultStore {
    async fn save(&self, result: &NewResult) -> Result<Uuid, AppError> {
        let stored = StoredResult {
            id: Uuid::new_v4(),
            task_id: result.task_id,
            url: result.url.clone(),
            canonical_link: result.canonical_link.clone(),
            result: result.result.clone(),
            content_hash: result.content_hash.clone(),
            created_at: Utc::now(),
        };
        let id = stored.id;
        self.results
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(stored);
        Ok(id)
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredResult>, AppError> {
        Ok(self.all().into_iter().find(|r| r.id == id))
    }

    async fn latest_for_url(&self, url: &str) -> Result<Option<StoredResult>, AppError> {
        Ok(self
            .all()
            .into_iter()
            .rev()
            .find(|r| r.url == url || r.canonical_link.as_deref() == Some(url)))
    }
}
