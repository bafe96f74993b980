//! Fixed-size pool of fetch-and-extract workers.
//!
//! Each worker claims a task, takes a per-domain admission slot and an
//! identity lease, fetches the page under a deadline, runs the extraction
//! cascade and records the outcome. A reaper loop force-releases expired
//! identity leases, hands orphaned tasks back to the queue and trims idle
//! throttle state and expired dedup entries.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cascade::Cascade;
use crate::config::SharedConfig;
use crate::dedup::canonical_link;
use crate::detect::ensure_not_blocked;
use crate::error::{AppError, FailureKind};
use crate::models::{NewResult, StrategyKind, compute_hash};
use crate::pool::{IdentityLease, IdentityPool, LeaseOutcome};
use crate::task::{FailOutcome, Task, TaskFailure};
use crate::task_store::TaskStore;
use crate::throttle::DomainThrottle;
use crate::traits::{Cleaner, LlmOracle, OcrEngine, PageFetcher, ResultStore};

/// Worker pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of concurrent workers, fixed when the pool starts.
    pub max_workers: usize,
    /// Sleep between polls when no task is eligible.
    #[serde(with = "crate::config::millis")]
    pub poll_interval: Duration,
    #[serde(with = "crate::config::millis")]
    pub fetch_timeout: Duration,
    /// In-flight tasks untouched for this long are handed back by the reaper.
    #[serde(with = "crate::config::millis")]
    pub stale_task_timeout: Duration,
    #[serde(with = "crate::config::millis")]
    pub reaper_interval: Duration,
    /// How long a task waits after no identity could be leased for it.
    #[serde(with = "crate::config::millis")]
    pub defer_delay: Duration,
    pub worker_id_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            poll_interval: Duration::from_millis(500),
            fetch_timeout: Duration::from_secs(30),
            stale_task_timeout: Duration::from_secs(600),
            reaper_interval: Duration::from_secs(15),
            defer_delay: Duration::from_secs(5),
            worker_id_prefix: "argus".to_string(),
        }
    }
}

/// Events emitted by the workers for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
    },
    Polling {
        worker_id: &'a str,
    },
    TaskClaimed {
        task: &'a Task,
    },
    /// Handed back without consuming an attempt.
    TaskDeferred {
        task_id: Uuid,
        reason: &'a str,
    },
    TaskStarted {
        task_id: Uuid,
        url: &'a str,
        identity: &'a str,
    },
    TaskCompleted {
        task_id: Uuid,
        result_id: Uuid,
        strategy: StrategyKind,
        confidence: f64,
    },
    TaskFailed {
        task_id: Uuid,
        url: &'a str,
        kind: FailureKind,
        error: &'a str,
        will_retry: bool,
    },
    LeasesReaped {
        identities: &'a [String],
    },
    StaleTasksRecovered {
        count: u64,
    },
    ShuttingDown {
        worker_id: &'a str,
        tasks_released: u64,
    },
    Stopped {
        worker_id: &'a str,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                tracing::info!(%worker_id, "Worker started");
            }
            WorkerEvent::Polling { worker_id } => {
                tracing::trace!(%worker_id, "Polling for tasks");
            }
            WorkerEvent::TaskClaimed { task } => {
                tracing::debug!(
                    task_id = %task.id,
                    url = %task.url,
                    attempts = task.attempts,
                    "Task claimed"
                );
            }
            WorkerEvent::TaskDeferred { task_id, reason } => {
                tracing::debug!(%task_id, %reason, "Task deferred");
            }
            WorkerEvent::TaskStarted {
                task_id,
                url,
                identity,
            } => {
                tracing::info!(%task_id, %url, %identity, "Processing task");
            }
            WorkerEvent::TaskCompleted {
                task_id,
                result_id,
                strategy,
                confidence,
            } => {
                tracing::info!(%task_id, %result_id, %strategy, confidence, "Task completed");
            }
            WorkerEvent::TaskFailed {
                task_id,
                url,
                kind,
                error,
                will_retry,
            } => {
                tracing::warn!(%task_id, %url, %kind, %error, %will_retry, "Task failed");
            }
            WorkerEvent::LeasesReaped { identities } => {
                tracing::warn!(count = identities.len(), ?identities, "Expired leases reclaimed");
            }
            WorkerEvent::StaleTasksRecovered { count } => {
                tracing::warn!(%count, "Stale tasks returned to the queue");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                tasks_released,
            } => {
                tracing::info!(%worker_id, %tasks_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                tracing::info!(%worker_id, "Worker stopped");
            }
        }
    }
}

struct Components<S, F, C, O, R, RS> {
    store: S,
    fetcher: F,
    cascade: Cascade<C, O, R>,
    results: RS,
    identities: IdentityPool,
    throttle: DomainThrottle,
    config: SharedConfig,
}

/// The worker pool. Cloning shares the same components.
pub struct WorkerPool<S, F, C, O, R, RS> {
    inner: Arc<Components<S, F, C, O, R, RS>>,
}

impl<S, F, C, O, R, RS> Clone for WorkerPool<S, F, C, O, R, RS> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, F, C, O, R, RS> WorkerPool<S, F, C, O, R, RS>
where
    S: TaskStore + 'static,
    F: PageFetcher + 'static,
    C: Cleaner + 'static,
    O: LlmOracle + 'static,
    R: OcrEngine + 'static,
    RS: ResultStore + 'static,
{
    pub fn new(
        store: S,
        fetcher: F,
        cascade: Cascade<C, O, R>,
        results: RS,
        identities: IdentityPool,
        throttle: DomainThrottle,
        config: SharedConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Components {
                store,
                fetcher,
                cascade,
                results,
                identities,
                throttle,
                config,
            }),
        }
    }

    pub fn identities(&self) -> &IdentityPool {
        &self.inner.identities
    }

    pub fn cascade(&self) -> &Cascade<C, O, R> {
        &self.inner.cascade
    }

    pub fn config(&self) -> &SharedConfig {
        &self.inner.config
    }

    /// Runs `max_workers` workers plus the reaper until `cancel_token` fires,
    /// then waits for every worker to hand back its tasks.
    pub async fn run<WR>(
        &self,
        cancel_token: CancellationToken,
        reporter: Arc<WR>,
    ) -> Result<(), AppError>
    where
        WR: WorkerReporter + 'static,
    {
        let worker = self.inner.config.snapshot().worker.clone();
        let run_id = Uuid::new_v4().simple().to_string();
        let mut set = JoinSet::new();

        for n in 0..worker.max_workers {
            let worker_id = format!("{}-{}-{n}", worker.worker_id_prefix, &run_id[..8]);
            let pool = self.clone();
            let cancel = cancel_token.clone();
            let reporter = Arc::clone(&reporter);
            set.spawn(async move { pool.worker_loop(&worker_id, cancel, reporter.as_ref()).await });
        }
        {
            let pool = self.clone();
            let cancel = cancel_token.clone();
            let reporter = Arc::clone(&reporter);
            set.spawn(async move { pool.reaper_loop(cancel, reporter.as_ref()).await });
        }

        while let Some(joined) = set.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Worker task aborted");
            }
        }
        Ok(())
    }

    async fn worker_loop<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) {
        reporter.report(WorkerEvent::Started { worker_id });

        loop {
            if cancel_token.is_cancelled() {
                break;
            }
            reporter.report(WorkerEvent::Polling { worker_id });
            let poll_interval = self.inner.config.snapshot().worker.poll_interval;

            match self.process_next(worker_id, reporter).await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(%worker_id, error = %e, "Failed to process task");
                    tokio::select! {
                        () = tokio::time::sleep(poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }

        // Graceful shutdown: release all claimed tasks
        let released = self
            .inner
            .store
            .release_worker_tasks(worker_id)
            .await
            .unwrap_or_else(|e| {
                tracing::error!(%worker_id, error = %e, "Failed to release worker tasks");
                0
            });
        reporter.report(WorkerEvent::ShuttingDown {
            worker_id,
            tasks_released: released,
        });
        reporter.report(WorkerEvent::Stopped { worker_id });
    }

    async fn reaper_loop<WR: WorkerReporter>(&self, cancel_token: CancellationToken, reporter: &WR) {
        loop {
            let interval = self.inner.config.snapshot().worker.reaper_interval;
            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = cancel_token.cancelled() => break,
            }
            self.reap(reporter).await;
        }
    }

    /// One reaper pass: expired identity leases, stale in-flight tasks, then
    /// idle domains and expired dedup entries.
    pub async fn reap<WR: WorkerReporter>(&self, reporter: &WR) {
        let reaped = self.inner.identities.reap_expired();
        if !reaped.is_empty() {
            reporter.report(WorkerEvent::LeasesReaped {
                identities: &reaped,
            });
        }

        let stale_after = self.inner.config.snapshot().worker.stale_task_timeout;
        match self.inner.store.recover_stale(stale_after).await {
            Ok(0) => {}
            Ok(count) => reporter.report(WorkerEvent::StaleTasksRecovered { count }),
            Err(e) => tracing::error!(error = %e, "Failed to recover stale tasks"),
        }

        let idle_domains = self.inner.throttle.evict_idle();
        let dedup_entries = self
            .inner
            .store
            .evict_expired_dedup()
            .await
            .unwrap_or_else(|e| {
                tracing::error!(error = %e, "Failed to evict expired dedup entries");
                0
            });
        if idle_domains > 0 || dedup_entries > 0 {
            tracing::debug!(idle_domains, dedup_entries, "Trimmed idle throttle and dedup state");
        }
    }

    /// Claims and processes at most one task. Returns whether a task was claimed.
    pub async fn process_next<WR: WorkerReporter>(
        &self,
        worker_id: &str,
        reporter: &WR,
    ) -> Result<bool, AppError> {
        let inner = &self.inner;
        let config = inner.config.snapshot();

        let excluded = inner.throttle.saturated_domains();
        let Some(task) = inner.store.claim_next(worker_id, &excluded).await? else {
            return Ok(false);
        };
        reporter.report(WorkerEvent::TaskClaimed { task: &task });

        // Another worker filled the domain between the claim and now.
        let Some(permit) = inner.throttle.try_admit(&task.domain) else {
            self.defer(&task, None, "domain saturated", reporter).await;
            return Ok(true);
        };

        let lease = match inner.identities.acquire(&task.domain).await {
            Ok(lease) => lease,
            Err(e) => {
                let delay = TimeDelta::from_std(config.worker.defer_delay)
                    .unwrap_or_else(|_| TimeDelta::seconds(5));
                self.defer(&task, Some(Utc::now() + delay), &e.to_string(), reporter)
                    .await;
                return Ok(true);
            }
        };

        if let Err(e) = inner.store.mark_running(task.id).await {
            self.return_lease(lease, LeaseOutcome::Unused);
            return Err(e);
        }
        reporter.report(WorkerEvent::TaskStarted {
            task_id: task.id,
            url: &task.url,
            identity: lease.identity_id(),
        });

        inner.throttle.pace(&task.domain).await;
        let fetch_timeout = config.worker.fetch_timeout;
        let fetched = match tokio::time::timeout(
            fetch_timeout,
            inner.fetcher.fetch(&task.url, &lease),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(fetch_timeout)),
        }
        .and_then(|page| ensure_not_blocked(&page).map(|()| page));
        drop(permit);

        let page = match fetched {
            Ok(page) => page,
            Err(e) => {
                self.return_lease(lease, lease_outcome_for(&e));
                self.record_failure(&task, &e, None, reporter).await;
                return Ok(true);
            }
        };
        self.return_lease(
            lease,
            LeaseOutcome::Success {
                session_state: page.session_state.clone(),
            },
        );

        let extraction = match inner.cascade.run(&page, &config.cascade).await {
            Ok(extraction) => extraction,
            Err(e) => {
                let last_tried = config.cascade.order.last().copied();
                self.record_failure(&task, &e, last_tried, reporter).await;
                return Ok(true);
            }
        };

        let new_result = NewResult {
            task_id: task.id,
            url: task.url.clone(),
            canonical_link: canonical_link(&page.html).filter(|link| *link != task.url),
            content_hash: compute_hash(&page.html),
            result: extraction,
        };
        let result_id = match inner.results.save(&new_result).await {
            Ok(id) => id,
            Err(e) => {
                self.record_failure(&task, &e, None, reporter).await;
                return Ok(true);
            }
        };

        if let Err(e) = inner.store.mark_completed(task.id, result_id).await {
            tracing::error!(
                task_id = %task.id,
                %result_id,
                error = %e,
                "Failed to mark task completed"
            );
            self.record_failure(&task, &e, None, reporter).await;
            return Ok(true);
        }
        reporter.report(WorkerEvent::TaskCompleted {
            task_id: task.id,
            result_id,
            strategy: new_result.result.strategy_used,
            confidence: new_result.result.confidence,
        });
        Ok(true)
    }

    /// Hands a claimed task back without consuming an attempt. A task the
    /// store refuses to release stays in flight until stale recovery.
    async fn defer<WR: WorkerReporter>(
        &self,
        task: &Task,
        not_before: Option<DateTime<Utc>>,
        reason: &str,
        reporter: &WR,
    ) {
        match self.inner.store.release(task.id, not_before).await {
            Ok(()) => reporter.report(WorkerEvent::TaskDeferred {
                task_id: task.id,
                reason,
            }),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to hand back deferred task");
            }
        }
    }

    fn return_lease(&self, lease: IdentityLease, outcome: LeaseOutcome) {
        match self.inner.identities.release(lease, outcome) {
            Ok(()) => {}
            Err(AppError::PoolIdentityStale { identity_id, .. }) => {
                tracing::debug!(identity = %identity_id, "Lease was already reclaimed");
            }
            Err(e) => tracing::error!(error = %e, "Failed to release identity lease"),
        }
    }

    async fn record_failure<WR: WorkerReporter>(
        &self,
        task: &Task,
        error: &AppError,
        strategy: Option<StrategyKind>,
        reporter: &WR,
    ) {
        let failure = TaskFailure::from(error).with_strategy(strategy);
        match self.inner.store.mark_failed(task.id, &failure).await {
            Ok(outcome) => reporter.report(WorkerEvent::TaskFailed {
                task_id: task.id,
                url: &task.url,
                kind: failure.kind,
                error: &failure.message,
                will_retry: matches!(outcome, FailOutcome::RetryScheduled { .. }),
            }),
            Err(e) => {
                tracing::error!(task_id = %task.id, error = %e, "Failed to mark task failed");
            }
        }
    }
}

/// Health feedback for the identity that served a failed fetch.
fn lease_outcome_for(error: &AppError) -> LeaseOutcome {
    match error.failure_kind() {
        FailureKind::Blocked => LeaseOutcome::Blocked,
        FailureKind::Transient => LeaseOutcome::Failure,
        _ => LeaseOutcome::Unused,
    }
}
