use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use argus_core::dedup::{self, DedupEntry};
use argus_core::error::AppError;
use argus_core::task::{
    EnqueueOutcome, EnqueueRequest, FailOutcome, Task, TaskCounts, TaskFailure, TaskStatus,
};
use argus_core::task_store::{StoreConfig, TaskStore};

/// PostgreSQL-backed task store using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// URL uniqueness among active tasks is enforced by a partial unique index;
/// the dedup cache lives in `dedup_entries` and is updated in the same
/// transaction as task creation.
#[derive(Clone)]
pub struct TaskRepository {
    pool: Pool<Postgres>,
    config: StoreConfig,
}

impl TaskRepository {
    pub fn new(pool: PgPool, config: StoreConfig) -> Self {
        Self { pool, config }
    }

    /// Dedup entry for a URL, if it has been enqueued before.
    pub async fn dedup_entry(&self, url: &str) -> Result<Option<DedupEntry>, AppError> {
        let canonical = dedup::canonicalize_url(url)?;
        let row = sqlx::query_as::<_, DedupRow>(
            r#"
            SELECT url_hash, canonical_url, first_seen, last_seen, visit_count
            FROM dedup_entries
            WHERE url_hash = $1
            "#,
        )
        .bind(dedup::url_hash(&canonical))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    /// Builds the error for a check-and-set update that matched no row.
    async fn transition_error(&self, task_id: Uuid, to: TaskStatus) -> AppError {
        let current: Result<Option<(String,)>, _> =
            sqlx::query_as(r#"SELECT status FROM tasks WHERE id = $1"#)
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await;

        match current {
            Ok(Some((from,))) => AppError::InvalidTransition {
                task_id,
                from,
                to: to.to_string(),
            },
            Ok(None) => AppError::NotFound(format!("task {task_id}")),
            Err(e) => AppError::DatabaseError(e.to_string()),
        }
    }
}

fn secs(d: Duration) -> f64 {
    d.as_secs_f64()
}

// -- Internal row types for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    url: String,
    domain: String,
    status: String,
    priority: i32,
    attempts: i32,
    max_attempts: i32,
    last_error: Option<String>,
    error_kind: Option<String>,
    failed_strategy: Option<String>,
    not_before: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    result_id: Option<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl From<TaskRow> for Task {
    fn from(row: TaskRow) -> Self {
        Task {
            id: row.id,
            url: row.url,
            domain: row.domain,
            status: row.status.parse().unwrap_or(TaskStatus::Pending),
            priority: row.priority,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            last_error: row.last_error,
            error_kind: row.error_kind.and_then(|k| k.parse().ok()),
            failed_strategy: row.failed_strategy.and_then(|s| s.parse().ok()),
            not_before: row.not_before,
            worker_id: row.worker_id,
            result_id: row.result_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DedupRow {
    url_hash: String,
    canonical_url: String,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    visit_count: i64,
}

impl From<DedupRow> for DedupEntry {
    fn from(row: DedupRow) -> Self {
        DedupEntry {
            url_hash: row.url_hash,
            canonical_url: row.canonical_url,
            first_seen: row.first_seen,
            last_seen: row.last_seen,
            visit_count: row.visit_count.max(0) as u64,
        }
    }
}

impl TaskStore for TaskRepository {
    async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueOutcome, AppError> {
        let canonical = dedup::canonicalize_url(&request.url)?;
        let domain = dedup::domain_of(&canonical)?;
        let hash = dedup::url_hash(&canonical);
        let max_attempts = request
            .max_attempts
            .unwrap_or(self.config.default_max_attempts)
            .max(1);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        // A concurrent insert of the same hash waits here until the first commits.
        let first_sighting = sqlx::query(
            r#"
            INSERT INTO dedup_entries (url_hash, canonical_url)
            VALUES ($1, $2)
            ON CONFLICT (url_hash) DO NOTHING
            "#,
        )
        .bind(&hash)
        .bind(&canonical)
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?
        .rows_affected()
            == 1;

        let seen_recently = if first_sighting {
            false
        } else {
            let (fresh,): (bool,) = sqlx::query_as(
                r#"
                WITH prev AS (
                    SELECT last_seen FROM dedup_entries WHERE url_hash = $1 FOR UPDATE
                )
                UPDATE dedup_entries d
                SET last_seen = NOW(), visit_count = d.visit_count + 1
                FROM prev
                WHERE d.url_hash = $1
                RETURNING prev.last_seen > NOW() - make_interval(secs => $2)
                "#,
            )
            .bind(&hash)
            .bind(secs(self.config.freshness_window))
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;
            fresh
        };

        let created = if seen_recently {
            None
        } else {
            sqlx::query_as::<_, TaskRow>(
                r#"
                INSERT INTO tasks (url, url_hash, domain, priority, max_attempts)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (url_hash) WHERE status IN ('pending', 'leased', 'running')
                DO NOTHING
                RETURNING *
                "#,
            )
            .bind(&canonical)
            .bind(&hash)
            .bind(&domain)
            .bind(request.priority)
            .bind(max_attempts as i32)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?
        };

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(match created {
            Some(row) => EnqueueOutcome::Created(row.into()),
            None => {
                tracing::debug!(url = %canonical, seen_recently, "Duplicate enqueue skipped");
                EnqueueOutcome::DuplicateSkipped {
                    canonical_url: canonical,
                }
            }
        })
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        excluded_domains: &[String],
    ) -> Result<Option<Task>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            UPDATE tasks
            SET status = 'leased', worker_id = $1, updated_at = NOW()
            WHERE id = (
                SELECT id FROM tasks
                WHERE status = 'pending'
                  AND (not_before IS NULL OR not_before <= NOW())
                  AND NOT (domain = ANY($2))
                ORDER BY priority DESC, created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(excluded_domains)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn mark_running(&self, task_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'running', started_at = NOW(), updated_at = NOW()
            WHERE id = $1 AND status = 'leased'
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(task_id, TaskStatus::Running).await);
        }
        Ok(())
    }

    async fn mark_completed(&self, task_id: Uuid, result_id: Uuid) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'completed', completed_at = NOW(), updated_at = NOW(),
                result_id = $2, worker_id = NULL
            WHERE id = $1 AND status = 'running'
            "#,
        )
        .bind(task_id)
        .bind(result_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(task_id, TaskStatus::Completed).await);
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        task_id: Uuid,
        failure: &TaskFailure,
    ) -> Result<FailOutcome, AppError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let current: Option<(String, i32, i32)> = sqlx::query_as(
            r#"SELECT status, attempts, max_attempts FROM tasks WHERE id = $1 FOR UPDATE"#,
        )
        .bind(task_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let Some((status, attempts, max_attempts)) = current else {
            return Err(AppError::NotFound(format!("task {task_id}")));
        };
        let in_flight = status
            .parse::<TaskStatus>()
            .is_ok_and(|s| s.is_in_flight());
        if !in_flight {
            return Err(AppError::InvalidTransition {
                task_id,
                from: status,
                to: TaskStatus::Failed.to_string(),
            });
        }

        let attempts = attempts.max(0) as u32 + 1;
        let limit = failure.kind.attempt_limit(max_attempts.max(1) as u32);
        let outcome = if attempts < limit {
            FailOutcome::RetryScheduled {
                not_before: self.config.retry.next_eligible(attempts, Utc::now()),
            }
        } else {
            FailOutcome::Exhausted
        };
        let not_before = match outcome {
            FailOutcome::RetryScheduled { not_before } => Some(not_before),
            FailOutcome::Exhausted => None,
        };

        sqlx::query(
            r#"
            UPDATE tasks
            SET
                status = CASE WHEN $3::timestamptz IS NOT NULL THEN 'pending' ELSE 'failed' END,
                attempts = $2,
                not_before = $3,
                last_error = $4,
                error_kind = $5,
                failed_strategy = $6,
                worker_id = NULL,
                updated_at = NOW(),
                completed_at = CASE WHEN $3::timestamptz IS NOT NULL THEN NULL ELSE NOW() END
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(attempts as i32)
        .bind(not_before)
        .bind(&failure.message)
        .bind(failure.kind.as_str())
        .bind(failure.strategy.map(|s| s.as_str()))
        .execute(&mut *tx)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(outcome)
    }

    async fn release(
        &self,
        task_id: Uuid,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<(), AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, started_at = NULL,
                not_before = $2, updated_at = NOW()
            WHERE id = $1 AND status IN ('leased', 'running')
            "#,
        )
        .bind(task_id)
        .bind(not_before)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(self.transition_error(task_id, TaskStatus::Pending).await);
        }
        Ok(())
    }

    async fn release_worker_tasks(&self, worker_id: &str) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE worker_id = $1 AND status IN ('leased', 'running')
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn recover_stale(&self, older_than: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending', worker_id = NULL, started_at = NULL, updated_at = NOW()
            WHERE status IN ('leased', 'running')
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(secs(older_than))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let recovered = result.rows_affected();
        if recovered > 0 {
            tracing::warn!(recovered, "Recovered stale tasks");
        }
        Ok(recovered)
    }

    async fn get(&self, task_id: Uuid) -> Result<Option<Task>, AppError> {
        let row = sqlx::query_as::<_, TaskRow>(r#"SELECT * FROM tasks WHERE id = $1"#)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn get_by_url(&self, url: &str) -> Result<Option<Task>, AppError> {
        let canonical = dedup::canonicalize_url(url)?;
        let row = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE url_hash = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(dedup::url_hash(&canonical))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.map(Into::into))
    }

    async fn list(
        &self,
        status: Option<TaskStatus>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Task>, AppError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT * FROM tasks
            WHERE ($1::varchar IS NULL OR status = $1)
            ORDER BY created_at DESC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn counts(&self) -> Result<TaskCounts, AppError> {
        let rows: Vec<(String, i64)> =
            sqlx::query_as(r#"SELECT status, COUNT(*) FROM tasks GROUP BY status"#)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        let mut counts = TaskCounts::default();
        for (status, n) in rows {
            if let Ok(status) = status.parse() {
                counts.add(status, n.max(0) as u64);
            }
        }
        Ok(counts)
    }

    async fn purge_terminal(&self, older_than: Duration) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM tasks
            WHERE status IN ('completed', 'failed')
              AND updated_at < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(secs(older_than))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        self.evict_expired_dedup().await?;
        Ok(result.rows_affected())
    }

    async fn evict_expired_dedup(&self) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"DELETE FROM dedup_entries WHERE last_seen < NOW() - make_interval(secs => $1)"#,
        )
        .bind(secs(self.config.freshness_window))
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;
        Ok(result.rows_affected())
    }
}
