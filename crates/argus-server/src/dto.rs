use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use argus_core::models::StoredResult;
use argus_core::task::{Task, TaskCounts};

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize, utoipa::ToSchema)]
pub struct EnqueueTaskRequest {
    /// Product page URL. Canonicalized before deduplication.
    pub url: String,
    /// Higher runs first (default: 5)
    pub priority: Option<i32>,
    /// Attempt budget override
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct EnqueueTaskResponse {
    /// `None` when the URL was skipped as a duplicate.
    pub task_id: Option<Uuid>,
    /// `pending` or `duplicate_skipped`
    pub status: String,
    /// Canonical URL the decision was made on
    pub url: String,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskResponse {
    pub id: Uuid,
    pub url: String,
    pub domain: String,
    pub status: String,
    pub priority: i32,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub failed_strategy: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub result_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Extracted product, present once the task is completed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultResponse>,
}

impl From<Task> for TaskResponse {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            url: task.url,
            domain: task.domain,
            status: task.status.to_string(),
            priority: task.priority,
            attempts: task.attempts,
            max_attempts: task.max_attempts,
            last_error: task.last_error,
            error_kind: task.error_kind.map(|k| k.as_str().to_string()),
            failed_strategy: task.failed_strategy.map(|s| s.as_str().to_string()),
            not_before: task.not_before,
            worker_id: task.worker_id,
            result_id: task.result_id,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            completed_at: task.completed_at,
            result: None,
        }
    }
}

impl TaskResponse {
    pub fn with_result(mut self, result: Option<StoredResult>) -> Self {
        self.result = result.map(ResultResponse::from);
        self
    }
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct ListTasksQuery {
    /// pending, leased, running, completed, failed
    pub status: Option<String>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct TaskListResponse {
    /// The requested page.
    pub tasks: Vec<TaskResponse>,
    /// All tasks matching the filter, ignoring `limit` and `offset`.
    pub total: u64,
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub struct LookupQuery {
    /// Any form of the URL; it is canonicalized before lookup.
    pub url: String,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct ResultResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    pub url: String,
    pub canonical_link: Option<String>,
    pub strategy_used: String,
    pub confidence: f64,
    pub fallback_count: u32,
    /// Extracted product fields
    pub fields: serde_json::Value,
    pub discount_percent: Option<f64>,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
}

impl From<StoredResult> for ResultResponse {
    fn from(r: StoredResult) -> Self {
        let discount_percent = r.result.fields.discount_percent();
        Self {
            id: r.id,
            task_id: r.task_id,
            url: r.url,
            canonical_link: r.canonical_link,
            strategy_used: r.result.strategy_used.as_str().to_string(),
            confidence: r.result.confidence,
            fallback_count: r.result.fallback_count,
            fields: serde_json::to_value(&r.result.fields).unwrap_or_default(),
            discount_percent,
            content_hash: r.content_hash,
            created_at: r.created_at,
        }
    }
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct StatsResponse {
    pub pending: u64,
    pub leased: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
    pub total: u64,
}

impl From<TaskCounts> for StatsResponse {
    fn from(c: TaskCounts) -> Self {
        Self {
            pending: c.pending,
            leased: c.leased,
            running: c.running,
            completed: c.completed,
            failed: c.failed,
            total: c.total(),
        }
    }
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub database: &'static str,
}

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
