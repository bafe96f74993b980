use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::get;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use argus_core::error::AppError;
use argus_core::task::{EnqueueOutcome, EnqueueRequest, TaskStatus};
use argus_core::task_store::TaskStore;

use crate::auth::require_api_key;
use crate::dto::{
    EnqueueTaskRequest, EnqueueTaskResponse, ErrorResponse, HealthResponse, ListTasksQuery,
    LookupQuery, ResultResponse, StatsResponse, TaskListResponse, TaskResponse,
};
use crate::error::{ApiError, error_response};
use crate::openapi::ApiDoc;
use crate::state::AppState;

/// Build the full router with all routes and middleware.
pub fn router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/v1/tasks", get(list_tasks).post(enqueue_task))
        .route("/v1/tasks/lookup", get(lookup_task))
        .route("/v1/tasks/{id}", get(get_task))
        .route("/v1/results/latest", get(latest_result))
        .route("/v1/stats", get(stats))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            require_api_key,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    public.merge(api).with_state(state)
}

/// Per-client rate limit keyed on `X-Forwarded-For`/`X-Real-IP`, falling back
/// to the peer address. Each client may send `burst` requests at once and
/// regains one every `replenish_every`.
///
/// The peer fallback needs the router served with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn with_rate_limit(
    router: Router,
    replenish_every: Duration,
    burst: u32,
) -> Result<Router, AppError> {
    let config = GovernorConfigBuilder::default()
        .period(replenish_every)
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
        .ok_or_else(|| {
            AppError::ConfigError(format!(
                "invalid rate limit: one per {replenish_every:?} with burst {burst}"
            ))
        })?;

    Ok(router.layer(GovernorLayer::new(Arc::new(config))))
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

#[utoipa::path(
    post,
    path = "/v1/tasks",
    request_body = EnqueueTaskRequest,
    responses(
        (status = 202, description = "Task created", body = EnqueueTaskResponse),
        (status = 200, description = "Duplicate skipped", body = EnqueueTaskResponse),
        (status = 400, description = "Invalid URL", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn enqueue_task(
    State(state): State<Arc<AppState>>,
    axum::Json(body): axum::Json<EnqueueTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut request = EnqueueRequest::new(body.url);
    if let Some(priority) = body.priority {
        request = request.with_priority(priority);
    }
    if let Some(max) = body.max_attempts {
        request = request.with_max_attempts(max);
    }

    let response = match state.tasks.enqueue(request).await? {
        EnqueueOutcome::Created(task) => {
            tracing::info!(task_id = %task.id, url = %task.url, "Task enqueued");
            let body = EnqueueTaskResponse {
                task_id: Some(task.id),
                status: task.status.to_string(),
                url: task.url,
            };
            (StatusCode::ACCEPTED, axum::Json(body))
        }
        EnqueueOutcome::DuplicateSkipped { canonical_url } => {
            tracing::debug!(url = %canonical_url, "Duplicate enqueue skipped");
            let body = EnqueueTaskResponse {
                task_id: None,
                status: "duplicate_skipped".to_string(),
                url: canonical_url,
            };
            (StatusCode::OK, axum::Json(body))
        }
    };

    Ok(response)
}

#[utoipa::path(
    get,
    path = "/v1/tasks",
    params(ListTasksQuery),
    responses(
        (status = 200, description = "List of tasks", body = TaskListResponse),
        (status = 400, description = "Unknown status", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn list_tasks(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListTasksQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status_filter = match query.status.as_deref().map(str::parse::<TaskStatus>) {
        None => None,
        Some(Ok(status)) => Some(status),
        Some(Err(e)) => {
            return Ok(error_response(StatusCode::BAD_REQUEST, "invalid_status", e));
        }
    };

    let limit = query.limit.unwrap_or(20).min(100);
    let offset = query.offset.unwrap_or(0);
    let tasks = state.tasks.list(status_filter, limit, offset).await?;
    let counts = state.tasks.counts().await?;
    let total = status_filter.map_or_else(|| counts.total(), |status| counts.get(status));

    let response = TaskListResponse {
        tasks: tasks.into_iter().map(TaskResponse::from).collect(),
        total,
    };

    Ok(axum::Json(response).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/tasks/{id}",
    params(
        ("id" = Uuid, Path, description = "Task ID")
    ),
    responses(
        (status = 200, description = "Task details, with the result once completed", body = TaskResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let Some(task) = state.tasks.get(id).await? else {
        return Ok(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("Task not found: {id}"),
        ));
    };

    let result = match task.result_id {
        Some(result_id) => state.db.result_repo().get(result_id).await?,
        None => None,
    };

    Ok(axum::Json(TaskResponse::from(task).with_result(result)).into_response())
}

#[utoipa::path(
    get,
    path = "/v1/tasks/lookup",
    params(LookupQuery),
    responses(
        (status = 200, description = "Most recent task for the canonical URL", body = TaskResponse),
        (status = 400, description = "Invalid URL", body = ErrorResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "tasks"
)]
pub async fn lookup_task(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    match state.tasks.get_by_url(&query.url).await? {
        Some(task) => Ok(axum::Json(TaskResponse::from(task)).into_response()),
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No task for {}", query.url),
        )),
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/results/latest",
    params(LookupQuery),
    responses(
        (status = 200, description = "Latest extraction for the URL", body = ResultResponse),
        (status = 404, description = "Not found", body = ErrorResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "results"
)]
pub async fn latest_result(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LookupQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let canonical = argus_core::canonicalize_url(&query.url)?;
    match state.db.result_repo().latest_for_url(&canonical).await? {
        Some(result) => Ok(axum::Json(ResultResponse::from(result)).into_response()),
        None => Ok(error_response(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("No result for {canonical}"),
        )),
    }
}

// ---------------------------------------------------------------------------
// System
// ---------------------------------------------------------------------------

#[utoipa::path(
    get,
    path = "/v1/stats",
    responses(
        (status = 200, description = "Task counts per status", body = StatsResponse),
        (status = 401, description = "Unauthorized"),
    ),
    security(("bearer" = [])),
    tag = "system"
)]
pub async fn stats(State(state): State<Arc<AppState>>) -> Result<impl IntoResponse, ApiError> {
    let counts = state.tasks.counts().await?;
    Ok(axum::Json(StatsResponse::from(counts)))
}

#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse),
        (status = 503, description = "Service is unhealthy", body = HealthResponse),
    ),
    tag = "system"
)]
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let healthy = state.db.health_check().await.is_ok();

    let response = HealthResponse {
        status: if healthy { "healthy" } else { "unhealthy" },
        database: if healthy { "ok" } else { "error" },
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status, axum::Json(response))
}
