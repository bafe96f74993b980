use argus_core::error::AppError;
use argus_core::models::{ExtractionResult, NewResult, ProductFields, StoredResult};
use argus_core::traits::ResultStore;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

/// Repository for extraction results in PostgreSQL.
#[derive(Clone)]
pub struct ResultRepository {
    pool: Pool<Postgres>,
}

impl ResultRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Save a new result. Returns the generated UUID.
    pub async fn save(&self, result: &NewResult) -> Result<Uuid, AppError> {
        let fields = serde_json::to_value(&result.result.fields)?;
        let row: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO results
                (task_id, url, canonical_link, strategy, confidence, fields, fallback_count, content_hash)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING id
            "#,
        )
        .bind(result.task_id)
        .bind(&result.url)
        .bind(&result.canonical_link)
        .bind(result.result.strategy_used.as_str())
        .bind(result.result.confidence)
        .bind(&fields)
        .bind(result.result.fallback_count as i32)
        .bind(&result.content_hash)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(row.0)
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<StoredResult>, AppError> {
        let row = sqlx::query_as::<_, ResultRow>(r#"SELECT * FROM results WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    /// Most recent result whose task URL or canonical link is `url`.
    pub async fn latest_for_url(&self, url: &str) -> Result<Option<StoredResult>, AppError> {
        let row = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT * FROM results
            WHERE url = $1 OR canonical_link = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(url)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(TryInto::try_into).transpose()
    }

    /// Result history for a URL, newest first.
    pub async fn history(&self, url: &str, limit: usize) -> Result<Vec<StoredResult>, AppError> {
        let rows = sqlx::query_as::<_, ResultRow>(
            r#"
            SELECT * FROM results
            WHERE url = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(url)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct ResultRow {
    id: Uuid,
    task_id: Uuid,
    url: String,
    canonical_link: Option<String>,
    strategy: String,
    confidence: f64,
    fields: serde_json::Value,
    fallback_count: i32,
    content_hash: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ResultRow> for StoredResult {
    type Error = AppError;

    fn try_from(row: ResultRow) -> Result<Self, Self::Error> {
        let strategy_used = row
            .strategy
            .parse()
            .map_err(AppError::DatabaseError)?;
        let fields: ProductFields = serde_json::from_value(row.fields)?;

        Ok(StoredResult {
            id: row.id,
            task_id: row.task_id,
            url: row.url,
            canonical_link: row.canonical_link,
            result: ExtractionResult {
                strategy_used,
                confidence: row.confidence,
                fields,
                fallback_count: row.fallback_count.max(0) as u32,
            },
            content_hash: row.content_hash,
            created_at: row.created_at,
        })
    }
}

// -- Trait implementation --

impl ResultStore for ResultRepository {
    async fn save(&self, result: &NewResult) -> Result<Uuid, AppError> {
        ResultRepository::save(self, result).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<StoredResult>, AppError> {
        ResultRepository::get(self, id).await
    }

    async fn latest_for_url(&self, url: &str) -> Result<Option<StoredResult>, AppError> {
        ResultRepository::latest_for_url(self, url).await
    }
}
