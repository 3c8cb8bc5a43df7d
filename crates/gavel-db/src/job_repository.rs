use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use gavel_core::error::{AppError, ErrorKind, FetchError};
use gavel_core::job::{FetchJob, JobState, NewFetchJob};
use gavel_core::job_queue::{JobQueue, RetrySchedule};
use gavel_core::models::{ListingKey, ListingRef};

/// PostgreSQL-backed job queue using `SELECT FOR UPDATE SKIP LOCKED`.
///
/// Every transition statement is guarded on the current state, and the
/// partial unique index on dispatched rows keeps at most one fetch per
/// listing in flight across all processes.
#[derive(Clone)]
pub struct FetchJobRepository {
    pool: Pool<Postgres>,
}

impl FetchJobRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a guarded update touched no row.
    async fn transition_error(&self, job_id: Uuid, to: JobState) -> AppError {
        match self.get_job(job_id).await {
            Ok(Some(job)) => AppError::InvalidTransition {
                job_id,
                from: job.state.to_string(),
                to: to.to_string(),
            },
            Ok(None) => AppError::JobNotFound(job_id),
            Err(e) => e,
        }
    }
}

// -- Internal row type for sqlx deserialization --

#[derive(sqlx::FromRow)]
struct FetchJobRow {
    id: Uuid,
    source: String,
    external_id: String,
    url: String,
    state: String,
    attempt: i32,
    priority: i32,
    not_before: DateTime<Utc>,
    last_error: Option<String>,
    last_error_message: Option<String>,
    worker_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<FetchJobRow> for FetchJob {
    type Error = AppError;

    fn try_from(row: FetchJobRow) -> Result<Self, AppError> {
        let source = row.source.parse().map_err(AppError::DatabaseError)?;
        let state = row.state.parse().map_err(AppError::DatabaseError)?;
        let last_error = row
            .last_error
            .map(|kind| kind.parse::<ErrorKind>())
            .transpose()
            .map_err(AppError::DatabaseError)?;

        Ok(FetchJob {
            id: row.id,
            listing: ListingRef::new(source, row.external_id, row.url),
            state,
            attempt: u32::try_from(row.attempt).unwrap_or_default(),
            priority: row.priority,
            not_before: row.not_before,
            last_error,
            last_error_message: row.last_error_message,
            worker_id: row.worker_id,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn rows_to_jobs(rows: Vec<FetchJobRow>) -> Result<Vec<FetchJob>, AppError> {
    rows.into_iter().map(FetchJob::try_from).collect()
}

impl JobQueue for FetchJobRepository {
    async fn enqueue(&self, job: NewFetchJob) -> Result<FetchJob, AppError> {
        let job = FetchJob::from_new(job, Utc::now());
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            INSERT INTO fetch_jobs
                (id, source, external_id, url, state, attempt, priority, not_before, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, 0, $6, $7, $8, $8)
            RETURNING *
            "#,
        )
        .bind(job.id)
        .bind(job.listing.source.as_str())
        .bind(&job.listing.external_id)
        .bind(&job.listing.url)
        .bind(job.state.as_str())
        .bind(job.priority)
        .bind(job.not_before)
        .bind(job.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.try_into()
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<FetchJob>, AppError> {
        let result = sqlx::query_as::<_, FetchJobRow>(
            r#"
            UPDATE fetch_jobs
            SET state = 'dispatched', worker_id = $1, updated_at = $2
            WHERE id = (
                SELECT j.id FROM fetch_jobs j
                WHERE j.state IN ('pending', 'retry_scheduled')
                  AND j.not_before <= $2
                  AND NOT EXISTS (
                      SELECT 1 FROM fetch_jobs d
                      WHERE d.state = 'dispatched'
                        AND d.source = j.source
                        AND d.external_id = j.external_id
                  )
                ORDER BY j.priority DESC, j.not_before ASC, j.created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            AND state IN ('pending', 'retry_scheduled')
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        match result {
            Ok(row) => row.map(FetchJob::try_from).transpose(),
            // Another worker dispatched a job for the same listing between
            // our check and our update; the unique index refused ours.
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                tracing::debug!(%worker_id, "Claim lost a race for an in-flight listing");
                Ok(None)
            }
            Err(e) => Err(AppError::DatabaseError(e.to_string())),
        }
    }

    async fn mark_succeeded(&self, job_id: Uuid) -> Result<FetchJob, AppError> {
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            UPDATE fetch_jobs
            SET state = 'succeeded', worker_id = NULL, updated_at = NOW()
            WHERE id = $1 AND state = 'dispatched'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.transition_error(job_id, JobState::Succeeded).await),
        }
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        error: &FetchError,
        retry: Option<RetrySchedule>,
    ) -> Result<FetchJob, AppError> {
        let next = if retry.is_some() {
            JobState::RetryScheduled
        } else {
            JobState::DeadLettered
        };
        let row = sqlx::query_as::<_, FetchJobRow>(
            r#"
            UPDATE fetch_jobs
            SET
                state = $2,
                attempt = attempt + 1,
                last_error = $3,
                last_error_message = $4,
                not_before = COALESCE($5, not_before),
                priority = priority + $6,
                worker_id = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'dispatched'
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(next.as_str())
        .bind(error.kind.as_str())
        .bind(&error.message)
        .bind(retry.map(|r| r.not_before))
        .bind(retry.map_or(0, |r| r.priority_delta))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        match row {
            Some(row) => row.try_into(),
            None => Err(self.transition_error(job_id, next).await),
        }
    }

    async fn release_worker_jobs(&self, worker_id: &str, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE fetch_jobs
            SET state = 'retry_scheduled', not_before = $2, worker_id = NULL, updated_at = $2
            WHERE worker_id = $1 AND state = 'dispatched'
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<FetchJob>, AppError> {
        let row = sqlx::query_as::<_, FetchJobRow>(r#"SELECT * FROM fetch_jobs WHERE id = $1"#)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(FetchJob::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<FetchJob>, AppError> {
        let rows = if let Some(state) = state {
            sqlx::query_as::<_, FetchJobRow>(
                r#"
                SELECT * FROM fetch_jobs
                WHERE state = $1
                ORDER BY updated_at DESC
                LIMIT $2
                "#,
            )
            .bind(state.as_str())
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, FetchJobRow>(
                r#"
                SELECT * FROM fetch_jobs
                ORDER BY updated_at DESC
                LIMIT $1
                "#,
            )
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        }
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows_to_jobs(rows)
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM fetch_jobs WHERE state = $1")
            .bind(state.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count as u64)
    }

    async fn has_active(&self, listing: &ListingKey) -> Result<bool, AppError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM fetch_jobs
                WHERE source = $1 AND external_id = $2
                  AND state IN ('pending', 'dispatched', 'retry_scheduled')
            )
            "#,
        )
        .bind(listing.source.as_str())
        .bind(&listing.external_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))
    }
}
