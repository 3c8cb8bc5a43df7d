use chrono::{DateTime, Utc};
use sqlx::{PgPool, Pool, Postgres};
use uuid::Uuid;

use gavel_core::error::AppError;
use gavel_core::models::{ListingKey, ListingRef, OpportunityRecord};
use gavel_core::traits::OpportunityStore;

/// PostgreSQL-backed opportunity store.
///
/// One row per listing holds the latest analysis, emitted or suppressed.
#[derive(Clone)]
pub struct OpportunityRepository {
    pool: Pool<Postgres>,
}

impl OpportunityRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert or replace the listing's record unless the stored one comes
    /// from a later snapshot. Returns whether a row was written.
    async fn upsert(&self, record: &OpportunityRecord, suppressed: bool) -> Result<bool, AppError> {
        let written = sqlx::query_scalar::<_, Uuid>(
            r#"
            INSERT INTO opportunities
                (source, external_id, id, url, snapshot_hash, snapshot_fetched_at, predicted_value,
                 listing_cost, fees, shipping_cost, total_cost, margin, computed_at, suppressed)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
            ON CONFLICT (source, external_id) DO UPDATE SET
                id = EXCLUDED.id,
                url = EXCLUDED.url,
                snapshot_hash = EXCLUDED.snapshot_hash,
                snapshot_fetched_at = EXCLUDED.snapshot_fetched_at,
                predicted_value = EXCLUDED.predicted_value,
                listing_cost = EXCLUDED.listing_cost,
                fees = EXCLUDED.fees,
                shipping_cost = EXCLUDED.shipping_cost,
                total_cost = EXCLUDED.total_cost,
                margin = EXCLUDED.margin,
                computed_at = EXCLUDED.computed_at,
                suppressed = EXCLUDED.suppressed
            WHERE opportunities.snapshot_fetched_at <= EXCLUDED.snapshot_fetched_at
            RETURNING id
            "#,
        )
        .bind(record.listing.source.as_str())
        .bind(&record.listing.external_id)
        .bind(record.id)
        .bind(&record.listing.url)
        .bind(&record.snapshot_hash)
        .bind(record.snapshot_fetched_at)
        .bind(record.predicted_value)
        .bind(record.listing_cost)
        .bind(record.fees)
        .bind(record.shipping_cost)
        .bind(record.total_cost)
        .bind(record.margin)
        .bind(record.computed_at)
        .bind(suppressed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(written.is_some())
    }
}

#[derive(sqlx::FromRow)]
struct OpportunityRow {
    source: String,
    external_id: String,
    id: Uuid,
    url: String,
    snapshot_hash: String,
    snapshot_fetched_at: DateTime<Utc>,
    predicted_value: f64,
    listing_cost: f64,
    fees: f64,
    shipping_cost: f64,
    total_cost: f64,
    margin: f64,
    computed_at: DateTime<Utc>,
}

impl TryFrom<OpportunityRow> for OpportunityRecord {
    type Error = AppError;

    fn try_from(row: OpportunityRow) -> Result<Self, AppError> {
        let source = row.source.parse().map_err(AppError::DatabaseError)?;
        Ok(OpportunityRecord {
            id: row.id,
            listing: ListingRef::new(source, row.external_id, row.url),
            snapshot_hash: row.snapshot_hash,
            snapshot_fetched_at: row.snapshot_fetched_at,
            predicted_value: row.predicted_value,
            listing_cost: row.listing_cost,
            fees: row.fees,
            shipping_cost: row.shipping_cost,
            total_cost: row.total_cost,
            margin: row.margin,
            computed_at: row.computed_at,
        })
    }
}

const RECORD_COLUMNS: &str = "source, external_id, id, url, snapshot_hash, snapshot_fetched_at, \
     predicted_value, listing_cost, fees, shipping_cost, total_cost, margin, computed_at";

impl OpportunityStore for OpportunityRepository {
    async fn publish(&self, record: &OpportunityRecord) -> Result<bool, AppError> {
        self.upsert(record, false).await
    }

    async fn suppress(&self, record: &OpportunityRecord) -> Result<bool, AppError> {
        self.upsert(record, true).await
    }

    async fn last_analyzed_hash(&self, listing: &ListingKey) -> Result<Option<String>, AppError> {
        sqlx::query_scalar::<_, String>(
            "SELECT snapshot_hash FROM opportunities WHERE source = $1 AND external_id = $2",
        )
        .bind(listing.source.as_str())
        .bind(&listing.external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))
    }

    async fn since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<OpportunityRecord>, AppError> {
        let rows = sqlx::query_as::<_, OpportunityRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM opportunities \
             WHERE NOT suppressed AND computed_at > $1 \
             ORDER BY computed_at ASC LIMIT $2"
        ))
        .bind(since)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(OpportunityRecord::try_from).collect()
    }

    async fn suppressed(&self, limit: usize) -> Result<Vec<OpportunityRecord>, AppError> {
        let rows = sqlx::query_as::<_, OpportunityRow>(&format!(
            "SELECT {RECORD_COLUMNS} FROM opportunities \
             WHERE suppressed \
             ORDER BY computed_at DESC LIMIT $1"
        ))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        rows.into_iter().map(OpportunityRecord::try_from).collect()
    }
}
