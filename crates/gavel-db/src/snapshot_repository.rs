use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Pool, Postgres};

use gavel_core::error::AppError;
use gavel_core::models::{Fields, ListingKey, ListingRef, ListingSnapshot};
use gavel_core::traits::{PutOutcome, SnapshotStore};

/// PostgreSQL-backed snapshot store. One row per listing.
#[derive(Clone)]
pub struct SnapshotRepository {
    pool: Pool<Postgres>,
}

impl SnapshotRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct SnapshotRow {
    source: String,
    external_id: String,
    url: String,
    fetched_at: DateTime<Utc>,
    content_hash: String,
    fields: Json<Fields>,
    raw_size: i64,
}

impl TryFrom<SnapshotRow> for ListingSnapshot {
    type Error = AppError;

    fn try_from(row: SnapshotRow) -> Result<Self, AppError> {
        let source = row.source.parse().map_err(AppError::DatabaseError)?;
        Ok(ListingSnapshot {
            listing: ListingRef::new(source, row.external_id, row.url),
            fetched_at: row.fetched_at,
            content_hash: row.content_hash,
            fields: row.fields.0,
            raw_size: usize::try_from(row.raw_size).unwrap_or_default(),
        })
    }
}

impl SnapshotStore for SnapshotRepository {
    async fn put_if_changed(&self, snapshot: &ListingSnapshot) -> Result<PutOutcome, AppError> {
        // The WHERE on the conflict branch makes this a single-statement
        // compare-and-set: an identical hash leaves the row untouched and
        // returns nothing.
        let written = sqlx::query_scalar::<_, String>(
            r#"
            INSERT INTO listing_snapshots
                (source, external_id, url, fetched_at, content_hash, fields, raw_size)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (source, external_id) DO UPDATE SET
                url = EXCLUDED.url,
                fetched_at = EXCLUDED.fetched_at,
                content_hash = EXCLUDED.content_hash,
                fields = EXCLUDED.fields,
                raw_size = EXCLUDED.raw_size
            WHERE listing_snapshots.content_hash <> EXCLUDED.content_hash
            RETURNING content_hash
            "#,
        )
        .bind(snapshot.listing.source.as_str())
        .bind(&snapshot.listing.external_id)
        .bind(&snapshot.listing.url)
        .bind(snapshot.fetched_at)
        .bind(&snapshot.content_hash)
        .bind(Json(&snapshot.fields))
        .bind(i64::try_from(snapshot.raw_size).unwrap_or(i64::MAX))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(PutOutcome {
            stored: written.is_some(),
        })
    }

    async fn get(&self, listing: &ListingKey) -> Result<Option<ListingSnapshot>, AppError> {
        let row = sqlx::query_as::<_, SnapshotRow>(
            r#"
            SELECT source, external_id, url, fetched_at, content_hash, fields, raw_size
            FROM listing_snapshots
            WHERE source = $1 AND external_id = $2
            "#,
        )
        .bind(listing.source.as_str())
        .bind(&listing.external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        row.map(ListingSnapshot::try_from).transpose()
    }

    async fn count(&self) -> Result<u64, AppError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM listing_snapshots")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(e.to_string()))?;

        Ok(count as u64)
    }
}
