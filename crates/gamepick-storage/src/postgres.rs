//! Postgres-backed [`CatalogStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gamepick_core::{EnrichedRecord, EntryId, JobState, MetricSample, PendingEntry, StateKey};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::store::{CatalogStore, StoreError};

const SAMPLE_INSERT_BATCH: usize = 1_000;

#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

fn to_i64(column: &'static str, value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange { column, value })
}

fn to_u64(column: &str, value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::InvalidRow(format!("negative {column}: {value}")))
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn load_job_state(&self, key: StateKey) -> Result<Option<JobState>, StoreError> {
        let row = sqlx::query(
            "SELECT last_success_at FROM job_state WHERE state_key = $1",
        )
        .bind(key.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(JobState {
                key,
                last_success_at: row.try_get::<Option<DateTime<Utc>>, _>("last_success_at")?,
            })
        })
        .transpose()
    }

    async fn save_job_state(&self, state: &JobState) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO job_state (state_key, last_success_at) \
             VALUES ($1, $2) \
             ON CONFLICT (state_key) DO UPDATE SET \
                last_success_at = EXCLUDED.last_success_at",
        )
        .bind(state.key.as_str())
        .bind(state.last_success_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn upsert_pending(&self, ids: &[EntryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "INSERT INTO pending_entry (id) SELECT UNNEST($1::BIGINT[]) \
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn pending_after(
        &self,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let limit = to_i64("limit", limit as u64)?;
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM pending_entry \
             WHERE $1::BIGINT IS NULL OR id > $1 \
             ORDER BY id ASC LIMIT $2",
        )
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids.into_iter().map(|id| PendingEntry { id }).collect())
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM pending_entry")
            .fetch_one(&self.pool)
            .await?;
        to_u64("count", count)
    }

    async fn delete_pending(&self, id: EntryId) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_entry WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn upsert_record(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let tags: Vec<String> = record.tags.iter().cloned().collect();
        sqlx::query(
            "INSERT INTO game (id, title, description, release_date, thumbnail_url, \
                positive_count, negative_count, positive_ratio, owner_estimate, tags, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, now()) \
             ON CONFLICT (id) DO UPDATE SET \
                title = EXCLUDED.title, \
                description = EXCLUDED.description, \
                release_date = EXCLUDED.release_date, \
                thumbnail_url = EXCLUDED.thumbnail_url, \
                positive_count = EXCLUDED.positive_count, \
                negative_count = EXCLUDED.negative_count, \
                positive_ratio = EXCLUDED.positive_ratio, \
                owner_estimate = EXCLUDED.owner_estimate, \
                tags = EXCLUDED.tags, \
                updated_at = now()",
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(&record.description)
        .bind(record.release_date)
        .bind(&record.thumbnail_url)
        .bind(to_i64("positive_count", record.positive_count)?)
        .bind(to_i64("negative_count", record.negative_count)?)
        .bind(record.positive_ratio)
        .bind(to_i64("owner_estimate", record.owner_estimate)?)
        .bind(tags)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM game")
            .fetch_one(&self.pool)
            .await?;
        to_u64("count", count)
    }

    async fn record_ids(&self, skip: u64, take: u64) -> Result<Vec<EntryId>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT id FROM game ORDER BY id ASC OFFSET $1 LIMIT $2",
        )
        .bind(to_i64("offset", skip)?)
        .bind(to_i64("limit", take)?)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn insert_samples(&self, samples: &[MetricSample]) -> Result<u64, StoreError> {
        let mut inserted = 0;
        for batch in samples.chunks(SAMPLE_INSERT_BATCH) {
            let values = batch
                .iter()
                .map(|s| Ok((s.entry_id, s.timestamp, to_i64("value", s.value)?)))
                .collect::<Result<Vec<_>, StoreError>>()?;

            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO metric_sample (entry_id, sampled_at, value) ");
            qb.push_values(values, |mut row, (entry_id, sampled_at, value)| {
                row.push_bind(entry_id)
                    .push_bind(sampled_at)
                    .push_bind(value);
            });
            inserted += qb.build().execute(&self.pool).await?.rows_affected();
        }
        Ok(inserted)
    }

    async fn prune_samples(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM metric_sample WHERE sampled_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
