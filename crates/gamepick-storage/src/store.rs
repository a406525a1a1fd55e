//! Durable store contract and an in-memory implementation.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gamepick_core::{EnrichedRecord, EntryId, JobState, MetricSample, PendingEntry, StateKey};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("value {value} does not fit column {column}")]
    OutOfRange { column: &'static str, value: u64 },
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// System of record for cursors, pending work, records and samples.
///
/// Every write is idempotent under repetition except `insert_samples`,
/// which appends.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn load_job_state(&self, key: StateKey) -> Result<Option<JobState>, StoreError>;

    async fn save_job_state(&self, state: &JobState) -> Result<(), StoreError>;

    /// Returns how many ids were not already pending.
    async fn upsert_pending(&self, ids: &[EntryId]) -> Result<u64, StoreError>;

    /// Pending entries with ids strictly greater than `after`, ascending.
    async fn pending_after(
        &self,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, StoreError>;

    async fn count_pending(&self) -> Result<u64, StoreError>;

    async fn delete_pending(&self, id: EntryId) -> Result<(), StoreError>;

    async fn upsert_record(&self, record: &EnrichedRecord) -> Result<(), StoreError>;

    async fn count_records(&self) -> Result<u64, StoreError>;

    /// Record ids ordered ascending, `take` of them after skipping `skip`.
    async fn record_ids(&self, skip: u64, take: u64) -> Result<Vec<EntryId>, StoreError>;

    async fn insert_samples(&self, samples: &[MetricSample]) -> Result<u64, StoreError>;

    /// Deletes samples stamped strictly before `cutoff`.
    async fn prune_samples(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    job_states: HashMap<StateKey, JobState>,
    pending: BTreeSet<EntryId>,
    records: BTreeMap<EntryId, EnrichedRecord>,
    samples: Vec<MetricSample>,
    failing_upserts: BTreeSet<EntryId>,
    fail_state_load: bool,
}

/// Process-local store, used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `upsert_record` for `id` fail.
    pub async fn fail_upserts_for(&self, id: EntryId) {
        self.state.lock().await.failing_upserts.insert(id);
    }

    /// Makes `load_job_state` fail.
    pub async fn fail_state_loads(&self) {
        self.state.lock().await.fail_state_load = true;
    }

    pub async fn record(&self, id: EntryId) -> Option<EnrichedRecord> {
        self.state.lock().await.records.get(&id).cloned()
    }

    pub async fn pending(&self) -> Vec<EntryId> {
        self.state.lock().await.pending.iter().copied().collect()
    }

    pub async fn samples(&self) -> Vec<MetricSample> {
        self.state.lock().await.samples.clone()
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn load_job_state(&self, key: StateKey) -> Result<Option<JobState>, StoreError> {
        let state = self.state.lock().await;
        if state.fail_state_load {
            return Err(StoreError::Unavailable("job_state".into()));
        }
        Ok(state.job_states.get(&key).copied())
    }

    async fn save_job_state(&self, job_state: &JobState) -> Result<(), StoreError> {
        self.state
            .lock()
            .await
            .job_states
            .insert(job_state.key, *job_state);
        Ok(())
    }

    async fn upsert_pending(&self, ids: &[EntryId]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        Ok(ids.iter().filter(|id| state.pending.insert(**id)).count() as u64)
    }

    async fn pending_after(
        &self,
        after: Option<EntryId>,
        limit: usize,
    ) -> Result<Vec<PendingEntry>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .pending
            .iter()
            .filter(|id| after.map_or(true, |after| **id > after))
            .take(limit)
            .map(|id| PendingEntry { id: *id })
            .collect())
    }

    async fn count_pending(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.pending.len() as u64)
    }

    async fn delete_pending(&self, id: EntryId) -> Result<(), StoreError> {
        self.state.lock().await.pending.remove(&id);
        Ok(())
    }

    async fn upsert_record(&self, record: &EnrichedRecord) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if state.failing_upserts.contains(&record.id) {
            return Err(StoreError::Unavailable(format!("upsert of {}", record.id)));
        }
        state.records.insert(record.id, record.clone());
        Ok(())
    }

    async fn count_records(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.records.len() as u64)
    }

    async fn record_ids(&self, skip: u64, take: u64) -> Result<Vec<EntryId>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .records
            .keys()
            .copied()
            .skip(skip as usize)
            .take(take as usize)
            .collect())
    }

    async fn insert_samples(&self, samples: &[MetricSample]) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        state.samples.extend_from_slice(samples);
        Ok(samples.len() as u64)
    }

    async fn prune_samples(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.samples.len();
        state.samples.retain(|sample| sample.timestamp >= cutoff);
        Ok((before - state.samples.len()) as u64)
    }
}
