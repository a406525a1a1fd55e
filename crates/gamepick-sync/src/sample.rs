//! Periodic sampling of a live metric for every enriched record.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use gamepick_adapters::{MetricSource, SourceError};
use gamepick_core::{EntryId, FailureReason, JobState, MetricSample, StateKey};
use gamepick_storage::{CatalogStore, RateGate, RetryDecision, RetryLedger};
use tracing::{debug, error, info, warn};

use crate::registry::SummaryHandle;
use crate::{chunk_count, SampleConfig, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleReport {
    pub chunks: usize,
    pub sampled: u64,
    pub failed: u64,
    pub pruned: u64,
}

pub struct Sampler {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn MetricSource>,
    gate: Arc<RateGate>,
    config: SampleConfig,
    summary: SummaryHandle,
}

impl Sampler {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        source: Arc<dyn MetricSource>,
        gate: Arc<RateGate>,
        config: SampleConfig,
        summary: SummaryHandle,
    ) -> Self {
        Self {
            store,
            source,
            gate,
            config,
            summary,
        }
    }

    /// Samples every record once, stamping the whole pass with its start
    /// time, then applies the retention sweep. The success timestamp is
    /// written whether or not individual items failed.
    pub async fn run(&self) -> Result<SampleReport, SyncError> {
        let started_at = Utc::now();
        let total = self.store.count_records().await?;
        let chunks = chunk_count(total, self.config.chunk_size);
        self.summary.update(|s| {
            s.total = total;
            s.round = 1;
            s.pending_chunks = chunks;
        });
        info!(total, chunks, "metric sampling started");

        let ledger = RetryLedger::new(self.config.retry);
        let mut report = SampleReport {
            chunks,
            ..SampleReport::default()
        };

        for chunk in 0..chunks {
            let skip = (chunk * self.config.chunk_size) as u64;
            let ids = match self
                .store
                .record_ids(skip, self.config.chunk_size as u64)
                .await
            {
                Ok(ids) => ids,
                Err(err) => {
                    error!(error = %err, chunk, "could not load record chunk, skipping");
                    self.summary
                        .update(|s| s.pending_chunks = s.pending_chunks.saturating_sub(1));
                    continue;
                }
            };
            self.summary.update(|s| s.current_chunk = Some(chunk));

            let results = join_all(ids.iter().map(|id| self.sample_one(*id, &ledger))).await;
            let mut samples = Vec::with_capacity(results.len());
            for (id, result) in ids.iter().zip(results) {
                match result {
                    Ok(value) => samples.push(MetricSample {
                        entry_id: *id,
                        timestamp: started_at,
                        value,
                    }),
                    Err(reason) => {
                        report.failed += 1;
                        self.summary.record_failure(reason);
                    }
                }
            }

            if !samples.is_empty() {
                match self.store.insert_samples(&samples).await {
                    Ok(inserted) => {
                        report.sampled += inserted;
                        self.summary.update(|s| s.success += inserted);
                    }
                    Err(err) => {
                        error!(error = %err, chunk, count = samples.len(), "failed to store samples");
                        report.failed += samples.len() as u64;
                        for _ in &samples {
                            self.summary.record_failure(FailureReason::UpsertError);
                        }
                    }
                }
            }
            self.summary.update(|s| {
                s.pending_chunks = s.pending_chunks.saturating_sub(1);
                s.finished_chunks += 1;
                s.current_chunk = None;
            });
            debug!(chunk, size = ids.len(), "sample chunk finished");

            if chunk + 1 < chunks {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        report.pruned = self.prune(Utc::now()).await;

        let state = JobState::succeeded(StateKey::MetricSample, Utc::now());
        if let Err(err) = self.store.save_job_state(&state).await {
            error!(error = %err, "failed to persist sampling success");
        }

        let summary = self.summary.snapshot();
        info!(
            sampled = report.sampled,
            failed = report.failed,
            pruned = report.pruned,
            elapsed = %summary.elapsed,
            failures = ?summary.failures,
            "metric sampling finished"
        );
        Ok(report)
    }

    async fn prune(&self, now: DateTime<Utc>) -> u64 {
        let retention = chrono::Duration::from_std(self.config.retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        match self.store.prune_samples(now - retention).await {
            Ok(pruned) => pruned,
            Err(err) => {
                error!(error = %err, "retention sweep failed");
                0
            }
        }
    }

    /// A missing entry counts as zero. Throttling arms the shared gate and
    /// retries the same item until the ceiling.
    async fn sample_one(&self, id: EntryId, ledger: &RetryLedger) -> Result<u64, FailureReason> {
        loop {
            self.gate.wait().await;
            match self.source.current_value(id).await {
                Ok(value) => return Ok(value),
                Err(SourceError::Status(404)) => return Ok(0),
                Err(err) if err.is_rate_limited() => match ledger.record_failure(id) {
                    RetryDecision::Retry { attempt } => {
                        warn!(id, attempt, "metric request throttled, retrying after cooldown");
                        self.gate.trip(self.config.retry.cooldown).await;
                    }
                    RetryDecision::Exhausted { attempts } => {
                        warn!(id, attempts, "metric request still throttled, giving up");
                        return Err(FailureReason::RetryExhausted);
                    }
                },
                Err(SourceError::Status(code)) => {
                    debug!(id, code, "metric request failed");
                    return Err(FailureReason::Status(code));
                }
                Err(SourceError::Request { message, .. }) => {
                    debug!(id, error = %message, "metric request failed");
                    return Err(FailureReason::RequestError);
                }
                Err(err) => {
                    debug!(id, error = %err, "metric response unreadable");
                    return Err(FailureReason::DecodeError);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gamepick_core::{EnrichedRecord, JobKind};
    use gamepick_storage::{MemoryStore, RetryPolicy};
    use std::collections::{BTreeSet, HashMap};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeMetrics {
        values: HashMap<EntryId, u64>,
        throttled: HashMap<EntryId, u32>,
        calls: Mutex<HashMap<EntryId, u32>>,
    }

    impl FakeMetrics {
        fn calls(&self, id: EntryId) -> u32 {
            self.calls.lock().expect("lock").get(&id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl MetricSource for FakeMetrics {
        async fn current_value(&self, id: EntryId) -> Result<u64, SourceError> {
            let call = {
                let mut calls = self.calls.lock().expect("lock");
                let count = calls.entry(id).or_insert(0);
                *count += 1;
                *count
            };
            if self.throttled.get(&id).is_some_and(|limit| call <= *limit) {
                return Err(SourceError::RateLimited(429));
            }
            match self.values.get(&id) {
                Some(value) => Ok(*value),
                None if id >= 900 => Err(SourceError::Status(500)),
                None => Err(SourceError::Status(404)),
            }
        }
    }

    fn record(id: EntryId) -> EnrichedRecord {
        EnrichedRecord {
            id,
            title: format!("Game {id}"),
            description: String::new(),
            release_date: None,
            thumbnail_url: String::new(),
            positive_count: 0,
            negative_count: 0,
            positive_ratio: 0.0,
            owner_estimate: 0,
            tags: BTreeSet::new(),
        }
    }

    async fn seeded_store(ids: &[EntryId]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in ids {
            store.upsert_record(&record(*id)).await.expect("seed record");
        }
        store
    }

    fn sampler(store: &Arc<MemoryStore>, source: FakeMetrics) -> (Sampler, Arc<RateGate>) {
        sampler_with(store, Arc::new(source))
    }

    fn sampler_with(
        store: &Arc<MemoryStore>,
        source: Arc<FakeMetrics>,
    ) -> (Sampler, Arc<RateGate>) {
        let gate = Arc::new(RateGate::new());
        let sampler = Sampler::new(
            store.clone(),
            source,
            gate.clone(),
            SampleConfig {
                chunk_size: 2,
                chunk_delay: Duration::from_secs(1),
                retry: RetryPolicy::new(2, Duration::from_secs(10)),
                retention: Duration::from_secs(24 * 60 * 60),
            },
            SummaryHandle::new(JobKind::PlayerCount, Utc::now()),
        );
        (sampler, gate)
    }

    #[tokio::test(start_paused = true)]
    async fn missing_entries_sample_as_zero_with_one_timestamp() {
        let store = seeded_store(&[1, 2, 3]).await;
        let source = FakeMetrics {
            values: HashMap::from([(1, 120), (3, 7)]),
            ..FakeMetrics::default()
        };
        let (sampler, _gate) = sampler(&store, source);

        let report = sampler.run().await.expect("run");
        assert_eq!(report.chunks, 2);
        assert_eq!(report.sampled, 3);
        assert_eq!(report.failed, 0);
        let summary = sampler.summary.snapshot();
        assert_eq!(summary.finished_chunks, 2);
        assert_eq!(summary.pending_chunks, 0);

        let samples = store.samples().await;
        let values: HashMap<EntryId, u64> =
            samples.iter().map(|s| (s.entry_id, s.value)).collect();
        assert_eq!(values, HashMap::from([(1, 120), (2, 0), (3, 7)]));
        assert!(samples.iter().all(|s| s.timestamp == samples[0].timestamp));
        assert!(store
            .load_job_state(StateKey::MetricSample)
            .await
            .expect("load")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn failures_are_counted_by_status_and_state_still_written() {
        let store = seeded_store(&[1, 901]).await;
        let source = FakeMetrics {
            values: HashMap::from([(1, 5)]),
            ..FakeMetrics::default()
        };
        let (sampler, _gate) = sampler(&store, source);

        let report = sampler.run().await.expect("run");
        let summary = sampler.summary.snapshot();
        assert_eq!(report.sampled, 1);
        assert_eq!(report.failed, 1);
        assert_eq!(summary.failure_count(FailureReason::Status(500)), 1);
        assert!(store
            .load_job_state(StateKey::MetricSample)
            .await
            .expect("load")
            .is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_requests_retry_until_ceiling() {
        let store = seeded_store(&[1, 2]).await;
        let source = Arc::new(FakeMetrics {
            values: HashMap::from([(1, 10), (2, 20)]),
            throttled: HashMap::from([(1, 1), (2, 5)]),
            ..FakeMetrics::default()
        });
        let (sampler, gate) = sampler_with(&store, source.clone());

        let report = sampler.run().await.expect("run");
        let summary = sampler.summary.snapshot();
        assert_eq!(source.calls(1), 2);
        assert_eq!(source.calls(2), 3);
        assert_eq!(report.sampled, 1);
        assert_eq!(summary.failure_count(FailureReason::RetryExhausted), 1);
        assert!(gate.times_armed() >= 1);
        let values: Vec<u64> = store.samples().await.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![10]);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_sweep_runs_after_pass() {
        let store = seeded_store(&[1]).await;
        store
            .insert_samples(&[MetricSample {
                entry_id: 1,
                timestamp: Utc::now() - chrono::Duration::hours(30),
                value: 99,
            }])
            .await
            .expect("old sample");
        let source = FakeMetrics {
            values: HashMap::from([(1, 4)]),
            ..FakeMetrics::default()
        };
        let (sampler, _gate) = sampler(&store, source);

        let report = sampler.run().await.expect("run");
        assert_eq!(report.pruned, 1);
        let values: Vec<u64> = store.samples().await.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![4]);
    }
}
