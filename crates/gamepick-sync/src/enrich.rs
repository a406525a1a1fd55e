//! Detail enrichment of pending catalog entries.
//!
//! Pending ids are walked in keyset-ordered chunks. Every item in a chunk is
//! enriched concurrently from three upstreams and merged into one record.
//! Items that hit a retryable failure stay pending and are revisited in the
//! next round, up to the retry ceiling.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use gamepick_adapters::{DetailSource, ReleaseInfo, ReviewStats, SourceError, StorePage};
use gamepick_core::{
    parse_owner_count, positive_ratio, EnrichedRecord, EntryId, FailureReason, JobState, StateKey,
};
use gamepick_storage::{CatalogStore, RateGate, RetryDecision, RetryLedger};
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::registry::SummaryHandle;
use crate::{chunk_count, EnrichConfig, SyncError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EnrichReport {
    pub rounds: u32,
    pub saved: u64,
    pub failed: u64,
    pub remaining: u64,
    /// The pending table was drained and the success timestamp written.
    pub completed: bool,
}

#[derive(Debug, Clone, Copy)]
enum Upstream {
    StorePage,
    ReleaseInfo,
    ReviewStats,
}

impl Upstream {
    fn failure_reason(self, err: &SourceError) -> FailureReason {
        match (self, err) {
            (_, SourceError::RegionLock) => FailureReason::RegionLock,
            (_, SourceError::MissingField(_)) => FailureReason::ParseError,
            (Upstream::StorePage, SourceError::Decode(_)) => FailureReason::ParseError,
            (Upstream::ReleaseInfo, SourceError::Decode(_)) => FailureReason::SourceBJson,
            (Upstream::ReviewStats, SourceError::Decode(_)) => FailureReason::SourceCJson,
            (_, SourceError::Status(code)) | (_, SourceError::RateLimited(code)) => {
                FailureReason::Status(*code)
            }
            (_, SourceError::Request { .. }) => FailureReason::RequestError,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Saved,
    Failed(FailureReason),
    Retryable { rate_limited: bool },
}

fn classify(upstream: Upstream, err: &SourceError) -> ItemOutcome {
    if err.is_retryable() {
        ItemOutcome::Retryable {
            rate_limited: err.is_rate_limited(),
        }
    } else {
        ItemOutcome::Failed(upstream.failure_reason(err))
    }
}

/// Result of one item as seen by the chunk loop.
#[derive(Debug, Clone, Copy, Default)]
struct Settled {
    rate_limited: bool,
    deferred: bool,
}

pub(crate) fn build_record(
    id: EntryId,
    page: StorePage,
    release: ReleaseInfo,
    stats: ReviewStats,
) -> Result<EnrichedRecord, FailureReason> {
    let owner_estimate = parse_owner_count(&stats.owners).ok_or(FailureReason::RecordBuild)?;
    Ok(EnrichedRecord {
        id,
        title: page.title,
        description: page.description,
        release_date: release.release_date,
        thumbnail_url: page.header_image,
        positive_count: stats.positive,
        negative_count: stats.negative,
        positive_ratio: positive_ratio(stats.positive, stats.negative),
        owner_estimate,
        tags: page.genres.into_iter().collect(),
    })
}

pub struct DetailEnricher {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn DetailSource>,
    gate: Arc<RateGate>,
    ledger: RetryLedger,
    config: EnrichConfig,
    summary: SummaryHandle,
}

impl DetailEnricher {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        source: Arc<dyn DetailSource>,
        gate: Arc<RateGate>,
        config: EnrichConfig,
        summary: SummaryHandle,
    ) -> Self {
        Self {
            store,
            source,
            gate,
            ledger: RetryLedger::new(config.retry),
            config,
            summary,
        }
    }

    pub fn ledger(&self) -> &RetryLedger {
        &self.ledger
    }

    pub async fn run(&self) -> Result<EnrichReport, SyncError> {
        let max_rounds = self.config.retry.ceiling + 1;
        let mut report = EnrichReport::default();

        for round in 1..=max_rounds {
            let remaining = self.store.count_pending().await?;
            if round == 1 {
                self.summary.update(|s| s.total = remaining);
            }
            if remaining == 0 {
                break;
            }
            report.rounds = round;
            self.summary.update(|s| {
                s.round = round;
                s.pending_chunks = chunk_count(remaining, self.config.chunk_size);
                s.finished_chunks = 0;
                s.current_chunk = None;
            });
            info!(round, remaining, "enrichment round started");

            let deferred = self.run_round().await;
            if deferred == 0 {
                break;
            }
            if round < max_rounds {
                info!(
                    round,
                    deferred,
                    delay_secs = self.config.retry.cooldown.as_secs(),
                    "retryable entries deferred to next round"
                );
                tokio::time::sleep(self.config.retry.cooldown).await;
            }
        }

        report.remaining = self.store.count_pending().await?;
        let summary = self.summary.snapshot();
        report.saved = summary.success;
        report.failed = summary.total_failures();

        if report.remaining == 0 {
            let state = JobState::succeeded(StateKey::DetailEnrich, Utc::now());
            match self.store.save_job_state(&state).await {
                Ok(()) => report.completed = true,
                Err(err) => error!(error = %err, "failed to persist enrichment success"),
            }
        } else {
            warn!(remaining = report.remaining, "entries still pending after final round");
        }

        info!(
            rounds = report.rounds,
            saved = report.saved,
            failed = report.failed,
            remaining = report.remaining,
            elapsed = %summary.elapsed,
            failures = ?summary.failures,
            "detail enrichment finished"
        );
        Ok(report)
    }

    /// One keyset pass over the pending table. Returns how many items were
    /// deferred to a later round.
    async fn run_round(&self) -> usize {
        let mut after = None;
        let mut chunk_index = 0usize;
        let mut deferred = 0;

        loop {
            let entries = match self.store.pending_after(after, self.config.chunk_size).await {
                Ok(entries) => entries,
                Err(err) => {
                    error!(error = %err, chunk = chunk_index, "could not load pending chunk, ending round");
                    break;
                }
            };
            let Some(last) = entries.last() else {
                break;
            };
            after = Some(last.id);
            self.summary.update(|s| s.current_chunk = Some(chunk_index));

            let settled = join_all(entries.iter().map(|entry| self.process(entry.id))).await;
            let rate_limited = settled.iter().filter(|s| s.rate_limited).count();
            deferred += settled.iter().filter(|s| s.deferred).count();
            self.summary.update(|s| {
                s.pending_chunks = s.pending_chunks.saturating_sub(1);
                s.finished_chunks += 1;
                s.current_chunk = None;
            });
            info!(chunk = chunk_index, size = entries.len(), rate_limited, "chunk finished");

            if rate_limited > 0 {
                self.gate.trip(self.config.rate_limit_cooldown).await;
                self.gate.wait().await;
            } else {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
            chunk_index += 1;
        }
        deferred
    }

    async fn process(&self, id: EntryId) -> Settled {
        let span = info_span!("entry", id);
        async {
            match self.enrich_one(id).await {
                ItemOutcome::Saved => {
                    self.remove_pending(id).await;
                    self.summary.record_success();
                    debug!("entry saved");
                    Settled::default()
                }
                ItemOutcome::Failed(reason) => {
                    warn!(reason = %reason, "entry failed");
                    self.remove_pending(id).await;
                    self.summary.record_failure(reason);
                    Settled::default()
                }
                ItemOutcome::Retryable { rate_limited } => match self.ledger.record_failure(id) {
                    RetryDecision::Retry { attempt } => {
                        warn!(attempt, rate_limited, "retryable failure, entry deferred");
                        Settled {
                            rate_limited,
                            deferred: true,
                        }
                    }
                    RetryDecision::Exhausted { attempts } => {
                        warn!(attempts, "retry ceiling reached, entry dropped");
                        self.remove_pending(id).await;
                        self.summary.record_failure(FailureReason::RetryExhausted);
                        Settled {
                            rate_limited,
                            deferred: false,
                        }
                    }
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn enrich_one(&self, id: EntryId) -> ItemOutcome {
        self.gate.wait().await;
        let page = match self.source.store_page(id).await {
            Ok(page) => page,
            Err(err) => return classify(Upstream::StorePage, &err),
        };
        self.gate.wait().await;
        let release = match self.source.release_info(id).await {
            Ok(release) => release,
            Err(err) => return classify(Upstream::ReleaseInfo, &err),
        };
        self.gate.wait().await;
        let stats = match self.source.review_stats(id).await {
            Ok(stats) => stats,
            Err(err) => return classify(Upstream::ReviewStats, &err),
        };

        let record = match build_record(id, page, release, stats) {
            Ok(record) => record,
            Err(reason) => return ItemOutcome::Failed(reason),
        };
        match self.store.upsert_record(&record).await {
            Ok(()) => ItemOutcome::Saved,
            Err(err) => {
                error!(error = %err, "record upsert failed");
                ItemOutcome::Failed(FailureReason::UpsertError)
            }
        }
    }

    async fn remove_pending(&self, id: EntryId) {
        if let Err(err) = self.store.delete_pending(id).await {
            error!(error = %err, "could not clear pending entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use gamepick_core::JobKind;
    use gamepick_storage::{MemoryStore, RetryPolicy};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakeDetails {
        region_locked: HashSet<EntryId>,
        not_found: HashSet<EntryId>,
        unavailable: HashSet<EntryId>,
        broken_release: HashSet<EntryId>,
        unknown_owners: HashSet<EntryId>,
        throttle_once: Mutex<HashSet<EntryId>>,
        always_throttled: HashSet<EntryId>,
        calls: Mutex<HashMap<EntryId, u32>>,
    }

    impl FakeDetails {
        fn calls(&self, id: EntryId) -> u32 {
            self.calls.lock().expect("lock").get(&id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl DetailSource for FakeDetails {
        async fn store_page(&self, id: EntryId) -> Result<StorePage, SourceError> {
            *self.calls.lock().expect("lock").entry(id).or_insert(0) += 1;
            let throttled = self.throttle_once.lock().expect("lock").remove(&id);
            if throttled || self.always_throttled.contains(&id) {
                return Err(SourceError::RateLimited(429));
            }
            if self.unavailable.contains(&id) {
                return Err(SourceError::Status(503));
            }
            if self.not_found.contains(&id) {
                return Err(SourceError::Status(404));
            }
            if self.region_locked.contains(&id) {
                return Err(SourceError::RegionLock);
            }
            Ok(StorePage {
                title: format!("Game {id}"),
                description: "A game".into(),
                header_image: format!("https://cdn.example/{id}.jpg"),
                genres: vec!["Action".into(), "Indie".into()],
            })
        }

        async fn release_info(&self, id: EntryId) -> Result<ReleaseInfo, SourceError> {
            if self.broken_release.contains(&id) {
                return Err(SourceError::Decode("expected value".into()));
            }
            Ok(ReleaseInfo {
                release_date: NaiveDate::from_ymd_opt(2020, 1, 2),
            })
        }

        async fn review_stats(&self, id: EntryId) -> Result<ReviewStats, SourceError> {
            let owners = if self.unknown_owners.contains(&id) {
                "unknown"
            } else {
                "20,000 .. 50,000"
            };
            Ok(ReviewStats {
                positive: 30,
                negative: 10,
                owners: owners.into(),
            })
        }
    }

    fn config() -> EnrichConfig {
        EnrichConfig {
            chunk_size: 2,
            chunk_delay: Duration::from_secs(1),
            rate_limit_cooldown: Duration::from_secs(180),
            retry: RetryPolicy::new(2, Duration::from_secs(180)),
        }
    }

    fn enricher(
        store: &Arc<MemoryStore>,
        source: &Arc<FakeDetails>,
        gate: &Arc<RateGate>,
    ) -> DetailEnricher {
        DetailEnricher::new(
            store.clone(),
            source.clone(),
            gate.clone(),
            config(),
            SummaryHandle::new(JobKind::GameInfo, Utc::now()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn drains_pending_and_reenrichment_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeDetails::default());
        let gate = Arc::new(RateGate::new());
        store.upsert_pending(&[1, 2, 3]).await.expect("seed");

        let report = enricher(&store, &source, &gate).run().await.expect("run");
        assert!(report.completed);
        assert_eq!(report.saved, 3);
        assert_eq!(report.rounds, 1);
        assert!(store.pending().await.is_empty());

        let record = store.record(2).await.expect("record 2");
        assert_eq!(record.title, "Game 2");
        assert_eq!(record.owner_estimate, 20_000);
        assert_eq!(record.positive_ratio, 0.75);
        assert_eq!(record.release_date, NaiveDate::from_ymd_opt(2020, 1, 2));
        assert!(record.tags.contains("Indie"));
        assert!(store
            .load_job_state(StateKey::DetailEnrich)
            .await
            .expect("load")
            .is_some());

        store.upsert_pending(&[2]).await.expect("requeue");
        enricher(&store, &source, &gate).run().await.expect("second run");
        assert_eq!(store.count_records().await.expect("count"), 3);
        assert_eq!(store.record(2).await, Some(record));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failures_are_labelled_and_cleared() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeDetails {
            region_locked: HashSet::from([4]),
            not_found: HashSet::from([5]),
            broken_release: HashSet::from([6]),
            unknown_owners: HashSet::from([7]),
            ..FakeDetails::default()
        });
        let gate = Arc::new(RateGate::new());
        store.upsert_pending(&[1, 4, 5, 6, 7, 8]).await.expect("seed");
        store.fail_upserts_for(8).await;

        let enricher = enricher(&store, &source, &gate);
        let report = enricher.run().await.expect("run");
        let summary = enricher.summary.snapshot();

        assert!(report.completed);
        assert_eq!(summary.total, 6);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.failure_count(FailureReason::RegionLock), 1);
        assert_eq!(summary.failure_count(FailureReason::Status(404)), 1);
        assert_eq!(summary.failure_count(FailureReason::SourceBJson), 1);
        assert_eq!(summary.failure_count(FailureReason::RecordBuild), 1);
        assert_eq!(summary.failure_count(FailureReason::UpsertError), 1);
        assert!(store.pending().await.is_empty());
        assert_eq!(gate.times_armed(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retryable_failures_stop_at_ceiling() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeDetails {
            unavailable: HashSet::from([9]),
            ..FakeDetails::default()
        });
        let gate = Arc::new(RateGate::new());
        store.upsert_pending(&[9, 10]).await.expect("seed");

        let enricher = enricher(&store, &source, &gate);
        let report = enricher.run().await.expect("run");
        let summary = enricher.summary.snapshot();

        assert_eq!(source.calls(9), 3);
        assert_eq!(source.calls(10), 1);
        assert_eq!(report.rounds, 3);
        assert!(report.completed);
        assert_eq!(summary.failure_count(FailureReason::RetryExhausted), 1);
        assert_eq!(summary.success, 1);
        assert!(enricher.ledger().is_exhausted(9));
        assert!(store.pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_entry_is_dropped_after_ceiling_retries() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeDetails {
            always_throttled: HashSet::from([13]),
            ..FakeDetails::default()
        });
        let gate = Arc::new(RateGate::new());
        store.upsert_pending(&[13, 14]).await.expect("seed");

        let enricher = enricher(&store, &source, &gate);
        let report = enricher.run().await.expect("run");
        let summary = enricher.summary.snapshot();

        assert_eq!(source.calls(13), config().retry.ceiling + 1);
        assert_eq!(source.calls(14), 1);
        assert_eq!(summary.failure_count(FailureReason::RetryExhausted), 1);
        assert_eq!(summary.failure_count(FailureReason::Status(429)), 0);
        assert_eq!(summary.success, 1);
        assert_eq!(summary.pending_chunks, 0);
        assert!(gate.times_armed() >= 1);
        assert!(report.completed);
        assert!(store.pending().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_entry_trips_gate_and_recovers_next_round() {
        let store = Arc::new(MemoryStore::new());
        let source = Arc::new(FakeDetails {
            throttle_once: Mutex::new(HashSet::from([11])),
            ..FakeDetails::default()
        });
        let gate = Arc::new(RateGate::new());
        store.upsert_pending(&[11, 12]).await.expect("seed");

        let enricher = enricher(&store, &source, &gate);
        let report = enricher.run().await.expect("run");
        let summary = enricher.summary.snapshot();

        assert_eq!(gate.times_armed(), 1);
        assert_eq!(report.rounds, 2);
        assert_eq!(summary.success, 2);
        assert_eq!(summary.total_failures(), 0);
        assert!(store.record(11).await.is_some());
    }

    #[test]
    fn decode_failures_are_attributed_to_their_upstream() {
        let decode = SourceError::Decode("eof".into());
        assert_eq!(
            Upstream::StorePage.failure_reason(&decode),
            FailureReason::ParseError
        );
        assert_eq!(
            Upstream::ReviewStats.failure_reason(&decode),
            FailureReason::SourceCJson
        );
        let transport = SourceError::Request {
            message: "reset".into(),
            retryable: false,
        };
        assert_eq!(classify(Upstream::ReleaseInfo, &transport), ItemOutcome::Failed(FailureReason::RequestError));
    }
}
