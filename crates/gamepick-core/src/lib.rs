//! Core domain model for catalog ingestion and player-count sampling.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize, Serializer};

/// Upstream catalog identifier (a Steam appid).
pub type EntryId = i64;

/// Resumable position in the upstream catalog listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CatalogCursor {
    pub last_modified_watermark: Option<DateTime<Utc>>,
    pub last_seen_id: Option<EntryId>,
}

/// Catalog id awaiting enrichment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PendingEntry {
    pub id: EntryId,
}

/// Normalized per-entry record, fully overwritten on every successful enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub id: EntryId,
    pub title: String,
    pub description: String,
    pub release_date: Option<NaiveDate>,
    pub thumbnail_url: String,
    pub positive_count: u64,
    pub negative_count: u64,
    pub positive_ratio: f64,
    pub owner_estimate: u64,
    pub tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub entry_id: EntryId,
    pub timestamp: DateTime<Utc>,
    pub value: u64,
}

/// The two scheduled job types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Catalog sync followed by detail enrichment.
    GameInfo,
    /// Live player-count sampling.
    PlayerCount,
}

impl JobKind {
    pub const ALL: [JobKind; 2] = [JobKind::GameInfo, JobKind::PlayerCount];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::GameInfo => "game_info",
            JobKind::PlayerCount => "player_count",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// State row whose success timestamp decides this job's health.
    pub fn health_key(&self) -> StateKey {
        match self {
            JobKind::GameInfo => StateKey::DetailEnrich,
            JobKind::PlayerCount => StateKey::MetricSample,
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key of a persisted `JobState` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKey {
    /// Watermark of the catalog listing.
    CatalogSync,
    /// Last pass that drained every pending entry.
    DetailEnrich,
    MetricSample,
}

impl StateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            StateKey::CatalogSync => "catalog_sync",
            StateKey::DetailEnrich => "detail_enrich",
            StateKey::MetricSample => "metric_sample",
        }
    }
}

/// Last full success of one job phase. For catalog sync this is the
/// watermark; the page cursor itself is never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub key: StateKey,
    pub last_success_at: Option<DateTime<Utc>>,
}

impl JobState {
    pub fn succeeded(key: StateKey, at: DateTime<Utc>) -> Self {
        Self {
            key,
            last_success_at: Some(at),
        }
    }
}

/// Closed set of per-item failure reasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FailureReason {
    /// Store page rendered without a title; usually a region lock.
    RegionLock,
    /// Store page markup did not have the expected shape.
    ParseError,
    SourceBJson,
    SourceCJson,
    /// Upstream values could not be merged into a record.
    RecordBuild,
    UpsertError,
    RetryExhausted,
    /// Transport-level failure that was not retried.
    RequestError,
    /// Successful response whose body could not be decoded.
    DecodeError,
    /// Any other non-success status code.
    Status(u16),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::RegionLock => f.write_str("region_lock"),
            FailureReason::ParseError => f.write_str("parse_error"),
            FailureReason::SourceBJson => f.write_str("source_b_json"),
            FailureReason::SourceCJson => f.write_str("source_c_json"),
            FailureReason::RecordBuild => f.write_str("record_build"),
            FailureReason::UpsertError => f.write_str("upsert_error"),
            FailureReason::RetryExhausted => f.write_str("retry_exhausted"),
            FailureReason::RequestError => f.write_str("request_error"),
            FailureReason::DecodeError => f.write_str("decode_error"),
            FailureReason::Status(code) => write!(f, "status_{code}"),
        }
    }
}

impl Serialize for FailureReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Progress snapshot for one in-flight job instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub job: JobKind,
    pub started_at: DateTime<Utc>,
    pub elapsed: String,
    pub total: u64,
    pub success: u64,
    pub failures: BTreeMap<FailureReason, u64>,
    pub round: u32,
    pub current_chunk: Option<usize>,
    pub pending_chunks: usize,
    pub finished_chunks: usize,
}

impl RunSummary {
    pub fn new(job: JobKind, started_at: DateTime<Utc>) -> Self {
        Self {
            job,
            started_at,
            elapsed: format_elapsed(Duration::ZERO),
            total: 0,
            success: 0,
            failures: BTreeMap::new(),
            round: 0,
            current_chunk: None,
            pending_chunks: 0,
            finished_chunks: 0,
        }
    }

    pub fn record_failure(&mut self, reason: FailureReason) {
        *self.failures.entry(reason).or_default() += 1;
    }

    pub fn failure_count(&self, reason: FailureReason) -> u64 {
        self.failures.get(&reason).copied().unwrap_or(0)
    }

    pub fn total_failures(&self) -> u64 {
        self.failures.values().sum()
    }
}

/// Share of positive reviews, `0` when there are no reviews at all.
pub fn positive_ratio(positive: u64, negative: u64) -> f64 {
    let total = positive.saturating_add(negative);
    if total == 0 {
        return 0.0;
    }
    (positive as f64 / total as f64).clamp(0.0, 1.0)
}

/// Lower bound of an owner estimate such as `"20,000 .. 50,000"`.
pub fn parse_owner_count(owners: &str) -> Option<u64> {
    let lower = owners.split("..").next()?;
    let digits: String = lower
        .trim()
        .chars()
        .filter(|c| *c != ',' && !c.is_whitespace())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// Human-readable elapsed time, e.g. `1h 2m 3.5s`.
pub fn format_elapsed(elapsed: Duration) -> String {
    const MINUTE: u64 = 60;
    const HOUR: u64 = 60 * MINUTE;
    const DAY: u64 = 24 * HOUR;

    let whole = elapsed.as_secs();
    let mut parts = Vec::new();
    if whole >= DAY {
        parts.push(format!("{}d", whole / DAY));
    }
    if whole % DAY >= HOUR {
        parts.push(format!("{}h", (whole % DAY) / HOUR));
    }
    if whole % HOUR >= MINUTE {
        parts.push(format!("{}m", (whole % HOUR) / MINUTE));
    }
    let seconds = (whole % MINUTE) as f64 + f64::from(elapsed.subsec_millis()) / 1000.0;
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}
