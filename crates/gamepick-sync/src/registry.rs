//! Process-wide record of in-flight jobs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use gamepick_core::{format_elapsed, FailureReason, JobKind, RunSummary};
use tokio::time::Instant;
use tracing::info;

use crate::SyncError;

/// Shared, mutable progress of one run. Cloning shares the same summary.
#[derive(Debug, Clone)]
pub struct SummaryHandle {
    inner: Arc<Mutex<RunSummary>>,
    started: Instant,
}

impl SummaryHandle {
    pub fn new(job: JobKind, started_at: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RunSummary::new(job, started_at))),
            started: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RunSummary> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn update(&self, apply: impl FnOnce(&mut RunSummary)) {
        apply(&mut self.lock());
    }

    pub fn record_failure(&self, reason: FailureReason) {
        self.lock().record_failure(reason);
    }

    pub fn record_success(&self) {
        self.lock().success += 1;
    }

    /// Copy of the summary with `elapsed` filled in.
    pub fn snapshot(&self) -> RunSummary {
        let mut summary = self.lock().clone();
        summary.elapsed = format_elapsed(self.started.elapsed());
        summary
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    active: HashMap<JobKind, SummaryHandle>,
    skipped: HashMap<JobKind, u64>,
}

/// At most one instance per job kind; rejected starts are counted.
#[derive(Debug, Default)]
pub struct JobRegistry {
    state: Mutex<RegistryState>,
}

impl JobRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Marks `job` active, or refuses if an instance is already running.
    pub fn try_acquire(
        self: &Arc<Self>,
        job: JobKind,
        started_at: DateTime<Utc>,
    ) -> Result<RunGuard, SyncError> {
        let mut state = self.state();
        if state.active.contains_key(&job) {
            let skipped = state.skipped.entry(job).or_insert(0);
            *skipped += 1;
            info!(job = %job, skipped = *skipped, "job already running, start skipped");
            return Err(SyncError::AlreadyRunning(job));
        }
        let summary = SummaryHandle::new(job, started_at);
        state.active.insert(job, summary.clone());
        Ok(RunGuard {
            registry: Arc::clone(self),
            job,
            summary,
        })
    }

    pub fn is_active(&self, job: JobKind) -> bool {
        self.state().active.contains_key(&job)
    }

    /// Live summary of the in-flight instance, if any.
    pub fn summary(&self, job: JobKind) -> Option<RunSummary> {
        self.state().active.get(&job).map(SummaryHandle::snapshot)
    }

    pub fn skipped(&self, job: JobKind) -> u64 {
        self.state().skipped.get(&job).copied().unwrap_or(0)
    }

    fn release(&self, job: JobKind) {
        self.state().active.remove(&job);
    }
}

/// Holds a job's slot in the registry until dropped.
#[derive(Debug)]
pub struct RunGuard {
    registry: Arc<JobRegistry>,
    job: JobKind,
    summary: SummaryHandle,
}

impl RunGuard {
    pub fn job(&self) -> JobKind {
        self.job
    }

    pub fn summary(&self) -> &SummaryHandle {
        &self.summary
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.registry.release(self.job);
    }
}
