//! Runs jobs end to end: registry slot, dedicated log files, the job body,
//! then background compression of the run's logs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use gamepick_adapters::{
    CatalogSource, DetailSource, HttpCatalogSource, HttpDetailSource, HttpMetricSource,
    MetricSource, SteamEndpoints,
};
use gamepick_core::{JobKind, RunSummary};
use gamepick_storage::{
    run_log_paths, CatalogStore, HttpClientConfig, HttpFetcher, LogLifecycle, PgStore, RateGate,
    RunLogPaths,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::instrument::WithSubscriber;
use tracing::{error, info, warn};

use crate::catalog::CatalogSync;
use crate::enrich::DetailEnricher;
use crate::registry::{JobRegistry, RunGuard, SummaryHandle};
use crate::sample::Sampler;
use crate::telemetry::RunLogSink;
use crate::{SyncConfig, SyncError};

/// Upstream adapters used by the jobs.
#[derive(Clone)]
pub struct Sources {
    pub catalog: Arc<dyn CatalogSource>,
    pub details: Arc<dyn DetailSource>,
    pub metrics: Arc<dyn MetricSource>,
}

impl Sources {
    pub fn steam(config: &SyncConfig) -> anyhow::Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let endpoints = SteamEndpoints::default();
        Ok(Self {
            catalog: Arc::new(HttpCatalogSource::new(
                http.clone(),
                endpoints.clone(),
                config.steam_key.clone(),
            )),
            details: Arc::new(HttpDetailSource::new(http.clone(), endpoints.clone())),
            metrics: Arc::new(HttpMetricSource::new(http, endpoints)),
        })
    }
}

/// Outcome of one run. Always names the log files, even when the body failed.
#[derive(Debug)]
pub struct RunReport {
    pub job: JobKind,
    pub summary: RunSummary,
    pub logs: RunLogPaths,
    pub error: Option<String>,
    /// Completes once the run's log files are gzipped.
    pub compression: JoinHandle<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub job: JobKind,
    pub healthy: bool,
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Healthy when the job's last full success is younger than `staleness`.
pub async fn health_check(
    store: &dyn CatalogStore,
    job: JobKind,
    now: DateTime<Utc>,
    staleness: Duration,
) -> Result<HealthStatus, SyncError> {
    let state = store.load_job_state(job.health_key()).await?;
    let last_success_at = state.and_then(|s| s.last_success_at);
    let max_age = chrono::Duration::from_std(staleness).context("staleness out of range")?;
    Ok(HealthStatus {
        job,
        healthy: last_success_at.is_some_and(|at| now - at < max_age),
        last_success_at,
    })
}

pub struct JobRunner {
    config: SyncConfig,
    store: Arc<dyn CatalogStore>,
    sources: Sources,
    registry: Arc<JobRegistry>,
    logs: LogLifecycle,
    detail_gate: Arc<RateGate>,
    metric_gate: Arc<RateGate>,
}

impl JobRunner {
    pub fn new(config: SyncConfig, store: Arc<dyn CatalogStore>, sources: Sources) -> Self {
        let logs = LogLifecycle::new(config.log_root.clone(), config.log_archive_root.clone());
        Self {
            config,
            store,
            sources,
            registry: JobRegistry::new(),
            logs,
            detail_gate: Arc::new(RateGate::new()),
            metric_gate: Arc::new(RateGate::new()),
        }
    }

    /// Connects to Postgres and wires the Steam-backed sources.
    pub async fn connect(config: SyncConfig) -> anyhow::Result<Self> {
        let store = PgStore::connect(&config.database_url)
            .await
            .context("connecting to database")?;
        let sources = Sources::steam(&config)?;
        Ok(Self::new(config, Arc::new(store), sources))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    pub async fn health(&self, job: JobKind) -> Result<HealthStatus, SyncError> {
        health_check(self.store.as_ref(), job, Utc::now(), self.config.staleness(job)).await
    }

    /// Runs `job` to completion on the current task.
    pub async fn run(&self, job: JobKind) -> Result<RunReport, SyncError> {
        let guard = self.registry.try_acquire(job, Utc::now())?;
        Ok(self.execute(guard).await)
    }

    /// Claims the registry slot now and runs the job on a background task.
    pub fn start(self: &Arc<Self>, job: JobKind) -> Result<JoinHandle<RunReport>, SyncError> {
        let guard = self.registry.try_acquire(job, Utc::now())?;
        let runner = Arc::clone(self);
        Ok(tokio::spawn(async move { runner.execute(guard).await }))
    }

    async fn execute(&self, guard: RunGuard) -> RunReport {
        let job = guard.job();
        let started_at = guard.summary().snapshot().started_at;
        let paths = match self.logs.allocate(job.as_str(), started_at).await {
            Ok(paths) => paths,
            Err(err) => {
                warn!(job = %job, error = %err, "could not allocate run log directory");
                run_log_paths(self.logs.root(), job.as_str(), started_at)
            }
        };

        let sink = match RunLogSink::open(&paths, &self.config.log_filter) {
            Ok(sink) => Some(sink),
            Err(err) => {
                warn!(job = %job, error = %err, "run logs unavailable, logging to console only");
                None
            }
        };
        let summary = guard.summary().clone();
        let body = async move {
            let outcome = self.run_body(job, summary.clone()).await;
            let snapshot = summary.snapshot();
            match &outcome {
                Ok(()) => info!(
                    job = %job,
                    elapsed = %snapshot.elapsed,
                    success = snapshot.success,
                    failures = snapshot.total_failures(),
                    "job finished"
                ),
                Err(err) => error!(job = %job, elapsed = %snapshot.elapsed, error = %err, "job failed"),
            }
            outcome
        };
        let outcome = match sink.as_ref().map(RunLogSink::dispatch) {
            Some(dispatch) => body.with_subscriber(dispatch).await,
            None => body.await,
        };
        drop(sink);

        let compression = self.logs.compress_in_background(paths.files());
        let summary = guard.summary().snapshot();
        drop(guard);

        RunReport {
            job,
            summary,
            logs: paths,
            error: outcome.err().map(|err| err.to_string()),
            compression,
        }
    }

    async fn run_body(&self, job: JobKind, summary: SummaryHandle) -> Result<(), SyncError> {
        info!(job = %job, "job started");
        match job {
            JobKind::GameInfo => {
                let mut catalog =
                    CatalogSync::new(self.store.clone(), self.sources.catalog.clone());
                catalog.init().await?;
                catalog.run().await?;
                DetailEnricher::new(
                    self.store.clone(),
                    self.sources.details.clone(),
                    self.detail_gate.clone(),
                    self.config.enrich,
                    summary,
                )
                .run()
                .await?;
            }
            JobKind::PlayerCount => {
                Sampler::new(
                    self.store.clone(),
                    self.sources.metrics.clone(),
                    self.metric_gate.clone(),
                    self.config.sample,
                    summary,
                )
                .run()
                .await?;
            }
        }
        Ok(())
    }

    /// Cron jobs for both kinds, or `None` when scheduling is disabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> anyhow::Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for (kind, cron) in [
            (JobKind::GameInfo, &self.config.game_info_cron),
            (JobKind::PlayerCount, &self.config.player_count_cron),
        ] {
            let runner = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let runner = Arc::clone(&runner);
                Box::pin(async move {
                    match runner.run(kind).await {
                        Ok(report) => {
                            info!(job = %kind, log = %report.logs.log.display(), "scheduled run finished")
                        }
                        Err(SyncError::AlreadyRunning(_)) => {
                            info!(job = %kind, "previous run still active, tick skipped")
                        }
                        Err(err) => error!(job = %kind, error = %err, "scheduled run failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}
