use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use gamepick_core::JobKind;
use gamepick_storage::{LogLifecycle, PgStore};
use gamepick_sync::{init_tracing, JobRunner, SyncConfig};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "gamepick")]
#[command(about = "Game catalog ingestion and player-count sampling")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Catalog sync followed by detail enrichment, once.
    Sync,
    /// One player-count sampling pass.
    Sample,
    /// HTTP server plus the cron scheduler when enabled.
    Serve,
    Migrate,
    /// Prints job health; exits non-zero when any job is stale.
    Health {
        /// `game_info` or `player_count`; all jobs when omitted.
        job: Option<String>,
    },
}

async fn prepare_logs(config: &SyncConfig) -> Result<()> {
    let lifecycle = LogLifecycle::new(config.log_root.clone(), config.log_archive_root.clone());
    if let Some(archive) = lifecycle.prepare(Utc::now()).await? {
        info!(archive = %archive.display(), "previous logs archived");
    }
    Ok(())
}

async fn run_once(config: SyncConfig, job: JobKind) -> Result<()> {
    prepare_logs(&config).await?;
    let runner = JobRunner::connect(config).await?;
    let report = runner.run(job).await?;
    report.compression.await.context("compressing run logs")?;
    println!(
        "{job} finished: elapsed={} success={} failures={} logs={}",
        report.summary.elapsed,
        report.summary.success,
        report.summary.total_failures(),
        report.logs.dir.display()
    );
    if let Some(err) = report.error {
        bail!("{job} failed: {err}");
    }
    Ok(())
}

async fn serve(config: SyncConfig) -> Result<()> {
    prepare_logs(&config).await?;
    let runner = Arc::new(JobRunner::connect(config).await?);
    let scheduler = runner.maybe_build_scheduler().await?;
    if let Some(sched) = &scheduler {
        sched.start().await.context("starting scheduler")?;
        info!("scheduler started");
    } else {
        warn!("scheduler disabled; jobs run only on manual trigger");
    }

    tokio::select! {
        result = gamepick_web::serve(runner) => result?,
        _ = tokio::signal::ctrl_c() => info!("shutdown requested"),
    }

    if let Some(mut sched) = scheduler {
        sched.shutdown().await.context("stopping scheduler")?;
    }
    Ok(())
}

async fn health(config: SyncConfig, job: Option<String>) -> Result<()> {
    let jobs = match job {
        Some(name) => vec![JobKind::parse(&name).with_context(|| format!("unknown job {name}"))?],
        None => JobKind::ALL.to_vec(),
    };
    let runner = JobRunner::connect(config).await?;
    let mut statuses = Vec::with_capacity(jobs.len());
    for job in jobs {
        statuses.push(runner.health(job).await?);
    }
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    if statuses.iter().any(|status| !status.healthy) {
        bail!("one or more jobs are stale");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = SyncConfig::from_env();
    init_tracing(&config.log_filter)?;

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => run_once(config, JobKind::GameInfo).await?,
        Commands::Sample => run_once(config, JobKind::PlayerCount).await?,
        Commands::Serve => serve(config).await?,
        Commands::Migrate => {
            let store = PgStore::connect(&config.database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await?;
            println!("migrations applied");
        }
        Commands::Health { job } => health(config, job).await?,
    }

    Ok(())
}
