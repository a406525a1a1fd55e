//! Tracing setup: the process-wide console subscriber and the per-run
//! subscriber that also writes the run's own log files.

use std::fs::File;

use anyhow::Context;
use gamepick_storage::RunLogPaths;
use tracing::Dispatch;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

pub const DEFAULT_LOG_FILTER: &str = "gamepick=info,sqlx=warn,html5ever=warn,selectors=warn";

fn env_filter(directives: &str) -> EnvFilter {
    EnvFilter::try_new(directives).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Installs the console subscriber. Safe to call more than once; later calls
/// leave the first subscriber in place.
pub fn init_tracing(directives: &str) -> anyhow::Result<()> {
    let installed = tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_filter(env_filter(directives)))
        .try_init();
    if let Err(err) = installed {
        tracing::debug!(error = %err, "tracing subscriber already installed");
    }
    Ok(())
}

/// Subscriber scoped to a single job run. Writes everything to the run log,
/// warnings and above to the warn log, and mirrors to the console.
///
/// Dropping the sink flushes both files.
pub struct RunLogSink {
    dispatch: Dispatch,
    _guards: Vec<WorkerGuard>,
}

impl RunLogSink {
    pub fn open(paths: &RunLogPaths, directives: &str) -> anyhow::Result<Self> {
        let run_file = File::create(&paths.log)
            .with_context(|| format!("creating {}", paths.log.display()))?;
        let warn_file = File::create(&paths.warn)
            .with_context(|| format!("creating {}", paths.warn.display()))?;
        let (run_writer, run_guard) = tracing_appender::non_blocking(run_file);
        let (warn_writer, warn_guard) = tracing_appender::non_blocking(warn_file);

        let subscriber = tracing_subscriber::registry()
            .with(fmt::layer().with_filter(env_filter(directives)))
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(run_writer)
                    .with_filter(env_filter(directives)),
            )
            .with(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(warn_writer)
                    .with_filter(LevelFilter::WARN),
            );

        Ok(Self {
            dispatch: Dispatch::new(subscriber),
            _guards: vec![run_guard, warn_guard],
        })
    }

    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamepick_storage::run_log_paths;
    use tempfile::tempdir;

    #[test]
    fn warn_file_only_receives_warnings() {
        let dir = tempdir().expect("tempdir");
        let paths = run_log_paths(dir.path(), "game_info", chrono::Utc::now());
        std::fs::create_dir_all(&paths.dir).expect("mkdir");

        let sink = RunLogSink::open(&paths, "info").expect("open sink");
        tracing::dispatcher::with_default(&sink.dispatch(), || {
            tracing::info!("routine progress");
            tracing::warn!("upstream throttled");
        });
        drop(sink);

        let run = std::fs::read_to_string(&paths.log).expect("run log");
        let warn = std::fs::read_to_string(&paths.warn).expect("warn log");
        assert!(run.contains("routine progress"));
        assert!(run.contains("upstream throttled"));
        assert!(warn.contains("upstream throttled"));
        assert!(!warn.contains("routine progress"));
    }
}
