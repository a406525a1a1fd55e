//! Lifecycle of the jobs' own log files: dated allocation, archive and gzip.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const RUN_LOG_FILE: &str = "run.log";
pub const WARN_LOG_FILE: &str = "warn.log";
const GZ_EXTENSION: &str = "gz";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const RUN_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S_%3f";
const MAX_RUN_DIR_ATTEMPTS: usize = 100;

/// Files written by one job run: everything, plus warnings and above.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunLogPaths {
    pub dir: PathBuf,
    pub log: PathBuf,
    pub warn: PathBuf,
}

impl RunLogPaths {
    pub fn files(&self) -> Vec<PathBuf> {
        vec![self.log.clone(), self.warn.clone()]
    }
}

pub fn run_log_paths(root: &Path, job: &str, at: DateTime<Utc>) -> RunLogPaths {
    paths_in(root.join(job).join(at.format(RUN_STAMP_FORMAT).to_string()))
}

fn paths_in(dir: PathBuf) -> RunLogPaths {
    RunLogPaths {
        log: dir.join(RUN_LOG_FILE),
        warn: dir.join(WARN_LOG_FILE),
        dir,
    }
}

fn with_suffix(dir: &Path, attempt: usize) -> PathBuf {
    let mut name = dir.as_os_str().to_owned();
    name.push(format!("_{attempt}"));
    PathBuf::from(name)
}

pub fn archive_dir_for(archive_root: &Path, at: DateTime<Utc>) -> PathBuf {
    archive_root.join(format!("logs_{}", at.format(STAMP_FORMAT)))
}

fn is_compressed(path: &Path) -> bool {
    path.extension().and_then(|ext| ext.to_str()) == Some(GZ_EXTENSION)
}

fn gz_path_for(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(GZ_EXTENSION);
    PathBuf::from(name)
}

/// Gzip `path` next to itself through a temp file, then remove the original.
pub fn compress_file(path: &Path) -> anyhow::Result<PathBuf> {
    let target = gz_path_for(path);
    let mut temp_name = target.as_os_str().to_owned();
    temp_name.push(".tmp");
    let temp = PathBuf::from(temp_name);

    let result = (|| -> anyhow::Result<()> {
        let mut reader = BufReader::new(
            File::open(path).with_context(|| format!("opening {}", path.display()))?,
        );
        let out = File::create(&temp).with_context(|| format!("creating {}", temp.display()))?;
        let mut encoder = GzEncoder::new(BufWriter::new(out), Compression::default());
        io::copy(&mut reader, &mut encoder)
            .with_context(|| format!("compressing {}", path.display()))?;
        let writer = encoder
            .finish()
            .with_context(|| format!("finishing {}", temp.display()))?;
        writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("flushing {}", temp.display()))?;
        Ok(())
    })();

    if let Err(err) = result {
        let _ = fs::remove_file(&temp);
        return Err(err);
    }

    fs::rename(&temp, &target)
        .with_context(|| format!("renaming {} -> {}", temp.display(), target.display()))?;
    fs::remove_file(path).with_context(|| format!("removing {}", path.display()))?;
    Ok(target)
}

fn compress_tree(dir: &Path) -> anyhow::Result<usize> {
    let mut compressed = 0;
    for entry in fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            compressed += compress_tree(&path)?;
        } else if !is_compressed(&path) {
            match compress_file(&path) {
                Ok(_) => compressed += 1,
                Err(err) => warn!(path = %path.display(), error = %err, "failed to compress log"),
            }
        }
    }
    Ok(compressed)
}

#[derive(Debug, Clone)]
pub struct LogLifecycle {
    root: PathBuf,
    archive_root: PathBuf,
}

impl LogLifecycle {
    pub fn new(root: impl Into<PathBuf>, archive_root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            archive_root: archive_root.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Startup step: gzip whatever the previous process left behind, move the
    /// whole root into a timestamped archive directory and start a fresh root.
    pub async fn prepare(&self, at: DateTime<Utc>) -> anyhow::Result<Option<PathBuf>> {
        let root = self.root.clone();
        let archive = archive_dir_for(&self.archive_root, at);
        tokio::task::spawn_blocking(move || prepare_blocking(&root, &archive))
            .await
            .context("joining log archive task")?
    }

    /// Creates a fresh dated directory for one run and returns the files it
    /// will hold. A directory that already exists is never reused; runs that
    /// share a timestamp get a numeric suffix.
    pub async fn allocate(&self, job: &str, at: DateTime<Utc>) -> anyhow::Result<RunLogPaths> {
        let base = run_log_paths(&self.root, job, at).dir;
        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        for attempt in 0..MAX_RUN_DIR_ATTEMPTS {
            let dir = if attempt == 0 {
                base.clone()
            } else {
                with_suffix(&base, attempt)
            };
            match tokio::fs::create_dir(&dir).await {
                Ok(()) => return Ok(paths_in(dir)),
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("creating {}", dir.display()))
                }
            }
        }
        anyhow::bail!("no free run log directory for {}", base.display())
    }

    /// Gzips and removes the given files off the async runtime.
    pub fn compress_in_background(&self, files: Vec<PathBuf>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || {
            for path in files {
                if !path.exists() {
                    debug!(path = %path.display(), "log file missing, nothing to compress");
                    continue;
                }
                match compress_file(&path) {
                    Ok(target) => debug!(path = %target.display(), "compressed run log"),
                    Err(err) => warn!(path = %path.display(), error = %err, "failed to compress run log"),
                }
            }
        })
    }
}

fn prepare_blocking(root: &Path, archive: &Path) -> anyhow::Result<Option<PathBuf>> {
    if !root.exists() {
        fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
        return Ok(None);
    }

    let compressed = compress_tree(root)?;
    if let Some(parent) = archive.parent() {
        fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    fs::rename(root, archive)
        .with_context(|| format!("archiving {} -> {}", root.display(), archive.display()))?;
    fs::create_dir_all(root).with_context(|| format!("creating {}", root.display()))?;
    info!(compressed, archive = %archive.display(), "archived previous logs");
    Ok(Some(archive.to_path_buf()))
}
