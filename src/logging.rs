//! Logging setup: stderr plus a daily rolling file, filtered by `RUST_LOG`

use anyhow::{Context, Result};
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "rtsp-recorder.log";
const LOG_DIR_ENV: &str = "RTSP_RECORDER_LOG_PATH";
const LOG_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Directory the rolling log files go to
pub fn get_log_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    let dirs = ProjectDirs::from("dev", "rtsp-recorder", "recorder")
        .context("Failed to determine project directories for log path")?;
    // state_dir only exists on Linux
    let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(base.join("logs"))
}

/// Install the global subscriber. Hold the returned guard until exit so the
/// file writer flushes.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = get_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;
    let pruned = prune_old_logs(&log_dir, LOG_MAX_AGE);

    let (file_writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(&log_dir, LOG_FILE_PREFIX));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(file_writer)
                .with_ansi(false),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    tracing::debug!("Logging to {:?} ({} old log files pruned)", log_dir, pruned);
    Ok(guard)
}

/// Delete our log files last modified more than `max_age` ago. Returns the
/// number removed.
fn prune_old_logs(log_dir: &Path, max_age: Duration) -> usize {
    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return 0;
    };
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return 0;
    };

    entries
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .filter(|entry| {
            entry
                .metadata()
                .map(|meta| meta.is_file() && meta.modified().map_or(false, |m| m < cutoff))
                .unwrap_or(false)
        })
        .filter(|entry| std::fs::remove_file(entry.path()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_keeps_fresh_and_foreign_files() {
        let dir = tempfile::tempdir().unwrap();
        let fresh = dir.path().join(format!("{}.2026-10-18", LOG_FILE_PREFIX));
        let foreign = dir.path().join("notes.txt");
        std::fs::write(&fresh, b"log").unwrap();
        std::fs::write(&foreign, b"keep").unwrap();

        assert_eq!(prune_old_logs(dir.path(), Duration::from_secs(60)), 0);
        assert!(fresh.exists());
        assert!(foreign.exists());
    }

    #[test]
    fn test_prune_removes_expired_logs() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join(format!("{}.2026-01-01", LOG_FILE_PREFIX));
        std::fs::write(&old, b"log").unwrap();

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(prune_old_logs(dir.path(), Duration::ZERO), 1);
        assert!(!old.exists());
    }
}
