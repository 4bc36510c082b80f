//! Log sink initialization and maintenance
//!
//! Builds the tracing subscriber from the logging configuration
//! (console and/or rolling file output, optional JSON format) and owns
//! the pruning operations the supervisor invokes under resource
//! pressure.

use crate::utils::config::LoggingConfig;
use crate::utils::error::SentinelResult;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Owns the tracing subscriber and the log directory.
pub struct LoggingService {
    log_dir: PathBuf,
    // Keeps the non-blocking file writer alive for the process lifetime.
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

impl LoggingService {
    /// Initialize the global tracing subscriber from configuration.
    ///
    /// Safe to call more than once; later calls keep the existing
    /// subscriber (relevant for tests that build several supervisors).
    pub fn init(config: &LoggingConfig) -> SentinelResult<Self> {
        let log_dir = PathBuf::from(&config.log_dir);

        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

        let mut layers: Vec<Box<dyn Layer<tracing_subscriber::Registry> + Send + Sync>> =
            Vec::new();

        if config.console_logging {
            let layer = if config.structured_format {
                tracing_subscriber::fmt::layer().json().boxed()
            } else {
                tracing_subscriber::fmt::layer().with_target(false).boxed()
            };
            layers.push(layer);
        }

        let mut file_guard = None;
        if !config.log_dir.is_empty() {
            std::fs::create_dir_all(&log_dir)?;
            let appender = tracing_appender::rolling::daily(&log_dir, "kafka-sentinel.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            let layer = if config.structured_format {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(writer)
                    .boxed()
            };
            layers.push(layer);
        }

        if tracing_subscriber::registry()
            .with(layers)
            .with(filter)
            .try_init()
            .is_err()
        {
            tracing::debug!("Tracing subscriber already initialized, keeping existing sink");
        }

        Ok(Self {
            log_dir,
            _file_guard: file_guard,
        })
    }

    #[must_use]
    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Delete log files older than `days_to_keep`. Returns the number of
    /// files removed.
    pub fn cleanup_old_logs(&self, days_to_keep: u32) -> SentinelResult<usize> {
        let cutoff = SystemTime::now() - Duration::from_secs(u64::from(days_to_keep) * 86_400);
        let mut removed = 0;

        if !self.log_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.contains(".log"));
            if !is_log {
                continue;
            }
            let modified = entry.metadata().and_then(|m| m.modified());
            if let Ok(modified) = modified {
                if modified < cutoff && std::fs::remove_file(&path).is_ok() {
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            tracing::info!("Pruned {removed} log files older than {days_to_keep} days");
        }
        Ok(removed)
    }

    /// Remove temporary files left in the log directory. Returns the
    /// number of files removed.
    pub fn remove_temp_files(&self) -> SentinelResult<usize> {
        let mut removed = 0;
        if !self.log_dir.exists() {
            return Ok(0);
        }
        for entry in std::fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            let path = entry.path();
            let is_tmp = path.extension().is_some_and(|ext| ext == "tmp");
            if is_tmp && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_respects_retention_window() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: dir.path().display().to_string(),
            console_logging: false,
            ..LoggingConfig::default()
        };
        let service = LoggingService::init(&config).unwrap();

        std::fs::write(dir.path().join("a.log"), "a").unwrap();
        std::fs::write(dir.path().join("b.log.1"), "b").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "n").unwrap();

        // Freshly written files survive a 7-day retention window.
        assert_eq!(service.cleanup_old_logs(7).unwrap(), 0);
        // A zero-day window prunes every log file but leaves other files.
        assert_eq!(service.cleanup_old_logs(0).unwrap(), 2);
        assert!(dir.path().join("notes.txt").exists());
    }

    #[test]
    fn temp_files_are_removed() {
        let dir = tempfile::tempdir().unwrap();
        let config = LoggingConfig {
            log_dir: dir.path().display().to_string(),
            console_logging: false,
            ..LoggingConfig::default()
        };
        let service = LoggingService::init(&config).unwrap();

        std::fs::write(dir.path().join("scratch.tmp"), "x").unwrap();
        std::fs::write(dir.path().join("keep.log"), "y").unwrap();

        assert_eq!(service.remove_temp_files().unwrap(), 1);
        assert!(dir.path().join("keep.log").exists());
    }
}
