//! File-based logging configuration.
//!
//! Console output is always on. When `IMX_FILE_LOGGING` is set, logs are
//! additionally written to daily-rotating JSON files under `logs_dir`.
//!
//! - `IMX_FILE_LOGGING`: set to "true" or "1" to enable file logging.
//! - `IMX_LOG_MAX_FILES`: number of daily log files to retain (default: 7).

use std::path::PathBuf;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone)]
struct FileLoggingConfig {
    enabled: bool,
    log_dir: PathBuf,
    max_files: usize,
}

impl FileLoggingConfig {
    fn from_env(log_dir: PathBuf) -> Self {
        let enabled = std::env::var("IMX_FILE_LOGGING")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let max_files = std::env::var("IMX_LOG_MAX_FILES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(7);
        Self { enabled, log_dir, max_files }
    }
}

/// Initialize console (+ optional file) logging. The returned guard must be
/// held for the process lifetime so buffered file writes are flushed on exit.
pub fn init_logging(log_level: &str, log_dir: PathBuf) -> Option<WorkerGuard> {
    let config = FileLoggingConfig::from_env(log_dir);

    let filter_string =
        format!("warn,server={level},manager={level},store={level},backends={level},utils={level}", level = log_level);
    let env_filter = EnvFilter::try_new(&filter_string).expect("failed to build tracing filter");
    let console_layer = tracing_subscriber::fmt::layer().with_filter(env_filter);

    if !config.enabled {
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("failed to create log directory {:?}: {e}", config.log_dir);
        tracing_subscriber::registry().with(console_layer).init();
        return None;
    }

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "infermux.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    let file_filter = EnvFilter::try_new(&filter_string).expect("failed to build tracing file filter");
    let file_layer = tracing_subscriber::fmt::layer().json().with_writer(non_blocking).with_filter(file_filter);

    tracing_subscriber::registry().with(console_layer).with(file_layer).init();
    tracing::info!(log_dir = ?config.log_dir, max_files = config.max_files, "file logging enabled");

    let log_dir = config.log_dir.clone();
    let max_files = config.max_files;
    std::thread::spawn(move || cleanup_old_logs(&log_dir, max_files));

    Some(guard)
}

/// Keep only the `max_files` most recently modified rotated log files.
fn cleanup_old_logs(log_dir: &PathBuf, max_files: usize) {
    let Ok(entries) = std::fs::read_dir(log_dir) else { return };

    let mut log_files: Vec<_> = entries
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with("infermux.log"))
                .unwrap_or(false)
        })
        .filter_map(|e| e.metadata().ok().and_then(|m| m.modified().ok()).map(|t| (e.path(), t)))
        .collect();

    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    for (path, _) in log_files.into_iter().skip(max_files) {
        if let Err(e) = std::fs::remove_file(&path) {
            tracing::warn!(?path, error = %e, "failed to remove old log file");
        }
    }
}
