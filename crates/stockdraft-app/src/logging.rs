// Tracing setup: log to a file, filtered by RUST_LOG when set.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing_subscriber::fmt;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_FILTER: &str = "stockdraft=info,warn";
pub const LOG_FILE_NAME: &str = "stockdraft.log";

/// `RUST_LOG` if set and valid, otherwise [`DEFAULT_FILTER`].
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Build the file subscriber without installing it. Creates `log_dir` and
/// truncates the log file.
pub fn file_subscriber(
    log_dir: &Path,
    filter: EnvFilter,
) -> anyhow::Result<(impl tracing::Subscriber + Send + Sync + 'static, PathBuf)> {
    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    let path = log_dir.join(LOG_FILE_NAME);
    let log_file = File::create(&path)
        .with_context(|| format!("failed to create log file {}", path.display()))?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(log_file)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();
    Ok((subscriber, path))
}

/// Install the file subscriber globally. Returns the log file path.
pub fn init_tracing(log_dir: &Path) -> anyhow::Result<PathBuf> {
    let (subscriber, path) = file_subscriber(log_dir, env_filter())?;
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set tracing subscriber")?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_log_dir(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "stockdraft-logging-{name}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ))
    }

    #[test]
    fn writes_crate_events_to_file() {
        let dir = temp_log_dir("writes");
        let (subscriber, path) = file_subscriber(&dir, EnvFilter::new(DEFAULT_FILTER)).unwrap();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "stockdraft_core::transport", "WebSocket connected");
            tracing::debug!(target: "stockdraft_core::transport", "frame detail");
            tracing::info!(target: "some_dependency", "dependency chatter");
            tracing::warn!(target: "some_dependency", "dependency warning");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("WebSocket connected"));
        assert!(contents.contains("dependency warning"));
        assert!(!contents.contains("frame detail"));
        assert!(!contents.contains("dependency chatter"));
        assert!(!contents.contains("\x1b["), "log file must not contain ANSI escapes");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn file_is_truncated_on_start() {
        let dir = temp_log_dir("truncate");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(LOG_FILE_NAME), "previous run\n").unwrap();

        let (_subscriber, path) = file_subscriber(&dir, EnvFilter::new(DEFAULT_FILTER)).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
