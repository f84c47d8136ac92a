//! Logging initialization.
//!
//! - **Production** (`VBEACON_ENV=production`): JSON to a daily rolling file
//!   plus compact stdout for the systemd journal
//! - **Development**: pretty stdout with span events
//!
//! The filter comes from `RUST_LOG` if set, otherwise `VBEACON_LOG_LEVEL`
//! (default `info`).

use std::path::{Path, PathBuf};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable holding the default log filter.
pub const LOG_LEVEL_ENV: &str = "VBEACON_LOG_LEVEL";

/// Environment variable selecting production logging.
pub const ENVIRONMENT_ENV: &str = "VBEACON_ENV";

const LOG_FILE_PREFIX: &str = "vbeacon";

/// Flush guards for the non-blocking writers.
///
/// Dropping this flushes whatever is still queued, so hold it until the last
/// log line has been written.
#[must_use = "dropping the guards stops log output"]
#[derive(Default)]
pub struct LogGuards(Vec<WorkerGuard>);

impl LogGuards {
    /// Number of writers being kept alive.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no writer needs flushing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Whether `VBEACON_ENV` selects production logging.
#[must_use]
pub fn is_production() -> bool {
    std::env::var(ENVIRONMENT_ENV).is_ok_and(|env| env.eq_ignore_ascii_case("production"))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Returns an error if the filter directive cannot be parsed or the log
/// directory cannot be created.
pub fn init(is_production: bool) -> anyhow::Result<LogGuards> {
    let log_level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| "info".to_string());

    let env_filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&log_level))?;

    if is_production {
        init_production(env_filter, &log_directory())
    } else {
        init_development(env_filter);
        Ok(LogGuards::default())
    }
}

fn file_writer(log_dir: &Path) -> anyhow::Result<(NonBlocking, WorkerGuard)> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = RollingFileAppender::new(Rotation::DAILY, log_dir, LOG_FILE_PREFIX);
    Ok(tracing_appender::non_blocking(file_appender))
}

fn init_production(env_filter: EnvFilter, log_dir: &Path) -> anyhow::Result<LogGuards> {
    let (non_blocking_file, file_guard) = file_writer(log_dir)?;
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    // journald adds its own timestamps and does not render ANSI.
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(non_blocking_stdout)
        .with_target(true)
        .with_ansi(false)
        .without_time();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    Ok(LogGuards(vec![file_guard, stdout_guard]))
}

fn init_development(env_filter: EnvFilter) {
    let stdout_layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(stdout_layer)
        .init();
}

/// Directory for rolling log files.
#[must_use]
pub fn log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/vbeacon")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("", "", "vbeacon")
            .map(|dirs| dirs.data_dir().join("logs"))
            .unwrap_or_else(|| PathBuf::from("./logs"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_directory_is_named_after_the_app() {
        let dir = log_directory();
        assert!(dir.to_string_lossy().contains("vbeacon"));
    }

    #[test]
    fn test_dropping_guards_flushes_queued_lines() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, guard) = file_writer(&dir.path().join("logs")).unwrap();
        let guards = LogGuards(vec![guard]);
        assert_eq!(guards.len(), 1);

        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_writer(writer)
            .finish();
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(code = 69, "Could not advertise");
        });
        drop(guards);

        let contents: String = std::fs::read_dir(dir.path().join("logs"))
            .unwrap()
            .map(|entry| std::fs::read_to_string(entry.unwrap().path()).unwrap())
            .collect();
        assert!(contents.contains("Could not advertise"));
    }

    #[test]
    fn test_development_logging_has_nothing_to_flush() {
        assert!(LogGuards::default().is_empty());
    }
}
