//! Diagnostic logging for the client. The console front end owns stdout, so
//! log lines go to stderr or a file.

use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::EnvFilter;

/// Replaces the whole filter directive when set.
pub const FILTER_ENV: &str = "ROULETTE_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to install logger: {0}")]
    Install(String),
}

/// Keeps the background writer flushing for the life of the process.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }
    let (writer, guard) = open_writer(config.file.as_deref())?;
    let override_filter = std::env::var(FILTER_ENV).ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(directive(config.level, override_filter.as_deref())))
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none() && std::io::stderr().is_terminal())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn open_writer(file: Option<&Path>) -> Result<(NonBlocking, WorkerGuard), InitError> {
    match file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.to_path_buf(),
                    source,
                })?;
            Ok(tracing_appender::non_blocking(file))
        }
        None => Ok(tracing_appender::non_blocking(std::io::stderr())),
    }
}

/// Filter directive for `level`. Debug and trace only open up this client's
/// own targets; the WebRTC stack stays at info.
fn directive(level: LogLevel, override_filter: Option<&str>) -> String {
    if let Some(filter) = override_filter.map(str::trim).filter(|f| !f.is_empty()) {
        return filter.to_owned();
    }
    match level {
        LogLevel::Error => "error".to_owned(),
        LogLevel::Warn => "warn".to_owned(),
        LogLevel::Info => "info".to_owned(),
        LogLevel::Debug => "info,roulette_client_core=debug,roulette=debug".to_owned(),
        LogLevel::Trace => "info,roulette_client_core=trace,roulette=trace".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_only_open_our_targets() {
        assert_eq!(directive(LogLevel::Warn, None), "warn");
        assert_eq!(
            directive(LogLevel::Trace, None),
            "info,roulette_client_core=trace,roulette=trace"
        );
    }

    #[test]
    fn filter_variable_replaces_the_level() {
        assert_eq!(directive(LogLevel::Error, Some("webrtc_ice=debug")), "webrtc_ice=debug");
        assert_eq!(directive(LogLevel::Info, Some("  ")), "info");
    }

    #[test]
    fn unopenable_file_is_reported() {
        let missing = Path::new("/nonexistent-roulette-dir/client.log");
        match open_writer(Some(missing)) {
            Err(InitError::Io { path, .. }) => assert_eq!(path, missing),
            Err(other) => panic!("unexpected {other:?}"),
            Ok(_) => panic!("opened a file in a missing directory"),
        }
    }
}
