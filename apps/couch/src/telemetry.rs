//! Log setup for the `couch` binary: one fmt subscriber writing to stderr or
//! `--log-file`.

use clap::ValueEnum;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => LevelFilter::ERROR,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Trace => LevelFilter::TRACE,
        }
    }
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
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Keeps the non-blocking writer flushing until exit.
static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Chatty below `info` even when couch itself traces.
const NOISY_TARGETS: &[&str] = &["tungstenite", "tokio_tungstenite", "webrtc", "mio"];

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    let filter = match std::env::var("COUCH_LOG_FILTER") {
        Ok(directives) => EnvFilter::new(directives),
        Err(_) => EnvFilter::new(default_directives(config.level)),
    };

    let (writer, guard) = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| InitError::Io {
                    path: path.clone(),
                    source,
                })?;
            tracing_appender::non_blocking(file)
        }
        None => tracing_appender::non_blocking(std::io::stderr()),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .try_init()
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn default_directives(level: LogLevel) -> String {
    match level {
        LogLevel::Debug | LogLevel::Trace => {
            let level = LevelFilter::from(level).to_string().to_lowercase();
            let mut directives = format!("info,couch={level},couch_core={level}");
            for target in NOISY_TARGETS {
                directives.push_str(&format!(",{target}=info"));
            }
            directives
        }
        other => LevelFilter::from(other).to_string().to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_levels_scope_to_couch_and_quiet_dependencies() {
        assert_eq!(default_directives(LogLevel::Warn), "warn");
        let trace = default_directives(LogLevel::Trace);
        assert!(trace.starts_with("info,couch=trace,couch_core=trace"));
        assert!(trace.contains(",tungstenite=info"));
    }
}
