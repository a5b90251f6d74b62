use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const ENV_LOG_FILTER: &str = "RTC_LOG_FILTER";

#[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error,
    #[default]
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_filter(self) -> LevelFilter {
        match self {
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

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

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

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config.level.to_filter()))
        .with_level(true)
        .with_target(config.level >= LogLevel::Debug)
        .with_thread_ids(config.level >= LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Configure(err.to_string()))?;
    let _ = GUARD.set(guard);
    Ok(())
}

fn env_filter(level: LevelFilter) -> EnvFilter {
    match std::env::var(ENV_LOG_FILTER) {
        Ok(filter) if !filter.trim().is_empty() => EnvFilter::new(filter),
        _ => EnvFilter::new(default_filter_for(level)),
    }
}

// Coordinator events are matched by module path (`transport_webrtc`); the
// `target = "webrtc"` on them is a field. `webrtc` here is the engine crate.
fn default_filter_for(level: LevelFilter) -> String {
    match level {
        LevelFilter::TRACE => verbose_filter("trace"),
        LevelFilter::DEBUG => verbose_filter("debug"),
        LevelFilter::INFO => "info".into(),
        LevelFilter::WARN => "warn".into(),
        LevelFilter::ERROR => "error".into(),
        LevelFilter::OFF => "off".into(),
    }
}

fn verbose_filter(level: &str) -> String {
    ["rtc_loopback", "transport_webrtc", "transport_bus", "webrtc"]
        .iter()
        .fold(String::from("info"), |filter, krate| format!("{filter},{krate}={level}"))
}
