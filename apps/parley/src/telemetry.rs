//! Subscriber setup for the `parley` binary.
//!
//! Library code logs under fixed `parley::*` targets so a filter such as
//! `parley::transfer=debug` selects one concern regardless of module layout.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;

use clap::ValueEnum;
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Every target the library logs under.
pub const TARGETS: &[&str] = &[
    "parley::config",
    "parley::crypto",
    "parley::media",
    "parley::mesh",
    "parley::negotiation",
    "parley::relay",
    "parley::transfer",
    "parley::transport",
];

/// Dependencies clamped to `info` at trace level unless `PARLEY_TRACE_DEPS` is set.
const NOISY_DEPENDENCIES: &[&str] = &[
    "webrtc",
    "webrtc_ice",
    "webrtc_sctp",
    "webrtc_dtls",
    "webrtc_srtp",
    "tokio_tungstenite",
    "tungstenite",
    "rustls",
    "mio",
];

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

    fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub file: Option<PathBuf>,
    /// Replaces the computed filter verbatim.
    pub filter: Option<String>,
    pub trace_dependencies: bool,
}

impl LogConfig {
    /// Reads `PARLEY_LOG_FILTER` and `PARLEY_TRACE_DEPS` on top of the given level.
    pub fn from_env(level: LogLevel, file: Option<PathBuf>) -> Self {
        Self {
            level,
            file,
            filter: std::env::var("PARLEY_LOG_FILTER")
                .ok()
                .filter(|filter| !filter.trim().is_empty()),
            trace_dependencies: std::env::var("PARLEY_TRACE_DEPS")
                .is_ok_and(|value| !value.is_empty() && value != "0"),
        }
    }

    /// The `EnvFilter` directive string this configuration installs.
    pub fn directives(&self) -> String {
        if let Some(filter) = &self.filter {
            return filter.clone();
        }
        let level = self.level.as_directive();
        if self.level < LogLevel::Debug {
            return level.to_string();
        }

        let mut directives = vec!["info".to_string(), format!("parley={level}")];
        directives.extend(TARGETS.iter().map(|target| format!("{target}={level}")));
        if self.level == LogLevel::Trace && !self.trace_dependencies {
            directives.extend(NOISY_DEPENDENCIES.iter().map(|dep| format!("{dep}=info")));
        }
        directives.join(",")
    }
}

#[derive(thiserror::Error, Debug)]
pub enum InitError {
    #[error("failed to open log file {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid log filter {filter:?}: {reason}")]
    Filter { filter: String, reason: String },
    #[error("failed to install logger: {0}")]
    Install(String),
}

static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(config: &LogConfig) -> Result<(), InitError> {
    if GUARD.get().is_some() {
        return Ok(());
    }

    let directives = config.directives();
    let filter = EnvFilter::try_new(&directives).map_err(|err| InitError::Filter {
        filter: directives.clone(),
        reason: err.to_string(),
    })?;
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
        .with_env_filter(filter)
        .with_target(config.level >= LogLevel::Debug || config.filter.is_some())
        .with_thread_ids(config.level == LogLevel::Trace)
        .with_ansi(config.file.is_none())
        .with_writer(writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|err| InitError::Install(err.to_string()))?;
    let _ = GUARD.set(guard);

    tracing::debug!(target: "parley::config", %directives, "logging installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(level: LogLevel) -> LogConfig {
        LogConfig {
            level,
            ..LogConfig::default()
        }
    }

    #[test]
    fn quiet_levels_use_a_single_directive() {
        assert_eq!(LogConfig::default().level, LogLevel::Warn);
        assert_eq!(config(LogLevel::Warn).directives(), "warn");
        assert_eq!(config(LogLevel::Info).directives(), "info");
    }

    #[test]
    fn debug_enables_every_parley_target() {
        let directives = config(LogLevel::Debug).directives();
        for target in TARGETS {
            assert!(directives.contains(&format!("{target}=debug")), "{directives}");
        }
        assert!(directives.starts_with("info,parley=debug"));
        assert!(!directives.contains("webrtc=info"));
    }

    #[test]
    fn trace_clamps_dependencies_unless_asked() {
        let clamped = config(LogLevel::Trace).directives();
        assert!(clamped.contains("parley::transfer=trace"));
        assert!(clamped.contains("webrtc_ice=info"));

        let open = LogConfig {
            trace_dependencies: true,
            ..config(LogLevel::Trace)
        };
        assert!(!open.directives().contains("webrtc_ice=info"));
    }

    #[test]
    fn explicit_filter_wins() {
        let custom = LogConfig {
            filter: Some("parley::transfer=debug".into()),
            ..config(LogLevel::Trace)
        };
        assert_eq!(custom.directives(), "parley::transfer=debug");
        assert!(EnvFilter::try_new(custom.directives()).is_ok());
    }
}
