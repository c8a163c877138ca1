//! # Logging Utilities
//!
//! Logging setup for the hwpoint tools, built on `tracing`.
//!
//! Log records go to stderr so they never mix with the slot tables and
//! reports the CLI prints on stdout. Optionally they are also written to a
//! file.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hwpoint_utils::{init_logging, LoggingConfig};
//!
//! let config = LoggingConfig::from_env().expect("bad logging environment");
//! let _guard = init_logging(&config).expect("Failed to initialize logging");
//!
//! tracing::info!("Session started");
//! ```
//!
//! ## Environment Variables
//!
//! - `RUST_LOG`: filter directives (e.g. `RUST_LOG=hwpoint_core=trace`)
//! - `HWPOINT_LOG_FORMAT`: `pretty`, `compact` or `json` (default: `compact`)
//! - `HWPOINT_LOG_FILE`: optional path of a log file written in addition to
//!   stderr
//!
//! The debug register tables themselves are only traced when
//! `HWPOINT_SHOW_DEBUG_REGS` is set (see `hwpoint_core::config`) and the
//! `hwpoint_core` target is at `trace` level.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::{env, io};

use chrono::Utc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::ChronoUtc;
use tracing_subscriber::fmt::{self};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Environment variable selecting the output format.
pub const ENV_LOG_FORMAT: &str = "HWPOINT_LOG_FORMAT";

/// Environment variable naming an additional log file.
pub const ENV_LOG_FILE: &str = "HWPOINT_LOG_FILE";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat
{
    /// Multi-line, human-readable records with source locations
    Pretty,
    /// One line per record (default)
    #[default]
    Compact,
    /// JSON objects, one per line
    Json,
}

impl FromStr for LogFormat
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "pretty" | "dev" => Ok(LogFormat::Pretty),
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(LoggingError::InvalidFormat(format!(
                "{s}. Use 'pretty', 'compact' or 'json'"
            ))),
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel
{
    /// Error level
    Error,
    /// Warning level
    Warn,
    /// Info level
    Info,
    /// Debug level
    Debug,
    /// Trace level (includes debug register dumps)
    Trace,
}

impl From<LogLevel> for Level
{
    fn from(level: LogLevel) -> Self
    {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel
{
    type Err = LoggingError;

    fn from_str(s: &str) -> Result<Self, Self::Err>
    {
        match s.to_lowercase().as_str() {
            "error" | "err" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" | "dbg" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LoggingError::InvalidLevel(format!(
                "{s}. Use 'error', 'warn', 'info', 'debug', or 'trace'"
            ))),
        }
    }
}

/// Logging settings
///
/// `level` takes precedence over `RUST_LOG`; without either, only warnings
/// and errors are shown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoggingConfig
{
    /// Explicit level (usually from a `--log-level` flag).
    pub level: Option<LogLevel>,
    /// Output format.
    pub format: LogFormat,
    /// Extra log file.
    pub file: Option<PathBuf>,
}

impl LoggingConfig
{
    /// Read `HWPOINT_LOG_FORMAT` and `HWPOINT_LOG_FILE`.
    ///
    /// ## Errors
    ///
    /// Returns `LoggingError::InvalidFormat` for an unknown format name.
    pub fn from_env() -> Result<Self, LoggingError>
    {
        Self::from_values(env::var(ENV_LOG_FORMAT).ok().as_deref(), env::var_os(ENV_LOG_FILE).map(PathBuf::from))
    }

    /// Build a configuration from raw variable values.
    ///
    /// ## Errors
    ///
    /// Returns `LoggingError::InvalidFormat` for an unknown format name.
    pub fn from_values(format: Option<&str>, file: Option<PathBuf>) -> Result<Self, LoggingError>
    {
        let format = match format.filter(|s| !s.is_empty()) {
            Some(name) => name.parse()?,
            None => LogFormat::default(),
        };
        Ok(Self {
            level: None,
            format,
            file: file.filter(|path| !path.as_os_str().is_empty()),
        })
    }

    /// Override the level.
    #[must_use]
    pub fn with_level(mut self, level: Option<LogLevel>) -> Self
    {
        if level.is_some() {
            self.level = level;
        }
        self
    }

    /// Override the log file.
    #[must_use]
    pub fn with_file(mut self, file: Option<PathBuf>) -> Self
    {
        if file.is_some() {
            self.file = file;
        }
        self
    }

    fn filter(&self) -> EnvFilter
    {
        if let Some(level) = self.level {
            return EnvFilter::new(Level::from(level).to_string());
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(Level::WARN.to_string()))
    }
}

/// Keeps the file writer alive; drop it at the end of `main` to flush.
#[derive(Debug)]
pub struct LoggingGuard
{
    _file: Option<WorkerGuard>,
}

/// Default log file location: `~/.hwpoint/YYYY-MM-DD-hwpoint.log`, or under
/// `/tmp` when there is no home directory.
#[must_use]
pub fn default_log_path() -> PathBuf
{
    let today = Utc::now().format("%Y-%m-%d");
    let dir = env::var_os("HOME").map_or_else(|| PathBuf::from("/tmp"), |home| PathBuf::from(home).join(".hwpoint"));
    dir.join(format!("{today}-hwpoint.log"))
}

/// Install the global subscriber
///
/// ## Example
///
/// ```rust,no_run
/// use hwpoint_utils::{init_logging, LogFormat, LogLevel, LoggingConfig};
///
/// let config = LoggingConfig {
///     level: Some(LogLevel::Debug),
///     format: LogFormat::Pretty,
///     file: None,
/// };
/// let _guard = init_logging(&config).expect("Failed to initialize logging");
/// ```
///
/// ## Errors
///
/// Returns an error if a global subscriber is already installed or the log
/// file directory cannot be created.
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard, LoggingError>
{
    let mut layers: Vec<BoxedLayer> = vec![console_layer(config.format, config.filter())];
    let mut guard = None;

    if let Some(path) = &config.file {
        let (layer, file_guard) = file_layer(path, config.format, config.filter())?;
        layers.push(layer);
        guard = Some(file_guard);
    }

    Registry::default()
        .with(layers)
        .try_init()
        .map_err(|err| LoggingError::InitializationFailed(err.to_string()))?;
    Ok(LoggingGuard { _file: guard })
}

fn console_layer(format: LogFormat, filter: EnvFilter) -> BoxedLayer
{
    let layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_writer(io::stderr);
    match format {
        LogFormat::Pretty => layer
            .pretty()
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => layer.compact().with_filter(filter).boxed(),
        LogFormat::Json => layer
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_filter(filter)
            .boxed(),
    }
}

fn file_layer(path: &Path, format: LogFormat, filter: EnvFilter) -> Result<(BoxedLayer, WorkerGuard), LoggingError>
{
    let dir = path.parent().filter(|dir| !dir.as_os_str().is_empty()).unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| LoggingError::InvalidFile(path.display().to_string()))?;

    // The date is already part of the default name, so never roll.
    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    let layer = fmt::layer()
        .with_writer(writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_timer(ChronoUtc::rfc_3339())
        .with_ansi(false);
    let layer = match format {
        LogFormat::Json => layer.json().with_filter(filter).boxed(),
        LogFormat::Pretty | LogFormat::Compact => layer.with_filter(filter).boxed(),
    };
    Ok((layer, guard))
}

/// Logging initialization error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError
{
    /// Invalid log format
    #[error("Invalid log format: {0}")]
    InvalidFormat(String),

    /// Invalid log level
    #[error("Invalid log level: {0}")]
    InvalidLevel(String),

    /// Log file path without a file name
    #[error("Invalid log file path: {0}")]
    InvalidFile(String),

    /// Failed to initialize logging
    #[error("Failed to initialize logging: {0}")]
    InitializationFailed(String),

    /// File logging error
    #[error("File logging error: {0}")]
    FileError(#[from] io::Error),
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_log_format_from_str()
    {
        assert_eq!(LogFormat::from_str("pretty").unwrap(), LogFormat::Pretty);
        assert_eq!(LogFormat::from_str("JSON").unwrap(), LogFormat::Json);
        assert_eq!(LogFormat::from_str("compact").unwrap(), LogFormat::Compact);
        assert!(matches!(
            LogFormat::from_str("xml"),
            Err(LoggingError::InvalidFormat(_))
        ));
    }

    #[test]
    fn test_log_level_from_str()
    {
        assert_eq!(LogLevel::from_str("error").unwrap(), LogLevel::Error);
        assert_eq!(LogLevel::from_str("warning").unwrap(), LogLevel::Warn);
        assert_eq!(LogLevel::from_str("info").unwrap(), LogLevel::Info);
        assert_eq!(LogLevel::from_str("dbg").unwrap(), LogLevel::Debug);
        assert_eq!(LogLevel::from_str("trace").unwrap(), LogLevel::Trace);
        assert!(LogLevel::from_str("loud").is_err());
    }

    #[test]
    fn test_log_level_to_tracing_level()
    {
        assert_eq!(Level::from(LogLevel::Error), Level::ERROR);
        assert_eq!(Level::from(LogLevel::Warn), Level::WARN);
        assert_eq!(Level::from(LogLevel::Info), Level::INFO);
        assert_eq!(Level::from(LogLevel::Debug), Level::DEBUG);
        assert_eq!(Level::from(LogLevel::Trace), Level::TRACE);
    }

    #[test]
    fn test_config_from_values()
    {
        let config = LoggingConfig::from_values(None, None).unwrap();
        assert_eq!(config, LoggingConfig::default());

        let config = LoggingConfig::from_values(Some("json"), Some(PathBuf::from("/tmp/hw.log"))).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file, Some(PathBuf::from("/tmp/hw.log")));

        // Empty values count as unset
        let config = LoggingConfig::from_values(Some(""), Some(PathBuf::new())).unwrap();
        assert_eq!(config, LoggingConfig::default());

        assert!(LoggingConfig::from_values(Some("yaml"), None).is_err());
    }

    #[test]
    fn test_config_overrides()
    {
        let config = LoggingConfig::default()
            .with_level(Some(LogLevel::Trace))
            .with_level(None)
            .with_file(Some(PathBuf::from("a.log")));
        assert_eq!(config.level, Some(LogLevel::Trace));
        assert_eq!(config.file, Some(PathBuf::from("a.log")));
    }

    #[test]
    fn test_default_log_path_is_dated()
    {
        let path = default_log_path();
        let name = path.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.ends_with("-hwpoint.log"));
        assert_eq!(name.len(), "YYYY-MM-DD-hwpoint.log".len());
    }
}
