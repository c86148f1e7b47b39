//! Tracing initialisation.
//!
//! Components log through `tracing` macros with structured fields (`device_id`,
//! `command_id`, `state`). [`init`] installs a `tracing-subscriber` registry with an
//! `EnvFilter`; `RUST_LOG` overrides the configured level.
//!
//! ```no_run
//! use test_station::logging::{self, LogFormat, LoggingConfig};
//!
//! logging::init(&LoggingConfig::new("debug").with_format(LogFormat::Json)).unwrap();
//! tracing::info!(device_id = "press-1", "Station started");
//! ```

use crate::error::{StationError, StationResult};
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const VALID_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Log output format.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Multi-line, coloured (development).
    #[default]
    Pretty,
    /// Single line per event.
    Compact,
    /// One JSON object per event (log aggregation).
    Json,
}

/// Logging options.
#[derive(Clone, Debug, PartialEq)]
pub struct LoggingConfig {
    /// Default level when `RUST_LOG` is unset.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
    /// Include source file and line.
    pub with_file_and_line: bool,
    /// ANSI colours (pretty and compact only).
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: LogFormat::Pretty,
            with_file_and_line: false,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Config at `level` with default options.
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Sets the output format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Enables or disables ANSI colours.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// Parses a level name (case-insensitive).
pub fn parse_log_level(level: &str) -> StationResult<Level> {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Ok(Level::TRACE),
        "debug" => Ok(Level::DEBUG),
        "info" => Ok(Level::INFO),
        "warn" => Ok(Level::WARN),
        "error" => Ok(Level::ERROR),
        _ => Err(StationError::Configuration(format!(
            "invalid log level '{level}', expected one of: {}",
            VALID_LEVELS.join(", ")
        ))),
    }
}

/// Installs the global subscriber. Calling it again after a subscriber is set is
/// a no-op.
pub fn init(config: &LoggingConfig) -> StationResult<()> {
    let level = parse_log_level(&config.level)?;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_ascii_lowercase()));

    let layer = match config.format {
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_ansi(config.with_ansi)
            .with_filter(env_filter)
            .boxed(),
        LogFormat::Json => fmt::layer()
            .json()
            .with_file(config.with_file_and_line)
            .with_line_number(config.with_file_and_line)
            .with_filter(env_filter)
            .boxed(),
    };

    match tracing_subscriber::registry().with(layer).try_init() {
        Ok(()) => Ok(()),
        // Tests and embedding applications may have installed one already.
        Err(e) if e.to_string().contains("already") => Ok(()),
        Err(e) => Err(StationError::Configuration(format!(
            "failed to initialize tracing: {e}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_log_level() {
        assert_eq!(parse_log_level("DEBUG").unwrap(), Level::DEBUG);
        assert_eq!(parse_log_level("warn").unwrap(), Level::WARN);
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn test_init_twice_is_harmless() {
        let config = LoggingConfig::new("info").with_format(LogFormat::Compact).with_ansi(false);
        assert!(init(&config).is_ok());
        assert!(init(&config).is_ok());
    }

    #[test]
    fn test_init_rejects_bad_level() {
        assert!(init(&LoggingConfig::new("loud")).is_err());
    }
}
