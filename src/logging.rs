//! Tracing bootstrap for hosts embedding the pool.
//!
//! The pool itself only emits `tracing` events; binaries and tests that
//! want them on stderr call [`init`] once at startup.
//!
//! # Environment Variables
//!
//! - `PROCPOOL_LOG` - Log filter (overrides RUST_LOG)
//! - `PROCPOOL_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `PROCPOOL_LOG_FORMAT` - Output format: pretty, compact, json
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Default level when no filter env var is set.
    pub level: Level,
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Pretty,
        }
    }
}

impl LogConfig {
    /// Apply `PROCPOOL_LOG_LEVEL` / `PROCPOOL_LOG_FORMAT` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(level) = std::env::var("PROCPOOL_LOG_LEVEL") {
            if let Ok(level) = Level::from_str(&level) {
                self.level = level;
            }
        }
        if let Ok(format) = std::env::var("PROCPOOL_LOG_FORMAT") {
            if let Ok(format) = format.parse() {
                self.format = format;
            }
        }
        self
    }
}

/// Initialize the global subscriber. Later calls are ignored, so it is
/// safe from test harnesses that race on initialization.
pub fn init(config: LogConfig) {
    let filter = EnvFilter::try_from_env("PROCPOOL_LOG")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(format!("procpool={}", config.level)));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.format {
        LogFormat::Pretty => builder.pretty().try_init(),
        LogFormat::Compact => builder.compact().try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    // A subscriber installed by the host wins; that is fine.
    drop(result);
}
