//! Logging initialization for the collector.
//!
//! Thin wrapper over the observability crate so binaries can go straight
//! from a loaded [`Config`] to an installed subscriber.

use std::path::PathBuf;

use observability::{LogConfig, LogFormat};

use crate::{Config, CoreResult};

/// Logging settings taken from the config file and command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingOptions {
    pub level: String,
    pub format: String,
    pub log_file: Option<PathBuf>,
}

impl LoggingOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            level: config.log_level.clone(),
            format: config.log_format.clone(),
            log_file: config.log_file.clone(),
        }
    }
}

/// Initialize the logging system for a collector service.
///
/// Log level comes from `RUST_LOG` when set, otherwise from `options`.
/// An unknown format falls back to compact output.
///
/// # Example
///
/// ```ignore
/// init_logging("li-exporter", &LoggingOptions::from_config(&config))?;
/// tracing::info!("Exporter started");
/// ```
pub fn init_logging(service_name: &str, options: &LoggingOptions) -> CoreResult<()> {
    let format = options.format.parse::<LogFormat>().unwrap_or_else(|e| {
        eprintln!("{}, using compact", e);
        LogFormat::Compact
    });

    observability::init_with_config(LogConfig {
        service_name: service_name.into(),
        default_level: parse_level(&options.level).to_string().to_lowercase(),
        log_path: options.log_file.clone(),
        also_stderr: true,
        format,
    })?;
    Ok(())
}

/// Parse a log level string into a tracing Level.
pub fn parse_level(level: &str) -> tracing::Level {
    match level.trim().to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" | "warning" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    }
}
