//! # Observability
//!
//! Logging setup shared by the collector binaries.
//!
//! Binaries call [`init`] or [`init_with_config`] once at startup and then
//! use the standard `tracing` macros everywhere else. Library crates only
//! depend on `tracing` and never install a subscriber themselves.
//!
//! Output goes to stderr (compact or JSON) and, when a log path is
//! configured, to an append-only JSONL file that can be tailed:
//!
//! - `tail -f /var/log/li-exporter.jsonl | jq`
//!
//! `RUST_LOG` overrides the configured default level.
//!
//! ## Usage
//!
//! ```rust,ignore
//! fn main() {
//!     observability::init_with_config(observability::LogConfig {
//!         service_name: "li-exporter".into(),
//!         default_level: "debug".into(),
//!         ..Default::default()
//!     })?;
//!
//!     tracing::info!("collector started");
//! }
//! ```

mod file;

use std::path::PathBuf;

use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, Layer, Registry};

pub use file::LogFileWriter;

/// Format of the stderr stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Single-line human readable output.
    #[default]
    Compact,
    /// One JSON object per line.
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {}", other)),
        }
    }
}

/// Configuration for the logging system.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Name of the service, logged once at startup.
    pub service_name: String,

    /// Default log level filter (e.g., "debug", "info", "warn").
    /// Can be overridden by `RUST_LOG` environment variable.
    pub default_level: String,

    /// Optional JSONL log file.
    pub log_path: Option<PathBuf>,

    /// Emit logs to stderr.
    pub also_stderr: bool,

    /// Format of the stderr stream.
    pub format: LogFormat,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown".into(),
            default_level: "info".into(),
            log_path: None,
            also_stderr: true,
            format: LogFormat::Compact,
        }
    }
}

/// Errors raised while installing the subscriber.
#[derive(Debug, thiserror::Error)]
pub enum ObservabilityError {
    /// The log file could not be opened
    #[error("failed to open log file {path:?}: {source}")]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A global subscriber is already installed
    #[error("logging already initialized: {0}")]
    AlreadyInitialized(#[from] TryInitError),
}

type BoxedLayer = Box<dyn Layer<Layered<EnvFilter, Registry>> + Send + Sync>;

/// Initialize logging with default settings, reporting failures on stderr.
pub fn init(service_name: &str) {
    let config = LogConfig {
        service_name: service_name.into(),
        ..Default::default()
    };
    if let Err(e) = init_with_config(config) {
        eprintln!("observability: {}", e);
    }
}

/// Initialize logging with custom configuration.
///
/// Fails if the log file cannot be opened or if a global subscriber has
/// already been installed.
pub fn init_with_config(config: LogConfig) -> Result<(), ObservabilityError> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.default_level));

    let mut layers: Vec<BoxedLayer> = Vec::new();

    if config.also_stderr {
        layers.push(match config.format {
            LogFormat::Compact => tracing_subscriber::fmt::layer()
                .with_target(true)
                .compact()
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Json => tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
        });
    }

    if let Some(path) = &config.log_path {
        let writer = LogFileWriter::open(path).map_err(|source| ObservabilityError::LogFile {
            path: path.clone(),
            source,
        })?;
        layers.push(
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .boxed(),
        );
    }

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layers)
        .try_init()?;

    tracing::info!(
        service = %config.service_name,
        pid = std::process::id(),
        log_path = ?config.log_path,
        "observability initialized"
    );
    Ok(())
}

/// Re-export tracing macros for convenience.
pub use tracing::{debug, error, info, instrument, trace, warn};

/// Re-export Level for advanced filtering.
pub use tracing::Level;
