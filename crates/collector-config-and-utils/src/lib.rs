//! Configuration and process utilities for the collector binaries.

mod config;
mod error;
mod logging;

pub use config::{Config, DEFAULT_LOG_LEVEL, LOG_LEVEL_ENV};
pub use error::{CoreError, CoreResult};
pub use logging::{init_logging, parse_level, LoggingOptions};
