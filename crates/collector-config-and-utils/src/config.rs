//! Configuration management for the collector.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use collector_export::{DestinationConfig, ExporterConfig};
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable overriding `log_level`.
pub const LOG_LEVEL_ENV: &str = "LI_EXPORT_LOG_LEVEL";

/// Main collector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
    /// Stderr log format ("compact" or "json").
    pub log_format: String,
    /// Optional JSONL log file.
    pub log_file: Option<PathBuf>,
    /// Mediators known at startup.
    pub destinations: Vec<DestinationConfig>,
    /// Exporter tuning.
    pub export: ExporterConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: DEFAULT_LOG_LEVEL.to_string(),
            log_format: "compact".to_string(),
            log_file: None,
            destinations: Vec::new(),
            export: ExporterConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from `path`, falling back to defaults when the
    /// file does not exist. Environment overrides are applied afterwards.
    pub fn load(path: &Path) -> CoreResult<Self> {
        let mut config = if path.exists() {
            Self::load_from_file(path)?
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Self::default()
        };

        config.load_from_env();
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: &Path) -> CoreResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a file.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Override configuration from environment variables.
    /// Only the log level can be overridden at runtime.
    fn load_from_env(&mut self) {
        self.override_log_level(std::env::var(LOG_LEVEL_ENV).ok());
    }

    fn override_log_level(&mut self, level: Option<String>) {
        if let Some(level) = level.filter(|l| !l.trim().is_empty()) {
            self.log_level = level.trim().to_string();
        }
    }

    /// Reject configurations the exporter cannot run with.
    pub fn validate(&self) -> CoreResult<()> {
        let mut seen = BTreeSet::new();
        for dest in &self.destinations {
            if !seen.insert(dest.id) {
                return Err(CoreError::Config(format!(
                    "duplicate destination id {}",
                    dest.id
                )));
            }
            if dest.address.trim().is_empty() {
                return Err(CoreError::Config(format!(
                    "destination {} has no address",
                    dest.id
                )));
            }
            if dest.port == 0 {
                return Err(CoreError::Config(format!(
                    "destination {} has port 0",
                    dest.id
                )));
            }
        }

        let export = &self.export;
        if export.queue_capacity == 0 {
            return Err(CoreError::Config("queue_capacity must be positive".into()));
        }
        if export.max_read_batch == 0 {
            return Err(CoreError::Config("max_read_batch must be positive".into()));
        }
        if export.buffer.alloc_increment == 0 {
            return Err(CoreError::Config(
                "buffer.alloc_increment must be positive".into(),
            ));
        }
        if let Some(max) = export.buffer.max_capacity {
            if max < export.buffer.alloc_increment {
                return Err(CoreError::Config(format!(
                    "buffer.max_capacity {} is below one allocation increment ({})",
                    max, export.buffer.alloc_increment
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collector_export::Framing;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        assert!(config.destinations.is_empty());
        assert_eq!(config.export, ExporterConfig::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("collector.json");

        let config_json = r#"{
            "log_level": "debug",
            "destinations": [
                { "id": 1, "address": "10.0.0.5", "port": 9000 },
                { "id": 2, "address": "mediator.example.net", "port": 9001 }
            ],
            "export": {
                "tick_interval_ms": 250,
                "framing": "self_describing",
                "buffer": { "alloc_increment": 65536 }
            }
        }"#;

        std::fs::write(&config_path, config_json).unwrap();

        let config = Config::load_from_file(&config_path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[1].address, "mediator.example.net");
        assert_eq!(config.export.tick_interval_ms, 250);
        assert_eq!(config.export.framing, Framing::SelfDescribing);
        assert_eq!(config.export.buffer.alloc_increment, 65536);
        // Unspecified fields keep their defaults
        assert_eq!(
            config.export.max_read_batch,
            ExporterConfig::default().max_read_batch
        );
    }

    #[test]
    fn test_config_save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("etc").join("collector.json");

        let mut config = Config::default();
        config.log_file = Some(PathBuf::from("/var/log/li-exporter.jsonl"));
        config
            .destinations
            .push(DestinationConfig::new(4, "::1", 9100));

        config.save(&path).unwrap();

        let loaded = Config::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_config_load_nonexistent_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load(&dir.path().join("missing.json")).unwrap();
        assert!(config.destinations.is_empty());
        assert_eq!(config.export, ExporterConfig::default());
    }

    #[test]
    fn test_config_invalid_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(Config::load(&path), Err(CoreError::Json(_))));
    }

    #[test]
    fn test_log_level_override() {
        let mut config = Config::default();
        config.override_log_level(None);
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        config.override_log_level(Some("  ".into()));
        assert_eq!(config.log_level, DEFAULT_LOG_LEVEL);
        config.override_log_level(Some("trace".into()));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_validate_rejects_duplicate_ids() {
        let mut config = Config::default();
        config.destinations = vec![
            DestinationConfig::new(1, "10.0.0.1", 9000),
            DestinationConfig::new(1, "10.0.0.2", 9000),
        ];
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate destination id 1"));
    }

    #[test]
    fn test_validate_rejects_bad_destination() {
        let mut config = Config::default();
        config.destinations = vec![DestinationConfig::new(1, "10.0.0.1", 0)];
        assert!(config.validate().is_err());

        config.destinations = vec![DestinationConfig::new(1, "", 9000)];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_sizing() {
        let mut config = Config::default();
        config.export.buffer.alloc_increment = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.max_read_batch = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.export.buffer.alloc_increment = 1024;
        config.export.buffer.max_capacity = Some(512);
        assert!(config.validate().is_err());
    }
}
