//! Exporter tuning knobs.

use std::time::Duration;

use export_buffer::{BufferConfig, Framing};
use serde::{Deserialize, Serialize};

/// Default interval between maintenance ticks.
pub const DEFAULT_TICK_INTERVAL_MS: u64 = 1_000;

/// Default bound on a single connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 1_000;

/// Default number of messages taken from one producer queue per wakeup.
pub const DEFAULT_MAX_READ_BATCH: usize = 25;

/// Default number of backlog bytes flushed per destination per tick.
pub const DEFAULT_FLUSH_BUDGET: usize = 1024 * 1024;

/// Default depth of each producer queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 4_096;

/// Exporter configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    /// Maintenance tick period in milliseconds.
    pub tick_interval_ms: u64,
    /// Connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Messages drained from a ready queue before moving on.
    pub max_read_batch: usize,
    /// Backlog bytes flushed per destination per tick.
    pub flush_budget: usize,
    /// Capacity of each producer queue.
    pub queue_capacity: usize,
    /// How records are framed on the wire.
    pub framing: Framing,
    /// Backlog sizing.
    pub buffer: BufferConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: DEFAULT_TICK_INTERVAL_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_read_batch: DEFAULT_MAX_READ_BATCH,
            flush_budget: DEFAULT_FLUSH_BUDGET,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            framing: Framing::default(),
            buffer: BufferConfig::default(),
        }
    }
}

impl ExporterConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exporter_config_default() {
        let config = ExporterConfig::default();
        assert_eq!(config.tick_interval(), Duration::from_secs(1));
        assert_eq!(config.connect_timeout(), Duration::from_secs(1));
        assert_eq!(config.max_read_batch, 25);
        assert_eq!(config.framing, Framing::RelayHeader);
        assert_eq!(config.buffer.alloc_increment, 10 * 1024 * 1024);
    }

    #[test]
    fn test_exporter_config_partial_json() {
        let config: ExporterConfig = serde_json::from_str(
            r#"{
                "tick_interval_ms": 250,
                "framing": "self_describing",
                "buffer": { "max_capacity": 1048576 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.tick_interval(), Duration::from_millis(250));
        assert_eq!(config.framing, Framing::SelfDescribing);
        assert_eq!(config.buffer.max_capacity, Some(1_048_576));
        assert_eq!(config.buffer.alloc_increment, 10 * 1024 * 1024);
        assert_eq!(config.max_read_batch, DEFAULT_MAX_READ_BATCH);
    }

    #[test]
    fn test_zero_durations_are_clamped() {
        let config = ExporterConfig {
            tick_interval_ms: 0,
            connect_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.tick_interval(), Duration::from_millis(1));
        assert_eq!(config.connect_timeout(), Duration::from_millis(1));
    }
}
