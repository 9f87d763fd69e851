//! Pool configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Document pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of warm (live) documents reached through the wake queue.
    #[serde(default = "default_max_concurrent_warm")]
    pub max_concurrent_warm: usize,
    /// Inactivity after which a warm document hibernates (milliseconds).
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Capacity of the effect channel shared by all documents.
    #[serde(default = "default_effect_buffer")]
    pub effect_buffer: usize,
}

fn default_max_concurrent_warm() -> usize {
    8
}

fn default_idle_timeout_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_effect_buffer() -> usize {
    1024
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_warm: default_max_concurrent_warm(),
            idle_timeout_ms: default_idle_timeout_ms(),
            effect_buffer: default_effect_buffer(),
        }
    }
}

impl PoolConfig {
    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.max_concurrent_warm, 8);
        assert_eq!(config.idle_timeout(), Duration::from_secs(30));
        assert_eq!(config.effect_buffer, 1024);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PoolConfig = serde_json::from_str(r#"{"max_concurrent_warm": 2}"#).unwrap();
        assert_eq!(config.max_concurrent_warm, 2);
        assert_eq!(config.idle_timeout_ms, 30_000);
    }
}
