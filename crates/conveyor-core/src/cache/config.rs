//! Redis cache configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis server URL (redis://host:port/db)
    #[serde(default = "default_url")]
    pub url: String,

    /// Connection timeout
    #[serde(default = "default_timeout")]
    pub connect_timeout_ms: u64,

    /// Bounded timeout applied to health pings
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,

    /// Max retry attempts when (re)connecting
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Retry delay in ms
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            connect_timeout_ms: default_timeout(),
            ping_timeout_ms: default_ping_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl RedisConfig {
    /// Development configuration (local Redis)
    pub fn development() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            ..Self::default()
        }
    }

    /// Get retry delay as Duration
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Get connect timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get ping timeout as Duration
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

// Default value helper functions
fn default_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_timeout() -> u64 {
    5000
}
fn default_ping_timeout() -> u64 {
    2000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    500
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisConfig::default();
        assert!(config.url.starts_with("redis://"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.ping_timeout(), Duration::from_millis(2000));
    }
}
