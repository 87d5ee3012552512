//! Configuration module for Murmur
//!
//! Handles loading and parsing configuration from TOML files, with
//! sensible defaults for all optional values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MurmurError, Result};

/// Default single-file size limit for both log kinds (10 MiB)
pub const DEFAULT_MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker listener settings
    pub server: ServerConfig,
    /// Message segment log settings
    pub message_log: MessageLogConfig,
    /// Consumer-group offset log settings
    pub offset_log: OffsetLogConfig,
    /// Producer client settings
    pub producer: ProducerConfig,
    /// Consumer client settings
    pub consumer: ConsumerConfig,
    /// Id generator parameters
    pub id: IdConfig,
}

/// Broker listener settings (`[server]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9999,
        }
    }
}

impl ServerConfig {
    /// Full bind address as `host:port`
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Message segment log settings (`[message_log]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageLogConfig {
    /// Directory holding message segment files
    pub dir: PathBuf,
    /// Size threshold that triggers segment rotation
    pub max_segment_bytes: u64,
}

impl Default for MessageLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("murmur-data"),
            max_segment_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

/// Consumer-group offset log settings (`[offset_log]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OffsetLogConfig {
    /// Directory holding per-group offset files
    pub dir: PathBuf,
    /// Size threshold that triggers offset-file rotation
    pub max_file_bytes: u64,
    /// Interval between flushes of the buffered offset writers, in ms
    pub flush_interval_ms: u64,
}

impl Default for OffsetLogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("murmur-offsets"),
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            flush_interval_ms: 1_000,
        }
    }
}

impl OffsetLogConfig {
    /// Flush interval as a `Duration`
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Producer client settings (`[producer]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Maximum number of send attempts per logical send
    pub retry_limit: u32,
    /// Backoff base: attempt N waits `coefficient * 2^N` ms for a confirm
    pub backoff_coefficient_ms: u64,
    /// Connection establishment timeout in ms
    pub connect_timeout_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            retry_limit: 3,
            backoff_coefficient_ms: 500,
            connect_timeout_ms: 4_000,
        }
    }
}

impl ProducerConfig {
    /// Connection timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Consumer client settings (`[consumer]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Connection establishment and request/response timeout in ms
    pub connect_timeout_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 5_000,
        }
    }
}

impl ConsumerConfig {
    /// Connection timeout as a `Duration`
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Id generator parameters (`[id]`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdConfig {
    /// Worker identifier (0..=31)
    pub worker_id: u64,
    /// Datacenter identifier (0..=31)
    pub datacenter_id: u64,
}

impl Default for IdConfig {
    fn default() -> Self {
        Self {
            worker_id: 1,
            datacenter_id: 1,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            MurmurError::Config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        Self::parse_str(&contents)
    }

    /// Parse configuration from a TOML string
    pub fn parse_str(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)
            .map_err(|e| MurmurError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<()> {
        if self.server.host.is_empty() {
            return Err(MurmurError::Config("server.host must not be empty".into()));
        }
        if self.message_log.max_segment_bytes == 0 {
            return Err(MurmurError::Config(
                "message_log.max_segment_bytes must be greater than zero".into(),
            ));
        }
        if self.offset_log.max_file_bytes == 0 {
            return Err(MurmurError::Config(
                "offset_log.max_file_bytes must be greater than zero".into(),
            ));
        }
        if self.offset_log.flush_interval_ms == 0 {
            return Err(MurmurError::Config(
                "offset_log.flush_interval_ms must be greater than zero".into(),
            ));
        }
        if self.producer.retry_limit == 0 {
            return Err(MurmurError::Config(
                "producer.retry_limit must be at least 1".into(),
            ));
        }
        if self.producer.backoff_coefficient_ms == 0 {
            return Err(MurmurError::Config(
                "producer.backoff_coefficient_ms must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.address(), "127.0.0.1:9999");
        assert_eq!(config.producer.retry_limit, 3);
        assert_eq!(config.producer.backoff_coefficient_ms, 500);
    }

    #[test]
    fn parses_partial_toml() {
        let config = Config::parse_str(
            r#"
            [server]
            port = 7777

            [offset_log]
            flush_interval_ms = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.server.port, 7777);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.offset_log.flush_interval_ms, 250);
        assert_eq!(config.message_log.max_segment_bytes, DEFAULT_MAX_FILE_BYTES);
    }

    #[test]
    fn rejects_zero_retry_limit() {
        let result = Config::parse_str(
            r#"
            [producer]
            retry_limit = 0
            "#,
        );
        assert!(matches!(result, Err(MurmurError::Config(_))));
    }

    #[test]
    fn rejects_unparseable_toml() {
        assert!(matches!(
            Config::parse_str("not toml at all ["),
            Err(MurmurError::Config(_))
        ));
    }
}
