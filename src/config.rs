//! PairDB Configuration
//!
//! Configuration structures for a pair member or arbiter process.
//! The pair topology (self, peer, arbiter) is fixed at startup; a missing
//! or inconsistent topology is a fatal error, never a runtime condition.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Main PairDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairDbConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Pair topology configuration
    pub pair: PairConfig,

    /// Oplog configuration
    #[serde(default)]
    pub oplog: OplogConfig,

    /// Resync configuration
    #[serde(default)]
    pub resync: ResyncConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Address to bind for pair communication and client requests
    pub bind_address: String,

    /// Advertised address for the other processes to connect
    /// (defaults to the bind address)
    #[serde(default)]
    pub advertise_address: Option<String>,
}

impl NodeConfig {
    /// The address peers should use to reach this node
    pub fn self_address(&self) -> &str {
        self.advertise_address.as_deref().unwrap_or(&self.bind_address)
    }
}

/// Pair topology: exactly two data nodes plus one arbiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairConfig {
    /// Address of the peer data node
    pub peer_address: String,

    /// Address of the arbiter
    pub arbiter_address: String,

    /// Heartbeat interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Heartbeat timeout in milliseconds; a probe exceeding this marks the
    /// target unreachable for the tick
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Missed-heartbeat window in milliseconds after which a previously
    /// reachable process is considered down
    #[serde(default = "default_liveness_window_ms")]
    pub liveness_window_ms: u64,
}

impl PairConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.liveness_window_ms)
    }
}

/// Oplog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OplogConfig {
    /// Maximum retained entries; oldest entries are evicted in insertion
    /// order once the bound is reached
    #[serde(default = "default_oplog_max_entries")]
    pub max_entries: usize,

    /// Maximum entries returned per pull request
    #[serde(default = "default_max_batch_entries")]
    pub max_batch_entries: usize,
}

impl Default for OplogConfig {
    fn default() -> Self {
        Self {
            max_entries: default_oplog_max_entries(),
            max_batch_entries: default_max_batch_entries(),
        }
    }
}

/// Resync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResyncConfig {
    /// Maximum full-copy restarts before resync is reported as a
    /// persistent failure
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,

    /// Number of documents per snapshot chunk during initial copy
    #[serde(default = "default_snapshot_chunk_docs")]
    pub snapshot_chunk_docs: usize,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            snapshot_chunk_docs: default_snapshot_chunk_docs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

// Default value functions
fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2000
}

fn default_liveness_window_ms() -> u64 {
    5000
}

fn default_oplog_max_entries() -> usize {
    100_000
}

fn default_max_batch_entries() -> usize {
    1000
}

fn default_max_restarts() -> u32 {
    3
}

fn default_snapshot_chunk_docs() -> usize {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl PairDbConfig {
    /// Load configuration from a TOML file and validate it
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read {}: {}", path.display(), e))
        })?;
        let config: PairDbConfig = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the pair topology. Misconfiguration is fatal at startup.
    pub fn validate(&self) -> Result<()> {
        let this = self.node.self_address();

        if self.node.bind_address.is_empty() {
            return Err(Error::Config("node.bind_address is required".into()));
        }
        if self.pair.peer_address.is_empty() {
            return Err(Error::Config("pair.peer_address is required".into()));
        }
        if self.pair.arbiter_address.is_empty() {
            return Err(Error::Config("pair.arbiter_address is required".into()));
        }
        if self.pair.peer_address == this {
            return Err(Error::Config(format!(
                "pair.peer_address {} must not be this node's own address",
                self.pair.peer_address
            )));
        }
        if self.pair.arbiter_address == this || self.pair.arbiter_address == self.pair.peer_address {
            return Err(Error::Config(format!(
                "pair.arbiter_address {} must be a distinct third process",
                self.pair.arbiter_address
            )));
        }
        if self.pair.heartbeat_interval_ms == 0 {
            return Err(Error::Config("pair.heartbeat_interval_ms must be > 0".into()));
        }
        if self.pair.liveness_window_ms < self.pair.heartbeat_interval_ms {
            return Err(Error::Config(
                "pair.liveness_window_ms must be at least one heartbeat interval".into(),
            ));
        }
        if self.oplog.max_entries == 0 {
            return Err(Error::Config("oplog.max_entries must be > 0".into()));
        }
        Ok(())
    }

    /// Generate an example configuration for the `init` subcommand
    pub fn example(bind_address: &str, peer: &str, arbiter: &str) -> Self {
        Self {
            node: NodeConfig {
                bind_address: bind_address.to_string(),
                advertise_address: None,
            },
            pair: PairConfig {
                peer_address: peer.to_string(),
                arbiter_address: arbiter.to_string(),
                heartbeat_interval_ms: default_heartbeat_interval_ms(),
                heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
                liveness_window_ms: default_liveness_window_ms(),
            },
            oplog: OplogConfig::default(),
            resync: ResyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Serialize to TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Cannot serialize config: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid_config() -> PairDbConfig {
        PairDbConfig::example("127.0.0.1:7501", "127.0.0.1:7502", "127.0.0.1:7500")
    }

    #[test]
    fn test_example_config_validates() {
        valid_config().validate().unwrap();
    }

    #[test]
    fn test_peer_must_differ_from_self() {
        let mut config = valid_config();
        config.pair.peer_address = "127.0.0.1:7501".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_arbiter_must_be_third_process() {
        let mut config = valid_config();
        config.pair.arbiter_address = config.pair.peer_address.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_arbiter_is_fatal() {
        let mut config = valid_config();
        config.pair.arbiter_address = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_roundtrip() {
        let config = valid_config();
        let toml_str = config.to_toml().unwrap();

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(toml_str.as_bytes()).unwrap();

        let loaded = PairDbConfig::load(file.path()).unwrap();
        assert_eq!(loaded.node.bind_address, "127.0.0.1:7501");
        assert_eq!(loaded.pair.peer_address, "127.0.0.1:7502");
        assert_eq!(loaded.pair.heartbeat_interval_ms, 1000);
    }

    #[test]
    fn test_defaults_applied() {
        let toml_str = r#"
            [node]
            bind_address = "127.0.0.1:7501"

            [pair]
            peer_address = "127.0.0.1:7502"
            arbiter_address = "127.0.0.1:7500"
        "#;
        let config: PairDbConfig = toml::from_str(toml_str).unwrap();
        config.validate().unwrap();
        assert_eq!(config.oplog.max_entries, 100_000);
        assert_eq!(config.resync.max_restarts, 3);
        assert_eq!(config.logging.level, "info");
    }
}
