//! Corral Daemon Configuration
//!
//! This module provides the node-local configuration for the Corral
//! control-plane daemon. Cluster-wide settings (offline threshold, role
//! targets, trust password) live in the replicated store, not here.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main Corral daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorralConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Clustering configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Server name used when this node bootstraps or joins a cluster
    pub name: String,

    /// Data directory for the replicated database and cluster certificates
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Address the core REST API listens on (host:port)
    pub core_address: String,

    /// Dedicated cluster address; defaults to core_address when unset
    #[serde(default)]
    pub cluster_address: Option<String>,

    /// Failure domain used as a tie-break when assigning raft roles
    #[serde(default)]
    pub failure_domain: Option<String>,
}

/// Clustering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Interval between heartbeat updates in seconds
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Interval between leader role-rebalance ticks in seconds
    #[serde(default = "default_rebalance_interval_secs")]
    pub rebalance_interval_secs: u64,

    /// Per-request RPC deadline in seconds
    #[serde(default = "default_rpc_timeout_secs")]
    pub rpc_timeout_secs: u64,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Enable the HTTP API
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// HTTP API bind address
    #[serde(default = "default_api_address")]
    pub bind_address: String,
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

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/corral")
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_rebalance_interval_secs() -> u64 {
    30
}

fn default_rpc_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_api_address() -> String {
    "0.0.0.0:8443".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            rebalance_interval_secs: default_rebalance_interval_secs(),
            rpc_timeout_secs: default_rpc_timeout_secs(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_api_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl CorralConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: CorralConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: CorralConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.name.is_empty() {
            return Err(crate::Error::Config("node.name cannot be empty".into()));
        }

        if self.node.name.starts_with('@') {
            return Err(crate::Error::Config(
                "node.name may not start with '@'".into(),
            ));
        }

        if self.node.core_address.is_empty() {
            return Err(crate::Error::Config(
                "node.core_address cannot be empty".into(),
            ));
        }

        Ok(())
    }

    /// Get the address used for intra-cluster traffic
    pub fn cluster_address(&self) -> &str {
        self.node
            .cluster_address
            .as_deref()
            .unwrap_or(&self.node.core_address)
    }

    /// Get the data directory path
    pub fn data_dir(&self) -> &PathBuf {
        &self.node.data_dir
    }

    /// Path of the replicated membership database
    pub fn database_path(&self) -> PathBuf {
        self.node.data_dir.join("global").join("db.bin")
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.heartbeat_interval_secs)
    }

    /// Get rebalance tick interval as Duration
    pub fn rebalance_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.rebalance_interval_secs)
    }

    /// Get the per-request RPC deadline as Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.rpc_timeout_secs)
    }
}

/// Check whether an address is a wildcard bind address that cannot be used
/// as a cluster address advertised to peers.
pub fn is_wildcard_address(address: &str) -> bool {
    let host = address
        .rsplit_once(':')
        .map(|(host, _)| host)
        .unwrap_or(address);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    matches!(host, "" | "0.0.0.0" | "::")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
name = "node-1"
core_address = "10.0.0.1:8443"
data_dir = "/var/lib/corral"

[cluster]
heartbeat_interval_secs = 5

[api]
bind_address = "0.0.0.0:8443"
"#;

        let config = CorralConfig::from_str(toml).unwrap();
        assert_eq!(config.node.name, "node-1");
        assert_eq!(config.cluster_address(), "10.0.0.1:8443");
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_cluster_address_fallback() {
        let toml = r#"
[node]
name = "node-1"
core_address = "10.0.0.1:8443"
cluster_address = "10.0.1.1:8444"
"#;

        let config = CorralConfig::from_str(toml).unwrap();
        assert_eq!(config.cluster_address(), "10.0.1.1:8444");
    }

    #[test]
    fn test_reject_group_prefix_name() {
        let toml = r#"
[node]
name = "@group"
core_address = "10.0.0.1:8443"
"#;

        assert!(CorralConfig::from_str(toml).is_err());
    }

    #[test]
    fn test_wildcard_detection() {
        assert!(is_wildcard_address("0.0.0.0:8443"));
        assert!(is_wildcard_address("[::]:8443"));
        assert!(!is_wildcard_address("10.0.0.1:8443"));
    }
}
