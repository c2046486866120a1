// Configuration module for the hypergraph storage node
//
// Loads and validates the node configuration. Files are TOML; `Config::load`
// additionally layers `HGNODE__SECTION__KEY` environment overrides on top.

use crate::error::{Result, StorageNodeError};
use crate::types::{NodeId, PartitionStrategy, ReplicationStrategy, SyncStrategy, MAX_STALE_THRESHOLD_MINUTES};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Storage node configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,
    /// Local store configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cluster membership, placement and synchronization settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Cluster identifier shared by all members
    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,
    /// Node identifier; a UUID is generated when absent
    #[serde(default)]
    pub node_id: Option<NodeId>,
    /// Host other peers use to reach this node
    #[serde(default = "default_host")]
    pub host: String,
    /// Peer protocol port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Human-readable node name
    #[serde(default)]
    pub display_name: Option<String>,
    /// Conflict resolution strategy
    #[serde(default = "default_sync_strategy")]
    pub sync_strategy: SyncStrategy,
    /// Owner selection strategy
    #[serde(default = "default_partition_strategy")]
    pub partition_strategy: PartitionStrategy,
    /// Replica selection strategy
    #[serde(default = "default_replication_strategy")]
    pub replication_strategy: ReplicationStrategy,
    /// Total copies per key, owner included
    #[serde(default = "default_replication_factor")]
    pub replication_factor: usize,
    /// Seconds between heartbeat broadcasts
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_seconds: u64,
    /// Seconds between stale-peer cleanup passes
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
    /// Minutes without a heartbeat before a peer is evicted
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_minutes: u64,
    /// Seconds between sync queue flushes
    #[serde(default = "default_sync_interval")]
    pub sync_interval_seconds: u64,
    /// Upper bound on any single peer call, in milliseconds
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_ms: u64,
    /// Upper bound on a broadcast fetch, in milliseconds
    #[serde(default = "default_fetch_broadcast_timeout")]
    pub fetch_broadcast_timeout_ms: u64,
    /// Maximum peers queried by a broadcast fetch
    #[serde(default = "default_max_broadcast_fetch_peers")]
    pub max_broadcast_fetch_peers: usize,
    /// Seconds an undelivered sync operation is retried before it expires
    #[serde(default = "default_sync_operation_ttl")]
    pub sync_operation_ttl_seconds: u64,
    /// Points each node occupies on the consistent-hash ring
    #[serde(default = "default_ring_points")]
    pub ring_points_per_node: usize,
    /// Peers contacted on startup, as "host:port"
    #[serde(default)]
    pub seed_peers: Vec<String>,
}

/// Local knowledge store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Store engine ("memory" or "sqlite")
    #[serde(default = "default_engine")]
    pub engine: String,
    /// Path to the database file for the sqlite engine
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (json, text)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default values
fn default_cluster_id() -> String {
    "hypergraph".to_string()
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7420
}

fn default_sync_strategy() -> SyncStrategy {
    SyncStrategy::VectorClock
}

fn default_partition_strategy() -> PartitionStrategy {
    PartitionStrategy::HashBased
}

fn default_replication_strategy() -> ReplicationStrategy {
    ReplicationStrategy::PrimaryBackup
}

fn default_replication_factor() -> usize {
    2
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_stale_threshold() -> u64 {
    5
}

fn default_sync_interval() -> u64 {
    10
}

fn default_peer_timeout() -> u64 {
    3000
}

fn default_fetch_broadcast_timeout() -> u64 {
    5000
}

fn default_max_broadcast_fetch_peers() -> usize {
    16
}

fn default_sync_operation_ttl() -> u64 {
    600
}

fn default_ring_points() -> usize {
    32
}

fn default_engine() -> String {
    "memory".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("data/atoms.db")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_id: default_cluster_id(),
            node_id: None,
            host: default_host(),
            port: default_port(),
            display_name: None,
            sync_strategy: default_sync_strategy(),
            partition_strategy: default_partition_strategy(),
            replication_strategy: default_replication_strategy(),
            replication_factor: default_replication_factor(),
            heartbeat_interval_seconds: default_heartbeat_interval(),
            cleanup_interval_seconds: default_cleanup_interval(),
            stale_threshold_minutes: default_stale_threshold(),
            sync_interval_seconds: default_sync_interval(),
            peer_timeout_ms: default_peer_timeout(),
            fetch_broadcast_timeout_ms: default_fetch_broadcast_timeout(),
            max_broadcast_fetch_peers: default_max_broadcast_fetch_peers(),
            sync_operation_ttl_seconds: default_sync_operation_ttl(),
            ring_points_per_node: default_ring_points(),
            seed_peers: Vec::new(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            engine: default_engine(),
            database_path: default_database_path(),
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

impl ClusterConfig {
    /// Configured node id, or a fresh UUID when none is set.
    ///
    /// The generated id is written back so repeated calls agree.
    pub fn resolved_node_id(&mut self) -> NodeId {
        if let Some(id) = self.node_id.as_ref().filter(|id| !id.is_empty()) {
            return id.clone();
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.node_id = Some(id.clone());
        id
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_seconds)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_timeout_ms)
    }

    pub fn fetch_broadcast_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_broadcast_timeout_ms)
    }

    pub fn sync_operation_ttl(&self) -> Duration {
        Duration::from_secs(self.sync_operation_ttl_seconds)
    }

    /// Check the settings the cluster layer cannot run without
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(StorageNodeError::Config("cluster_id must not be empty".into()));
        }
        if self.replication_factor == 0 {
            return Err(StorageNodeError::Config(
                "replication_factor must be at least 1".into(),
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(StorageNodeError::Config(
                "heartbeat_interval_seconds must be positive".into(),
            ));
        }
        if self.ring_points_per_node == 0 {
            return Err(StorageNodeError::Config(
                "ring_points_per_node must be positive".into(),
            ));
        }
        // Periods handed to tokio interval timers and request timeouts
        let periods = [
            ("cleanup_interval_seconds", self.cleanup_interval_seconds),
            ("sync_interval_seconds", self.sync_interval_seconds),
            ("peer_timeout_ms", self.peer_timeout_ms),
            ("fetch_broadcast_timeout_ms", self.fetch_broadcast_timeout_ms),
        ];
        if let Some((name, _)) = periods.iter().find(|(_, value)| *value == 0) {
            return Err(StorageNodeError::Config(format!("{} must be positive", name)));
        }
        if self.stale_threshold_minutes > MAX_STALE_THRESHOLD_MINUTES {
            return Err(StorageNodeError::Config(format!(
                "stale_threshold_minutes must not exceed {}",
                MAX_STALE_THRESHOLD_MINUTES
            )));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_str = fs::read_to_string(path)
            .map_err(|e| StorageNodeError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&config_str)
            .map_err(|e| StorageNodeError::Config(format!("Failed to parse config: {}", e)))?;

        config.cluster.validate()?;
        Ok(config)
    }

    /// Load configuration from a file with environment overrides
    ///
    /// `HGNODE__CLUSTER__PORT=7500` overrides `cluster.port`.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()).required(false))
            .add_source(config::Environment::with_prefix("HGNODE").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.cluster.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let config_str = toml::to_string_pretty(self)
            .map_err(|e| StorageNodeError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, config_str)
            .map_err(|e| StorageNodeError::Config(format!("Failed to write config file: {}", e)))?;

        Ok(())
    }
}

/// Generate a default configuration file at the given path if it doesn't exist
pub fn ensure_default_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    if !path.as_ref().exists() {
        let default_config = Config::default();
        default_config.to_file(&path)?;
        return Ok(default_config);
    }

    Config::from_file(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClusterConfig::default();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(config.replication_strategy, ReplicationStrategy::PrimaryBackup);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_replication() {
        let config = ClusterConfig {
            replication_factor: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StorageNodeError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_zero_periods() {
        let zeroed: [(&str, fn(&mut ClusterConfig)); 4] = [
            ("cleanup_interval_seconds", |c| c.cleanup_interval_seconds = 0),
            ("sync_interval_seconds", |c| c.sync_interval_seconds = 0),
            ("peer_timeout_ms", |c| c.peer_timeout_ms = 0),
            ("fetch_broadcast_timeout_ms", |c| c.fetch_broadcast_timeout_ms = 0),
        ];
        for (name, zero) in zeroed {
            let mut config = ClusterConfig::default();
            zero(&mut config);
            match config.validate() {
                Err(StorageNodeError::Config(message)) => assert!(message.contains(name), "{}", message),
                other => panic!("{} = 0 accepted: {:?}", name, other),
            }
        }
    }

    #[test]
    fn test_validate_rejects_huge_stale_threshold() {
        let config = ClusterConfig {
            stale_threshold_minutes: u64::MAX,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StorageNodeError::Config(_))));

        let config = ClusterConfig {
            stale_threshold_minutes: MAX_STALE_THRESHOLD_MINUTES,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolved_node_id_is_stable() {
        let mut config = ClusterConfig::default();
        let first = config.resolved_node_id();
        assert!(uuid::Uuid::parse_str(&first).is_ok());
        assert_eq!(config.resolved_node_id(), first);

        let mut named = ClusterConfig {
            node_id: Some("node-a".into()),
            ..Default::default()
        };
        assert_eq!(named.resolved_node_id(), "node-a");
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [cluster]
            cluster_id = "t1"
            partition_strategy = "TypeBased"
            replication_strategy = "QuorumBased"
            replication_factor = 3
            "#,
        )
        .unwrap();
        assert_eq!(config.cluster.cluster_id, "t1");
        assert_eq!(config.cluster.partition_strategy, PartitionStrategy::TypeBased);
        assert_eq!(config.cluster.replication_strategy, ReplicationStrategy::QuorumBased);
        assert_eq!(config.cluster.port, 7420);
        assert_eq!(config.storage.engine, "memory");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_round_trip_and_default_creation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.toml");

        let created = ensure_default_config(&path).unwrap();
        assert!(path.exists());

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.cluster.cluster_id, created.cluster.cluster_id);

        let layered = Config::load(&path).unwrap();
        assert_eq!(layered.cluster.port, created.cluster.port);
    }
}
