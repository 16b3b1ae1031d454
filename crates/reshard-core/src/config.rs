//! Configuration module for resharding clients

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::shard::TopologyMapper;
use crate::types::{
    ClusterId, DEFAULT_COORDINATION_CLUSTER, DEFAULT_MAX_SHARDS, DEFAULT_RECORD_KEY,
    MAX_CUTOVER_WINDOW_MS,
};

/// Resharding configuration for one client process
///
/// `max_shards` must be identical across every instance sharing a cluster set
/// and must never change: it fixes where every key lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReshardConfig {
    /// Instance identifier, used in log fields
    pub instance_id: String,

    /// Size of the logical shard space
    pub max_shards: u32,

    /// Cluster count before the topology change
    pub old_cluster_count: u32,

    /// Target cluster count
    pub new_cluster_count: u32,

    /// How long dual writes run before reads cut over (milliseconds), at most
    /// [`MAX_CUTOVER_WINDOW_MS`]. Only the instance that schedules a migration uses it.
    pub cutover_window_ms: u64,

    /// Back-off before re-reading the coordination record after a failure (milliseconds)
    pub refresh_retry_ms: u64,

    /// Cluster holding the coordination record
    pub coordination_cluster: ClusterId,

    /// Key of the coordination record
    pub record_key: String,
}

impl Default for ReshardConfig {
    fn default() -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().to_string(),
            max_shards: DEFAULT_MAX_SHARDS,
            old_cluster_count: 1,
            new_cluster_count: 1,
            cutover_window_ms: 60 * 60 * 1000,
            refresh_retry_ms: 1000,
            coordination_cluster: DEFAULT_COORDINATION_CLUSTER,
            record_key: DEFAULT_RECORD_KEY.to_string(),
        }
    }
}

impl ReshardConfig {
    /// Create a configuration for an `old → new` cluster change
    pub fn new(max_shards: u32, old_cluster_count: u32, new_cluster_count: u32) -> Self {
        Self {
            max_shards,
            old_cluster_count,
            new_cluster_count,
            ..Self::default()
        }
    }

    /// Set the cutover window
    pub fn with_cutover_window(mut self, window: Duration) -> Self {
        self.cutover_window_ms = saturating_millis(window);
        self
    }

    /// Set the retry back-off used after coordination-store failures
    pub fn with_refresh_retry(mut self, retry: Duration) -> Self {
        self.refresh_retry_ms = saturating_millis(retry);
        self
    }

    /// Set the instance identifier
    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = ReshardConfig::default();

        if let Ok(instance_id) = std::env::var("RESHARD_INSTANCE_ID") {
            config.instance_id = instance_id;
        }
        if let Some(v) = parse_env("RESHARD_MAX_SHARDS")? {
            config.max_shards = v;
        }
        if let Some(v) = parse_env("RESHARD_OLD_CLUSTERS")? {
            config.old_cluster_count = v;
        }
        if let Some(v) = parse_env("RESHARD_NEW_CLUSTERS")? {
            config.new_cluster_count = v;
        }
        if let Some(v) = parse_env("RESHARD_CUTOVER_WINDOW_MS")? {
            config.cutover_window_ms = v;
        }
        if let Some(v) = parse_env("RESHARD_REFRESH_RETRY_MS")? {
            config.refresh_retry_ms = v;
        }
        if let Ok(key) = std::env::var("RESHARD_RECORD_KEY") {
            config.record_key = key;
        }

        Ok(config)
    }

    /// Parse a JSON document; absent fields take their defaults
    pub fn from_json(document: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(document)?)
    }

    /// Check the configuration for construction-time errors
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mapper = TopologyMapper::new(self.max_shards)?;
        if self.max_shards > i32::MAX as u32 {
            return Err(ConfigError::ShardSpaceTooLarge(self.max_shards));
        }
        mapper.check_cluster_count("old", self.old_cluster_count)?;
        mapper.check_cluster_count("new", self.new_cluster_count)?;

        let shared = self.old_cluster_count.min(self.new_cluster_count);
        if self.coordination_cluster >= shared {
            return Err(ConfigError::CoordinationClusterOutOfRange {
                cluster: self.coordination_cluster,
                clusters: shared,
            });
        }
        if self.cutover_window_ms > MAX_CUTOVER_WINDOW_MS {
            return Err(ConfigError::InvalidValue {
                key: "cutover_window_ms".to_string(),
                value: self.cutover_window_ms.to_string(),
            });
        }
        if self.record_key.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "record_key".to_string(),
                value: self.record_key.clone(),
            });
        }
        Ok(())
    }

    /// Number of connection pools the router needs: one per new-topology
    /// cluster, plus the retiring clusters while shrinking.
    pub fn expected_pool_count(&self) -> usize {
        self.old_cluster_count.max(self.new_cluster_count) as usize
    }

    /// Cutover window as a duration
    pub fn cutover_window(&self) -> Duration {
        Duration::from_millis(self.cutover_window_ms)
    }

    /// Retry back-off as a duration
    pub fn refresh_retry(&self) -> Duration {
        Duration::from_millis(self.refresh_retry_ms)
    }
}

fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
