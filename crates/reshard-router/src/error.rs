//! Error types for the router module

use reshard_core::{ClusterId, ConfigError};
use thiserror::Error;

/// Failure reported by a cluster connection
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The endpoint could not be reached
    #[error("cluster unavailable: {0}")]
    Unavailable(String),

    /// The round trip did not complete in time
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The store rejected the command
    #[error("command failed: {0}")]
    Command(String),
}

/// One cluster's share of a failed multi-cluster write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterFailure {
    pub cluster: ClusterId,
    pub error: StoreError,
}

impl std::fmt::Display for ClusterFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "cluster {}: {}", self.cluster, self.error)
    }
}

/// Router error types
#[derive(Debug, Error)]
pub enum ReshardError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// A single-cluster operation failed
    #[error("cluster {cluster}: {source}")]
    Store {
        cluster: ClusterId,
        #[source]
        source: StoreError,
    },

    /// The coordination record exists but can't be parsed
    #[error("malformed migration record at {key:?}: {reason}")]
    MalformedRecord { key: String, reason: String },

    /// Concurrent writers kept changing the coordination record during setup
    #[error("migration record at {key:?} kept changing after {attempts} attempts")]
    Contended { key: String, attempts: usize },

    /// A routed cluster id has no connection pool
    #[error("cluster {cluster} has no connection pool ({available} configured)")]
    ClusterOutOfRange { cluster: ClusterId, available: usize },

    /// At least one target of a multi-cluster write failed.
    /// Writes on `succeeded` clusters are not rolled back.
    #[error("write failed on {} cluster(s): {}", .failures.len(), join_failures(.failures))]
    WriteFailed {
        failures: Vec<ClusterFailure>,
        succeeded: Vec<ClusterId>,
    },
}

impl ReshardError {
    /// Attribute a store error to the cluster it came from
    pub fn store(cluster: ClusterId, source: StoreError) -> Self {
        Self::Store { cluster, source }
    }
}

fn join_failures(failures: &[ClusterFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}
