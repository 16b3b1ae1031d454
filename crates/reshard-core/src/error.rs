//! Configuration errors

use thiserror::Error;

use crate::types::ClusterId;

/// Errors raised while building or validating a resharding configuration.
///
/// All of these are fatal at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The logical shard space is empty
    #[error("max_shards must be at least 1")]
    ZeroShards,

    /// The logical shard space does not fit the signed 32-bit hash domain
    #[error("max_shards {0} exceeds the supported maximum {max}", max = i32::MAX)]
    ShardSpaceTooLarge(u32),

    /// A topology with no clusters
    #[error("{which} cluster count must be at least 1")]
    ZeroClusterCount { which: &'static str },

    /// More clusters than logical shards
    #[error("{which} cluster count {count} exceeds max_shards {max_shards}")]
    ClusterCountExceedsShards {
        which: &'static str,
        count: u32,
        max_shards: u32,
    },

    /// The coordination cluster must exist under both topologies
    #[error("coordination cluster {cluster} is not present in a {clusters}-cluster topology")]
    CoordinationClusterOutOfRange { cluster: ClusterId, clusters: u32 },

    /// Supplied connection pools don't line up with the declared topology
    #[error("cluster count and connection pools don't match: expected {expected}, got {actual}")]
    PoolCountMismatch { expected: usize, actual: usize },

    /// An environment or file value could not be parsed
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },

    /// Malformed JSON configuration
    #[error("invalid configuration document: {0}")]
    Json(#[from] serde_json::Error),
}
