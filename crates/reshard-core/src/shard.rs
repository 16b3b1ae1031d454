//! Shard placement
//!
//! Two-level placement:
//!
//! 1. A partition key hashes into a fixed logical shard space (`max_shards`).
//!    This level never changes for the lifetime of a deployment.
//! 2. A logical shard maps onto a physical cluster for a given cluster count.
//!    Each cluster owns one contiguous run of shards, so growing or shrinking
//!    the cluster count only moves the shards at the edges of each run.

use std::ops::Range;

use sha2::{Digest, Sha256};
use tracing::trace;

use crate::error::ConfigError;
use crate::types::{ClusterId, ShardId};

/// Maps partition keys into the logical shard space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardHasher {
    max_shards: u32,
}

impl ShardHasher {
    /// Create a hasher over `[0, max_shards)`
    pub fn new(max_shards: u32) -> Result<Self, ConfigError> {
        if max_shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        if max_shards > i32::MAX as u32 {
            return Err(ConfigError::ShardSpaceTooLarge(max_shards));
        }
        Ok(Self { max_shards })
    }

    /// Size of the logical shard space
    pub fn max_shards(&self) -> u32 {
        self.max_shards
    }

    /// SHA-256 of the UTF-8 key, first four digest bytes read as a
    /// little-endian `i32`. May be negative.
    pub fn raw_hash(key: &str) -> i32 {
        let digest = Sha256::digest(key.as_bytes());
        i32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
    }

    /// Logical shard for a key, always in `[0, max_shards)`
    pub fn shard(&self, key: &str) -> ShardId {
        let hash = Self::raw_hash(key);
        // rem_euclid keeps negative hashes inside the shard space
        let shard = hash.rem_euclid(self.max_shards as i32) as ShardId;
        trace!(key = %key, hash, shard, "Shard lookup");
        shard
    }
}

/// `floor(shard_id * cluster_count / max_shards)`
///
/// Computed in 64 bits so large shard spaces cannot overflow.
pub fn cluster_of(shard_id: ShardId, cluster_count: u32, max_shards: u32) -> ClusterId {
    ((shard_id as u64 * cluster_count as u64) / max_shards as u64) as ClusterId
}

/// Maps logical shards onto physical clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyMapper {
    max_shards: u32,
}

impl TopologyMapper {
    /// Create a mapper for a fixed shard space
    pub fn new(max_shards: u32) -> Result<Self, ConfigError> {
        if max_shards == 0 {
            return Err(ConfigError::ZeroShards);
        }
        Ok(Self { max_shards })
    }

    /// Check that `cluster_count` can be laid over the shard space
    pub fn check_cluster_count(
        &self,
        which: &'static str,
        cluster_count: u32,
    ) -> Result<(), ConfigError> {
        if cluster_count == 0 {
            return Err(ConfigError::ZeroClusterCount { which });
        }
        if cluster_count > self.max_shards {
            return Err(ConfigError::ClusterCountExceedsShards {
                which,
                count: cluster_count,
                max_shards: self.max_shards,
            });
        }
        Ok(())
    }

    /// Cluster owning `shard_id` when the topology has `cluster_count` clusters
    pub fn cluster_of(&self, shard_id: ShardId, cluster_count: u32) -> ClusterId {
        cluster_of(shard_id, cluster_count, self.max_shards)
    }

    /// The contiguous run of shards owned by `cluster_id`.
    ///
    /// Shard `s` belongs to cluster `c` iff `c*m <= s*n < (c+1)*m`, so the run
    /// starts at `ceil(c*m / n)`.
    pub fn shard_range(&self, cluster_id: ClusterId, cluster_count: u32) -> Range<ShardId> {
        let m = self.max_shards as u64;
        let n = cluster_count as u64;
        let start = (cluster_id as u64 * m).div_ceil(n);
        let end = ((cluster_id as u64 + 1) * m).div_ceil(n).min(m);
        start as ShardId..end as ShardId
    }
}
