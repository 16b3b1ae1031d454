//! Common types shared by the resharding crates

/// Logical shard identifier, in `[0, max_shards)`
pub type ShardId = u32;

/// Physical cluster identifier, an index into the per-cluster pool array
pub type ClusterId = u32;

/// Default size of the logical shard space
pub const DEFAULT_MAX_SHARDS: u32 = 1024;

/// Well-known key of the coordination record
pub const DEFAULT_RECORD_KEY: &str = "DataMigrationMeta";

/// Cluster holding the coordination record (present in every topology)
pub const DEFAULT_COORDINATION_CLUSTER: ClusterId = 0;

/// Deadline sentinel: no cutover scheduled
pub const NO_DEADLINE: i64 = -1;

/// Longest accepted cutover window: one year
pub const MAX_CUTOVER_WINDOW_MS: u64 = 365 * 24 * 60 * 60 * 1000;
