//! Reshard Core - Shared building blocks for live resharding
//!
//! This crate holds the pure, I/O-free pieces used by `reshard-router`:
//!
//! - [`ShardHasher`]: key → logical shard id (SHA-256, fixed shard space)
//! - [`TopologyMapper`]: logical shard id → physical cluster id for a cluster count
//! - [`ReshardConfig`]: construction-time configuration and its validation
//!
//! ```text
//! partition key ──► ShardHasher ──► ShardId ──► TopologyMapper(count) ──► ClusterId
//! ```

pub mod config;
pub mod error;
pub mod shard;
pub mod types;

pub use config::ReshardConfig;
pub use error::ConfigError;
pub use shard::{cluster_of, ShardHasher, TopologyMapper};
pub use types::{
    ClusterId, ShardId, DEFAULT_COORDINATION_CLUSTER, DEFAULT_MAX_SHARDS, DEFAULT_RECORD_KEY,
    MAX_CUTOVER_WINDOW_MS, NO_DEADLINE,
};
