//! Reshard Router - Live resharding over a partitioned key-value cluster set
//!
//! Lets an application use one logical keyspace while the number of physical
//! clusters behind it grows or shrinks, without downtime.
//!
//! # Architecture
//!
//! ```text
//! (partition key, command)
//!     │
//!     ▼
//! ┌─────────────────────────┐
//! │      ShardedStore       │  Reads: one cluster. Writes: every target, AND-ed
//! └───────────┬─────────────┘
//!             │
//!             ▼
//! ┌─────────────────────────┐
//! │    PartitionRouter      │  key → shard → cluster(s) for the current phase
//! └───────────┬─────────────┘
//!             │
//!             ▼
//! ┌─────────────────────────┐
//! │  CutoverCoordinator     │  Migrating / CutOver, converged through the
//! │                         │  migration record on the coordination cluster
//! └─────────────────────────┘
//! ```
//!
//! # Migration protocol
//!
//! While migrating, reads stay on the old topology and every write lands on
//! both the new and the old location. Once the cutover deadline passes, the
//! first instance to notice flips the shared record and every other instance
//! picks the flip up on its next wake. From then on only the new topology is
//! used.
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard_router::{ShardedStore, CommandFlags};
//!
//! let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
//! let store = ShardedStore::connect(config, pools, shutdown_rx).await?;
//!
//! store.set("tenant-42", "session:9", "payload", None).await?;
//! let value = store.get("tenant-42", "session:9").await?;
//! ```

// Core modules
mod error;
mod record;

// Collaborators
mod connection;
pub mod memory;

// Coordination and routing
mod command;
mod coordinator;
mod router;
mod store;

// Re-exports: Error types
pub use error::{ClusterFailure, ReshardError, StoreError};

// Re-exports: Collaborators
pub use connection::{
    CasOutcome, CommandFlags, ConnectionPool, Connector, HashEntry, KvConnection, RoundRobinPool,
};

// Re-exports: Coordination record
pub use record::{MigrationRecord, RecordStore, StoredRecord};

// Re-exports: Coordination, routing, facade
pub use command::{Command, CommandShape, Reply};
pub use coordinator::{epoch_millis, CutoverCoordinator, Phase, Topology};
pub use router::{PartitionRouter, WriteTargets};
pub use store::{ClusterOutcome, ShardedStore, WriteReport};

// Re-exports: core building blocks
pub use reshard_core::{
    ClusterId, ConfigError, ReshardConfig, ShardHasher, ShardId, TopologyMapper,
};
