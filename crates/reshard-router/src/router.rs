//! Partition Router
//!
//! Answers "which cluster(s) does this key touch" for the current phase.
//!
//! ```text
//!                 ┌──────────── Migrating ─────────────┐
//! key ─► shard ─► │ read:  cluster_of(shard, old)      │
//!                 │ write: cluster_of(shard, new),     │
//!                 │        cluster_of(shard, old)      │
//!                 └────────────────────────────────────┘
//!                 ┌──────────── CutOver ───────────────┐
//!                 │ read:  cluster_of(shard, new)      │
//!                 │ write: cluster_of(shard, new)      │
//!                 └────────────────────────────────────┘
//! ```

use std::sync::Arc;

use reshard_core::{ClusterId, ReshardConfig, ShardHasher, ShardId, TopologyMapper};
use tracing::debug;

use crate::coordinator::{CutoverCoordinator, Phase};
use crate::error::ReshardError;

/// Clusters a write must land on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteTargets {
    /// New topology only
    Single(ClusterId),
    /// Dual write while migrating: future location first, current location second
    Dual { new: ClusterId, old: ClusterId },
}

impl WriteTargets {
    /// Targets in order, new topology first
    pub fn to_vec(&self) -> Vec<ClusterId> {
        match *self {
            WriteTargets::Single(cluster) => vec![cluster],
            WriteTargets::Dual { new, old } => vec![new, old],
        }
    }

    /// Targets with a coinciding new/old cluster listed once
    pub fn distinct(&self) -> Vec<ClusterId> {
        match *self {
            WriteTargets::Dual { new, old } if new == old => vec![new],
            _ => self.to_vec(),
        }
    }

    pub fn is_dual(&self) -> bool {
        matches!(self, WriteTargets::Dual { .. })
    }
}

/// Maps partition keys to clusters under the coordinator's live phase
pub struct PartitionRouter {
    hasher: ShardHasher,
    mapper: TopologyMapper,
    coordinator: Arc<CutoverCoordinator>,
}

impl PartitionRouter {
    pub fn new(
        config: &ReshardConfig,
        coordinator: Arc<CutoverCoordinator>,
    ) -> Result<Self, ReshardError> {
        let hasher = ShardHasher::new(config.max_shards)?;
        let mapper = TopologyMapper::new(config.max_shards)?;
        let topology = coordinator.topology();
        mapper.check_cluster_count("old", topology.old_cluster_count)?;
        mapper.check_cluster_count("new", topology.new_cluster_count)?;

        Ok(Self {
            hasher,
            mapper,
            coordinator,
        })
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        self.coordinator.phase()
    }

    /// The coordinator this router follows
    pub fn coordinator(&self) -> &Arc<CutoverCoordinator> {
        &self.coordinator
    }

    /// Logical shard for a partition key
    pub fn shard(&self, partition_key: &str) -> ShardId {
        self.hasher.shard(partition_key)
    }

    /// The single cluster authoritative for reads of this key
    pub fn read_target(&self, partition_key: &str) -> ClusterId {
        self.read_target_for_shard(self.shard(partition_key))
    }

    /// The cluster(s) a write of this key must reach
    pub fn write_targets(&self, partition_key: &str) -> WriteTargets {
        self.write_targets_for_shard(self.shard(partition_key))
    }

    pub fn read_target_for_shard(&self, shard: ShardId) -> ClusterId {
        let topology = self.coordinator.topology();
        let phase = self.phase();
        let count = match phase {
            Phase::Migrating => topology.old_cluster_count,
            Phase::CutOver => topology.new_cluster_count,
        };
        let cluster = self.mapper.cluster_of(shard, count);
        debug!(shard, cluster, %phase, "Read routed");
        cluster
    }

    pub fn write_targets_for_shard(&self, shard: ShardId) -> WriteTargets {
        let topology = self.coordinator.topology();
        let new = self.mapper.cluster_of(shard, topology.new_cluster_count);
        let targets = match self.phase() {
            Phase::CutOver => WriteTargets::Single(new),
            Phase::Migrating => WriteTargets::Dual {
                new,
                old: self.mapper.cluster_of(shard, topology.old_cluster_count),
            },
        };
        debug!(shard, targets = ?targets, "Write routed");
        targets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RoundRobinPool;
    use crate::memory::{MemoryCluster, MemoryConnector};
    use crate::record::{MigrationRecord, RecordStore};
    use std::time::Duration;
    use tokio::sync::watch;

    async fn router_with(record: Option<MigrationRecord>, old: u32, new: u32) -> PartitionRouter {
        let cluster = Arc::new(MemoryCluster::new("c0"));
        let connector = Arc::new(MemoryConnector::new(cluster));
        let pool = RoundRobinPool::new("coord", connector, 1).unwrap();
        let records = RecordStore::new("DataMigrationMeta", 0, Arc::new(pool));
        if let Some(record) = record {
            records.store(&record).await.unwrap();
        }

        let config = ReshardConfig::new(1024, old, new)
            .with_cutover_window(Duration::from_secs(60));
        let (_tx, rx) = watch::channel(false);
        let pools = config.expected_pool_count();
        let coordinator = CutoverCoordinator::start(&config, records, pools, rx)
            .await
            .unwrap();
        PartitionRouter::new(&config, Arc::new(coordinator)).unwrap()
    }

    #[test]
    fn test_write_targets_order_and_distinct() {
        let dual = WriteTargets::Dual { new: 1, old: 0 };
        assert_eq!(dual.to_vec(), vec![1, 0]);
        assert_eq!(dual.distinct(), vec![1, 0]);
        assert!(dual.is_dual());

        let same = WriteTargets::Dual { new: 0, old: 0 };
        assert_eq!(same.to_vec(), vec![0, 0]);
        assert_eq!(same.distinct(), vec![0]);

        assert_eq!(WriteTargets::Single(3).to_vec(), vec![3]);
    }

    #[tokio::test]
    async fn test_migrating_routes_reads_old_and_writes_both() {
        let router = router_with(Some(MigrationRecord::settled(2)), 2, 4).await;
        assert_eq!(router.phase(), Phase::Migrating);

        assert_eq!(router.read_target_for_shard(300), 0);
        assert_eq!(
            router.write_targets_for_shard(300),
            WriteTargets::Dual { new: 1, old: 0 }
        );
    }

    #[tokio::test]
    async fn test_cut_over_routes_to_new_topology() {
        let router = router_with(Some(MigrationRecord::settled(4)), 2, 4).await;
        assert_eq!(router.phase(), Phase::CutOver);

        assert_eq!(router.read_target_for_shard(300), 1);
        assert_eq!(router.write_targets_for_shard(300), WriteTargets::Single(1));
    }

    #[tokio::test]
    async fn test_key_routing_matches_shard_routing() {
        let router = router_with(None, 4, 4).await;

        for i in 0..200 {
            let key = format!("tenant:{}", i);
            let shard = router.shard(&key);
            assert!(shard < 1024);
            assert_eq!(router.read_target(&key), router.read_target_for_shard(shard));
            assert_eq!(router.write_targets(&key), WriteTargets::Single(router.read_target(&key)));
            assert!(router.read_target(&key) < 4);
        }
    }
}
