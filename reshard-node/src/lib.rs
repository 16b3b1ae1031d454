//! Reshard Node - Demo client process
//!
//! Stands up one sharded store over in-process clusters and keeps writing
//! through it, so a migration can be watched from the logs:
//! - dual writes while migrating
//! - the forced cutover once the deadline passes
//! - single writes afterwards

use std::sync::Arc;
use std::time::Duration;

use reshard_core::ReshardConfig;
use reshard_router::memory::{MemoryCluster, MemoryConnector};
use reshard_router::{ConnectionPool, Phase, ReshardError, RoundRobinPool, ShardedStore};
use tokio::sync::watch;
use tracing::{info, warn};

/// Connections per cluster pool
pub const POOL_SIZE: usize = 4;

/// Pause between demo writes
const TICK: Duration = Duration::from_secs(1);

/// A client process over its own in-memory clusters
pub struct Node {
    config: ReshardConfig,
    clusters: Vec<Arc<MemoryCluster>>,
    store: ShardedStore,
}

impl Node {
    /// Create the clusters and pools, then connect the store
    pub async fn start(
        config: ReshardConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ReshardError> {
        config.validate()?;
        info!(
            instance = %config.instance_id,
            old_clusters = config.old_cluster_count,
            new_clusters = config.new_cluster_count,
            "Starting reshard node"
        );

        let clusters: Vec<Arc<MemoryCluster>> = (0..config.expected_pool_count())
            .map(|i| Arc::new(MemoryCluster::new(format!("cluster-{}", i))))
            .collect();
        let pools = clusters
            .iter()
            .map(|cluster| {
                let connector = Arc::new(MemoryConnector::new(Arc::clone(cluster)));
                let pool = RoundRobinPool::new(cluster.name(), connector, POOL_SIZE)?;
                Ok(Arc::new(pool) as Arc<dyn ConnectionPool>)
            })
            .collect::<Result<Vec<_>, ReshardError>>()?;

        let store = ShardedStore::connect(config.clone(), pools, shutdown).await?;
        Ok(Self {
            config,
            clusters,
            store,
        })
    }

    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    pub fn phase(&self) -> Phase {
        self.store.phase()
    }

    pub fn store(&self) -> &ShardedStore {
        &self.store
    }

    pub fn clusters(&self) -> &[Arc<MemoryCluster>] {
        &self.clusters
    }

    /// Write and read back one key per tick until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(instance = %self.config.instance_id, phase = %self.phase(), "Reshard node running");

        let mut ticker = tokio::time::interval(TICK);
        let mut sequence: u64 = 0;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(sequence).await;
                    sequence += 1;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(instance = %self.config.instance_id, writes = sequence, "Reshard node stopped");
    }

    async fn tick(&self, sequence: u64) {
        let partition_key = format!("tenant-{}", sequence % 64);
        let key = format!("counter:{}", sequence);
        let targets = self.store.router().write_targets(&partition_key);

        match self.store.set(&partition_key, &key, &sequence.to_string(), None).await {
            Ok(applied) => {
                let read_back = self.store.get(&partition_key, &key).await;
                info!(
                    partition_key = %partition_key,
                    phase = %self.phase(),
                    targets = ?targets,
                    applied,
                    read_back = ?read_back.ok().flatten(),
                    "Demo write"
                );
            }
            Err(e) => warn!(partition_key = %partition_key, error = %e, "Demo write failed"),
        }
    }
}
