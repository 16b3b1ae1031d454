//! Sharded Store
//!
//! The public command surface. Reads go to the one authoritative cluster;
//! writes go to every routed target and succeed only if all of them do.
//!
//! A failed target is never retried here and a successful one is never rolled
//! back: the caller gets an aggregate failure naming each failing cluster and
//! decides what to retry.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use reshard_core::{ClusterId, ConfigError, ReshardConfig};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::command::{Command, CommandShape, Reply};
use crate::connection::{CommandFlags, ConnectionPool, HashEntry};
use crate::coordinator::{CutoverCoordinator, Phase};
use crate::error::{ClusterFailure, ReshardError, StoreError};
use crate::record::RecordStore;
use crate::router::{PartitionRouter, WriteTargets};

/// One target's result within a write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterOutcome {
    pub cluster: ClusterId,
    /// The store's success indicator, or why the call failed
    pub result: Result<bool, StoreError>,
}

/// Per-cluster results of a routed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReport {
    pub targets: WriteTargets,
    pub outcomes: Vec<ClusterOutcome>,
}

impl WriteReport {
    /// Every target was reached and reported success
    pub fn succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result == Ok(true))
    }

    /// Targets whose call failed outright
    pub fn failures(&self) -> Vec<ClusterFailure> {
        self.outcomes
            .iter()
            .filter_map(|o| match &o.result {
                Err(error) => Some(ClusterFailure {
                    cluster: o.cluster,
                    error: error.clone(),
                }),
                Ok(_) => None,
            })
            .collect()
    }

    /// Collapse into the aggregate result: an error if any call failed,
    /// otherwise the AND of the per-cluster success indicators.
    pub fn into_result(self) -> Result<bool, ReshardError> {
        let failures = self.failures();
        if !failures.is_empty() {
            let succeeded = self
                .outcomes
                .iter()
                .filter(|o| o.result.is_ok())
                .map(|o| o.cluster)
                .collect();
            return Err(ReshardError::WriteFailed {
                failures,
                succeeded,
            });
        }
        Ok(self.succeeded())
    }
}

/// Single logical keyspace over a resharding cluster set
pub struct ShardedStore {
    router: PartitionRouter,
    pools: Vec<Arc<dyn ConnectionPool>>,
}

impl ShardedStore {
    /// Validate the configuration, settle the migration phase and start
    /// converging in the background if a migration is in flight.
    ///
    /// `pools[i]` serves cluster `i`. There must be one per new-topology
    /// cluster, plus the retiring ones while shrinking.
    pub async fn connect(
        config: ReshardConfig,
        pools: Vec<Arc<dyn ConnectionPool>>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ReshardError> {
        config.validate()?;
        let expected = config.expected_pool_count();
        if pools.len() != expected {
            return Err(ConfigError::PoolCountMismatch {
                expected,
                actual: pools.len(),
            }
            .into());
        }

        let records = RecordStore::for_config(&config, &pools)?;
        let coordinator =
            CutoverCoordinator::start(&config, records, pools.len(), shutdown).await?;

        let router = PartitionRouter::new(&config, Arc::new(coordinator))?;
        info!(
            instance = %config.instance_id,
            phase = %router.phase(),
            clusters = pools.len(),
            "Sharded store ready"
        );
        Ok(Self { router, pools })
    }

    /// Current migration phase
    pub fn phase(&self) -> Phase {
        self.router.phase()
    }

    pub fn router(&self) -> &PartitionRouter {
        &self.router
    }

    pub fn coordinator(&self) -> &Arc<CutoverCoordinator> {
        self.router.coordinator()
    }

    /// Route and run one command
    pub async fn execute(
        &self,
        partition_key: &str,
        command: Command,
    ) -> Result<Reply, ReshardError> {
        match command.shape() {
            CommandShape::Read => self
                .read(partition_key, &command)
                .await
                .map(|(_, reply)| reply),
            CommandShape::Write => self
                .write_report(partition_key, &command)
                .await?
                .into_result()
                .map(Reply::Done),
        }
    }

    /// Run a write on every routed target and report each outcome.
    ///
    /// Targets are written concurrently; a failure on one never stops the
    /// others. A new/old pair on the same cluster is written once.
    pub async fn write_report(
        &self,
        partition_key: &str,
        command: &Command,
    ) -> Result<WriteReport, ReshardError> {
        let targets = self.router.write_targets(partition_key);
        let clusters = targets.distinct();
        for &cluster in &clusters {
            self.pool(cluster)?;
        }

        let outcomes = join_all(clusters.into_iter().map(|cluster| async move {
            let result = self
                .run_on(cluster, command)
                .await
                .map(|reply| reply.is_success());
            if let Err(error) = &result {
                warn!(
                    cluster,
                    command = command.name(),
                    key = %command.key(),
                    %error,
                    "Write failed on cluster"
                );
            }
            ClusterOutcome { cluster, result }
        }))
        .await;

        debug!(
            command = command.name(),
            targets = ?targets,
            dual = targets.is_dual(),
            "Write dispatched"
        );
        Ok(WriteReport { targets, outcomes })
    }

    /// Read a string value
    pub async fn get(
        &self,
        partition_key: &str,
        key: &str,
    ) -> Result<Option<String>, ReshardError> {
        match self.read(partition_key, &Command::get(key)).await? {
            (_, Reply::Value(value)) => Ok(value),
            (cluster, other) => Err(unexpected_reply(cluster, "GET", other)),
        }
    }

    /// Write a string value with an optional time-to-live
    pub async fn set(
        &self,
        partition_key: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, ReshardError> {
        self.write(partition_key, Command::set(key, value, ttl)).await
    }

    /// Set a key's time-to-live on every target
    pub async fn expire(
        &self,
        partition_key: &str,
        key: &str,
        ttl: Duration,
        flags: CommandFlags,
    ) -> Result<bool, ReshardError> {
        self.write(partition_key, Command::expire(key, ttl, flags)).await
    }

    /// Delete a key on every target
    pub async fn delete(
        &self,
        partition_key: &str,
        key: &str,
        flags: CommandFlags,
    ) -> Result<bool, ReshardError> {
        self.write(partition_key, Command::delete(key, flags)).await
    }

    /// Read hash fields from the authoritative cluster, unmodified
    pub async fn hash_get(
        &self,
        partition_key: &str,
        key: &str,
        fields: &[String],
        flags: CommandFlags,
    ) -> Result<Vec<Option<String>>, ReshardError> {
        let command = Command::hash_get(key, fields.to_vec(), flags);
        match self.read(partition_key, &command).await? {
            (_, Reply::Values(values)) => Ok(values),
            (cluster, other) => Err(unexpected_reply(cluster, "HMGET", other)),
        }
    }

    /// Write hash fields on every target
    pub async fn hash_set(
        &self,
        partition_key: &str,
        key: &str,
        entries: &[HashEntry],
        flags: CommandFlags,
    ) -> Result<bool, ReshardError> {
        self.write(partition_key, Command::hash_set(key, entries.to_vec(), flags))
            .await
    }

    async fn read(
        &self,
        partition_key: &str,
        command: &Command,
    ) -> Result<(ClusterId, Reply), ReshardError> {
        let cluster = self.router.read_target(partition_key);
        self.pool(cluster)?;
        let reply = self
            .run_on(cluster, command)
            .await
            .map_err(|e| ReshardError::store(cluster, e))?;
        Ok((cluster, reply))
    }

    async fn write(&self, partition_key: &str, command: Command) -> Result<bool, ReshardError> {
        self.write_report(partition_key, &command).await?.into_result()
    }

    async fn run_on(&self, cluster: ClusterId, command: &Command) -> Result<Reply, StoreError> {
        let pool = self.pool(cluster).map_err(|e| StoreError::Command(e.to_string()))?;
        let connection = pool.connection().await?;
        command.apply(connection.as_ref()).await
    }

    fn pool(&self, cluster: ClusterId) -> Result<&Arc<dyn ConnectionPool>, ReshardError> {
        self.pools
            .get(cluster as usize)
            .ok_or_else(|| ReshardError::ClusterOutOfRange {
                cluster,
                available: self.pools.len(),
            })
    }
}

fn unexpected_reply(cluster: ClusterId, command: &str, reply: Reply) -> ReshardError {
    ReshardError::Store {
        cluster,
        source: StoreError::Command(format!("unexpected {} reply: {:?}", command, reply)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::RoundRobinPool;
    use crate::memory::{MemoryCluster, MemoryConnector};
    use crate::record::MigrationRecord;

    struct Fixture {
        clusters: Vec<Arc<MemoryCluster>>,
        pools: Vec<Arc<dyn ConnectionPool>>,
    }

    impl Fixture {
        fn new(count: usize) -> Self {
            let clusters: Vec<_> = (0..count)
                .map(|i| Arc::new(MemoryCluster::new(format!("c{}", i))))
                .collect();
            let pools = clusters
                .iter()
                .map(|c| {
                    let connector = Arc::new(MemoryConnector::new(Arc::clone(c)));
                    let pool = RoundRobinPool::new(c.name(), connector, 2).unwrap();
                    Arc::new(pool) as Arc<dyn ConnectionPool>
                })
                .collect();
            Self { clusters, pools }
        }

        async fn seed(&self, record: MigrationRecord) {
            RecordStore::new("DataMigrationMeta", 0, Arc::clone(&self.pools[0]))
                .store(&record)
                .await
                .unwrap();
        }

        async fn store(&self, old: u32, new: u32) -> Result<ShardedStore, ReshardError> {
            let config = ReshardConfig::new(1024, old, new)
                .with_cutover_window(Duration::from_secs(60));
            let (_tx, rx) = watch::channel(false);
            ShardedStore::connect(config, self.pools.clone(), rx).await
        }
    }

    /// A partition key whose shard is `shard`
    fn key_for_shard(store: &ShardedStore, shard: u32) -> String {
        (0..200_000)
            .map(|i| format!("pk-{}", i))
            .find(|k| store.router().shard(k) == shard)
            .expect("key for shard")
    }

    #[tokio::test]
    async fn test_pool_count_must_match() {
        let fixture = Fixture::new(3);
        let result = fixture.store(2, 4).await;
        assert!(matches!(
            result,
            Err(ReshardError::Config(ConfigError::PoolCountMismatch { expected: 4, actual: 3 }))
        ));
    }

    #[tokio::test]
    async fn test_recorded_old_topology_beyond_pools_leaves_record_alone() {
        let fixture = Fixture::new(4);
        fixture.seed(MigrationRecord::settled(8)).await;

        let result = fixture.store(2, 4).await;

        assert!(matches!(
            result,
            Err(ReshardError::Config(ConfigError::PoolCountMismatch { expected: 8, actual: 4 }))
        ));
        let record = RecordStore::new("DataMigrationMeta", 0, Arc::clone(&fixture.pools[0]))
            .load()
            .await
            .unwrap();
        assert_eq!(record, Some(MigrationRecord::settled(8)));
    }

    #[tokio::test]
    async fn test_stable_reads_and_writes_single_cluster() {
        let fixture = Fixture::new(2);
        let store = fixture.store(2, 2).await.unwrap();
        assert_eq!(store.phase(), Phase::CutOver);

        assert!(store.set("user:1", "name", "ada", None).await.unwrap());
        assert_eq!(store.get("user:1", "name").await.unwrap(), Some("ada".to_string()));

        let home = store.router().read_target("user:1") as usize;
        assert!(fixture.clusters[home].contains_key("name"));
        assert!(!fixture.clusters[1 - home].contains_key("name"));
    }

    #[tokio::test]
    async fn test_migrating_dual_writes_and_reads_old() {
        let fixture = Fixture::new(4);
        fixture.seed(MigrationRecord::settled(2)).await;
        let store = fixture.store(2, 4).await.unwrap();
        assert_eq!(store.phase(), Phase::Migrating);

        let pk = key_for_shard(&store, 300);
        let report = store
            .write_report(&pk, &Command::set("doc", "v1", None))
            .await
            .unwrap();
        assert_eq!(report.targets, WriteTargets::Dual { new: 1, old: 0 });
        assert!(report.succeeded());

        assert!(fixture.clusters[0].contains_key("doc"));
        assert!(fixture.clusters[1].contains_key("doc"));
        assert_eq!(store.router().read_target(&pk), 0);
        assert_eq!(store.get(&pk, "doc").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_failed_old_target_fails_the_write_without_rollback() {
        let fixture = Fixture::new(4);
        fixture.seed(MigrationRecord::settled(2)).await;
        let store = fixture.store(2, 4).await.unwrap();
        let pk = key_for_shard(&store, 300);

        fixture.clusters[0].set_available(false);
        let result = store.set(&pk, "doc", "v1", None).await;

        match result {
            Err(ReshardError::WriteFailed { failures, succeeded }) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].cluster, 0);
                assert_eq!(succeeded, vec![1]);
            }
            other => panic!("expected WriteFailed, got {:?}", other),
        }
        // The new-topology write stays in place
        assert!(fixture.clusters[1].contains_key("doc"));
    }

    #[tokio::test]
    async fn test_negative_reply_is_reported_not_raised() {
        let fixture = Fixture::new(1);
        let store = fixture.store(1, 1).await.unwrap();

        assert!(!store.delete("pk", "never-set", CommandFlags::None).await.unwrap());
        assert!(!store
            .expire("pk", "never-set", Duration::from_secs(5), CommandFlags::None)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_coinciding_targets_write_once() {
        let fixture = Fixture::new(4);
        fixture.seed(MigrationRecord::settled(2)).await;
        let store = fixture.store(2, 4).await.unwrap();

        // Shard 0 is on cluster 0 in both topologies
        let pk = key_for_shard(&store, 0);
        store.set(&pk, "k", "v", None).await.unwrap();
        let before = fixture.clusters[0].write_count();

        assert!(store.delete(&pk, "k", CommandFlags::None).await.unwrap());
        assert_eq!(fixture.clusters[0].write_count(), before + 1);
    }

    #[tokio::test]
    async fn test_hash_commands() {
        let fixture = Fixture::new(2);
        let store = fixture.store(2, 2).await.unwrap();
        let entries = vec![
            ("name".to_string(), "ada".to_string()),
            ("lang".to_string(), "en".to_string()),
        ];

        assert!(store.hash_set("user:9", "profile", &entries, CommandFlags::None).await.unwrap());
        let values = store
            .hash_get(
                "user:9",
                "profile",
                &["lang".to_string(), "missing".to_string()],
                CommandFlags::PreferReplica,
            )
            .await
            .unwrap();
        assert_eq!(values, vec![Some("en".to_string()), None]);
    }

    #[tokio::test]
    async fn test_read_failure_is_attributed_to_cluster() {
        let fixture = Fixture::new(2);
        let store = fixture.store(2, 2).await.unwrap();
        let cluster = store.router().read_target("user:5");
        fixture.clusters[cluster as usize].set_available(false);

        let result = store.get("user:5", "name").await;
        assert!(matches!(result, Err(ReshardError::Store { cluster: c, .. }) if c == cluster));
    }
}
