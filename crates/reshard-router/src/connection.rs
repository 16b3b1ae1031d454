//! Cluster connection collaborators
//!
//! The router never speaks a wire protocol itself. It talks to each physical
//! cluster through a [`ConnectionPool`] that hands out [`KvConnection`]s.
//! [`RoundRobinPool`] is the stock pool: a fixed number of slots, each
//! connected lazily on first use, picked in turn by an atomic counter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reshard_core::ConfigError;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::StoreError;

/// A hash field and its value
pub type HashEntry = (String, String);

/// Per-command delivery hints, passed through to the store untouched
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandFlags {
    #[default]
    None,
    /// Don't wait for the reply
    FireAndForget,
    /// Only run on a primary
    DemandPrimary,
    /// Prefer a replica, fall back to the primary
    PreferReplica,
}

/// Result of a conditional whole-hash replacement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    /// The expected contents matched and the hash was replaced
    Applied,
    /// The current contents differ from what was expected; nothing was written
    Conflict,
    /// The store has no conditional write primitive
    Unsupported,
}

/// Key-value command surface of one cluster connection
#[async_trait]
pub trait KvConnection: Send + Sync {
    /// Read a string value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a string value, optionally with a time-to-live
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError>;

    /// Set a key's time-to-live. `false` if the key does not exist.
    async fn expire(
        &self,
        key: &str,
        ttl: Duration,
        flags: CommandFlags,
    ) -> Result<bool, StoreError>;

    /// Remove a key. `false` if the key did not exist.
    async fn delete(&self, key: &str, flags: CommandFlags) -> Result<bool, StoreError>;

    /// Read hash fields, one slot per requested field
    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
        flags: CommandFlags,
    ) -> Result<Vec<Option<String>>, StoreError>;

    /// Write hash fields, leaving other fields in place
    async fn hash_set(
        &self,
        key: &str,
        entries: &[HashEntry],
        flags: CommandFlags,
    ) -> Result<bool, StoreError>;

    /// Replace the whole hash at `key` with `entries`, but only if every field
    /// in `expected` currently holds that value (`None`: the key must not exist).
    /// Fields not named in `expected` are not compared.
    async fn hash_replace(
        &self,
        _key: &str,
        _expected: Option<&[HashEntry]>,
        _entries: &[HashEntry],
    ) -> Result<CasOutcome, StoreError> {
        Ok(CasOutcome::Unsupported)
    }
}

/// Hands out connections to one cluster. Must be safe to call concurrently.
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn connection(&self) -> Result<Arc<dyn KvConnection>, StoreError>;
}

/// Establishes the connection behind one pool slot
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, slot: usize) -> Result<Arc<dyn KvConnection>, StoreError>;
}

/// Fixed-size pool of lazily established connections, selected round-robin
pub struct RoundRobinPool {
    name: String,
    connector: Arc<dyn Connector>,
    slots: Vec<OnceCell<Arc<dyn KvConnection>>>,
    next: AtomicUsize,
}

impl RoundRobinPool {
    /// Create a pool with `size` slots. Nothing is connected until first use.
    pub fn new(
        name: impl Into<String>,
        connector: Arc<dyn Connector>,
        size: usize,
    ) -> Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pool_size".to_string(),
                value: size.to_string(),
            });
        }
        Ok(Self {
            name: name.into(),
            connector,
            slots: (0..size).map(|_| OnceCell::new()).collect(),
            next: AtomicUsize::new(0),
        })
    }

    /// Pool name, used in logs
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of slots
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots whose connection has been established
    pub fn established(&self) -> usize {
        self.slots.iter().filter(|slot| slot.initialized()).count()
    }
}

#[async_trait]
impl ConnectionPool for RoundRobinPool {
    async fn connection(&self) -> Result<Arc<dyn KvConnection>, StoreError> {
        let slot = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        // A failed connect leaves the slot empty so the next pass retries it
        let connection = self.slots[slot]
            .get_or_try_init(|| async {
                let connection = self.connector.connect(slot).await?;
                debug!(pool = %self.name, slot, "Connection established");
                Ok::<_, StoreError>(connection)
            })
            .await?;
        Ok(Arc::clone(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryCluster, MemoryConnector};

    fn pool_over(cluster: &Arc<MemoryCluster>, size: usize) -> RoundRobinPool {
        RoundRobinPool::new(
            "test",
            Arc::new(MemoryConnector::new(Arc::clone(cluster))),
            size,
        )
        .unwrap()
    }

    #[test]
    fn test_zero_sized_pool_is_rejected() {
        let cluster = Arc::new(MemoryCluster::new("c0"));
        let result = RoundRobinPool::new("empty", Arc::new(MemoryConnector::new(cluster)), 0);
        assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
    }

    #[tokio::test]
    async fn test_slots_connect_lazily_round_robin() {
        let cluster = Arc::new(MemoryCluster::new("c0"));
        let pool = pool_over(&cluster, 3);
        assert_eq!(pool.established(), 0);

        pool.connection().await.unwrap();
        assert_eq!(pool.established(), 1);

        pool.connection().await.unwrap();
        pool.connection().await.unwrap();
        assert_eq!(pool.established(), 3);

        // Wrapping around reuses established slots
        pool.connection().await.unwrap();
        assert_eq!(pool.established(), 3);
    }

    #[tokio::test]
    async fn test_failed_connect_is_retried_later() {
        let cluster = Arc::new(MemoryCluster::new("c0"));
        let pool = pool_over(&cluster, 1);

        cluster.set_available(false);
        assert!(matches!(
            pool.connection().await,
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(pool.established(), 0);

        cluster.set_available(true);
        let connection = pool.connection().await.unwrap();
        assert!(connection.set("k", "v", None).await.unwrap());
        assert_eq!(pool.established(), 1);
    }

    #[tokio::test]
    async fn test_default_hash_replace_is_unsupported() {
        struct Plain;

        #[async_trait]
        impl KvConnection for Plain {
            async fn get(&self, _: &str) -> Result<Option<String>, StoreError> {
                Ok(None)
            }
            async fn set(&self, _: &str, _: &str, _: Option<Duration>) -> Result<bool, StoreError> {
                Ok(true)
            }
            async fn expire(
                &self,
                _: &str,
                _: Duration,
                _: CommandFlags,
            ) -> Result<bool, StoreError> {
                Ok(false)
            }
            async fn delete(&self, _: &str, _: CommandFlags) -> Result<bool, StoreError> {
                Ok(false)
            }
            async fn hash_get(
                &self,
                _: &str,
                fields: &[String],
                _: CommandFlags,
            ) -> Result<Vec<Option<String>>, StoreError> {
                Ok(vec![None; fields.len()])
            }
            async fn hash_set(
                &self,
                _: &str,
                _: &[HashEntry],
                _: CommandFlags,
            ) -> Result<bool, StoreError> {
                Ok(true)
            }
        }

        let outcome = Plain.hash_replace("k", None, &[]).await.unwrap();
        assert_eq!(outcome, CasOutcome::Unsupported);
    }
}
