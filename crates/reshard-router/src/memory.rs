//! In-memory cluster backend
//!
//! A single-process stand-in for one physical cluster endpoint. It implements
//! the full [`KvConnection`] surface (strings, hashes, TTLs, conditional hash
//! replacement) and supports fault injection, which makes it the backend for
//! the test suites and the `reshard-node` demo.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::trace;

use crate::connection::{CasOutcome, CommandFlags, Connector, HashEntry, KvConnection};
use crate::error::StoreError;

#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn new(value: Value) -> Self {
        Self { value, expires_at: None }
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-memory key-value node
pub struct MemoryCluster {
    name: String,
    data: Mutex<HashMap<String, Entry>>,
    available: AtomicBool,
    supports_cas: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCluster {
    /// Create an empty, reachable node
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            supports_cas: AtomicBool::new(true),
            writes: AtomicU64::new(0),
        }
    }

    /// Disable conditional writes, so `hash_replace` reports `Unsupported`
    pub fn without_cas(self) -> Self {
        self.supports_cas.store(false, Ordering::SeqCst);
        self
    }

    /// Node name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Make every subsequent call succeed (`true`) or fail as unreachable (`false`)
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether the node currently accepts calls
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    /// Number of mutating commands applied so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Whether a live key exists, bypassing availability
    pub fn contains_key(&self, key: &str) -> bool {
        let mut data = self.data.lock();
        live_entry(&mut data, key).is_some()
    }

    /// Snapshot of a hash, bypassing availability
    pub fn hash_snapshot(&self, key: &str) -> Option<HashMap<String, String>> {
        let mut data = self.data.lock();
        match live_entry(&mut data, key).map(|e| &e.value) {
            Some(Value::Hash(hash)) => Some(hash.clone()),
            _ => None,
        }
    }

    /// Write hash fields directly, bypassing availability and counters
    pub fn seed_hash(&self, key: &str, entries: &[(&str, &str)]) {
        let hash = entries
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect();
        self.data
            .lock()
            .insert(key.to_string(), Entry::new(Value::Hash(hash)));
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(StoreError::Unavailable(self.name.clone()))
        }
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }

    fn wrong_type(&self, key: &str) -> StoreError {
        StoreError::Command(format!(
            "WRONGTYPE operation against key {:?} holding the wrong kind of value on {}",
            key, self.name
        ))
    }
}

/// Look up a key, dropping it first if its TTL has passed
fn live_entry<'a>(data: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if data.get(key).is_some_and(|e| e.is_expired(Instant::now())) {
        data.remove(key);
    }
    data.get_mut(key)
}

#[async_trait]
impl KvConnection for MemoryCluster {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock();
        match live_entry(&mut data, key).map(|e| &e.value) {
            None => Ok(None),
            Some(Value::Str(value)) => Ok(Some(value.clone())),
            Some(Value::Hash(_)) => Err(self.wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool, StoreError> {
        self.check_available()?;
        if ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(StoreError::Command("invalid expire time in set".to_string()));
        }
        let entry = Entry {
            value: Value::Str(value.to_string()),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.data.lock().insert(key.to_string(), entry);
        self.record_write();
        trace!(node = %self.name, key = %key, "SET");
        Ok(true)
    }

    async fn expire(
        &self,
        key: &str,
        ttl: Duration,
        _flags: CommandFlags,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock();
        let Some(entry) = live_entry(&mut data, key) else {
            return Ok(false);
        };
        if ttl.is_zero() {
            data.remove(key);
        } else {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        self.record_write();
        Ok(true)
    }

    async fn delete(&self, key: &str, _flags: CommandFlags) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock();
        let existed = live_entry(&mut data, key).is_some();
        if existed {
            data.remove(key);
            self.record_write();
        }
        Ok(existed)
    }

    async fn hash_get(
        &self,
        key: &str,
        fields: &[String],
        _flags: CommandFlags,
    ) -> Result<Vec<Option<String>>, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock();
        match live_entry(&mut data, key).map(|e| &e.value) {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(f).cloned()).collect()),
            Some(Value::Str(_)) => Err(self.wrong_type(key)),
        }
    }

    async fn hash_set(
        &self,
        key: &str,
        entries: &[HashEntry],
        _flags: CommandFlags,
    ) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut data = self.data.lock();
        if live_entry(&mut data, key).is_none() {
            data.insert(key.to_string(), Entry::new(Value::Hash(HashMap::new())));
        }
        let Some(Entry { value: Value::Hash(hash), .. }) = data.get_mut(key) else {
            return Err(self.wrong_type(key));
        };
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        self.record_write();
        Ok(true)
    }

    async fn hash_replace(
        &self,
        key: &str,
        expected: Option<&[HashEntry]>,
        entries: &[HashEntry],
    ) -> Result<CasOutcome, StoreError> {
        self.check_available()?;
        if !self.supports_cas.load(Ordering::SeqCst) {
            return Ok(CasOutcome::Unsupported);
        }

        let mut data = self.data.lock();
        let matches = match (live_entry(&mut data, key).map(|e| &e.value), expected) {
            (None, None) => true,
            (Some(Value::Hash(current)), Some(expected)) => expected
                .iter()
                .all(|(f, v)| current.get(f).is_some_and(|c| c == v)),
            _ => false,
        };
        if !matches {
            return Ok(CasOutcome::Conflict);
        }

        let hash = entries.iter().cloned().collect();
        data.insert(key.to_string(), Entry::new(Value::Hash(hash)));
        self.record_write();
        Ok(CasOutcome::Applied)
    }
}

/// Connects every pool slot to the same in-memory node
pub struct MemoryConnector {
    cluster: Arc<MemoryCluster>,
}

impl MemoryConnector {
    pub fn new(cluster: Arc<MemoryCluster>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, _slot: usize) -> Result<Arc<dyn KvConnection>, StoreError> {
        self.cluster.check_available()?;
        Ok(Arc::clone(&self.cluster) as Arc<dyn KvConnection>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    fn entries(pairs: &[(&str, &str)]) -> Vec<HashEntry> {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_string_roundtrip_and_delete() {
        let node = MemoryCluster::new("c0");

        assert!(assert_ok!(node.set("k", "v", None).await));
        assert_eq!(node.get("k").await.unwrap(), Some("v".to_string()));
        assert!(node.delete("k", CommandFlags::None).await.unwrap());
        assert!(!node.delete("k", CommandFlags::None).await.unwrap());
        assert_eq!(node.get("k").await.unwrap(), None);
        assert_eq!(node.write_count(), 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let node = MemoryCluster::new("c0");

        node.set("short", "v", Some(Duration::from_millis(20))).await.unwrap();
        assert!(node.contains_key("short"));
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(node.get("short").await.unwrap(), None);

        node.set("k", "v", None).await.unwrap();
        assert!(node.expire("k", Duration::from_millis(20), CommandFlags::None).await.unwrap());
        assert!(!node.expire("missing", Duration::from_secs(1), CommandFlags::None).await.unwrap());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(!node.contains_key("k"));
    }

    #[tokio::test]
    async fn test_hash_get_and_set() {
        let node = MemoryCluster::new("c0");
        let fields = vec!["a".to_string(), "b".to_string()];

        assert_eq!(
            node.hash_get("h", &fields, CommandFlags::None).await.unwrap(),
            vec![None, None]
        );

        node.hash_set("h", &entries(&[("a", "1")]), CommandFlags::None).await.unwrap();
        node.hash_set("h", &entries(&[("b", "2")]), CommandFlags::None).await.unwrap();

        assert_eq!(
            node.hash_get("h", &fields, CommandFlags::None).await.unwrap(),
            vec![Some("1".to_string()), Some("2".to_string())]
        );
    }

    #[tokio::test]
    async fn test_wrong_type_is_a_command_error() {
        let node = MemoryCluster::new("c0");
        node.set("s", "v", None).await.unwrap();

        let result = node.hash_set("s", &entries(&[("a", "1")]), CommandFlags::None).await;
        assert!(matches!(result, Err(StoreError::Command(_))));
    }

    #[tokio::test]
    async fn test_unavailable_node_fails_every_call() {
        let node = MemoryCluster::new("c3");
        node.set_available(false);

        assert_eq!(
            node.get("k").await,
            Err(StoreError::Unavailable("c3".to_string()))
        );
        assert!(node.set("k", "v", None).await.is_err());
        assert_eq!(node.write_count(), 0);
    }

    #[tokio::test]
    async fn test_hash_replace_compares_expected_fields() {
        let node = MemoryCluster::new("c0");
        let v1 = entries(&[("x", "1")]);
        let v2 = entries(&[("x", "2")]);

        let outcome = node.hash_replace("h", None, &v1).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied);
        // Already exists
        let outcome = node.hash_replace("h", None, &v2).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
        // Stale expectation
        let outcome = node.hash_replace("h", Some(v2.as_slice()), &v1).await.unwrap();
        assert_eq!(outcome, CasOutcome::Conflict);
        let outcome = node.hash_replace("h", Some(v1.as_slice()), &v2).await.unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        let snapshot = node.hash_snapshot("h").unwrap();
        assert_eq!(snapshot.get("x"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn test_hash_replace_ignores_unexpected_fields_and_replaces_whole_hash() {
        let node = MemoryCluster::new("c0");
        node.seed_hash("h", &[("x", "1"), ("note", "keep?")]);

        let outcome = node
            .hash_replace("h", Some(entries(&[("x", "1")]).as_slice()), &entries(&[("x", "2")]))
            .await
            .unwrap();
        assert_eq!(outcome, CasOutcome::Applied);

        let snapshot = node.hash_snapshot("h").unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("x"), Some(&"2".to_string()));
    }

    #[tokio::test]
    async fn test_cas_can_be_disabled() {
        let node = MemoryCluster::new("c0").without_cas();
        let outcome = node.hash_replace("h", None, &entries(&[("x", "1")])).await.unwrap();
        assert_eq!(outcome, CasOutcome::Unsupported);
        assert!(!node.contains_key("h"));
    }
}
