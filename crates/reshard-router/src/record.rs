//! Migration record
//!
//! The single shared coordination value every client instance reads to agree
//! on the migration phase. It lives as a four-field hash under a well-known key
//! on the coordination cluster and is always written as a whole.

use std::sync::Arc;

use reshard_core::{ClusterId, ReshardConfig, NO_DEADLINE};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::connection::{CasOutcome, CommandFlags, ConnectionPool, HashEntry, KvConnection};
use crate::error::ReshardError;

pub const FIELD_OLD_CLUSTER_COUNT: &str = "OldClusterCount";
pub const FIELD_NEW_CLUSTER_COUNT: &str = "NewClusterCount";
pub const FIELD_CUT_OVER: &str = "CutOver";
pub const FIELD_CUT_OVER_DEADLINE: &str = "CutOverTimestampInMillis";

const RECORD_FIELDS: [&str; 4] = [
    FIELD_OLD_CLUSTER_COUNT,
    FIELD_NEW_CLUSTER_COUNT,
    FIELD_CUT_OVER,
    FIELD_CUT_OVER_DEADLINE,
];

/// Persisted migration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Cluster count data currently lives on
    pub old_cluster_count: u32,
    /// Cluster count being migrated to
    pub new_cluster_count: u32,
    /// Whether reads use the new topology
    pub cut_over: bool,
    /// Epoch milliseconds after which anyone may force cutover, or [`NO_DEADLINE`]
    pub cut_over_deadline: i64,
}

impl MigrationRecord {
    /// No migration: `count` clusters, authoritative
    pub fn settled(cluster_count: u32) -> Self {
        Self {
            old_cluster_count: cluster_count,
            new_cluster_count: cluster_count,
            cut_over: true,
            cut_over_deadline: NO_DEADLINE,
        }
    }

    /// A scheduled `old → new` change with dual writes until `deadline`
    pub fn migrating(old_cluster_count: u32, new_cluster_count: u32, deadline: i64) -> Self {
        Self {
            old_cluster_count,
            new_cluster_count,
            cut_over: false,
            cut_over_deadline: deadline,
        }
    }

    /// The record after cutover: the new count becomes the settled count
    pub fn completed(&self) -> Self {
        Self::settled(self.new_cluster_count)
    }

    /// Whether this record describes an unfinished migration
    pub fn is_migrating(&self) -> bool {
        !self.cut_over
    }

    /// Hash encoding, in field order
    pub fn to_entries(&self) -> Vec<HashEntry> {
        vec![
            (FIELD_OLD_CLUSTER_COUNT.to_string(), self.old_cluster_count.to_string()),
            (FIELD_NEW_CLUSTER_COUNT.to_string(), self.new_cluster_count.to_string()),
            (FIELD_CUT_OVER.to_string(), if self.cut_over { "1" } else { "0" }.to_string()),
            (FIELD_CUT_OVER_DEADLINE.to_string(), self.cut_over_deadline.to_string()),
        ]
    }

    /// Decode the four record fields in [`RECORD_FIELDS`] order.
    ///
    /// All fields absent means there is no record (`Ok(None)`). Anything
    /// partially present or unparsable is an error message.
    pub fn from_fields(values: &[Option<String>]) -> Result<Option<Self>, String> {
        if values.iter().all(Option::is_none) {
            return Ok(None);
        }
        if values.len() != RECORD_FIELDS.len() {
            return Err(format!("expected {} fields, got {}", RECORD_FIELDS.len(), values.len()));
        }

        let field = |i: usize| {
            values[i]
                .as_deref()
                .map(str::trim)
                .ok_or_else(|| format!("missing field {}", RECORD_FIELDS[i]))
        };
        let count = |i: usize| -> Result<u32, String> {
            let raw = field(i)?;
            match raw.parse::<u32>() {
                Ok(0) | Err(_) => Err(format!(
                    "{} is not a positive count: {:?}",
                    RECORD_FIELDS[i], raw
                )),
                Ok(n) => Ok(n),
            }
        };

        let old_cluster_count = count(0)?;
        let new_cluster_count = count(1)?;
        let cut_over = match field(2)?.to_ascii_lowercase().as_str() {
            "1" | "true" => true,
            "0" | "false" => false,
            other => return Err(format!("{} is not a flag: {:?}", FIELD_CUT_OVER, other)),
        };
        let raw_deadline = field(3)?;
        let cut_over_deadline = raw_deadline.parse::<i64>().map_err(|_| {
            format!("{} is not a timestamp: {:?}", FIELD_CUT_OVER_DEADLINE, raw_deadline)
        })?;

        Ok(Some(Self {
            old_cluster_count,
            new_cluster_count,
            cut_over,
            cut_over_deadline,
        }))
    }
}

impl std::fmt::Display for MigrationRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {} clusters (cut_over={}, deadline={})",
            self.old_cluster_count, self.new_cluster_count, self.cut_over, self.cut_over_deadline
        )
    }
}

/// A decoded record together with the stored field values it came from.
///
/// Conditional writes compare against these values rather than a
/// re-encoding, since the decoder accepts more than one spelling of a field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRecord {
    pub record: MigrationRecord,
    fields: Vec<HashEntry>,
}

impl StoredRecord {
    /// Field values exactly as read from the store
    pub fn fields(&self) -> &[HashEntry] {
        &self.fields
    }
}

impl From<MigrationRecord> for StoredRecord {
    fn from(record: MigrationRecord) -> Self {
        Self {
            fields: record.to_entries(),
            record,
        }
    }
}

/// Reads and writes the migration record on the coordination cluster
#[derive(Clone)]
pub struct RecordStore {
    key: String,
    cluster: ClusterId,
    pool: Arc<dyn ConnectionPool>,
}

impl RecordStore {
    pub fn new(key: impl Into<String>, cluster: ClusterId, pool: Arc<dyn ConnectionPool>) -> Self {
        Self {
            key: key.into(),
            cluster,
            pool,
        }
    }

    /// Record store on the configured coordination cluster, picked out of the
    /// per-cluster pool array
    pub fn for_config(
        config: &ReshardConfig,
        pools: &[Arc<dyn ConnectionPool>],
    ) -> Result<Self, ReshardError> {
        let pool = pools
            .get(config.coordination_cluster as usize)
            .ok_or_else(|| ReshardError::ClusterOutOfRange {
                cluster: config.coordination_cluster,
                available: pools.len(),
            })?;
        Ok(Self::new(config.record_key.clone(), config.coordination_cluster, Arc::clone(pool)))
    }

    /// Record key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the record. `Ok(None)` only when no record exists.
    pub async fn load(&self) -> Result<Option<MigrationRecord>, ReshardError> {
        Ok(self.read().await?.map(|stored| stored.record))
    }

    /// Read the record along with its raw field values, for a later [`replace`].
    ///
    /// [`replace`]: RecordStore::replace
    pub async fn read(&self) -> Result<Option<StoredRecord>, ReshardError> {
        let connection = self.connection().await?;
        let fields: Vec<String> = RECORD_FIELDS.iter().map(|f| f.to_string()).collect();
        let values = connection
            .hash_get(&self.key, &fields, CommandFlags::None)
            .await
            .map_err(|e| ReshardError::store(self.cluster, e))?;

        let record = MigrationRecord::from_fields(&values).map_err(|reason| {
            ReshardError::MalformedRecord {
                key: self.key.clone(),
                reason,
            }
        })?;
        debug!(key = %self.key, record = ?record, "Loaded migration record");

        Ok(record.map(|record| StoredRecord {
            record,
            fields: fields
                .into_iter()
                .zip(values)
                .filter_map(|(field, value)| value.map(|value| (field, value)))
                .collect(),
        }))
    }

    /// Overwrite the whole record unconditionally
    pub async fn store(&self, record: &MigrationRecord) -> Result<(), ReshardError> {
        let connection = self.connection().await?;
        connection
            .hash_set(&self.key, &record.to_entries(), CommandFlags::None)
            .await
            .map_err(|e| ReshardError::store(self.cluster, e))?;
        info!(key = %self.key, %record, "Wrote migration record");
        Ok(())
    }

    /// Replace the record only if the stored fields still hold what
    /// `expected` read (`None`: the record must be absent).
    ///
    /// On stores without a conditional write this falls back to [`store`]
    /// and reports [`CasOutcome::Unsupported`]; the write did happen.
    ///
    /// [`store`]: RecordStore::store
    pub async fn replace(
        &self,
        expected: Option<&StoredRecord>,
        record: &MigrationRecord,
    ) -> Result<CasOutcome, ReshardError> {
        let connection = self.connection().await?;
        let outcome = connection
            .hash_replace(&self.key, expected.map(StoredRecord::fields), &record.to_entries())
            .await
            .map_err(|e| ReshardError::store(self.cluster, e))?;

        match outcome {
            CasOutcome::Applied => {
                info!(key = %self.key, %record, "Replaced migration record");
            }
            CasOutcome::Conflict => {
                debug!(key = %self.key, %record, "Migration record changed underneath");
            }
            CasOutcome::Unsupported => self.store(record).await?,
        }
        Ok(outcome)
    }

    async fn connection(&self) -> Result<Arc<dyn KvConnection>, ReshardError> {
        self.pool
            .connection()
            .await
            .map_err(|e| ReshardError::store(self.cluster, e))
    }
}
