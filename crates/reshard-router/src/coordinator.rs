//! Cutover Coordinator
//!
//! Decides, once at construction, which migration phase this process is in,
//! then (only while migrating) runs one background task that converges on the
//! shared cutover decision.
//!
//! # Phases
//!
//! ```text
//!                 record.old == configured new
//!   construct ───────────────────────────────────► CutOver (record.cut_over)
//!       │
//!       │ record.old != configured new
//!       ▼
//!   Migrating ── record.cut_over, or deadline passed ──► CutOver (permanent)
//! ```
//!
//! All coordination goes through the migration record; there is no lock
//! service. Instances that start at the same moment may race to schedule the
//! migration. With a compare-and-swap capable store one of them wins and the
//! others adopt its deadline; without one the last writer's deadline stands.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use reshard_core::{ConfigError, ReshardConfig, TopologyMapper};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::CasOutcome;
use crate::error::ReshardError;
use crate::record::{MigrationRecord, RecordStore};

/// Setup gives up after this many lost races on the record
const MAX_SETUP_ATTEMPTS: usize = 3;

/// Which topology is authoritative for reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    /// Reads use the old topology, writes go to both
    Migrating,
    /// Reads and writes use the new topology only
    CutOver,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::Migrating => write!(f, "migrating"),
            Phase::CutOver => write!(f, "cut-over"),
        }
    }
}

/// Cluster counts this process routes with, fixed for its lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub old_cluster_count: u32,
    pub new_cluster_count: u32,
}

/// Outcome of the synchronous part of setup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Setup {
    /// Nothing to converge on
    Settled { topology: Topology, cut_over: bool },
    /// Converge in the background
    Migrating { topology: Topology },
}

/// Local cutover flag. Moves `false → true` at most once.
struct CutoverFlag {
    cut_over: AtomicBool,
    notify: watch::Sender<bool>,
}

impl CutoverFlag {
    fn new(cut_over: bool) -> Self {
        let (notify, _) = watch::channel(cut_over);
        Self {
            cut_over: AtomicBool::new(cut_over),
            notify,
        }
    }

    fn get(&self) -> bool {
        self.cut_over.load(Ordering::Acquire)
    }

    /// Returns true if this call flipped the flag
    fn set(&self) -> bool {
        let flipped = !self.cut_over.swap(true, Ordering::AcqRel);
        if flipped {
            self.notify.send_replace(true);
        }
        flipped
    }
}

/// Tracks the migration phase for one process
pub struct CutoverCoordinator {
    topology: Topology,
    flag: Arc<CutoverFlag>,
    task: Option<JoinHandle<()>>,
}

impl CutoverCoordinator {
    /// Establish this process's phase and, if a migration is in flight, start
    /// the convergence loop.
    ///
    /// Returns only once the phase is known. Reading or writing the record
    /// fails construction. `available_clusters` is how many clusters the
    /// caller can reach; a recorded old topology wider than that fails setup
    /// before the record is touched. `shutdown` stops the loop when it turns
    /// `true` or its sender is dropped.
    pub async fn start(
        config: &ReshardConfig,
        records: RecordStore,
        available_clusters: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<Self, ReshardError> {
        config.validate()?;

        let setup = determine_phase(config, &records, available_clusters).await?;
        let coordinator = match setup {
            Setup::Settled { topology, cut_over } => {
                info!(
                    instance = %config.instance_id,
                    clusters = topology.new_cluster_count,
                    cut_over,
                    "No migration requested"
                );
                Self {
                    topology,
                    flag: Arc::new(CutoverFlag::new(cut_over)),
                    task: None,
                }
            }
            Setup::Migrating { topology } => {
                info!(
                    instance = %config.instance_id,
                    old_clusters = topology.old_cluster_count,
                    new_clusters = topology.new_cluster_count,
                    "Migration in progress, dual writes enabled"
                );
                let flag = Arc::new(CutoverFlag::new(false));
                let task = tokio::spawn(converge(
                    records,
                    Arc::clone(&flag),
                    shutdown,
                    config.refresh_retry(),
                    config.instance_id.clone(),
                ));
                Self {
                    topology,
                    flag,
                    task: Some(task),
                }
            }
        };
        Ok(coordinator)
    }

    /// Current phase, from the locally cached flag
    pub fn phase(&self) -> Phase {
        if self.flag.get() {
            Phase::CutOver
        } else {
            Phase::Migrating
        }
    }

    /// Whether reads use the new topology
    pub fn is_cut_over(&self) -> bool {
        self.flag.get()
    }

    /// Cluster counts in effect
    pub fn topology(&self) -> Topology {
        self.topology
    }

    /// Whether the convergence loop is still running
    pub fn is_converging(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Wait until this process observes cutover.
    ///
    /// Never resolves if the loop was cancelled first; wrap it in a timeout.
    pub async fn wait_for_cutover(&self) {
        let mut rx = self.flag.notify.subscribe();
        // The sender lives in `self.flag`, so this only ends on `true`
        let _ = rx.wait_for(|cut_over| *cut_over).await;
    }
}

impl Drop for CutoverCoordinator {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Read the record and settle this process's starting phase, writing the
/// record where this instance is the first to see the configuration.
async fn determine_phase(
    config: &ReshardConfig,
    records: &RecordStore,
    available_clusters: usize,
) -> Result<Setup, ReshardError> {
    let target = config.new_cluster_count;
    let mapper = TopologyMapper::new(config.max_shards)?;

    for attempt in 1..=MAX_SETUP_ATTEMPTS {
        let Some(stored) = records.read().await? else {
            // First run against this coordination cluster
            let fresh = MigrationRecord::settled(target);
            if records.replace(None, &fresh).await? == CasOutcome::Conflict {
                debug!(attempt, "Record created concurrently, re-reading");
                continue;
            }
            return Ok(Setup::Settled {
                topology: Topology {
                    old_cluster_count: target,
                    new_cluster_count: target,
                },
                cut_over: true,
            });
        };
        let record = stored.record;

        if record.old_cluster_count == target {
            if record.is_migrating() {
                warn!(
                    %record,
                    configured = target,
                    "Record shows a migration away from this instance's configured topology"
                );
            }
            return Ok(Setup::Settled {
                topology: Topology {
                    old_cluster_count: target,
                    new_cluster_count: target,
                },
                cut_over: record.cut_over,
            });
        }

        // A topology change is requested
        mapper
            .check_cluster_count("recorded old", record.old_cluster_count)
            .map_err(|e| ReshardError::MalformedRecord {
                key: records.key().to_string(),
                reason: e.to_string(),
            })?;
        if record.old_cluster_count != config.old_cluster_count {
            warn!(
                recorded = record.old_cluster_count,
                configured = config.old_cluster_count,
                "Configured old cluster count differs from the record, using the record"
            );
        }
        let topology = Topology {
            old_cluster_count: record.old_cluster_count,
            new_cluster_count: target,
        };

        if record.new_cluster_count == target && record.cut_over {
            // Another instance already finished this migration
            return Ok(Setup::Settled {
                topology,
                cut_over: true,
            });
        }

        // Dual writes need every old-topology cluster; check before writing anything
        if record.old_cluster_count as usize > available_clusters {
            return Err(ConfigError::PoolCountMismatch {
                expected: record.old_cluster_count as usize,
                actual: available_clusters,
            }
            .into());
        }

        if record.new_cluster_count == target {
            // Another instance already scheduled this migration
            return Ok(Setup::Migrating { topology });
        }

        if record.is_migrating() {
            warn!(%record, new_target = target, "Retargeting an unfinished migration");
        }
        let scheduled = MigrationRecord::migrating(
            record.old_cluster_count,
            target,
            cutover_deadline(config, epoch_millis()),
        );
        match records.replace(Some(&stored), &scheduled).await? {
            CasOutcome::Conflict => {
                debug!(attempt, "Record changed while scheduling, re-reading");
                continue;
            }
            CasOutcome::Applied | CasOutcome::Unsupported => {
                info!(
                    instance = %config.instance_id,
                    %scheduled,
                    "Scheduled cutover"
                );
                return Ok(Setup::Migrating { topology });
            }
        }
    }

    Err(ReshardError::Contended {
        key: records.key().to_string(),
        attempts: MAX_SETUP_ATTEMPTS,
    })
}

/// `now` plus the cutover window, saturating at the end of time
fn cutover_deadline(config: &ReshardConfig, now: i64) -> i64 {
    let window = i64::try_from(config.cutover_window_ms).unwrap_or(i64::MAX);
    now.saturating_add(window)
}

/// Background convergence loop.
///
/// Sleeps until the recorded deadline rather than polling on an interval.
/// Read failures are retried after `retry`; they never imply a phase.
async fn converge(
    records: RecordStore,
    flag: Arc<CutoverFlag>,
    mut shutdown: watch::Receiver<bool>,
    retry: Duration,
    instance_id: String,
) {
    let mut conflicts = 0usize;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let wait = match records.read().await {
            Ok(Some(stored)) if stored.record.cut_over => {
                flag.set();
                info!(
                    instance = %instance_id,
                    record = %stored.record,
                    "Observed cutover, reads moved to new topology"
                );
                return;
            }
            Ok(Some(stored)) => {
                let record = stored.record;
                let now = epoch_millis();
                if now < record.cut_over_deadline {
                    conflicts = 0;
                    let remaining = (record.cut_over_deadline - now) as u64;
                    debug!(
                        instance = %instance_id,
                        remaining_ms = remaining,
                        "Waiting for cutover deadline"
                    );
                    Duration::from_millis(remaining)
                } else {
                    match records.replace(Some(&stored), &record.completed()).await {
                        Ok(CasOutcome::Conflict) => {
                            conflicts += 1;
                            debug!(
                                instance = %instance_id,
                                conflicts,
                                "Cutover raced with another writer"
                            );
                            // Re-read at once the first time; the winner most likely cut over
                            if conflicts == 1 {
                                Duration::ZERO
                            } else {
                                retry
                            }
                        }
                        Ok(_) => {
                            flag.set();
                            info!(
                                instance = %instance_id,
                                deadline = record.cut_over_deadline,
                                "Deadline passed, forced cutover"
                            );
                            return;
                        }
                        Err(e) => {
                            warn!(
                                instance = %instance_id,
                                error = %e,
                                "Failed to write cutover, retrying"
                            );
                            retry
                        }
                    }
                }
            }
            Ok(None) => {
                warn!(
                    instance = %instance_id,
                    key = %records.key(),
                    "Migration record missing, retrying"
                );
                retry
            }
            Err(e) => {
                warn!(
                    instance = %instance_id,
                    error = %e,
                    "Failed to read migration record, retrying"
                );
                retry
            }
        };

        if wait.is_zero() {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    info!(
        instance = %instance_id,
        cut_over = flag.get(),
        "Convergence loop cancelled"
    );
}
