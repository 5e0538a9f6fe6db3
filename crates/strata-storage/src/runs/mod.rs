//! Run lifecycle storage: runs, snapshots, backfills, heartbeats, scalars.
//!
//! A [`Run`] is one pipeline execution. Its status is a projection of the
//! run's event log, folded in by [`RunStore::handle_run_event`]; transitions
//! only ever move forward through the state machine, with cancel reachable
//! from any non-terminal state.
//!
//! The run store also owns three small satellite tables: content-addressed
//! structural [`Snapshot`]s, bulk [`Backfill`] requests, per-daemon liveness
//! heartbeats, and a minimal key-value table for miscellaneous persisted
//! scalars.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::{BackfillId, Result, RunId, SnapshotId};

use crate::event_log::EventType;
use crate::lifecycle::StorageLifecycle;

/// Run state machine states.
///
/// Forward-only: `Queued → Starting → Started → Success/Failure`, with
/// `Canceled` reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Accepted and waiting for resources.
    Queued,
    /// Resources are being provisioned.
    Starting,
    /// Actively executing.
    Started,
    /// Completed successfully.
    Success,
    /// Failed.
    Failure,
    /// Canceled by user or system.
    Canceled,
}

impl RunStatus {
    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failure | Self::Canceled)
    }

    /// Returns true if a transition from `self` to `target` is legal.
    ///
    /// Transitions are monotonic forward except explicit cancel, which is
    /// legal from any non-terminal status.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match (self, target) {
            (Self::Queued, Self::Starting | Self::Started)
            | (Self::Starting, Self::Started)
            | (Self::Started, Self::Success | Self::Failure) => true,
            (from, Self::Canceled) => !from.is_terminal(),
            _ => false,
        }
    }

    /// Returns the status a run moves to when the given event is observed,
    /// or `None` for event types that do not affect run status.
    #[must_use]
    pub const fn from_event(event_type: EventType) -> Option<Self> {
        match event_type {
            EventType::RunEnqueued => Some(Self::Queued),
            EventType::RunStarting => Some(Self::Starting),
            EventType::RunStarted => Some(Self::Started),
            EventType::RunSuccess => Some(Self::Success),
            EventType::RunFailure => Some(Self::Failure),
            EventType::RunCanceled => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// One pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique, immutable run identifier.
    pub id: RunId,
    /// The job (pipeline) this run executes.
    pub job_name: String,
    /// Current status, projected from the run's event log.
    pub status: RunStatus,
    /// Free-form tags; queryable via [`RunsFilter::tags`].
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Content-addressed reference to the job's structural snapshot.
    pub snapshot_id: Option<SnapshotId>,
    /// Root of the retry lineage this run belongs to, if any.
    pub root_run_id: Option<RunId>,
    /// Direct parent in the retry lineage, if any.
    pub parent_run_id: Option<RunId>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last status-change time.
    pub updated_at: DateTime<Utc>,
}

impl Run {
    /// Creates a new queued run for the given job.
    #[must_use]
    pub fn new(job_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: RunId::generate(),
            job_name: job_name.into(),
            status: RunStatus::Queued,
            tags: HashMap::new(),
            snapshot_id: None,
            root_run_id: None,
            parent_run_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets tags on the run.
    #[must_use]
    pub fn with_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Links this run into the retry lineage of `parent`.
    ///
    /// The root id is inherited from the parent's root, or the parent itself
    /// when the parent is the lineage root.
    #[must_use]
    pub fn with_parent(mut self, parent: &Run) -> Self {
        self.parent_run_id = Some(parent.id);
        self.root_run_id = Some(parent.root_run_id.unwrap_or(parent.id));
        self
    }

    /// Attaches a structural snapshot reference.
    #[must_use]
    pub fn with_snapshot(mut self, snapshot_id: SnapshotId) -> Self {
        self.snapshot_id = Some(snapshot_id);
        self
    }
}

/// Retries and re-executions sharing lineage with one root run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunGroup {
    /// The lineage root.
    pub root_run_id: RunId,
    /// All stored members of the lineage, including the root if stored.
    pub runs: Vec<Run>,
}

/// Filter for run queries.
#[derive(Debug, Clone, Default)]
pub struct RunsFilter {
    /// Restrict to these run ids.
    pub run_ids: Option<Vec<RunId>>,
    /// Restrict to runs of this job.
    pub job_name: Option<String>,
    /// Restrict to runs in any of these statuses.
    pub statuses: Option<Vec<RunStatus>>,
    /// Require all of these tag key/value pairs.
    pub tags: HashMap<String, String>,
    /// Only runs created strictly before this instant.
    pub created_before: Option<DateTime<Utc>>,
    /// Only runs created strictly after this instant.
    pub created_after: Option<DateTime<Utc>>,
}

impl RunsFilter {
    /// Filter for all runs of one job.
    #[must_use]
    pub fn for_job(job_name: impl Into<String>) -> Self {
        Self {
            job_name: Some(job_name.into()),
            ..Self::default()
        }
    }

    /// Returns true if `run` passes this filter.
    #[must_use]
    pub fn matches(&self, run: &Run) -> bool {
        if let Some(ids) = &self.run_ids {
            if !ids.contains(&run.id) {
                return false;
            }
        }
        if let Some(job) = &self.job_name {
            if run.job_name != *job {
                return false;
            }
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&run.status) {
                return false;
            }
        }
        for (key, value) in &self.tags {
            if run.tags.get(key) != Some(value) {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if run.created_at >= before {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if run.created_at <= after {
                return false;
            }
        }
        true
    }
}

/// Grouping instruction for bucketed run queries.
///
/// Buckets return up to `limit` newest runs per bucket value, for UIs that
/// render one row per job or per tag value.
#[derive(Debug, Clone)]
pub enum BucketBy {
    /// One bucket per job name.
    Job {
        /// The job names to bucket by.
        job_names: Vec<String>,
        /// Maximum runs returned per bucket.
        limit: usize,
    },
    /// One bucket per value of a tag key.
    Tag {
        /// The tag key to bucket by.
        key: String,
        /// The tag values to bucket by.
        values: Vec<String>,
        /// Maximum runs returned per bucket.
        limit: usize,
    },
}

/// Status of a bulk backfill request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkActionStatus {
    /// Requested, not yet picked up.
    Requested,
    /// Being executed.
    InProgress,
    /// All requested partitions handled.
    Completed,
    /// Canceled before completion.
    Canceled,
    /// Failed before completion.
    Failed,
}

/// A bulk re-materialization request spanning partitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backfill {
    /// Unique backfill identifier.
    pub id: BackfillId,
    /// Current status.
    pub status: BulkActionStatus,
    /// The partition definition being backfilled.
    pub partitions_def_name: String,
    /// The requested partition keys.
    pub partition_names: Vec<String>,
    /// Free-form tags propagated to launched runs.
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Backfill {
    /// Creates a new requested backfill.
    #[must_use]
    pub fn new(partitions_def_name: impl Into<String>, partition_names: Vec<String>) -> Self {
        Self {
            id: BackfillId::generate(),
            status: BulkActionStatus::Requested,
            partitions_def_name: partitions_def_name.into(),
            partition_names,
            tags: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    /// Returns a copy with the given status.
    #[must_use]
    pub fn with_status(mut self, status: BulkActionStatus) -> Self {
        self.status = status;
        self
    }
}

/// Liveness signal from a background operator daemon.
///
/// Overwritten on each heartbeat, keyed by daemon name; liveness monitors
/// compare the timestamp against their own staleness threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonHeartbeat {
    /// The daemon reporting in (e.g. "scheduler", "backfill").
    pub daemon_name: String,
    /// When the heartbeat was emitted.
    pub timestamp: DateTime<Utc>,
    /// Error carried by an unhealthy daemon, if any.
    pub error: Option<String>,
}

/// An immutable, content-addressed structural description of a pipeline or
/// execution plan at a point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Content hash of `payload`.
    pub id: SnapshotId,
    /// The structural payload.
    pub payload: Value,
}

/// Durable CRUD and lifecycle tracking for pipeline runs.
///
/// Implementations must be safe for concurrent use within a process and, for
/// persistent backends, across process boundaries. Transient backend failures
/// propagate to the caller unchanged.
#[async_trait]
pub trait RunStore: StorageLifecycle {
    /// Inserts a new run.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the run id is already present; store state
    /// is unchanged in that case.
    async fn add_run(&self, run: Run) -> Result<Run>;

    /// Returns true if the run id exists.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn has_run(&self, run_id: RunId) -> Result<bool>;

    /// Fetches a run by id; `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>>;

    /// Returns runs matching `filter`, newest-first by creation time.
    ///
    /// `cursor` is an exclusive run-id boundary: results continue strictly
    /// after that run in the ordering. `bucket_by` groups results per job or
    /// per tag value with a per-bucket limit.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_runs(
        &self,
        filter: &RunsFilter,
        cursor: Option<RunId>,
        limit: Option<usize>,
        bucket_by: Option<&BucketBy>,
    ) -> Result<Vec<Run>>;

    /// Counts runs matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_runs_count(&self, filter: &RunsFilter) -> Result<usize>;

    /// Returns the retry lineage containing `run_id`, or `None` if the run
    /// does not exist or is not part of a group.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_run_group(&self, run_id: RunId) -> Result<Option<RunGroup>>;

    /// Projects a status-changing event onto the run's stored status.
    ///
    /// Silently no-ops when the run id is unknown (callers must not assume
    /// row existence) or when the event does not affect run status. Illegal
    /// backward transitions are ignored, keeping the projection monotonic.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn handle_run_event(&self, run_id: RunId, event_type: EventType) -> Result<()>;

    /// Merges tags into an existing run.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the run does not exist.
    async fn add_run_tags(&self, run_id: RunId, tags: HashMap<String, String>) -> Result<()>;

    /// Deletes a run and its tags.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the run does not exist.
    async fn delete_run(&self, run_id: RunId) -> Result<()>;

    /// Stores a structural snapshot, returning its content-addressed id.
    ///
    /// Idempotent: storing identical content returns the identical id with
    /// no duplicate row.
    ///
    /// # Errors
    ///
    /// Returns `Serialization` if the payload cannot be canonically encoded.
    async fn add_snapshot(&self, payload: Value) -> Result<SnapshotId>;

    /// Returns true if a snapshot with this id is stored.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn has_snapshot(&self, snapshot_id: &SnapshotId) -> Result<bool>;

    /// Fetches a snapshot by id; `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Option<Snapshot>>;

    /// Upserts a backfill by id.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn add_backfill(&self, backfill: Backfill) -> Result<()>;

    /// Upserts a backfill by id (alias of `add_backfill` semantics, kept
    /// separate so call sites read as intent).
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn update_backfill(&self, backfill: Backfill) -> Result<()>;

    /// Fetches a backfill by id; `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_backfill(&self, backfill_id: BackfillId) -> Result<Option<Backfill>>;

    /// Returns backfills newest-first, optionally restricted to one status,
    /// paginated by an exclusive backfill-id cursor.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_backfills(
        &self,
        status: Option<BulkActionStatus>,
        cursor: Option<BackfillId>,
        limit: Option<usize>,
    ) -> Result<Vec<Backfill>>;

    /// Overwrites the heartbeat for the daemon named in `heartbeat`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn add_daemon_heartbeat(&self, heartbeat: DaemonHeartbeat) -> Result<()>;

    /// Returns the latest heartbeat per daemon name.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_daemon_heartbeats(&self) -> Result<HashMap<String, DaemonHeartbeat>>;

    /// Deletes all daemon heartbeats.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn wipe_daemon_heartbeats(&self) -> Result<()>;

    /// Fetches the requested keys from the scalar key-value table.
    ///
    /// Absent keys are missing from the result, not an error.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn kvs_get(&self, keys: &[String]) -> Result<HashMap<String, String>>;

    /// Writes the given pairs into the scalar key-value table, overwriting
    /// existing keys.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn kvs_set(&self, pairs: HashMap<String, String>) -> Result<()>;

    /// Returns true if this backend computes bucketed queries natively.
    fn supports_bucket_queries(&self) -> bool {
        true
    }
}

/// Sorts newest-first by creation time with run id as tie-breaker. Shared by
/// backends so pagination order is identical everywhere.
pub(crate) fn sort_newest_first(runs: &mut [Run]) {
    runs.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// Applies a bucket grouping to an already newest-first run list, keeping at
/// most `limit` runs per bucket value.
pub(crate) fn bucket_runs(runs: Vec<Run>, bucket_by: &BucketBy) -> Vec<Run> {
    let mut taken: HashMap<String, usize> = HashMap::new();
    let mut out = Vec::new();
    for run in runs {
        let (bucket, limit) = match bucket_by {
            BucketBy::Job { job_names, limit } => {
                if !job_names.contains(&run.job_name) {
                    continue;
                }
                (run.job_name.clone(), *limit)
            }
            BucketBy::Tag { key, values, limit } => match run.tags.get(key) {
                Some(value) if values.contains(value) => (value.clone(), *limit),
                _ => continue,
            },
        };
        let count = taken.entry(bucket).or_insert(0);
        if *count < limit {
            *count += 1;
            out.push(run);
        }
    }
    out
}
