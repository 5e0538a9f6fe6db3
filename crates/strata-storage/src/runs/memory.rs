//! In-memory run store for testing and development.
//!
//! Thread-safe within one process via `RwLock`; no durability and no
//! cross-process coordination.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use strata_core::{canonical, BackfillId, Error, Result, RunId, SnapshotId};

use super::{
    bucket_runs, sort_newest_first, Backfill, BucketBy, BulkActionStatus, DaemonHeartbeat, Run,
    RunGroup, RunStatus, RunStore, RunsFilter, Snapshot,
};
use crate::event_log::EventType;
use crate::lifecycle::StorageLifecycle;

/// Converts a lock poison error to a storage error.
fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("lock poisoned")
}

#[derive(Default)]
struct RunState {
    runs: HashMap<RunId, Run>,
    snapshots: HashMap<String, Snapshot>,
    backfills: HashMap<BackfillId, Backfill>,
    heartbeats: HashMap<String, DaemonHeartbeat>,
    kvs: HashMap<String, String>,
    disposed: bool,
}

impl RunState {
    fn check_open(&self) -> Result<()> {
        if self.disposed {
            Err(Error::backend("run store is disposed"))
        } else {
            Ok(())
        }
    }
}

/// In-memory [`RunStore`] implementation.
#[derive(Default)]
pub struct MemoryRunStore {
    state: RwLock<RunState>,
}

impl MemoryRunStore {
    /// Creates an empty in-memory run store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Applies filter, ordering, and exclusive cursor; `None` when the cursor
/// run is unknown (matching the SQL backend, where the boundary subquery
/// yields no rows).
fn select_runs(state: &RunState, filter: &RunsFilter, cursor: Option<RunId>) -> Option<Vec<Run>> {
    let boundary = match cursor {
        Some(cursor_id) => {
            let run = state.runs.get(&cursor_id)?;
            Some((run.created_at, run.id))
        }
        None => None,
    };
    let mut runs: Vec<Run> = state
        .runs
        .values()
        .filter(|run| filter.matches(run))
        .filter(|run| boundary.is_none_or(|b| (run.created_at, run.id) < b))
        .cloned()
        .collect();
    sort_newest_first(&mut runs);
    Some(runs)
}

#[async_trait]
impl StorageLifecycle for MemoryRunStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        *state = RunState::default();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.disposed = true;
        Ok(())
    }
}

#[async_trait]
impl RunStore for MemoryRunStore {
    async fn add_run(&self, run: Run) -> Result<Run> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        if state.runs.contains_key(&run.id) {
            return Err(Error::already_exists("run", run.id.to_string()));
        }
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn has_run(&self, run_id: RunId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.runs.contains_key(&run_id))
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.runs.get(&run_id).cloned())
    }

    async fn get_runs(
        &self,
        filter: &RunsFilter,
        cursor: Option<RunId>,
        limit: Option<usize>,
        bucket_by: Option<&BucketBy>,
    ) -> Result<Vec<Run>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let Some(runs) = select_runs(&state, filter, cursor) else {
            return Ok(Vec::new());
        };
        if let Some(bucket_by) = bucket_by {
            return Ok(bucket_runs(runs, bucket_by));
        }
        match limit {
            Some(limit) => Ok(runs.into_iter().take(limit).collect()),
            None => Ok(runs),
        }
    }

    async fn get_runs_count(&self, filter: &RunsFilter) -> Result<usize> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.runs.values().filter(|run| filter.matches(run)).count())
    }

    async fn get_run_group(&self, run_id: RunId) -> Result<Option<RunGroup>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let Some(run) = state.runs.get(&run_id) else {
            return Ok(None);
        };
        let Some(root_run_id) = run.root_run_id.or_else(|| {
            // The lineage root itself has no root pointer; it anchors a group
            // only if some other run points at it.
            state
                .runs
                .values()
                .any(|r| r.root_run_id == Some(run.id))
                .then_some(run.id)
        }) else {
            return Ok(None);
        };
        let mut runs: Vec<Run> = state
            .runs
            .values()
            .filter(|r| r.id == root_run_id || r.root_run_id == Some(root_run_id))
            .cloned()
            .collect();
        sort_newest_first(&mut runs);
        Ok(Some(RunGroup { root_run_id, runs }))
    }

    async fn handle_run_event(&self, run_id: RunId, event_type: EventType) -> Result<()> {
        let Some(new_status) = RunStatus::from_event(event_type) else {
            return Ok(());
        };
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        if let Some(run) = state.runs.get_mut(&run_id) {
            if run.status.can_transition_to(new_status) {
                run.status = new_status;
                run.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn add_run_tags(&self, run_id: RunId, tags: HashMap<String, String>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let run = state
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::not_found("run", run_id.to_string()))?;
        run.tags.extend(tags);
        Ok(())
    }

    async fn delete_run(&self, run_id: RunId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state
            .runs
            .remove(&run_id)
            .map(|_| ())
            .ok_or_else(|| Error::not_found("run", run_id.to_string()))
    }

    async fn add_snapshot(&self, payload: Value) -> Result<SnapshotId> {
        let digest = canonical::content_hash(&payload)?;
        let id = SnapshotId::from_digest(digest.clone())?;
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.snapshots.entry(digest).or_insert(Snapshot {
            id: id.clone(),
            payload,
        });
        Ok(id)
    }

    async fn has_snapshot(&self, snapshot_id: &SnapshotId) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.snapshots.contains_key(snapshot_id.as_str()))
    }

    async fn get_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Option<Snapshot>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.snapshots.get(snapshot_id.as_str()).cloned())
    }

    async fn add_backfill(&self, backfill: Backfill) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.backfills.insert(backfill.id, backfill);
        Ok(())
    }

    async fn update_backfill(&self, backfill: Backfill) -> Result<()> {
        self.add_backfill(backfill).await
    }

    async fn get_backfill(&self, backfill_id: BackfillId) -> Result<Option<Backfill>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.backfills.get(&backfill_id).cloned())
    }

    async fn get_backfills(
        &self,
        status: Option<BulkActionStatus>,
        cursor: Option<BackfillId>,
        limit: Option<usize>,
    ) -> Result<Vec<Backfill>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let boundary = match cursor {
            Some(cursor_id) => match state.backfills.get(&cursor_id) {
                Some(b) => Some((b.created_at, b.id)),
                None => return Ok(Vec::new()),
            },
            None => None,
        };
        let mut backfills: Vec<Backfill> = state
            .backfills
            .values()
            .filter(|b| status.is_none_or(|s| b.status == s))
            .filter(|b| boundary.is_none_or(|bd| (b.created_at, b.id) < bd))
            .cloned()
            .collect();
        backfills.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        match limit {
            Some(limit) => Ok(backfills.into_iter().take(limit).collect()),
            None => Ok(backfills),
        }
    }

    async fn add_daemon_heartbeat(&self, heartbeat: DaemonHeartbeat) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state
            .heartbeats
            .insert(heartbeat.daemon_name.clone(), heartbeat);
        Ok(())
    }

    async fn get_daemon_heartbeats(&self) -> Result<HashMap<String, DaemonHeartbeat>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.heartbeats.clone())
    }

    async fn wipe_daemon_heartbeats(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.heartbeats.clear();
        Ok(())
    }

    async fn kvs_get(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(keys
            .iter()
            .filter_map(|k| state.kvs.get(k).map(|v| (k.clone(), v.clone())))
            .collect())
    }

    async fn kvs_set(&self, pairs: HashMap<String, String>) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.kvs.extend(pairs);
        Ok(())
    }
}
