//! SQLite-backed run store.
//!
//! Rows carry the full run as JSON plus a few indexed columns for ordering
//! and common filters; richer predicates (tags, status sets) are applied to
//! the decoded rows, keeping filter semantics byte-identical with the
//! in-memory backend.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use strata_core::{canonical, BackfillId, Error, Result, RunId, SnapshotId};

use super::{
    bucket_runs, Backfill, BucketBy, BulkActionStatus, DaemonHeartbeat, Run, RunGroup, RunStatus,
    RunStore, RunsFilter, Snapshot,
};
use crate::db::{enum_str, sqlite_err, SqliteHandle};
use crate::event_log::EventType;
use crate::lifecycle::StorageLifecycle;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id TEXT PRIMARY KEY,
    job_name TEXT NOT NULL,
    status TEXT NOT NULL,
    root_run_id TEXT,
    created_at_us INTEGER NOT NULL,
    run_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_runs_ordering ON runs (created_at_us DESC, run_id DESC);
CREATE INDEX IF NOT EXISTS idx_runs_root ON runs (root_run_id);
CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id TEXT PRIMARY KEY,
    payload_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS backfills (
    backfill_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    created_at_us INTEGER NOT NULL,
    backfill_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS daemon_heartbeats (
    daemon_name TEXT PRIMARY KEY,
    heartbeat_json TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS kvs (
    k TEXT PRIMARY KEY,
    v TEXT NOT NULL
);
";

fn constraint_to_exists(entity: &'static str, key: String, err: rusqlite::Error) -> Error {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::already_exists(entity, key)
        }
        _ => sqlite_err(err),
    }
}

/// [`RunStore`] persisted in a SQLite database.
pub struct SqliteRunStore {
    db: SqliteHandle,
}

impl SqliteRunStore {
    /// Opens (creating if needed) the run schema in the given database file.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the file cannot be opened and
    /// `SchemaMismatch` if it was written by a newer schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            db: SqliteHandle::open(path, DDL)?,
        })
    }

    /// Opens a private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: SqliteHandle::open_in_memory(DDL)?,
        })
    }

    fn insert_run(&self, run: &Run) -> Result<()> {
        let json = serde_json::to_string(run)?;
        let status = enum_str(&run.status)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO runs (run_id, job_name, status, root_run_id, created_at_us, run_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run.id.to_string(),
                    run.job_name,
                    status,
                    run.root_run_id.map(|id| id.to_string()),
                    run.created_at.timestamp_micros(),
                    json,
                ],
            )
            .map_err(|err| constraint_to_exists("run", run.id.to_string(), err))?;
            Ok(())
        })
    }

    /// Rewrites an existing run row from its decoded form.
    fn update_run_row(conn: &rusqlite::Connection, run: &Run) -> Result<()> {
        conn.execute(
            "UPDATE runs SET status = ?2, run_json = ?3 WHERE run_id = ?1",
            params![
                run.id.to_string(),
                enum_str(&run.status)?,
                serde_json::to_string(run)?,
            ],
        )
        .map_err(sqlite_err)?;
        Ok(())
    }

    /// Filtered runs in newest-first order; `None` when the cursor run is
    /// unknown.
    fn select_runs(&self, filter: &RunsFilter, cursor: Option<RunId>) -> Result<Option<Vec<Run>>> {
        self.db.with_conn(|conn| {
            let boundary = match cursor {
                Some(cursor_id) => {
                    let row: Option<i64> = conn
                        .query_row(
                            "SELECT created_at_us FROM runs WHERE run_id = ?1",
                            params![cursor_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(sqlite_err)?;
                    match row {
                        Some(created_at_us) => Some((created_at_us, cursor_id.to_string())),
                        None => return Ok(None),
                    }
                }
                None => None,
            };

            let mut stmt = conn
                .prepare(
                    "SELECT run_json FROM runs
                     WHERE ?1 IS NULL
                        OR created_at_us < ?1
                        OR (created_at_us = ?1 AND run_id < ?2)
                     ORDER BY created_at_us DESC, run_id DESC",
                )
                .map_err(sqlite_err)?;
            let (bound_us, bound_id) = match &boundary {
                Some((us, id)) => (Some(*us), Some(id.as_str())),
                None => (None, None),
            };
            let rows = stmt
                .query_map(params![bound_us, bound_id], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?;

            let mut runs = Vec::new();
            for row in rows {
                let run: Run = serde_json::from_str(&row.map_err(sqlite_err)?)?;
                if filter.matches(&run) {
                    runs.push(run);
                }
            }
            Ok(Some(runs))
        })
    }
}

#[async_trait]
impl StorageLifecycle for SqliteRunStore {
    async fn migrate(&self) -> Result<()> {
        self.db.apply_schema(DDL)
    }

    async fn optimize(&self) -> Result<()> {
        self.db.optimize()
    }

    async fn wipe(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM runs;
                 DELETE FROM snapshots;
                 DELETE FROM backfills;
                 DELETE FROM daemon_heartbeats;
                 DELETE FROM kvs;",
            )
            .map_err(sqlite_err)
        })
    }

    async fn dispose(&self) -> Result<()> {
        self.db.close()
    }
}

#[async_trait]
impl RunStore for SqliteRunStore {
    async fn add_run(&self, run: Run) -> Result<Run> {
        self.insert_run(&run)?;
        Ok(run)
    }

    async fn has_run(&self, run_id: RunId) -> Result<bool> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM runs WHERE run_id = ?1",
                params![run_id.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map_err(sqlite_err)
            .map(|row| row.is_some())
        })
    }

    async fn get_run(&self, run_id: RunId) -> Result<Option<Run>> {
        self.db.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT run_json FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(Error::from))
                .transpose()
        })
    }

    async fn get_runs(
        &self,
        filter: &RunsFilter,
        cursor: Option<RunId>,
        limit: Option<usize>,
        bucket_by: Option<&BucketBy>,
    ) -> Result<Vec<Run>> {
        let Some(runs) = self.select_runs(filter, cursor)? else {
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
        let runs = self
            .select_runs(filter, None)?
            .unwrap_or_default();
        Ok(runs.len())
    }

    async fn get_run_group(&self, run_id: RunId) -> Result<Option<RunGroup>> {
        let Some(run) = self.get_run(run_id).await? else {
            return Ok(None);
        };
        let root_run_id = match run.root_run_id {
            Some(root) => root,
            None => {
                let anchors = self.db.with_conn(|conn| {
                    conn.query_row(
                        "SELECT 1 FROM runs WHERE root_run_id = ?1 LIMIT 1",
                        params![run.id.to_string()],
                        |_| Ok(()),
                    )
                    .optional()
                    .map_err(sqlite_err)
                    .map(|row| row.is_some())
                })?;
                if !anchors {
                    return Ok(None);
                }
                run.id
            }
        };

        let runs = self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT run_json FROM runs
                     WHERE run_id = ?1 OR root_run_id = ?1
                     ORDER BY created_at_us DESC, run_id DESC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(params![root_run_id.to_string()], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(sqlite_err)?;
            let mut runs = Vec::new();
            for row in rows {
                runs.push(serde_json::from_str::<Run>(&row.map_err(sqlite_err)?)?);
            }
            Ok(runs)
        })?;
        Ok(Some(RunGroup { root_run_id, runs }))
    }

    async fn handle_run_event(&self, run_id: RunId, event_type: EventType) -> Result<()> {
        let Some(new_status) = RunStatus::from_event(event_type) else {
            return Ok(());
        };
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let json: Option<String> = tx
                .query_row(
                    "SELECT run_json FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            if let Some(json) = json {
                let mut run: Run = serde_json::from_str(&json)?;
                if run.status.can_transition_to(new_status) {
                    run.status = new_status;
                    run.updated_at = Utc::now();
                    Self::update_run_row(&tx, &run)?;
                }
            }
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn add_run_tags(&self, run_id: RunId, tags: HashMap<String, String>) -> Result<()> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let json: Option<String> = tx
                .query_row(
                    "SELECT run_json FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            let Some(json) = json else {
                return Err(Error::not_found("run", run_id.to_string()));
            };
            let mut run: Run = serde_json::from_str(&json)?;
            run.tags.extend(tags);
            Self::update_run_row(&tx, &run)?;
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn delete_run(&self, run_id: RunId) -> Result<()> {
        self.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM runs WHERE run_id = ?1",
                    params![run_id.to_string()],
                )
                .map_err(sqlite_err)?;
            if deleted == 0 {
                return Err(Error::not_found("run", run_id.to_string()));
            }
            Ok(())
        })
    }

    async fn add_snapshot(&self, payload: Value) -> Result<SnapshotId> {
        let digest = canonical::content_hash(&payload)?;
        let id = SnapshotId::from_digest(digest)?;
        let json = serde_json::to_string(&payload)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO snapshots (snapshot_id, payload_json) VALUES (?1, ?2)",
                params![id.as_str(), json],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })?;
        Ok(id)
    }

    async fn has_snapshot(&self, snapshot_id: &SnapshotId) -> Result<bool> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM snapshots WHERE snapshot_id = ?1",
                params![snapshot_id.as_str()],
                |_| Ok(()),
            )
            .optional()
            .map_err(sqlite_err)
            .map(|row| row.is_some())
        })
    }

    async fn get_snapshot(&self, snapshot_id: &SnapshotId) -> Result<Option<Snapshot>> {
        self.db.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT payload_json FROM snapshots WHERE snapshot_id = ?1",
                    params![snapshot_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            json.map(|j| {
                Ok(Snapshot {
                    id: snapshot_id.clone(),
                    payload: serde_json::from_str(&j)?,
                })
            })
            .transpose()
        })
    }

    async fn add_backfill(&self, backfill: Backfill) -> Result<()> {
        let json = serde_json::to_string(&backfill)?;
        let status = enum_str(&backfill.status)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO backfills (backfill_id, status, created_at_us, backfill_json)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(backfill_id) DO UPDATE SET
                     status = excluded.status,
                     backfill_json = excluded.backfill_json",
                params![
                    backfill.id.to_string(),
                    status,
                    backfill.created_at.timestamp_micros(),
                    json,
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
    }

    async fn update_backfill(&self, backfill: Backfill) -> Result<()> {
        self.add_backfill(backfill).await
    }

    async fn get_backfill(&self, backfill_id: BackfillId) -> Result<Option<Backfill>> {
        self.db.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT backfill_json FROM backfills WHERE backfill_id = ?1",
                    params![backfill_id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(Error::from))
                .transpose()
        })
    }

    async fn get_backfills(
        &self,
        status: Option<BulkActionStatus>,
        cursor: Option<BackfillId>,
        limit: Option<usize>,
    ) -> Result<Vec<Backfill>> {
        let status = status.map(|s| enum_str(&s)).transpose()?;
        self.db.with_conn(|conn| {
            let boundary = match cursor {
                Some(cursor_id) => {
                    let row: Option<i64> = conn
                        .query_row(
                            "SELECT created_at_us FROM backfills WHERE backfill_id = ?1",
                            params![cursor_id.to_string()],
                            |row| row.get(0),
                        )
                        .optional()
                        .map_err(sqlite_err)?;
                    match row {
                        Some(created_at_us) => Some((created_at_us, cursor_id.to_string())),
                        None => return Ok(Vec::new()),
                    }
                }
                None => None,
            };

            let mut stmt = conn
                .prepare(
                    "SELECT backfill_json FROM backfills
                     WHERE (?1 IS NULL
                            OR created_at_us < ?1
                            OR (created_at_us = ?1 AND backfill_id < ?2))
                       AND (?3 IS NULL OR status = ?3)
                     ORDER BY created_at_us DESC, backfill_id DESC",
                )
                .map_err(sqlite_err)?;
            let (bound_us, bound_id) = match &boundary {
                Some((us, id)) => (Some(*us), Some(id.as_str())),
                None => (None, None),
            };
            let rows = stmt
                .query_map(params![bound_us, bound_id, status], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(sqlite_err)?;

            let mut backfills = Vec::new();
            for row in rows {
                backfills.push(serde_json::from_str::<Backfill>(&row.map_err(sqlite_err)?)?);
                if limit.is_some_and(|l| backfills.len() >= l) {
                    break;
                }
            }
            Ok(backfills)
        })
    }

    async fn add_daemon_heartbeat(&self, heartbeat: DaemonHeartbeat) -> Result<()> {
        let json = serde_json::to_string(&heartbeat)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO daemon_heartbeats (daemon_name, heartbeat_json)
                 VALUES (?1, ?2)",
                params![heartbeat.daemon_name, json],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })
    }

    async fn get_daemon_heartbeats(&self) -> Result<HashMap<String, DaemonHeartbeat>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT daemon_name, heartbeat_json FROM daemon_heartbeats")
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(sqlite_err)?;
            let mut heartbeats = HashMap::new();
            for row in rows {
                let (name, json) = row.map_err(sqlite_err)?;
                heartbeats.insert(name, serde_json::from_str(&json)?);
            }
            Ok(heartbeats)
        })
    }

    async fn wipe_daemon_heartbeats(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM daemon_heartbeats", [])
                .map_err(sqlite_err)?;
            Ok(())
        })
    }

    async fn kvs_get(&self, keys: &[String]) -> Result<HashMap<String, String>> {
        self.db.with_conn(|conn| {
            let mut pairs = HashMap::new();
            let mut stmt = conn
                .prepare("SELECT v FROM kvs WHERE k = ?1")
                .map_err(sqlite_err)?;
            for key in keys {
                let value: Option<String> = stmt
                    .query_row(params![key], |row| row.get(0))
                    .optional()
                    .map_err(sqlite_err)?;
                if let Some(value) = value {
                    pairs.insert(key.clone(), value);
                }
            }
            Ok(pairs)
        })
    }

    async fn kvs_set(&self, pairs: HashMap<String, String>) -> Result<()> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            {
                let mut stmt = tx
                    .prepare("INSERT OR REPLACE INTO kvs (k, v) VALUES (?1, ?2)")
                    .map_err(sqlite_err)?;
                for (key, value) in &pairs {
                    stmt.execute(params![key, value]).map_err(sqlite_err)?;
                }
            }
            tx.commit().map_err(sqlite_err)
        })
    }
}
