//! SQLite-backed event log store.
//!
//! The rowid of the `event_logs` table is the event cursor: `INTEGER PRIMARY
//! KEY AUTOINCREMENT` guarantees strictly increasing assignment even across
//! deletes, which is exactly the cursor contract. The asset index and the
//! append share one transaction, so a reader never observes an index entry
//! pointing at a missing event.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use strata_core::{AssetKey, Error, Result, RunId};

use super::watcher::{EventCursorReader, PollingEventWatcher, WatcherConfig};
use super::{
    AssetRecord, EventCallback, EventCursor, EventLogEntry, EventLogStore, EventRecord,
    EventRecordsFilter, EventType, WatchHandle,
};
use crate::db::{enum_str, sqlite_err, SqliteHandle};
use crate::lifecycle::StorageLifecycle;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS event_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    event_type TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    asset_key TEXT,
    partition_key TEXT,
    entry_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_logs_run ON event_logs (run_id, id);
CREATE INDEX IF NOT EXISTS idx_event_logs_asset ON event_logs (asset_key, id);
CREATE TABLE IF NOT EXISTS asset_records (
    asset_key TEXT PRIMARY KEY,
    last_event_id INTEGER NOT NULL,
    last_run_id TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS asset_wipes (
    asset_key TEXT PRIMARY KEY,
    wiped_below INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS partitions (
    partitions_def_name TEXT NOT NULL,
    partition_key TEXT NOT NULL,
    PRIMARY KEY (partitions_def_name, partition_key)
);
";

fn cursor_from_rowid(id: i64) -> EventCursor {
    EventCursor::new(u64::try_from(id).unwrap_or_default())
}

fn rowid_from_cursor(cursor: EventCursor) -> i64 {
    i64::try_from(cursor.value()).unwrap_or(i64::MAX)
}

fn decode_record(id: i64, json: &str) -> Result<EventRecord> {
    Ok(EventRecord {
        cursor: cursor_from_rowid(id),
        entry: serde_json::from_str(json)?,
    })
}

struct SqliteEventLogInner {
    db: SqliteHandle,
}

impl SqliteEventLogInner {
    fn fetch_record(&self, conn: &Connection, id: i64) -> Result<Option<EventRecord>> {
        let json: Option<String> = conn
            .query_row(
                "SELECT entry_json FROM event_logs WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        json.map(|j| decode_record(id, &j)).transpose()
    }
}

#[async_trait]
impl EventCursorReader for SqliteEventLogInner {
    async fn read_after(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, entry_json FROM event_logs
                     WHERE run_id = ?1 AND id > ?2
                     ORDER BY id ASC LIMIT ?3",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(
                    params![
                        run_id.to_string(),
                        rowid_from_cursor(cursor),
                        i64::try_from(limit).unwrap_or(i64::MAX),
                    ],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(sqlite_err)?;
            let mut records = Vec::new();
            for row in rows {
                let (id, json) = row.map_err(sqlite_err)?;
                records.push(decode_record(id, &json)?);
            }
            Ok(records)
        })
    }
}

/// [`EventLogStore`] persisted in a SQLite database.
pub struct SqliteEventLogStore {
    inner: Arc<SqliteEventLogInner>,
    watcher: PollingEventWatcher,
}

impl SqliteEventLogStore {
    /// Opens (creating if needed) the event log schema in the given database
    /// file, with default watcher tuning.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the file cannot be opened and
    /// `SchemaMismatch` if it was written by a newer schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(SqliteHandle::open(path, DDL)?, WatcherConfig::default())
    }

    /// Opens a database file with explicit watcher tuning.
    ///
    /// # Errors
    ///
    /// Same as [`open`](Self::open).
    pub fn open_with_watcher_config(
        path: impl AsRef<Path>,
        config: WatcherConfig,
    ) -> Result<Self> {
        Self::build(SqliteHandle::open(path, DDL)?, config)
    }

    /// Opens a private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the database cannot be opened.
    pub fn open_in_memory() -> Result<Self> {
        Self::build(SqliteHandle::open_in_memory(DDL)?, WatcherConfig::default())
    }

    fn build(db: SqliteHandle, config: WatcherConfig) -> Result<Self> {
        let inner = Arc::new(SqliteEventLogInner { db });
        let watcher = PollingEventWatcher::new(inner.clone(), config);
        Ok(Self { inner, watcher })
    }

    fn count_boundary(
        conn: &Connection,
        asset_key: &str,
        after_cursor: Option<EventCursor>,
    ) -> Result<i64> {
        let wiped: Option<i64> = conn
            .query_row(
                "SELECT wiped_below FROM asset_wipes WHERE asset_key = ?1",
                params![asset_key],
                |row| row.get(0),
            )
            .optional()
            .map_err(sqlite_err)?;
        Ok(wiped
            .unwrap_or(0)
            .max(after_cursor.map_or(0, rowid_from_cursor)))
    }
}

#[async_trait]
impl StorageLifecycle for SqliteEventLogStore {
    async fn migrate(&self) -> Result<()> {
        self.inner.db.apply_schema(DDL)
    }

    async fn optimize(&self) -> Result<()> {
        self.inner.db.optimize()
    }

    async fn wipe(&self) -> Result<()> {
        self.inner.db.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM event_logs;
                 DELETE FROM asset_records;
                 DELETE FROM asset_wipes;
                 DELETE FROM partitions;",
            )
            .map_err(sqlite_err)
        })
    }

    async fn dispose(&self) -> Result<()> {
        self.watcher.dispose()?;
        self.inner.db.close()
    }
}

#[async_trait]
impl EventLogStore for SqliteEventLogStore {
    async fn store_event(&self, entry: EventLogEntry) -> Result<EventCursor> {
        let json = serde_json::to_string(&entry)?;
        let event_type = enum_str(&entry.event_type)?;
        let asset_key = entry.asset.as_ref().map(|a| a.asset_key.to_string());
        let partition_key = entry.asset.as_ref().and_then(|a| a.partition.clone());

        self.inner.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            tx.execute(
                "INSERT INTO event_logs
                     (run_id, event_type, timestamp_us, asset_key, partition_key, entry_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    entry.run_id.to_string(),
                    event_type,
                    entry.timestamp.timestamp_micros(),
                    asset_key,
                    partition_key,
                    json,
                ],
            )
            .map_err(sqlite_err)?;
            let id = tx.last_insert_rowid();

            if entry.event_type == EventType::AssetMaterialized {
                if let Some(key) = &asset_key {
                    tx.execute(
                        "INSERT INTO asset_records (asset_key, last_event_id, last_run_id)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(asset_key) DO UPDATE SET
                             last_event_id = excluded.last_event_id,
                             last_run_id = excluded.last_run_id
                         WHERE excluded.last_event_id > asset_records.last_event_id",
                        params![key, id, entry.run_id.to_string()],
                    )
                    .map_err(sqlite_err)?;
                }
            }
            tx.commit().map_err(sqlite_err)?;
            Ok(cursor_from_rowid(id))
        })
    }

    async fn get_logs_for_run(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        of_type: Option<&[EventType]>,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>> {
        self.inner.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, entry_json FROM event_logs
                     WHERE run_id = ?1 AND id > ?2
                     ORDER BY id ASC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(
                    params![run_id.to_string(), rowid_from_cursor(cursor)],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(sqlite_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (id, json) = row.map_err(sqlite_err)?;
                let record = decode_record(id, &json)?;
                if of_type.is_none_or(|types| types.contains(&record.entry.event_type)) {
                    records.push(record);
                }
                if limit.is_some_and(|l| records.len() >= l) {
                    break;
                }
            }
            Ok(records)
        })
    }

    async fn get_event_records(
        &self,
        filter: &EventRecordsFilter,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<EventRecord>> {
        self.inner.db.with_conn(|conn| {
            let order = if ascending { "ASC" } else { "DESC" };
            let sql = format!(
                "SELECT id, entry_json FROM event_logs
                 WHERE (?1 IS NULL OR asset_key = ?1) AND id > ?2
                 ORDER BY id {order}"
            );
            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let rows = stmt
                .query_map(
                    params![
                        filter.asset_key.as_ref().map(ToString::to_string),
                        filter.after_cursor.map_or(0, rowid_from_cursor),
                    ],
                    |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(sqlite_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (id, json) = row.map_err(sqlite_err)?;
                let record = decode_record(id, &json)?;
                if filter.matches(&record) {
                    records.push(record);
                }
                if limit.is_some_and(|l| records.len() >= l) {
                    break;
                }
            }
            Ok(records)
        })
    }

    async fn get_latest_materialization_events(
        &self,
        asset_keys: &[AssetKey],
    ) -> Result<HashMap<AssetKey, EventRecord>> {
        self.inner.db.with_conn(|conn| {
            let mut events = HashMap::new();
            for key in asset_keys {
                let last_id: Option<i64> = conn
                    .query_row(
                        "SELECT last_event_id FROM asset_records WHERE asset_key = ?1",
                        params![key.to_string()],
                        |row| row.get(0),
                    )
                    .optional()
                    .map_err(sqlite_err)?;
                if let Some(id) = last_id {
                    if let Some(record) = self.inner.fetch_record(conn, id)? {
                        events.insert(key.clone(), record);
                    }
                }
            }
            Ok(events)
        })
    }

    async fn get_asset_records(
        &self,
        asset_keys: Option<&[AssetKey]>,
    ) -> Result<Vec<AssetRecord>> {
        self.inner.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT asset_key, last_event_id FROM asset_records ORDER BY asset_key ASC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(sqlite_err)?;

            let mut records = Vec::new();
            for row in rows {
                let (key_text, last_id) = row.map_err(sqlite_err)?;
                let key: AssetKey = key_text.parse()?;
                if asset_keys.is_some_and(|keys| !keys.contains(&key)) {
                    continue;
                }
                if let Some(last_materialization) = self.inner.fetch_record(conn, last_id)? {
                    records.push(AssetRecord {
                        asset_key: key,
                        last_materialization,
                    });
                }
            }
            Ok(records)
        })
    }

    async fn has_asset_key(&self, asset_key: &AssetKey) -> Result<bool> {
        self.inner.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM asset_records WHERE asset_key = ?1",
                params![asset_key.to_string()],
                |_| Ok(()),
            )
            .optional()
            .map_err(sqlite_err)
            .map(|row| row.is_some())
        })
    }

    async fn all_asset_keys(&self) -> Result<Vec<AssetKey>> {
        self.inner.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT asset_key FROM asset_records ORDER BY asset_key ASC")
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(sqlite_err)?.parse()?);
            }
            Ok(keys)
        })
    }

    async fn wipe_asset(&self, asset_key: &AssetKey) -> Result<()> {
        self.inner.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let boundary: i64 = tx
                .query_row("SELECT COALESCE(MAX(id), 0) FROM event_logs", [], |row| {
                    row.get(0)
                })
                .map_err(sqlite_err)?;
            tx.execute(
                "INSERT OR REPLACE INTO asset_wipes (asset_key, wiped_below) VALUES (?1, ?2)",
                params![asset_key.to_string(), boundary],
            )
            .map_err(sqlite_err)?;
            tx.execute(
                "DELETE FROM asset_records WHERE asset_key = ?1",
                params![asset_key.to_string()],
            )
            .map_err(sqlite_err)?;
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn add_partitions(&self, partitions_def_name: &str, keys: &[String]) -> Result<()> {
        self.inner.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            {
                let mut stmt = tx
                    .prepare(
                        "INSERT OR IGNORE INTO partitions (partitions_def_name, partition_key)
                         VALUES (?1, ?2)",
                    )
                    .map_err(sqlite_err)?;
                for key in keys {
                    stmt.execute(params![partitions_def_name, key])
                        .map_err(sqlite_err)?;
                }
            }
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn delete_partition(&self, partitions_def_name: &str, key: &str) -> Result<()> {
        self.inner.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM partitions WHERE partitions_def_name = ?1 AND partition_key = ?2",
                    params![partitions_def_name, key],
                )
                .map_err(sqlite_err)?;
            if deleted == 0 {
                return Err(Error::not_found(
                    "partition",
                    format!("{partitions_def_name}/{key}"),
                ));
            }
            Ok(())
        })
    }

    async fn get_partitions(&self, partitions_def_name: &str) -> Result<Vec<String>> {
        self.inner.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT partition_key FROM partitions
                     WHERE partitions_def_name = ?1 ORDER BY rowid ASC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(params![partitions_def_name], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row.map_err(sqlite_err)?);
            }
            Ok(keys)
        })
    }

    async fn has_partition(&self, partitions_def_name: &str, key: &str) -> Result<bool> {
        self.inner.db.with_conn(|conn| {
            conn.query_row(
                "SELECT 1 FROM partitions WHERE partitions_def_name = ?1 AND partition_key = ?2",
                params![partitions_def_name, key],
                |_| Ok(()),
            )
            .optional()
            .map_err(sqlite_err)
            .map(|row| row.is_some())
        })
    }

    async fn get_materialization_count_by_partition(
        &self,
        asset_keys: &[AssetKey],
        after_cursor: Option<EventCursor>,
    ) -> Result<HashMap<AssetKey, HashMap<String, usize>>> {
        let materialized = enum_str(&EventType::AssetMaterialized)?;
        self.inner.db.with_conn(|conn| {
            let mut counts = HashMap::new();
            for key in asset_keys {
                let key_text = key.to_string();
                let boundary = Self::count_boundary(conn, &key_text, after_cursor)?;
                let mut stmt = conn
                    .prepare(
                        "SELECT partition_key, COUNT(*) FROM event_logs
                         WHERE event_type = ?1
                           AND asset_key = ?2
                           AND partition_key IS NOT NULL
                           AND id > ?3
                         GROUP BY partition_key",
                    )
                    .map_err(sqlite_err)?;
                let rows = stmt
                    .query_map(params![materialized, key_text, boundary], |row| {
                        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                    })
                    .map_err(sqlite_err)?;
                let mut per_partition = HashMap::new();
                for row in rows {
                    let (partition, count) = row.map_err(sqlite_err)?;
                    per_partition.insert(partition, usize::try_from(count).unwrap_or_default());
                }
                counts.insert(key.clone(), per_partition);
            }
            Ok(counts)
        })
    }

    async fn delete_events(&self, run_id: RunId) -> Result<()> {
        self.inner.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            tx.execute(
                "DELETE FROM event_logs WHERE run_id = ?1",
                params![run_id.to_string()],
            )
            .map_err(sqlite_err)?;
            tx.execute(
                "DELETE FROM asset_records WHERE last_run_id = ?1",
                params![run_id.to_string()],
            )
            .map_err(sqlite_err)?;
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn watch(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        callback: EventCallback,
    ) -> Result<WatchHandle> {
        self.watcher.watch(run_id, cursor, callback)
    }

    async fn end_watch(&self, run_id: RunId, handle: WatchHandle) -> Result<()> {
        self.watcher.end_watch(run_id, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_entry(run_id: RunId) -> EventLogEntry {
        EventLogEntry::new(run_id, EventType::StepStarted, "step started")
    }

    fn materialization(run_id: RunId, key: &AssetKey, partition: &str) -> EventLogEntry {
        EventLogEntry::materialization(run_id, key.clone(), Some(partition.to_string()))
    }

    #[tokio::test]
    async fn rowid_cursor_is_strictly_increasing() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        let run_id = RunId::generate();
        let first = store.store_event(step_entry(run_id)).await?;
        let second = store.store_event(step_entry(run_id)).await?;
        assert!(second > first);

        let records = store
            .get_logs_for_run(run_id, first, None, None)
            .await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].cursor, second);
        Ok(())
    }

    #[tokio::test]
    async fn type_filter_and_limit_apply_after_decode() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        let run_id = RunId::generate();
        store.store_event(step_entry(run_id)).await?;
        store
            .store_event(EventLogEntry::new(run_id, EventType::StepSucceeded, "done"))
            .await?;
        store.store_event(step_entry(run_id)).await?;

        let started = store
            .get_logs_for_run(
                run_id,
                EventCursor::START,
                Some(&[EventType::StepStarted]),
                Some(1),
            )
            .await?;
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].entry.event_type, EventType::StepStarted);
        Ok(())
    }

    #[tokio::test]
    async fn asset_index_and_records_queries() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        let run_id = RunId::generate();
        let key = AssetKey::new(["warehouse", "orders"]);
        store.store_event(materialization(run_id, &key, "p1")).await?;
        let latest = store.store_event(materialization(run_id, &key, "p2")).await?;

        assert!(store.has_asset_key(&key).await?);
        assert_eq!(store.all_asset_keys().await?, vec![key.clone()]);

        let events = store
            .get_latest_materialization_events(std::slice::from_ref(&key))
            .await?;
        assert_eq!(events[&key].cursor, latest);

        let records = store.get_asset_records(None).await?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].last_materialization.cursor, latest);

        let filter = EventRecordsFilter::materializations(key);
        let descending = store.get_event_records(&filter, None, false).await?;
        assert_eq!(descending.len(), 2);
        assert!(descending[0].cursor > descending[1].cursor);
        Ok(())
    }

    #[tokio::test]
    async fn wipe_asset_hides_prior_materializations() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        let run_id = RunId::generate();
        let key = AssetKey::new(["metrics"]);
        store.store_event(materialization(run_id, &key, "p1")).await?;
        store.wipe_asset(&key).await?;

        assert!(!store.has_asset_key(&key).await?);
        let counts = store
            .get_materialization_count_by_partition(std::slice::from_ref(&key), None)
            .await?;
        assert!(counts[&key].is_empty());

        store.store_event(materialization(run_id, &key, "p1")).await?;
        let counts = store
            .get_materialization_count_by_partition(std::slice::from_ref(&key), None)
            .await?;
        assert_eq!(counts[&key]["p1"], 1);
        Ok(())
    }

    #[tokio::test]
    async fn partitions_roundtrip_in_insertion_order() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        store
            .add_partitions("daily", &["2024-01-02".into(), "2024-01-01".into()])
            .await?;
        store.add_partitions("daily", &["2024-01-01".into()]).await?;
        assert_eq!(
            store.get_partitions("daily").await?,
            vec!["2024-01-02".to_string(), "2024-01-01".to_string()]
        );
        assert!(store.has_partition("daily", "2024-01-02").await?);

        store.delete_partition("daily", "2024-01-02").await?;
        let err = store.delete_partition("daily", "2024-01-02").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn delete_events_drops_run_and_its_index_entries() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        let run_id = RunId::generate();
        let key = AssetKey::new(["warehouse", "orders"]);
        store.store_event(step_entry(run_id)).await?;
        store.store_event(materialization(run_id, &key, "p1")).await?;

        store.delete_events(run_id).await?;
        assert!(store
            .get_logs_for_run(run_id, EventCursor::START, None, None)
            .await?
            .is_empty());
        assert!(!store.has_asset_key(&key).await?);
        Ok(())
    }

    #[tokio::test]
    async fn watch_polls_events_out_of_the_database() -> Result<()> {
        use std::sync::Mutex;
        use std::time::Duration;

        let dir = std::env::temp_dir().join(format!("strata-watch-{}", RunId::generate()));
        std::fs::create_dir_all(&dir).map_err(|e| Error::backend(e.to_string()))?;
        let store = SqliteEventLogStore::open_with_watcher_config(
            dir.join("events.db"),
            WatcherConfig {
                poll_interval: Duration::from_millis(5),
                ..WatcherConfig::default()
            },
        )?;
        let run_id = RunId::generate();
        let seen: Arc<Mutex<Vec<EventCursor>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let handle = store
            .watch(
                run_id,
                EventCursor::START,
                Arc::new(move |record| {
                    seen_cb.lock().unwrap().push(record.cursor);
                    Ok(())
                }),
            )
            .await?;

        let first = store.store_event(step_entry(run_id)).await?;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*seen.lock().unwrap(), vec![first]);

        store.end_watch(run_id, handle).await?;
        store.dispose().await?;
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }

    #[tokio::test]
    async fn dispose_closes_the_connection() -> Result<()> {
        let store = SqliteEventLogStore::open_in_memory()?;
        store.dispose().await?;
        assert!(store
            .store_event(step_entry(RunId::generate()))
            .await
            .is_err());
        store.dispose().await?;
        Ok(())
    }
}
