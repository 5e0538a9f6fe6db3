//! SQLite-backed schedule/sensor state store.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};

use strata_core::{Error, Result, TickId};

use super::{
    InstigatorState, InstigatorTick, InstigatorType, ScheduleStore, TickData, TickStatus,
};
use crate::db::{enum_str, sqlite_err, SqliteHandle};
use crate::lifecycle::StorageLifecycle;

const DDL: &str = "
CREATE TABLE IF NOT EXISTS instigator_state (
    origin_id TEXT NOT NULL,
    selector_id TEXT NOT NULL,
    instigator_type TEXT NOT NULL,
    state_json TEXT NOT NULL,
    PRIMARY KEY (origin_id, selector_id)
);
CREATE TABLE IF NOT EXISTS ticks (
    tick_id TEXT PRIMARY KEY,
    origin_id TEXT NOT NULL,
    selector_id TEXT NOT NULL,
    status TEXT NOT NULL,
    timestamp_us INTEGER NOT NULL,
    tick_json TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ticks_instigator
    ON ticks (origin_id, selector_id, timestamp_us DESC);
CREATE INDEX IF NOT EXISTS idx_ticks_selector ON ticks (selector_id, timestamp_us DESC);
";

fn decode_tick(id: &str, json: &str) -> Result<InstigatorTick> {
    Ok(InstigatorTick {
        id: id.parse()?,
        data: serde_json::from_str(json)?,
    })
}

/// [`ScheduleStore`] persisted in a SQLite database.
pub struct SqliteScheduleStore {
    db: SqliteHandle,
}

impl SqliteScheduleStore {
    /// Opens (creating if needed) the schedule schema in the given database
    /// file.
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

    fn write_state(&self, state: &InstigatorState, must_exist: bool) -> Result<()> {
        let json = serde_json::to_string(state)?;
        let instigator_type = enum_str(&state.instigator_type)?;
        self.db.with_conn(|conn| {
            if must_exist {
                let updated = conn
                    .execute(
                        "UPDATE instigator_state
                         SET instigator_type = ?3, state_json = ?4
                         WHERE origin_id = ?1 AND selector_id = ?2",
                        params![state.origin_id, state.selector_id, instigator_type, json],
                    )
                    .map_err(sqlite_err)?;
                if updated == 0 {
                    return Err(Error::not_found(
                        "instigator state",
                        format!("{}/{}", state.origin_id, state.selector_id),
                    ));
                }
                Ok(())
            } else {
                conn.execute(
                    "INSERT INTO instigator_state
                         (origin_id, selector_id, instigator_type, state_json)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![state.origin_id, state.selector_id, instigator_type, json],
                )
                .map_err(|err| match &err {
                    rusqlite::Error::SqliteFailure(e, _)
                        if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                    {
                        Error::already_exists(
                            "instigator state",
                            format!("{}/{}", state.origin_id, state.selector_id),
                        )
                    }
                    _ => sqlite_err(err),
                })?;
                Ok(())
            }
        })
    }
}

#[async_trait]
impl StorageLifecycle for SqliteScheduleStore {
    async fn migrate(&self) -> Result<()> {
        self.db.apply_schema(DDL)
    }

    async fn optimize(&self) -> Result<()> {
        self.db.optimize()
    }

    async fn wipe(&self) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute_batch(
                "DELETE FROM instigator_state;
                 DELETE FROM ticks;",
            )
            .map_err(sqlite_err)
        })
    }

    async fn dispose(&self) -> Result<()> {
        self.db.close()
    }
}

#[async_trait]
impl ScheduleStore for SqliteScheduleStore {
    async fn all_instigator_state(
        &self,
        instigator_type: Option<InstigatorType>,
    ) -> Result<Vec<InstigatorState>> {
        let instigator_type = instigator_type.map(|t| enum_str(&t)).transpose()?;
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT state_json FROM instigator_state
                     WHERE ?1 IS NULL OR instigator_type = ?1
                     ORDER BY origin_id ASC, selector_id ASC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(params![instigator_type], |row| row.get::<_, String>(0))
                .map_err(sqlite_err)?;
            let mut states = Vec::new();
            for row in rows {
                states.push(serde_json::from_str(&row.map_err(sqlite_err)?)?);
            }
            Ok(states)
        })
    }

    async fn get_instigator_state(
        &self,
        origin_id: &str,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>> {
        self.db.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM instigator_state
                     WHERE origin_id = ?1 AND selector_id = ?2",
                    params![origin_id, selector_id],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            json.map(|j| serde_json::from_str(&j).map_err(Error::from))
                .transpose()
        })
    }

    async fn add_instigator_state(&self, state: InstigatorState) -> Result<InstigatorState> {
        self.write_state(&state, false)?;
        Ok(state)
    }

    async fn update_instigator_state(&self, state: InstigatorState) -> Result<InstigatorState> {
        self.write_state(&state, true)?;
        Ok(state)
    }

    async fn delete_instigator_state(&self, origin_id: &str, selector_id: &str) -> Result<()> {
        self.db.with_conn(|conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM instigator_state WHERE origin_id = ?1 AND selector_id = ?2",
                    params![origin_id, selector_id],
                )
                .map_err(sqlite_err)?;
            if deleted == 0 {
                return Err(Error::not_found(
                    "instigator state",
                    format!("{origin_id}/{selector_id}"),
                ));
            }
            Ok(())
        })
    }

    async fn create_tick(&self, tick_data: TickData) -> Result<InstigatorTick> {
        let tick = InstigatorTick {
            id: TickId::generate(),
            data: tick_data,
        };
        let json = serde_json::to_string(&tick.data)?;
        let status = enum_str(&tick.data.status)?;
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ticks
                     (tick_id, origin_id, selector_id, status, timestamp_us, tick_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    tick.id.to_string(),
                    tick.data.origin_id,
                    tick.data.selector_id,
                    status,
                    tick.data.timestamp.timestamp_micros(),
                    json,
                ],
            )
            .map_err(sqlite_err)?;
            Ok(())
        })?;
        Ok(tick)
    }

    async fn update_tick(&self, tick: InstigatorTick) -> Result<()> {
        self.db.with_conn_mut(|conn| {
            let tx = conn.transaction().map_err(sqlite_err)?;
            let stored_json: Option<String> = tx
                .query_row(
                    "SELECT tick_json FROM ticks WHERE tick_id = ?1",
                    params![tick.id.to_string()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(sqlite_err)?;
            let Some(stored_json) = stored_json else {
                return Err(Error::not_found("tick", tick.id.to_string()));
            };
            let stored: TickData = serde_json::from_str(&stored_json)?;

            let mut data = tick.data;
            data.timestamp = stored.timestamp;
            tx.execute(
                "UPDATE ticks SET status = ?2, tick_json = ?3 WHERE tick_id = ?1",
                params![
                    tick.id.to_string(),
                    enum_str(&data.status)?,
                    serde_json::to_string(&data)?,
                ],
            )
            .map_err(sqlite_err)?;
            tx.commit().map_err(sqlite_err)
        })
    }

    async fn get_ticks(
        &self,
        origin_id: &str,
        selector_id: &str,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<Vec<InstigatorTick>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT tick_id, tick_json FROM ticks
                     WHERE origin_id = ?1 AND selector_id = ?2
                       AND (?3 IS NULL OR timestamp_us < ?3)
                       AND (?4 IS NULL OR timestamp_us > ?4)
                     ORDER BY timestamp_us DESC, tick_id DESC",
                )
                .map_err(sqlite_err)?;
            let rows = stmt
                .query_map(
                    params![
                        origin_id,
                        selector_id,
                        before.map(|t| t.timestamp_micros()),
                        after.map(|t| t.timestamp_micros()),
                    ],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
                )
                .map_err(sqlite_err)?;

            let mut ticks = Vec::new();
            for row in rows {
                let (id, json) = row.map_err(sqlite_err)?;
                let tick = decode_tick(&id, &json)?;
                if statuses.is_none_or(|s| s.contains(&tick.data.status)) {
                    ticks.push(tick);
                }
                if limit.is_some_and(|l| ticks.len() >= l) {
                    break;
                }
            }
            Ok(ticks)
        })
    }

    async fn get_batch_ticks(
        &self,
        selector_ids: &[String],
        limit: Option<usize>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<HashMap<String, Vec<InstigatorTick>>> {
        let mut grouped: HashMap<String, Vec<InstigatorTick>> = selector_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        if selector_ids.is_empty() {
            return Ok(grouped);
        }

        self.db.with_conn(|conn| {
            let placeholders = vec!["?"; selector_ids.len()].join(", ");
            let sql = format!(
                "SELECT tick_id, selector_id, tick_json FROM ticks
                 WHERE selector_id IN ({placeholders})
                 ORDER BY timestamp_us DESC, tick_id DESC"
            );
            let mut stmt = conn.prepare(&sql).map_err(sqlite_err)?;
            let rows = stmt
                .query_map(params_from_iter(selector_ids.iter()), |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .map_err(sqlite_err)?;

            for row in rows {
                let (id, selector_id, json) = row.map_err(sqlite_err)?;
                let tick = decode_tick(&id, &json)?;
                if statuses.is_some_and(|s| !s.contains(&tick.data.status)) {
                    continue;
                }
                if let Some(ticks) = grouped.get_mut(&selector_id) {
                    if limit.is_none_or(|l| ticks.len() < l) {
                        ticks.push(tick);
                    }
                }
            }
            Ok(())
        })?;
        Ok(grouped)
    }

    async fn purge_ticks(
        &self,
        origin_id: &str,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<usize> {
        let status_strs = statuses
            .map(|s| s.iter().map(enum_str).collect::<Result<Vec<_>>>())
            .transpose()?;
        self.db.with_conn(|conn| {
            let deleted = match &status_strs {
                Some(status_strs) => {
                    let placeholders = vec!["?"; status_strs.len()].join(", ");
                    let sql = format!(
                        "DELETE FROM ticks
                         WHERE origin_id = ?1 AND selector_id = ?2 AND timestamp_us < ?3
                           AND status IN ({placeholders})"
                    );
                    let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![
                        Box::new(origin_id.to_string()),
                        Box::new(selector_id.to_string()),
                        Box::new(before.timestamp_micros()),
                    ];
                    for status in status_strs {
                        params.push(Box::new(status.clone()));
                    }
                    conn.execute(&sql, params_from_iter(params.iter().map(|p| p.as_ref())))
                        .map_err(sqlite_err)?
                }
                None => conn
                    .execute(
                        "DELETE FROM ticks
                         WHERE origin_id = ?1 AND selector_id = ?2 AND timestamp_us < ?3",
                        params![origin_id, selector_id, before.timestamp_micros()],
                    )
                    .map_err(sqlite_err)?,
            };
            Ok(deleted)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::InstigatorStatus;
    use super::*;
    use chrono::Duration;

    fn schedule_state(origin: &str, selector: &str) -> InstigatorState {
        InstigatorState {
            origin_id: origin.to_string(),
            selector_id: selector.to_string(),
            instigator_type: InstigatorType::Schedule,
            status: InstigatorStatus::Stopped,
            cursor: None,
        }
    }

    #[tokio::test]
    async fn state_rows_enforce_key_uniqueness() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        store.add_instigator_state(schedule_state("o1", "s1")).await?;
        let err = store
            .add_instigator_state(schedule_state("o1", "s1"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        let mut updated = schedule_state("o1", "s1");
        updated.status = InstigatorStatus::Running;
        store.update_instigator_state(updated.clone()).await?;
        assert_eq!(
            store.get_instigator_state("o1", "s1").await?,
            Some(updated)
        );

        store.delete_instigator_state("o1", "s1").await?;
        let err = store.delete_instigator_state("o1", "s1").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn type_filter_on_all_state() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        store.add_instigator_state(schedule_state("o1", "s1")).await?;
        let mut sensor = schedule_state("o1", "s2");
        sensor.instigator_type = InstigatorType::Sensor;
        store.add_instigator_state(sensor).await?;

        let sensors = store
            .all_instigator_state(Some(InstigatorType::Sensor))
            .await?;
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].selector_id, "s2");
        Ok(())
    }

    #[tokio::test]
    async fn tick_finalization_preserves_creation_timestamp() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        let tick = store
            .create_tick(TickData::started("o1", "s1", InstigatorType::Schedule))
            .await?;
        let created_us = tick.data.timestamp.timestamp_micros();

        let mut finalized = tick.clone().with_status(TickStatus::Failure);
        finalized.data.timestamp = tick.data.timestamp + Duration::hours(1);
        finalized.data.error = Some("evaluation raised".to_string());
        store.update_tick(finalized).await?;

        let ticks = store.get_ticks("o1", "s1", None, None, None, None).await?;
        assert_eq!(ticks[0].data.status, TickStatus::Failure);
        assert_eq!(ticks[0].data.timestamp.timestamp_micros(), created_us);

        let unknown = InstigatorTick {
            id: TickId::generate(),
            data: TickData::started("o1", "s1", InstigatorType::Schedule),
        };
        assert!(store.update_tick(unknown).await.unwrap_err().is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn tick_windows_are_exclusive_and_newest_first() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        let mut timestamps = Vec::new();
        for offset in 0..3 {
            let mut data = TickData::started("o1", "s1", InstigatorType::Schedule);
            data.timestamp = data.timestamp + Duration::minutes(offset);
            timestamps.push(data.timestamp);
            store.create_tick(data).await?;
        }

        let all = store.get_ticks("o1", "s1", None, None, None, None).await?;
        assert_eq!(
            all[0].data.timestamp.timestamp_micros(),
            timestamps[2].timestamp_micros()
        );

        let windowed = store
            .get_ticks(
                "o1",
                "s1",
                Some(timestamps[2]),
                Some(timestamps[0]),
                None,
                None,
            )
            .await?;
        assert_eq!(windowed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn batch_ticks_group_with_per_selector_limit() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        assert!(store.supports_batch_queries());
        for selector in ["s1", "s1", "s2"] {
            store
                .create_tick(TickData::started("o1", selector, InstigatorType::Sensor))
                .await?;
        }

        let grouped = store
            .get_batch_ticks(&["s1".to_string(), "s3".to_string()], Some(1), None)
            .await?;
        assert_eq!(grouped["s1"].len(), 1);
        assert!(grouped["s3"].is_empty());
        assert!(!grouped.contains_key("s2"));
        Ok(())
    }

    #[tokio::test]
    async fn purge_is_strictly_older_and_status_scoped() -> Result<()> {
        let store = SqliteScheduleStore::open_in_memory()?;
        let mut timestamps = Vec::new();
        for offset in 0..3 {
            let mut data = TickData::started("o1", "s1", InstigatorType::Schedule);
            data.timestamp = data.timestamp + Duration::minutes(offset);
            data.status = if offset == 0 {
                TickStatus::Skipped
            } else {
                TickStatus::Success
            };
            timestamps.push(data.timestamp);
            store.create_tick(data).await?;
        }

        let purged = store
            .purge_ticks("o1", "s1", timestamps[1], Some(&[TickStatus::Success]))
            .await?;
        assert_eq!(purged, 0);
        let purged = store.purge_ticks("o1", "s1", timestamps[1], None).await?;
        assert_eq!(purged, 1);
        assert_eq!(
            store
                .get_ticks("o1", "s1", None, None, None, None)
                .await?
                .len(),
            2
        );
        Ok(())
    }
}
