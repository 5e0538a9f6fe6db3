//! Combined backends serving all three storage roles from one place.
//!
//! Each combined backend bundles the per-role stores of one engine and
//! forwards every trait method to the owning role, using the same delegation
//! macros as the facade. [`SqliteStorage`] points all roles at one database
//! file, which is what makes unified SQLite deployments single-file.

use std::path::Path;

use async_trait::async_trait;

use strata_core::Result;

use crate::event_log::memory::MemoryEventLogStore;
use crate::event_log::sqlite::SqliteEventLogStore;
use crate::event_log::watcher::WatcherConfig;
use crate::event_log::EventLogStore;
use crate::facade::{
    impl_event_log_store_via_accessor, impl_run_store_via_accessor,
    impl_schedule_store_via_accessor,
};
use crate::lifecycle::StorageLifecycle;
use crate::runs::memory::MemoryRunStore;
use crate::runs::sqlite::SqliteRunStore;
use crate::runs::RunStore;
use crate::schedules::memory::MemoryScheduleStore;
use crate::schedules::sqlite::SqliteScheduleStore;
use crate::schedules::ScheduleStore;

/// All three storage roles in process memory.
pub struct MemoryStorage {
    runs: MemoryRunStore,
    event_log: MemoryEventLogStore,
    schedules: MemoryScheduleStore,
}

impl MemoryStorage {
    /// Creates an empty unified in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            runs: MemoryRunStore::new(),
            event_log: MemoryEventLogStore::new(),
            schedules: MemoryScheduleStore::new(),
        }
    }

    /// Creates a unified in-memory backend with explicit watcher tuning.
    #[must_use]
    pub fn with_watcher_config(config: WatcherConfig) -> Self {
        Self {
            runs: MemoryRunStore::new(),
            event_log: MemoryEventLogStore::with_watcher_config(config),
            schedules: MemoryScheduleStore::new(),
        }
    }

    fn run_store(&self) -> &dyn RunStore {
        &self.runs
    }

    fn event_log_store(&self) -> &dyn EventLogStore {
        &self.event_log
    }

    fn schedule_store(&self) -> &dyn ScheduleStore {
        &self.schedules
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageLifecycle for MemoryStorage {
    async fn migrate(&self) -> Result<()> {
        self.runs.migrate().await?;
        self.event_log.migrate().await?;
        self.schedules.migrate().await
    }

    async fn optimize(&self) -> Result<()> {
        self.runs.optimize().await?;
        self.event_log.optimize().await?;
        self.schedules.optimize().await
    }

    async fn wipe(&self) -> Result<()> {
        self.runs.wipe().await?;
        self.event_log.wipe().await?;
        self.schedules.wipe().await
    }

    async fn dispose(&self) -> Result<()> {
        let results = [
            self.runs.dispose().await,
            self.event_log.dispose().await,
            self.schedules.dispose().await,
        ];
        results.into_iter().collect()
    }
}

impl_run_store_via_accessor!(MemoryStorage);
impl_event_log_store_via_accessor!(MemoryStorage);
impl_schedule_store_via_accessor!(MemoryStorage);

/// All three storage roles persisted in one SQLite database file.
pub struct SqliteStorage {
    runs: SqliteRunStore,
    event_log: SqliteEventLogStore,
    schedules: SqliteScheduleStore,
}

impl SqliteStorage {
    /// Opens (creating if needed) all role schemas in one database file.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the file cannot be opened and
    /// `SchemaMismatch` if it was written by a newer schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        Ok(Self {
            runs: SqliteRunStore::open(path)?,
            event_log: SqliteEventLogStore::open(path)?,
            schedules: SqliteScheduleStore::open(path)?,
        })
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
        let path = path.as_ref();
        Ok(Self {
            runs: SqliteRunStore::open(path)?,
            event_log: SqliteEventLogStore::open_with_watcher_config(path, config)?,
            schedules: SqliteScheduleStore::open(path)?,
        })
    }

    fn run_store(&self) -> &dyn RunStore {
        &self.runs
    }

    fn event_log_store(&self) -> &dyn EventLogStore {
        &self.event_log
    }

    fn schedule_store(&self) -> &dyn ScheduleStore {
        &self.schedules
    }
}

#[async_trait]
impl StorageLifecycle for SqliteStorage {
    async fn migrate(&self) -> Result<()> {
        self.runs.migrate().await?;
        self.event_log.migrate().await?;
        self.schedules.migrate().await
    }

    async fn optimize(&self) -> Result<()> {
        self.runs.optimize().await?;
        self.event_log.optimize().await?;
        self.schedules.optimize().await
    }

    async fn wipe(&self) -> Result<()> {
        self.runs.wipe().await?;
        self.event_log.wipe().await?;
        self.schedules.wipe().await
    }

    async fn dispose(&self) -> Result<()> {
        let results = [
            self.runs.dispose().await,
            self.event_log.dispose().await,
            self.schedules.dispose().await,
        ];
        results.into_iter().collect()
    }
}

impl_run_store_via_accessor!(SqliteStorage);
impl_event_log_store_via_accessor!(SqliteStorage);
impl_schedule_store_via_accessor!(SqliteStorage);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::{EventLogEntry, EventType};
    use crate::runs::Run;
    use crate::schedules::{InstigatorType, TickData};

    #[tokio::test]
    async fn memory_backend_serves_every_role() -> Result<()> {
        let storage = MemoryStorage::new();
        let run = Run::new("nightly");
        storage.add_run(run.clone()).await?;
        storage
            .store_event(EventLogEntry::new(run.id, EventType::RunStarted, "go"))
            .await?;
        storage
            .create_tick(TickData::started("o1", "s1", InstigatorType::Schedule))
            .await?;

        assert!(storage.has_run(run.id).await?);
        assert_eq!(
            storage.get_ticks("o1", "s1", None, None, None, None).await?.len(),
            1
        );
        storage.dispose().await?;
        Ok(())
    }

    #[tokio::test]
    async fn sqlite_backend_shares_one_file_across_roles() -> Result<()> {
        let dir = std::env::temp_dir().join(format!(
            "strata-unified-{}",
            strata_core::RunId::generate()
        ));
        std::fs::create_dir_all(&dir)
            .map_err(|e| strata_core::Error::backend(e.to_string()))?;
        let path = dir.join("storage.db");

        let storage = SqliteStorage::open(&path)?;
        let run = Run::new("nightly");
        storage.add_run(run.clone()).await?;
        storage
            .store_event(EventLogEntry::new(run.id, EventType::RunStarted, "go"))
            .await?;
        storage.migrate().await?;
        storage.optimize().await?;
        storage.dispose().await?;

        // Everything survived in the single file.
        let reopened = SqliteStorage::open(&path)?;
        assert!(reopened.has_run(run.id).await?);
        assert_eq!(
            reopened
                .get_logs_for_run(run.id, crate::event_log::EventCursor::START, None, None)
                .await?
                .len(),
            1
        );
        reopened.dispose().await?;
        let _ = std::fs::remove_dir_all(&dir);
        Ok(())
    }
}
