//! In-memory event log backend for tests and ephemeral deployments.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;

use strata_core::{AssetKey, Error, Result, RunId};

use super::watcher::{EventCursorReader, PollingEventWatcher, WatcherConfig};
use super::{
    AssetRecord, EventCallback, EventCursor, EventLogEntry, EventLogStore, EventRecord,
    EventRecordsFilter, EventType, WatchHandle,
};
use crate::lifecycle::StorageLifecycle;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("event log state lock poisoned")
}

#[derive(Default)]
struct EventLogState {
    records: Vec<EventRecord>,
    next_cursor: u64,
    assets: HashMap<AssetKey, AssetRecord>,
    /// Materializations at or below this cursor are excluded from derived
    /// queries for the key. Set by `wipe_asset`.
    wiped_below: HashMap<AssetKey, EventCursor>,
    partitions: HashMap<String, Vec<String>>,
    disposed: bool,
}

impl EventLogState {
    fn check_open(&self) -> Result<()> {
        if self.disposed {
            Err(Error::backend("event log store is disposed"))
        } else {
            Ok(())
        }
    }

    /// Updates the asset index for a materialization record. Last-writer-wins
    /// by cursor: an older cursor never displaces a newer one.
    fn apply_asset_index(&mut self, record: &EventRecord) {
        if record.entry.event_type != EventType::AssetMaterialized {
            return;
        }
        let Some(asset) = &record.entry.asset else {
            return;
        };
        match self.assets.get(&asset.asset_key) {
            Some(existing) if existing.last_materialization.cursor >= record.cursor => {}
            _ => {
                self.assets.insert(
                    asset.asset_key.clone(),
                    AssetRecord {
                        asset_key: asset.asset_key.clone(),
                        last_materialization: record.clone(),
                    },
                );
            }
        }
    }

    fn count_boundary(&self, key: &AssetKey, after_cursor: Option<EventCursor>) -> EventCursor {
        let wiped = self.wiped_below.get(key).copied().unwrap_or(EventCursor::START);
        after_cursor.unwrap_or(EventCursor::START).max(wiped)
    }
}

/// Reader handed to the watcher so the poll loop holds no reference to the
/// store itself.
struct StateReader(Arc<RwLock<EventLogState>>);

#[async_trait]
impl EventCursorReader for StateReader {
    async fn read_after(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        limit: usize,
    ) -> Result<Vec<EventRecord>> {
        let state = self.0.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state
            .records
            .iter()
            .filter(|r| r.entry.run_id == run_id && r.cursor > cursor)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// [`EventLogStore`] backed by process memory.
///
/// All contents are lost on drop. Derived indices are maintained inline with
/// each append under one write lock, so readers always see a consistent view.
pub struct MemoryEventLogStore {
    state: Arc<RwLock<EventLogState>>,
    watcher: PollingEventWatcher,
}

impl MemoryEventLogStore {
    /// Creates an empty store with default watcher tuning.
    #[must_use]
    pub fn new() -> Self {
        Self::with_watcher_config(WatcherConfig::default())
    }

    /// Creates an empty store with explicit watcher tuning.
    #[must_use]
    pub fn with_watcher_config(config: WatcherConfig) -> Self {
        let state = Arc::new(RwLock::new(EventLogState::default()));
        let watcher = PollingEventWatcher::new(Arc::new(StateReader(state.clone())), config);
        Self { state, watcher }
    }
}

impl Default for MemoryEventLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageLifecycle for MemoryEventLogStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        *state = EventLogState::default();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        self.watcher.dispose()?;
        let mut state = self.state.write().map_err(poison_err)?;
        state.disposed = true;
        Ok(())
    }
}

#[async_trait]
impl EventLogStore for MemoryEventLogStore {
    async fn store_event(&self, entry: EventLogEntry) -> Result<EventCursor> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.next_cursor += 1;
        let record = EventRecord {
            cursor: EventCursor::new(state.next_cursor),
            entry,
        };
        state.apply_asset_index(&record);
        let cursor = record.cursor;
        state.records.push(record);
        Ok(cursor)
    }

    async fn get_logs_for_run(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        of_type: Option<&[EventType]>,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state
            .records
            .iter()
            .filter(|r| r.entry.run_id == run_id && r.cursor > cursor)
            .filter(|r| of_type.is_none_or(|types| types.contains(&r.entry.event_type)))
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn get_event_records(
        &self,
        filter: &EventRecordsFilter,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut matched: Vec<EventRecord> = state
            .records
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        if !ascending {
            matched.reverse();
        }
        matched.truncate(limit.unwrap_or(usize::MAX));
        Ok(matched)
    }

    async fn get_latest_materialization_events(
        &self,
        asset_keys: &[AssetKey],
    ) -> Result<HashMap<AssetKey, EventRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(asset_keys
            .iter()
            .filter_map(|key| {
                state
                    .assets
                    .get(key)
                    .map(|record| (key.clone(), record.last_materialization.clone()))
            })
            .collect())
    }

    async fn get_asset_records(
        &self,
        asset_keys: Option<&[AssetKey]>,
    ) -> Result<Vec<AssetRecord>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut records: Vec<AssetRecord> = state
            .assets
            .values()
            .filter(|record| asset_keys.is_none_or(|keys| keys.contains(&record.asset_key)))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.asset_key.cmp(&b.asset_key));
        Ok(records)
    }

    async fn has_asset_key(&self, asset_key: &AssetKey) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state.assets.contains_key(asset_key))
    }

    async fn all_asset_keys(&self) -> Result<Vec<AssetKey>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut keys: Vec<AssetKey> = state.assets.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    async fn wipe_asset(&self, asset_key: &AssetKey) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let boundary = EventCursor::new(state.next_cursor);
        state.wiped_below.insert(asset_key.clone(), boundary);
        state.assets.remove(asset_key);
        Ok(())
    }

    async fn add_partitions(&self, partitions_def_name: &str, keys: &[String]) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let existing = state
            .partitions
            .entry(partitions_def_name.to_string())
            .or_default();
        for key in keys {
            if !existing.contains(key) {
                existing.push(key.clone());
            }
        }
        Ok(())
    }

    async fn delete_partition(&self, partitions_def_name: &str, key: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let position = state
            .partitions
            .get(partitions_def_name)
            .and_then(|keys| keys.iter().position(|k| k == key));
        match position {
            Some(index) => {
                if let Some(keys) = state.partitions.get_mut(partitions_def_name) {
                    keys.remove(index);
                }
                Ok(())
            }
            None => Err(Error::not_found(
                "partition",
                format!("{partitions_def_name}/{key}"),
            )),
        }
    }

    async fn get_partitions(&self, partitions_def_name: &str) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state
            .partitions
            .get(partitions_def_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_partition(&self, partitions_def_name: &str, key: &str) -> Result<bool> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state
            .partitions
            .get(partitions_def_name)
            .is_some_and(|keys| keys.iter().any(|k| k == key)))
    }

    async fn get_materialization_count_by_partition(
        &self,
        asset_keys: &[AssetKey],
        after_cursor: Option<EventCursor>,
    ) -> Result<HashMap<AssetKey, HashMap<String, usize>>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut counts: HashMap<AssetKey, HashMap<String, usize>> = asset_keys
            .iter()
            .map(|key| (key.clone(), HashMap::new()))
            .collect();
        for record in &state.records {
            if record.entry.event_type != EventType::AssetMaterialized {
                continue;
            }
            let Some(asset) = &record.entry.asset else {
                continue;
            };
            let Some(partition) = &asset.partition else {
                continue;
            };
            let Some(per_partition) = counts.get_mut(&asset.asset_key) else {
                continue;
            };
            if record.cursor <= state.count_boundary(&asset.asset_key, after_cursor) {
                continue;
            }
            *per_partition.entry(partition.clone()).or_insert(0) += 1;
        }
        Ok(counts)
    }

    async fn delete_events(&self, run_id: RunId) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        state.records.retain(|r| r.entry.run_id != run_id);
        state
            .assets
            .retain(|_, record| record.last_materialization.entry.run_id != run_id);
        Ok(())
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
