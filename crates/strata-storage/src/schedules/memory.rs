//! In-memory schedule/sensor state backend for tests and ephemeral
//! deployments.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use strata_core::{Error, Result, TickId};

use super::{
    InstigatorState, InstigatorTick, InstigatorType, ScheduleStore, TickData, TickStatus,
};
use crate::lifecycle::StorageLifecycle;

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("schedule state lock poisoned")
}

#[derive(Default)]
struct ScheduleState {
    states: HashMap<(String, String), InstigatorState>,
    ticks: Vec<InstigatorTick>,
    disposed: bool,
}

impl ScheduleState {
    fn check_open(&self) -> Result<()> {
        if self.disposed {
            Err(Error::backend("schedule store is disposed"))
        } else {
            Ok(())
        }
    }
}

fn tick_matches(
    tick: &InstigatorTick,
    before: Option<DateTime<Utc>>,
    after: Option<DateTime<Utc>>,
    statuses: Option<&[TickStatus]>,
) -> bool {
    if before.is_some_and(|b| tick.data.timestamp >= b) {
        return false;
    }
    if after.is_some_and(|a| tick.data.timestamp <= a) {
        return false;
    }
    statuses.is_none_or(|s| s.contains(&tick.data.status))
}

fn sort_newest_first(ticks: &mut [InstigatorTick]) {
    ticks.sort_by(|a, b| {
        b.data
            .timestamp
            .cmp(&a.data.timestamp)
            .then_with(|| b.id.cmp(&a.id))
    });
}

/// [`ScheduleStore`] backed by process memory.
#[derive(Default)]
pub struct MemoryScheduleStore {
    state: RwLock<ScheduleState>,
}

impl MemoryScheduleStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StorageLifecycle for MemoryScheduleStore {
    async fn migrate(&self) -> Result<()> {
        Ok(())
    }

    async fn optimize(&self) -> Result<()> {
        Ok(())
    }

    async fn wipe(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        *state = ScheduleState::default();
        Ok(())
    }

    async fn dispose(&self) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.disposed = true;
        Ok(())
    }
}

#[async_trait]
impl ScheduleStore for MemoryScheduleStore {
    async fn all_instigator_state(
        &self,
        instigator_type: Option<InstigatorType>,
    ) -> Result<Vec<InstigatorState>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut states: Vec<InstigatorState> = state
            .states
            .values()
            .filter(|s| instigator_type.is_none_or(|t| s.instigator_type == t))
            .cloned()
            .collect();
        states.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(states)
    }

    async fn get_instigator_state(
        &self,
        origin_id: &str,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        Ok(state
            .states
            .get(&(origin_id.to_string(), selector_id.to_string()))
            .cloned())
    }

    async fn add_instigator_state(&self, new: InstigatorState) -> Result<InstigatorState> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let key = new.key();
        if state.states.contains_key(&key) {
            return Err(Error::already_exists(
                "instigator state",
                format!("{}/{}", key.0, key.1),
            ));
        }
        state.states.insert(key, new.clone());
        Ok(new)
    }

    async fn update_instigator_state(&self, new: InstigatorState) -> Result<InstigatorState> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let key = new.key();
        if !state.states.contains_key(&key) {
            return Err(Error::not_found(
                "instigator state",
                format!("{}/{}", key.0, key.1),
            ));
        }
        state.states.insert(key, new.clone());
        Ok(new)
    }

    async fn delete_instigator_state(&self, origin_id: &str, selector_id: &str) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let key = (origin_id.to_string(), selector_id.to_string());
        if state.states.remove(&key).is_none() {
            return Err(Error::not_found(
                "instigator state",
                format!("{origin_id}/{selector_id}"),
            ));
        }
        Ok(())
    }

    async fn create_tick(&self, tick_data: TickData) -> Result<InstigatorTick> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let tick = InstigatorTick {
            id: TickId::generate(),
            data: tick_data,
        };
        state.ticks.push(tick.clone());
        Ok(tick)
    }

    async fn update_tick(&self, tick: InstigatorTick) -> Result<()> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let Some(stored) = state.ticks.iter_mut().find(|t| t.id == tick.id) else {
            return Err(Error::not_found("tick", tick.id.to_string()));
        };
        let timestamp = stored.data.timestamp;
        stored.data = tick.data;
        stored.data.timestamp = timestamp;
        Ok(())
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
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut ticks: Vec<InstigatorTick> = state
            .ticks
            .iter()
            .filter(|t| t.data.origin_id == origin_id && t.data.selector_id == selector_id)
            .filter(|t| tick_matches(t, before, after, statuses))
            .cloned()
            .collect();
        sort_newest_first(&mut ticks);
        ticks.truncate(limit.unwrap_or(usize::MAX));
        Ok(ticks)
    }

    async fn get_batch_ticks(
        &self,
        selector_ids: &[String],
        limit: Option<usize>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<HashMap<String, Vec<InstigatorTick>>> {
        let state = self.state.read().map_err(poison_err)?;
        state.check_open()?;
        let mut grouped: HashMap<String, Vec<InstigatorTick>> = selector_ids
            .iter()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        for tick in &state.ticks {
            if let Some(ticks) = grouped.get_mut(&tick.data.selector_id) {
                if tick_matches(tick, None, None, statuses) {
                    ticks.push(tick.clone());
                }
            }
        }
        for ticks in grouped.values_mut() {
            sort_newest_first(ticks);
            ticks.truncate(limit.unwrap_or(usize::MAX));
        }
        Ok(grouped)
    }

    async fn purge_ticks(
        &self,
        origin_id: &str,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<usize> {
        let mut state = self.state.write().map_err(poison_err)?;
        state.check_open()?;
        let before_len = state.ticks.len();
        state.ticks.retain(|t| {
            !(t.data.origin_id == origin_id
                && t.data.selector_id == selector_id
                && t.data.timestamp < before
                && statuses.is_none_or(|s| s.contains(&t.data.status)))
        });
        Ok(before_len - state.ticks.len())
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
    async fn state_crud_enforces_uniqueness() -> Result<()> {
        let store = MemoryScheduleStore::new();
        store.add_instigator_state(schedule_state("o1", "s1")).await?;

        let err = store
            .add_instigator_state(schedule_state("o1", "s1"))
            .await
            .unwrap_err();
        assert!(err.is_already_exists());

        let mut updated = schedule_state("o1", "s1");
        updated.status = InstigatorStatus::Running;
        updated.cursor = Some("offset=42".to_string());
        store.update_instigator_state(updated.clone()).await?;
        assert_eq!(
            store.get_instigator_state("o1", "s1").await?,
            Some(updated)
        );

        store.delete_instigator_state("o1", "s1").await?;
        assert!(store.get_instigator_state("o1", "s1").await?.is_none());
        let err = store.delete_instigator_state("o1", "s1").await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn update_of_missing_state_fails() -> Result<()> {
        let store = MemoryScheduleStore::new();
        let err = store
            .update_instigator_state(schedule_state("o1", "s1"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn all_state_filters_by_type() -> Result<()> {
        let store = MemoryScheduleStore::new();
        store.add_instigator_state(schedule_state("o1", "s1")).await?;
        let mut sensor = schedule_state("o1", "s2");
        sensor.instigator_type = InstigatorType::Sensor;
        store.add_instigator_state(sensor).await?;

        assert_eq!(store.all_instigator_state(None).await?.len(), 2);
        let sensors = store
            .all_instigator_state(Some(InstigatorType::Sensor))
            .await?;
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].selector_id, "s2");
        Ok(())
    }

    #[tokio::test]
    async fn ticks_are_finalized_without_touching_timestamp() -> Result<()> {
        let store = MemoryScheduleStore::new();
        let tick = store
            .create_tick(TickData::started("o1", "s1", InstigatorType::Schedule))
            .await?;
        let created_at = tick.data.timestamp;

        let mut finalized = tick.clone().with_status(TickStatus::Success);
        finalized.data.timestamp = created_at + Duration::hours(1);
        store.update_tick(finalized).await?;

        let ticks = store.get_ticks("o1", "s1", None, None, None, None).await?;
        assert_eq!(ticks.len(), 1);
        assert_eq!(ticks[0].data.status, TickStatus::Success);
        assert_eq!(ticks[0].data.timestamp, created_at);
        Ok(())
    }

    #[tokio::test]
    async fn update_of_unknown_tick_fails() -> Result<()> {
        let store = MemoryScheduleStore::new();
        let tick = InstigatorTick {
            id: TickId::generate(),
            data: TickData::started("o1", "s1", InstigatorType::Schedule),
        };
        let err = store.update_tick(tick).await.unwrap_err();
        assert!(err.is_not_found());
        Ok(())
    }

    #[tokio::test]
    async fn get_ticks_windows_and_filters() -> Result<()> {
        let store = MemoryScheduleStore::new();
        let mut timestamps = Vec::new();
        for offset in 0..3 {
            let mut data = TickData::started("o1", "s1", InstigatorType::Schedule);
            data.timestamp = data.timestamp + Duration::minutes(offset);
            if offset == 1 {
                data.status = TickStatus::Skipped;
            }
            timestamps.push(data.timestamp);
            store.create_tick(data).await?;
        }

        let all = store.get_ticks("o1", "s1", None, None, None, None).await?;
        assert_eq!(all.len(), 3);
        // Newest first.
        assert_eq!(all[0].data.timestamp, timestamps[2]);

        // Exclusive bounds: ticks exactly at the boundary are excluded.
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
        assert_eq!(windowed[0].data.timestamp, timestamps[1]);

        let skipped = store
            .get_ticks("o1", "s1", None, None, None, Some(&[TickStatus::Skipped]))
            .await?;
        assert_eq!(skipped.len(), 1);

        let limited = store.get_ticks("o1", "s1", None, None, Some(2), None).await?;
        assert_eq!(limited.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn batch_ticks_groups_per_selector() -> Result<()> {
        let store = MemoryScheduleStore::new();
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
    async fn purge_removes_only_strictly_older_ticks() -> Result<()> {
        let store = MemoryScheduleStore::new();
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

        // Cutoff at the middle tick: only the older one goes, and only if its
        // status matches.
        let purged = store
            .purge_ticks("o1", "s1", timestamps[1], Some(&[TickStatus::Success]))
            .await?;
        assert_eq!(purged, 0);

        let purged = store.purge_ticks("o1", "s1", timestamps[1], None).await?;
        assert_eq!(purged, 1);
        let remaining = store.get_ticks("o1", "s1", None, None, None, None).await?;
        assert_eq!(remaining.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn wipe_and_dispose() -> Result<()> {
        let store = MemoryScheduleStore::new();
        store.add_instigator_state(schedule_state("o1", "s1")).await?;
        store.wipe().await?;
        assert!(store.all_instigator_state(None).await?.is_empty());

        store.dispose().await?;
        assert!(store.all_instigator_state(None).await.is_err());
        Ok(())
    }
}
