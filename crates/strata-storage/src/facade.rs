//! Single access point over either three role backends or one unified
//! backend.
//!
//! Deployments either compose independent run/event-log/schedule backends or
//! point all three roles at one backend implementing every store trait. The
//! facade hides the difference: it implements all three store traits itself
//! and forwards each call to whichever backend serves that role, so callers
//! never branch on the deployment shape.
//!
//! Forwarding is generated by one delegation macro per role, driven by an
//! accessor that upcasts to the role trait object. The combined backends in
//! [`crate::unified`] reuse the same macros, so there is exactly one
//! forwarding surface per role in the crate.

use std::sync::Arc;

use async_trait::async_trait;

use strata_core::Result;

use crate::event_log::EventLogStore;
use crate::lifecycle::StorageLifecycle;
use crate::runs::RunStore;
use crate::schedules::ScheduleStore;

/// Marker for backends that serve all three storage roles.
///
/// Blanket-implemented: any type implementing the three store traits is a
/// unified backend.
pub trait UnifiedStorage: RunStore + EventLogStore + ScheduleStore {}

impl<T: RunStore + EventLogStore + ScheduleStore> UnifiedStorage for T {}

/// Generates a forwarding [`RunStore`](crate::runs::RunStore) impl for a type
/// with a `run_store(&self) -> &dyn RunStore` accessor.
macro_rules! impl_run_store_via_accessor {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl crate::runs::RunStore for $ty {
            async fn add_run(&self, run: crate::runs::Run) -> Result<crate::runs::Run> {
                self.run_store().add_run(run).await
            }

            async fn has_run(&self, run_id: strata_core::RunId) -> Result<bool> {
                self.run_store().has_run(run_id).await
            }

            async fn get_run(
                &self,
                run_id: strata_core::RunId,
            ) -> Result<Option<crate::runs::Run>> {
                self.run_store().get_run(run_id).await
            }

            async fn get_runs(
                &self,
                filter: &crate::runs::RunsFilter,
                cursor: Option<strata_core::RunId>,
                limit: Option<usize>,
                bucket_by: Option<&crate::runs::BucketBy>,
            ) -> Result<Vec<crate::runs::Run>> {
                self.run_store().get_runs(filter, cursor, limit, bucket_by).await
            }

            async fn get_runs_count(&self, filter: &crate::runs::RunsFilter) -> Result<usize> {
                self.run_store().get_runs_count(filter).await
            }

            async fn get_run_group(
                &self,
                run_id: strata_core::RunId,
            ) -> Result<Option<crate::runs::RunGroup>> {
                self.run_store().get_run_group(run_id).await
            }

            async fn handle_run_event(
                &self,
                run_id: strata_core::RunId,
                event_type: crate::event_log::EventType,
            ) -> Result<()> {
                self.run_store().handle_run_event(run_id, event_type).await
            }

            async fn add_run_tags(
                &self,
                run_id: strata_core::RunId,
                tags: std::collections::HashMap<String, String>,
            ) -> Result<()> {
                self.run_store().add_run_tags(run_id, tags).await
            }

            async fn delete_run(&self, run_id: strata_core::RunId) -> Result<()> {
                self.run_store().delete_run(run_id).await
            }

            async fn add_snapshot(
                &self,
                payload: serde_json::Value,
            ) -> Result<strata_core::SnapshotId> {
                self.run_store().add_snapshot(payload).await
            }

            async fn has_snapshot(&self, snapshot_id: &strata_core::SnapshotId) -> Result<bool> {
                self.run_store().has_snapshot(snapshot_id).await
            }

            async fn get_snapshot(
                &self,
                snapshot_id: &strata_core::SnapshotId,
            ) -> Result<Option<crate::runs::Snapshot>> {
                self.run_store().get_snapshot(snapshot_id).await
            }

            async fn add_backfill(&self, backfill: crate::runs::Backfill) -> Result<()> {
                self.run_store().add_backfill(backfill).await
            }

            async fn update_backfill(&self, backfill: crate::runs::Backfill) -> Result<()> {
                self.run_store().update_backfill(backfill).await
            }

            async fn get_backfill(
                &self,
                backfill_id: strata_core::BackfillId,
            ) -> Result<Option<crate::runs::Backfill>> {
                self.run_store().get_backfill(backfill_id).await
            }

            async fn get_backfills(
                &self,
                status: Option<crate::runs::BulkActionStatus>,
                cursor: Option<strata_core::BackfillId>,
                limit: Option<usize>,
            ) -> Result<Vec<crate::runs::Backfill>> {
                self.run_store().get_backfills(status, cursor, limit).await
            }

            async fn add_daemon_heartbeat(
                &self,
                heartbeat: crate::runs::DaemonHeartbeat,
            ) -> Result<()> {
                self.run_store().add_daemon_heartbeat(heartbeat).await
            }

            async fn get_daemon_heartbeats(
                &self,
            ) -> Result<std::collections::HashMap<String, crate::runs::DaemonHeartbeat>> {
                self.run_store().get_daemon_heartbeats().await
            }

            async fn wipe_daemon_heartbeats(&self) -> Result<()> {
                self.run_store().wipe_daemon_heartbeats().await
            }

            async fn kvs_get(
                &self,
                keys: &[String],
            ) -> Result<std::collections::HashMap<String, String>> {
                self.run_store().kvs_get(keys).await
            }

            async fn kvs_set(
                &self,
                pairs: std::collections::HashMap<String, String>,
            ) -> Result<()> {
                self.run_store().kvs_set(pairs).await
            }

            fn supports_bucket_queries(&self) -> bool {
                self.run_store().supports_bucket_queries()
            }
        }
    };
}

/// Generates a forwarding [`EventLogStore`](crate::event_log::EventLogStore)
/// impl for a type with an `event_log_store(&self) -> &dyn EventLogStore`
/// accessor.
macro_rules! impl_event_log_store_via_accessor {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl crate::event_log::EventLogStore for $ty {
            async fn store_event(
                &self,
                entry: crate::event_log::EventLogEntry,
            ) -> Result<crate::event_log::EventCursor> {
                self.event_log_store().store_event(entry).await
            }

            async fn get_logs_for_run(
                &self,
                run_id: strata_core::RunId,
                cursor: crate::event_log::EventCursor,
                of_type: Option<&[crate::event_log::EventType]>,
                limit: Option<usize>,
            ) -> Result<Vec<crate::event_log::EventRecord>> {
                self.event_log_store()
                    .get_logs_for_run(run_id, cursor, of_type, limit)
                    .await
            }

            async fn get_event_records(
                &self,
                filter: &crate::event_log::EventRecordsFilter,
                limit: Option<usize>,
                ascending: bool,
            ) -> Result<Vec<crate::event_log::EventRecord>> {
                self.event_log_store()
                    .get_event_records(filter, limit, ascending)
                    .await
            }

            async fn get_latest_materialization_events(
                &self,
                asset_keys: &[strata_core::AssetKey],
            ) -> Result<
                std::collections::HashMap<strata_core::AssetKey, crate::event_log::EventRecord>,
            > {
                self.event_log_store()
                    .get_latest_materialization_events(asset_keys)
                    .await
            }

            async fn get_asset_records(
                &self,
                asset_keys: Option<&[strata_core::AssetKey]>,
            ) -> Result<Vec<crate::event_log::AssetRecord>> {
                self.event_log_store().get_asset_records(asset_keys).await
            }

            async fn has_asset_key(&self, asset_key: &strata_core::AssetKey) -> Result<bool> {
                self.event_log_store().has_asset_key(asset_key).await
            }

            async fn all_asset_keys(&self) -> Result<Vec<strata_core::AssetKey>> {
                self.event_log_store().all_asset_keys().await
            }

            async fn wipe_asset(&self, asset_key: &strata_core::AssetKey) -> Result<()> {
                self.event_log_store().wipe_asset(asset_key).await
            }

            async fn add_partitions(
                &self,
                partitions_def_name: &str,
                keys: &[String],
            ) -> Result<()> {
                self.event_log_store()
                    .add_partitions(partitions_def_name, keys)
                    .await
            }

            async fn delete_partition(
                &self,
                partitions_def_name: &str,
                key: &str,
            ) -> Result<()> {
                self.event_log_store()
                    .delete_partition(partitions_def_name, key)
                    .await
            }

            async fn get_partitions(&self, partitions_def_name: &str) -> Result<Vec<String>> {
                self.event_log_store().get_partitions(partitions_def_name).await
            }

            async fn has_partition(&self, partitions_def_name: &str, key: &str) -> Result<bool> {
                self.event_log_store()
                    .has_partition(partitions_def_name, key)
                    .await
            }

            async fn get_materialization_count_by_partition(
                &self,
                asset_keys: &[strata_core::AssetKey],
                after_cursor: Option<crate::event_log::EventCursor>,
            ) -> Result<
                std::collections::HashMap<
                    strata_core::AssetKey,
                    std::collections::HashMap<String, usize>,
                >,
            > {
                self.event_log_store()
                    .get_materialization_count_by_partition(asset_keys, after_cursor)
                    .await
            }

            async fn delete_events(&self, run_id: strata_core::RunId) -> Result<()> {
                self.event_log_store().delete_events(run_id).await
            }

            async fn watch(
                &self,
                run_id: strata_core::RunId,
                cursor: crate::event_log::EventCursor,
                callback: crate::event_log::EventCallback,
            ) -> Result<crate::event_log::WatchHandle> {
                self.event_log_store().watch(run_id, cursor, callback).await
            }

            async fn end_watch(
                &self,
                run_id: strata_core::RunId,
                handle: crate::event_log::WatchHandle,
            ) -> Result<()> {
                self.event_log_store().end_watch(run_id, handle).await
            }
        }
    };
}

/// Generates a forwarding [`ScheduleStore`](crate::schedules::ScheduleStore)
/// impl for a type with a `schedule_store(&self) -> &dyn ScheduleStore`
/// accessor.
macro_rules! impl_schedule_store_via_accessor {
    ($ty:ty) => {
        #[async_trait::async_trait]
        impl crate::schedules::ScheduleStore for $ty {
            async fn all_instigator_state(
                &self,
                instigator_type: Option<crate::schedules::InstigatorType>,
            ) -> Result<Vec<crate::schedules::InstigatorState>> {
                self.schedule_store().all_instigator_state(instigator_type).await
            }

            async fn get_instigator_state(
                &self,
                origin_id: &str,
                selector_id: &str,
            ) -> Result<Option<crate::schedules::InstigatorState>> {
                self.schedule_store()
                    .get_instigator_state(origin_id, selector_id)
                    .await
            }

            async fn add_instigator_state(
                &self,
                state: crate::schedules::InstigatorState,
            ) -> Result<crate::schedules::InstigatorState> {
                self.schedule_store().add_instigator_state(state).await
            }

            async fn update_instigator_state(
                &self,
                state: crate::schedules::InstigatorState,
            ) -> Result<crate::schedules::InstigatorState> {
                self.schedule_store().update_instigator_state(state).await
            }

            async fn delete_instigator_state(
                &self,
                origin_id: &str,
                selector_id: &str,
            ) -> Result<()> {
                self.schedule_store()
                    .delete_instigator_state(origin_id, selector_id)
                    .await
            }

            async fn create_tick(
                &self,
                tick_data: crate::schedules::TickData,
            ) -> Result<crate::schedules::InstigatorTick> {
                self.schedule_store().create_tick(tick_data).await
            }

            async fn update_tick(&self, tick: crate::schedules::InstigatorTick) -> Result<()> {
                self.schedule_store().update_tick(tick).await
            }

            async fn get_ticks(
                &self,
                origin_id: &str,
                selector_id: &str,
                before: Option<chrono::DateTime<chrono::Utc>>,
                after: Option<chrono::DateTime<chrono::Utc>>,
                limit: Option<usize>,
                statuses: Option<&[crate::schedules::TickStatus]>,
            ) -> Result<Vec<crate::schedules::InstigatorTick>> {
                self.schedule_store()
                    .get_ticks(origin_id, selector_id, before, after, limit, statuses)
                    .await
            }

            async fn get_batch_ticks(
                &self,
                selector_ids: &[String],
                limit: Option<usize>,
                statuses: Option<&[crate::schedules::TickStatus]>,
            ) -> Result<
                std::collections::HashMap<String, Vec<crate::schedules::InstigatorTick>>,
            > {
                self.schedule_store()
                    .get_batch_ticks(selector_ids, limit, statuses)
                    .await
            }

            fn supports_batch_queries(&self) -> bool {
                self.schedule_store().supports_batch_queries()
            }

            async fn purge_ticks(
                &self,
                origin_id: &str,
                selector_id: &str,
                before: chrono::DateTime<chrono::Utc>,
                statuses: Option<&[crate::schedules::TickStatus]>,
            ) -> Result<usize> {
                self.schedule_store().purge_ticks(origin_id, selector_id, before, statuses).await
            }
        }
    };
}

pub(crate) use impl_event_log_store_via_accessor;
pub(crate) use impl_run_store_via_accessor;
pub(crate) use impl_schedule_store_via_accessor;

enum Variant {
    Composite {
        runs: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLogStore>,
        schedules: Arc<dyn ScheduleStore>,
    },
    Unified(Arc<dyn UnifiedStorage>),
}

/// The deployment-shape-agnostic entry point to all storage roles.
///
/// Implements [`RunStore`], [`EventLogStore`] and [`ScheduleStore`] by
/// forwarding; both variants expose identical observable behavior. The
/// variant is fixed at construction, normally via
/// [`BackendRegistry::resolve`](crate::config::BackendRegistry::resolve).
pub struct StorageFacade {
    variant: Variant,
}

impl std::fmt::Debug for StorageFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let variant = match self.variant {
            Variant::Composite { .. } => "Composite",
            Variant::Unified(_) => "Unified",
        };
        f.debug_struct("StorageFacade")
            .field("variant", &variant)
            .finish()
    }
}

impl StorageFacade {
    /// Builds a facade over three independent role backends.
    #[must_use]
    pub fn composite(
        runs: Arc<dyn RunStore>,
        event_log: Arc<dyn EventLogStore>,
        schedules: Arc<dyn ScheduleStore>,
    ) -> Self {
        Self {
            variant: Variant::Composite {
                runs,
                event_log,
                schedules,
            },
        }
    }

    /// Builds a facade over one backend serving all roles.
    #[must_use]
    pub fn unified(backend: Arc<dyn UnifiedStorage>) -> Self {
        Self {
            variant: Variant::Unified(backend),
        }
    }

    fn run_store(&self) -> &dyn RunStore {
        match &self.variant {
            Variant::Composite { runs, .. } => runs.as_ref(),
            Variant::Unified(backend) => backend.as_ref(),
        }
    }

    fn event_log_store(&self) -> &dyn EventLogStore {
        match &self.variant {
            Variant::Composite { event_log, .. } => event_log.as_ref(),
            Variant::Unified(backend) => backend.as_ref(),
        }
    }

    fn schedule_store(&self) -> &dyn ScheduleStore {
        match &self.variant {
            Variant::Composite { schedules, .. } => schedules.as_ref(),
            Variant::Unified(backend) => backend.as_ref(),
        }
    }
}

#[async_trait]
impl StorageLifecycle for StorageFacade {
    async fn migrate(&self) -> Result<()> {
        match &self.variant {
            Variant::Composite {
                runs,
                event_log,
                schedules,
            } => {
                runs.migrate().await?;
                event_log.migrate().await?;
                schedules.migrate().await
            }
            Variant::Unified(backend) => backend.migrate().await,
        }
    }

    async fn optimize(&self) -> Result<()> {
        match &self.variant {
            Variant::Composite {
                runs,
                event_log,
                schedules,
            } => {
                runs.optimize().await?;
                event_log.optimize().await?;
                schedules.optimize().await
            }
            Variant::Unified(backend) => backend.optimize().await,
        }
    }

    async fn wipe(&self) -> Result<()> {
        match &self.variant {
            Variant::Composite {
                runs,
                event_log,
                schedules,
            } => {
                runs.wipe().await?;
                event_log.wipe().await?;
                schedules.wipe().await
            }
            Variant::Unified(backend) => backend.wipe().await,
        }
    }

    async fn dispose(&self) -> Result<()> {
        match &self.variant {
            Variant::Composite {
                runs,
                event_log,
                schedules,
            } => {
                // Attempt every backend even when an earlier one fails, so a
                // partially constructed facade still releases what it holds.
                let results = [
                    runs.dispose().await,
                    event_log.dispose().await,
                    schedules.dispose().await,
                ];
                results.into_iter().collect()
            }
            Variant::Unified(backend) => backend.dispose().await,
        }
    }
}

impl_run_store_via_accessor!(StorageFacade);
impl_event_log_store_via_accessor!(StorageFacade);
impl_schedule_store_via_accessor!(StorageFacade);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::memory::MemoryEventLogStore;
    use crate::runs::memory::MemoryRunStore;
    use crate::runs::{Run, RunsFilter};
    use crate::schedules::memory::MemoryScheduleStore;
    use crate::unified::MemoryStorage;

    fn composite() -> StorageFacade {
        StorageFacade::composite(
            Arc::new(MemoryRunStore::new()),
            Arc::new(MemoryEventLogStore::new()),
            Arc::new(MemoryScheduleStore::new()),
        )
    }

    #[tokio::test]
    async fn composite_facade_reaches_each_role() -> Result<()> {
        let facade = composite();
        let run = Run::new("nightly");
        facade.add_run(run.clone()).await?;
        assert!(facade.has_run(run.id).await?);

        facade
            .store_event(crate::event_log::EventLogEntry::new(
                run.id,
                crate::event_log::EventType::RunStarted,
                "started",
            ))
            .await?;
        assert_eq!(
            facade
                .get_logs_for_run(run.id, crate::event_log::EventCursor::START, None, None)
                .await?
                .len(),
            1
        );

        facade
            .create_tick(crate::schedules::TickData::started(
                "o1",
                "s1",
                crate::schedules::InstigatorType::Schedule,
            ))
            .await?;
        assert_eq!(
            facade.get_ticks("o1", "s1", None, None, None, None).await?.len(),
            1
        );
        Ok(())
    }

    #[tokio::test]
    async fn unified_facade_serves_all_roles_from_one_backend() -> Result<()> {
        let facade = StorageFacade::unified(Arc::new(MemoryStorage::new()));
        let run = Run::new("nightly");
        facade.add_run(run.clone()).await?;
        assert_eq!(facade.get_runs_count(&RunsFilter::default()).await?, 1);
        assert!(facade.supports_bucket_queries());
        assert!(facade.supports_batch_queries());
        Ok(())
    }

    #[tokio::test]
    async fn dispose_tears_down_every_role_backend() -> Result<()> {
        let facade = composite();
        facade.dispose().await?;
        assert!(facade.get_runs_count(&RunsFilter::default()).await.is_err());
        assert!(facade.all_asset_keys().await.is_err());
        assert!(facade.all_instigator_state(None).await.is_err());
        Ok(())
    }
}
