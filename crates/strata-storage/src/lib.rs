//! # strata-storage
//!
//! Durable storage for the Strata orchestration engine: runs, execution
//! events, and schedule/sensor state behind swappable backends.
//!
//! The crate is organized as three store contracts with interchangeable
//! backends, composed behind one facade:
//!
//! - [`runs`]: run lifecycle, snapshots, backfills, heartbeats, scalars
//! - [`event_log`]: the append-only execution event log, its derived asset
//!   and partition indices, and polling-based live watches
//! - [`schedules`]: schedule/sensor state and evaluation tick history
//! - [`facade`]: [`StorageFacade`](facade::StorageFacade), serving all
//!   roles over either three composed backends or one unified backend
//! - [`config`]: declarative backend selection through a
//!   [`BackendRegistry`](config::BackendRegistry)
//!
//! In-memory and SQLite backends ship in-tree; additional engines register
//! through the registry.
//!
//! ## Example
//!
//! ```rust
//! use strata_storage::prelude::*;
//!
//! # async fn demo() -> strata_core::Result<()> {
//! let registry = BackendRegistry::with_builtins();
//! let storage = registry.resolve(&StorageConfig::memory())?;
//!
//! let run = storage.add_run(Run::new("daily_etl")).await?;
//! storage
//!     .store_event(EventLogEntry::new(run.id, EventType::RunStarted, "started"))
//!     .await?;
//! storage.handle_run_event(run.id, EventType::RunStarted).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod config;
mod db;
pub mod event_log;
pub mod facade;
pub mod lifecycle;
pub mod runs;
pub mod schedules;
pub mod unified;

/// Prelude module for convenient imports.
///
/// Brings in the store traits (required to call their methods on the facade)
/// and the types needed for everyday use.
pub mod prelude {
    pub use crate::config::{BackendRegistry, BackendSpec, StorageConfig};
    pub use crate::event_log::{
        AssetRecord, EventCallback, EventCursor, EventLogEntry, EventLogStore, EventRecord,
        EventRecordsFilter, EventType, WatchHandle,
    };
    pub use crate::facade::{StorageFacade, UnifiedStorage};
    pub use crate::lifecycle::StorageLifecycle;
    pub use crate::runs::{
        Backfill, BucketBy, BulkActionStatus, DaemonHeartbeat, Run, RunGroup, RunStatus, RunStore,
        RunsFilter, Snapshot,
    };
    pub use crate::schedules::{
        InstigatorState, InstigatorStatus, InstigatorTick, InstigatorType, ScheduleStore,
        TickData, TickStatus,
    };
    pub use crate::unified::{MemoryStorage, SqliteStorage};
}
