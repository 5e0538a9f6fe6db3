//! Append-only execution event log with derived asset and partition indices.
//!
//! Every occurrence during pipeline execution is recorded as an
//! [`EventLogEntry`]. The store assigns each appended entry an [`EventCursor`]
//! that is strictly increasing for the run it belongs to; callers never supply
//! cursors. `get_logs_for_run` is the fundamental read primitive every higher
//! feature (asset indices, partition counts, live watching) builds on.
//!
//! ## Derived indices
//!
//! Ingesting a materialization event updates the [`AssetRecord`] for that
//! asset key if and only if the incoming cursor is greater than the recorded
//! one. Last-writer-wins is decided by cursor, not wall-clock time, so
//! out-of-order delivery never regresses the index.

pub mod memory;
pub mod sqlite;
pub mod watcher;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{AssetKey, Error, Result, RunId};

use crate::lifecycle::StorageLifecycle;

/// An opaque, ordered position in the event log.
///
/// Cursors compare consistently for ordering and round-trip through their
/// string form, so they can be persisted for resumable watches. The zero
/// cursor sorts before every stored event.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventCursor(u64);

impl EventCursor {
    /// The cursor that sorts before every stored event.
    pub const START: Self = Self(0);

    /// Wraps a raw cursor value.
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw cursor value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EventCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventCursor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<u64>().map(Self).map_err(|e| Error::InvalidId {
            message: format!("invalid event cursor '{s}': {e}"),
        })
    }
}

/// The kind of occurrence an event log entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// Run accepted and queued for execution.
    RunEnqueued,
    /// Run resources are being provisioned.
    RunStarting,
    /// Run execution has begun.
    RunStarted,
    /// Run completed successfully.
    RunSuccess,
    /// Run failed.
    RunFailure,
    /// Run was canceled.
    RunCanceled,
    /// A step within the run started.
    StepStarted,
    /// A step within the run succeeded.
    StepSucceeded,
    /// A step within the run failed.
    StepFailed,
    /// A data asset was materialized.
    AssetMaterialized,
    /// A data asset was observed without being rewritten.
    AssetObserved,
    /// Engine-internal diagnostic event.
    EngineEvent,
}

impl EventType {
    /// Returns true if this event type ends a run.
    #[must_use]
    pub const fn is_run_terminal(&self) -> bool {
        matches!(self, Self::RunSuccess | Self::RunFailure | Self::RunCanceled)
    }
}

/// Asset-specific payload attached to materialization and observation events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetEvent {
    /// The asset this event concerns.
    pub asset_key: AssetKey,
    /// The partition materialized/observed, if the asset is partitioned.
    pub partition: Option<String>,
    /// Free-form tags recorded with the event, queryable via
    /// [`EventRecordsFilter::tag`].
    #[serde(default)]
    pub tags: HashMap<String, String>,
}

/// One recorded occurrence during execution, as supplied by the writer.
///
/// The store assigns the cursor on append; see [`EventRecord`] for the stored
/// form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogEntry {
    /// The run this entry belongs to.
    pub run_id: RunId,
    /// The kind of occurrence.
    pub event_type: EventType,
    /// When the occurrence happened.
    pub timestamp: DateTime<Utc>,
    /// Human-readable description.
    pub message: String,
    /// Asset payload for materialization/observation events.
    pub asset: Option<AssetEvent>,
}

impl EventLogEntry {
    /// Creates an entry with the current timestamp and no asset payload.
    #[must_use]
    pub fn new(run_id: RunId, event_type: EventType, message: impl Into<String>) -> Self {
        Self {
            run_id,
            event_type,
            timestamp: Utc::now(),
            message: message.into(),
            asset: None,
        }
    }

    /// Attaches an asset payload to the entry.
    #[must_use]
    pub fn with_asset(mut self, asset: AssetEvent) -> Self {
        self.asset = Some(asset);
        self
    }

    /// Creates a materialization entry for the given asset and partition.
    #[must_use]
    pub fn materialization(run_id: RunId, asset_key: AssetKey, partition: Option<String>) -> Self {
        let message = format!("materialized {asset_key}");
        Self::new(run_id, EventType::AssetMaterialized, message).with_asset(AssetEvent {
            asset_key,
            partition,
            tags: HashMap::new(),
        })
    }
}

/// A stored event log entry together with its assigned cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// The store-assigned position of the entry.
    pub cursor: EventCursor,
    /// The recorded entry.
    pub entry: EventLogEntry,
}

/// Filter for cross-run event record queries.
#[derive(Debug, Clone, Default)]
pub struct EventRecordsFilter {
    /// Restrict to these event types.
    pub event_types: Option<Vec<EventType>>,
    /// Restrict to events carrying this asset key.
    pub asset_key: Option<AssetKey>,
    /// Restrict to asset events carrying this tag key/value pair.
    pub tag: Option<(String, String)>,
    /// Only events with timestamp strictly after this instant.
    pub after_timestamp: Option<DateTime<Utc>>,
    /// Only events with timestamp strictly before this instant.
    pub before_timestamp: Option<DateTime<Utc>>,
    /// Only events with cursor strictly greater than this.
    pub after_cursor: Option<EventCursor>,
}

impl EventRecordsFilter {
    /// Filter for materializations of one asset key.
    #[must_use]
    pub fn materializations(asset_key: AssetKey) -> Self {
        Self {
            event_types: Some(vec![EventType::AssetMaterialized]),
            asset_key: Some(asset_key),
            ..Self::default()
        }
    }

    /// Returns true if `record` passes this filter.
    #[must_use]
    pub fn matches(&self, record: &EventRecord) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&record.entry.event_type) {
                return false;
            }
        }
        if let Some(key) = &self.asset_key {
            match &record.entry.asset {
                Some(asset) if asset.asset_key == *key => {}
                _ => return false,
            }
        }
        if let Some((tag_key, tag_value)) = &self.tag {
            match &record.entry.asset {
                Some(asset) if asset.tags.get(tag_key) == Some(tag_value) => {}
                _ => return false,
            }
        }
        if let Some(after) = self.after_timestamp {
            if record.entry.timestamp <= after {
                return false;
            }
        }
        if let Some(before) = self.before_timestamp {
            if record.entry.timestamp >= before {
                return false;
            }
        }
        if let Some(cursor) = self.after_cursor {
            if record.cursor <= cursor {
                return false;
            }
        }
        true
    }
}

/// Latest known state of a named data asset, derived from the event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetRecord {
    /// The asset key.
    pub asset_key: AssetKey,
    /// The most recent materialization event, by cursor.
    pub last_materialization: EventRecord,
}

/// Callback invoked with one stored event record at a time.
///
/// Callbacks must be idempotent: delivery is at-least-once across poll-loop
/// restarts. A returned error is reported but does not crash the polling
/// loop; subscribers failing repeatedly are unregistered.
pub type EventCallback =
    Arc<dyn Fn(EventRecord) -> std::result::Result<(), Box<dyn std::error::Error + Send + Sync>>
        + Send
        + Sync>;

/// Token identifying one live watch subscription, used for deregistration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchHandle(pub(crate) u64);

/// Append-only, per-run execution event storage.
///
/// Implementations must be safe for concurrent use: two concurrent
/// `store_event` calls for the same run must never assign the same cursor.
/// Transient backend failures propagate to the caller unchanged; no retry
/// logic lives in the store.
#[async_trait]
pub trait EventLogStore: StorageLifecycle {
    /// Appends an entry and returns its store-assigned cursor.
    ///
    /// Cursors visible to readers of one run are strictly increasing in
    /// append order; internal gaps (e.g. from failed transactions) are
    /// acceptable.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn store_event(&self, entry: EventLogEntry) -> Result<EventCursor>;

    /// Returns entries of `run_id` with cursor strictly greater than
    /// `cursor`, in ascending cursor order, optionally filtered by event type
    /// and capped at `limit`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_logs_for_run(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        of_type: Option<&[EventType]>,
        limit: Option<usize>,
    ) -> Result<Vec<EventRecord>>;

    /// Queries event records across runs.
    ///
    /// Results are ordered by cursor, descending unless `ascending` is set.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_event_records(
        &self,
        filter: &EventRecordsFilter,
        limit: Option<usize>,
        ascending: bool,
    ) -> Result<Vec<EventRecord>>;

    /// Returns the latest materialization event per requested asset key.
    ///
    /// Keys never materialized are absent from the result.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_latest_materialization_events(
        &self,
        asset_keys: &[AssetKey],
    ) -> Result<HashMap<AssetKey, EventRecord>>;

    /// Returns asset records, optionally restricted to the given keys.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_asset_records(
        &self,
        asset_keys: Option<&[AssetKey]>,
    ) -> Result<Vec<AssetRecord>>;

    /// Returns true if the asset key has ever been materialized.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn has_asset_key(&self, asset_key: &AssetKey) -> Result<bool>;

    /// Returns all known asset keys, sorted.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn all_asset_keys(&self) -> Result<Vec<AssetKey>>;

    /// Irreversibly removes the asset index entry for `asset_key`.
    ///
    /// Stored run events are untouched; only the derived index is cleared.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn wipe_asset(&self, asset_key: &AssetKey) -> Result<()>;

    /// Registers partition keys under a partition definition.
    ///
    /// Idempotent: adding an existing key is a no-op, not an error.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn add_partitions(&self, partitions_def_name: &str, keys: &[String]) -> Result<()>;

    /// Removes exactly one partition key from a definition.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is not registered.
    async fn delete_partition(&self, partitions_def_name: &str, key: &str) -> Result<()>;

    /// Returns the known partition keys of a definition, in insertion order.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_partitions(&self, partitions_def_name: &str) -> Result<Vec<String>>;

    /// Returns true if the definition contains the given partition key.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn has_partition(&self, partitions_def_name: &str, key: &str) -> Result<bool>;

    /// Counts materializations per partition for each requested asset key,
    /// optionally restricted to events after `after_cursor`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_materialization_count_by_partition(
        &self,
        asset_keys: &[AssetKey],
        after_cursor: Option<EventCursor>,
    ) -> Result<HashMap<AssetKey, HashMap<String, usize>>>;

    /// Irreversibly deletes all entries of one run.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn delete_events(&self, run_id: RunId) -> Result<()>;

    /// Registers a live subscriber for new events of `run_id`, starting after
    /// `cursor`. See [`watcher::PollingEventWatcher`] for delivery semantics.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the store is disposed.
    async fn watch(
        &self,
        run_id: RunId,
        cursor: EventCursor,
        callback: EventCallback,
    ) -> Result<WatchHandle>;

    /// Deregisters a live subscriber.
    ///
    /// Safe to call for a handle that was never registered (no-op).
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the store is disposed.
    async fn end_watch(&self, run_id: RunId, handle: WatchHandle) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_orders_and_roundtrips() {
        let a = EventCursor::new(3);
        let b = EventCursor::new(7);
        assert!(a < b);
        assert!(EventCursor::START < a);
        let parsed: EventCursor = b.to_string().parse().unwrap();
        assert_eq!(parsed, b);
    }

    #[test]
    fn cursor_rejects_garbage() {
        assert!("not-a-cursor".parse::<EventCursor>().is_err());
    }

    #[test]
    fn terminal_event_types() {
        assert!(EventType::RunSuccess.is_run_terminal());
        assert!(EventType::RunCanceled.is_run_terminal());
        assert!(!EventType::StepFailed.is_run_terminal());
    }

    #[test]
    fn filter_matches_asset_and_tag() {
        let run_id = RunId::generate();
        let mut entry = EventLogEntry::materialization(
            run_id,
            AssetKey::new(["analytics", "daily"]),
            Some("2024-01-01".to_string()),
        );
        if let Some(asset) = &mut entry.asset {
            asset.tags.insert("team".to_string(), "data".to_string());
        }
        let record = EventRecord {
            cursor: EventCursor::new(5),
            entry,
        };

        assert!(EventRecordsFilter::materializations(AssetKey::new(["analytics", "daily"]))
            .matches(&record));
        assert!(!EventRecordsFilter::materializations(AssetKey::new(["other"])).matches(&record));

        let tag_filter = EventRecordsFilter {
            tag: Some(("team".to_string(), "data".to_string())),
            ..EventRecordsFilter::default()
        };
        assert!(tag_filter.matches(&record));

        let cursor_filter = EventRecordsFilter {
            after_cursor: Some(EventCursor::new(5)),
            ..EventRecordsFilter::default()
        };
        assert!(!cursor_filter.matches(&record));
    }
}
