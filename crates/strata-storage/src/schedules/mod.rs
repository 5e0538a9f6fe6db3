//! Persisted state for schedules and sensors ("instigators") and their
//! evaluation tick history.
//!
//! The evaluation logic itself lives outside this subsystem; only its
//! persisted state machine is stored here. State is keyed by
//! `(origin id, selector id)` with at most one live state per key; ticks are
//! an append-only history that is immutable once written except for status
//! finalization.

pub mod memory;
pub mod sqlite;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use strata_core::{Result, RunId, TickId};

use crate::lifecycle::StorageLifecycle;

/// The kind of instigator a state row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstigatorType {
    /// Cron-driven schedule.
    Schedule,
    /// Event-driven sensor.
    Sensor,
}

/// Whether an instigator is currently being evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstigatorStatus {
    /// Actively evaluated by the daemon.
    Running,
    /// Stopped; state is retained but no ticks are produced.
    Stopped,
}

/// Persisted schedule/sensor configuration and runtime status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstigatorState {
    /// Identifies the code location that defines the instigator.
    pub origin_id: String,
    /// Identifies the instigator within its origin.
    pub selector_id: String,
    /// Schedule or sensor.
    pub instigator_type: InstigatorType,
    /// Running or stopped.
    pub status: InstigatorStatus,
    /// Opaque evaluation cursor persisted between ticks.
    pub cursor: Option<String>,
}

impl InstigatorState {
    /// The unique `(origin id, selector id)` key of this state.
    #[must_use]
    pub fn key(&self) -> (String, String) {
        (self.origin_id.clone(), self.selector_id.clone())
    }
}

/// Status of one evaluation tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TickStatus {
    /// Evaluation in progress.
    Started,
    /// Evaluation produced runs.
    Success,
    /// Evaluation decided nothing was due.
    Skipped,
    /// Evaluation raised an error.
    Failure,
}

/// The mutable payload of a tick, supplied at creation and on finalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickData {
    /// Origin of the evaluated instigator.
    pub origin_id: String,
    /// Selector of the evaluated instigator.
    pub selector_id: String,
    /// Schedule or sensor.
    pub instigator_type: InstigatorType,
    /// Current status of the evaluation.
    pub status: TickStatus,
    /// When the evaluation started. Immutable after creation.
    pub timestamp: DateTime<Utc>,
    /// Runs launched by this tick.
    #[serde(default)]
    pub run_ids: Vec<RunId>,
    /// Reason the tick was skipped, if it was.
    pub skip_reason: Option<String>,
    /// Error raised by the evaluation, if any.
    pub error: Option<String>,
}

impl TickData {
    /// Creates a started tick for the given instigator at the current time.
    #[must_use]
    pub fn started(
        origin_id: impl Into<String>,
        selector_id: impl Into<String>,
        instigator_type: InstigatorType,
    ) -> Self {
        Self {
            origin_id: origin_id.into(),
            selector_id: selector_id.into(),
            instigator_type,
            status: TickStatus::Started,
            timestamp: Utc::now(),
            run_ids: Vec::new(),
            skip_reason: None,
            error: None,
        }
    }
}

/// One stored evaluation tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstigatorTick {
    /// Store-assigned tick identifier. Immutable.
    pub id: TickId,
    /// The tick payload.
    pub data: TickData,
}

impl InstigatorTick {
    /// Returns a copy finalized with the given status.
    #[must_use]
    pub fn with_status(mut self, status: TickStatus) -> Self {
        self.data.status = status;
        self
    }
}

/// Persisted state machine storage for schedules and sensors.
#[async_trait]
pub trait ScheduleStore: StorageLifecycle {
    /// Returns all stored instigator states, optionally restricted to one
    /// instigator type.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn all_instigator_state(
        &self,
        instigator_type: Option<InstigatorType>,
    ) -> Result<Vec<InstigatorState>>;

    /// Fetches the state for `(origin_id, selector_id)`; `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_instigator_state(
        &self,
        origin_id: &str,
        selector_id: &str,
    ) -> Result<Option<InstigatorState>>;

    /// Inserts a new instigator state.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if the key is already present.
    async fn add_instigator_state(&self, state: InstigatorState) -> Result<InstigatorState>;

    /// Replaces an existing instigator state.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent.
    async fn update_instigator_state(&self, state: InstigatorState) -> Result<InstigatorState>;

    /// Removes the state for `(origin_id, selector_id)`.
    ///
    /// Deleting a missing key is a failure, not a no-op: explicit deletes
    /// signal lost state when the row is unexpectedly absent.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the key is absent.
    async fn delete_instigator_state(&self, origin_id: &str, selector_id: &str) -> Result<()>;

    /// Appends a tick, returning it with its store-assigned id.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn create_tick(&self, tick_data: TickData) -> Result<InstigatorTick>;

    /// Finalizes an existing tick's status and metadata.
    ///
    /// The tick id and creation timestamp are immutable; the stored
    /// timestamp is preserved regardless of the value in `tick`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the tick id is absent.
    async fn update_tick(&self, tick: InstigatorTick) -> Result<()>;

    /// Returns tick history for one instigator, newest-first, filtered by an
    /// optional time window and status set.
    ///
    /// `before`/`after` are exclusive bounds on the tick timestamp.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_ticks(
        &self,
        origin_id: &str,
        selector_id: &str,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        limit: Option<usize>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<Vec<InstigatorTick>>;

    /// Returns tick history for many selector ids in one call, newest-first
    /// per selector.
    ///
    /// Callers should check [`ScheduleStore::supports_batch_queries`] and
    /// fall back to per-selector `get_ticks` calls when unsupported.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn get_batch_ticks(
        &self,
        selector_ids: &[String],
        limit: Option<usize>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<HashMap<String, Vec<InstigatorTick>>>;

    /// Returns true if this backend answers `get_batch_ticks` natively.
    fn supports_batch_queries(&self) -> bool {
        true
    }

    /// Deletes ticks of one instigator strictly older than `before`,
    /// optionally restricted to the given statuses. Ticks at or after the
    /// cutoff are never deleted. Returns the number of ticks removed.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` on backend failure.
    async fn purge_ticks(
        &self,
        origin_id: &str,
        selector_id: &str,
        before: DateTime<Utc>,
        statuses: Option<&[TickStatus]>,
    ) -> Result<usize>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_data_starts_started() {
        let data = TickData::started("origin", "selector", InstigatorType::Schedule);
        assert_eq!(data.status, TickStatus::Started);
        assert!(data.run_ids.is_empty());
    }

    #[test]
    fn state_key_pairs_origin_and_selector() {
        let state = InstigatorState {
            origin_id: "origin".to_string(),
            selector_id: "selector".to_string(),
            instigator_type: InstigatorType::Sensor,
            status: InstigatorStatus::Running,
            cursor: None,
        };
        assert_eq!(
            state.key(),
            ("origin".to_string(), "selector".to_string())
        );
    }
}
