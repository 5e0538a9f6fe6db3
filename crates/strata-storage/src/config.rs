//! Declarative storage configuration and the backend registry.
//!
//! Deployments pick their storage in config, not code: a [`StorageConfig`]
//! names a backend kind per role (or one unified kind), and a
//! [`BackendRegistry`] maps kind strings to factories. Unknown kinds fail at
//! resolve time, before any store is touched. Embedders register additional
//! engines (e.g. a networked SQL backend) through [`BackendRegistry::register`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use strata_core::{Error, Result};

use crate::event_log::memory::MemoryEventLogStore;
use crate::event_log::sqlite::SqliteEventLogStore;
use crate::event_log::EventLogStore;
use crate::facade::{StorageFacade, UnifiedStorage};
use crate::runs::memory::MemoryRunStore;
use crate::runs::sqlite::SqliteRunStore;
use crate::runs::RunStore;
use crate::schedules::memory::MemoryScheduleStore;
use crate::schedules::sqlite::SqliteScheduleStore;
use crate::schedules::ScheduleStore;
use crate::unified::{MemoryStorage, SqliteStorage};

/// One backend selection: a registered kind plus engine-specific settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSpec {
    /// Registered backend kind, e.g. `"memory"` or `"sqlite"`.
    pub kind: String,
    /// Engine-specific settings, interpreted by the factory.
    #[serde(default)]
    pub config: Value,
}

impl BackendSpec {
    /// Spec for a kind with no settings.
    #[must_use]
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            config: Value::Null,
        }
    }

    /// Attaches engine-specific settings.
    #[must_use]
    pub fn with_config(mut self, config: Value) -> Self {
        self.config = config;
        self
    }

    /// Spec for a SQLite backend at the given database path.
    #[must_use]
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        let path: PathBuf = path.into();
        Self::new("sqlite").with_config(serde_json::json!({ "path": path }))
    }

    fn sqlite_path(&self) -> Result<PathBuf> {
        self.config
            .get("path")
            .and_then(Value::as_str)
            .map(PathBuf::from)
            .ok_or_else(|| {
                Error::config(format!(
                    "backend kind '{}' requires a string 'path' setting",
                    self.kind
                ))
            })
    }
}

/// The deployment's storage selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageConfig {
    /// One backend serving all three roles.
    Unified(BackendSpec),
    /// Independent backends per role.
    Composite {
        /// Backend for the run store role.
        run_storage: BackendSpec,
        /// Backend for the event log role.
        event_log_storage: BackendSpec,
        /// Backend for the schedule store role.
        schedule_storage: BackendSpec,
    },
}

impl StorageConfig {
    /// Unified in-memory storage, the default for tests and scratch use.
    #[must_use]
    pub fn memory() -> Self {
        Self::Unified(BackendSpec::new("memory"))
    }

    /// Unified single-file SQLite storage.
    #[must_use]
    pub fn sqlite(path: impl Into<PathBuf>) -> Self {
        Self::Unified(BackendSpec::sqlite(path))
    }
}

/// Builds stores of one backend kind from a [`BackendSpec`].
pub trait BackendFactory: Send + Sync {
    /// Builds a backend serving all three roles.
    ///
    /// # Errors
    ///
    /// Returns `Config` if the spec settings are invalid for this kind and
    /// `BackendUnavailable` if the backend cannot be opened.
    fn unified(&self, spec: &BackendSpec) -> Result<Arc<dyn UnifiedStorage>>;

    /// Builds a run store.
    ///
    /// # Errors
    ///
    /// Same error contract as [`unified`](Self::unified).
    fn run_store(&self, spec: &BackendSpec) -> Result<Arc<dyn RunStore>>;

    /// Builds an event log store.
    ///
    /// # Errors
    ///
    /// Same error contract as [`unified`](Self::unified).
    fn event_log_store(&self, spec: &BackendSpec) -> Result<Arc<dyn EventLogStore>>;

    /// Builds a schedule store.
    ///
    /// # Errors
    ///
    /// Same error contract as [`unified`](Self::unified).
    fn schedule_store(&self, spec: &BackendSpec) -> Result<Arc<dyn ScheduleStore>>;
}

struct MemoryFactory;

impl BackendFactory for MemoryFactory {
    fn unified(&self, _spec: &BackendSpec) -> Result<Arc<dyn UnifiedStorage>> {
        Ok(Arc::new(MemoryStorage::new()))
    }

    fn run_store(&self, _spec: &BackendSpec) -> Result<Arc<dyn RunStore>> {
        Ok(Arc::new(MemoryRunStore::new()))
    }

    fn event_log_store(&self, _spec: &BackendSpec) -> Result<Arc<dyn EventLogStore>> {
        Ok(Arc::new(MemoryEventLogStore::new()))
    }

    fn schedule_store(&self, _spec: &BackendSpec) -> Result<Arc<dyn ScheduleStore>> {
        Ok(Arc::new(MemoryScheduleStore::new()))
    }
}

struct SqliteFactory;

impl BackendFactory for SqliteFactory {
    fn unified(&self, spec: &BackendSpec) -> Result<Arc<dyn UnifiedStorage>> {
        Ok(Arc::new(SqliteStorage::open(spec.sqlite_path()?)?))
    }

    fn run_store(&self, spec: &BackendSpec) -> Result<Arc<dyn RunStore>> {
        Ok(Arc::new(SqliteRunStore::open(spec.sqlite_path()?)?))
    }

    fn event_log_store(&self, spec: &BackendSpec) -> Result<Arc<dyn EventLogStore>> {
        Ok(Arc::new(SqliteEventLogStore::open(spec.sqlite_path()?)?))
    }

    fn schedule_store(&self, spec: &BackendSpec) -> Result<Arc<dyn ScheduleStore>> {
        Ok(Arc::new(SqliteScheduleStore::open(spec.sqlite_path()?)?))
    }
}

/// Maps backend kind strings to factories and resolves configs into facades.
pub struct BackendRegistry {
    factories: HashMap<String, Arc<dyn BackendFactory>>,
}

impl BackendRegistry {
    /// An empty registry with no kinds registered.
    #[must_use]
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// A registry with the built-in `"memory"` and `"sqlite"` kinds.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("memory", Arc::new(MemoryFactory));
        registry.register("sqlite", Arc::new(SqliteFactory));
        registry
    }

    /// Registers (or replaces) a backend kind.
    pub fn register(&mut self, kind: impl Into<String>, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(kind.into(), factory);
    }

    fn factory(&self, kind: &str) -> Result<&Arc<dyn BackendFactory>> {
        self.factories.get(kind).ok_or_else(|| {
            Error::config(format!(
                "unknown storage backend kind '{kind}' (registered: {})",
                self.kinds().join(", ")
            ))
        })
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Builds every backend named in `config` and wraps them in a facade.
    ///
    /// Fails fast: every kind is checked against the registry before any
    /// backend is constructed.
    ///
    /// # Errors
    ///
    /// Returns `Config` for an unknown kind or invalid settings and
    /// `BackendUnavailable` if a backend cannot be opened.
    pub fn resolve(&self, config: &StorageConfig) -> Result<StorageFacade> {
        match config {
            StorageConfig::Unified(spec) => {
                let backend = self.factory(&spec.kind)?.unified(spec)?;
                tracing::info!(kind = %spec.kind, "resolved unified storage backend");
                Ok(StorageFacade::unified(backend))
            }
            StorageConfig::Composite {
                run_storage,
                event_log_storage,
                schedule_storage,
            } => {
                let runs_factory = self.factory(&run_storage.kind)?;
                let events_factory = self.factory(&event_log_storage.kind)?;
                let schedules_factory = self.factory(&schedule_storage.kind)?;

                let runs = runs_factory.run_store(run_storage)?;
                let event_log = events_factory.event_log_store(event_log_storage)?;
                let schedules = schedules_factory.schedule_store(schedule_storage)?;
                tracing::info!(
                    runs = %run_storage.kind,
                    event_log = %event_log_storage.kind,
                    schedules = %schedule_storage.kind,
                    "resolved composite storage backends"
                );
                Ok(StorageFacade::composite(runs, event_log, schedules))
            }
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runs::{Run, RunStore as _, RunsFilter};

    #[tokio::test]
    async fn resolves_unified_memory_config() -> Result<()> {
        let registry = BackendRegistry::with_builtins();
        let facade = registry.resolve(&StorageConfig::memory())?;
        facade.add_run(Run::new("nightly")).await?;
        assert_eq!(facade.get_runs_count(&RunsFilter::default()).await?, 1);
        Ok(())
    }

    #[tokio::test]
    async fn resolves_mixed_composite_config() -> Result<()> {
        let registry = BackendRegistry::with_builtins();
        let config = StorageConfig::Composite {
            run_storage: BackendSpec::new("memory"),
            event_log_storage: BackendSpec::new("memory"),
            schedule_storage: BackendSpec::new("memory"),
        };
        let facade = registry.resolve(&config)?;
        facade.add_run(Run::new("nightly")).await?;
        Ok(())
    }

    #[test]
    fn unknown_kind_fails_at_resolve_time() {
        let registry = BackendRegistry::with_builtins();
        let config = StorageConfig::Unified(BackendSpec::new("postgres"));
        let err = registry.resolve(&config).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn sqlite_spec_without_path_is_rejected() {
        let registry = BackendRegistry::with_builtins();
        let config = StorageConfig::Unified(BackendSpec::new("sqlite"));
        let err = registry.resolve(&config).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }

    #[test]
    fn config_roundtrips_through_json() -> Result<()> {
        let config = StorageConfig::Composite {
            run_storage: BackendSpec::sqlite("/var/lib/strata/runs.db"),
            event_log_storage: BackendSpec::sqlite("/var/lib/strata/events.db"),
            schedule_storage: BackendSpec::new("memory"),
        };
        let json = serde_json::to_string(&config)?;
        let parsed: StorageConfig = serde_json::from_str(&json)?;
        match parsed {
            StorageConfig::Composite { run_storage, .. } => {
                assert_eq!(run_storage.kind, "sqlite");
            }
            StorageConfig::Unified(_) => panic!("expected composite config"),
        }
        Ok(())
    }
}
