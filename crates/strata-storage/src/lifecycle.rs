//! Shared maintenance surface for all stores.
//!
//! Every store role (runs, event log, schedules) carries the same
//! administrative entry points, so they live in one supertrait. A combined
//! backend implements this once for all roles; independent backends implement
//! it per role, scoped to their own tables.

use async_trait::async_trait;

use strata_core::Result;

/// Administrative operations every store must support.
///
/// These are exposed to operational tooling, not to runtime pipeline
/// execution. `migrate` and `optimize` must be idempotent: safe to invoke
/// multiple times with no effect beyond the first successful application.
#[async_trait]
pub trait StorageLifecycle: Send + Sync {
    /// Applies pending schema changes to the backend.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be reached.
    async fn migrate(&self) -> Result<()>;

    /// Applies storage-level optimizations (index rebuilds, vacuuming).
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be reached.
    async fn optimize(&self) -> Result<()>;

    /// Deletes all rows owned by this store. Irreversible; intended for
    /// test/reset use only.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if the backend cannot be reached.
    async fn wipe(&self) -> Result<()>;

    /// Releases held resources (connections, file handles, watcher tasks).
    ///
    /// Safe to call even if some internal resources were never opened.
    /// Operations after `dispose` fail with `BackendUnavailable`.
    ///
    /// # Errors
    ///
    /// Returns `BackendUnavailable` if teardown itself fails.
    async fn dispose(&self) -> Result<()>;
}
