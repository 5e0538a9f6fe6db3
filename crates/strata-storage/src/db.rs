//! Shared SQLite connection plumbing for the persistent backends.
//!
//! Each role store owns one [`SqliteHandle`]. The handle holds the connection
//! behind `Mutex<Option<_>>` so `dispose` can take the connection out and
//! close it while later calls fail cleanly instead of touching a closed
//! handle. Statements run on the calling task; queries here are short
//! single-row or small-scan statements, so the store does not hop to a
//! blocking pool.
//!
//! All role schemas share one `PRAGMA user_version`; every schema change
//! bumps [`SCHEMA_VERSION`] and ships idempotent DDL, so `migrate` can always
//! be re-run safely.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::Connection;

use strata_core::{Error, Result};

/// Version written to `PRAGMA user_version` by the current schema.
pub(crate) const SCHEMA_VERSION: i64 = 1;

/// Maps a rusqlite error into the storage error space.
pub(crate) fn sqlite_err(err: rusqlite::Error) -> Error {
    Error::backend_with_source("sqlite operation failed", err)
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::backend("sqlite connection lock poisoned")
}

/// Renders a string-encoded enum (statuses, event types) to its wire form
/// for use in an indexed column.
pub(crate) fn enum_str<T: serde::Serialize>(value: &T) -> Result<String> {
    match serde_json::to_value(value)? {
        serde_json::Value::String(s) => Ok(s),
        other => Err(Error::serialization(format!(
            "expected string-encoded enum, got {other}"
        ))),
    }
}

/// One owned SQLite connection with lifecycle support.
pub(crate) struct SqliteHandle {
    conn: Mutex<Option<Connection>>,
}

impl SqliteHandle {
    /// Opens (creating if needed) a database file and applies connection
    /// pragmas and the given idempotent schema DDL.
    pub(crate) fn open(path: impl AsRef<Path>, ddl: &str) -> Result<Self> {
        let conn = Connection::open(path).map_err(sqlite_err)?;
        Self::from_connection(conn, ddl)
    }

    /// Opens a private in-memory database, mainly for tests.
    pub(crate) fn open_in_memory(ddl: &str) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(sqlite_err)?;
        Self::from_connection(conn, ddl)
    }

    fn from_connection(conn: Connection, ddl: &str) -> Result<Self> {
        configure(&conn)?;
        let handle = Self {
            conn: Mutex::new(Some(conn)),
        };
        handle.apply_schema(ddl)?;
        Ok(handle)
    }

    /// Runs `f` with the live connection; fails if the handle is disposed.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self.conn.lock().map_err(poison_err)?;
        match guard.as_ref() {
            Some(conn) => f(conn),
            None => Err(Error::backend("sqlite store is disposed")),
        }
    }

    /// Like [`with_conn`](Self::with_conn) but with mutable access, for
    /// explicit transactions.
    pub(crate) fn with_conn_mut<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self.conn.lock().map_err(poison_err)?;
        match guard.as_mut() {
            Some(conn) => f(conn),
            None => Err(Error::backend("sqlite store is disposed")),
        }
    }

    /// Validates `PRAGMA user_version` and applies the idempotent DDL.
    ///
    /// A fresh database (version 0) is stamped with [`SCHEMA_VERSION`]; a
    /// database written by a newer schema is rejected rather than silently
    /// read with missing columns.
    pub(crate) fn apply_schema(&self, ddl: &str) -> Result<()> {
        self.with_conn(|conn| {
            let found: i64 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(sqlite_err)?;
            if found > SCHEMA_VERSION {
                return Err(Error::SchemaMismatch {
                    found,
                    expected: SCHEMA_VERSION,
                });
            }
            conn.execute_batch(ddl).map_err(sqlite_err)?;
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)
                .map_err(sqlite_err)?;
            Ok(())
        })
    }

    /// Runs `PRAGMA optimize` to refresh planner statistics.
    pub(crate) fn optimize(&self) -> Result<()> {
        self.with_conn(|conn| conn.execute_batch("PRAGMA optimize").map_err(sqlite_err))
    }

    /// Closes the connection. Subsequent operations fail with
    /// `BackendUnavailable`; disposing twice is a no-op.
    pub(crate) fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().map_err(poison_err)?;
        if let Some(conn) = guard.take() {
            conn.close()
                .map_err(|(_, err)| sqlite_err(err))?;
        }
        Ok(())
    }
}

fn configure(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")
        .map_err(sqlite_err)?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .map_err(sqlite_err)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(sqlite_err)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))
        .map_err(sqlite_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DDL: &str = "CREATE TABLE IF NOT EXISTS t (k TEXT PRIMARY KEY, v TEXT)";

    #[test]
    fn fresh_database_is_stamped_with_schema_version() -> Result<()> {
        let handle = SqliteHandle::open_in_memory(DDL)?;
        handle.with_conn(|conn| {
            let version: i64 = conn
                .query_row("PRAGMA user_version", [], |row| row.get(0))
                .map_err(sqlite_err)?;
            assert_eq!(version, SCHEMA_VERSION);
            Ok(())
        })
    }

    #[test]
    fn newer_schema_version_is_rejected() -> Result<()> {
        let handle = SqliteHandle::open_in_memory(DDL)?;
        handle.with_conn(|conn| {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION + 1)
                .map_err(sqlite_err)
        })?;
        let err = handle.apply_schema(DDL).unwrap_err();
        assert!(matches!(err, Error::SchemaMismatch { .. }));
        Ok(())
    }

    #[test]
    fn closed_handle_rejects_use_and_reclosing() -> Result<()> {
        let handle = SqliteHandle::open_in_memory(DDL)?;
        handle.close()?;
        assert!(handle.with_conn(|_| Ok(())).is_err());
        handle.close()?;
        Ok(())
    }
}
