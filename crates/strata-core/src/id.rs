//! Strongly-typed identifiers for Strata entities.
//!
//! All generated identifiers are:
//! - **Strongly typed**: Prevents mixing up different ID types at compile time
//! - **Lexicographically sortable**: ULIDs encode creation time and sort naturally
//! - **Globally unique**: No coordination required for generation
//!
//! [`SnapshotId`] is the exception: it is content-addressed (a sha256 hex
//! digest of the snapshot payload) rather than generated, so identical
//! snapshot content always yields the identical ID.
//!
//! # Example
//!
//! ```rust
//! use strata_core::id::{BackfillId, RunId};
//!
//! let run = RunId::generate();
//! let backfill = BackfillId::generate();
//!
//! // IDs are different types - this won't compile:
//! // let wrong: BackfillId = run;
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

macro_rules! ulid_id {
    ($(#[$doc:meta])* $name:ident, $label:literal) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Ulid);

        impl $name {
            /// Generates a new unique ID.
            #[must_use]
            pub fn generate() -> Self {
                Self(Ulid::new())
            }

            /// Creates an ID from a raw ULID.
            #[must_use]
            pub const fn from_ulid(ulid: Ulid) -> Self {
                Self(ulid)
            }

            /// Returns the underlying ULID.
            #[must_use]
            pub const fn as_ulid(&self) -> Ulid {
                self.0
            }

            /// Returns the creation timestamp encoded in the ID.
            #[must_use]
            pub fn created_at(&self) -> chrono::DateTime<chrono::Utc> {
                let ms = self.0.timestamp_ms();
                chrono::DateTime::from_timestamp_millis(ms as i64)
                    .unwrap_or_else(chrono::Utc::now)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Ulid::from_string(s)
                    .map(Self)
                    .map_err(|e| Error::InvalidId {
                        message: format!("invalid {} '{s}': {e}", $label),
                    })
            }
        }
    };
}

ulid_id!(
    /// A unique identifier for a pipeline run.
    ///
    /// Immutable once the run is created; retries and re-executions get new
    /// run IDs linked back through root/parent lineage.
    RunId,
    "run ID"
);

ulid_id!(
    /// A unique identifier for a bulk backfill request.
    BackfillId,
    "backfill ID"
);

ulid_id!(
    /// A unique identifier for one schedule/sensor evaluation tick.
    TickId,
    "tick ID"
);

/// A content-addressed identifier for an immutable structural snapshot.
///
/// The ID is the sha256 hex digest of the snapshot's canonical JSON payload,
/// so identical content always produces an identical ID and snapshots are
/// never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotId(String);

impl SnapshotId {
    /// Wraps a precomputed sha256 hex digest.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if the digest is not 64 lowercase hex characters.
    pub fn from_digest(digest: impl Into<String>) -> Result<Self> {
        let digest = digest.into();
        let valid =
            digest.len() == 64 && digest.bytes().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase());
        if valid {
            Ok(Self(digest))
        } else {
            Err(Error::InvalidId {
                message: format!("invalid snapshot ID '{digest}': expected sha256 hex digest"),
            })
        }
    }

    /// Returns the hex digest as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SnapshotId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_digest(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::generate();
        let s = id.to_string();
        let parsed: RunId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn ids_are_unique() {
        assert_ne!(RunId::generate(), RunId::generate());
        assert_ne!(TickId::generate(), TickId::generate());
    }

    #[test]
    fn invalid_run_id_returns_error() {
        let result: Result<RunId> = "not-a-valid-ulid".parse();
        assert!(result.is_err());
    }

    #[test]
    fn snapshot_id_rejects_non_digest() {
        assert!(SnapshotId::from_digest("abc").is_err());
        assert!(SnapshotId::from_digest("G".repeat(64)).is_err());
        let ok = SnapshotId::from_digest("a".repeat(64)).unwrap();
        assert_eq!(ok.as_str().len(), 64);
    }
}
