//! # strata-core
//!
//! Shared primitives for the Strata orchestration storage engine.
//!
//! This crate provides the foundational types used across all Strata
//! components:
//!
//! - **Identifiers**: Strongly-typed IDs for runs, backfills, and ticks
//! - **Asset Keys**: Hierarchical names for data assets
//! - **Canonical Encoding**: Deterministic JSON for content-addressed snapshots
//! - **Error Types**: The shared storage error taxonomy and result type
//!
//! ## Crate Boundary
//!
//! `strata-core` is the only crate allowed to define shared primitives.
//! Store contracts and backend implementations live in `strata-storage`.
//!
//! ## Example
//!
//! ```rust
//! use strata_core::prelude::*;
//!
//! let run_id = RunId::generate();
//! let key = AssetKey::new(["analytics", "daily_report"]);
//! assert_eq!(key.to_string(), "analytics/daily_report");
//! # let _ = run_id;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod asset_key;
pub mod canonical;
pub mod error;
pub mod id;

/// Prelude module for convenient imports.
///
/// # Example
///
/// ```rust
/// use strata_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::asset_key::AssetKey;
    pub use crate::canonical::{content_hash, to_canonical_bytes};
    pub use crate::error::{Error, Result};
    pub use crate::id::{BackfillId, RunId, SnapshotId, TickId};
}

pub use asset_key::AssetKey;
pub use error::{Error, Result};
pub use id::{BackfillId, RunId, SnapshotId, TickId};
