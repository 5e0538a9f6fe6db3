//! Hierarchical names for data assets.
//!
//! An asset key is an ordered path of non-empty string components, e.g.
//! `analytics/daily_report`. Keys are the primary index into the asset and
//! partition tables of the event-log store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// A hierarchical name identifying a data asset.
///
/// Components are joined with `/` for display and string round-tripping.
/// Ordering is lexicographic over components so keys sort stably in indices.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKey(Vec<String>);

impl AssetKey {
    /// Creates an asset key from path components.
    ///
    /// # Panics
    ///
    /// Panics if `components` is empty or contains an empty component. Use
    /// [`AssetKey::try_new`] for fallible construction from untrusted input.
    #[must_use]
    pub fn new<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::try_new(components).expect("asset key components must be non-empty")
    }

    /// Creates an asset key from path components, validating them.
    ///
    /// # Errors
    ///
    /// Returns `InvalidId` if `components` is empty, or any component is empty
    /// or contains the `/` separator.
    pub fn try_new<I, S>(components: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        if components.is_empty() {
            return Err(Error::InvalidId {
                message: "asset key must have at least one component".to_string(),
            });
        }
        for c in &components {
            if c.is_empty() || c.contains('/') {
                return Err(Error::InvalidId {
                    message: format!("invalid asset key component '{c}'"),
                });
            }
        }
        Ok(Self(components))
    }

    /// Returns the path components.
    #[must_use]
    pub fn components(&self) -> &[String] {
        &self.0
    }

    /// Returns true if this key starts with the given prefix components.
    #[must_use]
    pub fn has_prefix(&self, prefix: &[String]) -> bool {
        self.0.len() >= prefix.len() && self.0[..prefix.len()] == *prefix
    }
}

impl fmt::Display for AssetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

impl FromStr for AssetKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::try_new(s.split('/'))
    }
}
