//! Collection - the fixed set of logical tables.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// A named logical table.
///
/// Names outside this set are rejected at the boundary with
/// [`StorageError::InvalidCollection`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    /// Lightning-talk events
    Events,
    /// Event participants
    Participants,
    /// Registered users
    Users,
    /// Submitted talks
    Talks,
    /// Site settings (single document)
    Settings,
    /// Analytics records
    Analytics,
}

impl Collection {
    /// Every collection, in persistence order.
    #[must_use]
    pub fn all() -> &'static [Collection] {
        &[
            Self::Events,
            Self::Participants,
            Self::Users,
            Self::Talks,
            Self::Settings,
            Self::Analytics,
        ]
    }

    /// Get the collection name as a string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Events => "events",
            Self::Participants => "participants",
            Self::Users => "users",
            Self::Talks => "talks",
            Self::Settings => "settings",
            Self::Analytics => "analytics",
        }
    }

    /// Environment variable naming this collection's remote table.
    #[must_use]
    pub fn table_env_var(&self) -> String {
        format!("DYNAMODB_{}_TABLE", self.as_str().to_ascii_uppercase())
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Collection {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| StorageError::invalid_collection(s))
    }
}
