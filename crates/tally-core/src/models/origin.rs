//! Write origin and write kinds

use serde_json::{Map, Value};
use std::fmt;

use crate::models::record::Record;

/// Where a write came from.
///
/// Only `Local` writes produce a pending mutation. Remote-origin writes are
/// applied through a path that has no access to the mutation queue, so a
/// remote delta can never be echoed back to the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single-record write against a collection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Write {
    /// Upsert the record by id
    Put(Record),
    /// Shallow-merge fields into an existing record
    Patch {
        id: String,
        fields: Map<String, Value>,
    },
    /// Delete the record with this id
    Remove(String),
}

impl Write {
    /// Id of the record the write targets
    pub fn record_id(&self) -> &str {
        match self {
            Self::Put(record) => record.id(),
            Self::Patch { id, .. } | Self::Remove(id) => id,
        }
    }
}

/// Result of committing a write to the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record inserted or updated
    Stored,
    /// Record removed
    Removed,
    /// Remove targeted a record that was not stored
    Missing,
    /// Incoming record was older than the stored one and was ignored
    Stale,
}
