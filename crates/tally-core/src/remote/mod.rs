//! Remote store contract and adapters.
//!
//! The remote store is a path-addressable JSON tree. Records live at
//! `{collection}/{id}`; a subscription on a collection streams child
//! added/changed/removed events, with added/changed scoped by a range filter
//! on a numeric child field.

mod memory;
mod rest;

use std::collections::HashSet;
use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::models::UPDATED_AT_FIELD;

pub use memory::{MemoryRemote, Rejection};
pub use rest::{RestRemote, RestRemoteConfig};

/// Errors reported by a remote store
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote is unreachable; nothing was applied
    #[error("Remote unreachable: {0}")]
    Connectivity(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Throttled by remote: {0}")]
    Throttled(String),

    #[error("Remote API error: {0}")]
    Api(String),

    #[error("Invalid remote path: {0}")]
    InvalidPath(String),

    #[error("Invalid remote configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Remote payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RemoteError {
    /// Whether the failure means "offline" rather than "rejected"
    pub const fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// Slash-separated path into the remote tree.
///
/// Segments must be non-empty and free of `.`, `#`, `$`, `[`, `]` and
/// control characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: &str) -> RemoteResult<Self> {
        let trimmed = path.trim_matches('/');
        if trimmed.is_empty() {
            return Err(RemoteError::InvalidPath("path is empty".to_string()));
        }

        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(RemoteError::InvalidPath(format!(
                    "empty segment in {trimmed}"
                )));
            }
            if let Some(bad) = segment
                .chars()
                .find(|c| matches!(c, '.' | '#' | '$' | '[' | ']') || c.is_control())
            {
                return Err(RemoteError::InvalidPath(format!(
                    "{trimmed} contains forbidden character {bad:?}"
                )));
            }
        }

        Ok(Self(trimmed.to_string()))
    }

    /// Path of a collection
    pub fn collection(collection: &str) -> RemoteResult<Self> {
        Self::new(collection)
    }

    /// Path of a record inside a collection
    pub fn record(collection: &str, id: &str) -> RemoteResult<Self> {
        if id.contains('/') {
            return Err(RemoteError::InvalidPath(format!(
                "record id {id} contains '/'"
            )));
        }
        Self::new(&format!("{collection}/{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// `field >= start_at` filter applied to added/changed children
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub field: String,
    pub start_at: i64,
}

impl RangeFilter {
    /// Children whose `updatedAt` is at least `start_at`
    pub fn updated_since(start_at: i64) -> Self {
        Self {
            field: UPDATED_AT_FIELD.to_string(),
            start_at,
        }
    }

    /// Whether a child value passes the filter. A child without the field
    /// only passes an unbounded (`start_at <= 0`) filter.
    pub fn matches(&self, value: &Value) -> bool {
        value
            .get(&self.field)
            .and_then(Value::as_i64)
            .map_or(self.start_at <= 0, |field| field >= self.start_at)
    }

    /// Children passing the filter, oldest first.
    ///
    /// Listeners advance their checkpoint per event, so a replay cut short
    /// must never have sent a newer child before an older one.
    pub fn select(
        &self,
        children: impl IntoIterator<Item = (String, Value)>,
    ) -> Vec<(String, Value)> {
        let mut selected: Vec<_> = children
            .into_iter()
            .filter(|(_, value)| self.matches(value))
            .collect();
        selected.sort_by(|(left_key, left), (right_key, right)| {
            self.position(left)
                .cmp(&self.position(right))
                .then_with(|| left_key.cmp(right_key))
        });
        selected
    }

    fn position(&self, value: &Value) -> i64 {
        value
            .get(&self.field)
            .and_then(Value::as_i64)
            .unwrap_or(i64::MIN)
    }
}

/// Child event of a subscribed collection
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteEvent {
    Added { key: String, value: Value },
    Changed { key: String, value: Value },
    Removed { key: String },
}

impl RemoteEvent {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Changed { key, .. } | Self::Removed { key } => key,
        }
    }
}

/// Stream of child events. Dropping it ends the subscription.
pub struct Subscription {
    events: mpsc::Receiver<RemoteEvent>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    /// Subscription fed by a background task that is aborted on drop
    pub const fn with_task(events: mpsc::Receiver<RemoteEvent>, task: JoinHandle<()>) -> Self {
        Self {
            events,
            task: Some(task),
        }
    }

    /// Next event; `None` once the remote ended the stream
    pub async fn next(&mut self) -> Option<RemoteEvent> {
        self.events.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// A shared remote data store
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Write `value` at `path`, replacing whatever was there
    async fn set(&self, path: &RemotePath, value: &Value) -> RemoteResult<()>;

    /// Delete `path`. Deleting a missing path succeeds.
    async fn remove(&self, path: &RemotePath) -> RemoteResult<()>;

    /// Read `path`, `None` when nothing is stored there
    async fn get(&self, path: &RemotePath) -> RemoteResult<Option<Value>>;

    /// Stream child events of a collection. Existing children matching
    /// `filter` are delivered first as `Added`.
    async fn subscribe(&self, collection: &str, filter: RangeFilter)
        -> RemoteResult<Subscription>;

    /// Keys of the children stored under `path`
    async fn child_keys(&self, path: &RemotePath) -> RemoteResult<HashSet<String>> {
        Ok(match self.get(path).await? {
            Some(Value::Object(children)) => children.into_iter().map(|(key, _)| key).collect(),
            _ => HashSet::new(),
        })
    }
}
