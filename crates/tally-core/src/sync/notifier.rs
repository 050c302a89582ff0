//! Cross-context change bus.
//!
//! Each collection has a broadcast channel named `tally:{collection}`.
//! Posting is fire-and-forget and at-most-once; a context that misses a
//! message only sees the change at its next refresh.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use uuid::Uuid;

const CHANNEL_PREFIX: &str = "tally:";
const CHANNEL_CAPACITY: usize = 64;

/// Deterministic channel name of a collection
pub fn channel_name(collection: &str) -> String {
    format!("{CHANNEL_PREFIX}{collection}")
}

/// Identity of one execution context (engine instance)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(Uuid);

impl ContextId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Message posted after a successful local write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMessage {
    pub channel: String,
    pub sender: ContextId,
}

impl ChangeMessage {
    /// Wire body of every change message
    pub const BODY: &'static str = "update";
}

/// Registry of per-collection broadcast channels shared by sibling contexts
#[derive(Clone, Default)]
pub struct ChangeBus {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<ChangeMessage>>>>,
}

impl ChangeBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&self, channel: &str) -> broadcast::Sender<ChangeMessage> {
        let mut channels = self
            .channels
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }

    /// Keep a receiver open on a collection's channel
    pub fn subscribe(&self, collection: &str) -> broadcast::Receiver<ChangeMessage> {
        self.open(&channel_name(collection)).subscribe()
    }

    /// Post one `update` message and drop the handle.
    ///
    /// Returns how many receivers were listening.
    pub fn post_update(&self, collection: &str, sender: ContextId) -> usize {
        let channel = channel_name(collection);
        let handle = self.open(&channel);
        let delivered = handle
            .send(ChangeMessage {
                channel: channel.clone(),
                sender,
            })
            .unwrap_or(0);
        tracing::trace!("Posted {} on {channel} to {delivered} receivers", ChangeMessage::BODY);
        delivered
    }
}
