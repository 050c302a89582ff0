//! Synchronization engine.
//!
//! Local writes land in the local store together with a pending mutation;
//! the drainer pushes the queue to the remote store while listeners apply
//! remote deltas back with `Origin::Remote`. Views refresh through a
//! per-collection debouncer and sibling engines are told about local writes
//! over the change bus.

mod connectivity;
mod debounce;
mod drainer;
mod engine;
mod listener;
mod notifier;

use serde::Serialize;

use crate::models::MutationId;

pub use connectivity::{Connectivity, OnlineFlag};
pub use debounce::RefreshScheduler;
pub use drainer::{DrainOutcome, DrainReport, Drainer};
pub use engine::{Engine, EngineBuilder};
pub use listener::Listener;
pub use notifier::{channel_name, ChangeBus, ChangeMessage, ContextId};

/// Notifications published by a running engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SyncEvent {
    /// A drain cycle finished
    DrainCompleted {
        pushed: usize,
        failed: usize,
        quarantined: usize,
        remaining: usize,
    },
    /// A mutation was moved to dead letters
    MutationQuarantined {
        id: MutationId,
        collection: String,
        reason: String,
    },
    /// A remote record was stored locally
    RemoteApplied { collection: String, id: String },
    /// A record was removed locally because it is gone remotely
    RemoteRemoved { collection: String, id: String },
    /// A collection view was re-read from the local store
    Refreshed { collection: String, records: usize },
    /// A listener could not attach and will retry
    ListenerError { collection: String, message: String },
}
