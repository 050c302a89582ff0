//! Data models for Tally

mod checkpoint;
mod mutation;
mod origin;
mod record;
mod sync_conflict;

pub use checkpoint::SyncCheckpoint;
pub use mutation::{payload_for, DeadLetter, MutationAction, MutationId, PendingMutation};
pub use origin::{Origin, Write, WriteOutcome};
pub use record::{next_local_timestamp, Record, ID_FIELD, UPDATED_AT_FIELD};
pub use sync_conflict::SyncConflict;
