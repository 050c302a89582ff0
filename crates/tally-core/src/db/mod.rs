//! Database layer for Tally

mod checkpoint_repository;
mod connection;
mod migrations;
mod queue_repository;
mod record_repository;

pub use checkpoint_repository::{CheckpointRepository, SqliteCheckpointRepository};
pub use connection::Database;
pub use queue_repository::{MutationQueue, SqliteMutationQueue};
pub use record_repository::{RecordRepository, SqliteRecordRepository};
