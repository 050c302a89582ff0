//! tally-core - Core library for Tally
//!
//! This crate contains the offline-first synchronization engine shared by all
//! Tally interfaces: the local `SQLite` store, the outbound mutation queue,
//! per-collection sync checkpoints, remote store adapters, and the engine
//! that drains local writes and applies remote deltas.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod remote;
pub mod services;
pub mod state;
pub mod sync;
pub mod util;

pub use config::EngineConfig;
pub use error::{Error, Result};
pub use models::{
    DeadLetter, MutationAction, MutationId, Origin, PendingMutation, Record, SyncCheckpoint,
    SyncConflict,
};
pub use services::LocalStore;
pub use state::{EngineStatus, SyncState};
pub use sync::{Engine, SyncEvent};
