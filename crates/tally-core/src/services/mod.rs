//! Shared service layer used by the engine and clients.

mod local_store;

pub use local_store::{Committed, LocalStore};
