//! Error types for tally-core

use thiserror::Error;

use crate::remote::RemoteError;

/// Result type alias using tally-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tally-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Local store error (quota, corruption, constraint violations)
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Collection was not registered during schema setup
    #[error("Unknown collection: {0}")]
    UnknownCollection(String),

    /// Record not found
    #[error("Record not found: {collection}/{id}")]
    NotFound { collection: String, id: String },

    /// Malformed record or mutation payload
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Invalid engine configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Remote store error
    #[error("Remote store error: {0}")]
    Remote(#[from] RemoteError),
}

impl Error {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        Self::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}
