use std::io;

use tally_core::remote::RemoteError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] tally_core::Error),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Patch must be a JSON object: {0}")]
    InvalidPatch(String),
    #[error("Invalid mutation id: {0}")]
    InvalidMutationId(String),
    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),
    #[error("Refusing to wipe local data without --yes")]
    ConfirmationRequired,
    #[error("Drain cycle timed out; pending changes stay queued")]
    SyncTimedOut,
    #[error(
        "Remote is not configured. Pass --remote <URL> or set TALLY_REMOTE_URL (and TALLY_REMOTE_AUTH when the remote needs a token)."
    )]
    RemoteNotConfigured,
}
