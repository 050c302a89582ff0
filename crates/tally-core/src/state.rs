//! Shared sync state types.

use serde::Serialize;

/// Coarse sync state shown next to the pending-items indicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SyncState {
    Offline,
    Syncing,
    Synced,
    Error,
}

impl SyncState {
    pub const fn label(self) -> &'static str {
        match self {
            Self::Offline => "offline",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }
}

/// Queue-depth indicator ("N items pending sync")
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub state: SyncState,
    pub running: bool,
    pub pending: usize,
    pub dead_letters: usize,
    /// Unix ms of the last drain that pushed every due entry
    pub last_drained_at: Option<i64>,
}

impl EngineStatus {
    /// Derive the state from connectivity and queue contents
    pub const fn derive(online: bool, pending: usize, dead_letters: usize) -> SyncState {
        if !online {
            SyncState::Offline
        } else if dead_letters > 0 {
            SyncState::Error
        } else if pending > 0 {
            SyncState::Syncing
        } else {
            SyncState::Synced
        }
    }

    /// One-line summary, e.g. "3 items pending sync"
    pub fn summary(&self) -> String {
        let pending = match self.pending {
            0 => "All changes synced".to_string(),
            1 => "1 item pending sync".to_string(),
            n => format!("{n} items pending sync"),
        };
        if self.dead_letters > 0 {
            format!("{pending}, {} failed", self.dead_letters)
        } else {
            pending
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(pending: usize, dead_letters: usize) -> EngineStatus {
        EngineStatus {
            state: EngineStatus::derive(true, pending, dead_letters),
            running: true,
            pending,
            dead_letters,
            last_drained_at: None,
        }
    }

    #[test]
    fn derive_prefers_offline_then_errors() {
        assert_eq!(EngineStatus::derive(false, 0, 3), SyncState::Offline);
        assert_eq!(EngineStatus::derive(true, 2, 1), SyncState::Error);
        assert_eq!(EngineStatus::derive(true, 2, 0), SyncState::Syncing);
        assert_eq!(EngineStatus::derive(true, 0, 0), SyncState::Synced);
    }

    #[test]
    fn summary_reports_queue_depth() {
        assert_eq!(status(0, 0).summary(), "All changes synced");
        assert_eq!(status(1, 0).summary(), "1 item pending sync");
        assert_eq!(status(3, 2).summary(), "3 items pending sync, 2 failed");
    }
}
