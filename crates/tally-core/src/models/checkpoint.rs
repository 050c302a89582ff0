//! Sync checkpoint model

use serde::{Deserialize, Serialize};

/// Latest remote timestamp up to which a collection's deltas were applied
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub collection_name: String,
    /// Unix ms; 0 when the collection has never received a delta
    pub last_synced_at: i64,
}
