//! Pending mutation model

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::record::{Record, ID_FIELD};

/// A unique identifier for a queued mutation, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationId(Uuid);

impl MutationId {
    /// Create a new unique mutation ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for MutationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MutationId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Kind of local write a mutation carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MutationAction {
    Add,
    Update,
    Delete,
}

impl MutationAction {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for MutationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MutationAction {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "add" => Ok(Self::Add),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(Error::InvalidRecord(format!("unknown mutation action: {other}"))),
        }
    }
}

/// A local write not yet confirmed by the remote store.
///
/// `payload` is the full record for add/update and the bare record id
/// (a JSON string) for delete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Unique identifier
    pub id: MutationId,
    /// Insertion order within the queue
    pub seq: i64,
    /// Target collection
    #[serde(rename = "collectionName")]
    pub collection: String,
    /// Write kind
    pub action: MutationAction,
    /// Record (add/update) or id (delete)
    pub payload: Value,
    /// Enqueue timestamp (Unix ms)
    pub created_at: i64,
    /// Failed push attempts so far
    pub attempts: u32,
    /// Earliest time (Unix ms) the drainer may retry this entry
    pub next_attempt_at: i64,
    /// Last remote error, if any
    pub last_error: Option<String>,
}

impl PendingMutation {
    /// Id of the record this mutation targets, validating the payload shape.
    pub fn record_id(&self) -> Result<&str> {
        let id = match self.action {
            MutationAction::Add | MutationAction::Update => self
                .payload
                .as_object()
                .ok_or_else(|| {
                    Error::InvalidRecord(format!(
                        "{} payload for {} must be an object",
                        self.action, self.collection
                    ))
                })?
                .get(ID_FIELD)
                .and_then(Value::as_str),
            MutationAction::Delete => self.payload.as_str(),
        };

        match id {
            Some(id) if !id.trim().is_empty() => Ok(id),
            _ => Err(Error::InvalidRecord(format!(
                "{} payload for {} has no usable id",
                self.action, self.collection
            ))),
        }
    }

    /// Whether the drainer may push this entry at `now`
    pub const fn is_due(&self, now: i64) -> bool {
        self.next_attempt_at <= now
    }
}

/// Payload stored for a local write
pub fn payload_for(action: MutationAction, record: &Record) -> Value {
    match action {
        MutationAction::Add | MutationAction::Update => record.clone().into_value(),
        MutationAction::Delete => Value::String(record.id().to_string()),
    }
}

/// A mutation moved out of the queue after validation failure or after
/// exhausting its retry budget.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub mutation: PendingMutation,
    pub reason: String,
    pub quarantined_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mutation(action: MutationAction, payload: Value) -> PendingMutation {
        PendingMutation {
            id: MutationId::new(),
            seq: 1,
            collection: "products".to_string(),
            action,
            payload,
            created_at: 0,
            attempts: 0,
            next_attempt_at: 0,
            last_error: None,
        }
    }

    #[test]
    fn test_mutation_id_parse() {
        let id = MutationId::new();
        let parsed: MutationId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_action_round_trip_through_text() {
        for action in [MutationAction::Add, MutationAction::Update, MutationAction::Delete] {
            assert_eq!(action.as_str().parse::<MutationAction>().unwrap(), action);
        }
        assert!("upsert".parse::<MutationAction>().is_err());
    }

    #[test]
    fn test_record_id_for_each_action() {
        let add = mutation(MutationAction::Add, json!({"id": "p1", "name": "Widget"}));
        assert_eq!(add.record_id().unwrap(), "p1");

        let delete = mutation(MutationAction::Delete, json!("p1"));
        assert_eq!(delete.record_id().unwrap(), "p1");
    }

    #[test]
    fn test_record_id_rejects_malformed_payloads() {
        assert!(mutation(MutationAction::Add, json!({"name": "x"}))
            .record_id()
            .is_err());
        assert!(mutation(MutationAction::Update, json!("p1"))
            .record_id()
            .is_err());
        assert!(mutation(MutationAction::Delete, json!({"id": "p1"}))
            .record_id()
            .is_err());
        assert!(mutation(MutationAction::Delete, json!(""))
            .record_id()
            .is_err());
    }

    #[test]
    fn test_payload_for_delete_is_bare_id() {
        let record = Record::from_value(json!({"id": "p9", "name": "Bolt"})).unwrap();
        assert_eq!(payload_for(MutationAction::Delete, &record), json!("p9"));
        assert_eq!(
            payload_for(MutationAction::Add, &record),
            json!({"id": "p9", "name": "Bolt"})
        );
    }

    #[test]
    fn test_serializes_collection_name_in_camel_case() {
        let add = mutation(MutationAction::Add, json!({"id": "p1"}));
        let value = serde_json::to_value(&add).unwrap();
        assert_eq!(value["collectionName"], json!("products"));
        assert_eq!(value["action"], json!("add"));
        assert!(value.get("nextAttemptAt").is_some());
    }
}
