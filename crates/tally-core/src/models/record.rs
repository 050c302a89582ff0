//! Record model

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Field holding the record identifier
pub const ID_FIELD: &str = "id";

/// Field holding the last mutation timestamp (Unix ms)
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// A JSON object stored in a collection.
///
/// Every record carries a non-empty string `id`. The `updatedAt` field is
/// optional on input but is stamped on every local mutation and drives
/// last-write-wins and checkpoint range queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Record(Map<String, Value>);

impl Record {
    /// Build a record from an arbitrary JSON value, validating its shape.
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(fields) = value else {
            return Err(Error::InvalidRecord("record must be a JSON object".into()));
        };

        match fields.get(ID_FIELD) {
            Some(Value::String(id)) if !id.trim().is_empty() => Ok(Self(fields)),
            Some(Value::String(_)) => Err(Error::InvalidRecord("record id is empty".into())),
            Some(_) => Err(Error::InvalidRecord("record id must be a string".into())),
            None => Err(Error::InvalidRecord("record is missing an id".into())),
        }
    }

    /// Parse a record from its JSON text form.
    pub fn from_json_str(raw: &str) -> Result<Self> {
        Self::from_value(serde_json::from_str(raw)?)
    }

    /// Record identifier
    pub fn id(&self) -> &str {
        self.0
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Timestamp of the mutation that produced this record, if present
    pub fn updated_at(&self) -> Option<i64> {
        self.0.get(UPDATED_AT_FIELD).and_then(Value::as_i64)
    }

    /// Overwrite `updatedAt`
    pub fn stamp(&mut self, updated_at: i64) {
        self.0
            .insert(UPDATED_AT_FIELD.to_string(), Value::from(updated_at));
    }

    /// Read a single field
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    /// Shallow-merge `patch` into this record.
    ///
    /// The patch may repeat the record's own id but never change it.
    pub fn merge(&mut self, patch: Map<String, Value>) -> Result<()> {
        if let Some(patch_id) = patch.get(ID_FIELD) {
            if patch_id.as_str() != Some(self.id()) {
                return Err(Error::InvalidRecord(format!(
                    "patch cannot change record id {}",
                    self.id()
                )));
            }
        }

        for (key, value) in patch {
            self.0.insert(key, value);
        }
        Ok(())
    }

    /// Borrow the underlying JSON object
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Serialize to compact JSON text
    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Consume into a JSON value
    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl TryFrom<Value> for Record {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        record.into_value()
    }
}

/// Timestamp for a local mutation of a record.
///
/// Uses the wall clock but never goes backwards relative to the stored
/// version, so `updatedAt` is strictly increasing per record even when the
/// device clock is adjusted.
pub fn next_local_timestamp(existing: Option<&Record>, now: i64) -> i64 {
    existing
        .and_then(Record::updated_at)
        .map_or(now, |previous| now.max(previous.saturating_add(1)))
}
