//! Mutation queue and dead-letter storage

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{DeadLetter, MutationAction, MutationId, PendingMutation};

/// Trait for the durable outbound mutation queue
pub trait MutationQueue {
    /// Append a mutation at the tail of the queue
    fn enqueue(
        &self,
        collection: &str,
        action: MutationAction,
        payload: &Value,
    ) -> Result<PendingMutation>;

    /// Every queued mutation in insertion order
    fn peek_all(&self) -> Result<Vec<PendingMutation>>;

    /// Delete a confirmed mutation; returns whether it was queued
    fn remove(&self, id: &MutationId) -> Result<bool>;

    /// Charge a failed attempt and reschedule the entry
    fn record_failure(
        &self,
        id: &MutationId,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<PendingMutation>;

    /// Move a mutation out of the queue into dead letters
    fn quarantine(&self, id: &MutationId, reason: &str) -> Result<DeadLetter>;

    /// Number of queued mutations
    fn pending_count(&self) -> Result<usize>;

    /// Whether any queued mutation targets this record
    fn has_pending_for(&self, collection: &str, record_id: &str) -> Result<bool>;

    /// Look up one dead letter
    fn get_dead_letter(&self, id: &MutationId) -> Result<Option<DeadLetter>>;

    /// Quarantined mutations, oldest first
    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Number of quarantined mutations
    fn dead_letter_count(&self) -> Result<usize>;

    /// Replace a dead letter with a fresh entry at the tail carrying `action` and `payload`
    fn requeue_dead_letter(
        &self,
        id: &MutationId,
        action: MutationAction,
        payload: &Value,
    ) -> Result<PendingMutation>;

    /// Drop a dead letter for good; returns whether it existed
    fn discard_dead_letter(&self, id: &MutationId) -> Result<bool>;

    /// Remove every queued mutation and dead letter
    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `MutationQueue`
pub struct SqliteMutationQueue<'a> {
    conn: &'a Connection,
}

const MUTATION_COLUMNS: &str =
    "id, seq, collection, action, payload, created_at, attempts, next_attempt_at, last_error";

// Dead letters are never scheduled, so `next_attempt_at` reads as 0
const DEAD_LETTER_COLUMNS: &str = "id, seq, collection, action, payload, created_at, attempts, \
     0 AS next_attempt_at, last_error, reason, quarantined_at";

/// Raw queue row, converted after the statement borrow ends
struct MutationRow {
    id: String,
    seq: i64,
    collection: String,
    action: String,
    payload: String,
    created_at: i64,
    attempts: u32,
    next_attempt_at: i64,
    last_error: Option<String>,
}

impl MutationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            seq: row.get(1)?,
            collection: row.get(2)?,
            action: row.get(3)?,
            payload: row.get(4)?,
            created_at: row.get(5)?,
            attempts: row.get(6)?,
            next_attempt_at: row.get(7)?,
            last_error: row.get(8)?,
        })
    }

    fn into_mutation(self) -> Result<PendingMutation> {
        let id = self
            .id
            .parse::<MutationId>()
            .map_err(|e| Error::InvalidRecord(format!("bad mutation id {}: {e}", self.id)))?;

        // A corrupt payload still has to reach the drainer so it can be quarantined
        let payload = serde_json::from_str(&self.payload).unwrap_or_else(|error| {
            tracing::warn!("Unparseable payload for mutation {id}: {error}");
            Value::Null
        });

        Ok(PendingMutation {
            id,
            seq: self.seq,
            collection: self.collection,
            action: self.action.parse()?,
            payload,
            created_at: self.created_at,
            attempts: self.attempts,
            next_attempt_at: self.next_attempt_at,
            last_error: self.last_error,
        })
    }
}

struct DeadLetterRow {
    mutation: MutationRow,
    reason: String,
    quarantined_at: i64,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            mutation: MutationRow::from_row(row)?,
            reason: row.get(9)?,
            quarantined_at: row.get(10)?,
        })
    }

    fn into_dead_letter(self) -> Result<DeadLetter> {
        Ok(DeadLetter {
            mutation: self.mutation.into_mutation()?,
            reason: self.reason,
            quarantined_at: self.quarantined_at,
        })
    }
}

fn record_id_hint(action: MutationAction, payload: &Value) -> Option<String> {
    match action {
        MutationAction::Add | MutationAction::Update => payload
            .get(crate::models::ID_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string),
        MutationAction::Delete => payload.as_str().map(str::to_string),
    }
}

impl<'a> SqliteMutationQueue<'a> {
    /// Create a new queue over the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn get(&self, id: &MutationId) -> Result<Option<PendingMutation>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {MUTATION_COLUMNS} FROM pending_mutations WHERE id = ?"),
                params![id.as_str()],
                MutationRow::from_row,
            )
            .optional()?;

        row.map(MutationRow::into_mutation).transpose()
    }

    fn count(&self, table: &str) -> Result<usize> {
        let count: i64 =
            self.conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| {
                    row.get(0)
                })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    fn missing(id: &MutationId) -> Error {
        Error::not_found("pending_mutations", &id.as_str())
    }
}

impl MutationQueue for SqliteMutationQueue<'_> {
    fn enqueue(
        &self,
        collection: &str,
        action: MutationAction,
        payload: &Value,
    ) -> Result<PendingMutation> {
        let id = MutationId::new();
        let created_at = crate::util::now_millis();

        self.conn.execute(
            "INSERT INTO pending_mutations
                 (id, collection, record_id, action, payload, created_at, attempts, next_attempt_at)
             VALUES (?, ?, ?, ?, ?, ?, 0, 0)",
            params![
                id.as_str(),
                collection,
                record_id_hint(action, payload),
                action.as_str(),
                serde_json::to_string(payload)?,
                created_at,
            ],
        )?;

        Ok(PendingMutation {
            id,
            seq: self.conn.last_insert_rowid(),
            collection: collection.to_string(),
            action,
            payload: payload.clone(),
            created_at,
            attempts: 0,
            next_attempt_at: 0,
            last_error: None,
        })
    }

    fn peek_all(&self) -> Result<Vec<PendingMutation>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {MUTATION_COLUMNS} FROM pending_mutations ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map([], MutationRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(MutationRow::into_mutation).collect()
    }

    fn remove(&self, id: &MutationId) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM pending_mutations WHERE id = ?",
            params![id.as_str()],
        )?;
        Ok(rows > 0)
    }

    fn record_failure(
        &self,
        id: &MutationId,
        error: &str,
        next_attempt_at: i64,
    ) -> Result<PendingMutation> {
        let rows = self.conn.execute(
            "UPDATE pending_mutations
             SET attempts = attempts + 1, next_attempt_at = ?, last_error = ?
             WHERE id = ?",
            params![next_attempt_at, error, id.as_str()],
        )?;
        if rows == 0 {
            return Err(Self::missing(id));
        }

        self.get(id)?.ok_or_else(|| Self::missing(id))
    }

    fn quarantine(&self, id: &MutationId, reason: &str) -> Result<DeadLetter> {
        let mutation = self.get(id)?.ok_or_else(|| Self::missing(id))?;
        let quarantined_at = crate::util::now_millis();

        self.conn.execute(
            "INSERT INTO dead_letters
                 (id, seq, collection, record_id, action, payload, created_at,
                  attempts, last_error, reason, quarantined_at)
             SELECT id, seq, collection, record_id, action, payload, created_at,
                    attempts, last_error, ?, ?
             FROM pending_mutations WHERE id = ?",
            params![reason, quarantined_at, id.as_str()],
        )?;
        self.conn.execute(
            "DELETE FROM pending_mutations WHERE id = ?",
            params![id.as_str()],
        )?;

        Ok(DeadLetter {
            mutation,
            reason: reason.to_string(),
            quarantined_at,
        })
    }

    fn pending_count(&self) -> Result<usize> {
        self.count("pending_mutations")
    }

    fn has_pending_for(&self, collection: &str, record_id: &str) -> Result<bool> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM pending_mutations WHERE collection = ? AND record_id = ?)",
            params![collection, record_id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn get_dead_letter(&self, id: &MutationId) -> Result<Option<DeadLetter>> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE id = ?"),
                params![id.as_str()],
                DeadLetterRow::from_row,
            )
            .optional()?;

        row.map(DeadLetterRow::into_dead_letter).transpose()
    }

    fn list_dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {DEAD_LETTER_COLUMNS}
             FROM dead_letters
             ORDER BY quarantined_at, seq"
        ))?;
        let rows = stmt
            .query_map([], DeadLetterRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter().map(DeadLetterRow::into_dead_letter).collect()
    }

    fn dead_letter_count(&self) -> Result<usize> {
        self.count("dead_letters")
    }

    fn requeue_dead_letter(
        &self,
        id: &MutationId,
        action: MutationAction,
        payload: &Value,
    ) -> Result<PendingMutation> {
        let letter = self
            .get_dead_letter(id)?
            .ok_or_else(|| Error::not_found("dead_letters", &id.as_str()))?;

        // Requeued entries go to the tail with a fresh id and a fresh attempt budget
        let requeued = self.enqueue(&letter.mutation.collection, action, payload)?;
        self.conn
            .execute("DELETE FROM dead_letters WHERE id = ?", params![id.as_str()])?;

        tracing::info!(
            "Requeued dead letter {id} for {} as {}",
            letter.mutation.collection,
            requeued.id
        );
        Ok(requeued)
    }

    fn discard_dead_letter(&self, id: &MutationId) -> Result<bool> {
        let rows = self
            .conn
            .execute("DELETE FROM dead_letters WHERE id = ?", params![id.as_str()])?;
        Ok(rows > 0)
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM pending_mutations", [])?;
        self.conn.execute("DELETE FROM dead_letters", [])?;
        Ok(())
    }
}
