//! Record repository implementation

#![allow(clippy::cast_possible_wrap)] // SQLite uses i64 for LIMIT

use crate::error::{Error, Result};
use crate::models::{Record, SyncConflict, WriteOutcome};
use rusqlite::{params, Connection, OptionalExtension};

/// Trait for per-collection record storage
pub trait RecordRepository {
    /// Get a record by id
    fn get(&self, collection: &str, id: &str) -> Result<Option<Record>>;

    /// List every record of a collection, ordered by id
    fn list(&self, collection: &str) -> Result<Vec<Record>>;

    /// List record ids of a collection
    fn list_ids(&self, collection: &str) -> Result<Vec<String>>;

    /// Upsert a record by id
    fn put(&self, collection: &str, record: &Record) -> Result<WriteOutcome>;

    /// Delete a record; returns whether it existed
    fn remove(&self, collection: &str, id: &str) -> Result<bool>;

    /// Delete every record of a collection
    fn clear(&self, collection: &str) -> Result<usize>;

    /// Names of registered collections
    fn list_collections(&self) -> Result<Vec<String>>;

    /// Recently recorded LWW conflicts, newest first
    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>>;

    /// Remember a version of a record written by this client
    fn remember_local_version(&self, collection: &str, id: &str, updated_at: i64) -> Result<()>;

    /// Whether `updated_at` is a version this client wrote and has since replaced
    fn is_superseded_local_version(
        &self,
        collection: &str,
        id: &str,
        updated_at: i64,
    ) -> Result<bool>;

    /// Forget remembered versions of a record up to `up_to`, or all of them
    fn forget_local_versions(&self, collection: &str, id: &str, up_to: Option<i64>)
        -> Result<()>;
}

/// `SQLite` implementation of `RecordRepository`
pub struct SqliteRecordRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteRecordRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    /// Fail unless the collection was registered during schema setup
    fn ensure_collection(&self, collection: &str) -> Result<()> {
        let exists: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM collections WHERE name = ?)",
            params![collection],
            |row| row.get(0),
        )?;

        if exists {
            Ok(())
        } else {
            Err(Error::UnknownCollection(collection.to_string()))
        }
    }

    fn stored_updated_at(&self, collection: &str, id: &str) -> Result<Option<i64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT updated_at FROM records WHERE collection = ? AND id = ?",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?)
    }
}

impl RecordRepository for SqliteRecordRepository<'_> {
    fn get(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.ensure_collection(collection)?;

        let data: Option<String> = self
            .conn
            .query_row(
                "SELECT data FROM records WHERE collection = ? AND id = ?",
                params![collection, id],
                |row| row.get(0),
            )
            .optional()?;

        data.as_deref().map(Record::from_json_str).transpose()
    }

    fn list(&self, collection: &str) -> Result<Vec<Record>> {
        self.ensure_collection(collection)?;

        let mut stmt = self
            .conn
            .prepare("SELECT data FROM records WHERE collection = ? ORDER BY id")?;
        let rows = stmt
            .query_map(params![collection], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.iter().map(|raw| Record::from_json_str(raw)).collect()
    }

    fn list_ids(&self, collection: &str) -> Result<Vec<String>> {
        self.ensure_collection(collection)?;

        let mut stmt = self
            .conn
            .prepare("SELECT id FROM records WHERE collection = ? ORDER BY id")?;
        let ids = stmt
            .query_map(params![collection], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;

        Ok(ids)
    }

    fn put(&self, collection: &str, record: &Record) -> Result<WriteOutcome> {
        self.ensure_collection(collection)?;

        let incoming = record.updated_at().unwrap_or(0);
        let stored = self.stored_updated_at(collection, record.id())?;

        // The conflict guard trigger drops (and logs) updates older than the stored row
        self.conn.execute(
            "INSERT INTO records (collection, id, data, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(collection, id) DO UPDATE SET
                 data = excluded.data,
                 updated_at = excluded.updated_at",
            params![collection, record.id(), record.to_json_string()?, incoming],
        )?;

        if stored.is_some_and(|stored| incoming < stored) {
            Ok(WriteOutcome::Stale)
        } else {
            Ok(WriteOutcome::Stored)
        }
    }

    fn remove(&self, collection: &str, id: &str) -> Result<bool> {
        self.ensure_collection(collection)?;

        let rows = self.conn.execute(
            "DELETE FROM records WHERE collection = ? AND id = ?",
            params![collection, id],
        )?;
        Ok(rows > 0)
    }

    fn clear(&self, collection: &str) -> Result<usize> {
        self.ensure_collection(collection)?;

        let rows = self.conn.execute(
            "DELETE FROM records WHERE collection = ?",
            params![collection],
        )?;
        self.conn.execute(
            "DELETE FROM local_versions WHERE collection = ?",
            params![collection],
        )?;
        Ok(rows)
    }

    fn list_collections(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM collections ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(names)
    }

    fn list_conflicts(&self, limit: usize) -> Result<Vec<SyncConflict>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, collection, record_id, local_updated_at, incoming_updated_at, resolved_at, strategy
             FROM sync_conflicts
             ORDER BY resolved_at DESC, id DESC
             LIMIT ?",
        )?;

        let conflicts = stmt
            .query_map(params![limit as i64], |row| {
                Ok(SyncConflict {
                    id: row.get(0)?,
                    collection: row.get(1)?,
                    record_id: row.get(2)?,
                    local_updated_at: row.get(3)?,
                    incoming_updated_at: row.get(4)?,
                    resolved_at: row.get(5)?,
                    strategy: row.get(6)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(conflicts)
    }

    fn remember_local_version(&self, collection: &str, id: &str, updated_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO local_versions (collection, record_id, updated_at)
             VALUES (?, ?, ?)",
            params![collection, id, updated_at],
        )?;
        Ok(())
    }

    fn is_superseded_local_version(
        &self,
        collection: &str,
        id: &str,
        updated_at: i64,
    ) -> Result<bool> {
        let Some(stored) = self.stored_updated_at(collection, id)? else {
            return Ok(false);
        };
        if updated_at >= stored {
            return Ok(false);
        }

        let known: bool = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM local_versions
                           WHERE collection = ? AND record_id = ? AND updated_at = ?)",
            params![collection, id, updated_at],
            |row| row.get(0),
        )?;
        Ok(known)
    }

    fn forget_local_versions(
        &self,
        collection: &str,
        id: &str,
        up_to: Option<i64>,
    ) -> Result<()> {
        self.conn.execute(
            "DELETE FROM local_versions
             WHERE collection = ? AND record_id = ? AND (? IS NULL OR updated_at <= ?)",
            params![collection, id, up_to, up_to],
        )?;
        Ok(())
    }
}
