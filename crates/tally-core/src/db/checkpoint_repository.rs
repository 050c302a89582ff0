//! Sync checkpoint repository

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::models::SyncCheckpoint;

/// Trait for per-collection sync checkpoints
pub trait CheckpointRepository {
    /// Last applied remote timestamp, 0 when never set
    fn get(&self, collection: &str) -> Result<i64>;

    /// Upsert the checkpoint
    fn set(&self, collection: &str, last_synced_at: i64) -> Result<()>;

    /// Store `max(current, candidate)` and return the stored value
    fn advance(&self, collection: &str, candidate: i64) -> Result<i64>;

    /// Every stored checkpoint
    fn list(&self) -> Result<Vec<SyncCheckpoint>>;

    /// Forget every checkpoint
    fn clear(&self) -> Result<()>;
}

/// `SQLite` implementation of `CheckpointRepository`
pub struct SqliteCheckpointRepository<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteCheckpointRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl CheckpointRepository for SqliteCheckpointRepository<'_> {
    fn get(&self, collection: &str) -> Result<i64> {
        let value = self
            .conn
            .query_row(
                "SELECT last_synced_at FROM sync_checkpoints WHERE collection = ?",
                params![collection],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.unwrap_or(0))
    }

    fn set(&self, collection: &str, last_synced_at: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO sync_checkpoints (collection, last_synced_at) VALUES (?, ?)
             ON CONFLICT(collection) DO UPDATE SET last_synced_at = excluded.last_synced_at",
            params![collection, last_synced_at],
        )?;
        Ok(())
    }

    fn advance(&self, collection: &str, candidate: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO sync_checkpoints (collection, last_synced_at) VALUES (?, ?)
             ON CONFLICT(collection) DO UPDATE SET
                 last_synced_at = MAX(last_synced_at, excluded.last_synced_at)",
            params![collection, candidate],
        )?;
        self.get(collection)
    }

    fn list(&self) -> Result<Vec<SyncCheckpoint>> {
        let mut stmt = self.conn.prepare(
            "SELECT collection, last_synced_at FROM sync_checkpoints ORDER BY collection",
        )?;
        let checkpoints = stmt
            .query_map([], |row| {
                Ok(SyncCheckpoint {
                    collection_name: row.get(0)?,
                    last_synced_at: row.get(1)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(checkpoints)
    }

    fn clear(&self) -> Result<()> {
        self.conn.execute("DELETE FROM sync_checkpoints", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_get_defaults_to_zero() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCheckpointRepository::new(db.connection());
        assert_eq!(repo.get("products").unwrap(), 0);
    }

    #[test]
    fn test_set_overwrites() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCheckpointRepository::new(db.connection());

        repo.set("products", 1_500).unwrap();
        repo.set("products", 900).unwrap();
        assert_eq!(repo.get("products").unwrap(), 900);
    }

    #[test]
    fn test_advance_never_moves_backwards() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCheckpointRepository::new(db.connection());

        assert_eq!(repo.advance("products", 2_000).unwrap(), 2_000);
        assert_eq!(repo.advance("products", 1_000).unwrap(), 2_000);
        assert_eq!(repo.advance("products", 2_500).unwrap(), 2_500);
        assert_eq!(repo.get("sales").unwrap(), 0);
    }

    #[test]
    fn test_list_and_clear() {
        let db = Database::open_in_memory().unwrap();
        let repo = SqliteCheckpointRepository::new(db.connection());

        repo.set("sales", 5).unwrap();
        repo.set("products", 7).unwrap();

        let all = repo.list().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].collection_name, "products");
        assert_eq!(all[0].last_synced_at, 7);

        repo.clear().unwrap();
        assert!(repo.list().unwrap().is_empty());
    }
}
