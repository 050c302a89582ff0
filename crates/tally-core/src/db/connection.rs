//! Database connection management

use crate::error::{Error, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use std::time::Duration;

use super::migrations;

/// Database wrapper for the local `SQLite` store
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open a database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        let database = Self { conn };
        database.configure(true)?;
        database.migrate()?;
        Ok(database)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let database = Self { conn };
        database.configure(false)?;
        database.migrate()?;
        Ok(database)
    }

    /// Configure `SQLite` for concurrent readers and durable writes
    fn configure(&self, file_backed: bool) -> Result<()> {
        if file_backed {
            // WAL lets sibling processes read while one writes
            if let Err(error) = self.conn.pragma_update_and_check(
                None,
                "journal_mode",
                "WAL",
                |row| row.get::<_, String>(0),
            ) {
                tracing::warn!("Failed to enable WAL journal mode: {error}");
            }
        }
        self.conn.pragma_update(None, "synchronous", "NORMAL")?;
        self.conn.pragma_update(None, "foreign_keys", true)?;
        self.conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }

    /// Run database migrations
    fn migrate(&self) -> Result<()> {
        migrations::run(&self.conn)
    }

    /// Register collections so they have backing storage before first use.
    ///
    /// Idempotent: already registered names are left untouched.
    pub fn ensure_collections<S: AsRef<str>>(&self, names: &[S]) -> Result<()> {
        let now = crate::util::now_millis();
        let tx = self.conn.unchecked_transaction()?;
        for name in names {
            let name = name.as_ref();
            if name.trim().is_empty() {
                return Err(Error::Config("collection name must not be empty".into()));
            }
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO collections (name, created_at) VALUES (?, ?)",
                params![name, now],
            )?;
            if inserted > 0 {
                tracing::debug!("Registered collection {name}");
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Get a reference to the underlying connection
    pub const fn connection(&self) -> &Connection {
        &self.conn
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn collection_count(db: &Database) -> i64 {
        db.connection()
            .query_row("SELECT COUNT(*) FROM collections", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert_eq!(collection_count(&db), 0);
    }

    #[test]
    fn test_ensure_collections_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.ensure_collections(&["products", "sales"]).unwrap();
        db.ensure_collections(&["products", "sales"]).unwrap();
        assert_eq!(collection_count(&db), 2);

        db.ensure_collections(&["products", "purchases"]).unwrap();
        assert_eq!(collection_count(&db), 3);
    }

    #[test]
    fn test_ensure_collections_rejects_blank_names() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.ensure_collections(&["  "]).is_err());
        assert_eq!(collection_count(&db), 0);
    }

    #[test]
    fn test_file_database_survives_reopen() {
        let tmp = tempdir().unwrap();
        let db_path = tmp.path().join("tally.db");

        {
            let db = Database::open(&db_path).unwrap();
            db.ensure_collections(&["products"]).unwrap();
        }

        let reopened = Database::open(&db_path).unwrap();
        assert_eq!(collection_count(&reopened), 1);
    }
}
