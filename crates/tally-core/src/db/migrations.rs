//! Database migrations

use crate::error::Result;
use rusqlite::{Connection, OptionalExtension};

/// Current schema version
const CURRENT_VERSION: i32 = 3;

/// Run all pending migrations
pub fn run(conn: &Connection) -> Result<()> {
    let version = get_version(conn)?;

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get::<_, i32>(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Apply a list of statements atomically
fn apply(conn: &Connection, statements: &[&str]) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    for stmt in statements {
        tx.execute(stmt, [])?;
    }
    tx.commit()?;
    Ok(())
}

/// Migration to version 1: collections, records, mutation queue, checkpoints
fn migrate_v1(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            // Schema version tracking
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            // Registered collections
            "CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                created_at INTEGER NOT NULL
            )",
            // Records of every collection, stored as JSON text
            "CREATE TABLE IF NOT EXISTS records (
                collection TEXT NOT NULL REFERENCES collections(name) ON DELETE CASCADE,
                id TEXT NOT NULL,
                data TEXT NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (collection, id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_records_updated ON records(collection, updated_at DESC)",
            // Outbound mutation queue, drained in seq order
            "CREATE TABLE IF NOT EXISTS pending_mutations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                collection TEXT NOT NULL,
                record_id TEXT,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL DEFAULT 0,
                last_error TEXT
            )",
            "CREATE INDEX IF NOT EXISTS idx_pending_collection ON pending_mutations(collection, seq)",
            "CREATE INDEX IF NOT EXISTS idx_pending_record ON pending_mutations(collection, record_id)",
            // Quarantined mutations
            "CREATE TABLE IF NOT EXISTS dead_letters (
                id TEXT PRIMARY KEY,
                seq INTEGER NOT NULL,
                collection TEXT NOT NULL,
                record_id TEXT,
                action TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL,
                last_error TEXT,
                reason TEXT NOT NULL,
                quarantined_at INTEGER NOT NULL
            )",
            // Last applied remote timestamp per collection
            "CREATE TABLE IF NOT EXISTS sync_checkpoints (
                collection TEXT PRIMARY KEY,
                last_synced_at INTEGER NOT NULL
            )",
            // Record migration version
            "INSERT INTO schema_version (version) VALUES (1)",
        ],
    )?;

    tracing::info!("Migrated database to version 1");
    Ok(())
}

/// Migration to version 2: LWW conflict logging support
fn migrate_v2(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS sync_conflicts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                local_updated_at INTEGER NOT NULL,
                incoming_updated_at INTEGER NOT NULL,
                resolved_at INTEGER NOT NULL,
                strategy TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_record ON sync_conflicts(collection, record_id)",
            "CREATE INDEX IF NOT EXISTS idx_sync_conflicts_resolved_at ON sync_conflicts(resolved_at DESC)",
            "CREATE TRIGGER IF NOT EXISTS records_lww_conflict_guard BEFORE UPDATE ON records
             FOR EACH ROW
             WHEN NEW.updated_at < OLD.updated_at
             BEGIN
                 INSERT INTO sync_conflicts (
                     collection,
                     record_id,
                     local_updated_at,
                     incoming_updated_at,
                     resolved_at,
                     strategy
                 ) VALUES (
                     OLD.collection,
                     OLD.id,
                     OLD.updated_at,
                     NEW.updated_at,
                     CAST(strftime('%s','now') AS INTEGER) * 1000,
                     'lww'
                 );
                 SELECT RAISE(IGNORE);
             END",
            "INSERT INTO schema_version (version) VALUES (2)",
        ],
    )?;

    tracing::info!("Migrated database to version 2");
    Ok(())
}

/// Migration to version 3: versions this client wrote, so echoes are not conflicts
fn migrate_v3(conn: &Connection) -> Result<()> {
    apply(
        conn,
        &[
            "CREATE TABLE IF NOT EXISTS local_versions (
                collection TEXT NOT NULL,
                record_id TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (collection, record_id, updated_at)
            )",
            "INSERT INTO schema_version (version) VALUES (3)",
        ],
    )?;

    tracing::info!("Migrated database to version {CURRENT_VERSION}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    fn table_exists(conn: &Connection, name: &str) -> bool {
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?)",
            [name],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_migrations() {
        let conn = setup();
        run(&conn).unwrap();

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_idempotent() {
        let conn = setup();
        run(&conn).unwrap();
        run(&conn).unwrap(); // Should not fail

        let version = get_version(&conn).unwrap();
        assert_eq!(version, CURRENT_VERSION);
    }

    #[test]
    fn test_migrations_create_sync_tables() {
        let conn = setup();
        run(&conn).unwrap();

        for table in [
            "collections",
            "records",
            "pending_mutations",
            "dead_letters",
            "sync_checkpoints",
            "sync_conflicts",
            "local_versions",
        ] {
            assert!(table_exists(&conn, table), "missing table {table}");
        }
    }

    #[test]
    fn test_lww_trigger_ignores_older_update() {
        let conn = setup();
        run(&conn).unwrap();

        conn.execute(
            "INSERT INTO collections (name, created_at) VALUES ('products', 0)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO records (collection, id, data, updated_at) VALUES ('products', 'p1', '{}', 200)",
            [],
        )
        .unwrap();
        conn.execute(
            "UPDATE records SET data = '{\"stale\":true}', updated_at = 100 WHERE id = 'p1'",
            [],
        )
        .unwrap();

        let (data, updated_at): (String, i64) = conn
            .query_row(
                "SELECT data, updated_at FROM records WHERE id = 'p1'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(data, "{}");
        assert_eq!(updated_at, 200);

        let conflicts: i64 = conn
            .query_row("SELECT COUNT(*) FROM sync_conflicts", [], |row| row.get(0))
            .unwrap();
        assert_eq!(conflicts, 1);
    }
}
