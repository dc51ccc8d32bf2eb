//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode. Holds both the mirror tables and the outbox
//! in one file so a mutation can write its optimistic row and its outbox
//! entry in a single transaction.

use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// Shared handle to the local database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

const DB_FILE_NAME: &str = "pos-sync.db";

/// Initialize the database at `{data_dir}/pos-sync.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. On open failure the file is deleted and
/// the open retried once, unless it still holds unsynced outbox entries.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)
        .map_err(|e| SyncError::Config(format!("failed to create data dir: {e}")))?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            if has_readable_outbox(&db_path) {
                error!(error = %first_err, "Database open failed with pending outbox rows; refusing to reset");
                return Err(first_err);
            }
            warn!(
                "Database open failed ({}), deleting and retrying once",
                first_err
            );
            if db_path.exists() {
                let _ = fs::remove_file(&db_path);
                let _ = fs::remove_file(db_path.with_extension("db-wal"));
                let _ = fs::remove_file(db_path.with_extension("db-shm"));
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

/// Whether the file can still be read and has outbox rows worth keeping.
fn has_readable_outbox(path: &Path) -> bool {
    let Ok(conn) = Connection::open(path) else {
        return false;
    };
    conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get::<_, i64>(0))
        .optional()
        .ok()
        .flatten()
        .unwrap_or(0)
        > 0
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings, mirror rows and the outbox.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            updated_at TEXT DEFAULT (datetime('now')),
            PRIMARY KEY (setting_category, setting_key)
        );

        -- mirror_rows: local replicas of remote rows, one table for all kinds
        CREATE TABLE IF NOT EXISTS mirror_rows (
            row_id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            temp_id TEXT,
            remote_id INTEGER,
            data TEXT NOT NULL,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            deleted_at TEXT,
            UNIQUE (organization_id, entity, temp_id),
            UNIQUE (organization_id, entity, remote_id)
        );

        -- outbox (rows are deleted on success, never marked done)
        CREATE TABLE IF NOT EXISTS outbox (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            organization_id TEXT NOT NULL,
            operation TEXT NOT NULL,
            entity TEXT NOT NULL,
            entity_ref TEXT NOT NULL,
            payload TEXT NOT NULL,
            try_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_mirror_org_synced ON mirror_rows(organization_id, synced);
        CREATE INDEX IF NOT EXISTS idx_mirror_org_entity ON mirror_rows(organization_id, entity);
        CREATE INDEX IF NOT EXISTS idx_outbox_created ON outbox(organization_id, created_at, id);
        CREATE INDEX IF NOT EXISTS idx_outbox_entity_ref ON outbox(organization_id, entity_ref);

        INSERT INTO schema_version (version) VALUES (1);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::LocalStorage(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: retry scheduling and dead letters.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        BEGIN;

        ALTER TABLE outbox ADD COLUMN status TEXT NOT NULL DEFAULT 'pending';
        ALTER TABLE outbox ADD COLUMN error_kind TEXT;
        ALTER TABLE outbox ADD COLUMN rejection_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE outbox ADD COLUMN next_retry_at TEXT;
        ALTER TABLE outbox ADD COLUMN retry_delay_ms INTEGER;

        CREATE INDEX IF NOT EXISTS idx_outbox_status ON outbox(organization_id, status);

        INSERT INTO schema_version (version) VALUES (2);

        COMMIT;
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::LocalStorage(e)
    })?;

    info!("Applied migration v2");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT setting_value FROM local_settings
             WHERE setting_category = ?1 AND setting_key = ?2",
            params![category, key],
            |row| row.get(0),
        )
        .optional()?)
}

pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

/// In-memory database with the full schema, for tests.
#[cfg(test)]
pub fn open_in_memory_for_test() -> DbState {
    let conn = Connection::open_in_memory().expect("open in-memory db");
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )
    .expect("pragma setup");
    run_migrations(&conn).expect("migrations");
    DbState {
        conn: Mutex::new(conn),
        db_path: PathBuf::from(":memory:"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_creates_schema_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        {
            let db = init(dir.path()).unwrap();
            let conn = db.conn.lock().unwrap();
            let version: i32 = conn
                .query_row("SELECT MAX(version) FROM schema_version", [], |r| r.get(0))
                .unwrap();
            assert_eq!(version, CURRENT_SCHEMA_VERSION);
        }
        // Reopening must not re-run migrations.
        let db = init(dir.path()).unwrap();
        let conn = db.conn.lock().unwrap();
        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    #[test]
    fn settings_upsert() {
        let db = open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        assert_eq!(get_setting(&conn, "sync", "remote_url").unwrap(), None);
        set_setting(&conn, "sync", "remote_url", "https://a.example").unwrap();
        set_setting(&conn, "sync", "remote_url", "https://b.example").unwrap();
        assert_eq!(
            get_setting(&conn, "sync", "remote_url").unwrap().as_deref(),
            Some("https://b.example")
        );
    }
}
