//! Diagnostics for the sync engine.
//!
//! Provides:
//! - **About info**: version, build timestamp, git SHA, platform
//! - **Sync health**: outbox backlog by entity and status, recent errors,
//!   unsynced mirror rows, schema version
//! - **Log rotation helpers**: used by `lib.rs` to configure rolling log files.

use rusqlite::{params, Connection};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::db::DbState;
use crate::error::Result;
use crate::mirror;

/// Maximum number of log files to retain.
pub const MAX_LOG_FILES: usize = 10;

/// File name prefix of the rolling log.
pub const LOG_FILE_PREFIX: &str = "sync";

/// Number of recent outbox errors included in the health report.
const RECENT_ERROR_LIMIT: i64 = 20;

// ---------------------------------------------------------------------------
// About info
// ---------------------------------------------------------------------------

pub fn get_about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

// ---------------------------------------------------------------------------
// Sync health
// ---------------------------------------------------------------------------

/// Snapshot of the local sync state for a support screen or bug report.
pub fn get_sync_health(db: &DbState, organization_id: &str) -> Result<Value> {
    let conn = db.conn.lock()?;

    let schema_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )?;
    let backlog = get_outbox_backlog(&conn, organization_id)?;
    let recent_errors = get_recent_errors(&conn, organization_id)?;
    let unsynced_rows = mirror::list_unsynced(&conn, organization_id)?.len();
    let db_size = fs::metadata(&db.db_path).map(|m| m.len()).unwrap_or(0);

    Ok(json!({
        "schemaVersion": schema_version,
        "outboxBacklog": backlog,
        "recentErrors": recent_errors,
        "unsyncedMirrorRows": unsynced_rows,
        "dbSizeBytes": db_size,
    }))
}

fn get_outbox_backlog(conn: &Connection, organization_id: &str) -> Result<Value> {
    let mut stmt = conn.prepare(
        "SELECT entity, status, COUNT(*) FROM outbox
         WHERE organization_id = ?1
         GROUP BY entity, status",
    )?;
    let rows = stmt
        .query_map(params![organization_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut backlog = json!({});
    for (entity, status, count) in rows {
        backlog[entity][status] = json!(count);
    }
    Ok(backlog)
}

fn get_recent_errors(conn: &Connection, organization_id: &str) -> Result<Vec<Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, operation, entity, entity_ref, try_count, error_kind, last_error, updated_at
         FROM outbox
         WHERE organization_id = ?1 AND last_error IS NOT NULL
         ORDER BY updated_at DESC
         LIMIT ?2",
    )?;
    let errors = stmt
        .query_map(params![organization_id, RECENT_ERROR_LIMIT], |row| {
            Ok(json!({
                "entryId": row.get::<_, i64>(0)?,
                "operation": row.get::<_, String>(1)?,
                "entity": row.get::<_, String>(2)?,
                "entityRef": row.get::<_, String>(3)?,
                "tryCount": row.get::<_, i64>(4)?,
                "errorKind": row.get::<_, Option<String>>(5)?,
                "error": row.get::<_, Option<String>>(6)?,
                "updatedAt": row.get::<_, String>(7)?,
            }))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(errors)
}

// ---------------------------------------------------------------------------
// Log rotation
// ---------------------------------------------------------------------------

/// Prune old log files in `log_dir`, keeping only the most recent
/// `MAX_LOG_FILES`. Returns how many were removed.
pub fn prune_old_logs(log_dir: &Path) -> usize {
    if !log_dir.exists() {
        return 0;
    }

    let mut log_files: Vec<(PathBuf, std::time::SystemTime)> = Vec::new();
    if let Ok(entries) = fs::read_dir(log_dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let is_log = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|name| name.starts_with(&format!("{LOG_FILE_PREFIX}.")));
            if is_log {
                let modified = entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::UNIX_EPOCH);
                log_files.push((path, modified));
            }
        }
    }

    // Newest first
    log_files.sort_by(|a, b| b.1.cmp(&a.1));

    let mut removed = 0;
    for (path, _) in log_files.iter().skip(MAX_LOG_FILES) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}
