//! Local mirror store.
//!
//! One `mirror_rows` table holds local replicas of every remote entity kind,
//! partitioned by organization. A row is addressable by its temporary id, its
//! server id, or both once the create has been confirmed. Reads always include
//! rows that have not been synced yet.
//!
//! All functions take a `&Connection` so callers can run them inside an open
//! transaction.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::ids::EntityId;
use crate::models::{EntityKind, EntityRecord};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorRow {
    pub organization_id: String,
    pub kind: EntityKind,
    /// Server id when known, otherwise the temporary id.
    pub id: EntityId,
    pub temp_id: Option<String>,
    pub remote_id: Option<i64>,
    pub record: EntityRecord,
    pub synced: bool,
    pub created_at: String,
    pub updated_at: String,
    pub deleted_at: Option<String>,
}

const ROW_COLUMNS: &str = "organization_id, entity, temp_id, remote_id, data, synced, \
                           created_at, updated_at, deleted_at";

fn map_row(row: &Row<'_>) -> rusqlite::Result<(MirrorRowRaw, String)> {
    Ok((
        MirrorRowRaw {
            organization_id: row.get(0)?,
            entity: row.get(1)?,
            temp_id: row.get(2)?,
            remote_id: row.get(3)?,
            synced: row.get::<_, i64>(5)? != 0,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
            deleted_at: row.get(8)?,
        },
        row.get(4)?,
    ))
}

struct MirrorRowRaw {
    organization_id: String,
    entity: String,
    temp_id: Option<String>,
    remote_id: Option<i64>,
    synced: bool,
    created_at: String,
    updated_at: String,
    deleted_at: Option<String>,
}

impl MirrorRowRaw {
    fn decode(self, data: &str) -> Result<MirrorRow> {
        let kind: EntityKind = self.entity.parse()?;
        let record: EntityRecord = serde_json::from_str(data)?;
        let id = match (self.remote_id, &self.temp_id) {
            (Some(remote), _) => EntityId::Authoritative(remote),
            (None, Some(temp)) => EntityId::Temporary(temp.clone()),
            (None, None) => {
                return Err(SyncError::Invalid(format!(
                    "mirror row for {kind} has neither temporary nor server id"
                )))
            }
        };
        Ok(MirrorRow {
            organization_id: self.organization_id,
            kind,
            id,
            temp_id: self.temp_id,
            remote_id: self.remote_id,
            record,
            synced: self.synced,
            created_at: self.created_at,
            updated_at: self.updated_at,
            deleted_at: self.deleted_at,
        })
    }
}

/// Column and bound value that address a row by the given id.
fn key_column(id: &EntityId) -> (&'static str, SqlValue) {
    match id {
        EntityId::Temporary(t) => ("temp_id", SqlValue::Text(t.clone())),
        EntityId::Authoritative(n) => ("remote_id", SqlValue::Integer(*n)),
    }
}

fn now() -> String {
    crate::outbox::timestamp_now()
}

/// Fetch one row, deleted or not.
pub fn get(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
) -> Result<Option<MirrorRow>> {
    let (column, key) = key_column(id);
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM mirror_rows
         WHERE organization_id = ?1 AND entity = ?2 AND {column} = ?3"
    );
    let raw = conn
        .query_row(&sql, params![organization_id, kind.as_str(), key], map_row)
        .optional()?;
    raw.map(|(raw, data)| raw.decode(&data)).transpose()
}

/// Like [`get`], but a missing row is an error.
pub fn require(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
) -> Result<MirrorRow> {
    get(conn, organization_id, kind, id)?
        .ok_or_else(|| SyncError::NotFound(format!("{kind} {id}")))
}

/// Insert or replace the record stored under `id`.
///
/// New rows keyed by a temporary id start unsynced; rows keyed by a server id
/// take the given `synced` flag.
pub fn upsert(
    conn: &Connection,
    organization_id: &str,
    id: &EntityId,
    record: &EntityRecord,
    synced: bool,
) -> Result<()> {
    let kind = record.kind();
    let data = serde_json::to_string(record)?;
    let ts = now();
    let (column, key) = key_column(id);

    let updated = conn.execute(
        &format!(
            "UPDATE mirror_rows SET data = ?1, synced = ?2, updated_at = ?3
             WHERE organization_id = ?4 AND entity = ?5 AND {column} = ?6"
        ),
        params![data, synced, ts, organization_id, kind.as_str(), key],
    )?;
    if updated > 0 {
        return Ok(());
    }

    let (temp_id, remote_id) = match id {
        EntityId::Temporary(t) => (Some(t.as_str()), None),
        EntityId::Authoritative(n) => (None, Some(*n)),
    };
    conn.execute(
        "INSERT INTO mirror_rows (
             organization_id, entity, temp_id, remote_id, data, synced, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        params![
            organization_id,
            kind.as_str(),
            temp_id,
            remote_id,
            data,
            synced && remote_id.is_some(),
            ts
        ],
    )?;
    debug!(%kind, %id, "Mirror row inserted");
    Ok(())
}

/// Apply `change` to the stored record, keeping the synced flag as is.
/// Used for optimistic side effects that ride on another entity's outbox entry.
pub fn modify<F>(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
    change: F,
) -> Result<MirrorRow>
where
    F: FnOnce(&mut EntityRecord) -> Result<()>,
{
    let mut row = require(conn, organization_id, kind, id)?;
    change(&mut row.record)?;
    let (column, key) = key_column(id);
    row.updated_at = now();
    conn.execute(
        &format!(
            "UPDATE mirror_rows SET data = ?1, updated_at = ?2
             WHERE organization_id = ?3 AND entity = ?4 AND {column} = ?5"
        ),
        params![
            serde_json::to_string(&row.record)?,
            row.updated_at,
            organization_id,
            kind.as_str(),
            key
        ],
    )?;
    Ok(row)
}

/// List an organization's rows of one kind, oldest first.
pub fn list(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    exclude_deleted: bool,
) -> Result<Vec<MirrorRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM mirror_rows
         WHERE organization_id = ?1 AND entity = ?2
           AND (?3 = 0 OR deleted_at IS NULL)
         ORDER BY created_at ASC, row_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params![organization_id, kind.as_str(), exclude_deleted], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter()
        .map(|(raw, data)| raw.decode(&data))
        .collect()
}

/// Rows of any kind still waiting for their outbox entry to drain.
pub fn list_unsynced(conn: &Connection, organization_id: &str) -> Result<Vec<MirrorRow>> {
    let sql = format!(
        "SELECT {ROW_COLUMNS} FROM mirror_rows
         WHERE organization_id = ?1 AND synced = 0
         ORDER BY created_at ASC, row_id ASC"
    );
    let mut stmt = conn.prepare(&sql)?;
    let raws = stmt
        .query_map(params![organization_id], map_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter()
        .map(|(raw, data)| raw.decode(&data))
        .collect()
}

/// Server id assigned to a temporary id, if its create has been confirmed.
pub fn resolve_temporary(
    conn: &Connection,
    organization_id: &str,
    temp_id: &str,
) -> Result<Option<i64>> {
    Ok(conn
        .query_row(
            "SELECT remote_id FROM mirror_rows
             WHERE organization_id = ?1 AND temp_id = ?2 AND remote_id IS NOT NULL
             LIMIT 1",
            params![organization_id, temp_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Record a confirmed remote write in one statement: server id, synced flag
/// and optionally the record as the server now holds it.
pub fn mark_synced(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
    remote_id: i64,
    record: Option<&EntityRecord>,
    synced: bool,
) -> Result<()> {
    let data = record.map(serde_json::to_string).transpose()?;
    let (column, key) = key_column(id);
    let updated = conn.execute(
        &format!(
            "UPDATE mirror_rows
             SET remote_id = ?1, synced = ?2, data = COALESCE(?3, data), updated_at = ?4
             WHERE organization_id = ?5 AND entity = ?6 AND {column} = ?7"
        ),
        params![remote_id, synced, data, now(), organization_id, kind.as_str(), key],
    )?;
    if updated == 0 {
        debug!(%kind, %id, remote_id, "No mirror row to mark synced");
    }
    Ok(())
}

/// Set the tombstone. The row stays readable with `exclude_deleted = false`.
pub fn soft_delete(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
) -> Result<String> {
    let (column, key) = key_column(id);
    let ts = now();
    let updated = conn.execute(
        &format!(
            "UPDATE mirror_rows SET deleted_at = ?1, synced = 0, updated_at = ?1
             WHERE organization_id = ?2 AND entity = ?3 AND {column} = ?4
               AND deleted_at IS NULL"
        ),
        params![ts, organization_id, kind.as_str(), key],
    )?;
    if updated == 0 {
        return Err(SyncError::NotFound(format!("{kind} {id}")));
    }
    Ok(ts)
}

/// Rewrite a confirmed temporary id inside other mirrored records (a credit's
/// client, a product's linked materials). Returns how many rows changed.
pub fn rewrite_references(
    conn: &Connection,
    organization_id: &str,
    temporary: &str,
    authoritative: i64,
) -> Result<usize> {
    let needle = format!("%\"{temporary}\"%");
    let sql = format!(
        "SELECT row_id, {ROW_COLUMNS} FROM mirror_rows
         WHERE organization_id = ?1 AND data LIKE ?2"
    );
    let mut stmt = conn.prepare(&sql)?;
    let candidates = stmt
        .query_map(params![organization_id, needle], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(5)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut rewritten = 0;
    for (row_id, data) in candidates {
        let mut record: EntityRecord = serde_json::from_str(&data)?;
        let mut changed = false;
        for id in record.references_mut() {
            changed |= id.resolve_to(temporary, authoritative);
        }
        if changed {
            conn.execute(
                "UPDATE mirror_rows SET data = ?1 WHERE row_id = ?2",
                params![serde_json::to_string(&record)?, row_id],
            )?;
            rewritten += 1;
        }
    }
    Ok(rewritten)
}

/// Store a row pulled from the remote store as synced.
pub fn upsert_remote(
    conn: &Connection,
    organization_id: &str,
    remote_id: i64,
    record: &EntityRecord,
    deleted_at: Option<&str>,
) -> Result<()> {
    let ts = now();
    conn.execute(
        "INSERT INTO mirror_rows (
             organization_id, entity, remote_id, data, synced, created_at, updated_at, deleted_at
         ) VALUES (?1, ?2, ?3, ?4, 1, ?5, ?5, ?6)
         ON CONFLICT(organization_id, entity, remote_id) DO UPDATE SET
             data = excluded.data,
             synced = 1,
             updated_at = excluded.updated_at,
             deleted_at = excluded.deleted_at",
        params![
            organization_id,
            record.kind().as_str(),
            remote_id,
            serde_json::to_string(record)?,
            ts,
            deleted_at
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use crate::models::Product;
    use crate::testing;

    fn client(name: &str) -> EntityRecord {
        EntityRecord::Client(testing::client(name))
    }

    #[test]
    fn unsynced_rows_are_visible_immediately() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        let id = EntityId::new_temporary();
        upsert(&conn, "org-1", &id, &client("Ana"), false).unwrap();

        let rows = list(&conn, "org-1", EntityKind::Client, true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert!(!rows[0].synced);
        assert_eq!(list_unsynced(&conn, "org-1").unwrap().len(), 1);
    }

    #[test]
    fn organizations_are_partitioned() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        upsert(&conn, "org-1", &EntityId::new_temporary(), &client("Ana"), false).unwrap();
        upsert(&conn, "org-2", &EntityId::new_temporary(), &client("Bo"), false).unwrap();

        let rows = list(&conn, "org-2", EntityKind::Client, true).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].organization_id, "org-2");
    }

    #[test]
    fn mark_synced_keeps_row_addressable_by_both_ids() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        let temp = EntityId::new_temporary();
        upsert(&conn, "org-1", &temp, &client("Ana"), false).unwrap();

        mark_synced(&conn, "org-1", EntityKind::Client, &temp, 77, None, true).unwrap();

        let by_temp = require(&conn, "org-1", EntityKind::Client, &temp).unwrap();
        let by_remote =
            require(&conn, "org-1", EntityKind::Client, &EntityId::Authoritative(77)).unwrap();
        assert_eq!(by_temp, by_remote);
        assert!(by_remote.synced);
        assert_eq!(by_remote.id, EntityId::Authoritative(77));
        assert_eq!(
            resolve_temporary(&conn, "org-1", temp.as_temporary().unwrap()).unwrap(),
            Some(77)
        );
    }

    #[test]
    fn soft_delete_hides_row_from_default_listing() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        let id = EntityId::Authoritative(5);
        upsert(&conn, "org-1", &id, &client("Ana"), true).unwrap();

        soft_delete(&conn, "org-1", EntityKind::Client, &id).unwrap();

        assert!(list(&conn, "org-1", EntityKind::Client, true).unwrap().is_empty());
        let all = list(&conn, "org-1", EntityKind::Client, false).unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].deleted_at.is_some());
        assert!(!all[0].synced);
        assert!(matches!(
            soft_delete(&conn, "org-1", EntityKind::Client, &id),
            Err(SyncError::NotFound(_))
        ));
    }

    #[test]
    fn modify_preserves_synced_flag() {
        let db = db::open_in_memory_for_test();
        let conn = db.conn.lock().unwrap();
        let id = EntityId::Authoritative(9);
        let product = EntityRecord::Product(Product {
            name: "Flour".into(),
            sku: None,
            price: 1.0,
            cost: None,
            stock: 4.0,
            track_stock: true,
            linked_products: Vec::new(),
        });
        upsert(&conn, "org-1", &id, &product, true).unwrap();

        let row = modify(&conn, "org-1", EntityKind::Product, &id, |record| {
            if let EntityRecord::Product(p) = record {
                p.stock -= 1.0;
            }
            Ok(())
        })
        .unwrap();

        assert!(row.synced);
        let stored = require(&conn, "org-1", EntityKind::Product, &id).unwrap();
        assert!(matches!(stored.record, EntityRecord::Product(ref p) if p.stock == 3.0));
    }
}
