//! Outbox queue: durable, ordered ledger of pending remote operations.
//!
//! Entries drain strictly by creation time. A successful drain deletes the
//! entry; a failed one stays queued with its try count and last error
//! updated (at-least-once delivery). Rows are never marked "done" in place.

use std::collections::HashSet;

use chrono::{Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{RemoteError, Result, SyncError};
use crate::ids::EntityId;
use crate::models::{
    sale_references, sale_references_mut, CreditPayment, EntityKind, EntityRecord, Sale,
};
use crate::side_effects;

/// Remote progress of a sale, checkpointed after every remote write so a
/// retried drain resumes where the last one stopped.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaleProgress {
    #[serde(default)]
    pub remote_sale_id: Option<i64>,
    #[serde(default)]
    pub items_inserted: bool,
    #[serde(default)]
    pub stock_steps_applied: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CreditPaymentProgress {
    #[serde(default)]
    pub remote_payment_id: Option<i64>,
    #[serde(default)]
    pub balance_applied: bool,
}

/// One intended remote effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Create {
        id: EntityId,
        record: EntityRecord,
    },
    /// Full record, last writer wins.
    Update {
        id: EntityId,
        record: EntityRecord,
    },
    /// Propagated as a tombstone update, never as a hard delete.
    Delete {
        kind: EntityKind,
        id: EntityId,
        deleted_at: String,
    },
    /// Sale row, its lines and the authoritative stock plan.
    Sale {
        id: EntityId,
        sale: Sale,
        #[serde(default)]
        progress: SaleProgress,
    },
    /// Payment row and the authoritative balance recomputation.
    CreditPayment {
        id: EntityId,
        payment: CreditPayment,
        #[serde(default)]
        progress: CreditPaymentProgress,
    },
}

impl Operation {
    /// Value of the `outbox.operation` column.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Sale { .. } => "sale",
            Operation::CreditPayment { .. } => "credit_payment",
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            Operation::Create { record, .. } | Operation::Update { record, .. } => record.kind(),
            Operation::Delete { kind, .. } => *kind,
            Operation::Sale { .. } => EntityKind::Sale,
            Operation::CreditPayment { .. } => EntityKind::CreditPayment,
        }
    }

    /// The entity this operation writes.
    pub fn target(&self) -> &EntityId {
        match self {
            Operation::Create { id, .. }
            | Operation::Update { id, .. }
            | Operation::Delete { id, .. }
            | Operation::Sale { id, .. }
            | Operation::CreditPayment { id, .. } => id,
        }
    }

    /// Ids that must already exist remotely before this operation can apply.
    /// A create's own target is not a dependency; an update's is.
    pub fn dependencies(&self) -> Vec<&EntityId> {
        match self {
            Operation::Create { record, .. } => record.references(),
            Operation::Update { id, record } => {
                let mut deps = vec![id];
                deps.extend(record.references());
                deps
            }
            Operation::Delete { id, .. } => vec![id],
            Operation::Sale { sale, .. } => sale_references(sale),
            Operation::CreditPayment { payment, .. } => vec![&payment.credit_id],
        }
    }

    /// Entities this operation writes remotely: its target plus the rows its
    /// side effects adjust (stock-plan products for a sale, the credit for a
    /// payment). Later entries touching any of them must wait for this one.
    pub fn touches(&self) -> Vec<(EntityKind, String)> {
        let mut keys = vec![(self.kind(), self.target().to_string())];
        match self {
            Operation::Sale { sale, .. } => {
                for step in side_effects::stock_plan(sale) {
                    let key = (EntityKind::Product, step.product_id.to_string());
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
            Operation::CreditPayment { payment, .. } => {
                keys.push((EntityKind::Credit, payment.credit_id.to_string()));
            }
            _ => {}
        }
        keys
    }

    /// Every id the payload carries, target included.
    fn ids_mut(&mut self) -> Vec<&mut EntityId> {
        match self {
            Operation::Create { id, record } | Operation::Update { id, record } => {
                let mut ids = vec![id];
                ids.extend(record.references_mut());
                ids
            }
            Operation::Delete { id, .. } => vec![id],
            Operation::Sale { id, sale, .. } => {
                let mut ids = vec![id];
                ids.extend(sale_references_mut(sale));
                ids
            }
            Operation::CreditPayment { id, payment, .. } => vec![id, &mut payment.credit_id],
        }
    }

    /// Replace every occurrence of `temporary` with the server id.
    pub fn rewrite_id(&mut self, temporary: &str, authoritative: i64) -> bool {
        let mut changed = false;
        for id in self.ids_mut() {
            changed |= id.resolve_to(temporary, authoritative);
        }
        changed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    Pending,
    DeadLetter,
}

impl EntryStatus {
    fn as_str(self) -> &'static str {
        match self {
            EntryStatus::Pending => "pending",
            EntryStatus::DeadLetter => "dead_letter",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw {
            "dead_letter" => EntryStatus::DeadLetter,
            _ => EntryStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEntry {
    pub id: i64,
    pub organization_id: String,
    pub operation: Operation,
    pub status: EntryStatus,
    pub try_count: i64,
    pub rejection_count: i64,
    pub last_error: Option<String>,
    pub error_kind: Option<String>,
    pub next_retry_at: Option<String>,
    pub retry_delay_ms: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl OutboxEntry {
    /// Whether the entry's backoff has elapsed at `now` (a
    /// [`timestamp_now`] value).
    pub fn is_due(&self, now: &str) -> bool {
        self.next_retry_at.as_deref().map_or(true, |at| at <= now)
    }
}

/// Backoff and dead-letter thresholds applied when an entry fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay_ms: i64,
    pub max_delay_ms: i64,
    /// Rejections after which an entry is parked. Zero disables dead-lettering.
    pub max_rejections: i64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 5_000,
            max_delay_ms: 300_000,
            max_rejections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retrying { next_retry_at: String },
    DeadLettered,
}

const ENTRY_COLUMNS: &str = "id, organization_id, payload, status, try_count, rejection_count, \
                             last_error, error_kind, next_retry_at, retry_delay_ms, \
                             created_at, updated_at";

fn map_entry(row: &Row<'_>) -> rusqlite::Result<(OutboxEntryRaw, String)> {
    Ok((
        OutboxEntryRaw {
            id: row.get(0)?,
            organization_id: row.get(1)?,
            status: row.get(3)?,
            try_count: row.get(4)?,
            rejection_count: row.get(5)?,
            last_error: row.get(6)?,
            error_kind: row.get(7)?,
            next_retry_at: row.get(8)?,
            retry_delay_ms: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        },
        row.get(2)?,
    ))
}

struct OutboxEntryRaw {
    id: i64,
    organization_id: String,
    status: String,
    try_count: i64,
    rejection_count: i64,
    last_error: Option<String>,
    error_kind: Option<String>,
    next_retry_at: Option<String>,
    retry_delay_ms: Option<i64>,
    created_at: String,
    updated_at: String,
}

impl OutboxEntryRaw {
    fn decode(self, payload: &str) -> Result<OutboxEntry> {
        Ok(OutboxEntry {
            id: self.id,
            organization_id: self.organization_id,
            operation: serde_json::from_str(payload)?,
            status: EntryStatus::parse(&self.status),
            try_count: self.try_count,
            rejection_count: self.rejection_count,
            last_error: self.last_error,
            error_kind: self.error_kind,
            next_retry_at: self.next_retry_at,
            retry_delay_ms: self.retry_delay_ms,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

/// Fixed-width UTC timestamp; lexical order equals chronological order.
pub(crate) fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn query_entries(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(args, map_entry)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raws.into_iter()
        .map(|(raw, payload)| raw.decode(&payload))
        .collect()
}

/// Append an entry. Returns the new entry id.
pub fn enqueue(conn: &Connection, organization_id: &str, operation: &Operation) -> Result<i64> {
    let ts = timestamp_now();
    conn.execute(
        "INSERT INTO outbox (
             organization_id, operation, entity, entity_ref, payload, status,
             try_count, created_at, updated_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, ?6)",
        params![
            organization_id,
            operation.label(),
            operation.kind().as_str(),
            operation.target().to_string(),
            serde_json::to_string(operation)?,
            ts
        ],
    )?;
    let id = conn.last_insert_rowid();
    debug!(
        entry_id = id,
        operation = operation.label(),
        entity = %operation.kind(),
        target = %operation.target(),
        "Outbox entry enqueued"
    );
    Ok(id)
}

pub fn get(conn: &Connection, id: i64) -> Result<Option<OutboxEntry>> {
    let raw = conn
        .query_row(
            &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE id = ?1"),
            params![id],
            map_entry,
        )
        .optional()?;
    raw.map(|(raw, payload)| raw.decode(&payload)).transpose()
}

/// Pending entries in drain order. With `due_only`, entries still backing
/// off are left out.
pub fn list_pending(
    conn: &Connection,
    organization_id: &str,
    due_only: bool,
) -> Result<Vec<OutboxEntry>> {
    let now = timestamp_now();
    query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE organization_id = ?1
               AND status = 'pending'
               AND (?2 = 0 OR next_retry_at IS NULL OR next_retry_at <= ?3)
             ORDER BY created_at ASC, id ASC"
        ),
        params![organization_id, due_only, now],
    )
}

pub fn list_dead_letters(conn: &Connection, organization_id: &str) -> Result<Vec<OutboxEntry>> {
    query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE organization_id = ?1 AND status = 'dead_letter'
             ORDER BY created_at ASC, id ASC"
        ),
        params![organization_id],
    )
}

/// Persist a new payload for an entry still in the queue (progress
/// checkpoints of compound operations).
pub fn update_payload(conn: &Connection, id: i64, operation: &Operation) -> Result<()> {
    conn.execute(
        "UPDATE outbox SET payload = ?1, entity_ref = ?2, updated_at = ?3 WHERE id = ?4",
        params![
            serde_json::to_string(operation)?,
            operation.target().to_string(),
            timestamp_now(),
            id
        ],
    )?;
    Ok(())
}

pub fn delete(conn: &Connection, id: i64) -> Result<()> {
    conn.execute("DELETE FROM outbox WHERE id = ?1", params![id])?;
    Ok(())
}

fn deterministic_jitter_ms(seed: i64) -> i64 {
    (seed.unsigned_abs() % 700) as i64 + 50
}

fn schedule_next_retry(delay_ms: i64, seed: i64) -> String {
    let at = Utc::now() + ChronoDuration::milliseconds(delay_ms + deterministic_jitter_ms(seed));
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Record a failed remote apply. The entry stays queued; only repeated
/// rejections past the policy threshold park it as a dead letter.
pub fn record_failure(
    conn: &Connection,
    entry: &OutboxEntry,
    error: &RemoteError,
    policy: &RetryPolicy,
) -> Result<FailureOutcome> {
    let try_count = entry.try_count + 1;
    let rejection_count = entry.rejection_count + i64::from(!error.is_transient());
    let dead = policy.max_rejections > 0 && rejection_count >= policy.max_rejections;

    let delay_ms = match entry.retry_delay_ms {
        Some(prev) => (prev.max(policy.base_delay_ms) * 2).min(policy.max_delay_ms),
        None => policy.base_delay_ms.min(policy.max_delay_ms),
    };
    let (status, next_retry_at) = if dead {
        (EntryStatus::DeadLetter, None)
    } else {
        (EntryStatus::Pending, Some(schedule_next_retry(delay_ms, entry.id)))
    };

    conn.execute(
        "UPDATE outbox
         SET status = ?1,
             try_count = ?2,
             rejection_count = ?3,
             last_error = ?4,
             error_kind = ?5,
             next_retry_at = ?6,
             retry_delay_ms = ?7,
             updated_at = ?8
         WHERE id = ?9",
        params![
            status.as_str(),
            try_count,
            rejection_count,
            error.to_string(),
            error.kind_label(),
            next_retry_at,
            delay_ms,
            timestamp_now(),
            entry.id
        ],
    )?;

    if dead {
        warn!(
            entry_id = entry.id,
            rejection_count,
            error = %error,
            "Outbox entry moved to dead letters"
        );
        Ok(FailureOutcome::DeadLettered)
    } else {
        Ok(FailureOutcome::Retrying {
            next_retry_at: next_retry_at.unwrap_or_default(),
        })
    }
}

/// Leave an entry queued without counting an attempt: it is waiting on an
/// earlier entry, not failing on its own.
pub fn record_deferred(conn: &Connection, id: i64, reason: &str) -> Result<()> {
    conn.execute(
        "UPDATE outbox SET last_error = ?1, error_kind = 'deferred', updated_at = ?2 WHERE id = ?3",
        params![reason, timestamp_now(), id],
    )?;
    Ok(())
}

/// Cascade a confirmed server id into every other queued entry that still
/// carries the temporary id. Returns how many entries were rewritten.
pub fn rewrite_references(
    conn: &Connection,
    organization_id: &str,
    temporary: &str,
    authoritative: i64,
) -> Result<usize> {
    // Temporary ids are serialized as JSON strings, so a substring match on the
    // quoted id narrows the scan without false negatives.
    let needle = format!("%\"{temporary}\"%");
    let candidates = query_entries(
        conn,
        &format!(
            "SELECT {ENTRY_COLUMNS} FROM outbox
             WHERE organization_id = ?1 AND payload LIKE ?2
             ORDER BY created_at ASC, id ASC"
        ),
        params![organization_id, needle],
    )?;

    let mut rewritten = 0;
    for mut entry in candidates {
        if entry.operation.rewrite_id(temporary, authoritative) {
            update_payload(conn, entry.id, &entry.operation)?;
            rewritten += 1;
        }
    }
    if rewritten > 0 {
        info!(
            temporary,
            authoritative, rewritten, "Cascaded server id into queued entries"
        );
    }
    Ok(rewritten)
}

/// Whether any queued entry other than `excluding` still writes the entity.
pub fn has_pending_for(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    target: &EntityId,
    excluding: i64,
) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM outbox
         WHERE organization_id = ?1 AND entity = ?2 AND entity_ref = ?3 AND id != ?4",
        params![organization_id, kind.as_str(), target.to_string(), excluding],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Every id mentioned by any queued entry of the organization, targets
/// included.
pub fn referenced_ids(conn: &Connection, organization_id: &str) -> Result<HashSet<EntityId>> {
    let entries = query_entries(
        conn,
        &format!("SELECT {ENTRY_COLUMNS} FROM outbox WHERE organization_id = ?1"),
        params![organization_id],
    )?;
    let mut ids = HashSet::new();
    for mut entry in entries {
        ids.extend(entry.operation.ids_mut().into_iter().map(|id| id.clone()));
    }
    Ok(ids)
}

pub fn pending_count(conn: &Connection, organization_id: &str) -> Result<i64> {
    count_with_status(conn, organization_id, EntryStatus::Pending)
}

pub fn dead_letter_count(conn: &Connection, organization_id: &str) -> Result<i64> {
    count_with_status(conn, organization_id, EntryStatus::DeadLetter)
}

fn count_with_status(conn: &Connection, organization_id: &str, status: EntryStatus) -> Result<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM outbox WHERE organization_id = ?1 AND status = ?2",
        params![organization_id, status.as_str()],
        |row| row.get(0),
    )?)
}

/// Make every pending entry due now. Called on reconnect so a connectivity
/// transition retries the whole queue immediately.
pub fn clear_backoff(conn: &Connection, organization_id: &str) -> Result<usize> {
    Ok(conn.execute(
        "UPDATE outbox SET next_retry_at = NULL
         WHERE organization_id = ?1 AND status = 'pending' AND next_retry_at IS NOT NULL",
        params![organization_id],
    )?)
}

/// Put dead-lettered entries back in line, e.g. after a server-side fix.
pub fn requeue_dead_letters(conn: &Connection, organization_id: &str) -> Result<usize> {
    let requeued = conn.execute(
        "UPDATE outbox
         SET status = 'pending',
             rejection_count = 0,
             next_retry_at = NULL,
             retry_delay_ms = NULL,
             updated_at = ?2
         WHERE organization_id = ?1 AND status = 'dead_letter'",
        params![organization_id, timestamp_now()],
    )?;
    if requeued > 0 {
        info!(requeued, "Requeued dead-lettered outbox entries");
    }
    Ok(requeued)
}

/// Fail loudly when asked to operate on an entry that no longer exists.
pub fn require(conn: &Connection, id: i64) -> Result<OutboxEntry> {
    get(conn, id)?.ok_or_else(|| SyncError::NotFound(format!("outbox entry {id}")))
}
