//! Sync engine: the single consumer of the outbox.
//!
//! A drain walks pending entries in creation order. Each entry has its
//! temporary references resolved through the mirror, is dispatched to its
//! remote handler, and on success is reconciled into the mirror, cascaded
//! into dependent entries and deleted in one local transaction. Failures are
//! recorded on the entry and the pass moves on.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{RemoteError, Result, SyncError};
use crate::ids::EntityId;
use crate::mirror;
use crate::models::{
    CreditPayment, EntityKind, EntityRecord, Sale, SaleItem, SALE_ITEMS_TABLE,
};
use crate::outbox::{
    self, CreditPaymentProgress, FailureOutcome, Operation, OutboxEntry, RetryPolicy,
    SaleProgress,
};
use crate::remote::{row_id, Filter, RemoteRow, RemoteStore};
use crate::side_effects;

// ---------------------------------------------------------------------------
// Status and reports
// ---------------------------------------------------------------------------

/// Aggregate state exposed to the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub syncing: bool,
    pub pending: i64,
    pub dead_letters: i64,
    pub last_sync: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub applied: usize,
    pub failed: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    Completed(DrainReport),
    /// Connectivity is a precondition; nothing was attempted.
    Offline,
    /// Another drain holds the guard; this trigger was a no-op.
    AlreadyRunning,
}

/// What a remote handler confirmed.
struct Applied {
    remote_id: i64,
}

/// Clears the re-entrancy flag however the drain exits.
struct DrainGuard<'a> {
    engine: &'a SyncEngine,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.engine.connectivity.set_syncing(false);
        self.engine.draining.store(false, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    organization_id: String,
    policy: RetryPolicy,
    remote_timeout: Duration,
    connectivity: ConnectivityMonitor,
    draining: AtomicBool,
    last_sync: Mutex<Option<String>>,
    wake: Notify,
}

impl SyncEngine {
    pub fn new(
        db: Arc<DbState>,
        remote: Arc<dyn RemoteStore>,
        organization_id: impl Into<String>,
        policy: RetryPolicy,
        remote_timeout: Duration,
        connectivity: ConnectivityMonitor,
    ) -> Self {
        Self {
            db,
            remote,
            organization_id: organization_id.into(),
            policy,
            remote_timeout,
            connectivity,
            draining: AtomicBool::new(false),
            last_sync: Mutex::new(None),
            wake: Notify::new(),
        }
    }

    pub fn organization_id(&self) -> &str {
        &self.organization_id
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Ask the background loop for a drain (e.g. right after an enqueue).
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    pub fn sync_status(&self) -> Result<SyncStatus> {
        let (pending, dead_letters) = {
            let conn = self.db.conn.lock()?;
            (
                outbox::pending_count(&conn, &self.organization_id)?,
                outbox::dead_letter_count(&conn, &self.organization_id)?,
            )
        };
        Ok(SyncStatus {
            is_online: self.connectivity.is_online(),
            syncing: self.connectivity.is_syncing(),
            pending,
            dead_letters,
            last_sync: self.last_sync.lock()?.clone(),
        })
    }

    pub fn dead_letters(&self) -> Result<Vec<OutboxEntry>> {
        let conn = self.db.conn.lock()?;
        outbox::list_dead_letters(&conn, &self.organization_id)
    }

    /// Return dead-lettered entries to the queue and wake the loop.
    pub fn requeue_dead_letters(&self) -> Result<usize> {
        let requeued = {
            let conn = self.db.conn.lock()?;
            outbox::requeue_dead_letters(&conn, &self.organization_id)?
        };
        if requeued > 0 {
            self.request_drain();
        }
        Ok(requeued)
    }

    /// Make every pending entry due and drain. Used on app start and on each
    /// offline to online transition.
    pub async fn resume(&self) -> Result<DrainOutcome> {
        let cleared = {
            let conn = self.db.conn.lock()?;
            outbox::clear_backoff(&conn, &self.organization_id)?
        };
        if cleared > 0 {
            debug!(cleared, "Cleared outbox backoff");
        }
        self.drain().await
    }

    /// Run one drain pass over the pending entries. Entries still backing
    /// off are skipped and hold back later entries on the same entities.
    pub async fn drain(&self) -> Result<DrainOutcome> {
        if !self.connectivity.is_online() {
            debug!("Offline; drain skipped");
            return Ok(DrainOutcome::Offline);
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("Drain already running; trigger ignored");
            return Ok(DrainOutcome::AlreadyRunning);
        }
        let _guard = DrainGuard { engine: self };
        self.connectivity.set_syncing(true);

        let entries = {
            let conn = self.db.conn.lock()?;
            outbox::list_pending(&conn, &self.organization_id, false)?
        };
        let now = outbox::timestamp_now();
        let mut report = DrainReport::default();
        // Entities written by an entry that failed, was deferred or is still
        // backing off. Later entries touching any of them wait.
        let mut blocked: HashSet<(EntityKind, String)> = HashSet::new();

        for listed in entries {
            if !listed.is_due(&now) {
                blocked.extend(listed.operation.touches());
                continue;
            }
            if !self.connectivity.is_online() {
                info!("Connectivity lost mid-drain; remaining entries stay queued");
                break;
            }
            // Earlier entries in this pass may have rewritten this payload.
            let entry = {
                let conn = self.db.conn.lock()?;
                outbox::get(&conn, listed.id)?
            };
            let Some(mut entry) = entry else { continue };

            if let Some(temporary) = self.resolve_references(&mut entry)? {
                self.defer(&entry, &format!("waiting for {temporary} to sync"))?;
                blocked.extend(entry.operation.touches());
                report.deferred += 1;
                continue;
            }
            let touches = entry.operation.touches();
            if touches.iter().any(|key| blocked.contains(key)) {
                self.defer(&entry, "waiting for an earlier entry on the same entity")?;
                blocked.extend(touches);
                report.deferred += 1;
                continue;
            }

            match self.apply(&entry).await {
                Ok(applied) => {
                    self.confirm(&entry, applied)?;
                    report.applied += 1;
                }
                Err(SyncError::Remote(error)) => {
                    let outcome = {
                        let conn = self.db.conn.lock()?;
                        outbox::record_failure(&conn, &entry, &error, &self.policy)?
                    };
                    warn!(
                        entry_id = entry.id,
                        operation = entry.operation.label(),
                        entity = %entry.operation.kind(),
                        try_count = entry.try_count + 1,
                        error = %error,
                        "Outbox entry failed; left queued"
                    );
                    if outcome == FailureOutcome::DeadLettered {
                        report.dead_lettered += 1;
                    }
                    blocked.extend(touches);
                    report.failed += 1;
                }
                Err(SyncError::Unresolved(temporary)) => {
                    self.defer(&entry, &format!("waiting for {temporary} to sync"))?;
                    blocked.extend(touches);
                    report.deferred += 1;
                }
                Err(other) => return Err(other),
            }
        }

        *self.last_sync.lock()? = Some(outbox::timestamp_now());
        if report != DrainReport::default() {
            info!(
                applied = report.applied,
                failed = report.failed,
                deferred = report.deferred,
                dead_lettered = report.dead_lettered,
                "Drain complete"
            );
        }
        Ok(DrainOutcome::Completed(report))
    }

    /// Substitute server ids for temporary references whose creates have
    /// applied. Returns the first temporary id that is still unknown.
    fn resolve_references(&self, entry: &mut OutboxEntry) -> Result<Option<String>> {
        let temporaries: Vec<String> = entry
            .operation
            .dependencies()
            .into_iter()
            .filter_map(|id| id.as_temporary().map(str::to_string))
            .collect();
        if temporaries.is_empty() {
            return Ok(None);
        }

        let conn = self.db.conn.lock()?;
        let mut changed = false;
        for temporary in temporaries {
            match mirror::resolve_temporary(&conn, &self.organization_id, &temporary)? {
                Some(remote_id) => changed |= entry.operation.rewrite_id(&temporary, remote_id),
                None => return Ok(Some(temporary)),
            }
        }
        if changed {
            outbox::update_payload(&conn, entry.id, &entry.operation)?;
        }
        Ok(None)
    }

    fn defer(&self, entry: &OutboxEntry, reason: &str) -> Result<()> {
        debug!(entry_id = entry.id, reason, "Outbox entry deferred");
        let conn = self.db.conn.lock()?;
        outbox::record_deferred(&conn, entry.id, reason)
    }

    /// Reconcile a confirmed entry: cascade its server id, mark the mirror
    /// row and delete the entry, atomically.
    fn confirm(&self, entry: &OutboxEntry, applied: Applied) -> Result<()> {
        let org = self.organization_id.as_str();
        let kind = entry.operation.kind();
        let target = entry.operation.target();

        let mut conn = self.db.conn.lock()?;
        let tx = conn.transaction()?;
        if let Some(temporary) = target.as_temporary() {
            outbox::rewrite_references(&tx, org, temporary, applied.remote_id)?;
            mirror::rewrite_references(&tx, org, temporary, applied.remote_id)?;
        }
        let still_pending = outbox::has_pending_for(
            &tx,
            org,
            kind,
            &EntityId::Authoritative(applied.remote_id),
            entry.id,
        )?;
        mirror::mark_synced(&tx, org, kind, target, applied.remote_id, None, !still_pending)?;
        outbox::delete(&tx, entry.id)?;
        tx.commit()?;

        debug!(
            entry_id = entry.id,
            operation = entry.operation.label(),
            entity = %kind,
            remote_id = applied.remote_id,
            "Outbox entry applied"
        );
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Remote handlers
    // -----------------------------------------------------------------------

    async fn call<T, F>(&self, what: &str, fut: F) -> std::result::Result<T, RemoteError>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        match tokio::time::timeout(self.remote_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Transient(format!(
                "{what} timed out after {} ms",
                self.remote_timeout.as_millis()
            ))),
        }
    }

    fn checkpoint(&self, entry_id: i64, operation: &Operation) -> Result<()> {
        let conn = self.db.conn.lock()?;
        outbox::update_payload(&conn, entry_id, operation)
    }

    async fn apply(&self, entry: &OutboxEntry) -> Result<Applied> {
        match &entry.operation {
            Operation::Create { id, record } => {
                let local_ref = local_ref(id)?;
                let row = record.to_remote_row(&self.organization_id, Some(local_ref))?;
                let remote_id = self.insert_once(record.kind().table(), local_ref, row).await?;
                Ok(Applied { remote_id })
            }
            Operation::Update { id, record } => {
                let remote_id = id.remote()?;
                let row = record.to_remote_row(&self.organization_id, None)?;
                let table = record.kind().table();
                self.call(&format!("update {table}"), self.remote.update(table, remote_id, row))
                    .await?;
                Ok(Applied { remote_id })
            }
            Operation::Delete {
                kind,
                id,
                deleted_at,
            } => {
                let remote_id = id.remote()?;
                let mut tombstone = Map::new();
                tombstone.insert("deleted_at".into(), Value::String(deleted_at.clone()));
                let table = kind.table();
                self.call(
                    &format!("tombstone {table}"),
                    self.remote.update(table, remote_id, tombstone),
                )
                .await?;
                Ok(Applied { remote_id })
            }
            Operation::Sale { id, sale, progress } => {
                self.apply_sale(entry.id, id, sale, progress.clone()).await
            }
            Operation::CreditPayment {
                id,
                payment,
                progress,
            } => {
                self.apply_credit_payment(entry.id, id, payment, progress.clone())
                    .await
            }
        }
    }

    /// Insert unless a row with the same `local_ref` already exists, so a
    /// create retried after a lost response is not duplicated.
    async fn insert_once(&self, table: &str, local_ref: &str, row: RemoteRow) -> Result<i64> {
        let filter = Filter::new()
            .eq("organization_id", self.organization_id.as_str())
            .eq("local_ref", local_ref);
        let existing = self
            .call(&format!("lookup {table}"), self.remote.select(table, &filter))
            .await?;
        if let Some(found) = existing.first() {
            debug!(table, local_ref, "Remote row already present; skipping insert");
            return Ok(row_id(found)?);
        }
        let inserted = self
            .call(&format!("insert into {table}"), self.remote.insert(table, row))
            .await?;
        Ok(row_id(&inserted)?)
    }

    async fn remote_number(&self, table: &str, id: i64, column: &str) -> Result<f64> {
        let rows = self
            .call(
                &format!("read {table}"),
                self.remote.select(table, &Filter::new().eq("id", id)),
            )
            .await?;
        let value = rows
            .first()
            .ok_or_else(|| RemoteError::Rejected(format!("{table} {id} does not exist")))?
            .get(column)
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        Ok(value)
    }

    async fn apply_sale(
        &self,
        entry_id: i64,
        id: &EntityId,
        sale: &Sale,
        mut progress: SaleProgress,
    ) -> Result<Applied> {
        let local_ref = local_ref(id)?;
        let save = |progress: &SaleProgress| {
            self.checkpoint(
                entry_id,
                &Operation::Sale {
                    id: id.clone(),
                    sale: sale.clone(),
                    progress: progress.clone(),
                },
            )
        };

        let sale_id = match progress.remote_sale_id {
            Some(sale_id) => sale_id,
            None => {
                let row = EntityRecord::Sale(sale.clone())
                    .to_remote_row(&self.organization_id, Some(local_ref))?;
                let sale_id = self
                    .insert_once(EntityKind::Sale.table(), local_ref, row)
                    .await?;
                progress.remote_sale_id = Some(sale_id);
                save(&progress)?;
                sale_id
            }
        };

        if !progress.items_inserted {
            for (index, item) in sale.items.iter().enumerate() {
                let item_ref = format!("{local_ref}:{index}");
                let row = self.sale_item_row(sale_id, item, &item_ref)?;
                self.insert_once(SALE_ITEMS_TABLE, &item_ref, row).await?;
            }
            progress.items_inserted = true;
            save(&progress)?;
        }

        let plan = side_effects::stock_plan(sale);
        for (index, step) in plan.iter().enumerate().skip(progress.stock_steps_applied) {
            let product_id = step.product_id.remote()?;
            let table = EntityKind::Product.table();
            let current = self.remote_number(table, product_id, "stock").await?;
            let stock = side_effects::decrement_stock(current, step.amount);
            let mut patch = Map::new();
            patch.insert("stock".into(), Value::from(stock));
            self.call("update stock", self.remote.update(table, product_id, patch))
                .await?;
            debug!(product_id, from = current, to = stock, "Remote stock decremented");
            progress.stock_steps_applied = index + 1;
            save(&progress)?;
        }

        Ok(Applied { remote_id: sale_id })
    }

    fn sale_item_row(&self, sale_id: i64, item: &SaleItem, item_ref: &str) -> Result<RemoteRow> {
        let mut row = Map::new();
        row.insert("organization_id".into(), Value::from(self.organization_id.as_str()));
        row.insert("sale_id".into(), Value::from(sale_id));
        row.insert("product_id".into(), Value::from(item.product_id.remote()?));
        row.insert("quantity".into(), Value::from(item.quantity));
        row.insert("unit_price".into(), Value::from(item.unit_price));
        row.insert("subtotal".into(), Value::from(item.subtotal()));
        row.insert("tracks_stock".into(), Value::from(item.tracks_stock));
        row.insert("local_ref".into(), Value::from(item_ref));
        Ok(row)
    }

    async fn apply_credit_payment(
        &self,
        entry_id: i64,
        id: &EntityId,
        payment: &CreditPayment,
        mut progress: CreditPaymentProgress,
    ) -> Result<Applied> {
        let local_ref = local_ref(id)?;
        let save = |progress: &CreditPaymentProgress| {
            self.checkpoint(
                entry_id,
                &Operation::CreditPayment {
                    id: id.clone(),
                    payment: payment.clone(),
                    progress: progress.clone(),
                },
            )
        };

        let payment_id = match progress.remote_payment_id {
            Some(payment_id) => payment_id,
            None => {
                let row = EntityRecord::CreditPayment(payment.clone())
                    .to_remote_row(&self.organization_id, Some(local_ref))?;
                let payment_id = self
                    .insert_once(EntityKind::CreditPayment.table(), local_ref, row)
                    .await?;
                progress.remote_payment_id = Some(payment_id);
                save(&progress)?;
                payment_id
            }
        };

        if !progress.balance_applied {
            let credit_id = payment.credit_id.remote()?;
            let table = EntityKind::Credit.table();
            let balance = self.remote_number(table, credit_id, "balance").await?;
            let balance = side_effects::apply_credit_payment(balance, payment.amount);
            let mut patch = Map::new();
            patch.insert("balance".into(), Value::from(balance));
            patch.insert(
                "status".into(),
                serde_json::to_value(side_effects::credit_status(balance))?,
            );
            self.call("update credit balance", self.remote.update(table, credit_id, patch))
                .await?;
            progress.balance_applied = true;
            save(&progress)?;
        }

        Ok(Applied {
            remote_id: payment_id,
        })
    }

    // -----------------------------------------------------------------------
    // Pull
    // -----------------------------------------------------------------------

    /// Pull the organization's remote rows of one kind into the mirror.
    /// Rows with unsynced local state, or still referenced by a queued
    /// entry, keep their local version. Returns how many rows were stored.
    pub async fn refresh_mirror(&self, kind: EntityKind) -> Result<usize> {
        let org = self.organization_id.as_str();
        let filter = Filter::new().eq("organization_id", org);
        let rows = self
            .call(
                &format!("refresh {}", kind.table()),
                self.remote.select(kind.table(), &filter),
            )
            .await?;
        let sale_items = if kind == EntityKind::Sale {
            self.call("refresh sale items", self.remote.select(SALE_ITEMS_TABLE, &filter))
                .await?
        } else {
            Vec::new()
        };

        let conn = self.db.conn.lock()?;
        let referenced = outbox::referenced_ids(&conn, org)?;
        let mut stored = 0;
        for row in rows {
            let remote_id = row_id(&row)?;
            let id = EntityId::Authoritative(remote_id);
            let mut record = match EntityRecord::from_remote_row(kind, &row) {
                Ok(record) => record,
                Err(e) => {
                    warn!(%kind, remote_id, error = %e, "Skipping unreadable remote row");
                    continue;
                }
            };
            if let EntityRecord::Sale(sale) = &mut record {
                sale.items = items_for_sale(&sale_items, remote_id);
            }

            if let Some(existing) = mirror::get(&conn, org, kind, &id)? {
                if !existing.synced {
                    continue;
                }
            }
            if let Some(local_ref) = row.get("local_ref").and_then(Value::as_str) {
                let temporary = EntityId::Temporary(local_ref.to_string());
                if let Some(local) = mirror::get(&conn, org, kind, &temporary)? {
                    if local.remote_id.is_none() {
                        continue;
                    }
                }
            }
            if referenced.contains(&id) {
                continue;
            }

            let deleted_at = row.get("deleted_at").and_then(Value::as_str);
            mirror::upsert_remote(&conn, org, remote_id, &record, deleted_at)?;
            stored += 1;
        }
        info!(%kind, stored, "Mirror refreshed from remote store");
        Ok(stored)
    }
}

fn local_ref(id: &EntityId) -> Result<&str> {
    id.as_temporary()
        .ok_or_else(|| SyncError::Invalid(format!("create target {id} is not a temporary id")))
}

fn items_for_sale(rows: &[RemoteRow], sale_id: i64) -> Vec<SaleItem> {
    rows.iter()
        .filter(|row| row.get("sale_id").and_then(Value::as_i64) == Some(sale_id))
        .filter_map(|row| serde_json::from_value(Value::Object(row.clone())).ok())
        .collect()
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

async fn drain_logged(engine: &SyncEngine, trigger: &str, clear_backoff: bool) {
    let result = if clear_backoff {
        engine.resume().await
    } else {
        engine.drain().await
    };
    match result {
        Ok(DrainOutcome::Completed(report)) => {
            debug!(trigger, applied = report.applied, "Drain finished");
        }
        Ok(_) => {}
        Err(e) => warn!(trigger, error = %e, "Drain failed"),
    }
}

/// Spawn the loop that drains on app start, on every offline to online
/// transition, on each interval tick and on manual requests.
pub fn start_sync_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    tracker.spawn(async move {
        info!(interval_ms = interval.as_millis() as u64, "Sync loop started");
        let mut online_rx = engine.connectivity.subscribe();
        let mut previous_online = *online_rx.borrow_and_update();
        if previous_online {
            drain_logged(&engine, "start", true).await;
        } else {
            info!("Starting offline; outbox drains once the network is back");
        }

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = online_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let online = *online_rx.borrow_and_update();
                    if online && !previous_online {
                        info!("Network restored; resuming queued sync");
                        drain_logged(&engine, "reconnect", true).await;
                    }
                    previous_online = online;
                }
                _ = ticker.tick() => drain_logged(&engine, "interval", false).await,
                _ = engine.wake.notified() => drain_logged(&engine, "manual", false).await,
            }
        }
        info!("Sync loop stopped");
    });
}
