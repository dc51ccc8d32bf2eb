//! Mutation enqueue API.
//!
//! Every user action writes its optimistic mirror row and appends the
//! matching outbox entry inside one SQLite transaction: either both commit or
//! neither does. None of these functions touch the network; the caller wakes
//! the sync engine afterwards.

use rusqlite::Connection;
use tracing::info;

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::ids::EntityId;
use crate::mirror::{self, MirrorRow};
use crate::models::{
    CashRegisterClosure, Client, Credit, CreditPayment, CreditStatus, EntityKind, EntityRecord,
    Order, OrderStatus, PaymentMethod, Product, Sale, SaleItem,
};
use crate::outbox::{self, CreditPaymentProgress, Operation, SaleProgress};
use crate::side_effects::{self, round2};

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn require_positive(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(SyncError::Invalid(format!("{what} must be positive, got {value}")))
    }
}

fn require_non_negative(what: &str, value: f64) -> Result<()> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(SyncError::Invalid(format!("{what} must not be negative, got {value}")))
    }
}

fn validate(record: &EntityRecord) -> Result<()> {
    match record {
        EntityRecord::Client(c) if c.name.trim().is_empty() => {
            Err(SyncError::Invalid("client name is required".into()))
        }
        EntityRecord::Product(p) => {
            if p.name.trim().is_empty() {
                return Err(SyncError::Invalid("product name is required".into()));
            }
            require_non_negative("price", p.price)?;
            require_non_negative("stock", p.stock)?;
            for linked in &p.linked_products {
                require_positive("linked quantity per unit", linked.quantity_per_unit)?;
            }
            Ok(())
        }
        EntityRecord::Order(o) => {
            for item in &o.items {
                require_positive("order quantity", item.quantity)?;
            }
            require_non_negative("order total", o.total)
        }
        EntityRecord::Credit(c) => {
            require_positive("credit amount", c.amount)?;
            require_non_negative("credit balance", c.balance)
        }
        _ => Ok(()),
    }
}

/// Resolve the caller's id to the row's canonical id (the server id once
/// known), failing when the row does not exist or is deleted.
fn live_row(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
) -> Result<MirrorRow> {
    let row = mirror::require(conn, organization_id, kind, id)?;
    if row.deleted_at.is_some() {
        return Err(SyncError::NotFound(format!("{kind} {id} is deleted")));
    }
    Ok(row)
}

fn canonical_id(
    conn: &Connection,
    organization_id: &str,
    kind: EntityKind,
    id: &EntityId,
) -> Result<EntityId> {
    Ok(live_row(conn, organization_id, kind, id)?.id)
}

// ---------------------------------------------------------------------------
// Generic create / update / delete
// ---------------------------------------------------------------------------

fn create_in(conn: &Connection, organization_id: &str, record: EntityRecord) -> Result<EntityId> {
    validate(&record)?;
    let id = EntityId::new_temporary();
    mirror::upsert(conn, organization_id, &id, &record, false)?;
    outbox::enqueue(conn, organization_id, &Operation::Create { id: id.clone(), record })?;
    Ok(id)
}

/// Create any entity offline. Returns its temporary id.
pub fn create(db: &DbState, organization_id: &str, record: EntityRecord) -> Result<EntityId> {
    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;
    let kind = record.kind();
    let id = create_in(&tx, organization_id, record)?;
    tx.commit()?;
    info!(%kind, %id, "Entity created locally");
    Ok(id)
}

/// Replace an entity's record. The outbox entry targets the row's canonical
/// id, so an update on a not-yet-synced entity waits for its create.
pub fn update(
    db: &DbState,
    organization_id: &str,
    id: &EntityId,
    record: EntityRecord,
) -> Result<EntityId> {
    validate(&record)?;
    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;
    let target = canonical_id(&tx, organization_id, record.kind(), id)?;
    mirror::upsert(&tx, organization_id, &target, &record, false)?;
    outbox::enqueue(
        &tx,
        organization_id,
        &Operation::Update {
            id: target.clone(),
            record,
        },
    )?;
    tx.commit()?;
    Ok(target)
}

/// Soft-delete an entity locally and queue the tombstone.
pub fn delete(db: &DbState, organization_id: &str, kind: EntityKind, id: &EntityId) -> Result<()> {
    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;
    let target = canonical_id(&tx, organization_id, kind, id)?;
    let deleted_at = mirror::soft_delete(&tx, organization_id, kind, &target)?;
    outbox::enqueue(
        &tx,
        organization_id,
        &Operation::Delete {
            kind,
            id: target.clone(),
            deleted_at,
        },
    )?;
    tx.commit()?;
    info!(%kind, id = %target, "Entity deleted locally");
    Ok(())
}

// ---------------------------------------------------------------------------
// Clients, products, orders
// ---------------------------------------------------------------------------

pub fn create_client(db: &DbState, organization_id: &str, client: Client) -> Result<EntityId> {
    create(db, organization_id, EntityRecord::Client(client))
}

pub fn update_client(
    db: &DbState,
    organization_id: &str,
    id: &EntityId,
    client: Client,
) -> Result<EntityId> {
    update(db, organization_id, id, EntityRecord::Client(client))
}

pub fn delete_client(db: &DbState, organization_id: &str, id: &EntityId) -> Result<()> {
    delete(db, organization_id, EntityKind::Client, id)
}

pub fn create_product(db: &DbState, organization_id: &str, product: Product) -> Result<EntityId> {
    create(db, organization_id, EntityRecord::Product(product))
}

pub fn update_product(
    db: &DbState,
    organization_id: &str,
    id: &EntityId,
    product: Product,
) -> Result<EntityId> {
    update(db, organization_id, id, EntityRecord::Product(product))
}

pub fn delete_product(db: &DbState, organization_id: &str, id: &EntityId) -> Result<()> {
    delete(db, organization_id, EntityKind::Product, id)
}

pub fn create_order(db: &DbState, organization_id: &str, order: Order) -> Result<EntityId> {
    create(db, organization_id, EntityRecord::Order(order))
}

pub fn update_order_status(
    db: &DbState,
    organization_id: &str,
    id: &EntityId,
    status: OrderStatus,
) -> Result<EntityId> {
    let current = {
        let conn = db.conn.lock()?;
        live_row(&conn, organization_id, EntityKind::Order, id)?
    };
    let EntityRecord::Order(mut order) = current.record else {
        return Err(SyncError::Invalid(format!("{id} is not an order")));
    };
    order.status = status;
    update(db, organization_id, &current.id, EntityRecord::Order(order))
}

pub fn delete_order(db: &DbState, organization_id: &str, id: &EntityId) -> Result<()> {
    delete(db, organization_id, EntityKind::Order, id)
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SaleLine {
    pub product_id: EntityId,
    pub quantity: f64,
    /// Defaults to the product's current price.
    pub unit_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleDraft {
    pub client_id: Option<EntityId>,
    pub lines: Vec<SaleLine>,
    pub payment_method: PaymentMethod,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SaleReceipt {
    pub sale_id: EntityId,
    pub total: f64,
    /// Present for credit sales.
    pub credit_id: Option<EntityId>,
}

/// Record a sale offline.
///
/// Snapshots each product's stock tracking and linked materials into the
/// sale, applies the resulting stock plan to the mirror, and queues one
/// compound entry that replays the same plan remotely. A credit sale also
/// opens a credit for the client, referencing the sale's temporary id.
pub fn record_sale(db: &DbState, organization_id: &str, draft: SaleDraft) -> Result<SaleReceipt> {
    if draft.lines.is_empty() {
        return Err(SyncError::Invalid("a sale needs at least one line".into()));
    }
    if draft.payment_method == PaymentMethod::Credit && draft.client_id.is_none() {
        return Err(SyncError::Invalid("credit sales require a client".into()));
    }

    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;

    let client_id = draft
        .client_id
        .as_ref()
        .map(|id| canonical_id(&tx, organization_id, EntityKind::Client, id))
        .transpose()?;

    let mut items = Vec::with_capacity(draft.lines.len());
    for line in &draft.lines {
        require_positive("quantity", line.quantity)?;
        let row = live_row(&tx, organization_id, EntityKind::Product, &line.product_id)?;
        let EntityRecord::Product(product) = &row.record else {
            return Err(SyncError::Invalid(format!("{} is not a product", line.product_id)));
        };
        let unit_price = line.unit_price.unwrap_or(product.price);
        require_non_negative("unit price", unit_price)?;
        items.push(SaleItem {
            product_id: row.id.clone(),
            quantity: line.quantity,
            unit_price,
            tracks_stock: product.track_stock,
            linked: product.linked_products.clone(),
        });
    }

    let total = round2(items.iter().map(SaleItem::subtotal).sum());
    let sale = Sale {
        client_id: client_id.clone(),
        items,
        total,
        payment_method: draft.payment_method,
        sold_at: outbox::timestamp_now(),
    };
    let sale_id = EntityId::new_temporary();

    mirror::upsert(
        &tx,
        organization_id,
        &sale_id,
        &EntityRecord::Sale(sale.clone()),
        false,
    )?;
    for step in side_effects::stock_plan(&sale) {
        mirror::modify(&tx, organization_id, EntityKind::Product, &step.product_id, |record| {
            if let EntityRecord::Product(p) = record {
                p.stock = side_effects::decrement_stock(p.stock, step.amount);
            }
            Ok(())
        })?;
    }
    outbox::enqueue(
        &tx,
        organization_id,
        &Operation::Sale {
            id: sale_id.clone(),
            sale,
            progress: SaleProgress::default(),
        },
    )?;

    let credit_id = match (draft.payment_method, client_id) {
        (PaymentMethod::Credit, Some(client_id)) => {
            let credit = Credit {
                client_id,
                sale_id: Some(sale_id.clone()),
                amount: total,
                balance: total,
                status: CreditStatus::Open,
            };
            Some(create_in(&tx, organization_id, EntityRecord::Credit(credit))?)
        }
        _ => None,
    };

    tx.commit()?;
    info!(sale_id = %sale_id, total, credit = credit_id.is_some(), "Sale recorded locally");

    Ok(SaleReceipt {
        sale_id,
        total,
        credit_id,
    })
}

// ---------------------------------------------------------------------------
// Credits
// ---------------------------------------------------------------------------

pub fn create_credit(db: &DbState, organization_id: &str, credit: Credit) -> Result<EntityId> {
    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;
    let mut credit = credit;
    credit.client_id = canonical_id(&tx, organization_id, EntityKind::Client, &credit.client_id)?;
    let id = create_in(&tx, organization_id, EntityRecord::Credit(credit))?;
    tx.commit()?;
    Ok(id)
}

/// Record a payment against a credit, lowering the mirrored balance
/// immediately. The remote balance is recomputed when the entry drains.
pub fn record_credit_payment(
    db: &DbState,
    organization_id: &str,
    credit_id: &EntityId,
    amount: f64,
    method: PaymentMethod,
) -> Result<EntityId> {
    require_positive("payment amount", amount)?;
    if method == PaymentMethod::Credit {
        return Err(SyncError::Invalid("a credit cannot be paid on credit".into()));
    }

    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;
    let credit_id = canonical_id(&tx, organization_id, EntityKind::Credit, credit_id)?;

    let payment = CreditPayment {
        credit_id: credit_id.clone(),
        amount: round2(amount),
        method,
        paid_at: outbox::timestamp_now(),
    };
    let payment_id = EntityId::new_temporary();
    mirror::upsert(
        &tx,
        organization_id,
        &payment_id,
        &EntityRecord::CreditPayment(payment.clone()),
        false,
    )?;
    mirror::modify(&tx, organization_id, EntityKind::Credit, &credit_id, |record| {
        if let EntityRecord::Credit(c) = record {
            c.balance = side_effects::apply_credit_payment(c.balance, payment.amount);
            c.status = side_effects::credit_status(c.balance);
        }
        Ok(())
    })?;
    outbox::enqueue(
        &tx,
        organization_id,
        &Operation::CreditPayment {
            id: payment_id.clone(),
            payment,
            progress: CreditPaymentProgress::default(),
        },
    )?;
    tx.commit()?;
    Ok(payment_id)
}

// ---------------------------------------------------------------------------
// Cash register closure
// ---------------------------------------------------------------------------

/// Close the cash register over everything sold since the previous closure.
///
/// Cash sales and credit payments received in cash count toward the
/// expected drawer amount; card, transfer and credit sales are reported as
/// other sales.
pub fn close_cash_register(
    db: &DbState,
    organization_id: &str,
    opening_cash: f64,
    counted_cash: f64,
    notes: Option<String>,
) -> Result<(EntityId, CashRegisterClosure)> {
    require_non_negative("opening cash", opening_cash)?;
    require_non_negative("counted cash", counted_cash)?;

    let mut conn = db.conn.lock()?;
    let tx = conn.transaction()?;

    let opened_at = mirror::list(&tx, organization_id, EntityKind::CashRegisterClosure, true)?
        .into_iter()
        .filter_map(|row| match row.record {
            EntityRecord::CashRegisterClosure(c) => Some(c.closed_at),
            _ => None,
        })
        .max();
    let since = |ts: &str| opened_at.as_deref().map_or(true, |open| ts > open);

    let mut cash_sales = 0.0;
    let mut other_sales = 0.0;
    let mut sales_count = 0;
    for row in mirror::list(&tx, organization_id, EntityKind::Sale, true)? {
        if let EntityRecord::Sale(sale) = row.record {
            if !since(&sale.sold_at) {
                continue;
            }
            sales_count += 1;
            if sale.payment_method == PaymentMethod::Cash {
                cash_sales += sale.total;
            } else {
                other_sales += sale.total;
            }
        }
    }
    for row in mirror::list(&tx, organization_id, EntityKind::CreditPayment, true)? {
        if let EntityRecord::CreditPayment(p) = row.record {
            if p.method == PaymentMethod::Cash && since(&p.paid_at) {
                cash_sales += p.amount;
            }
        }
    }

    let expected_cash = round2(opening_cash + cash_sales);
    let closure = CashRegisterClosure {
        opened_at,
        closed_at: outbox::timestamp_now(),
        opening_cash,
        cash_sales: round2(cash_sales),
        other_sales: round2(other_sales),
        sales_count,
        expected_cash,
        counted_cash,
        difference: round2(counted_cash - expected_cash),
        notes,
    };
    let id = create_in(
        &tx,
        organization_id,
        EntityRecord::CashRegisterClosure(closure.clone()),
    )?;
    tx.commit()?;
    info!(
        closure_id = %id,
        sales_count,
        difference = closure.difference,
        "Cash register closed locally"
    );
    Ok((id, closure))
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

/// List an organization's rows of one kind, unsynced local writes included.
pub fn list(
    db: &DbState,
    organization_id: &str,
    kind: EntityKind,
    exclude_deleted: bool,
) -> Result<Vec<MirrorRow>> {
    let conn = db.conn.lock()?;
    mirror::list(&conn, organization_id, kind, exclude_deleted)
}
