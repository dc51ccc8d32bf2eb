//! Typed entity records mirrored locally and replicated to the remote store.
//!
//! Every record can enumerate the ids it references so the outbox can rewrite
//! temporary ids in place once their creates are confirmed.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::error::{Result, SyncError};
use crate::ids::EntityId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Client,
    Product,
    Sale,
    CashRegisterClosure,
    Order,
    Credit,
    CreditPayment,
}

impl EntityKind {
    pub const ALL: [EntityKind; 7] = [
        EntityKind::Client,
        EntityKind::Product,
        EntityKind::Sale,
        EntityKind::CashRegisterClosure,
        EntityKind::Order,
        EntityKind::Credit,
        EntityKind::CreditPayment,
    ];

    /// Label stored in the `mirror_rows.entity` column.
    pub fn as_str(self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Product => "product",
            EntityKind::Sale => "sale",
            EntityKind::CashRegisterClosure => "cash_register_closure",
            EntityKind::Order => "order",
            EntityKind::Credit => "credit",
            EntityKind::CreditPayment => "credit_payment",
        }
    }

    /// Remote table holding rows of this kind.
    pub fn table(self) -> &'static str {
        match self {
            EntityKind::Client => "clients",
            EntityKind::Product => "products",
            EntityKind::Sale => "sales",
            EntityKind::CashRegisterClosure => "cash_register_closures",
            EntityKind::Order => "orders",
            EntityKind::Credit => "credits",
            EntityKind::CreditPayment => "credit_payments",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        EntityKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| SyncError::Invalid(format!("unknown entity kind: {s}")))
    }
}

/// Remote table for sale line items. Lines are not mirrored on their own;
/// they live inside the sale record locally.
pub const SALE_ITEMS_TABLE: &str = "sale_items";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Credit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Pending,
    Confirmed,
    Delivered,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditStatus {
    #[default]
    Open,
    Paid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub name: String,
    #[serde(default)]
    pub document: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Raw material or component consumed whenever the owning product sells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkedProduct {
    pub product_id: EntityId,
    pub quantity_per_unit: f64,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub price: f64,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub stock: f64,
    #[serde(default = "default_true")]
    pub track_stock: bool,
    #[serde(default)]
    pub linked_products: Vec<LinkedProduct>,
}

/// One sold line. `tracks_stock` and `linked` are snapshots of the product
/// at sale time, so the authoritative stock plan replays exactly what was
/// applied optimistically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaleItem {
    pub product_id: EntityId,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default)]
    pub tracks_stock: bool,
    #[serde(default)]
    pub linked: Vec<LinkedProduct>,
}

impl SaleItem {
    pub fn subtotal(&self) -> f64 {
        crate::side_effects::round2(self.quantity * self.unit_price)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
    #[serde(default)]
    pub client_id: Option<EntityId>,
    #[serde(default)]
    pub items: Vec<SaleItem>,
    pub total: f64,
    pub payment_method: PaymentMethod,
    pub sold_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashRegisterClosure {
    #[serde(default)]
    pub opened_at: Option<String>,
    pub closed_at: String,
    pub opening_cash: f64,
    pub cash_sales: f64,
    pub other_sales: f64,
    pub sales_count: i64,
    pub expected_cash: f64,
    pub counted_cash: f64,
    pub difference: f64,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: EntityId,
    pub quantity: f64,
    pub unit_price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(default)]
    pub client_id: Option<EntityId>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    pub total: f64,
    #[serde(default)]
    pub status: OrderStatus,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Credit {
    pub client_id: EntityId,
    #[serde(default)]
    pub sale_id: Option<EntityId>,
    pub amount: f64,
    pub balance: f64,
    #[serde(default)]
    pub status: CreditStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreditPayment {
    pub credit_id: EntityId,
    pub amount: f64,
    pub method: PaymentMethod,
    pub paid_at: String,
}

/// Any mirrored record, tagged by entity kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "entity", rename_all = "snake_case")]
pub enum EntityRecord {
    Client(Client),
    Product(Product),
    Sale(Sale),
    CashRegisterClosure(CashRegisterClosure),
    Order(Order),
    Credit(Credit),
    CreditPayment(CreditPayment),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            EntityRecord::Client(_) => EntityKind::Client,
            EntityRecord::Product(_) => EntityKind::Product,
            EntityRecord::Sale(_) => EntityKind::Sale,
            EntityRecord::CashRegisterClosure(_) => EntityKind::CashRegisterClosure,
            EntityRecord::Order(_) => EntityKind::Order,
            EntityRecord::Credit(_) => EntityKind::Credit,
            EntityRecord::CreditPayment(_) => EntityKind::CreditPayment,
        }
    }

    /// Ids of other entities this record points at.
    pub fn references(&self) -> Vec<&EntityId> {
        match self {
            EntityRecord::Client(_) | EntityRecord::CashRegisterClosure(_) => Vec::new(),
            EntityRecord::Product(p) => p.linked_products.iter().map(|l| &l.product_id).collect(),
            EntityRecord::Sale(s) => sale_references(s),
            EntityRecord::Order(o) => o
                .client_id
                .iter()
                .chain(o.items.iter().map(|i| &i.product_id))
                .collect(),
            EntityRecord::Credit(c) => std::iter::once(&c.client_id)
                .chain(c.sale_id.iter())
                .collect(),
            EntityRecord::CreditPayment(p) => vec![&p.credit_id],
        }
    }

    pub fn references_mut(&mut self) -> Vec<&mut EntityId> {
        match self {
            EntityRecord::Client(_) | EntityRecord::CashRegisterClosure(_) => Vec::new(),
            EntityRecord::Product(p) => p
                .linked_products
                .iter_mut()
                .map(|l| &mut l.product_id)
                .collect(),
            EntityRecord::Sale(s) => sale_references_mut(s),
            EntityRecord::Order(o) => o
                .client_id
                .iter_mut()
                .chain(o.items.iter_mut().map(|i| &mut i.product_id))
                .collect(),
            EntityRecord::Credit(c) => std::iter::once(&mut c.client_id)
                .chain(c.sale_id.iter_mut())
                .collect(),
            EntityRecord::CreditPayment(p) => vec![&mut p.credit_id],
        }
    }

    /// Build the remote row for this record. Fails with `Unresolved` while
    /// any referenced id is still temporary.
    pub fn to_remote_row(
        &self,
        organization_id: &str,
        local_ref: Option<&str>,
    ) -> Result<Map<String, Value>> {
        if let Some(unresolved) = self.references().into_iter().find(|id| id.is_temporary()) {
            return Err(SyncError::Unresolved(unresolved.to_string()));
        }

        let mut row = match serde_json::to_value(self)? {
            Value::Object(map) => map,
            other => {
                return Err(SyncError::Invalid(format!(
                    "record did not serialize to an object: {other}"
                )))
            }
        };
        row.remove("entity");
        if let EntityRecord::Sale(_) = self {
            // Lines go to their own table.
            row.remove("items");
        }
        row.insert("organization_id".into(), Value::String(organization_id.to_string()));
        if let Some(local_ref) = local_ref {
            row.insert("local_ref".into(), Value::String(local_ref.to_string()));
        }
        Ok(row)
    }

    /// Parse a row fetched from the remote store. Unknown columns such as
    /// `id`, `organization_id` and `local_ref` are ignored.
    pub fn from_remote_row(kind: EntityKind, row: &Map<String, Value>) -> Result<Self> {
        let mut tagged = row.clone();
        tagged.insert("entity".into(), Value::String(kind.as_str().to_string()));
        Ok(serde_json::from_value(Value::Object(tagged))?)
    }
}

pub(crate) fn sale_references(s: &Sale) -> Vec<&EntityId> {
    let mut refs: Vec<&EntityId> = s.client_id.iter().collect();
    for item in &s.items {
        refs.push(&item.product_id);
        refs.extend(item.linked.iter().map(|l| &l.product_id));
    }
    refs
}

pub(crate) fn sale_references_mut(s: &mut Sale) -> Vec<&mut EntityId> {
    let mut refs: Vec<&mut EntityId> = s.client_id.iter_mut().collect();
    for item in &mut s.items {
        refs.push(&mut item.product_id);
        refs.extend(item.linked.iter_mut().map(|l| &mut l.product_id));
    }
    refs
}
