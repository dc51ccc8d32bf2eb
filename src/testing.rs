//! In-memory remote store with failure injection and artificial latency.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::RemoteError;
use crate::models::{Client, Product};
use crate::remote::{Filter, RemoteRow, RemoteStore};

pub fn client(name: &str) -> Client {
    Client {
        name: name.into(),
        document: None,
        phone: None,
        email: None,
        address: None,
        notes: None,
    }
}

pub fn product(name: &str, price: f64, stock: f64) -> Product {
    Product {
        name: name.into(),
        sku: None,
        price,
        cost: None,
        stock,
        track_stock: true,
        linked_products: Vec::new(),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCall {
    Insert { table: String, row: RemoteRow },
    Update { table: String, id: i64, patch: RemoteRow },
    Delete { table: String, id: i64 },
    Select { table: String },
}

impl RemoteCall {
    pub fn table(&self) -> &str {
        match self {
            RemoteCall::Insert { table, .. }
            | RemoteCall::Update { table, .. }
            | RemoteCall::Delete { table, .. }
            | RemoteCall::Select { table } => table,
        }
    }
}

type FailureRule = Box<dyn Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync>;

pub struct MemoryRemote {
    tables: Mutex<HashMap<String, Vec<RemoteRow>>>,
    next_id: AtomicI64,
    calls: Mutex<Vec<RemoteCall>>,
    rules: Mutex<Vec<FailureRule>>,
    insert_latency: Mutex<Option<Duration>>,
    reachable: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1_000),
            calls: Mutex::new(Vec::new()),
            rules: Mutex::new(Vec::new()),
            insert_latency: Mutex::new(None),
            reachable: AtomicBool::new(true),
        }
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a row directly, bypassing the call log. Returns its id.
    pub fn seed(&self, table: &str, row: Value) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut row = row.as_object().cloned().unwrap_or_default();
        row.insert("id".into(), Value::from(id));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(row);
        id
    }

    pub fn rows(&self, table: &str) -> Vec<RemoteRow> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn row(&self, table: &str, id: i64) -> Option<RemoteRow> {
        self.rows(table)
            .into_iter()
            .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
    }

    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn insert_count(&self, table: &str) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, RemoteCall::Insert { table: t, .. } if t == table))
            .count()
    }

    /// Fail every call for which `rule` returns an error.
    pub fn fail_when<F>(&self, rule: F)
    where
        F: Fn(&RemoteCall) -> Option<RemoteError> + Send + Sync + 'static,
    {
        self.rules.lock().unwrap().push(Box::new(rule));
    }

    pub fn clear_failures(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn set_insert_latency(&self, latency: Duration) {
        *self.insert_latency.lock().unwrap() = Some(latency);
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    fn record(&self, call: RemoteCall) -> Result<(), RemoteError> {
        self.calls.lock().unwrap().push(call.clone());
        let rules = self.rules.lock().unwrap();
        match rules.iter().find_map(|rule| rule(&call)) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow, RemoteError> {
        let latency = *self.insert_latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.record(RemoteCall::Insert {
            table: table.to_string(),
            row: row.clone(),
        })?;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut stored = row;
        stored.insert("id".into(), Value::from(id));
        self.tables
            .lock()
            .unwrap()
            .entry(table.to_string())
            .or_default()
            .push(stored.clone());
        Ok(stored)
    }

    async fn update(
        &self,
        table: &str,
        id: i64,
        patch: RemoteRow,
    ) -> Result<RemoteRow, RemoteError> {
        self.record(RemoteCall::Update {
            table: table.to_string(),
            id,
            patch: patch.clone(),
        })?;
        let mut tables = self.tables.lock().unwrap();
        let row = tables
            .get_mut(table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| r.get("id").and_then(Value::as_i64) == Some(id))
            })
            .ok_or_else(|| RemoteError::Rejected(format!("{table} {id} not found")))?;
        for (k, v) in patch {
            row.insert(k, v);
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: &str, id: i64) -> Result<(), RemoteError> {
        self.record(RemoteCall::Delete {
            table: table.to_string(),
            id,
        })?;
        if let Some(rows) = self.tables.lock().unwrap().get_mut(table) {
            rows.retain(|r| r.get("id").and_then(Value::as_i64) != Some(id));
        }
        Ok(())
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<RemoteRow>, RemoteError> {
        self.record(RemoteCall::Select {
            table: table.to_string(),
        })?;
        Ok(self
            .rows(table)
            .into_iter()
            .filter(|row| filter.matches(row))
            .collect())
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transient("unreachable".into()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn crud_round_trip_and_failure_rules() {
        let remote = MemoryRemote::new();
        let row = remote
            .insert("clients", json!({ "name": "Ana" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        let id = row["id"].as_i64().unwrap();

        remote
            .update("clients", id, json!({ "name": "Ana M" }).as_object().cloned().unwrap())
            .await
            .unwrap();
        assert_eq!(remote.row("clients", id).unwrap()["name"], json!("Ana M"));

        remote.fail_when(|call| {
            matches!(call, RemoteCall::Delete { .. })
                .then(|| RemoteError::Transient("timeout".into()))
        });
        assert!(remote.delete("clients", id).await.is_err());
        remote.clear_failures();
        remote.delete("clients", id).await.unwrap();
        assert!(remote.rows("clients").is_empty());
    }
}
