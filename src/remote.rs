//! Remote relational store client.
//!
//! The sync engine only needs insert/update/delete/select on named tables.
//! [`HttpRemoteStore`] speaks the PostgREST dialect used by the hosted
//! backend; tests substitute an in-memory store.

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{Map, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::error::{RemoteError, Result, SyncError};

/// A row as returned by the remote store, always carrying its `id`.
pub type RemoteRow = Map<String, Value>;

/// Equality filter for `select`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    pub eq: Vec<(String, Value)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.eq.push((column.into(), value.into()));
        self
    }

    /// Whether a row satisfies every equality.
    pub fn matches(&self, row: &RemoteRow) -> bool {
        self.eq
            .iter()
            .all(|(column, value)| row.get(column).unwrap_or(&Value::Null) == value)
    }
}

/// Extract the server-assigned id from a returned row.
pub fn row_id(row: &RemoteRow) -> std::result::Result<i64, RemoteError> {
    row.get("id")
        .and_then(Value::as_i64)
        .ok_or_else(|| RemoteError::Rejected("remote row has no integer id".into()))
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow, RemoteError>;

    async fn update(&self, table: &str, id: i64, patch: RemoteRow)
        -> Result<RemoteRow, RemoteError>;

    async fn delete(&self, table: &str, id: i64) -> Result<(), RemoteError>;

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<RemoteRow>, RemoteError>;

    /// Lightweight reachability check used by the connectivity probe.
    async fn ping(&self) -> Result<(), RemoteError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the remote base URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/rest/v1` segment
pub fn normalize_base_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/rest/v1") {
        url.truncate(url.len() - "/rest/v1".len());
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn percent_encode(input: &str) -> String {
    let mut encoded = String::with_capacity(input.len());
    for b in input.bytes() {
        let is_unreserved =
            b.is_ascii_alphanumeric() || b == b'-' || b == b'_' || b == b'.' || b == b'~';
        if is_unreserved {
            encoded.push(b as char);
        } else {
            encoded.push_str(&format!("%{b:02X}"));
        }
    }
    encoded
}

/// PostgREST `eq.` operand for a JSON value.
fn filter_operand(value: &Value) -> String {
    match value {
        Value::String(s) => percent_encode(s),
        Value::Null => "null".to_string(),
        other => percent_encode(&other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Classify a transport error. Nothing reached the store, so it is always
/// safe to retry.
fn transport_error(url: &str, err: &reqwest::Error) -> RemoteError {
    if err.is_connect() {
        return RemoteError::Transient(format!("Cannot reach remote store at {url}"));
    }
    if err.is_timeout() {
        return RemoteError::Transient(format!("Connection to {url} timed out"));
    }
    RemoteError::Transient(format!("Network error communicating with {url}: {err}"))
}

/// Classify a non-success status. Throttling, server errors and credential
/// problems are transient; every other client error is a rejection.
fn status_error(status: StatusCode, body: &str) -> RemoteError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|json| {
            json.get("message")
                .or_else(|| json.get("error"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string());
    let code = status.as_u16();
    let message = if detail.is_empty() {
        format!("HTTP {code}")
    } else {
        format!("{detail} (HTTP {code})")
    };

    match code {
        401 | 403 => RemoteError::Transient(format!("API key is invalid or expired: {message}")),
        408 | 429 => RemoteError::Transient(message),
        s if s >= 500 => RemoteError::Transient(format!("Remote store server error: {message}")),
        _ => RemoteError::Rejected(message),
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    api_key: Zeroizing<String>,
}

impl HttpRemoteStore {
    pub fn new(base_url: &str, api_key: Zeroizing<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_base_url(base_url),
            api_key,
        })
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{table}", self.base_url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", self.api_key.as_str())
            .header("Authorization", format!("Bearer {}", self.api_key.as_str()))
            .header("Content-Type", "application/json")
    }

    async fn send(&self, req: RequestBuilder) -> Result<String, RemoteError> {
        let resp = req
            .send()
            .await
            .map_err(|e| transport_error(&self.base_url, &e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        Ok(body)
    }

    async fn send_rows(&self, req: RequestBuilder) -> Result<Vec<RemoteRow>, RemoteError> {
        let body = self.send(req).await?;
        if body.trim().is_empty() {
            return Ok(Vec::new());
        }
        let value: Value = serde_json::from_str(&body).map_err(|e| {
            RemoteError::Transient(format!("Invalid JSON from remote store: {e}"))
        })?;
        match value {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|item| match item {
                    Value::Object(map) => Some(map),
                    _ => None,
                })
                .collect()),
            Value::Object(map) => Ok(vec![map]),
            _ => Ok(Vec::new()),
        }
    }

    async fn single_row(&self, req: RequestBuilder, what: &str) -> Result<RemoteRow, RemoteError> {
        self.send_rows(req)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::Rejected(format!("{what} returned no row")))
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn insert(&self, table: &str, row: RemoteRow) -> Result<RemoteRow, RemoteError> {
        let req = self
            .request(Method::POST, &self.table_url(table))
            .header("Prefer", "return=representation")
            .json(&Value::Object(row));
        let row = self.single_row(req, &format!("insert into {table}")).await?;
        debug!(table, id = ?row.get("id"), "Remote insert");
        Ok(row)
    }

    async fn update(
        &self,
        table: &str,
        id: i64,
        patch: RemoteRow,
    ) -> Result<RemoteRow, RemoteError> {
        let url = format!("{}?id=eq.{id}", self.table_url(table));
        let req = self
            .request(Method::PATCH, &url)
            .header("Prefer", "return=representation")
            .json(&Value::Object(patch));
        self.single_row(req, &format!("update of {table} {id}")).await
    }

    async fn delete(&self, table: &str, id: i64) -> Result<(), RemoteError> {
        let url = format!("{}?id=eq.{id}", self.table_url(table));
        self.send(self.request(Method::DELETE, &url)).await?;
        Ok(())
    }

    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<RemoteRow>, RemoteError> {
        let mut url = format!("{}?select=*", self.table_url(table));
        for (column, value) in &filter.eq {
            url.push_str(&format!("&{}=eq.{}", percent_encode(column), filter_operand(value)));
        }
        self.send_rows(self.request(Method::GET, &url)).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        let start = Instant::now();
        let url = format!("{}/rest/v1/", self.base_url);
        self.send(self.request(Method::HEAD, &url)).await?;
        info!(latency_ms = start.elapsed().as_millis() as u64, "Remote store reachable");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_base_url() {
        assert_eq!(normalize_base_url("db.example.com/"), "https://db.example.com");
        assert_eq!(normalize_base_url("localhost:54321/rest/v1/"), "http://localhost:54321");
        assert_eq!(normalize_base_url(" https://x.supabase.co "), "https://x.supabase.co");
    }

    #[test]
    fn classifies_statuses() {
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(status_error(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(status_error(StatusCode::UNAUTHORIZED, "").is_transient());
        let rejected = status_error(
            StatusCode::CONFLICT,
            r#"{"message":"duplicate key value violates unique constraint"}"#,
        );
        assert_eq!(
            rejected,
            RemoteError::Rejected(
                "duplicate key value violates unique constraint (HTTP 409)".into()
            )
        );
    }

    #[test]
    fn filter_operands_are_encoded() {
        assert_eq!(filter_operand(&json!("tmp-1 a")), "tmp-1%20a");
        assert_eq!(filter_operand(&json!(42)), "42");
        assert_eq!(filter_operand(&Value::Null), "null");
    }

    #[test]
    fn filter_matches_rows() {
        let row = json!({ "id": 1, "local_ref": "tmp-1", "organization_id": "org" });
        let row = row.as_object().unwrap();
        assert!(Filter::new().eq("local_ref", "tmp-1").matches(row));
        assert!(!Filter::new().eq("local_ref", "tmp-2").matches(row));
        assert!(Filter::new().matches(row));
    }
}
