//! Error types shared by the mirror store, outbox and sync engine.
//!
//! Local errors are fatal to the call that hit them and are returned to the
//! caller synchronously. Remote errors only occur while draining and are
//! recorded on the outbox entry instead of being surfaced.

use thiserror::Error;

/// Failure reported by the remote relational store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, timeout, throttling or server-side error.
    #[error("transient remote failure: {0}")]
    Transient(String),
    /// Validation or constraint failure reported by the store.
    #[error("remote rejected operation: {0}")]
    Rejected(String),
}

impl RemoteError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }

    /// Stable label persisted in `outbox.error_kind`.
    pub fn kind_label(&self) -> &'static str {
        match self {
            RemoteError::Transient(_) => "transient",
            RemoteError::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("local storage: {0}")]
    LocalStorage(#[from] rusqlite::Error),

    #[error("local storage lock poisoned")]
    LockPoisoned,

    #[error("payload encoding: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("temporary id {0} has not been assigned a server id yet")]
    Unresolved(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Invalid(String),

    #[error("configuration: {0}")]
    Config(String),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
