//! Entity identifiers.
//!
//! A row created offline carries a client-generated temporary id until the
//! remote store confirms the insert and assigns its own. On disk the two are
//! told apart by JSON type: server ids are integers, temporary ids strings.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::{Result, SyncError};

const TEMP_PREFIX: &str = "tmp";

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Authoritative(i64),
    Temporary(String),
}

impl EntityId {
    /// Generate a fresh temporary id: `tmp-<unix-millis>-<uuid>`.
    ///
    /// The random component keeps two offline creates in the same
    /// millisecond apart; the timestamp keeps ids roughly sortable.
    pub fn new_temporary() -> Self {
        let millis = chrono::Utc::now().timestamp_millis();
        EntityId::Temporary(format!(
            "{TEMP_PREFIX}-{millis}-{}",
            Uuid::new_v4().simple()
        ))
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, EntityId::Temporary(_))
    }

    pub fn as_temporary(&self) -> Option<&str> {
        match self {
            EntityId::Temporary(t) => Some(t),
            EntityId::Authoritative(_) => None,
        }
    }

    pub fn as_authoritative(&self) -> Option<i64> {
        match self {
            EntityId::Authoritative(id) => Some(*id),
            EntityId::Temporary(_) => None,
        }
    }

    /// Server id, or `Unresolved` when the create has not applied yet.
    pub fn remote(&self) -> Result<i64> {
        match self {
            EntityId::Authoritative(id) => Ok(*id),
            EntityId::Temporary(t) => Err(SyncError::Unresolved(t.clone())),
        }
    }

    /// Rewrite in place when this is the given temporary id. Returns whether
    /// anything changed.
    pub fn resolve_to(&mut self, temporary: &str, authoritative: i64) -> bool {
        match self {
            EntityId::Temporary(t) if t == temporary => {
                *self = EntityId::Authoritative(authoritative);
                true
            }
            _ => false,
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Authoritative(id) => write!(f, "{id}"),
            EntityId::Temporary(t) => f.write_str(t),
        }
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        EntityId::Authoritative(id)
    }
}
