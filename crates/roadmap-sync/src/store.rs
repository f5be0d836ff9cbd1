//! Backing-store seams.
//!
//! The engine talks to the persistent store and to the ephemeral presence
//! channel only through these traits, always as `Arc<dyn ...>`, so a network
//! client and the in-memory implementation in [`crate::memory`] are
//! interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use roadmap_types::{ChangeEvent, Row, RowId, SessionId, Table};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

use crate::error::StoreError;
use crate::presence::{PresenceEvent, PresenceMember};

/// Row predicate for [`BackingStore::read`].
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    /// Column equals value. A missing column compares as null.
    Eq(String, Value),
}

impl Filter {
    pub fn all() -> Self {
        Filter::All
    }

    pub fn by_id(id: RowId) -> Self {
        Filter::Eq("id".to_string(), id.to_json())
    }

    pub fn eq(field: impl Into<String>, value: Value) -> Self {
        Filter::Eq(field.into(), value)
    }

    pub fn matches(&self, row: &Row) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(field, value) => row.get(field).unwrap_or(&Value::Null) == value,
        }
    }
}

/// The persistent store: CRUD plus a per-table change stream.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Rows of `table` matching `filter`, in storage order.
    async fn read(&self, table: Table, filter: &Filter) -> Result<Vec<Row>, StoreError>;

    /// Update columns of one row. `fields` is partial.
    async fn write(&self, table: Table, id: RowId, fields: Row) -> Result<(), StoreError>;

    /// Insert a row; the store assigns and returns its id.
    async fn create(&self, table: Table, fields: Row) -> Result<RowId, StoreError>;

    async fn delete(&self, table: Table, id: RowId) -> Result<(), StoreError>;

    /// Change events for `table`, in commit order. Delivery is at-least-once.
    fn subscribe(&self, table: Table) -> broadcast::Receiver<ChangeEvent>;

    /// Whether [`write_batch`](Self::write_batch) applies all-or-nothing.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Apply several row updates in one transaction.
    async fn write_batch(&self, _table: Table, _writes: Vec<(RowId, Row)>) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("write_batch"))
    }
}

/// Ephemeral pub/sub for presence. Nothing is persisted.
#[async_trait]
pub trait PresenceTransport: Send + Sync {
    /// Join `channel`. The first event delivered is a `Sync` of who is there.
    async fn join(
        &self,
        channel: &str,
        session: SessionId,
    ) -> Result<mpsc::UnboundedReceiver<PresenceEvent>, StoreError>;

    /// Broadcast (or re-broadcast) this session's member record.
    async fn track(&self, channel: &str, member: PresenceMember) -> Result<(), StoreError>;

    async fn leave(&self, channel: &str, session: SessionId) -> Result<(), StoreError>;
}

pub type SharedStore = Arc<dyn BackingStore>;
pub type SharedPresence = Arc<dyn PresenceTransport>;
