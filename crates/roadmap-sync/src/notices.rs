//! User-facing notices (the toast side channel).
//!
//! Publishing is best-effort: with no subscribers the notice is dropped, and a
//! slow subscriber lags rather than blocking the publisher. Nothing in the
//! engine waits on a notice being seen.

use roadmap_types::{CacheKey, RowId, Table};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

/// Something the UI may want to surface.
#[derive(Clone, Debug, PartialEq)]
pub enum Notice {
    /// A significant field changed on a row edited by another session.
    StatusChanged {
        table: Table,
        id: RowId,
        field: &'static str,
        from: Value,
        to: Value,
    },
    /// A local write failed and its optimistic change was rolled back.
    MutationFailed { what: String, message: String },
    /// Some position writes of a reorder failed; the collection was refetched.
    ReorderInconsistent { key: CacheKey, failed: usize },
    /// The realtime stream for a table lagged and its keys were invalidated.
    Resynced { table: Table, missed: u64 },
}

/// Broadcasts [`Notice`]s to any number of listeners.
#[derive(Clone, Debug)]
pub struct Notifier {
    tx: broadcast::Sender<Notice>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notice: Notice) {
        if self.tx.send(notice).is_err() {
            trace!("notice dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notice> {
        self.tx.subscribe()
    }
}
