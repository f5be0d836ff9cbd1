//! Client-side synchronization engine for the roadmap planning tracker.
//!
//! Keeps a local cache of query results consistent with a remote store while
//! the user edits optimistically and other sessions push changes in.
//!
//! # Key Types
//!
//! |------------------------|-------------------------------------------------|
//! | Type                   | Purpose                                         |
//! |------------------------|-------------------------------------------------|
//! | [`SyncEngine`]         | Facade: reads, edits, creates, deletes, reorder |
//! | [`EntityCache`]        | Keyed query results with stale marks + watchers |
//! | [`WriteCoalescer`]     | One write per field per idle window             |
//! | [`MutationExecutor`]   | Optimistic apply, guarded rollback              |
//! | [`Reconciler`]         | Realtime events → patches and invalidations     |
//! | [`ReorderManager`]     | Dense re-indexing of ordered collections        |
//! | [`PresenceTracker`]    | De-duplicated, burst-coalesced online list      |
//! | [`BackingStore`]       | Seam to the remote store                        |
//! | [`MemoryStore`]        | In-process store with fault injection           |
//! |------------------------|-------------------------------------------------|
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use roadmap_sync::{MemoryStore, SyncConfig, SyncEngine};
//! use roadmap_types::{CacheKey, EntityRef, RowId, Table};
//! use serde_json::json;
//!
//! # async fn demo(id: RowId) -> Result<(), roadmap_sync::SyncError> {
//! let engine = SyncEngine::new(Arc::new(MemoryStore::new()), SyncConfig::default());
//! engine.start_realtime()?;
//! engine.load(CacheKey::tasks()).await?;
//! engine.edit(EntityRef::new(Table::Tasks, id), "name", json!("Ship it"))?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod coalescer;
pub mod config;
pub mod constants;
pub mod engine;
pub mod error;
pub mod executor;
pub mod loader;
pub mod memory;
pub mod notices;
pub mod presence;
pub mod reconciler;
pub mod reorder;
pub mod routes;
pub mod store;
pub mod value;

pub use cache::{CacheEntry, CacheEvent, CacheSubscription, EntityCache, SharedEntityCache};
pub use coalescer::{FieldKey, FlushFn, WriteCoalescer};
pub use config::{ConfigError, SyncConfig};
pub use engine::{FieldEditor, SyncEngine};
pub use error::{StoreError, SyncError};
pub use executor::{Change, MutationExecutor, Snapshot};
pub use loader::{Loader, Refresher};
pub use memory::{MemoryPresenceHub, MemoryStore, WriteOp, WriteRecord};
pub use notices::{Notice, Notifier};
pub use presence::{PresenceEvent, PresenceMember, PresenceTracker, Roster};
pub use reconciler::{IgnoreReason, ReconcileReport, Reconciler};
pub use reorder::{ReorderManager, ReorderOutcome};
pub use store::{BackingStore, Filter, PresenceTransport, SharedPresence, SharedStore};
pub use value::{CachedValue, Removal};
