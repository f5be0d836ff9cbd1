//! The facade the UI layer talks to.
//!
//! A [`SyncEngine`] owns one entity cache and the machinery around it. Reads
//! and subscriptions go straight to the cache; mutations go through the
//! coalescer or the executor; realtime events go through the reconciler.
//!
//! ```text
//!   UI ── edit ──▶ optimistic patch ──▶ WriteCoalescer ── idle ──▶ store.write
//!    │                                        │ failure
//!    │                                        └──────▶ rollback_field + Notice
//!    ├── create/remove ──▶ MutationExecutor ──▶ store.create/delete
//!    ├── reorder ───────▶ ReorderManager ────▶ store.write(_batch)
//!    └── subscribe ◀──── EntityCache ◀──── Reconciler ◀── store.subscribe
//!                              │
//!                              └── invalidate (watched) ──▶ Refresher ──▶ store.read
//! ```
//!
//! Background tasks (the refresher, one reconciler task per table) are owned
//! by the engine and aborted on [`shutdown`](SyncEngine::shutdown) or when the
//! last clone is dropped.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use roadmap_types::{CacheKey, ChangeEvent, EntityRef, Row, RowId, Table, field_row};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::cache::{CacheEntry, CacheSubscription, EntityCache, SharedEntityCache};
use crate::coalescer::{FieldKey, WriteCoalescer};
use crate::config::SyncConfig;
use crate::constants::PRESENCE_CHANNEL;
use crate::error::SyncError;
use crate::executor::{Change, MutationExecutor};
use crate::loader::{Loader, Refresher};
use crate::notices::{Notice, Notifier};
use crate::presence::{PresenceMember, PresenceTracker};
use crate::reconciler::{ReconcileReport, Reconciler};
use crate::reorder::{ReorderManager, ReorderOutcome};
use crate::routes::{derived_keys, list_keys, parent_detail_keys};
use crate::store::{SharedPresence, SharedStore};
use crate::value::{CachedValue, Removal};

/// Client-side sync engine. Cheap to clone.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: SyncConfig,
    store: SharedStore,
    cache: SharedEntityCache,
    notifier: Notifier,
    coalescer: WriteCoalescer,
    executor: MutationExecutor,
    refresher: Refresher,
    reconciler: Arc<Reconciler>,
    reorder: ReorderManager,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    realtime: AtomicBool,
    closed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

impl SyncEngine {
    /// Build an engine over `store` and start its refresher.
    ///
    /// Must be called inside a tokio runtime. Realtime reconciliation is
    /// started separately with [`start_realtime`](Self::start_realtime).
    pub fn new(store: SharedStore, config: SyncConfig) -> Self {
        let cache = EntityCache::shared(config.event_buffer, config.refetch_displayed);
        let notifier = Notifier::new(config.notice_buffer);
        let coalescer = WriteCoalescer::new(config.debounce());
        let refresher = Refresher::new(Loader::new(store.clone()), cache.clone(), coalescer.clone());
        let executor = MutationExecutor::new(cache.clone(), notifier.clone());
        let reconciler = Arc::new(Reconciler::new(cache.clone(), coalescer.clone(), notifier.clone()));
        let reorder = ReorderManager::new(cache.clone(), store.clone(), refresher.clone(), notifier.clone());

        let mut tasks = Vec::new();
        if let Some(requests) = cache.take_refetch_rx() {
            tasks.push(tokio::spawn(refresher.clone().run(requests)));
        }
        debug!(debounce_ms = config.debounce_ms, "sync engine created");

        Self {
            inner: Arc::new(Inner {
                config,
                store,
                cache,
                notifier,
                coalescer,
                executor,
                refresher,
                reconciler,
                reorder,
                tasks: Mutex::new(tasks),
                realtime: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &SharedEntityCache {
        &self.inner.cache
    }

    /// Toast side channel.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.inner.notifier.subscribe()
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Cached entry for `key`, stale or not. Never blocks on the network.
    pub fn read(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.inner.cache.get(key)
    }

    /// Watch `key`. While the subscription lives, invalidating the key
    /// triggers a background refetch.
    pub fn subscribe(&self, key: CacheKey) -> CacheSubscription {
        self.inner.cache.subscribe(key)
    }

    /// Fetch `key` from the store into the cache and return the fresh value.
    pub async fn load(&self, key: CacheKey) -> Result<CachedValue, SyncError> {
        self.ensure_open()?;
        self.inner.refresher.refetch(key).await?;
        self.inner.cache.value(&key).ok_or(SyncError::NotCached(key))
    }

    /// The cached value if fresh, otherwise a load.
    pub async fn read_or_load(&self, key: CacheKey) -> Result<CachedValue, SyncError> {
        match self.inner.cache.get(&key) {
            Some(entry) if !entry.stale => Ok(entry.value),
            _ => self.load(key).await,
        }
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Edit one field of a row.
    ///
    /// The change is visible in every cached copy of the row immediately. The
    /// write goes out once the field has been idle for the debounce window;
    /// a burst of edits produces one write carrying the last value. If that
    /// write fails the field is restored to its pre-burst value, unless a
    /// newer edit has replaced it in the meantime.
    pub fn edit(&self, entity: EntityRef, field: &str, value: Value) -> Result<(), SyncError> {
        self.ensure_open()?;
        if entity.table.is_append_only() {
            return Err(SyncError::AppendOnly(entity.table));
        }
        let inner = &self.inner;
        let fkey = FieldKey::new(entity.table, entity.id, field);
        let keys = inner.cache.keys_containing(entity.table, entity.id);

        // `None` means the field was absent from every cached copy.
        let base = original_field(&inner.cache, &keys, entity, field);

        let patch = field_row(field, value.clone());
        inner.executor.apply(&keys, |key, cached| {
            let mut next = cached.clone();
            if next.patch_row(key.table, entity.table, entity.id, &patch) {
                Change::Replace(next)
            } else {
                Change::Keep
            }
        });
        trace!(%fkey, keys = keys.len(), "edit applied optimistically");

        // The flush holds the engine alive until the write has landed.
        let owner = Arc::clone(&self.inner);
        let flush_key = fkey.clone();
        inner.coalescer.schedule_from(
            fkey,
            base,
            value,
            Box::new(move |value| Box::pin(async move { owner.flush_edit(flush_key, value).await })),
        );
        Ok(())
    }

    /// A guard for editing several fields of one row, as a form does.
    ///
    /// Dropping the guard (the form closing) writes its touched fields now
    /// instead of waiting out the debounce window.
    pub fn field_editor(&self, entity: EntityRef) -> FieldEditor {
        FieldEditor { engine: self.clone(), entity, touched: HashSet::new() }
    }

    /// Create a row. Returns the id the store assigned.
    ///
    /// The row shows up at once in every cached list it belongs to and in its
    /// parent's cached detail, under a temporary id that is swapped for the real one when the store answers.
    pub async fn create(&self, table: Table, fields: Row) -> Result<RowId, SyncError> {
        self.ensure_open()?;
        let temp_id = RowId::new();
        let mut row = fields.clone();
        row.insert("id".into(), temp_id.to_json());
        let mut targets = list_keys(table, &row);
        targets.extend(parent_detail_keys(table, &row));

        let store = self.inner.store.clone();
        let id = self
            .inner
            .executor
            .create(table, row.clone(), &targets, move || async move { store.create(table, fields).await })
            .await?;

        row.insert("id".into(), id.to_json());
        self.inner.executor.refresh_derived(&derived_keys(table, &row));
        info!(%table, %id, "row created");
        Ok(id)
    }

    /// Delete a row.
    ///
    /// It disappears from cached lists and its detail entry is dropped right
    /// away; pending edits to it are discarded. On failure all of that is put
    /// back.
    pub async fn remove(&self, entity: EntityRef) -> Result<(), SyncError> {
        self.ensure_open()?;
        let EntityRef { table, id } = entity;
        if table.is_append_only() {
            return Err(SyncError::AppendOnly(table));
        }
        let inner = &self.inner;
        let cancelled = inner.coalescer.cancel_entity(id);

        let keys = inner.cache.keys_containing(table, id);
        let known = keys
            .iter()
            .find_map(|key| inner.cache.value(key)?.find_row(key.table, table, id).cloned());

        let store = inner.store.clone();
        inner
            .executor
            .mutate_many(
                &format!("delete {table}"),
                &keys,
                |key, cached| {
                    let mut next = cached.clone();
                    match next.remove_row(key.table, table, id) {
                        Removal::NotFound => Change::Keep,
                        Removal::Pruned => Change::Replace(next),
                        Removal::WholeRecord => Change::Remove,
                    }
                },
                move || async move { store.delete(table, id).await },
            )
            .await?;

        if let Some(row) = known {
            inner.executor.refresh_derived(&derived_keys(table, &row));
        }
        info!(%table, %id, cancelled, "row deleted");
        Ok(())
    }

    /// Put the rows of an ordered collection in `order` and persist it.
    pub async fn reorder(&self, key: CacheKey, order: &[RowId]) -> Result<ReorderOutcome, SyncError> {
        self.ensure_open()?;
        self.inner.reorder.reorder(key, order).await
    }

    // ========================================================================
    // Realtime and presence
    // ========================================================================

    /// Subscribe to every table's change stream. Calling it again is a no-op.
    pub fn start_realtime(&self) -> Result<(), SyncError> {
        self.ensure_open()?;
        if self.inner.realtime.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let handles = self.inner.reconciler.spawn(&self.inner.store);
        info!(tables = handles.len(), "realtime reconciliation started");
        self.inner.tasks.lock().extend(handles);
        Ok(())
    }

    /// Reconcile one event by hand, for transports that deliver events to
    /// the UI layer rather than through [`BackingStore::subscribe`](crate::store::BackingStore::subscribe).
    pub fn apply_event(&self, event: &ChangeEvent) -> ReconcileReport {
        self.inner.reconciler.apply(event)
    }

    /// Join the shared presence channel as `me`.
    pub async fn join_presence(
        &self,
        transport: SharedPresence,
        me: PresenceMember,
    ) -> Result<PresenceTracker, SyncError> {
        self.ensure_open()?;
        let tracker =
            PresenceTracker::join(transport, PRESENCE_CHANNEL, me, self.inner.config.presence_coalesce())
                .await?;
        Ok(tracker)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Field edits not yet written.
    pub fn pending_edits(&self) -> usize {
        self.inner.coalescer.pending_count()
    }

    /// Write every pending edit now and wait for the writes to finish.
    pub async fn flush_edits(&self) {
        self.inner.coalescer.drain().await;
    }

    /// Flush pending edits and stop background tasks.
    ///
    /// Later mutations fail with [`SyncError::Shutdown`]; cached reads keep
    /// working.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.coalescer.drain().await;
        let tasks: Vec<JoinHandle<()>> = self.inner.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!(tasks = tasks.len(), "sync engine shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.is_shut_down() { Err(SyncError::Shutdown) } else { Ok(()) }
    }
}

impl Inner {
    /// Write the coalesced value of one field.
    async fn flush_edit(&self, key: FieldKey, value: Value) {
        // Edits arriving from here on start a new burst with a new base.
        let base = self.coalescer.take_base(&key);
        let FieldKey { table, id, field } = key;

        match self.store.write(table, id, field_row(&field, value.clone())).await {
            Ok(()) => {
                debug!(%table, %id, %field, "edit flushed");
                let row = self
                    .cache
                    .keys_containing(table, id)
                    .into_iter()
                    .find_map(|k| self.cache.value(&k)?.find_row(k.table, table, id).cloned());
                if let Some(row) = row {
                    self.executor.refresh_derived(&derived_keys(table, &row));
                }
            }
            Err(err) => {
                let restored = self.executor.rollback_field(table, id, &field, &value, base.as_ref());
                warn!(%table, %id, %field, error = %err, restored, "edit failed, rolled back");
                self.executor.fail(&format!("edit {table}.{field}"), &err);
            }
        }
    }
}

/// First value of `field` found in any cached copy of the row.
fn original_field(
    cache: &EntityCache,
    keys: &[CacheKey],
    entity: EntityRef,
    field: &str,
) -> Option<Value> {
    keys.iter().find_map(|key| {
        cache
            .value(key)?
            .find_row(key.table, entity.table, entity.id)?
            .get(field)
            .cloned()
    })
}

/// Edits several fields of one row; flushes them when dropped.
pub struct FieldEditor {
    engine: SyncEngine,
    entity: EntityRef,
    touched: HashSet<String>,
}

impl FieldEditor {
    pub fn entity(&self) -> EntityRef {
        self.entity
    }

    pub fn set(&mut self, field: &str, value: Value) -> Result<(), SyncError> {
        self.engine.edit(self.entity, field, value)?;
        self.touched.insert(field.to_string());
        Ok(())
    }

    /// Write touched fields without waiting for the window.
    pub fn commit(&mut self) {
        for field in self.touched.drain() {
            self.engine
                .inner
                .coalescer
                .flush(&FieldKey::new(self.entity.table, self.entity.id, field));
        }
    }
}

impl Drop for FieldEditor {
    fn drop(&mut self) {
        self.commit();
    }
}
