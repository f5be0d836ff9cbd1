//! The entity cache: the single shared mutable resource of the engine.
//!
//! Keyed by [`CacheKey`], each entry holds the latest locally known value for
//! one query together with a stale flag. Staleness is event-driven; entries
//! have no TTL.
//!
//! # Concurrency Model
//!
//! - DashMap for per-key access; reads never wait on the network
//! - A broadcast of [`CacheEvent`]s drives re-rendering
//! - Invalidating a key somebody is watching queues it on the refetch channel,
//!   which the [`Refresher`](crate::loader::Refresher) drains

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use roadmap_types::{CacheKey, RowId, Table, View};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace};

use crate::value::CachedValue;

/// Shared handle to an [`EntityCache`].
pub type SharedEntityCache = Arc<EntityCache>;

/// A cache entry as seen by readers.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub value: CachedValue,
    /// Marked by `invalidate`, cleared by the next `set`.
    pub stale: bool,
    /// Bumped on every change; unique across the cache.
    pub version: u64,
}

/// Change notifications for subscribers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheEvent {
    Updated { key: CacheKey, version: u64 },
    Invalidated { key: CacheKey },
    Removed { key: CacheKey },
}

impl CacheEvent {
    pub fn key(&self) -> CacheKey {
        match self {
            CacheEvent::Updated { key, .. }
            | CacheEvent::Invalidated { key }
            | CacheEvent::Removed { key } => *key,
        }
    }
}

/// In-memory keyed store of query results.
pub struct EntityCache {
    entries: DashMap<CacheKey, CacheEntry>,
    /// Live subscription count per key.
    watchers: DashMap<CacheKey, usize>,
    event_tx: broadcast::Sender<CacheEvent>,
    refetch_tx: mpsc::UnboundedSender<CacheKey>,
    /// Taken once by whoever serves refetches.
    refetch_rx: Mutex<Option<mpsc::UnboundedReceiver<CacheKey>>>,
    refetch_displayed: bool,
    next_version: AtomicU64,
}

impl EntityCache {
    pub fn new(event_buffer: usize, refetch_displayed: bool) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        let (refetch_tx, refetch_rx) = mpsc::unbounded_channel();
        Self {
            entries: DashMap::new(),
            watchers: DashMap::new(),
            event_tx,
            refetch_tx,
            refetch_rx: Mutex::new(Some(refetch_rx)),
            refetch_displayed,
            next_version: AtomicU64::new(1),
        }
    }

    /// Create a cache wrapped for sharing.
    pub fn shared(event_buffer: usize, refetch_displayed: bool) -> SharedEntityCache {
        Arc::new(Self::new(event_buffer, refetch_displayed))
    }

    fn bump(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: CacheEvent) {
        // No receivers is the normal state before the UI subscribes.
        let _ = self.event_tx.send(event);
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Latest known entry for `key`.
    pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Latest known value for `key`, ignoring staleness.
    pub fn value(&self, key: &CacheKey) -> Option<CachedValue> {
        self.entries.get(key).map(|e| e.value.clone())
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries.get(key).is_some_and(|e| e.stale)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<CacheKey> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    /// Keys whose value holds the row `table#id`, top-level or nested.
    pub fn keys_containing(&self, table: Table, id: RowId) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|e| e.value.contains_row(e.key().table, table, id))
            .map(|e| *e.key())
            .collect()
    }

    /// Cached keys of a given table and view, whatever their scope.
    pub fn keys_matching(&self, table: Table, view: View) -> Vec<CacheKey> {
        self.entries
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.table == table && k.view == view)
            .collect()
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Store a fresh value, clearing the stale flag.
    pub fn set(&self, key: CacheKey, value: CachedValue) -> u64 {
        let version = self.bump();
        self.entries.insert(key, CacheEntry { value, stale: false, version });
        trace!(%key, version, "cache set");
        self.emit(CacheEvent::Updated { key, version });
        version
    }

    /// Apply a pure update to the value at `key`.
    ///
    /// The updater returns `None` to leave the value alone. An absent key is a
    /// no-op: nothing is displayed yet and the eventual fetch populates it.
    /// Returns whether the value changed.
    pub fn patch<F>(&self, key: &CacheKey, updater: F) -> bool
    where
        F: FnOnce(&CachedValue) -> Option<CachedValue>,
    {
        let version = {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return false;
            };
            let Some(next) = updater(&entry.value) else {
                return false;
            };
            if next == entry.value {
                return false;
            }
            let version = self.bump();
            entry.value = next;
            entry.version = version;
            version
        };
        trace!(%key, version, "cache patch");
        self.emit(CacheEvent::Updated { key: *key, version });
        true
    }

    /// Mark `key` stale and queue a refetch if anyone is watching it.
    ///
    /// Invalidating an absent or already-stale key is a no-op, so repeated
    /// invalidation from overlapping events is harmless. Returns whether the
    /// key transitioned to stale.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        {
            let Some(mut entry) = self.entries.get_mut(key) else {
                return false;
            };
            if entry.stale {
                return false;
            }
            entry.stale = true;
        }
        debug!(%key, "cache invalidate");
        self.emit(CacheEvent::Invalidated { key: *key });
        if self.refetch_displayed && self.is_watched(key) {
            self.request_refetch(*key);
        }
        true
    }

    /// Queue `key` for a background refetch regardless of watchers.
    pub fn request_refetch(&self, key: CacheKey) {
        if self.refetch_tx.send(key).is_err() {
            trace!(%key, "refetch dropped: no refresher");
        }
    }

    /// Drop the entry at `key`.
    pub fn remove(&self, key: &CacheKey) -> Option<CachedValue> {
        let removed = self.entries.remove(key).map(|(_, e)| e.value);
        if removed.is_some() {
            debug!(%key, "cache remove");
            self.emit(CacheEvent::Removed { key: *key });
        }
        removed
    }

    /// Compare-and-swap on one entry.
    ///
    /// Replaces the value at `key` with `value` (or removes the entry when
    /// `value` is `None`) only if the current value equals `expected`, where
    /// `None` means "absent". The stale flag is left as it was.
    pub(crate) fn swap_if(
        &self,
        key: CacheKey,
        expected: Option<&CachedValue>,
        value: Option<CachedValue>,
    ) -> bool {
        use dashmap::mapref::entry::Entry;
        let event = match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                if expected != Some(&occupied.get().value) {
                    return false;
                }
                match value {
                    Some(value) => {
                        let version = self.bump();
                        let entry = occupied.get_mut();
                        entry.value = value;
                        entry.version = version;
                        CacheEvent::Updated { key, version }
                    }
                    None => {
                        occupied.remove();
                        CacheEvent::Removed { key }
                    }
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return false;
                }
                let Some(value) = value else {
                    return true;
                };
                let version = self.bump();
                vacant.insert(CacheEntry { value, stale: false, version });
                CacheEvent::Updated { key, version }
            }
        };
        self.emit(event);
        true
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Watch `key` for changes. Watching also makes invalidations of the key
    /// trigger a refetch.
    pub fn subscribe(self: &Arc<Self>, key: CacheKey) -> CacheSubscription {
        *self.watchers.entry(key).or_insert(0) += 1;
        CacheSubscription { key, rx: self.event_tx.subscribe(), cache: Arc::clone(self) }
    }

    /// Every cache event, unfiltered.
    pub fn events(&self) -> broadcast::Receiver<CacheEvent> {
        self.event_tx.subscribe()
    }

    pub fn is_watched(&self, key: &CacheKey) -> bool {
        self.watchers.get(key).is_some_and(|n| *n > 0)
    }

    /// Take the refetch request receiver. Only the first caller gets it.
    pub fn take_refetch_rx(&self) -> Option<mpsc::UnboundedReceiver<CacheKey>> {
        self.refetch_rx.lock().take()
    }

    fn unwatch(&self, key: &CacheKey) {
        use dashmap::mapref::entry::Entry;
        if let Entry::Occupied(mut entry) = self.watchers.entry(*key) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

/// A live watch on one cache key. Dropping it stops the watch.
pub struct CacheSubscription {
    key: CacheKey,
    rx: broadcast::Receiver<CacheEvent>,
    cache: SharedEntityCache,
}

impl CacheSubscription {
    pub fn key(&self) -> CacheKey {
        self.key
    }

    /// Current entry of the watched key.
    pub fn current(&self) -> Option<CacheEntry> {
        self.cache.get(&self.key)
    }

    /// Next event for the watched key. `None` once the cache is gone.
    ///
    /// If the subscriber fell behind, a synthetic `Updated` carrying the
    /// current version is returned so the caller re-reads.
    pub async fn recv(&mut self) -> Option<CacheEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.key() == self.key => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!(key = %self.key, missed = n, "cache subscriber lagged");
                    let version = self.cache.get(&self.key).map(|e| e.version).unwrap_or(0);
                    return Some(CacheEvent::Updated { key: self.key, version });
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for CacheSubscription {
    fn drop(&mut self) {
        self.cache.unwatch(&self.key);
    }
}

impl std::fmt::Debug for CacheSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSubscription").field("key", &self.key).finish()
    }
}
