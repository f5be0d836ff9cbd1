//! Drag-and-drop reordering of dense-ordered collections.
//!
//! The cached list is rewritten first, so the UI moves with zero latency.
//! Then every row gets its new zero-based index written. If the store can
//! batch writes in a transaction it does so in one call; otherwise the writes
//! go out independently. Either way a failure is not rolled back piecemeal:
//! the collection is marked stale and refetched, and the store's order wins.

use futures::future::join_all;
use indexmap::IndexSet;
use roadmap_types::{CacheKey, Row, RowExt, RowId, field_row};
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, warn};

use crate::cache::SharedEntityCache;
use crate::error::SyncError;
use crate::loader::Refresher;
use crate::notices::{Notice, Notifier};
use crate::routes::derived_keys;
use crate::store::SharedStore;
use crate::value::CachedValue;

/// Result of one reorder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReorderOutcome {
    /// Position writes the store accepted.
    pub written: usize,
    pub failed: usize,
    /// The collection was refetched after a failure. When a failure's
    /// refetch fails too, this is `false` and the key is left stale.
    pub resynced: bool,
}

pub struct ReorderManager {
    cache: SharedEntityCache,
    store: SharedStore,
    refresher: Refresher,
    notifier: Notifier,
}

impl ReorderManager {
    pub fn new(cache: SharedEntityCache, store: SharedStore, refresher: Refresher, notifier: Notifier) -> Self {
        Self { cache, store, refresher, notifier }
    }

    /// Put the rows of `key` in `order` and persist dense indices.
    ///
    /// `order` must be a permutation of the cached rows' ids.
    pub async fn reorder(&self, key: CacheKey, order: &[RowId]) -> Result<ReorderOutcome, SyncError> {
        let field = match key.table.order_field() {
            Some(field) if key.is_orderable() => field,
            _ => return Err(SyncError::NotOrderable(key)),
        };
        let current = self.cache.value(&key).ok_or(SyncError::NotCached(key))?;
        let rows = current.as_rows().ok_or(SyncError::NotAList(key))?;
        let reordered = permute(key, rows, order, field)?;
        let table = key.table;

        // Optimistic: the list, then any other cached copy of the rows.
        self.cache.patch(&key, |_| Some(CachedValue::Rows(reordered.clone())));
        let mut others = IndexSet::new();
        for id in order {
            others.extend(self.cache.keys_containing(table, *id).into_iter().filter(|k| *k != key));
        }
        for other in others {
            self.cache.patch(&other, |value| {
                let mut next = value.clone();
                let mut touched = false;
                for (index, id) in order.iter().enumerate() {
                    touched |= next.patch_row(other.table, table, *id, &field_row(field, json!(index)));
                }
                next.sort_rows(other.table, table, field);
                touched.then_some(next)
            });
        }

        let writes: Vec<(RowId, Row)> = order
            .iter()
            .enumerate()
            .map(|(index, id)| (*id, field_row(field, json!(index))))
            .collect();
        let total = writes.len();

        let (written, failed) = if self.store.supports_transactions() {
            match self.store.write_batch(table, writes).await {
                Ok(()) => (total, 0),
                Err(err) => {
                    warn!(%key, error = %err, "reorder batch failed");
                    (0, total)
                }
            }
        } else {
            let results = join_all(
                writes
                    .into_iter()
                    .map(|(id, fields)| self.store.write(table, id, fields)),
            )
            .await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            for err in results.iter().filter_map(|r| r.as_ref().err()) {
                debug!(%key, error = %err, "position write failed");
            }
            (total - failed, failed)
        };

        if failed > 0 {
            warn!(%key, failed, total, "reorder partially failed, refetching collection");
            self.notifier.publish(Notice::ReorderInconsistent { key, failed });
            // Stale until a refetch succeeds; a failed one is logged there.
            self.cache.invalidate(&key);
            let resynced = self.refresher.refetch(key).await.is_ok();
            return Ok(ReorderOutcome { written, failed, resynced });
        }

        for row in &reordered {
            for derived in derived_keys(table, row) {
                self.cache.invalidate(&derived);
            }
        }
        debug!(%key, written, "reorder persisted");
        Ok(ReorderOutcome { written, failed: 0, resynced: false })
    }
}

/// Rows in `order`, each carrying its new dense index.
fn permute(key: CacheKey, rows: &[Row], order: &[RowId], field: &str) -> Result<Vec<Row>, SyncError> {
    let distinct: HashSet<RowId> = order.iter().copied().collect();
    let invalid = || SyncError::InvalidPermutation { key, expected: rows.len(), got: distinct.len() };
    if distinct.len() != order.len() || order.len() != rows.len() {
        return Err(invalid());
    }
    order
        .iter()
        .enumerate()
        .map(|(index, id)| {
            let mut row = rows.iter().find(|r| r.id() == Some(*id)).cloned().ok_or_else(|| invalid())?;
            row.insert(field.to_string(), json!(index));
            Ok(row)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::coalescer::WriteCoalescer;
    use crate::loader::Loader;
    use crate::memory::MemoryStore;
    use roadmap_types::{Table, row_from};
    use std::sync::Arc;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        cache: SharedEntityCache,
        notifier: Notifier,
        manager: ReorderManager,
    }

    fn fixture(store: MemoryStore) -> Fixture {
        let store = Arc::new(store);
        let shared: SharedStore = store.clone();
        let cache = EntityCache::shared(64, true);
        let notifier = Notifier::new(16);
        let refresher = Refresher::new(
            Loader::new(shared.clone()),
            cache.clone(),
            WriteCoalescer::new(Duration::from_millis(500)),
        );
        let manager = ReorderManager::new(cache.clone(), shared, refresher, notifier.clone());
        Fixture { store, cache, notifier, manager }
    }

    /// Seed tasks a, b, c with display_order 0, 1, 2 and cache the list.
    fn seed_abc(f: &Fixture) -> [RowId; 3] {
        let ids = [0, 1, 2].map(|i| f.store.seed(Table::Tasks, row_from(json!({"display_order": i}))));
        f.cache.set(CacheKey::tasks(), CachedValue::Rows(f.store.rows(Table::Tasks)));
        ids
    }

    fn indices(f: &Fixture) -> Vec<(RowId, i64)> {
        f.cache
            .value(&CacheKey::tasks())
            .unwrap()
            .as_rows()
            .unwrap()
            .iter()
            .map(|r| (r.id().unwrap(), r.int("display_order").unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_dense_reorder() {
        let f = fixture(MemoryStore::new());
        let [a, b, c] = seed_abc(&f);
        let outcome = f.manager.reorder(CacheKey::tasks(), &[c, a, b]).await.unwrap();
        assert_eq!(outcome, ReorderOutcome { written: 3, failed: 0, resynced: false });
        assert_eq!(indices(&f), vec![(c, 0), (a, 1), (b, 2)]);
        assert_eq!(f.store.row(Table::Tasks, c).unwrap()["display_order"], json!(0));
    }

    #[tokio::test]
    async fn test_partial_failure_refetches() {
        let f = fixture(MemoryStore::new());
        let mut notices = f.notifier.subscribe();
        let [a, b, c] = seed_abc(&f);
        f.store.fail_writes_to(a);

        let outcome = f.manager.reorder(CacheKey::tasks(), &[c, a, b]).await.unwrap();
        assert_eq!(outcome.failed, 1);
        assert!(outcome.resynced);
        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::ReorderInconsistent { key: CacheKey::tasks(), failed: 1 }
        );
        // The store has c:0, a:0 (unchanged), b:2; the cache mirrors the store.
        let mut stored: Vec<(RowId, i64)> = f
            .store
            .rows(Table::Tasks)
            .iter()
            .map(|r| (r.id().unwrap(), r.int("display_order").unwrap()))
            .collect();
        stored.sort_by_key(|(_, i)| *i);
        let mut cached = indices(&f);
        cached.sort_by_key(|(_, i)| *i);
        assert_eq!(cached.len(), 3);
        assert_eq!(
            cached.iter().map(|(_, i)| *i).collect::<Vec<_>>(),
            stored.iter().map(|(_, i)| *i).collect::<Vec<_>>()
        );
        assert!(!f.cache.is_stale(&CacheKey::tasks()));
    }

    #[tokio::test]
    async fn test_failed_resync_leaves_key_stale() {
        let f = fixture(MemoryStore::new());
        let [a, b, c] = seed_abc(&f);
        f.store.fail_writes_to(a);
        f.store.fail_next_reads(1);

        let outcome = f.manager.reorder(CacheKey::tasks(), &[c, a, b]).await.unwrap();
        assert_eq!(outcome, ReorderOutcome { written: 2, failed: 1, resynced: false });
        assert!(f.cache.is_stale(&CacheKey::tasks()));
    }

    #[tokio::test]
    async fn test_nested_copies_follow_new_order() {
        let f = fixture(MemoryStore::new());
        let initiative = f.store.seed(Table::Initiatives, row_from(json!({"name": "Search"})));
        let parent = json!(initiative.to_string());
        let [a, b, c] = [0, 1, 2].map(|i| {
            f.store.seed(Table::ReleasePlans, row_from(json!({"initiative_id": parent, "order_index": i})))
        });
        let list = CacheKey::release_plans(initiative);
        f.cache.set(list, CachedValue::Rows(f.store.rows(Table::ReleasePlans)));
        let mut detail = f.store.row(Table::Initiatives, initiative).unwrap();
        let nested: Vec<serde_json::Value> =
            f.store.rows(Table::ReleasePlans).into_iter().map(serde_json::Value::Object).collect();
        detail.insert("release_plans".into(), serde_json::Value::Array(nested));
        let detail_key = CacheKey::initiative_detail(initiative);
        f.cache.set(detail_key, CachedValue::Record(detail));

        f.manager.reorder(list, &[c, a, b]).await.unwrap();

        let cached = f.cache.value(&detail_key).unwrap();
        let ids: Vec<Option<RowId>> = cached.as_record().unwrap()["release_plans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().and_then(RowExt::id))
            .collect();
        assert_eq!(ids, vec![Some(c), Some(a), Some(b)]);
    }

    #[tokio::test]
    async fn test_transactional_store_uses_one_batch() {
        let f = fixture(MemoryStore::new().transactional());
        let [a, b, c] = seed_abc(&f);
        f.store.fail_writes_to(b);

        let outcome = f.manager.reorder(CacheKey::tasks(), &[c, a, b]).await.unwrap();
        assert_eq!(outcome, ReorderOutcome { written: 0, failed: 3, resynced: true });
        // Nothing was applied, so the refetch restores the original order.
        assert_eq!(indices(&f), vec![(a, 0), (b, 1), (c, 2)]);
    }

    #[tokio::test]
    async fn test_rejects_non_permutation() {
        let f = fixture(MemoryStore::new());
        let [a, b, _] = seed_abc(&f);
        let err = f.manager.reorder(CacheKey::tasks(), &[a, b]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPermutation { expected: 3, got: 2, .. }));
        let err = f.manager.reorder(CacheKey::tasks(), &[a, b, b]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPermutation { .. }));
        let err = f.manager.reorder(CacheKey::tasks(), &[a, b, RowId::new()]).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidPermutation { .. }));
        assert!(f.store.writes().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_unorderable_and_uncached() {
        let f = fixture(MemoryStore::new());
        let err = f.manager.reorder(CacheKey::dashboard_timeline(), &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::NotOrderable(_)));
        let err = f.manager.reorder(CacheKey::initiatives(), &[]).await.unwrap_err();
        assert!(matches!(err, SyncError::NotCached(_)));
    }
}
