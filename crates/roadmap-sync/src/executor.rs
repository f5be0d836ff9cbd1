//! Optimistic mutations.
//!
//! The executor applies a change to the cache before the network write,
//! then either keeps it (success) or puts the captured snapshot back
//! (failure) and publishes a [`Notice::MutationFailed`].
//!
//! Rollback is guarded: a snapshot is restored only if the entry still holds
//! the value this mutation produced. If something newer has landed since,
//! that newer value owns the entry and the rollback for that key is skipped.
//! Overlapping mutations are not serialized.

use std::future::Future;

use roadmap_types::{CacheKey, Row, RowExt, RowId, Table, field_row};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::SharedEntityCache;
use crate::error::StoreError;
use crate::notices::{Notice, Notifier};
use crate::value::{CachedValue, Removal};

/// What an optimistic update does to one cached value.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Keep,
    Replace(CachedValue),
    Remove,
}

/// One key's value before and after an optimistic update.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub key: CacheKey,
    pub before: Option<CachedValue>,
    pub after: Option<CachedValue>,
}

/// CAS retries before an optimistic update gives up on a contended key.
const MAX_APPLY_ATTEMPTS: usize = 8;

pub struct MutationExecutor {
    cache: SharedEntityCache,
    notifier: Notifier,
}

impl MutationExecutor {
    pub fn new(cache: SharedEntityCache, notifier: Notifier) -> Self {
        Self { cache, notifier }
    }

    pub fn cache(&self) -> &SharedEntityCache {
        &self.cache
    }

    /// Apply `change` to each cached key and capture what it replaced.
    ///
    /// Absent keys are skipped. Keys the change leaves untouched produce no
    /// snapshot.
    pub fn apply<F>(&self, keys: &[CacheKey], change: F) -> Vec<Snapshot>
    where
        F: Fn(&CacheKey, &CachedValue) -> Change,
    {
        let mut snapshots = Vec::new();
        for key in keys {
            for _ in 0..MAX_APPLY_ATTEMPTS {
                let Some(before) = self.cache.value(key) else {
                    break;
                };
                let after = match change(key, &before) {
                    Change::Keep => break,
                    Change::Replace(value) if value == before => break,
                    Change::Replace(value) => Some(value),
                    Change::Remove => None,
                };
                if self.cache.swap_if(*key, Some(&before), after.clone()) {
                    snapshots.push(Snapshot { key: *key, before: Some(before), after });
                    break;
                }
            }
        }
        snapshots
    }

    /// Restore snapshots whose keys still hold this mutation's value.
    ///
    /// Returns the number of keys restored.
    pub fn rollback(&self, snapshots: &[Snapshot]) -> usize {
        let mut restored = 0;
        for snap in snapshots.iter().rev() {
            if self.cache.swap_if(snap.key, snap.after.as_ref(), snap.before.clone()) {
                restored += 1;
            } else {
                debug!(key = %snap.key, "rollback skipped: entry superseded");
            }
        }
        restored
    }

    /// Put a field back to `original` wherever it still reads `attempted`.
    ///
    /// Used for coalesced edits, where the snapshot is per field rather than
    /// per key so that unrelated edits to the same row survive.
    pub fn rollback_field(
        &self,
        table: Table,
        id: RowId,
        field: &str,
        attempted: &Value,
        original: Option<&Value>,
    ) -> usize {
        let keys = self.cache.keys_containing(table, id);
        let snapshots = self.apply(&keys, |key, value| {
            let Some(row) = value.find_row(key.table, table, id) else {
                return Change::Keep;
            };
            if row.get(field) != Some(attempted) {
                return Change::Keep;
            }
            let mut next = value.clone();
            match original {
                Some(original) => {
                    next.patch_row(key.table, table, id, &field_row(field, original.clone()));
                }
                None => {
                    strip_field(&mut next, key.table, table, id, field);
                }
            }
            Change::Replace(next)
        });
        snapshots.len()
    }

    /// Run `write` after optimistically applying `change` to `keys`.
    ///
    /// On failure the snapshots are rolled back and a notice is published.
    pub async fn mutate_many<F, W, Fut, T>(
        &self,
        what: &str,
        keys: &[CacheKey],
        change: F,
        write: W,
    ) -> Result<T, StoreError>
    where
        F: Fn(&CacheKey, &CachedValue) -> Change,
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let snapshots = self.apply(keys, change);
        match write().await {
            Ok(out) => Ok(out),
            Err(err) => {
                let restored = self.rollback(&snapshots);
                warn!(what, error = %err, restored, "mutation failed, rolled back");
                self.fail(what, &err);
                Err(err)
            }
        }
    }

    /// Single-key form of [`mutate_many`](Self::mutate_many).
    pub async fn mutate<F, W, Fut, T>(
        &self,
        what: &str,
        key: CacheKey,
        change: F,
        write: W,
    ) -> Result<T, StoreError>
    where
        F: Fn(&CacheKey, &CachedValue) -> Change,
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.mutate_many(what, &[key], change, write).await
    }

    /// Create a row under a temporary id, then rekey it to the server's.
    ///
    /// `row` must carry the temporary id. It is inserted into every cached
    /// list in `targets` and nested into every cached composite record there;
    /// on failure it is pruned from wherever it ended up.
    pub async fn create<W, Fut>(
        &self,
        table: Table,
        row: Row,
        targets: &[CacheKey],
        write: W,
    ) -> Result<RowId, StoreError>
    where
        W: FnOnce() -> Fut,
        Fut: Future<Output = Result<RowId, StoreError>>,
    {
        let Some(temp_id) = row.id() else {
            return Err(StoreError::Rejected("create without a temporary id".into()));
        };
        let order = table.order_field();
        self.apply(targets, |key, value| {
            let mut next = value.clone();
            if next.insert_row(key.table, table, &row, order) { Change::Replace(next) } else { Change::Keep }
        });

        match write().await {
            Ok(server_id) => {
                let keys = self.cache.keys_containing(table, temp_id);
                for key in &keys {
                    self.cache.patch(key, |value| {
                        let mut next = value.clone();
                        next.rekey_row(key.table, table, temp_id, server_id).then_some(next)
                    });
                }
                debug!(%table, temp = %temp_id, id = %server_id, keys = keys.len(), "create confirmed");
                Ok(server_id)
            }
            Err(err) => {
                let keys = self.cache.keys_containing(table, temp_id);
                self.prune(table, temp_id, &keys);
                warn!(%table, error = %err, "create failed, speculative row removed");
                self.fail(&format!("create {table}"), &err);
                Err(err)
            }
        }
    }

    /// Remove a row from list-shaped and nested entries in `keys`.
    pub fn prune(&self, table: Table, id: RowId, keys: &[CacheKey]) -> usize {
        self.apply(keys, |key, value| {
            let mut next = value.clone();
            match next.remove_row(key.table, table, id) {
                Removal::NotFound | Removal::WholeRecord => Change::Keep,
                Removal::Pruned => Change::Replace(next),
            }
        })
        .len()
    }

    /// Mark keys that aggregate over a confirmed write for refetch.
    pub fn refresh_derived(&self, keys: &[CacheKey]) {
        for key in keys {
            self.cache.invalidate(key);
        }
    }

    pub(crate) fn fail(&self, what: &str, err: &StoreError) {
        self.notifier.publish(Notice::MutationFailed {
            what: what.to_string(),
            message: err.to_string(),
        });
    }
}

fn strip_field(value: &mut CachedValue, own: Table, table: Table, id: RowId, field: &str) {
    match value {
        CachedValue::Rows(rows) if own == table => {
            if let Some(row) = rows.iter_mut().find(|r| r.id() == Some(id)) {
                row.remove(field);
            }
        }
        CachedValue::Record(row) if own == table && row.id() == Some(id) => {
            row.remove(field);
        }
        // Nested rows always come back from the store with every column.
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use roadmap_types::row_from;
    use serde_json::json;

    fn setup() -> (MutationExecutor, SharedEntityCache, Notifier) {
        let cache = EntityCache::shared(64, true);
        let notifier = Notifier::new(16);
        (MutationExecutor::new(cache.clone(), notifier.clone()), cache, notifier)
    }

    fn task(id: RowId, name: &str) -> Row {
        row_from(json!({"id": id.to_string(), "name": name, "display_order": 0}))
    }

    fn rename(id: RowId, name: &'static str) -> impl Fn(&CacheKey, &CachedValue) -> Change {
        move |key, value| {
            let mut next = value.clone();
            if next.patch_row(key.table, Table::Tasks, id, &field_row("name", json!(name))) {
                Change::Replace(next)
            } else {
                Change::Keep
            }
        }
    }

    #[tokio::test]
    async fn test_success_keeps_optimistic_value() {
        let (exec, cache, _) = setup();
        let id = RowId::new();
        cache.set(CacheKey::tasks(), CachedValue::Rows(vec![task(id, "old")]));

        let out = exec
            .mutate("rename", CacheKey::tasks(), rename(id, "new"), || async { Ok::<_, StoreError>(7) })
            .await;
        assert_eq!(out, Ok(7));
        let value = cache.value(&CacheKey::tasks()).unwrap();
        assert_eq!(value.find_row(Table::Tasks, Table::Tasks, id).unwrap()["name"], json!("new"));
    }

    #[tokio::test]
    async fn test_failure_restores_snapshot_and_notifies() {
        let (exec, cache, notifier) = setup();
        let mut notices = notifier.subscribe();
        let id = RowId::new();
        let original = CachedValue::Rows(vec![task(id, "old")]);
        cache.set(CacheKey::tasks(), original.clone());

        let out: Result<(), _> = exec
            .mutate("rename", CacheKey::tasks(), rename(id, "new"), || async {
                Err(StoreError::Network("offline".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(cache.value(&CacheKey::tasks()), Some(original));
        assert!(matches!(notices.recv().await.unwrap(), Notice::MutationFailed { .. }));
    }

    #[test]
    fn test_rollback_skips_superseded_entry() {
        let (exec, cache, _) = setup();
        let id = RowId::new();
        cache.set(CacheKey::tasks(), CachedValue::Rows(vec![task(id, "old")]));

        let snaps = exec.apply(&[CacheKey::tasks()], rename(id, "mine"));
        exec.apply(&[CacheKey::tasks()], rename(id, "newer"));

        assert_eq!(exec.rollback(&snaps), 0);
        let value = cache.value(&CacheKey::tasks()).unwrap();
        assert_eq!(value.find_row(Table::Tasks, Table::Tasks, id).unwrap()["name"], json!("newer"));
    }

    #[test]
    fn test_apply_skips_absent_and_unchanged() {
        let (exec, cache, _) = setup();
        let id = RowId::new();
        cache.set(CacheKey::tasks(), CachedValue::Rows(vec![task(id, "same")]));
        let snaps = exec.apply(&[CacheKey::tasks(), CacheKey::initiatives()], rename(id, "same"));
        assert!(snaps.is_empty());
    }

    #[test]
    fn test_rollback_field_only_where_value_matches() {
        let (exec, cache, _) = setup();
        let id = RowId::new();
        cache.set(CacheKey::tasks(), CachedValue::Rows(vec![task(id, "typed")]));
        cache.set(CacheKey::task_detail(id), CachedValue::Record(task(id, "other")));

        let restored = exec.rollback_field(Table::Tasks, id, "name", &json!("typed"), Some(&json!("old")));
        assert_eq!(restored, 1);
        let list = cache.value(&CacheKey::tasks()).unwrap();
        assert_eq!(list.find_row(Table::Tasks, Table::Tasks, id).unwrap()["name"], json!("old"));
        let detail = cache.value(&CacheKey::task_detail(id)).unwrap();
        assert_eq!(detail.as_record().unwrap()["name"], json!("other"));
    }

    #[tokio::test]
    async fn test_create_rekeys_on_success() {
        let (exec, cache, _) = setup();
        cache.set(CacheKey::tasks(), CachedValue::Rows(Vec::new()));
        let temp = RowId::new();
        let server = RowId::new();

        let id = exec
            .create(Table::Tasks, task(temp, "fresh"), &[CacheKey::tasks()], || async move { Ok(server) })
            .await
            .unwrap();
        assert_eq!(id, server);
        assert_eq!(cache.value(&CacheKey::tasks()).unwrap().ids(), vec![server]);
    }

    #[tokio::test]
    async fn test_create_failure_prunes_temp_row() {
        let (exec, cache, _) = setup();
        let existing = RowId::new();
        cache.set(CacheKey::tasks(), CachedValue::Rows(vec![task(existing, "a")]));
        let temp = RowId::new();

        let out = exec
            .create(Table::Tasks, task(temp, "fresh"), &[CacheKey::tasks()], || async {
                Err(StoreError::Rejected("nope".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(cache.value(&CacheKey::tasks()).unwrap().ids(), vec![existing]);
    }

    #[tokio::test]
    async fn test_create_nests_into_parent_detail() {
        let (exec, cache, _) = setup();
        let initiative = RowId::new();
        let key = CacheKey::initiative_detail(initiative);
        let detail = row_from(json!({"id": initiative.to_string(), "name": "Search", "deliverables": []}));
        cache.set(key, CachedValue::Record(detail.clone()));
        let deliverable = |id: RowId| row_from(json!({"id": id.to_string(), "initiative_id": initiative.to_string()}));

        let server = RowId::new();
        let id = exec
            .create(Table::Deliverables, deliverable(RowId::new()), &[key], || async move { Ok(server) })
            .await
            .unwrap();
        assert_eq!(id, server);
        let value = cache.value(&key).unwrap();
        assert!(value.contains_row(Table::Initiatives, Table::Deliverables, server));
        assert_eq!(value.as_record().unwrap()["deliverables"].as_array().unwrap().len(), 1);

        cache.set(key, CachedValue::Record(detail.clone()));
        let out = exec
            .create(Table::Deliverables, deliverable(RowId::new()), &[key], || async {
                Err(StoreError::Rejected("nope".into()))
            })
            .await;
        assert!(out.is_err());
        assert_eq!(cache.value(&key), Some(CachedValue::Record(detail)));
    }

    #[test]
    fn test_remove_change_drops_entry_and_rolls_back() {
        let (exec, cache, _) = setup();
        let id = RowId::new();
        let key = CacheKey::task_detail(id);
        let record = CachedValue::Record(task(id, "x"));
        cache.set(key, record.clone());

        let snaps = exec.apply(&[key], |_, _| Change::Remove);
        assert!(!cache.contains(&key));
        assert_eq!(exec.rollback(&snaps), 1);
        assert_eq!(cache.value(&key), Some(record));
    }
}
