//! Turning cache keys into reads, and keeping displayed keys fresh.
//!
//! [`Loader`] knows which query backs each key. [`Refresher`] runs those
//! queries for keys that were invalidated while someone was watching them,
//! and for explicit loads.

use futures::future::try_join4;
use indexmap::IndexSet;
use roadmap_types::{
    CacheKey, Deliverable, DeliverableStatus, Entity, Row, RowExt, RowId, Table, View, field_row,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::SharedEntityCache;
use crate::coalescer::WriteCoalescer;
use crate::error::StoreError;
use crate::store::{Filter, SharedStore};
use crate::value::{CachedValue, sort_by_order};

/// Maps a [`CacheKey`] to the backing-store reads that produce its value.
#[derive(Clone)]
pub struct Loader {
    store: SharedStore,
}

impl Loader {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub async fn fetch(&self, key: &CacheKey) -> Result<CachedValue, StoreError> {
        match (key.table, key.view, key.scope) {
            (Table::Initiatives, View::Detail, Some(id)) => self.initiative_detail(id).await,
            (table, View::Detail, Some(id)) => {
                let row = self
                    .store
                    .read(table, &Filter::by_id(id))
                    .await?
                    .into_iter()
                    .next()
                    .ok_or(StoreError::NotFound { table, id })?;
                Ok(CachedValue::Record(row))
            }
            (table, View::List, scope) => {
                let filter = match (table.parent_field(), scope) {
                    (Some(field), Some(parent)) => Filter::eq(field, parent.to_json()),
                    // The backlog: epics with no release plan.
                    (Some(field), None) if table == Table::Epics => Filter::eq(field, Value::Null),
                    _ => Filter::all(),
                };
                let mut rows = self.store.read(table, &filter).await?;
                if let Some(order) = table.order_field() {
                    sort_by_order(&mut rows, order);
                }
                Ok(CachedValue::Rows(rows))
            }
            (Table::ReleasePlans, View::Timeline, None) => {
                let mut rows = self.store.read(Table::ReleasePlans, &Filter::all()).await?;
                rows.sort_by_key(|r| {
                    let start = r.get("dev_start").and_then(Value::as_str).map(str::to_owned);
                    (start, r.int("order_index").unwrap_or(i64::MAX))
                });
                Ok(CachedValue::Rows(rows))
            }
            (Table::Initiatives, View::Summary, None) => self.dashboard_summary().await,
            _ => Err(StoreError::Unsupported("cache key without a query")),
        }
    }

    /// Initiative row with its release plans, deliverables, and initial
    /// planning nested under columns named after their tables.
    async fn initiative_detail(&self, id: RowId) -> Result<CachedValue, StoreError> {
        let by_parent = Filter::eq("initiative_id", id.to_json());
        let (initiative, mut plans, deliverables, planning) = try_join4(
            self.store.read(Table::Initiatives, &Filter::by_id(id)),
            self.store.read(Table::ReleasePlans, &by_parent),
            self.store.read(Table::Deliverables, &by_parent),
            self.store.read(Table::InitialPlanning, &by_parent),
        )
        .await?;

        let mut record = initiative
            .into_iter()
            .next()
            .ok_or(StoreError::NotFound { table: Table::Initiatives, id })?;
        sort_by_order(&mut plans, "order_index");
        record.insert(Table::ReleasePlans.as_str().into(), rows_value(plans));
        record.insert(Table::Deliverables.as_str().into(), rows_value(deliverables));
        record.insert(
            Table::InitialPlanning.as_str().into(),
            planning.into_iter().next().map(Value::Object).unwrap_or(Value::Null),
        );
        Ok(CachedValue::Record(record))
    }

    /// One row per initiative with deliverable counts.
    async fn dashboard_summary(&self) -> Result<CachedValue, StoreError> {
        let (mut initiatives, deliverables) = futures::future::try_join(
            self.store.read(Table::Initiatives, &Filter::all()),
            self.store.read(Table::Deliverables, &Filter::all()),
        )
        .await?;
        sort_by_order(&mut initiatives, "order_index");
        let deliverables: Vec<Deliverable> = deliverables
            .iter()
            .filter_map(|row| match Deliverable::from_row(row) {
                Ok(deliverable) => Some(deliverable),
                Err(err) => {
                    warn!(error = %err, "skipping undecodable deliverable in summary");
                    None
                }
            })
            .collect();

        let rows = initiatives
            .into_iter()
            .map(|initiative| {
                let id = initiative.id();
                let owned: Vec<&Deliverable> = deliverables
                    .iter()
                    .filter(|d| Some(d.initiative_id) == id)
                    .collect();
                let done = owned
                    .iter()
                    .filter(|d| d.status == DeliverableStatus::Done)
                    .count();
                let mut row = Row::new();
                for column in ["id", "name", "status", "order_index"] {
                    if let Some(value) = initiative.get(column) {
                        row.insert(column.into(), value.clone());
                    }
                }
                row.insert("deliverables_total".into(), json!(owned.len()));
                row.insert("deliverables_done".into(), json!(done));
                row
            })
            .collect();
        Ok(CachedValue::Rows(rows))
    }
}

fn rows_value(rows: Vec<Row>) -> Value {
    Value::Array(rows.into_iter().map(Value::Object).collect())
}

/// Serves refetch requests and explicit loads.
#[derive(Clone)]
pub struct Refresher {
    loader: Loader,
    cache: SharedEntityCache,
    coalescer: WriteCoalescer,
}

impl Refresher {
    pub fn new(loader: Loader, cache: SharedEntityCache, coalescer: WriteCoalescer) -> Self {
        Self { loader, cache, coalescer }
    }

    /// Fetch `key` and store the result.
    ///
    /// Fields with a pending local edit keep the local value. Append-only
    /// collections keep entries already seen this session. On error the
    /// cached value (stale or not) is left alone.
    pub async fn refetch(&self, key: CacheKey) -> Result<(), StoreError> {
        let mut value = match self.loader.fetch(&key).await {
            Ok(value) => value,
            Err(err) => {
                warn!(%key, error = %err, "refetch failed, keeping cached value");
                return Err(err);
            }
        };
        if key.table.is_append_only() {
            if let Some(previous) = self.cache.value(&key) {
                value.union_with(&previous);
            }
        }
        self.overlay_pending(&key, &mut value);
        debug!(%key, "refetched");
        self.cache.set(key, value);
        Ok(())
    }

    /// Re-apply pending edits, including those to rows nested in a detail.
    fn overlay_pending(&self, key: &CacheKey, value: &mut CachedValue) {
        for (pending, latest) in self.coalescer.pending_all() {
            let patch = field_row(&pending.field, latest);
            value.patch_row(key.table, pending.table, pending.id, &patch);
        }
    }

    /// Serve refetch requests until the channel closes.
    ///
    /// Requests that pile up while a fetch is running are de-duplicated.
    pub async fn run(self, mut requests: mpsc::UnboundedReceiver<CacheKey>) {
        while let Some(first) = requests.recv().await {
            let mut batch = IndexSet::from([first]);
            while let Ok(next) = requests.try_recv() {
                batch.insert(next);
            }
            for key in batch {
                // Errors are logged in refetch; the key stays stale until the
                // next invalidation or load.
                let _ = self.refetch(key).await;
            }
        }
        debug!("refresher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EntityCache;
    use crate::memory::MemoryStore;
    use roadmap_types::row_from;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup() -> (Arc<MemoryStore>, Refresher, SharedEntityCache, WriteCoalescer) {
        let store = Arc::new(MemoryStore::new());
        let cache = EntityCache::shared(64, true);
        let coalescer = WriteCoalescer::new(Duration::from_millis(500));
        let refresher = Refresher::new(Loader::new(store.clone()), cache.clone(), coalescer.clone());
        (store, refresher, cache, coalescer)
    }

    #[tokio::test]
    async fn test_initiative_detail_nests_children() {
        let (store, refresher, cache, _) = setup();
        let id = store.seed(Table::Initiatives, row_from(json!({"name": "Search"})));
        let parent = json!(id.to_string());
        store.seed(Table::ReleasePlans, row_from(json!({"initiative_id": parent, "order_index": 1})));
        store.seed(Table::ReleasePlans, row_from(json!({"initiative_id": parent, "order_index": 0})));
        store.seed(Table::Deliverables, row_from(json!({"initiative_id": parent})));

        refresher.refetch(CacheKey::initiative_detail(id)).await.unwrap();
        let value = cache.value(&CacheKey::initiative_detail(id)).unwrap();
        let record = value.as_record().unwrap();
        let plans = record["release_plans"].as_array().unwrap();
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0]["order_index"], json!(0));
        assert_eq!(record["deliverables"].as_array().unwrap().len(), 1);
        assert_eq!(record["initial_planning"], Value::Null);
    }

    #[tokio::test]
    async fn test_missing_detail_is_not_found() {
        let (_, refresher, _, _) = setup();
        let id = RowId::new();
        let err = refresher.refetch(CacheKey::task_detail(id)).await.unwrap_err();
        assert_eq!(err, StoreError::NotFound { table: Table::Tasks, id });
    }

    #[tokio::test]
    async fn test_backlog_holds_only_orphaned_epics() {
        let (store, refresher, cache, _) = setup();
        store.seed(Table::Epics, row_from(json!({"release_plan_id": null})));
        store.seed(Table::Epics, row_from(json!({"release_plan_id": RowId::new().to_string()})));
        refresher.refetch(CacheKey::backlog()).await.unwrap();
        assert_eq!(cache.value(&CacheKey::backlog()).unwrap().ids().len(), 1);
    }

    #[tokio::test]
    async fn test_summary_counts_deliverables() {
        let (store, refresher, cache, _) = setup();
        let id = store.seed(Table::Initiatives, row_from(json!({"name": "Search"})));
        let parent = json!(id.to_string());
        store.seed(Table::Deliverables, row_from(json!({"initiative_id": parent, "name": "API", "status": "done"})));
        store.seed(Table::Deliverables, row_from(json!({"initiative_id": parent, "name": "Docs", "status": "pending"})));
        // Undecodable rows are left out of both counts.
        store.seed(Table::Deliverables, row_from(json!({"initiative_id": parent, "status": "planned"})));

        refresher.refetch(CacheKey::dashboard_summary()).await.unwrap();
        let value = cache.value(&CacheKey::dashboard_summary()).unwrap();
        let row = &value.as_rows().unwrap()[0];
        assert_eq!(row["deliverables_total"], json!(2));
        assert_eq!(row["deliverables_done"], json!(1));
    }

    #[tokio::test]
    async fn test_append_only_refetch_keeps_seen_entries() {
        let (store, refresher, cache, _) = setup();
        let task = RowId::new();
        let key = CacheKey::task_updates(task);
        let seen = row_from(json!({"id": RowId::new().to_string(), "task_id": task.to_string()}));
        cache.set(key, CachedValue::Rows(vec![seen]));
        store.seed(Table::TaskUpdates, row_from(json!({"task_id": task.to_string()})));

        refresher.refetch(key).await.unwrap();
        assert_eq!(cache.value(&key).unwrap().ids().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_keeps_pending_local_value() {
        let (store, refresher, cache, coalescer) = setup();
        let id = store.seed(Table::Tasks, row_from(json!({"name": "server"})));
        coalescer.schedule(
            crate::coalescer::FieldKey::new(Table::Tasks, id, "name"),
            json!("local"),
            Box::new(|_| Box::pin(async {})),
        );

        refresher.refetch(CacheKey::tasks()).await.unwrap();
        let value = cache.value(&CacheKey::tasks()).unwrap();
        assert_eq!(value.find_row(Table::Tasks, Table::Tasks, id).unwrap()["name"], json!("local"));
        coalescer.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_detail_refetch_keeps_pending_nested_value() {
        let (store, refresher, cache, coalescer) = setup();
        let initiative = store.seed(Table::Initiatives, row_from(json!({"name": "Search"})));
        let plan = store.seed(
            Table::ReleasePlans,
            row_from(json!({"initiative_id": initiative.to_string(), "goal": "server", "order_index": 0})),
        );
        coalescer.schedule(
            crate::coalescer::FieldKey::new(Table::ReleasePlans, plan, "goal"),
            json!("local"),
            Box::new(|_| Box::pin(async {})),
        );

        let key = CacheKey::initiative_detail(initiative);
        refresher.refetch(key).await.unwrap();
        let value = cache.value(&key).unwrap();
        let nested = value.find_row(Table::Initiatives, Table::ReleasePlans, plan).unwrap();
        assert_eq!(nested["goal"], json!("local"));
        coalescer.drain().await;
    }

    #[tokio::test]
    async fn test_failed_refetch_keeps_stale_value() {
        let (store, refresher, cache, _) = setup();
        let key = CacheKey::tasks();
        cache.set(key, CachedValue::Rows(Vec::new()));
        cache.invalidate(&key);
        store.fail_next_reads(1);
        assert!(refresher.refetch(key).await.is_err());
        assert!(cache.is_stale(&key));
    }
}
