//! Realtime reconciliation.
//!
//! One task per table reads that table's change stream in arrival order and
//! folds each event into the cache:
//!
//! ```text
//! ChangeEvent ──► routes::resolve_all ──► Patch      → merge / upsert / prune
//!                                    └──► Invalidate → mark stale (refetch if watched)
//! ```
//!
//! Payloads may be partial. Missing foreign keys are recovered from a cached
//! copy of the row when there is one; otherwise every cached key the route
//! could have meant is invalidated. Nothing here fails: the worst case is a
//! refetch.
//!
//! Applying the same event twice leaves the cache as applying it once:
//! merges are idempotent, upserts are keyed by id, and invalidating a stale
//! key does nothing.

use std::sync::Arc;

use roadmap_types::{CacheKey, ChangeEvent, ChangeKind, Row, RowExt, RowId, Table, View};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::cache::SharedEntityCache;
use crate::coalescer::WriteCoalescer;
use crate::notices::{Notice, Notifier};
use crate::routes::{Apply, Resolved, Route, Scope, resolve_all, routes};
use crate::store::SharedStore;
use crate::value::Removal;

/// Why an event was dropped without touching the cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IgnoreReason {
    /// UPDATE or DELETE on an append-only table.
    AppendOnly,
}

/// What one event did to the cache.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub patched: Vec<CacheKey>,
    pub invalidated: Vec<CacheKey>,
    /// Keys whose value was the deleted row itself.
    pub removed: Vec<CacheKey>,
    /// The payload lacked something and keys were invalidated wholesale.
    pub degraded: bool,
    pub ignored: Option<IgnoreReason>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.patched.is_empty() && self.invalidated.is_empty() && self.removed.is_empty()
    }

    fn invalidate(&mut self, cache: &SharedEntityCache, key: CacheKey) {
        if cache.invalidate(&key) {
            self.invalidated.push(key);
        }
    }
}

pub struct Reconciler {
    cache: SharedEntityCache,
    coalescer: WriteCoalescer,
    notifier: Notifier,
}

impl Reconciler {
    pub fn new(cache: SharedEntityCache, coalescer: WriteCoalescer, notifier: Notifier) -> Self {
        Self { cache, coalescer, notifier }
    }

    /// Subscribe to every table and reconcile in the background.
    pub fn spawn(self: &Arc<Self>, store: &SharedStore) -> Vec<JoinHandle<()>> {
        Table::ALL
            .iter()
            .map(|&table| {
                let rx = store.subscribe(table);
                let this = Arc::clone(self);
                tokio::spawn(async move { this.run_table(table, rx).await })
            })
            .collect()
    }

    async fn run_table(&self, table: Table, mut rx: broadcast::Receiver<ChangeEvent>) {
        debug!(%table, "realtime subscription started");
        loop {
            match rx.recv().await {
                Ok(event) => {
                    self.apply(&event);
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.resync_table(table, missed);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!(%table, "realtime subscription closed");
    }

    /// Fold one event into the cache.
    pub fn apply(&self, event: &ChangeEvent) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        let table = event.table;

        if table.is_append_only() && event.kind != ChangeKind::Insert {
            trace!(%table, kind = %event.kind, "ignoring change to append-only table");
            report.ignored = Some(IgnoreReason::AppendOnly);
            return report;
        }

        let Some(id) = event.row_id() else {
            warn!(%table, kind = %event.kind, "change event without row id, invalidating table");
            self.invalidate_table(table, &mut report);
            return report;
        };

        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => match &event.new_row {
                Some(new_row) => self.on_upsert(event, id, new_row, &mut report),
                None => {
                    warn!(%table, %id, "upsert event without new row, invalidating table");
                    self.invalidate_table(table, &mut report);
                }
            },
            ChangeKind::Delete => self.on_delete(event, id, &mut report),
        }

        trace!(
            %table, %id, kind = %event.kind,
            patched = report.patched.len(),
            invalidated = report.invalidated.len(),
            removed = report.removed.len(),
            "reconciled"
        );
        report
    }

    fn on_upsert(&self, event: &ChangeEvent, id: RowId, new_row: &Row, report: &mut ReconcileReport) {
        let table = event.table;
        let cached = self.cached_copy(table, id);

        // Pending local edits win until their own write lands.
        let mut incoming = new_row.clone();
        for (field, _) in self.coalescer.pending_for(table, id) {
            incoming.remove(&field);
        }
        incoming.insert("id".into(), id.to_json());

        // Cached copy fills in columns a partial payload left out.
        let mut resolved_row = cached.clone().unwrap_or_default();
        resolved_row.merge_from(new_row);

        for (route, resolved) in resolve_all(table, &resolved_row) {
            match resolved {
                Resolved::Key(key) => self.apply_route(event.kind, table, id, &route, key, &incoming, report),
                Resolved::Missing(field) => {
                    warn!(%table, %id, field, view = route.view.as_str(), "payload missing scope column");
                    self.invalidate_template(&route, report);
                }
            }
        }

        if event.kind == ChangeKind::Update {
            self.leave_old_parent(event, &resolved_row, report);
        }
        self.notify_significant(event, id, cached.as_ref(), new_row);
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_route(
        &self,
        kind: ChangeKind,
        table: Table,
        id: RowId,
        route: &Route,
        key: CacheKey,
        incoming: &Row,
        report: &mut ReconcileReport,
    ) {
        if route.apply == Apply::Invalidate {
            report.invalidate(&self.cache, key);
            return;
        }
        let Some(current) = self.cache.value(&key) else {
            return;
        };
        let present = current.contains_row(key.table, table, id);

        if key.view == View::List && !present && kind == ChangeKind::Update {
            // Moved into this list, or the list predates the insert; the
            // payload may be partial, so fetch rather than guess.
            report.invalidate(&self.cache, key);
            return;
        }

        let changed = self.cache.patch(&key, |value| {
            let mut next = value.clone();
            let applied = if key.view == View::List {
                next.upsert_row(incoming, table.order_field())
            } else {
                next.patch_row(key.table, table, id, incoming)
            };
            applied.then_some(next)
        });
        if changed {
            report.patched.push(key);
        }
    }

    /// An UPDATE that moved the row to another parent leaves its old group.
    fn leave_old_parent(&self, event: &ChangeEvent, resolved_row: &Row, report: &mut ReconcileReport) {
        let table = event.table;
        let (Some(field), Some(old_row), Some(id)) = (table.parent_field(), &event.old_row, event.row_id()) else {
            return;
        };
        if !old_row.contains_key(field) || old_row.get(field) == resolved_row.get(field) {
            return;
        }
        let mut previous = resolved_row.clone();
        previous.insert(field.to_string(), old_row[field].clone());

        for (route, resolved) in resolve_all(table, &previous) {
            let Resolved::Key(key) = resolved else {
                continue;
            };
            if route.scope != Scope::Parent {
                continue;
            }
            match route.apply {
                Apply::Invalidate => report.invalidate(&self.cache, key),
                Apply::Patch => {
                    let changed = self.cache.patch(&key, |value| {
                        let mut next = value.clone();
                        (next.remove_row(key.table, table, id) == Removal::Pruned).then_some(next)
                    });
                    if changed {
                        debug!(%table, %id, %key, "row left its previous group");
                        report.patched.push(key);
                    }
                }
            }
        }
    }

    fn on_delete(&self, event: &ChangeEvent, id: RowId, report: &mut ReconcileReport) {
        let table = event.table;
        let cached = self.cached_copy(table, id);

        for key in self.cache.keys_containing(table, id) {
            let mut whole = false;
            let changed = self.cache.patch(&key, |value| {
                let mut next = value.clone();
                match next.remove_row(key.table, table, id) {
                    Removal::Pruned => Some(next),
                    Removal::WholeRecord => {
                        whole = true;
                        None
                    }
                    Removal::NotFound => None,
                }
            });
            if whole {
                self.cache.remove(&key);
                report.removed.push(key);
            } else if changed {
                report.patched.push(key);
            }
        }

        // Aggregates over the row, resolved from whatever we know of it.
        let mut known = cached.unwrap_or_default();
        if let Some(old_row) = &event.old_row {
            known.merge_from(old_row);
        }
        for (route, resolved) in resolve_all(table, &known) {
            if route.apply != Apply::Invalidate {
                continue;
            }
            match resolved {
                Resolved::Key(key) => report.invalidate(&self.cache, key),
                Resolved::Missing(_) => self.invalidate_template(&route, report),
            }
        }

        let cancelled = self.coalescer.cancel_entity(id);
        if cancelled > 0 {
            debug!(%table, %id, cancelled, "dropped pending edits of deleted row");
        }
    }

    /// The realtime stream dropped events: invalidate everything the table feeds.
    pub fn resync_table(&self, table: Table, missed: u64) -> ReconcileReport {
        warn!(%table, missed, "realtime stream lagged, invalidating table keys");
        let mut report = ReconcileReport { degraded: true, ..Default::default() };
        self.invalidate_table(table, &mut report);
        self.notifier.publish(Notice::Resynced { table, missed });
        report
    }

    fn invalidate_table(&self, table: Table, report: &mut ReconcileReport) {
        for route in routes(table) {
            self.invalidate_template(route, report);
        }
    }

    /// Invalidate every cached instance of a route, whatever its scope.
    fn invalidate_template(&self, route: &Route, report: &mut ReconcileReport) {
        report.degraded = true;
        for key in self.cache.keys_matching(route.key_table, route.view) {
            report.invalidate(&self.cache, key);
        }
    }

    /// Any cached copy of the row, top-level or nested.
    fn cached_copy(&self, table: Table, id: RowId) -> Option<Row> {
        self.cache.keys_containing(table, id).into_iter().find_map(|key| {
            self.cache
                .value(&key)
                .and_then(|v| v.find_row(key.table, table, id).cloned())
        })
    }

    /// Publish a notice when a significant column changed under us.
    ///
    /// Echoes of our own writes and duplicate deliveries find the cache
    /// already holding the new value and stay quiet.
    fn notify_significant(&self, event: &ChangeEvent, id: RowId, cached: Option<&Row>, new_row: &Row) {
        let Some(old_row) = &event.old_row else {
            return;
        };
        for &field in event.table.significant_fields() {
            let (Some(from), Some(to)) = (old_row.get(field), new_row.get(field)) else {
                continue;
            };
            if from == to || cached.is_some_and(|c| c.get(field) == Some(to)) {
                continue;
            }
            self.notifier.publish(Notice::StatusChanged {
                table: event.table,
                id,
                field,
                from: from.clone(),
                to: to.clone(),
            });
        }
    }
}
