//! Static map from a table to the cache keys its rows feed.
//!
//! Each [`Route`] is a key template: the key's table and view, where its scope
//! comes from (nowhere, the row's own id, or the row's parent foreign key), and
//! whether a change to the row can be merged into the cached value or must
//! invalidate it. Aggregates and composite records are always invalidated;
//! their shape is not a plain list of the changed rows.

use roadmap_types::{CacheKey, Row, RowExt, Table, View};
use serde_json::Value;

/// Where a route's key scope comes from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// The key is unscoped.
    Global,
    /// The row's own `id`.
    OwnId,
    /// The row's parent foreign key.
    Parent,
}

/// How a row change is applied to the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Apply {
    Patch,
    Invalidate,
}

/// One cache-key template fed by a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Route {
    pub key_table: Table,
    pub view: View,
    pub scope: Scope,
    pub apply: Apply,
}

/// Outcome of resolving a route against a (possibly partial) row.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Resolved {
    Key(CacheKey),
    /// The row lacks the column the scope needs.
    Missing(&'static str),
}

const fn route(key_table: Table, view: View, scope: Scope, apply: Apply) -> Route {
    Route { key_table, view, scope, apply }
}

use Apply::{Invalidate, Patch};
use Scope::{Global, OwnId, Parent};

const INITIATIVES: &[Route] = &[
    route(Table::Initiatives, View::Detail, OwnId, Patch),
    route(Table::Initiatives, View::List, Global, Patch),
    route(Table::Initiatives, View::Summary, Global, Invalidate),
    route(Table::ReleasePlans, View::Timeline, Global, Invalidate),
];

const INITIAL_PLANNING: &[Route] = &[route(Table::Initiatives, View::Detail, Parent, Invalidate)];

const RELEASE_PLANS: &[Route] = &[
    route(Table::ReleasePlans, View::List, Parent, Patch),
    route(Table::Initiatives, View::Detail, Parent, Invalidate),
    route(Table::ReleasePlans, View::Timeline, Global, Invalidate),
];

const EPICS: &[Route] = &[route(Table::Epics, View::List, Parent, Patch)];

const DELIVERABLES: &[Route] = &[
    route(Table::Deliverables, View::List, Parent, Patch),
    route(Table::Initiatives, View::Detail, Parent, Invalidate),
    route(Table::Initiatives, View::Summary, Global, Invalidate),
];

const TASKS: &[Route] = &[
    route(Table::Tasks, View::Detail, OwnId, Patch),
    route(Table::Tasks, View::List, Global, Patch),
];

const TASK_DELIVERABLES: &[Route] = &[
    route(Table::TaskDeliverables, View::List, Parent, Patch),
    route(Table::Tasks, View::Detail, Parent, Invalidate),
];

const TASK_UPDATES: &[Route] = &[route(Table::TaskUpdates, View::List, Parent, Patch)];

/// Key templates fed by rows of `table`.
pub fn routes(table: Table) -> &'static [Route] {
    match table {
        Table::Initiatives => INITIATIVES,
        Table::InitialPlanning => INITIAL_PLANNING,
        Table::ReleasePlans => RELEASE_PLANS,
        Table::Epics => EPICS,
        Table::Deliverables => DELIVERABLES,
        Table::Tasks => TASKS,
        Table::TaskDeliverables => TASK_DELIVERABLES,
        Table::TaskUpdates => TASK_UPDATES,
    }
}

/// A null parent is meaningful only for epics: it places the epic in the
/// backlog group.
fn parent_may_be_null(table: Table) -> bool {
    table == Table::Epics
}

impl Route {
    /// Fill in this template from a row of `table`.
    pub fn resolve(&self, table: Table, row: &Row) -> Resolved {
        let scope = match self.scope {
            Global => None,
            OwnId => match row.id() {
                Some(id) => Some(id),
                None => return Resolved::Missing("id"),
            },
            Parent => {
                let Some(field) = table.parent_field() else {
                    return Resolved::Missing("parent");
                };
                match row.get(field) {
                    Some(Value::Null) if parent_may_be_null(table) => None,
                    Some(value) => match roadmap_types::RowId::from_json(value) {
                        Some(id) => Some(id),
                        None => return Resolved::Missing(field),
                    },
                    None => return Resolved::Missing(field),
                }
            }
        };
        Resolved::Key(CacheKey::new(self.key_table, scope, self.view))
    }
}

/// Keys a row of `table` feeds, with the route that produced each.
///
/// Routes that cannot be resolved from `row` are reported as `Missing`.
pub fn resolve_all(table: Table, row: &Row) -> Vec<(Route, Resolved)> {
    routes(table).iter().map(|r| (*r, r.resolve(table, row))).collect()
}

/// Aggregate and composite keys whose correctness depends on `row`.
///
/// Refreshed after a confirmed local write.
pub fn derived_keys(table: Table, row: &Row) -> Vec<CacheKey> {
    resolve_all(table, row)
        .into_iter()
        .filter(|(route, _)| route.apply == Invalidate)
        .filter_map(|(_, resolved)| match resolved {
            Resolved::Key(key) => Some(key),
            Resolved::Missing(_) => None,
        })
        .collect()
}

/// List keys a row of `table` belongs to and can be merged into.
pub fn list_keys(table: Table, row: &Row) -> Vec<CacheKey> {
    resolve_all(table, row)
        .into_iter()
        .filter(|(route, _)| route.apply == Patch && route.view == View::List)
        .filter_map(|(_, resolved)| match resolved {
            Resolved::Key(key) => Some(key),
            Resolved::Missing(_) => None,
        })
        .collect()
}

/// Detail keys of the row's parent.
///
/// Composite details nest child rows under a column named after the child
/// table, so a new row can be shown there before the detail is refetched.
pub fn parent_detail_keys(table: Table, row: &Row) -> Vec<CacheKey> {
    resolve_all(table, row)
        .into_iter()
        .filter(|(route, _)| route.view == View::Detail && route.scope == Parent)
        .filter_map(|(_, resolved)| match resolved {
            Resolved::Key(key) => Some(key),
            Resolved::Missing(_) => None,
        })
        .collect()
}
