//! Structured cache keys.
//!
//! A key is the tuple (table, scope, view). Two views over overlapping data,
//! such as "initiative detail #42" and "dashboard timeline", are different
//! keys and are invalidated independently.

use serde::{Deserialize, Serialize};

use crate::ids::RowId;
use crate::table::Table;

/// Which rendering of the data a key addresses.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    /// One row, possibly with nested children (initiative detail).
    Detail,
    /// Rows of one table filtered by scope (parent id, or global).
    List,
    /// Dashboard timeline aggregate.
    Timeline,
    /// Dashboard summary aggregate.
    Summary,
}

impl View {
    pub fn as_str(&self) -> &'static str {
        match self {
            View::Detail => "detail",
            View::List => "list",
            View::Timeline => "timeline",
            View::Summary => "summary",
        }
    }
}

/// Address of one cached query result.
#[derive(Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    /// Primary table the view reads from.
    pub table: Table,
    /// Row id for detail views, parent id for scoped lists, `None` for global.
    pub scope: Option<RowId>,
    pub view: View,
}

impl CacheKey {
    pub const fn new(table: Table, scope: Option<RowId>, view: View) -> Self {
        Self { table, scope, view }
    }

    /// Single row of `table` by id.
    pub const fn detail(table: Table, id: RowId) -> Self {
        Self::new(table, Some(id), View::Detail)
    }

    /// Children of `parent` in `table` (or the whole table when `None`).
    pub const fn list(table: Table, parent: Option<RowId>) -> Self {
        Self::new(table, parent, View::List)
    }

    /// Initiative with its release plans, deliverables, and initial planning.
    pub const fn initiative_detail(id: RowId) -> Self {
        Self::detail(Table::Initiatives, id)
    }

    /// All initiatives, in `order_index` order.
    pub const fn initiatives() -> Self {
        Self::list(Table::Initiatives, None)
    }

    pub const fn release_plans(initiative: RowId) -> Self {
        Self::list(Table::ReleasePlans, Some(initiative))
    }

    pub const fn epics(release_plan: RowId) -> Self {
        Self::list(Table::Epics, Some(release_plan))
    }

    /// Epics with no release plan: the synthetic "Backlog" group.
    pub const fn backlog() -> Self {
        Self::list(Table::Epics, None)
    }

    pub const fn deliverables(initiative: RowId) -> Self {
        Self::list(Table::Deliverables, Some(initiative))
    }

    /// All roadmap tasks, in `display_order` order.
    pub const fn tasks() -> Self {
        Self::list(Table::Tasks, None)
    }

    pub const fn task_detail(id: RowId) -> Self {
        Self::detail(Table::Tasks, id)
    }

    pub const fn task_deliverables(task: RowId) -> Self {
        Self::list(Table::TaskDeliverables, Some(task))
    }

    pub const fn task_updates(task: RowId) -> Self {
        Self::list(Table::TaskUpdates, Some(task))
    }

    /// Release plans across all initiatives, for the dashboard timeline.
    pub const fn dashboard_timeline() -> Self {
        Self::new(Table::ReleasePlans, None, View::Timeline)
    }

    /// Initiative roll-up for the dashboard summary.
    pub const fn dashboard_summary() -> Self {
        Self::new(Table::Initiatives, None, View::Summary)
    }

    /// Whether this key is an ordered collection that reorders can target.
    pub fn is_orderable(&self) -> bool {
        self.view == View::List && self.table.order_field().is_some()
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.scope {
            Some(scope) => write!(f, "{}/{}#{}", self.table, self.view.as_str(), scope.short()),
            None => write!(f, "{}/{}", self.table, self.view.as_str()),
        }
    }
}

impl std::fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CacheKey({self})")
    }
}

/// A row addressed by table and id, the unit field-level edits target.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    pub table: Table,
    pub id: RowId,
}

impl EntityRef {
    pub const fn new(table: Table, id: RowId) -> Self {
        Self { table, id }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.table, self.id.short())
    }
}
