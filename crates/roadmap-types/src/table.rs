//! The persisted collections and their per-table metadata.
//!
//! Every table-specific rule the sync engine needs (which column carries the
//! dense order, which column points at the parent, which fields are worth a
//! toast when they change) lives here so that the engine itself stays
//! table-agnostic.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{EnumIter, EnumString};

/// A logical collection in the backing store.
#[derive(
    Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, EnumString, EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Table {
    Initiatives,
    InitialPlanning,
    ReleasePlans,
    Epics,
    Deliverables,
    /// Roadmap filler tasks. Flat, not nested under an initiative.
    Tasks,
    TaskDeliverables,
    /// Append-only log; rows are created, never edited or deleted.
    TaskUpdates,
}

impl Table {
    /// All tables, leaf-last.
    pub const ALL: [Table; 8] = [
        Table::Initiatives,
        Table::InitialPlanning,
        Table::ReleasePlans,
        Table::Epics,
        Table::Deliverables,
        Table::Tasks,
        Table::TaskDeliverables,
        Table::TaskUpdates,
    ];

    /// Parse from string (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Wire name of the table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Initiatives => "initiatives",
            Table::InitialPlanning => "initial_planning",
            Table::ReleasePlans => "release_plans",
            Table::Epics => "epics",
            Table::Deliverables => "deliverables",
            Table::Tasks => "tasks",
            Table::TaskDeliverables => "task_deliverables",
            Table::TaskUpdates => "task_updates",
        }
    }

    /// Column holding the dense zero-based order, for orderable collections.
    pub fn order_field(&self) -> Option<&'static str> {
        match self {
            Table::Initiatives | Table::ReleasePlans => Some("order_index"),
            Table::Tasks => Some("display_order"),
            _ => None,
        }
    }

    /// Foreign-key column pointing at the owning row, if any.
    ///
    /// `epics.release_plan_id` is nullable; a null parent means the epic is
    /// orphaned and shows up in the backlog group.
    pub fn parent_field(&self) -> Option<&'static str> {
        match self {
            Table::InitialPlanning | Table::ReleasePlans | Table::Deliverables => {
                Some("initiative_id")
            }
            Table::Epics => Some("release_plan_id"),
            Table::TaskDeliverables | Table::TaskUpdates => Some("task_id"),
            Table::Initiatives | Table::Tasks => None,
        }
    }

    /// Table the parent column points into.
    pub fn parent_table(&self) -> Option<Table> {
        match self {
            Table::InitialPlanning | Table::ReleasePlans | Table::Deliverables => {
                Some(Table::Initiatives)
            }
            Table::Epics => Some(Table::ReleasePlans),
            Table::TaskDeliverables | Table::TaskUpdates => Some(Table::Tasks),
            Table::Initiatives | Table::Tasks => None,
        }
    }

    /// Only INSERT is meaningful for append-only tables.
    pub fn is_append_only(&self) -> bool {
        matches!(self, Table::TaskUpdates)
    }

    /// Fields whose change is worth surfacing to the user as a notice.
    pub fn significant_fields(&self) -> &'static [&'static str] {
        match self {
            Table::Initiatives
            | Table::ReleasePlans
            | Table::Epics
            | Table::Deliverables
            | Table::Tasks
            | Table::TaskDeliverables => &["status"],
            Table::InitialPlanning | Table::TaskUpdates => &[],
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
