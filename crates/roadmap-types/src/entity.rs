//! Typed views over rows.
//!
//! The store owns these entities; the client only ever holds copies. Each
//! struct decodes from a [`Row`] and knows which [`Table`] it lives in.
//!
//! ```text
//! Initiative ──┬── InitialPlanning (1:1)
//!              ├── ReleasePlan (N, ordered) ── Epic (N, nullable parent → Backlog)
//!              └── Deliverable (N)
//!
//! Task (flat, ordered) ──┬── TaskDeliverable (N)
//!                        └── TaskUpdate (N, append-only)
//! ```

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::EnumString;

use crate::error::TypesError;
use crate::ids::RowId;
use crate::row::Row;
use crate::table::Table;

/// A typed entity backed by one table.
pub trait Entity: Serialize + DeserializeOwned {
    /// The collection this entity lives in.
    const TABLE: Table;

    /// Row id.
    fn id(&self) -> RowId;

    /// Decode from an untyped row.
    fn from_row(row: &Row) -> Result<Self, TypesError> {
        if !row.contains_key("id") {
            return Err(TypesError::MissingField { table: Self::TABLE, field: "id" });
        }
        serde_json::from_value(serde_json::Value::Object(row.clone()))
            .map_err(|e| TypesError::Decode { table: Self::TABLE, message: e.to_string() })
    }

    /// Encode as an untyped row.
    fn to_row(&self) -> Result<Row, TypesError> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => Ok(map),
            Ok(_) => Err(TypesError::Decode {
                table: Self::TABLE,
                message: "entity did not encode as an object".to_string(),
            }),
            Err(e) => Err(TypesError::Decode { table: Self::TABLE, message: e.to_string() }),
        }
    }
}

// ============================================================================
// Status enums
// ============================================================================

/// Initiative lifecycle.
///
/// Planning → ReleasePlanning → Development → Released, with OnHold reachable
/// from anywhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum InitiativeStatus {
    #[default]
    #[strum(serialize = "planning")]
    Planning,
    #[strum(serialize = "release_planning", serialize = "release-planning")]
    ReleasePlanning,
    #[strum(serialize = "development")]
    Development,
    #[strum(serialize = "released")]
    Released,
    #[strum(serialize = "on_hold", serialize = "on-hold")]
    OnHold,
}

impl InitiativeStatus {
    /// Parse from string (case-insensitive, `-` or `_` separators).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InitiativeStatus::Planning => "planning",
            InitiativeStatus::ReleasePlanning => "release_planning",
            InitiativeStatus::Development => "development",
            InitiativeStatus::Released => "released",
            InitiativeStatus::OnHold => "on_hold",
        }
    }

    /// Next stage in the forward lifecycle. Released and OnHold have none.
    pub fn next(&self) -> Option<Self> {
        match self {
            InitiativeStatus::Planning => Some(InitiativeStatus::ReleasePlanning),
            InitiativeStatus::ReleasePlanning => Some(InitiativeStatus::Development),
            InitiativeStatus::Development => Some(InitiativeStatus::Released),
            InitiativeStatus::Released | InitiativeStatus::OnHold => None,
        }
    }
}

impl std::fmt::Display for InitiativeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Release plan progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ReleasePlanStatus {
    #[default]
    NotStarted,
    PrePlanning,
    Planning,
    InDevelopment,
    Shipped,
}

/// Epic progress.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum EpicStatus {
    #[default]
    Todo,
    InProgress,
    Done,
}

/// Deliverable state. Shared by initiative and task deliverables.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum DeliverableStatus {
    #[default]
    Pending,
    Done,
}

/// Roadmap task state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum TaskStatus {
    #[default]
    Todo,
    InProgress,
    Blocked,
    Done,
}

// ============================================================================
// Entities
// ============================================================================

/// Root of the planning tree.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Initiative {
    pub id: RowId,
    pub name: String,
    #[serde(default)]
    pub status: InitiativeStatus,
    #[serde(default)]
    pub pm: Option<String>,
    #[serde(default)]
    pub ux: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub tech_lead: Option<String>,
    /// Free-text status note.
    #[serde(default)]
    pub status_note: Option<String>,
    /// Dense, unique within the initiative collection.
    pub order_index: i64,
}

/// Scheduling and document links for an initiative (1:1).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InitialPlanning {
    pub id: RowId,
    pub initiative_id: RowId,
    #[serde(default)]
    pub target_start: Option<NaiveDate>,
    #[serde(default)]
    pub target_end: Option<NaiveDate>,
    #[serde(default)]
    pub prd_link: Option<String>,
    #[serde(default)]
    pub design_link: Option<String>,
    #[serde(default)]
    pub tech_spec_link: Option<String>,
}

/// A release under an initiative, ordered within it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReleasePlan {
    pub id: RowId,
    pub initiative_id: RowId,
    #[serde(default)]
    pub goal: String,
    #[serde(default)]
    pub status: ReleasePlanStatus,
    #[serde(default)]
    pub pre_planning_start: Option<NaiveDate>,
    #[serde(default)]
    pub pre_planning_end: Option<NaiveDate>,
    #[serde(default)]
    pub planning_start: Option<NaiveDate>,
    #[serde(default)]
    pub planning_end: Option<NaiveDate>,
    #[serde(default)]
    pub dev_start: Option<NaiveDate>,
    #[serde(default)]
    pub dev_end: Option<NaiveDate>,
    /// Dense, scoped to the parent initiative.
    pub order_index: i64,
}

/// Unit of work under a release plan. A null parent puts it in the backlog.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Epic {
    pub id: RowId,
    #[serde(default)]
    pub release_plan_id: Option<RowId>,
    pub name: String,
    #[serde(default)]
    pub status: EpicStatus,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub level_of_effort: Option<String>,
}

impl Epic {
    /// Orphaned epics are shown in the synthetic backlog group.
    pub fn is_orphaned(&self) -> bool {
        self.release_plan_id.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deliverable {
    pub id: RowId,
    pub initiative_id: RowId,
    pub name: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: DeliverableStatus,
}

/// Roadmap filler task, independently ordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: RowId,
    pub name: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub owner: Option<String>,
    /// Dense, across all tasks.
    pub display_order: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDeliverable {
    pub id: RowId,
    pub task_id: RowId,
    pub name: String,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: DeliverableStatus,
}

/// Immutable log entry on a task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub id: RowId,
    pub task_id: RowId,
    pub body: String,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

macro_rules! impl_entity {
    ($T:ty, $table:expr) => {
        impl Entity for $T {
            const TABLE: Table = $table;

            fn id(&self) -> RowId {
                self.id
            }
        }
    };
}

impl_entity!(Initiative, Table::Initiatives);
impl_entity!(InitialPlanning, Table::InitialPlanning);
impl_entity!(ReleasePlan, Table::ReleasePlans);
impl_entity!(Epic, Table::Epics);
impl_entity!(Deliverable, Table::Deliverables);
impl_entity!(Task, Table::Tasks);
impl_entity!(TaskDeliverable, Table::TaskDeliverables);
impl_entity!(TaskUpdate, Table::TaskUpdates);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from;
    use serde_json::json;

    #[test]
    fn test_initiative_decodes_with_defaults() {
        let id = RowId::new();
        let row = row_from(json!({
            "id": id.to_string(),
            "name": "Search revamp",
            "order_index": 0,
        }));
        let initiative = Initiative::from_row(&row).unwrap();
        assert_eq!(initiative.id(), id);
        assert_eq!(initiative.status, InitiativeStatus::Planning);
        assert_eq!(initiative.pm, None);
    }

    #[test]
    fn test_decode_error_names_table() {
        let row = row_from(json!({"name": "no id"}));
        let err = Initiative::from_row(&row).unwrap_err();
        assert!(matches!(err, TypesError::MissingField { table: Table::Initiatives, field: "id" }));

        let row = row_from(json!({"id": RowId::new().to_string(), "order_index": "first"}));
        let err = Initiative::from_row(&row).unwrap_err();
        assert!(matches!(err, TypesError::Decode { table: Table::Initiatives, .. }));
    }

    #[test]
    fn test_status_parsing_accepts_dashes() {
        assert_eq!(
            InitiativeStatus::from_str("Release-Planning"),
            Some(InitiativeStatus::ReleasePlanning)
        );
        assert_eq!(InitiativeStatus::from_str("on_hold"), Some(InitiativeStatus::OnHold));
        assert_eq!(InitiativeStatus::from_str("shipping"), None);
    }

    #[test]
    fn test_lifecycle_order() {
        let mut status = InitiativeStatus::Planning;
        let mut seen = vec![status];
        while let Some(next) = status.next() {
            seen.push(next);
            status = next;
        }
        assert_eq!(
            seen,
            vec![
                InitiativeStatus::Planning,
                InitiativeStatus::ReleasePlanning,
                InitiativeStatus::Development,
                InitiativeStatus::Released,
            ]
        );
        assert_eq!(InitiativeStatus::OnHold.next(), None);
    }

    #[test]
    fn test_epic_orphan() {
        let row = row_from(json!({
            "id": RowId::new().to_string(),
            "release_plan_id": null,
            "name": "Loose ends",
        }));
        let epic = Epic::from_row(&row).unwrap();
        assert!(epic.is_orphaned());
    }

    #[test]
    fn test_to_row_keeps_wire_names() {
        let plan = ReleasePlan {
            id: RowId::new(),
            initiative_id: RowId::new(),
            goal: "Beta".into(),
            status: ReleasePlanStatus::InDevelopment,
            pre_planning_start: None,
            pre_planning_end: None,
            planning_start: NaiveDate::from_ymd_opt(2026, 1, 5),
            planning_end: None,
            dev_start: None,
            dev_end: None,
            order_index: 2,
        };
        let row = plan.to_row().unwrap();
        assert_eq!(row["status"], json!("in_development"));
        assert_eq!(row["planning_start"], json!("2026-01-05"));
        assert_eq!(ReleasePlan::from_row(&row).unwrap(), plan);
    }
}
