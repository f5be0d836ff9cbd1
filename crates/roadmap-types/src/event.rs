//! Realtime change notifications as delivered by the backing store.
//!
//! Payloads may be partial: an UPDATE can carry only the columns that
//! changed, and `old_row` is frequently just the primary key. Consumers must
//! treat every field as optional.

use serde::{Deserialize, Serialize};

use crate::ids::RowId;
use crate::row::{Row, RowExt};
use crate::table::Table;

/// What happened to the row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One push notification for one row.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    /// Row after the change (absent for DELETE).
    #[serde(default)]
    pub new_row: Option<Row>,
    /// Row before the change (often partial, absent for INSERT).
    #[serde(default)]
    pub old_row: Option<Row>,
}

impl ChangeEvent {
    pub fn insert(table: Table, row: Row) -> Self {
        Self { kind: ChangeKind::Insert, table, new_row: Some(row), old_row: None }
    }

    pub fn update(table: Table, new_row: Row, old_row: Option<Row>) -> Self {
        Self { kind: ChangeKind::Update, table, new_row: Some(new_row), old_row }
    }

    pub fn delete(table: Table, old_row: Row) -> Self {
        Self { kind: ChangeKind::Delete, table, new_row: None, old_row: Some(old_row) }
    }

    /// Id of the affected row, preferring the new image.
    pub fn row_id(&self) -> Option<RowId> {
        self.new_row
            .as_ref()
            .and_then(RowExt::id)
            .or_else(|| self.old_row.as_ref().and_then(RowExt::id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::row_from;
    use serde_json::json;

    #[test]
    fn test_row_id_falls_back_to_old_row() {
        let id = RowId::new();
        let event = ChangeEvent::delete(Table::Epics, row_from(json!({"id": id.to_string()})));
        assert_eq!(event.row_id(), Some(id));
    }

    #[test]
    fn test_kind_serializes_uppercase() {
        let json = serde_json::to_string(&ChangeKind::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");
    }
}
