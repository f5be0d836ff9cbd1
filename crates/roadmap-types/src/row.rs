//! Untyped rows as they travel between the backing store and the cache.
//!
//! The sync engine never needs to understand a row beyond its id, its parent
//! key, and its order column, so it works on plain JSON objects. Typed views
//! live in [`crate::entity`].

use serde_json::Value;

use crate::ids::RowId;

/// A row: a JSON object keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Accessors the engine uses on rows.
pub trait RowExt {
    /// The row's `id` column, if present and well-formed.
    fn id(&self) -> Option<RowId>;

    /// A foreign-key column, if present and well-formed.
    fn ref_id(&self, field: &str) -> Option<RowId>;

    /// Integer column (order indices).
    fn int(&self, field: &str) -> Option<i64>;

    /// Shallow-merge `patch` into this row. Later values win.
    fn merge_from(&mut self, patch: &Row);
}

impl RowExt for Row {
    fn id(&self) -> Option<RowId> {
        self.get("id").and_then(RowId::from_json)
    }

    fn ref_id(&self, field: &str) -> Option<RowId> {
        self.get(field).and_then(RowId::from_json)
    }

    fn int(&self, field: &str) -> Option<i64> {
        self.get(field).and_then(Value::as_i64)
    }

    fn merge_from(&mut self, patch: &Row) {
        for (k, v) in patch {
            self.insert(k.clone(), v.clone());
        }
    }
}

/// Build a row from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty row.
pub fn row_from(value: Value) -> Row {
    match value {
        Value::Object(map) => map,
        _ => Row::new(),
    }
}

/// A single-field row, used for field-level edits.
pub fn field_row(field: &str, value: Value) -> Row {
    let mut row = Row::new();
    row.insert(field.to_string(), value);
    row
}
