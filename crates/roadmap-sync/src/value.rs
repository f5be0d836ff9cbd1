//! Cached values and the pure row operations applied to them.
//!
//! A cached value is either a single record or an ordered list of rows. A
//! record may nest child rows under a column named after the child table
//! (the initiative detail carries `release_plans`, `deliverables`, and
//! `initial_planning`), so row-level operations look through one level of
//! nesting.
//!
//! Every operation here is a plain function of the value; the cache applies
//! them through `patch`.

use roadmap_types::{Row, RowExt, RowId, Table};
use serde_json::Value;

/// What a cache entry holds.
#[derive(Clone, Debug, PartialEq)]
pub enum CachedValue {
    Record(Row),
    Rows(Vec<Row>),
}

/// Result of removing a row from a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Removal {
    /// The row was not in this value.
    NotFound,
    /// The row was pruned from a list (top-level or nested).
    Pruned,
    /// The value *is* the row; the whole entry should go.
    WholeRecord,
}

impl CachedValue {
    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            CachedValue::Rows(rows) => Some(rows),
            CachedValue::Record(_) => None,
        }
    }

    pub fn as_record(&self) -> Option<&Row> {
        match self {
            CachedValue::Record(row) => Some(row),
            CachedValue::Rows(_) => None,
        }
    }

    /// Top-level row ids, in order.
    pub fn ids(&self) -> Vec<RowId> {
        match self {
            CachedValue::Rows(rows) => rows.iter().filter_map(RowExt::id).collect(),
            CachedValue::Record(row) => row.id().into_iter().collect(),
        }
    }

    /// Find a row of `table` in a value whose key reads from `own`.
    pub fn find_row(&self, own: Table, table: Table, id: RowId) -> Option<&Row> {
        match self {
            CachedValue::Rows(rows) if own == table => rows.iter().find(|r| r.id() == Some(id)),
            CachedValue::Rows(_) => None,
            CachedValue::Record(record) => {
                if own == table && record.id() == Some(id) {
                    return Some(record);
                }
                nested_rows(record, table).into_iter().find(|r| r.id() == Some(id))
            }
        }
    }

    pub fn contains_row(&self, own: Table, table: Table, id: RowId) -> bool {
        self.find_row(own, table, id).is_some()
    }

    /// Shallow-merge `patch` into the row with `id`. Returns whether it was found.
    pub fn patch_row(&mut self, own: Table, table: Table, id: RowId, patch: &Row) -> bool {
        match self {
            CachedValue::Rows(rows) if own == table => {
                match rows.iter_mut().find(|r| r.id() == Some(id)) {
                    Some(row) => {
                        row.merge_from(patch);
                        true
                    }
                    None => false,
                }
            }
            CachedValue::Rows(_) => false,
            CachedValue::Record(record) => {
                if own == table && record.id() == Some(id) {
                    record.merge_from(patch);
                    return true;
                }
                match nested_rows_mut(record, table).into_iter().find(|r| r.id() == Some(id)) {
                    Some(row) => {
                        row.merge_from(patch);
                        true
                    }
                    None => false,
                }
            }
        }
    }

    /// Remove the row with `id`.
    pub fn remove_row(&mut self, own: Table, table: Table, id: RowId) -> Removal {
        match self {
            CachedValue::Rows(rows) if own == table => {
                let before = rows.len();
                rows.retain(|r| r.id() != Some(id));
                if rows.len() < before { Removal::Pruned } else { Removal::NotFound }
            }
            CachedValue::Rows(_) => Removal::NotFound,
            CachedValue::Record(record) => {
                if own == table && record.id() == Some(id) {
                    return Removal::WholeRecord;
                }
                match record.get_mut(table.as_str()) {
                    Some(Value::Array(items)) => {
                        let before = items.len();
                        items.retain(|v| v.as_object().and_then(RowExt::id) != Some(id));
                        if items.len() < before { Removal::Pruned } else { Removal::NotFound }
                    }
                    Some(slot @ Value::Object(_)) => {
                        if slot.as_object().and_then(RowExt::id) == Some(id) {
                            *slot = Value::Null;
                            Removal::Pruned
                        } else {
                            Removal::NotFound
                        }
                    }
                    _ => Removal::NotFound,
                }
            }
        }
    }

    /// Insert `row` into a list, or merge it into the existing row with the
    /// same id. Lists with an order column are kept sorted by it.
    ///
    /// Returns `false` for records and for rows without an id.
    pub fn upsert_row(&mut self, row: &Row, order_field: Option<&str>) -> bool {
        let CachedValue::Rows(rows) = self else {
            return false;
        };
        let Some(id) = row.id() else {
            return false;
        };
        match rows.iter_mut().find(|r| r.id() == Some(id)) {
            Some(existing) => existing.merge_from(row),
            None => rows.push(row.clone()),
        }
        if let Some(field) = order_field {
            sort_by_order(rows, field);
        }
        true
    }

    /// Insert `row` of `table` where a value keyed on `own` holds such rows:
    /// a list of them, or a record nesting them under a column named after
    /// `table`. An existing row with the same id is merged instead.
    ///
    /// A nested 1:1 column is only filled while empty. Returns whether the
    /// value changed shape to include the row.
    pub fn insert_row(&mut self, own: Table, table: Table, row: &Row, order_field: Option<&str>) -> bool {
        let record = match self {
            CachedValue::Rows(_) if own == table => return self.upsert_row(row, order_field),
            CachedValue::Rows(_) => return false,
            CachedValue::Record(record) => record,
        };
        let Some(id) = row.id() else {
            return false;
        };
        match record.get_mut(table.as_str()) {
            Some(Value::Array(items)) => {
                match items.iter_mut().filter_map(Value::as_object_mut).find(|r| r.id() == Some(id)) {
                    Some(existing) => existing.merge_from(row),
                    None => items.push(Value::Object(row.clone())),
                }
                if let Some(field) = order_field {
                    sort_values_by_order(items, field);
                }
                true
            }
            Some(Value::Object(existing)) if existing.id() == Some(id) => {
                existing.merge_from(row);
                true
            }
            Some(slot @ Value::Null) => {
                *slot = Value::Object(row.clone());
                true
            }
            _ => false,
        }
    }

    /// Re-sort the rows of `table` in this value by `field`.
    pub fn sort_rows(&mut self, own: Table, table: Table, field: &str) {
        match self {
            CachedValue::Rows(rows) if own == table => sort_by_order(rows, field),
            CachedValue::Rows(_) => {}
            CachedValue::Record(record) => {
                if let Some(Value::Array(items)) = record.get_mut(table.as_str()) {
                    sort_values_by_order(items, field);
                }
            }
        }
    }

    /// Replace a speculative id with the server-assigned one.
    ///
    /// If the server row already arrived (realtime INSERT beat the create
    /// response) the speculative row is dropped instead of duplicated.
    pub fn rekey_row(&mut self, own: Table, table: Table, from: RowId, to: RowId) -> bool {
        if self.contains_row(own, table, to) {
            return self.remove_row(own, table, from) != Removal::NotFound;
        }
        let mut id_patch = Row::new();
        id_patch.insert("id".to_string(), to.to_json());
        self.patch_row(own, table, from, &id_patch)
    }

    /// Append rows from `previous` that this value lacks, keeping their order.
    ///
    /// Used for append-only collections: a refetch never makes an entry the
    /// session has already seen disappear.
    pub fn union_with(&mut self, previous: &CachedValue) {
        let (CachedValue::Rows(rows), CachedValue::Rows(prev)) = (&mut *self, previous) else {
            return;
        };
        for row in prev {
            let id = row.id();
            if id.is_some() && !rows.iter().any(|r| r.id() == id) {
                rows.push(row.clone());
            }
        }
    }
}

/// Stable sort by an integer column; rows without it sink to the end.
pub(crate) fn sort_by_order(rows: &mut [Row], field: &str) {
    rows.sort_by_key(|r| r.int(field).unwrap_or(i64::MAX));
}

fn sort_values_by_order(items: &mut [Value], field: &str) {
    items.sort_by_key(|v| v.get(field).and_then(Value::as_i64).unwrap_or(i64::MAX));
}

fn nested_rows(record: &Row, table: Table) -> Vec<&Row> {
    match record.get(table.as_str()) {
        Some(Value::Array(items)) => items.iter().filter_map(Value::as_object).collect(),
        Some(Value::Object(row)) => vec![row],
        _ => Vec::new(),
    }
}

fn nested_rows_mut(record: &mut Row, table: Table) -> Vec<&mut Row> {
    match record.get_mut(table.as_str()) {
        Some(Value::Array(items)) => items.iter_mut().filter_map(Value::as_object_mut).collect(),
        Some(Value::Object(row)) => vec![row],
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roadmap_types::{field_row, row_from};
    use serde_json::json;

    fn row(id: RowId, extra: Value) -> Row {
        let mut row = row_from(extra);
        row.insert("id".into(), id.to_json());
        row
    }

    fn detail_with_plans(initiative: RowId, plans: &[RowId]) -> CachedValue {
        let mut record = row(initiative, json!({"name": "Search"}));
        let nested: Vec<Value> = plans
            .iter()
            .map(|p| Value::Object(row(*p, json!({"goal": "g"}))))
            .collect();
        record.insert("release_plans".into(), Value::Array(nested));
        record.insert("initial_planning".into(), Value::Null);
        CachedValue::Record(record)
    }

    #[test]
    fn test_find_row_in_list_and_record() {
        let a = RowId::new();
        let list = CachedValue::Rows(vec![row(a, json!({}))]);
        assert!(list.contains_row(Table::Tasks, Table::Tasks, a));
        assert!(!list.contains_row(Table::TaskDeliverables, Table::Tasks, a));

        let record = CachedValue::Record(row(a, json!({})));
        assert!(record.contains_row(Table::Tasks, Table::Tasks, a));
    }

    #[test]
    fn test_nested_rows_are_reachable() {
        let initiative = RowId::new();
        let plan = RowId::new();
        let mut value = detail_with_plans(initiative, &[plan]);
        assert!(value.contains_row(Table::Initiatives, Table::ReleasePlans, plan));

        assert!(value.patch_row(Table::Initiatives, Table::ReleasePlans, plan, &field_row("goal", json!("GA"))));
        let found = value.find_row(Table::Initiatives, Table::ReleasePlans, plan).unwrap();
        assert_eq!(found["goal"], json!("GA"));

        assert_eq!(value.remove_row(Table::Initiatives, Table::ReleasePlans, plan), Removal::Pruned);
        assert!(!value.contains_row(Table::Initiatives, Table::ReleasePlans, plan));
    }

    #[test]
    fn test_remove_self_record_is_whole_record() {
        let id = RowId::new();
        let mut value = CachedValue::Record(row(id, json!({})));
        assert_eq!(value.remove_row(Table::Tasks, Table::Tasks, id), Removal::WholeRecord);
    }

    #[test]
    fn test_upsert_inserts_sorted_and_merges() {
        let a = RowId::new();
        let b = RowId::new();
        let mut value = CachedValue::Rows(vec![row(a, json!({"order_index": 1}))]);
        assert!(value.upsert_row(&row(b, json!({"order_index": 0})), Some("order_index")));
        assert_eq!(value.ids(), vec![b, a]);

        value.upsert_row(&row(b, json!({"order_index": 5})), Some("order_index"));
        assert_eq!(value.ids(), vec![a, b]);
        assert_eq!(value.as_rows().unwrap().len(), 2);
    }

    #[test]
    fn test_upsert_without_id_is_refused() {
        let mut value = CachedValue::Rows(Vec::new());
        assert!(!value.upsert_row(&row_from(json!({"name": "x"})), None));
        assert!(value.as_rows().unwrap().is_empty());
    }

    #[test]
    fn test_rekey_replaces_temp_id() {
        let temp = RowId::new();
        let server = RowId::new();
        let mut value = CachedValue::Rows(vec![row(temp, json!({"name": "new"}))]);
        assert!(value.rekey_row(Table::Tasks, Table::Tasks, temp, server));
        assert_eq!(value.ids(), vec![server]);
    }

    #[test]
    fn test_rekey_dedupes_when_server_row_already_present() {
        let temp = RowId::new();
        let server = RowId::new();
        let mut value = CachedValue::Rows(vec![row(temp, json!({})), row(server, json!({}))]);
        assert!(value.rekey_row(Table::Tasks, Table::Tasks, temp, server));
        assert_eq!(value.ids(), vec![server]);
    }

    #[test]
    fn test_insert_row_into_nested_detail() {
        let initiative = RowId::new();
        let first = RowId::new();
        let mut value = detail_with_plans(initiative, &[first]);
        if let CachedValue::Record(record) = &mut value {
            record["release_plans"][0]["order_index"] = json!(1);
        }

        let fresh = RowId::new();
        let plan = row(fresh, json!({"goal": "beta", "order_index": 0}));
        assert!(value.insert_row(Table::Initiatives, Table::ReleasePlans, &plan, Some("order_index")));
        let record = value.as_record().unwrap();
        let ids: Vec<Option<RowId>> = record["release_plans"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().and_then(RowExt::id))
            .collect();
        assert_eq!(ids, vec![Some(fresh), Some(first)]);

        let planning = RowId::new();
        assert!(value.insert_row(Table::Initiatives, Table::InitialPlanning, &row(planning, json!({})), None));
        assert!(value.contains_row(Table::Initiatives, Table::InitialPlanning, planning));
        // A second 1:1 row does not replace the first.
        assert!(!value.insert_row(Table::Initiatives, Table::InitialPlanning, &row(RowId::new(), json!({})), None));

        // Records that do not nest the table are left alone.
        let mut task = CachedValue::Record(row(RowId::new(), json!({})));
        assert!(!task.insert_row(Table::Tasks, Table::TaskDeliverables, &row(RowId::new(), json!({})), None));
    }

    #[test]
    fn test_sort_rows_reaches_nested_lists() {
        let initiative = RowId::new();
        let [a, b] = [RowId::new(), RowId::new()];
        let mut value = detail_with_plans(initiative, &[a, b]);
        value.patch_row(Table::Initiatives, Table::ReleasePlans, a, &field_row("order_index", json!(1)));
        value.patch_row(Table::Initiatives, Table::ReleasePlans, b, &field_row("order_index", json!(0)));
        value.sort_rows(Table::Initiatives, Table::ReleasePlans, "order_index");

        let plans = value.as_record().unwrap()["release_plans"].as_array().unwrap().clone();
        assert_eq!(plans[0]["id"], b.to_json());
        assert_eq!(plans[1]["id"], a.to_json());
    }

    #[test]
    fn test_union_keeps_previous_entries() {
        let a = RowId::new();
        let b = RowId::new();
        let previous = CachedValue::Rows(vec![row(a, json!({})), row(b, json!({}))]);
        let mut fresh = CachedValue::Rows(vec![row(b, json!({}))]);
        fresh.union_with(&previous);
        assert_eq!(fresh.ids(), vec![b, a]);
    }
}
