use std::collections::HashMap;

use livestatus::Value;
use tracing::warn;

use crate::catalog::{Column, Table};

/// One peer's copy of one table. Rows are stored column-major over the
/// column set actually fetched from the peer; virtual and ref columns are
/// computed by the owner, never stored here.
///
/// Full refreshes build a fresh `DataTable` and swap the `Arc` holding it,
/// so readers that already cloned the handle keep a consistent snapshot.
/// Delta refreshes mutate dynamic columns in place under the table's write
/// lock.
#[derive(Debug)]
pub struct DataTable {
    pub table: &'static Table,
    /// Fetched columns, in the order rows arrive from the peer.
    columns: Vec<&'static Column>,
    /// Column name -> position in `columns` / `data`.
    col_pos: HashMap<&'static str, usize>,
    /// Positions (within `columns`) of the natural-key columns.
    key_pos: Vec<usize>,
    /// data[column position][row index]
    data: Vec<Vec<Value>>,
    /// natural key -> row index. Rebuilt on full replace, stable on deltas.
    index: HashMap<String, usize>,
    pub last_full_update: i64,
    pub last_delta_update: i64,
}

impl DataTable {
    pub fn new(table: &'static Table, columns: Vec<&'static Column>) -> Self {
        let col_pos: HashMap<&'static str, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name, i))
            .collect();
        let key_pos = table
            .primary_key
            .iter()
            .filter_map(|k| col_pos.get(k).copied())
            .collect();
        let data = vec![Vec::new(); columns.len()];
        Self {
            table,
            columns,
            col_pos,
            key_pos,
            data,
            index: HashMap::new(),
            last_full_update: 0,
            last_delta_update: 0,
        }
    }

    pub fn from_rows(
        table: &'static Table,
        columns: Vec<&'static Column>,
        rows: Vec<Vec<Value>>,
        now: i64,
    ) -> Self {
        let mut dt = Self::new(table, columns);
        dt.replace_full(rows, now);
        dt
    }

    pub fn columns(&self) -> &[&'static Column] {
        &self.columns
    }

    pub fn row_count(&self) -> usize {
        self.data.first().map(|c| c.len()).unwrap_or(0)
    }

    pub fn find_row(&self, key: &str) -> Option<usize> {
        self.index.get(key).copied()
    }

    pub fn natural_key_of(&self, row: usize) -> String {
        join_key(self.key_pos.iter().map(|&p| &self.data[p][row]))
    }

    /// Replace all rows. Rows with the wrong arity are dropped, they mean
    /// the peer answered a different column set than we asked for.
    pub fn replace_full(&mut self, rows: Vec<Vec<Value>>, now: i64) {
        for col in &mut self.data {
            col.clear();
        }
        self.index.clear();
        for row in rows {
            if row.len() != self.columns.len() {
                warn!(
                    table = self.table.name,
                    expected = self.columns.len(),
                    got = row.len(),
                    "dropping row with wrong arity"
                );
                continue;
            }
            let row_idx = self.row_count();
            let key = join_key(self.key_pos.iter().map(|&p| &row[p]));
            for (pos, cell) in row.into_iter().enumerate() {
                self.data[pos].push(cell);
            }
            self.index.insert(key, row_idx);
        }
        self.last_full_update = now;
        self.last_delta_update = now;
    }

    /// Apply a delta result. `columns` describes the arriving rows in
    /// order; it must contain the natural-key columns. Rows whose key is
    /// not present are dropped, the next full refresh resynchronizes
    /// membership. Returns how many rows were updated.
    pub fn apply_delta(
        &mut self,
        columns: &[&'static Column],
        rows: &[Vec<Value>],
        now: i64,
    ) -> usize {
        let incoming_key_pos: Vec<usize> = self
            .table
            .primary_key
            .iter()
            .filter_map(|k| columns.iter().position(|c| c.name == *k))
            .collect();
        if incoming_key_pos.len() != self.table.primary_key.len() {
            warn!(table = self.table.name, "delta without key columns, ignored");
            return 0;
        }
        // Map incoming position -> stored position, skipping the key
        // columns and anything we never stored.
        let targets: Vec<(usize, usize)> = columns
            .iter()
            .enumerate()
            .filter(|(pos, c)| {
                !incoming_key_pos.contains(pos) && self.col_pos.contains_key(c.name)
            })
            .map(|(pos, c)| (pos, self.col_pos[c.name]))
            .collect();

        let mut updated = 0;
        for row in rows {
            if row.len() != columns.len() {
                continue;
            }
            let key = join_key(incoming_key_pos.iter().map(|&p| &row[p]));
            let Some(&row_idx) = self.index.get(&key) else {
                continue;
            };
            for &(src, dst) in &targets {
                self.data[dst][row_idx] = row[src].clone();
            }
            updated += 1;
        }
        self.last_delta_update = now;
        updated
    }

    /// Read one stored cell. Fetchable columns the peer did not expose
    /// yield their type's empty value; virtual and ref columns are not
    /// this table's business and yield None.
    pub fn value_at(&self, row: usize, column: &Column) -> Option<Value> {
        if let Some(&pos) = self.col_pos.get(column.name) {
            return self.data[pos].get(row).cloned();
        }
        if column.is_fetchable() {
            return Some(column.data_type.empty_value());
        }
        None
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let len = self.row_count();
        for (pos, col) in self.data.iter().enumerate() {
            assert_eq!(col.len(), len, "column {pos} length mismatch");
        }
        assert_eq!(self.index.len(), len, "key index incomplete");
        for (key, &row) in &self.index {
            assert!(row < len);
            assert_eq!(&self.natural_key_of(row), key);
        }
    }
}

fn join_key<'a>(parts: impl Iterator<Item = &'a Value>) -> String {
    let mut out = String::new();
    for (i, v) in parts.enumerate() {
        if i > 0 {
            out.push(';');
        }
        out.push_str(&v.to_wire_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::catalog;

    fn host_columns(names: &[&str]) -> Vec<&'static Column> {
        let table = catalog().table("hosts").unwrap();
        names.iter().map(|n| table.column(n).unwrap()).collect()
    }

    fn sample() -> DataTable {
        let table = catalog().table("hosts").unwrap();
        let columns = host_columns(&["name", "state", "last_check"]);
        DataTable::from_rows(
            table,
            columns,
            vec![
                vec![Value::Str("a".into()), Value::Int(0), Value::Int(100)],
                vec![Value::Str("b".into()), Value::Int(1), Value::Int(100)],
                vec![Value::Str("c".into()), Value::Int(0), Value::Int(90)],
            ],
            1000,
        )
    }

    #[test]
    fn full_replace_builds_consistent_index() {
        let dt = sample();
        dt.check_invariants();
        assert_eq!(dt.row_count(), 3);
        assert_eq!(dt.find_row("b"), Some(1));
        assert_eq!(
            dt.value_at(1, catalog().column("hosts", "state").unwrap()),
            Some(Value::Int(1))
        );
    }

    #[test]
    fn unfetched_fetchable_columns_read_as_empty() {
        let dt = sample();
        let alias = catalog().column("hosts", "alias").unwrap();
        assert_eq!(dt.value_at(0, alias), Some(Value::Str(String::new())));
        let peer_key = catalog().column("hosts", "peer_key").unwrap();
        assert_eq!(dt.value_at(0, peer_key), None);
    }

    #[test]
    fn delta_updates_matching_rows_and_drops_unknown_keys() {
        let mut dt = sample();
        let delta_cols = host_columns(&["name", "state", "last_check"]);
        let updated = dt.apply_delta(
            &delta_cols,
            &[
                vec![Value::Str("b".into()), Value::Int(2), Value::Int(200)],
                vec![Value::Str("nope".into()), Value::Int(2), Value::Int(200)],
            ],
            2000,
        );
        assert_eq!(updated, 1);
        dt.check_invariants();
        assert_eq!(dt.row_count(), 3);
        assert_eq!(
            dt.value_at(1, catalog().column("hosts", "state").unwrap()),
            Some(Value::Int(2))
        );
        assert_eq!(dt.last_delta_update, 2000);
        // Key map is untouched by deltas.
        assert_eq!(dt.find_row("b"), Some(1));
    }

    #[test]
    fn composite_service_keys() {
        let table = catalog().table("services").unwrap();
        let columns: Vec<_> = ["host_name", "description", "state"]
            .iter()
            .map(|n| table.column(n).unwrap())
            .collect();
        let dt = DataTable::from_rows(
            table,
            columns,
            vec![
                vec![
                    Value::Str("web01".into()),
                    Value::Str("ping".into()),
                    Value::Int(0),
                ],
                vec![
                    Value::Str("web01".into()),
                    Value::Str("http".into()),
                    Value::Int(2),
                ],
            ],
            1,
        );
        dt.check_invariants();
        assert_eq!(dt.find_row("web01;http"), Some(1));
    }

    #[test]
    fn wrong_arity_rows_are_dropped() {
        let table = catalog().table("hosts").unwrap();
        let columns = host_columns(&["name", "state"]);
        let dt = DataTable::from_rows(
            table,
            columns,
            vec![
                vec![Value::Str("a".into()), Value::Int(0)],
                vec![Value::Str("broken".into())],
            ],
            1,
        );
        dt.check_invariants();
        assert_eq!(dt.row_count(), 1);
    }
}
