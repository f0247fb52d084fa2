use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use livestatus::{DataType, Filter, Request, StatsAggregator, StatsOp, Value};

use crate::catalog::{catalog, Column, Table, UpdateType};
use crate::peer::Peer;
use crate::store::DataTable;
use crate::{Error, Result};

/// Stats partials, keyed by the rendered group-by key. The value keeps the
/// group column values for the output row plus one aggregator per stats
/// expression.
pub(crate) type StatsGroups = BTreeMap<String, (Vec<Value>, Vec<StatsAggregator>)>;

pub(crate) enum PeerOutput {
    /// Projected rows (projection plus sort-only columns).
    Rows(Vec<Vec<Value>>),
    Stats(StatsGroups),
}

/// Everything a per-peer scan needs, precomputed once per request.
#[derive(Clone)]
pub(crate) struct Plan {
    pub table: &'static Table,
    /// The columns the client gets back.
    pub output_names: Vec<String>,
    pub output_len: usize,
    /// Scan columns: projection plus sort keys not already projected.
    pub eff_columns: Vec<String>,
    /// Group-by columns of a stats query (the projection, per protocol).
    pub group_columns: Vec<String>,
    pub stats: Vec<StatsOp>,
    pub filter: Option<Filter>,
    pub auth_user: Option<String>,
}

impl Plan {
    pub fn new(table: &'static Table, req: &Request) -> Result<Plan> {
        let output_names: Vec<String> = if req.columns.is_empty() {
            table.columns.iter().map(|c| c.name.to_string()).collect()
        } else {
            req.columns.clone()
        };
        let mut eff_columns = output_names.clone();
        if req.stats.is_empty() {
            for sort in &req.sort {
                if !eff_columns.contains(&sort.column) {
                    eff_columns.push(sort.column.clone());
                }
            }
        }
        let group_columns = if req.stats.is_empty() {
            Vec::new()
        } else {
            req.columns.clone()
        };
        Ok(Plan {
            table,
            output_len: output_names.len(),
            output_names,
            eff_columns,
            group_columns,
            stats: req.stats.clone(),
            filter: req.filter.clone(),
            auth_user: req.auth_user.clone(),
        })
    }

    /// Position of a column in the scanned row, for sorting.
    pub fn column_pos(&self, name: &str) -> Option<usize> {
        self.eff_columns.iter().position(|c| c == name)
    }
}

/// Scan one peer's snapshot of the target table. Takes shared locks on the
/// main table and any referenced tables for the duration of the scan;
/// the updater can still swap in fresh tables concurrently, readers keep
/// the snapshot they started with.
pub(crate) fn scan_peer(peer: &Arc<Peer>, plan: &Plan) -> Result<PeerOutput> {
    with_peer_view(peer, plan.table, |view, count| {
        scan(count, |row, name| view.value(row, name), plan)
    })
}

/// Run a closure against one peer's locked snapshot of a table, with ref
/// tables resolved. Fails when the peer has not fetched the table yet.
pub(crate) fn with_peer_view<R>(
    peer: &Arc<Peer>,
    table: &'static Table,
    f: impl FnOnce(&RowView<'_>, usize) -> R,
) -> Result<R> {
    let main_arc = peer.table(table.name).ok_or(Error::PeerNotReady)?;
    let main = main_arc.read();
    let ref_names: Vec<&'static str> = table
        .columns
        .iter()
        .filter_map(|c| c.ref_table)
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();
    let ref_arcs: Vec<(&'static str, _)> = ref_names
        .into_iter()
        .filter_map(|name| peer.table(name).map(|arc| (name, arc)))
        .collect();
    let ref_guards: Vec<(&'static str, parking_lot::RwLockReadGuard<'_, DataTable>)> =
        ref_arcs.iter().map(|(name, arc)| (*name, arc.read())).collect();
    let refs: HashMap<&'static str, &DataTable> = ref_guards
        .iter()
        .map(|(name, guard)| (*name, &**guard))
        .collect();
    let view = RowView {
        peer,
        table,
        main: &main,
        refs: &refs,
    };
    let count = main.row_count();
    Ok(f(&view, count))
}

/// Serve a virtual table (backends, columns, tables) from local state.
pub(crate) fn scan_local_table(
    table: &'static Table,
    plan: &Plan,
    peers: &[Arc<Peer>],
) -> PeerOutput {
    let rows: Vec<Vec<Value>> = match table.name {
        "backends" => {
            let columns: Vec<&Column> = table.columns.iter().collect();
            peers.iter().map(|p| p.backends_row(&columns)).collect()
        }
        "columns" => {
            let mut rows = Vec::new();
            for t in catalog().tables() {
                for c in &t.columns {
                    rows.push(vec![
                        Value::Str(t.name.to_string()),
                        Value::Str(c.name.to_string()),
                        Value::Str(type_name(c.data_type).to_string()),
                        Value::Str(update_name(c.update_type).to_string()),
                    ]);
                }
            }
            rows
        }
        "tables" => catalog()
            .tables()
            .iter()
            .map(|t| {
                vec![
                    Value::Str(t.name.to_string()),
                    Value::Int(t.is_virtual as i64),
                    Value::Int(t.passthrough_only as i64),
                    Value::StrList(t.primary_key.iter().map(|k| k.to_string()).collect()),
                ]
            })
            .collect(),
        _ => Vec::new(),
    };
    let get = |row: usize, name: &str| -> Value {
        table
            .column(name)
            .and_then(|c| rows[row].get(c.index).cloned())
            .unwrap_or(Value::Nil)
    };
    scan(rows.len(), get, plan)
}

/// The shared row loop: filter, then either aggregate or project.
fn scan(count: usize, get: impl Fn(usize, &str) -> Value, plan: &Plan) -> PeerOutput {
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut groups: StatsGroups = BTreeMap::new();

    for row in 0..count {
        let get_row = |name: &str| get(row, name);
        if let Some(user) = &plan.auth_user {
            if !authorized(&get_row, plan.table, user) {
                continue;
            }
        }
        if let Some(filter) = &plan.filter {
            if !filter.matches(&get_row) {
                continue;
            }
        }
        if plan.stats.is_empty() {
            rows.push(plan.eff_columns.iter().map(|c| get_row(c)).collect());
            continue;
        }

        let group_values: Vec<Value> =
            plan.group_columns.iter().map(|c| get_row(c)).collect();
        let key = group_values
            .iter()
            .map(|v| v.to_wire_string())
            .collect::<Vec<_>>()
            .join(";");
        let (_, aggs) = groups.entry(key).or_insert_with(|| {
            (
                group_values,
                plan.stats.iter().map(|op| op.new_aggregator()).collect(),
            )
        });
        for (agg, op) in aggs.iter_mut().zip(plan.stats.iter()) {
            match op {
                StatsOp::Count(filter) => {
                    if filter.matches(&get_row) {
                        agg.add_match();
                    }
                }
                other => {
                    if let Some(col) = other.column() {
                        agg.add_value(&get_row(col));
                    }
                }
            }
        }
    }

    if plan.stats.is_empty() {
        PeerOutput::Rows(rows)
    } else {
        PeerOutput::Stats(groups)
    }
}

/// AuthUser visibility: a host is visible to its contacts, a service to
/// its own contacts or the contacts of its host. Other tables stay
/// unrestricted.
fn authorized(get: &impl Fn(&str) -> Value, table: &Table, user: &str) -> bool {
    let in_list = |value: Value| -> bool {
        match value {
            Value::StrList(list) => list.iter().any(|c| c == user),
            _ => false,
        }
    };
    match table.name {
        "hosts" => in_list(get("contacts")),
        "services" => in_list(get("contacts")) || in_list(get("host_contacts")),
        _ => true,
    }
}

/// Cell reads with virtual and cross-table columns resolved.
pub(crate) struct RowView<'a> {
    pub peer: &'a Peer,
    pub table: &'static Table,
    pub main: &'a DataTable,
    pub refs: &'a HashMap<&'static str, &'a DataTable>,
}

impl RowView<'_> {
    pub fn value(&self, row: usize, name: &str) -> Value {
        let Some(column) = self.table.column(name) else {
            return Value::Nil;
        };
        match column.update_type {
            UpdateType::Virtual => self
                .peer
                .virtual_value(column, self.main)
                .unwrap_or(Value::Nil),
            UpdateType::Ref => self.ref_value(row, column),
            _ => self
                .main
                .value_at(row, column)
                .unwrap_or_else(|| column.data_type.empty_value()),
        }
    }

    fn ref_value(&self, row: usize, column: &Column) -> Value {
        let (Some(ref_table), Some(ref_column)) = (column.ref_table, column.ref_column) else {
            return column.data_type.empty_value();
        };
        let Some(dt) = self.refs.get(ref_table) else {
            return column.data_type.empty_value();
        };
        // The join key: a service references its host through host_name.
        let key = match ref_table {
            "hosts" => self
                .table
                .column("host_name")
                .and_then(|c| self.main.value_at(row, c))
                .map(|v| v.to_wire_string()),
            _ => None,
        };
        let Some(key) = key else {
            return column.data_type.empty_value();
        };
        let Some(target) = catalog().column(ref_table, ref_column) else {
            return column.data_type.empty_value();
        };
        dt.find_row(&key)
            .and_then(|r| dt.value_at(r, target))
            .unwrap_or_else(|| column.data_type.empty_value())
    }
}

fn type_name(dt: DataType) -> &'static str {
    match dt {
        DataType::String => "string",
        DataType::Int => "int",
        DataType::Float => "float",
        DataType::Time => "time",
        DataType::StringList => "list",
        DataType::IntList => "list",
        DataType::Hashmap => "dict",
        DataType::CustomVariables => "dict",
        DataType::ServiceList => "list",
    }
}

fn update_name(ut: UpdateType) -> &'static str {
    match ut {
        UpdateType::Static => "static",
        UpdateType::Dynamic => "dynamic",
        UpdateType::None => "none",
        UpdateType::Virtual => "virtual",
        UpdateType::Ref => "ref",
    }
}
