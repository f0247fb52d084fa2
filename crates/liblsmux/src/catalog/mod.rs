mod defs;

use std::collections::HashMap;
use std::sync::OnceLock;

use livestatus::DataType;

/// How a column gets its value during refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateType {
    /// Fetched once per full refresh, assumed stable between restarts.
    Static,
    /// Fetched on every delta refresh.
    Dynamic,
    /// Fetched on full refresh only, not worth delta traffic.
    None,
    /// Computed from peer identity or local bookkeeping, never fetched.
    Virtual,
    /// Joined from another table through (ref_table, ref_column).
    Ref,
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: &'static str,
    pub data_type: DataType,
    pub update_type: UpdateType,
    /// Position in the table's column list.
    pub index: usize,
    pub ref_table: Option<&'static str>,
    pub ref_column: Option<&'static str>,
    /// Computed from peer state on this side, never part of backend queries.
    pub local_only: bool,
}

impl Column {
    pub fn is_fetchable(&self) -> bool {
        !self.local_only
            && matches!(
                self.update_type,
                UpdateType::Static | UpdateType::Dynamic | UpdateType::None
            )
    }
}

#[derive(Debug)]
pub struct Table {
    pub name: &'static str,
    pub columns: Vec<Column>,
    /// Served entirely from local peer bookkeeping (backends, columns, tables).
    pub is_virtual: bool,
    /// Requests are forwarded verbatim to each peer (log).
    pub passthrough_only: bool,
    pub group_by: bool,
    /// Columns forming the natural key, joined with ';' for the row index.
    pub primary_key: &'static [&'static str],
    by_name: HashMap<&'static str, usize>,
}

impl Table {
    fn new(
        name: &'static str,
        columns: Vec<Column>,
        is_virtual: bool,
        passthrough_only: bool,
        group_by: bool,
        primary_key: &'static [&'static str],
    ) -> Self {
        let by_name = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name, i))
            .collect();
        Self {
            name,
            columns,
            is_virtual,
            passthrough_only,
            group_by,
            primary_key,
            by_name,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.by_name.get(name).map(|&i| &self.columns[i])
    }

    /// Columns requested from a backend on a full refresh.
    pub fn fetchable_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| c.is_fetchable())
    }

    /// Columns re-requested on every delta refresh.
    pub fn dynamic_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns
            .iter()
            .filter(|c| !c.local_only && c.update_type == UpdateType::Dynamic)
    }

    /// Does the updater refresh this table from the peer at all?
    pub fn is_fetched(&self) -> bool {
        !self.is_virtual && !self.passthrough_only
    }

    /// Tables with change markers get incremental refreshes; the others are
    /// re-fetched whole when their id set moves.
    pub fn has_change_markers(&self) -> bool {
        self.column("last_check").is_some() && self.column("last_state_change").is_some()
    }
}

#[derive(Debug)]
pub struct Catalog {
    tables: Vec<Table>,
    by_name: HashMap<&'static str, usize>,
}

impl Catalog {
    pub fn tables(&self) -> &[Table] {
        &self.tables
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        let name = match name {
            // Alias kept for clients that know the table by its other name.
            "sites" => "backends",
            other => other,
        };
        self.by_name.get(name).map(|&i| &self.tables[i])
    }

    pub fn column(&self, table: &str, name: &str) -> Option<&Column> {
        self.table(table)?.column(name)
    }
}

static CATALOG: OnceLock<Catalog> = OnceLock::new();

/// The process-wide column catalog, frozen after first use.
pub fn catalog() -> &'static Catalog {
    CATALOG.get_or_init(|| {
        let tables = defs::build_tables();
        let by_name = tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name, i))
            .collect();
        Catalog { tables, by_name }
    })
}
