//! Catalog descriptors: tables, indexes, and the FROM list of one query.
//!
//! The planner treats all of these as read-only. Statistics live on the
//! descriptors (`row_estimates`, `samples`) and are filled by the loaders in
//! the planner crate or supplied directly by the host.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use whereplan_types::{CursorId, SqliteValue, TypeAffinity};

use crate::Expr;
use crate::vtab::VirtualTableAdvisor;

/// Default row count assumed for a table that was never analyzed.
pub const DEFAULT_TABLE_ROWS: u64 = 1_000_000;

/// Column definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDescriptor {
    pub name: String,
    pub affinity: TypeAffinity,
    /// Declared collating sequence (`None` = BINARY).
    pub collation: Option<String>,
    pub not_null: bool,
}

impl ColumnDescriptor {
    #[must_use]
    pub fn new(name: &str, affinity: TypeAffinity) -> Self {
        Self {
            name: name.to_owned(),
            affinity,
            collation: None,
            not_null: false,
        }
    }
}

/// One column of an index key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Table column number.
    pub column: i32,
    /// Collating sequence of this key column (`None` = BINARY).
    pub collation: Option<String>,
    pub descending: bool,
}

/// A histogram sample: one sampled key of the leftmost index column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSample {
    pub value: SqliteValue,
    /// Rows whose key equals `value`.
    pub n_eq: u64,
    /// Rows whose key is less than `value`.
    pub n_lt: u64,
    /// Distinct keys less than `value`.
    pub n_dlt: u64,
}

/// An index on a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDescriptor {
    pub name: String,
    pub table: String,
    pub root_page: i32,
    pub columns: Vec<IndexColumn>,
    /// `UNIQUE` or primary-key index.
    pub unique: bool,
    /// `row_estimates[0]` is the row count; `row_estimates[i]` is the average
    /// number of rows sharing the same first `i` key columns.
    pub row_estimates: Vec<u64>,
    /// Sorted histogram samples on the first key column.
    pub samples: Vec<IndexSample>,
    /// Average rows per key for keys that are not sampled.
    pub avg_eq: u64,
    /// The index exists but its scan order must not be relied upon.
    pub unordered: bool,
}

impl IndexDescriptor {
    /// Create an index with default row estimates for a table of
    /// `table_rows` rows.
    #[must_use]
    pub fn new(name: &str, table: &str, columns: Vec<IndexColumn>, unique: bool) -> Self {
        let mut idx = Self {
            name: name.to_owned(),
            table: table.to_owned(),
            root_page: 0,
            columns,
            unique,
            row_estimates: Vec::new(),
            samples: Vec::new(),
            avg_eq: 0,
            unordered: false,
        };
        idx.set_default_row_estimates(DEFAULT_TABLE_ROWS);
        idx
    }

    /// Convenience constructor for an ascending BINARY index on `columns`.
    #[must_use]
    pub fn on_columns(name: &str, table: &str, columns: &[i32], unique: bool) -> Self {
        let cols = columns
            .iter()
            .map(|&column| IndexColumn {
                column,
                collation: None,
                descending: false,
            })
            .collect();
        Self::new(name, table, cols, unique)
    }

    /// Number of key columns.
    pub fn n_columns(&self) -> usize {
        self.columns.len()
    }

    /// Position of table column `column` within the key, if present.
    pub fn position_of(&self, column: i32) -> Option<usize> {
        self.columns.iter().position(|c| c.column == column)
    }

    /// Fill `row_estimates` the way an unanalyzed index is estimated:
    /// ten rows per key on the first column, one fewer per extra column down
    /// to five, and exactly one for the full key of a unique index.
    pub fn set_default_row_estimates(&mut self, table_rows: u64) {
        let n = self.columns.len();
        self.row_estimates.clear();
        self.row_estimates.push(table_rows.max(10));
        let mut per_key = 10u64;
        for _ in 0..n {
            self.row_estimates.push(per_key);
            if per_key > 5 {
                per_key -= 1;
            }
        }
        if self.unique && n > 0 {
            self.row_estimates[n] = 1;
        }
        self.avg_eq = self.row_estimates.get(1).copied().unwrap_or(1);
    }
}

/// What kind of object a FROM item refers to.
#[derive(Clone)]
pub enum TableKind {
    Ordinary,
    View,
    /// A virtual table; the advisor answers `bestIndex` requests.
    Virtual(Arc<dyn VirtualTableAdvisor>),
}

impl std::fmt::Debug for TableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ordinary => f.write_str("Ordinary"),
            Self::View => f.write_str("View"),
            Self::Virtual(_) => f.write_str("Virtual"),
        }
    }
}

/// A table definition.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    pub name: String,
    pub root_page: i32,
    pub columns: Vec<ColumnDescriptor>,
    pub indexes: Vec<Arc<IndexDescriptor>>,
    /// Estimated row count.
    pub row_estimate: u64,
    pub kind: TableKind,
}

impl TableDescriptor {
    #[must_use]
    pub fn new(name: &str, columns: Vec<ColumnDescriptor>) -> Self {
        Self {
            name: name.to_owned(),
            root_page: 0,
            columns,
            indexes: Vec::new(),
            row_estimate: DEFAULT_TABLE_ROWS,
            kind: TableKind::Ordinary,
        }
    }

    /// Whether this is a virtual table.
    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, TableKind::Virtual(_))
    }

    /// Affinity of column `column` (the rowid is INTEGER).
    pub fn column_affinity(&self, column: i32) -> TypeAffinity {
        usize::try_from(column)
            .ok()
            .and_then(|i| self.columns.get(i))
            .map_or(TypeAffinity::Integer, |c| c.affinity)
    }

    /// Declared collation of column `column`.
    pub fn column_collation(&self, column: i32) -> Option<&str> {
        usize::try_from(column)
            .ok()
            .and_then(|i| self.columns.get(i))
            .and_then(|c| c.collation.as_deref())
    }

    /// Find an index by name (case-insensitive).
    pub fn index_named(&self, name: &str) -> Option<&Arc<IndexDescriptor>> {
        self.indexes.iter().find(|i| i.name.eq_ignore_ascii_case(name))
    }
}

/// The join operator that precedes a FROM item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JoinType {
    /// Plain comma or `INNER JOIN`.
    #[default]
    Inner,
    /// `CROSS JOIN`: the item may not move ahead of its left neighbour.
    Cross,
    /// `LEFT [OUTER] JOIN`.
    Left,
}

/// `INDEXED BY` / `NOT INDEXED` clause on a FROM item.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndexHint {
    #[default]
    None,
    IndexedBy(String),
    NotIndexed,
}

/// One item of the FROM clause.
#[derive(Debug, Clone)]
pub struct FromItem {
    pub table: Arc<TableDescriptor>,
    pub cursor: CursorId,
    pub join_type: JoinType,
    pub index_hint: IndexHint,
    /// The item is a correlated subquery that is re-evaluated per outer row.
    pub correlated: bool,
    /// `ON` constraint attached to this item; its terms are planned with
    /// the rest of the WHERE clause but remember which join they came from.
    pub on_clause: Option<Expr>,
    /// Bit `i` set when column `i` is read by the statement; bit 63 stands
    /// for every column numbered 63 and above.
    pub columns_used: u64,
}

impl FromItem {
    #[must_use]
    pub fn new(table: Arc<TableDescriptor>, cursor: CursorId) -> Self {
        Self {
            table,
            cursor,
            join_type: JoinType::Inner,
            index_hint: IndexHint::None,
            correlated: false,
            on_clause: None,
            columns_used: 0,
        }
    }

    /// Mark column `column` as read by the statement.
    pub fn use_column(&mut self, column: i32) {
        if let Ok(c) = u32::try_from(column) {
            self.columns_used |= 1u64 << c.min(63);
        }
    }

    /// The `INDEXED BY` index name, if any.
    pub fn indexed_by(&self) -> Option<&str> {
        match &self.index_hint {
            IndexHint::IndexedBy(name) => Some(name),
            _ => None,
        }
    }
}

/// The FROM clause of the statement being planned.
pub type SrcList = SmallVec<[FromItem; 4]>;

/// Result of a catalog lookup.
#[derive(Debug, Clone)]
pub enum Lookup<T> {
    Found(T),
    /// Nothing by that name.
    NotFound,
    /// Something by that name exists but is not usable here (for example a
    /// view where a table is required).
    WrongKind,
}

impl<T> Lookup<T> {
    /// The found value, if any.
    pub fn found(self) -> Option<T> {
        match self {
            Self::Found(v) => Some(v),
            _ => None,
        }
    }
}

/// Catalog lookups the planner and the statistics loaders need.
pub trait Catalog {
    fn lookup_table(&self, name: &str, schema: Option<&str>) -> Lookup<Arc<TableDescriptor>>;
    fn lookup_index(&self, name: &str, schema: Option<&str>) -> Lookup<Arc<IndexDescriptor>>;
}

/// An in-memory catalog keyed by lower-cased name.
#[derive(Debug, Clone, Default)]
pub struct MemoryCatalog {
    tables: HashMap<String, Arc<TableDescriptor>>,
}

impl MemoryCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a table (and with it, its indexes).
    pub fn insert(&mut self, table: TableDescriptor) -> Arc<TableDescriptor> {
        let table = Arc::new(table);
        self.tables
            .insert(table.name.to_ascii_lowercase(), Arc::clone(&table));
        table
    }

    /// Iterate over every table.
    pub fn tables(&self) -> impl Iterator<Item = &Arc<TableDescriptor>> {
        self.tables.values()
    }

    /// Mutable access to a table, cloning it out of any shared `Arc`.
    pub fn table_mut(&mut self, name: &str) -> Option<&mut TableDescriptor> {
        self.tables
            .get_mut(&name.to_ascii_lowercase())
            .map(Arc::make_mut)
    }
}

impl Catalog for MemoryCatalog {
    fn lookup_table(&self, name: &str, _schema: Option<&str>) -> Lookup<Arc<TableDescriptor>> {
        match self.tables.get(&name.to_ascii_lowercase()) {
            Some(t) if matches!(t.kind, TableKind::View) => Lookup::WrongKind,
            Some(t) => Lookup::Found(Arc::clone(t)),
            None => Lookup::NotFound,
        }
    }

    fn lookup_index(&self, name: &str, _schema: Option<&str>) -> Lookup<Arc<IndexDescriptor>> {
        self.tables
            .values()
            .find_map(|t| t.index_named(name).cloned())
            .map_or(Lookup::NotFound, Lookup::Found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_row_estimates() {
        let idx = IndexDescriptor::on_columns("i", "t", &[0, 1, 2, 3, 4, 5, 6], false);
        assert_eq!(idx.row_estimates, vec![1_000_000, 10, 9, 8, 7, 6, 5, 5]);
        assert_eq!(idx.avg_eq, 10);

        let uniq = IndexDescriptor::on_columns("u", "t", &[0, 1], true);
        assert_eq!(uniq.row_estimates, vec![1_000_000, 10, 1]);
    }

    #[test]
    fn test_small_table_row_estimate_floor() {
        let mut idx = IndexDescriptor::on_columns("i", "t", &[0], false);
        idx.set_default_row_estimates(3);
        assert_eq!(idx.row_estimates[0], 10);
    }

    #[test]
    fn test_catalog_distinguishes_views() {
        let mut cat = MemoryCatalog::new();
        cat.insert(TableDescriptor::new("t1", Vec::new()));
        let mut v = TableDescriptor::new("v1", Vec::new());
        v.kind = TableKind::View;
        cat.insert(v);
        assert!(matches!(cat.lookup_table("T1", None), Lookup::Found(_)));
        assert!(matches!(cat.lookup_table("v1", None), Lookup::WrongKind));
        assert!(matches!(cat.lookup_table("nope", None), Lookup::NotFound));
    }

    #[test]
    fn test_columns_used_saturates_at_bit_63() {
        let mut item = FromItem::new(Arc::new(TableDescriptor::new("t", Vec::new())), 0);
        item.use_column(2);
        item.use_column(200);
        assert_eq!(item.columns_used, (1 << 2) | (1 << 63));
        item.use_column(-1);
        assert_eq!(item.columns_used, (1 << 2) | (1 << 63));
    }
}
