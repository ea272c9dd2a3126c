//! Virtual-table index advisory protocol.
//!
//! The planner describes the usable WHERE constraints and the requested
//! output order; the table implementation picks the constraints it will
//! consume and reports a cost. Implementations are injected per table kind
//! through [`TableKind::Virtual`](crate::schema::TableKind::Virtual).

use whereplan_error::Result;

/// Comparison operator for an index constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintOp {
    Eq,
    Gt,
    Le,
    Lt,
    Ge,
    Match,
}

/// A single constraint from the WHERE clause that the planner is considering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexConstraint {
    /// Column index (0-based; `-1` for rowid).
    pub column: i32,
    /// The comparison operator.
    pub op: ConstraintOp,
    /// Whether the right-hand side is computable at this join position.
    pub usable: bool,
}

/// A single ORDER BY term from the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexOrderBy {
    /// Column index (0-based).
    pub column: i32,
    /// `true` if descending.
    pub desc: bool,
}

/// Per-constraint usage information set by `best_index`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexConstraintUsage {
    /// 1-based index into the `xFilter` argument array; 0 means unused.
    pub argv_index: i32,
    /// If `true`, the table guarantees the constraint and the core skips
    /// re-checking it.
    pub omit: bool,
}

/// Information exchanged between the planner and a virtual table during
/// index selection.
///
/// The planner fills `constraints` and `order_by`. The table fills
/// `constraint_usage`, `idx_num`, `idx_str`, `order_by_consumed`,
/// `estimated_cost` and `estimated_rows`.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexInfo {
    pub constraints: Vec<IndexConstraint>,
    pub order_by: Vec<IndexOrderBy>,
    pub constraint_usage: Vec<IndexConstraintUsage>,
    /// Integer identifier for the chosen strategy, passed back to `xFilter`.
    pub idx_num: i32,
    /// Optional string identifier for the chosen strategy.
    pub idx_str: Option<String>,
    /// Whether output is already in `order_by` order.
    pub order_by_consumed: bool,
    pub estimated_cost: f64,
    pub estimated_rows: i64,
}

impl IndexInfo {
    /// Create a new `IndexInfo` with the given constraints and order-by terms.
    #[must_use]
    pub fn new(constraints: Vec<IndexConstraint>, order_by: Vec<IndexOrderBy>) -> Self {
        let usage_len = constraints.len();
        Self {
            constraints,
            order_by,
            constraint_usage: vec![IndexConstraintUsage::default(); usage_len],
            idx_num: 0,
            idx_str: None,
            order_by_consumed: false,
            estimated_cost: f64::MAX / 2.0,
            estimated_rows: 25,
        }
    }

    /// Clear everything the table reported, keeping the planner's input.
    pub fn reset_output(&mut self) {
        for usage in &mut self.constraint_usage {
            *usage = IndexConstraintUsage::default();
        }
        self.idx_num = 0;
        self.idx_str = None;
        self.order_by_consumed = false;
        self.estimated_cost = f64::MAX / 2.0;
        self.estimated_rows = 25;
    }
}

/// Capability interface a virtual table kind implements so the cost model can
/// ask it for a plan.
pub trait VirtualTableAdvisor: Send + Sync {
    /// Inform the planner about the best way to evaluate `info`.
    ///
    /// An error aborts the compilation with a message naming the table.
    fn best_index(&self, info: &mut IndexInfo) -> Result<()>;
}

impl std::fmt::Debug for dyn VirtualTableAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VirtualTableAdvisor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_info_new_sizes_usage() {
        let info = IndexInfo::new(
            vec![
                IndexConstraint {
                    column: 0,
                    op: ConstraintOp::Eq,
                    usable: true,
                },
                IndexConstraint {
                    column: 1,
                    op: ConstraintOp::Match,
                    usable: false,
                },
            ],
            vec![IndexOrderBy {
                column: 0,
                desc: false,
            }],
        );
        assert_eq!(info.constraint_usage.len(), 2);
        assert!(!info.order_by_consumed);
    }

    #[test]
    fn test_reset_output_clears_table_fields() {
        let mut info = IndexInfo::new(
            vec![IndexConstraint {
                column: 0,
                op: ConstraintOp::Eq,
                usable: true,
            }],
            Vec::new(),
        );
        info.constraint_usage[0].argv_index = 1;
        info.idx_str = Some("x".to_owned());
        info.reset_output();
        assert_eq!(info.constraint_usage[0], IndexConstraintUsage::default());
        assert!(info.idx_str.is_none());
    }
}
