//! Mapping from sparse cursor numbers to dense table bits.
//!
//! Every "set of tables" in the planner is a [`Bitmask`]. Bit `i` belongs to
//! the `i`-th distinct cursor registered with [`MaskSet::create_bit`].

use smallvec::SmallVec;
use whereplan_ast::{Expr, InSet, Select};
use whereplan_error::{PlanError, Result};
use whereplan_types::CursorId;

/// A set of tables.
pub type Bitmask = u64;

/// Number of cursors a [`MaskSet`] can hold.
pub const MAX_TABLES: usize = 63;

/// Every table.
pub const ALL_TABLES: Bitmask = Bitmask::MAX;

/// Cursor-to-bit registry for one WHERE-clause compilation.
#[derive(Debug, Clone, Default)]
pub struct MaskSet {
    cursors: SmallVec<[CursorId; 8]>,
}

impl MaskSet {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign the next free bit to `cursor`.
    ///
    /// Registering a cursor twice keeps its first bit.
    pub fn create_bit(&mut self, cursor: CursorId) -> Result<()> {
        if self.cursors.contains(&cursor) {
            return Ok(());
        }
        if self.cursors.len() >= MAX_TABLES {
            return Err(PlanError::TooManyTables { limit: MAX_TABLES });
        }
        self.cursors.push(cursor);
        Ok(())
    }

    /// The single-bit mask for `cursor`, or 0 if it was never registered.
    pub fn bit_for(&self, cursor: CursorId) -> Bitmask {
        self.cursors
            .iter()
            .position(|&c| c == cursor)
            .map_or(0, |i| 1 << i)
    }

    /// Number of registered cursors.
    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Tables referenced anywhere in `expr`, including inside subqueries.
    pub fn expr_usage(&self, expr: &Expr) -> Bitmask {
        match expr {
            Expr::Literal(_) | Expr::Variable { .. } => 0,
            Expr::Column(c) => self.bit_for(c.cursor),
            Expr::BinaryOp { left, right, .. } => self.expr_usage(left) | self.expr_usage(right),
            Expr::UnaryOp { expr, .. } | Expr::Collate { expr, .. } | Expr::IsNull { expr, .. } => {
                self.expr_usage(expr)
            }
            Expr::Between {
                expr, low, high, ..
            } => self.expr_usage(expr) | self.expr_usage(low) | self.expr_usage(high),
            Expr::In { expr, set, .. } => self.expr_usage(expr) | self.in_set_usage(set),
            Expr::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                self.expr_usage(expr)
                    | self.expr_usage(pattern)
                    | escape.as_deref().map_or(0, |e| self.expr_usage(e))
            }
            Expr::FunctionCall { args, .. } => self.list_usage(args),
            Expr::Exists { subquery, .. } | Expr::Subquery(subquery) => {
                self.select_usage(subquery)
            }
        }
    }

    /// Tables referenced by the right-hand side of an IN operator.
    pub fn in_set_usage(&self, set: &InSet) -> Bitmask {
        match set {
            InSet::List(items) => self.list_usage(items),
            InSet::Subquery(sel) => self.select_usage(sel),
        }
    }

    pub fn list_usage(&self, list: &[Expr]) -> Bitmask {
        list.iter().fold(0, |m, e| m | self.expr_usage(e))
    }

    /// Tables referenced anywhere in a subquery, including compound arms.
    pub fn select_usage(&self, select: &Select) -> Bitmask {
        let mut mask = 0;
        let mut current = Some(select);
        while let Some(sel) = current {
            mask |= self.list_usage(&sel.columns);
            mask |= self.list_usage(&sel.group_by);
            mask |= self.list_usage(&sel.order_by);
            mask |= sel.where_clause.as_deref().map_or(0, |e| self.expr_usage(e));
            mask |= sel.having.as_deref().map_or(0, |e| self.expr_usage(e));
            for item in &sel.from {
                mask |= item.subquery.as_deref().map_or(0, |s| self.select_usage(s));
                mask |= item.on.as_ref().map_or(0, |e| self.expr_usage(e));
            }
            current = sel.prior.as_deref();
        }
        mask
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whereplan_ast::{BinaryOp, SelectSource};
    use whereplan_types::TypeAffinity;

    #[test]
    fn test_bits_assigned_in_first_seen_order() {
        let mut ms = MaskSet::new();
        for cursor in [7, 3, 7, 11] {
            ms.create_bit(cursor).expect("capacity");
        }
        assert_eq!(ms.len(), 3);
        assert_eq!(ms.bit_for(7), 1);
        assert_eq!(ms.bit_for(3), 2);
        assert_eq!(ms.bit_for(11), 4);
        assert_eq!(ms.bit_for(99), 0);
    }

    #[test]
    fn test_capacity_exceeded() {
        let mut ms = MaskSet::new();
        for cursor in 0..63 {
            ms.create_bit(cursor).expect("capacity");
        }
        let err = ms.create_bit(63).expect_err("64th table rejected");
        assert_eq!(err, PlanError::TooManyTables { limit: 63 });
    }

    #[test]
    fn test_subquery_usage_is_not_opaque() {
        let mut ms = MaskSet::new();
        ms.create_bit(0).expect("capacity");
        ms.create_bit(1).expect("capacity");
        let inner_where = Expr::binary(
            Expr::column(5, 0, TypeAffinity::Integer),
            BinaryOp::Eq,
            Expr::column(1, 0, TypeAffinity::Integer),
        );
        let sub = Select {
            columns: vec![Expr::integer(1)],
            from: vec![SelectSource {
                cursor: 5,
                subquery: None,
                on: None,
            }],
            where_clause: Some(Box::new(inner_where)),
            ..Select::default()
        };
        let e = Expr::Exists {
            subquery: Box::new(sub),
            not: false,
        };
        assert_eq!(ms.expr_usage(&e), 2);
    }
}
