//! WHERE-clause terms.
//!
//! A [`WhereClause`] is a flat list of [`WhereTerm`]s produced by splitting
//! the WHERE expression on AND (or an OR sub-expression on OR). Terms refer
//! to one another by index only: decomposition appends synthetic terms while
//! earlier ones are still being analyzed, so nothing may hold a reference
//! into the list across an append.

use std::borrow::Cow;
use std::cell::Cell;

use bitflags::bitflags;
use whereplan_ast::{BinaryOp, Expr, IndexDescriptor, InSet, comparison_collation};
use whereplan_types::collation::same_collation;
use whereplan_types::{CursorId, TypeAffinity};

use crate::bitmask::Bitmask;

bitflags! {
    /// Operator class of a term, one bit per class so that a set of
    /// acceptable operators is a single mask.
    ///
    /// The four inequalities sit at `EQ << (op - Eq)` for the comparison
    /// order `Eq, Gt, Le, Lt, Ge`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OperatorMask: u16 {
        const IN = 0x001;
        const EQ = 0x002;
        const GT = 0x004;
        const LE = 0x008;
        const LT = 0x010;
        const GE = 0x020;
        const MATCH = 0x040;
        const ISNULL = 0x080;
        const OR = 0x100;
        const AND = 0x200;
        const NOOP = 0x800;

        const RANGE = Self::GT.bits() | Self::LE.bits() | Self::LT.bits() | Self::GE.bits();
        const EQUALITY = Self::EQ.bits() | Self::IN.bits() | Self::ISNULL.bits();
        const INDEXABLE = Self::EQUALITY.bits() | Self::RANGE.bits();
        /// Operators a single-term OR branch may be planned on.
        const SINGLE = Self::EQ.bits() | Self::RANGE.bits() | Self::IN.bits() | Self::ISNULL.bits();
    }
}

impl OperatorMask {
    /// Class of a comparison operator usable by an index (`!=` is not).
    pub fn for_comparison(op: BinaryOp) -> Option<Self> {
        let offset = match op {
            BinaryOp::Eq => 0,
            BinaryOp::Gt => 1,
            BinaryOp::Le => 2,
            BinaryOp::Lt => 3,
            BinaryOp::Ge => 4,
            _ => return None,
        };
        Some(Self::from_bits_retain(Self::EQ.bits() << offset))
    }
}

bitflags! {
    /// Per-term state bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TermFlags: u16 {
        /// The term owns a synthesized expression.
        const DYNAMIC = 0x01;
        /// Added by the planner; never tested as a residual on its own.
        const VIRTUAL = 0x02;
        /// Already checked, either by the access path or a residual test.
        const CODED = 0x04;
        /// A commuted copy of this term exists.
        const COPIED = 0x08;
        const ORINFO = 0x10;
        const ANDINFO = 0x20;
        /// May take part in an OR-to-IN rewrite.
        const OR_OK = 0x40;
        /// Synthetic `col > NULL` produced from `col IS NOT NULL`.
        const VNULL = 0x80;
    }
}

/// Where a term came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermOrigin {
    /// Produced by splitting the clause expression.
    Root,
    /// Synthesized from the term at this index of the same clause.
    ChildOf(usize),
}

/// Shape-specific data of a term.
#[derive(Debug)]
pub enum TermPayload<'a> {
    /// `column <op> expr` with the column on the left.
    Simple { cursor: CursorId, column: i32 },
    /// A disjunction; the branches live in their own clause.
    Or(Box<OrInfo<'a>>),
    /// A conjunction appearing as one branch of an OR.
    And(Box<AndInfo<'a>>),
    /// No usable structure.
    Opaque,
}

/// Analysis of an OR term.
#[derive(Debug)]
pub struct OrInfo<'a> {
    /// The branches, split on OR and analyzed.
    pub clause: WhereClause<'a>,
    /// Tables every branch can drive an index on.
    pub indexable: Bitmask,
}

/// Analysis of an AND group inside an OR branch.
#[derive(Debug)]
pub struct AndInfo<'a> {
    pub clause: WhereClause<'a>,
}

/// One constraint of a WHERE clause.
#[derive(Debug)]
pub struct WhereTerm<'a> {
    /// The constraint, borrowed from the statement or owned when synthesized.
    pub expr: Cow<'a, Expr>,
    pub origin: TermOrigin,
    children_pending: Cell<u32>,
    flags: Cell<TermFlags>,
    pub op: OperatorMask,
    pub payload: TermPayload<'a>,
    /// Tables referenced by the right-hand side.
    pub prereq_right: Bitmask,
    /// Tables referenced anywhere in the term.
    pub prereq_all: Bitmask,
    /// Cursor of the right table when the term comes from a LEFT JOIN's ON
    /// clause.
    pub from_join: Option<CursorId>,
}

impl<'a> WhereTerm<'a> {
    /// A fresh, unanalyzed term.
    pub fn new(expr: Cow<'a, Expr>, origin: TermOrigin, flags: TermFlags) -> Self {
        Self {
            expr,
            origin,
            children_pending: Cell::new(0),
            flags: Cell::new(flags),
            op: OperatorMask::empty(),
            payload: TermPayload::Opaque,
            prereq_right: 0,
            prereq_all: 0,
            from_join: None,
        }
    }

    pub fn flags(&self) -> TermFlags {
        self.flags.get()
    }

    pub fn has(&self, flag: TermFlags) -> bool {
        self.flags.get().contains(flag)
    }

    pub fn set(&self, flag: TermFlags) {
        self.flags.set(self.flags.get() | flag);
    }

    pub fn clear(&self, flag: TermFlags) {
        self.flags.set(self.flags.get() - flag);
    }

    /// Number of children not yet disabled.
    pub fn children_pending(&self) -> u32 {
        self.children_pending.get()
    }

    pub(crate) fn set_children_pending(&self, n: u32) {
        self.children_pending.set(n);
    }

    /// The `(cursor, column)` on the left of a simple term.
    pub fn left_column(&self) -> Option<(CursorId, i32)> {
        match self.payload {
            TermPayload::Simple { cursor, column } => Some((cursor, column)),
            _ => None,
        }
    }

    /// Left operand of the constraint expression.
    pub fn left_operand(&self) -> &Expr {
        operands(&self.expr).0
    }

    /// Right operand of a binary comparison.
    pub fn right_operand(&self) -> Option<&Expr> {
        match operands(&self.expr).1 {
            Operand::Expr(e) => Some(e),
            _ => None,
        }
    }

    pub fn or_info(&self) -> Option<&OrInfo<'a>> {
        match &self.payload {
            TermPayload::Or(info) => Some(info),
            _ => None,
        }
    }

    pub fn and_info(&self) -> Option<&AndInfo<'a>> {
        match &self.payload {
            TermPayload::And(info) => Some(info),
            _ => None,
        }
    }

    pub fn is_from_join(&self) -> bool {
        self.from_join.is_some()
    }
}

/// Right-hand side of a term expression.
#[derive(Debug, Clone, Copy)]
pub enum Operand<'e> {
    None,
    Expr(&'e Expr),
    Set(&'e InSet),
}

/// Split a comparison-shaped expression into its operands.
pub fn operands(expr: &Expr) -> (&Expr, Operand<'_>) {
    match expr {
        Expr::BinaryOp { left, right, .. } => (left, Operand::Expr(right)),
        Expr::In { expr, set, .. } => (expr, Operand::Set(set)),
        Expr::IsNull { expr, .. } => (expr, Operand::None),
        Expr::Like { expr, pattern, .. } => (expr, Operand::Expr(pattern)),
        other => (other, Operand::None),
    }
}

/// A list of terms joined by one connective.
#[derive(Debug)]
pub struct WhereClause<'a> {
    /// `And` for a WHERE clause or AND group, `Or` for OR branches.
    pub connective: BinaryOp,
    terms: Vec<WhereTerm<'a>>,
}

impl<'a> WhereClause<'a> {
    #[must_use]
    pub fn new(connective: BinaryOp) -> Self {
        Self {
            connective,
            terms: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.terms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn terms(&self) -> &[WhereTerm<'a>] {
        &self.terms
    }

    pub fn term(&self, idx: usize) -> &WhereTerm<'a> {
        &self.terms[idx]
    }

    pub fn term_mut(&mut self, idx: usize) -> &mut WhereTerm<'a> {
        &mut self.terms[idx]
    }

    /// Append a term and return its index.
    pub fn push(&mut self, term: WhereTerm<'a>) -> usize {
        self.terms.push(term);
        self.terms.len() - 1
    }

    /// Mark a term as already checked so no residual test is generated.
    ///
    /// On a LEFT JOIN level only ON-clause terms may be disabled: a WHERE
    /// term must still be tested against the synthesized NULL row. When the
    /// last pending child of a synthesized family is disabled the parent is
    /// disabled too. Disabling a term twice is a no-op.
    pub fn disable_term(&self, idx: usize, left_join_level: bool) {
        let mut current = Some(idx);
        while let Some(i) = current.take() {
            let term = &self.terms[i];
            if term.has(TermFlags::CODED) || (left_join_level && !term.is_from_join()) {
                return;
            }
            term.set(TermFlags::CODED);
            if let TermOrigin::ChildOf(parent) = term.origin {
                let p = &self.terms[parent];
                let pending = p.children_pending().saturating_sub(1);
                p.set_children_pending(pending);
                if pending == 0 {
                    current = Some(parent);
                }
            }
        }
    }

    /// First term constraining `cursor.column`; see [`find_term_in`].
    pub fn find_term(
        &self,
        cursor: CursorId,
        column: i32,
        not_ready: Bitmask,
        ops: OperatorMask,
        index: Option<(&IndexDescriptor, TypeAffinity)>,
    ) -> Option<usize> {
        find_term_in(&self.terms, cursor, column, not_ready, ops, index)
    }

    /// Indices of terms that were never disabled and are not virtual.
    pub fn untested(&self) -> impl Iterator<Item = usize> + '_ {
        self.terms
            .iter()
            .enumerate()
            .filter(|(_, t)| !t.has(TermFlags::CODED) && !t.has(TermFlags::VIRTUAL))
            .map(|(i, _)| i)
    }
}

/// First term of `terms` constraining `cursor.column` with one of `ops`
/// whose right-hand side only uses tables outside `not_ready`.
///
/// With `index` given, the term must also compare with the affinity and
/// collation the index key uses, so that the index order answers it.
pub fn find_term_in(
    terms: &[WhereTerm<'_>],
    cursor: CursorId,
    column: i32,
    not_ready: Bitmask,
    ops: OperatorMask,
    index: Option<(&IndexDescriptor, TypeAffinity)>,
) -> Option<usize> {
    terms.iter().position(|term| {
        if term.left_column() != Some((cursor, column))
            || term.prereq_right & not_ready != 0
            || !term.op.intersects(ops)
        {
            return false;
        }
        match index {
            Some((idx, col_affinity)) if column >= 0 && term.op != OperatorMask::ISNULL => {
                index_affinity_ok(&term.expr, col_affinity)
                    && idx.position_of(column).is_some_and(|pos| {
                        let (left, right) = operands(&term.expr);
                        let coll = match right {
                            Operand::Expr(r) => comparison_collation(left, r),
                            _ => left.collation().map(|(n, _)| n),
                        };
                        same_collation(coll, idx.columns[pos].collation.as_deref())
                    })
            }
            _ => true,
        }
    })
}

/// Affinity of `expr` when compared with `aff2` (`None` = no affinity).
///
/// Two typed operands compare numerically when either is numeric and
/// without conversion otherwise.
pub(crate) fn compare_affinity(expr: &Expr, aff2: Option<TypeAffinity>) -> TypeAffinity {
    match (expr.affinity(), aff2) {
        (Some(a), Some(b)) => {
            if a.is_numeric() || b.is_numeric() {
                TypeAffinity::Numeric
            } else {
                TypeAffinity::Blob
            }
        }
        (Some(a), None) | (None, Some(a)) => a,
        (None, None) => TypeAffinity::Blob,
    }
}

/// Affinity applied by the comparison in `expr`.
pub(crate) fn comparison_affinity(expr: &Expr) -> TypeAffinity {
    let (left, right) = operands(expr);
    let aff = left.affinity();
    match right {
        Operand::Expr(r) => compare_affinity(r, aff),
        Operand::Set(InSet::Subquery(sel)) => match sel.columns.first() {
            Some(first) => compare_affinity(first, aff),
            None => aff.unwrap_or(TypeAffinity::Blob),
        },
        Operand::Set(InSet::List(_)) | Operand::None => aff.unwrap_or(TypeAffinity::Blob),
    }
}

/// Whether an index on a column of affinity `idx_affinity` orders values
/// the way the comparison in `expr` does.
pub(crate) fn index_affinity_ok(expr: &Expr, idx_affinity: TypeAffinity) -> bool {
    match comparison_affinity(expr) {
        TypeAffinity::Blob => true,
        TypeAffinity::Text => idx_affinity == TypeAffinity::Text,
        _ => idx_affinity.is_numeric(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn simple(expr: Expr, origin: TermOrigin) -> WhereTerm<'static> {
        let mut t = WhereTerm::new(Cow::Owned(expr), origin, TermFlags::empty());
        t.payload = TermPayload::Simple {
            cursor: 0,
            column: 0,
        };
        t.op = OperatorMask::EQ;
        t
    }

    fn family() -> WhereClause<'static> {
        let mut wc = WhereClause::new(BinaryOp::And);
        let parent = wc.push(simple(Expr::integer(1), TermOrigin::Root));
        wc.push(simple(Expr::integer(2), TermOrigin::ChildOf(parent)));
        wc.push(simple(Expr::integer(3), TermOrigin::ChildOf(parent)));
        wc.term(parent).set_children_pending(2);
        wc
    }

    #[test]
    fn test_operator_mask_layout() {
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Eq), Some(OperatorMask::EQ));
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Gt), Some(OperatorMask::GT));
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Le), Some(OperatorMask::LE));
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Lt), Some(OperatorMask::LT));
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Ge), Some(OperatorMask::GE));
        assert_eq!(OperatorMask::for_comparison(BinaryOp::Ne), None);
    }

    #[test]
    fn test_disable_child_keeps_parent_until_last_sibling() {
        let wc = family();
        wc.disable_term(1, false);
        assert!(wc.term(1).has(TermFlags::CODED));
        assert!(!wc.term(0).has(TermFlags::CODED));
        assert_eq!(wc.term(0).children_pending(), 1);

        wc.disable_term(1, false);
        assert_eq!(wc.term(0).children_pending(), 1);

        wc.disable_term(2, false);
        assert!(wc.term(0).has(TermFlags::CODED));
        assert_eq!(wc.term(0).children_pending(), 0);
        wc.disable_term(2, false);
        wc.disable_term(0, false);
        assert_eq!(wc.term(0).children_pending(), 0);
    }

    #[test]
    fn test_left_join_level_keeps_where_terms() {
        let mut wc = family();
        wc.disable_term(0, true);
        assert!(!wc.term(0).has(TermFlags::CODED));
        wc.term_mut(0).from_join = Some(1);
        wc.disable_term(0, true);
        assert!(wc.term(0).has(TermFlags::CODED));
    }

    #[test]
    fn test_index_affinity_ok() {
        let text_cmp = Expr::binary(
            Expr::column(0, 0, TypeAffinity::Text),
            BinaryOp::Eq,
            Expr::integer(5),
        );
        assert!(index_affinity_ok(&text_cmp, TypeAffinity::Text));
        assert!(!index_affinity_ok(&text_cmp, TypeAffinity::Integer));

        let mixed = Expr::binary(
            Expr::column(0, 0, TypeAffinity::Text),
            BinaryOp::Eq,
            Expr::column(1, 0, TypeAffinity::Integer),
        );
        assert!(index_affinity_ok(&mixed, TypeAffinity::Integer));
        assert!(!index_affinity_ok(&mixed, TypeAffinity::Text));
    }
}
