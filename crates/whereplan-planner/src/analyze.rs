//! Predicate decomposition.
//!
//! [`split_expr`] flattens a chain of one connective into terms and
//! [`analyze_all`] classifies each term, appending synthetic terms where a
//! rewrite gives the cost model more to work with: commuted column/column
//! comparisons, BETWEEN bounds, OR-to-IN, LIKE/GLOB prefix ranges, MATCH
//! constraints for virtual tables and `col > NULL` for `IS NOT NULL`.

use std::borrow::Cow;

use whereplan_ast::{BinaryOp, ColumnRef, Expr, InSet, LikeOp};
use whereplan_types::{CursorId, SqliteValue, TypeAffinity};

use crate::bitmask::{Bitmask, MaskSet, ALL_TABLES};
use crate::config::PlannerConfig;
use crate::term::{
    AndInfo, OperatorMask, OrInfo, TermFlags, TermOrigin, TermPayload, WhereClause, WhereTerm,
};

const SYNTHETIC: TermFlags = TermFlags::VIRTUAL.union(TermFlags::DYNAMIC);

/// What term analysis needs to know about the statement.
pub(crate) struct AnalyzeContext<'c> {
    pub masks: &'c MaskSet,
    /// Tables that are virtual.
    pub virtual_tables: Bitmask,
    pub config: &'c PlannerConfig,
}

/// Append the operands of a `connective` chain in `expr` to `clause`.
///
/// The result does not depend on how the chain associates. Terms borrowed
/// from the statement stay borrowed; pieces of an owned expression become
/// owned terms.
pub fn split_expr<'a>(
    clause: &mut WhereClause<'a>,
    expr: Cow<'a, Expr>,
    connective: BinaryOp,
    from_join: Option<CursorId>,
) {
    match expr {
        Cow::Borrowed(Expr::BinaryOp { left, op, right }) if *op == connective => {
            split_expr(clause, Cow::Borrowed(&**left), connective, from_join);
            split_expr(clause, Cow::Borrowed(&**right), connective, from_join);
        }
        Cow::Owned(Expr::BinaryOp { left, op, right }) if op == connective => {
            split_expr(clause, Cow::Owned(*left), connective, from_join);
            split_expr(clause, Cow::Owned(*right), connective, from_join);
        }
        other => {
            let flags = match other {
                Cow::Owned(_) => TermFlags::DYNAMIC,
                Cow::Borrowed(_) => TermFlags::empty(),
            };
            let mut term = WhereTerm::new(other, TermOrigin::Root, flags);
            term.from_join = from_join;
            clause.push(term);
        }
    }
}

/// Analyze every term currently in `clause`, last to first.
///
/// Synthetic terms are analyzed as they are appended, so each term is
/// visited exactly once.
pub(crate) fn analyze_all(clause: &mut WhereClause<'_>, ctx: &AnalyzeContext<'_>) {
    for idx in (0..clause.len()).rev() {
        analyze_term(clause, idx, ctx);
    }
}

/// Operator class of a term the index machinery can use.
fn allowed_operator(expr: &Expr) -> Option<OperatorMask> {
    match expr {
        Expr::BinaryOp { op, .. } => OperatorMask::for_comparison(*op),
        Expr::In { not: false, .. } => Some(OperatorMask::IN),
        Expr::IsNull { not: false, .. } => Some(OperatorMask::ISNULL),
        _ => None,
    }
}

fn reborrow<'a>(expr: &Cow<'a, Expr>) -> Cow<'a, Expr> {
    match expr {
        Cow::Borrowed(e) => Cow::Borrowed(*e),
        Cow::Owned(e) => Cow::Owned(e.clone()),
    }
}

fn synthetic<'a>(expr: Expr, origin: TermOrigin, from_join: Option<CursorId>) -> WhereTerm<'a> {
    let mut term = WhereTerm::new(Cow::Owned(expr), origin, SYNTHETIC);
    term.from_join = from_join;
    term
}

#[allow(clippy::too_many_lines)]
pub(crate) fn analyze_term(clause: &mut WhereClause<'_>, idx: usize, ctx: &AnalyzeContext<'_>) {
    let masks = ctx.masks;
    let term = clause.term(idx);
    let from_join = term.from_join;
    let expr: &Expr = &term.expr;

    let (prereq_left, prereq_right) = match expr {
        Expr::BinaryOp { left, right, .. } => (masks.expr_usage(left), masks.expr_usage(right)),
        Expr::In { expr, set, .. } => (masks.expr_usage(expr), masks.in_set_usage(set)),
        Expr::IsNull { expr, .. } | Expr::UnaryOp { expr, .. } => (masks.expr_usage(expr), 0),
        _ => (0, 0),
    };
    let mut prereq_all = masks.expr_usage(expr);
    let mut extra_right = 0;
    if let Some(right_cursor) = from_join {
        let x = masks.bit_for(right_cursor);
        extra_right = x.wrapping_sub(1);
        prereq_all |= x | extra_right;
    }

    let mut simple = None;
    let mut commute = false;
    let allowed = allowed_operator(expr).filter(|_| prereq_right & prereq_left == 0);
    if let Some(class) = allowed {
        if let Expr::BinaryOp { left, right, .. } = expr {
            if let Some(c) = left.as_column() {
                simple = Some((c.cursor, c.column, class));
            }
            commute = right.as_column().is_some();
        } else if let Some(c) = term.left_operand().as_column() {
            simple = Some((c.cursor, c.column, class));
        }
    }

    let between = match expr {
        Expr::Between {
            expr: x,
            low,
            high,
            not: false,
        } if allowed.is_none() && clause.connective == BinaryOp::And => Some([
            Expr::binary(x.as_ref().clone(), BinaryOp::Ge, low.as_ref().clone()),
            Expr::binary(x.as_ref().clone(), BinaryOp::Le, high.as_ref().clone()),
        ]),
        _ => None,
    };
    let is_or = allowed.is_none()
        && matches!(
            expr,
            Expr::BinaryOp {
                op: BinaryOp::Or,
                ..
            }
        );
    let like = if clause.connective == BinaryOp::And {
        like_prefix(expr, ctx)
    } else {
        None
    };
    let match_child = match expr {
        Expr::Like {
            expr: target,
            pattern,
            escape: None,
            op: LikeOp::Match,
            not: false,
        } => target.as_column().and_then(|c| {
            let prereq_expr = masks.expr_usage(pattern);
            (prereq_expr & masks.bit_for(c.cursor) == 0)
                .then(|| (c.cursor, c.column, prereq_expr, expr.clone()))
        }),
        _ => None,
    };
    let not_null_child = match expr {
        Expr::IsNull {
            expr: target,
            not: true,
        } => target
            .as_column()
            .filter(|c| c.column >= 0)
            .map(|c| (c.cursor, c.column, target.as_ref().clone())),
        _ => None,
    };

    {
        let t = clause.term_mut(idx);
        t.prereq_right = prereq_right;
        t.prereq_all = prereq_all;
        if let Some((cursor, column, class)) = simple {
            t.payload = TermPayload::Simple { cursor, column };
            t.op = class;
        }
    }

    if commute {
        let target = if simple.is_some() {
            let dup = commute_expr(&clause.term(idx).expr);
            let parent = clause.term(idx);
            parent.set_children_pending(1);
            parent.set(TermFlags::COPIED);
            clause.push(synthetic(dup, TermOrigin::ChildOf(idx), from_join))
        } else {
            let t = clause.term_mut(idx);
            t.expr = Cow::Owned(commute_expr(&t.expr));
            t.set(TermFlags::DYNAMIC);
            idx
        };
        let t = clause.term_mut(target);
        let shape = match &*t.expr {
            Expr::BinaryOp { left, op, .. } => left
                .as_column()
                .map(|c| (c.cursor, c.column))
                .zip(OperatorMask::for_comparison(*op)),
            _ => None,
        };
        if let Some(((cursor, column), class)) = shape {
            t.payload = TermPayload::Simple { cursor, column };
            t.op = class;
        }
        t.prereq_right = prereq_left | extra_right;
        t.prereq_all = prereq_all;
    } else if let Some(bounds) = between {
        for bound in bounds {
            let child = clause.push(synthetic(bound, TermOrigin::ChildOf(idx), from_join));
            analyze_term(clause, child, ctx);
        }
        clause.term(idx).set_children_pending(2);
    } else if is_or {
        analyze_or_term(clause, idx, ctx);
    }

    if let Some(like) = like {
        let origin = if like.complete {
            TermOrigin::ChildOf(idx)
        } else {
            TermOrigin::Root
        };
        let lower = clause.push(synthetic(like.lower, origin, from_join));
        analyze_term(clause, lower, ctx);
        let upper = clause.push(synthetic(like.upper, origin, from_join));
        analyze_term(clause, upper, ctx);
        if like.complete {
            clause.term(idx).set_children_pending(2);
        }
    }

    if let Some((cursor, column, prereq_expr, match_expr)) = match_child {
        let mut child = synthetic(match_expr, TermOrigin::ChildOf(idx), from_join);
        child.payload = TermPayload::Simple { cursor, column };
        child.op = OperatorMask::MATCH;
        child.prereq_right = prereq_expr;
        child.prereq_all = prereq_all;
        clause.push(child);
        let parent = clause.term(idx);
        parent.set_children_pending(1);
        parent.set(TermFlags::COPIED);
    }

    if let Some((cursor, column, target)) = not_null_child {
        let gt_null = Expr::binary(target, BinaryOp::Gt, Expr::Literal(SqliteValue::Null));
        let mut child = synthetic(gt_null, TermOrigin::ChildOf(idx), from_join);
        child.set(TermFlags::VNULL);
        child.payload = TermPayload::Simple { cursor, column };
        child.op = OperatorMask::GT;
        child.prereq_all = prereq_all;
        clause.push(child);
        let parent = clause.term(idx);
        parent.set_children_pending(1);
        parent.set(TermFlags::COPIED);
    }

    clause.term_mut(idx).prereq_right |= extra_right;

    let t = clause.term(idx);
    tracing::trace!(
        target: "whereplan.planner",
        term = idx,
        expr = %t.expr,
        op = t.op.bits(),
        prereq_right = t.prereq_right,
        prereq_all = t.prereq_all,
        "term.analyzed"
    );
}

// ---------------------------------------------------------------------------
// Commutation
// ---------------------------------------------------------------------------

/// `a <op> b` rewritten as `b <op'> a`.
///
/// Each operand position keeps its collation: the collation (and whether it
/// was explicit) that applied on the left moves onto the new left operand,
/// so the comparison still uses the same collating sequence.
pub(crate) fn commute_expr(expr: &Expr) -> Expr {
    let Expr::BinaryOp { left, op, right } = expr else {
        return expr.clone();
    };
    let left_coll = left.collation().map(|(n, e)| (n.to_owned(), e));
    let right_coll = right.collation().map(|(n, e)| (n.to_owned(), e));
    Expr::BinaryOp {
        left: Box::new(with_collation(right.as_ref().clone(), left_coll)),
        op: op.commuted(),
        right: Box::new(with_collation(left.as_ref().clone(), right_coll)),
    }
}

fn with_collation(expr: Expr, coll: Option<(String, bool)>) -> Expr {
    let inner = match expr {
        Expr::Collate { expr, .. } => *expr,
        other => other,
    };
    match (inner, coll) {
        (Expr::Column(mut c), coll) => {
            c.explicit_collation = coll.as_ref().is_some_and(|(_, explicit)| *explicit);
            c.collation = coll.map(|(name, _)| name);
            Expr::Column(c)
        }
        (other, Some((collation, _))) => Expr::Collate {
            expr: Box::new(other),
            collation,
        },
        (other, None) => other,
    }
}

// ---------------------------------------------------------------------------
// OR terms
// ---------------------------------------------------------------------------

fn analyze_or_term(clause: &mut WhereClause<'_>, idx: usize, ctx: &AnalyzeContext<'_>) {
    let masks = ctx.masks;
    let from_join = clause.term(idx).from_join;
    let mut or_wc = WhereClause::new(BinaryOp::Or);
    split_expr(&mut or_wc, reborrow(&clause.term(idx).expr), BinaryOp::Or, from_join);
    analyze_all(&mut or_wc, ctx);

    let left_bit = |t: &WhereTerm<'_>| t.left_column().map_or(0, |(c, _)| masks.bit_for(c));

    let mut indexable = ALL_TABLES;
    let mut chng_to_in = !ctx.virtual_tables;
    for i in 0..or_wc.len() {
        if indexable == 0 {
            break;
        }
        let term = or_wc.term(i);
        if !term.op.intersects(OperatorMask::SINGLE) {
            chng_to_in = 0;
            let mut and_wc = WhereClause::new(BinaryOp::And);
            split_expr(&mut and_wc, reborrow(&term.expr), BinaryOp::And, from_join);
            analyze_all(&mut and_wc, ctx);
            let b = and_wc
                .terms()
                .iter()
                .filter(|t| allowed_operator(&t.expr).is_some())
                .fold(0, |m, t| m | left_bit(t));
            indexable &= b;
            let t = or_wc.term_mut(i);
            t.payload = TermPayload::And(Box::new(AndInfo { clause: and_wc }));
            t.op = OperatorMask::AND;
            t.set(TermFlags::ANDINFO);
        } else if term.has(TermFlags::COPIED) {
            // Revisited through its commuted copy.
        } else {
            let mut b = left_bit(term);
            if term.has(TermFlags::VIRTUAL) {
                if let TermOrigin::ChildOf(parent) = term.origin {
                    b |= left_bit(or_wc.term(parent));
                }
            }
            indexable &= b;
            if term.op == OperatorMask::EQ {
                chng_to_in &= b;
            } else {
                chng_to_in = 0;
            }
        }
    }

    let in_rewrite = if chng_to_in == 0 {
        None
    } else {
        or_to_in(&or_wc, chng_to_in, masks)
    };

    {
        let t = clause.term_mut(idx);
        t.payload = TermPayload::Or(Box::new(OrInfo {
            clause: or_wc,
            indexable,
        }));
        t.set(TermFlags::ORINFO);
        t.op = if indexable == 0 {
            OperatorMask::empty()
        } else {
            OperatorMask::OR
        };
    }

    if let Some(in_expr) = in_rewrite {
        let child = clause.push(synthetic(in_expr, TermOrigin::ChildOf(idx), from_join));
        analyze_term(clause, child, ctx);
        let t = clause.term_mut(idx);
        t.set_children_pending(1);
        t.op = OperatorMask::NOOP;
    }
}

/// Look for one `(cursor, column)` that every branch compares with `=`.
///
/// At most two cursors are tried: the first candidate found and, if that
/// fails, the first candidate on a different cursor.
fn or_to_in(or_wc: &WhereClause<'_>, chng_to_in: Bitmask, masks: &MaskSet) -> Option<Expr> {
    let n = or_wc.len();
    let mut ok = false;
    let mut cursor: Option<CursorId> = None;
    let mut column = 0;
    for _ in 0..2 {
        if ok {
            break;
        }
        let mut start = None;
        for i in 0..n {
            let t = or_wc.term(i);
            t.clear(TermFlags::OR_OK);
            let Some((c, col)) = t.left_column() else {
                continue;
            };
            if Some(c) == cursor || chng_to_in & masks.bit_for(c) == 0 {
                continue;
            }
            cursor = Some(c);
            column = col;
            start = Some(i);
            break;
        }
        let Some(start) = start else {
            break;
        };
        ok = true;
        for i in start..n {
            if !ok {
                break;
            }
            let t = or_wc.term(i);
            match t.left_column() {
                Some((c, col)) if Some(c) == cursor => {
                    if col != column {
                        ok = false;
                    } else {
                        let aff_right = t.right_operand().and_then(Expr::affinity);
                        if aff_right.is_some() && aff_right != t.left_operand().affinity() {
                            ok = false;
                        } else {
                            t.set(TermFlags::OR_OK);
                        }
                    }
                }
                _ => t.clear(TermFlags::OR_OK),
            }
        }
    }
    if !ok {
        return None;
    }

    let mut list = Vec::new();
    let mut left = None;
    for t in or_wc.terms().iter().filter(|t| t.has(TermFlags::OR_OK)) {
        list.push(t.right_operand()?.clone());
        left = Some(t.left_operand());
    }
    Some(Expr::In {
        expr: Box::new(left?.clone()),
        set: InSet::List(list),
        not: false,
    })
}

// ---------------------------------------------------------------------------
// LIKE / GLOB prefix ranges
// ---------------------------------------------------------------------------

struct LikeRange {
    lower: Expr,
    upper: Expr,
    /// The range alone decides the LIKE.
    complete: bool,
}

/// Range terms bracketing the literal prefix of `col LIKE 'abc%'`.
fn like_prefix(expr: &Expr, ctx: &AnalyzeContext<'_>) -> Option<LikeRange> {
    let Expr::Like {
        expr: target,
        pattern,
        escape: None,
        op,
        not: false,
    } = expr
    else {
        return None;
    };
    let (wildcards, no_case) = match op {
        LikeOp::Like => ([b'%', b'_', b'%'], !ctx.config.case_sensitive_like),
        LikeOp::Glob => ([b'*', b'?', b'['], false),
        LikeOp::Match | LikeOp::Regexp => return None,
    };
    let column = target.as_column()?;
    if column.affinity != TypeAffinity::Text
        || ctx.virtual_tables & ctx.masks.bit_for(column.cursor) != 0
    {
        return None;
    }
    let z = match pattern.constant_value()? {
        SqliteValue::Text(s) => s.as_bytes(),
        _ => return None,
    };
    let cnt = z
        .iter()
        .position(|c| wildcards.contains(c))
        .unwrap_or(z.len());
    if cnt == 0 || z[cnt - 1] == 0xFF {
        return None;
    }
    let mut complete = cnt + 1 == z.len() && z[cnt] == wildcards[0];

    let prefix = z[..cnt].to_vec();
    let mut upper = prefix.clone();
    let last = upper.last_mut()?;
    let mut c = *last;
    if no_case {
        if ctx.config.folds_inexactly(c) {
            complete = false;
        }
        c = c.to_ascii_lowercase();
    }
    *last = c.wrapping_add(1);

    // An increment that lands inside a multi-byte sequence has no text
    // representation; skip the rewrite rather than bound with a blob.
    let lower_text = String::from_utf8(prefix).ok()?;
    let upper_text = String::from_utf8(upper).ok()?;

    let bound = ColumnRef {
        collation: Some(if no_case { "NOCASE" } else { "BINARY" }.to_owned()),
        explicit_collation: true,
        ..column.clone()
    };
    Some(LikeRange {
        lower: Expr::binary(
            Expr::Column(bound.clone()),
            BinaryOp::Ge,
            Expr::Literal(SqliteValue::Text(lower_text)),
        ),
        upper: Expr::binary(
            Expr::Column(bound),
            BinaryOp::Lt,
            Expr::Literal(SqliteValue::Text(upper_text)),
        ),
        complete,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(cursor: CursorId, column: i32) -> Expr {
        Expr::column(cursor, column, TypeAffinity::Integer)
    }

    fn text_col(cursor: CursorId, column: i32) -> Expr {
        Expr::column(cursor, column, TypeAffinity::Text)
    }

    fn eq(l: Expr, r: Expr) -> Expr {
        Expr::binary(l, BinaryOp::Eq, r)
    }

    fn masks(cursors: &[CursorId]) -> MaskSet {
        let mut ms = MaskSet::new();
        for &c in cursors {
            ms.create_bit(c).expect("capacity");
        }
        ms
    }

    fn analyzed<'a>(
        expr: &'a Expr,
        ms: &MaskSet,
        config: &PlannerConfig,
        virtual_tables: Bitmask,
    ) -> WhereClause<'a> {
        let mut wc = WhereClause::new(BinaryOp::And);
        split_expr(&mut wc, Cow::Borrowed(expr), BinaryOp::And, None);
        let ctx = AnalyzeContext {
            masks: ms,
            virtual_tables,
            config,
        };
        analyze_all(&mut wc, &ctx);
        wc
    }

    #[test]
    fn test_split_ignores_association() {
        let a = eq(col(0, 0), Expr::integer(1));
        let b = eq(col(0, 1), Expr::integer(2));
        let c = eq(col(0, 2), Expr::integer(3));
        let left_assoc = Expr::binary(
            Expr::binary(a.clone(), BinaryOp::And, b.clone()),
            BinaryOp::And,
            c.clone(),
        );
        let right_assoc = Expr::binary(
            a.clone(),
            BinaryOp::And,
            Expr::binary(b.clone(), BinaryOp::And, c.clone()),
        );
        for tree in [&left_assoc, &right_assoc] {
            let mut wc = WhereClause::new(BinaryOp::And);
            split_expr(&mut wc, Cow::Borrowed(tree), BinaryOp::And, None);
            let exprs: Vec<&Expr> = wc.terms().iter().map(|t| &*t.expr).collect();
            assert_eq!(exprs, vec![&a, &b, &c]);
        }

        let or_tree = Expr::binary(a, BinaryOp::Or, b);
        let mut wc = WhereClause::new(BinaryOp::And);
        split_expr(&mut wc, Cow::Borrowed(&or_tree), BinaryOp::And, None);
        assert_eq!(wc.len(), 1);
    }

    #[test]
    fn test_simple_term_classification() {
        let ms = masks(&[0, 1]);
        let cfg = PlannerConfig::default();
        let e = Expr::binary(col(0, 2), BinaryOp::Lt, col(1, 0));
        let wc = analyzed(&e, &ms, &cfg, 0);
        let t = wc.term(0);
        assert_eq!(t.left_column(), Some((0, 2)));
        assert_eq!(t.op, OperatorMask::LT);
        assert_eq!(t.prereq_right, 0b10);
        assert_eq!(t.prereq_all, 0b11);
    }

    #[test]
    fn test_commuted_copy_swaps_sides_and_collation() {
        let ms = masks(&[0, 1]);
        let cfg = PlannerConfig::default();
        let mut left = ColumnRef::new(0, 0, TypeAffinity::Text);
        left.collation = Some("NOCASE".to_owned());
        left.explicit_collation = true;
        let e = Expr::binary(Expr::Column(left), BinaryOp::Lt, text_col(1, 3));
        let wc = analyzed(&e, &ms, &cfg, 0);

        assert_eq!(wc.len(), 2);
        let parent = wc.term(0);
        let child = wc.term(1);
        assert!(parent.has(TermFlags::COPIED));
        assert_eq!(parent.children_pending(), 1);
        assert_eq!(child.origin, TermOrigin::ChildOf(0));
        assert!(child.has(TermFlags::VIRTUAL));
        assert_eq!(child.left_column(), Some((1, 3)));
        assert_eq!(child.op, OperatorMask::GT);
        assert_eq!(child.prereq_right, 0b01);

        let new_left = child.left_operand().as_column().expect("column");
        assert_eq!(new_left.collation.as_deref(), Some("NOCASE"));
        assert!(new_left.explicit_collation);
        let new_right = child.right_operand().and_then(Expr::as_column).expect("column");
        assert!(!new_right.explicit_collation);
        assert_eq!(new_right.cursor, 0);
    }

    #[test]
    fn test_constant_on_left_commutes_in_place() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = eq(Expr::integer(5), col(0, 1));
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 1);
        assert_eq!(wc.term(0).left_column(), Some((0, 1)));
        assert_eq!(wc.term(0).op, OperatorMask::EQ);
    }

    #[test]
    fn test_between_children() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = Expr::Between {
            expr: Box::new(col(0, 4)),
            low: Box::new(Expr::integer(3)),
            high: Box::new(Expr::integer(9)),
            not: false,
        };
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 3);
        assert_eq!(wc.term(0).children_pending(), 2);
        assert_eq!(wc.term(1).op, OperatorMask::GE);
        assert_eq!(wc.term(2).op, OperatorMask::LE);
        for i in 1..3 {
            assert_eq!(wc.term(i).left_column(), Some((0, 4)));
            assert_eq!(wc.term(i).origin, TermOrigin::ChildOf(0));
        }
        assert_eq!(wc.term(1).right_operand(), Some(&Expr::integer(3)));
        assert_eq!(wc.term(2).right_operand(), Some(&Expr::integer(9)));
    }

    #[test]
    fn test_or_of_equalities_becomes_in() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = Expr::binary(
            Expr::binary(eq(col(0, 0), Expr::integer(1)), BinaryOp::Or, eq(col(0, 0), Expr::integer(2))),
            BinaryOp::Or,
            eq(col(0, 0), Expr::integer(3)),
        );
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 2);
        assert_eq!(wc.term(0).op, OperatorMask::NOOP);
        assert_eq!(wc.term(0).or_info().expect("or info").indexable, 1);
        let in_term = wc.term(1);
        assert_eq!(in_term.op, OperatorMask::IN);
        assert_eq!(in_term.left_column(), Some((0, 0)));
        assert_eq!(
            *in_term.expr,
            Expr::In {
                expr: Box::new(col(0, 0)),
                set: InSet::List(vec![Expr::integer(1), Expr::integer(2), Expr::integer(3)]),
                not: false,
            }
        );
    }

    #[test]
    fn test_or_on_different_columns_keeps_or() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = Expr::binary(
            eq(col(0, 0), Expr::integer(1)),
            BinaryOp::Or,
            eq(col(0, 1), Expr::integer(2)),
        );
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 1);
        assert_eq!(wc.term(0).op, OperatorMask::OR);
        assert!(wc.term(0).has(TermFlags::ORINFO));
    }

    #[test]
    fn test_or_with_and_branch() {
        let ms = masks(&[0, 1]);
        let cfg = PlannerConfig::default();
        let and_branch = Expr::binary(
            eq(col(0, 0), Expr::integer(1)),
            BinaryOp::And,
            eq(col(0, 1), Expr::integer(2)),
        );
        let e = Expr::binary(and_branch, BinaryOp::Or, eq(col(0, 2), Expr::integer(3)));
        let wc = analyzed(&e, &ms, &cfg, 0);
        let info = wc.term(0).or_info().expect("or info");
        assert_eq!(info.indexable, 1);
        let branch = info.clause.term(0);
        assert_eq!(branch.op, OperatorMask::AND);
        assert_eq!(branch.and_info().expect("and info").clause.len(), 2);
    }

    #[test]
    fn test_or_with_unindexable_branch() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = Expr::binary(
            eq(col(0, 0), Expr::integer(1)),
            BinaryOp::Or,
            Expr::binary(col(0, 1), BinaryOp::Ne, Expr::integer(2)),
        );
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.term(0).or_info().expect("or info").indexable, 0);
        assert!(wc.term(0).op.is_empty());
    }

    fn like(pattern: &str, op: LikeOp) -> Expr {
        Expr::Like {
            expr: Box::new(text_col(0, 1)),
            pattern: Box::new(Expr::text(pattern)),
            escape: None,
            op,
            not: false,
        }
    }

    #[test]
    fn test_like_prefix_range() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = like("abC%", LikeOp::Like);
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 3);
        assert_eq!(wc.term(0).children_pending(), 2);
        assert_eq!(wc.term(1).op, OperatorMask::GE);
        assert_eq!(wc.term(1).right_operand(), Some(&Expr::text("abC")));
        assert_eq!(wc.term(2).op, OperatorMask::LT);
        assert_eq!(wc.term(2).right_operand(), Some(&Expr::text("abd")));
        let c = wc.term(2).left_operand().as_column().expect("column");
        assert_eq!(c.collation.as_deref(), Some("NOCASE"));
    }

    #[test]
    fn test_like_fold_boundary_keeps_like_test() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = like("a@%", LikeOp::Like);
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 3);
        assert_eq!(wc.term(0).children_pending(), 0);
        assert_eq!(wc.term(1).origin, TermOrigin::Root);
    }

    #[test]
    fn test_glob_is_case_sensitive_and_incomplete_suffix() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = like("Ab*x", LikeOp::Glob);
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 3);
        assert_eq!(wc.term(2).right_operand(), Some(&Expr::text("Ac")));
        assert_eq!(wc.term(0).children_pending(), 0);
    }

    #[test]
    fn test_like_not_applied() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        for e in [like("%abc", LikeOp::Like), like("abc%", LikeOp::Regexp)] {
            assert_eq!(analyzed(&e, &ms, &cfg, 0).len(), 1);
        }
        let e = like("abc%", LikeOp::Like);
        assert_eq!(analyzed(&e, &ms, &cfg, 1).len(), 1);
    }

    #[test]
    fn test_match_child_for_virtual_table() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = like("needle", LikeOp::Match);
        let wc = analyzed(&e, &ms, &cfg, 1);
        assert_eq!(wc.len(), 2);
        assert_eq!(wc.term(1).op, OperatorMask::MATCH);
        assert_eq!(wc.term(1).left_column(), Some((0, 1)));
        assert!(wc.term(0).has(TermFlags::COPIED));
    }

    #[test]
    fn test_not_null_gets_vnull_child() {
        let ms = masks(&[0]);
        let cfg = PlannerConfig::default();
        let e = Expr::IsNull {
            expr: Box::new(col(0, 2)),
            not: true,
        };
        let wc = analyzed(&e, &ms, &cfg, 0);
        assert_eq!(wc.len(), 2);
        let child = wc.term(1);
        assert!(child.has(TermFlags::VNULL));
        assert_eq!(child.op, OperatorMask::GT);
        assert_eq!(child.prereq_right, 0);

        let rowid = Expr::IsNull {
            expr: Box::new(col(0, -1)),
            not: true,
        };
        assert_eq!(analyzed(&rowid, &ms, &cfg, 0).len(), 1);
    }

    #[test]
    fn test_on_clause_term_depends_on_earlier_tables() {
        let ms = masks(&[0, 1, 2]);
        let cfg = PlannerConfig::default();
        let e = eq(col(2, 0), Expr::integer(1));
        let mut wc = WhereClause::new(BinaryOp::And);
        split_expr(&mut wc, Cow::Borrowed(&e), BinaryOp::And, Some(2));
        let ctx = AnalyzeContext {
            masks: &ms,
            virtual_tables: 0,
            config: &cfg,
        };
        analyze_all(&mut wc, &ctx);
        let t = wc.term(0);
        assert!(t.is_from_join());
        assert_eq!(t.prereq_right, 0b011);
        assert_eq!(t.prereq_all, 0b111);
    }
}
