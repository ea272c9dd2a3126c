//! Costing virtual tables through their `best_index` advisor.

use tracing::debug;
use whereplan_ast::vtab::{ConstraintOp, IndexConstraint, IndexInfo, IndexOrderBy};
use whereplan_ast::{Expr, TableKind};
use whereplan_error::{PlanError, Result};

use crate::cost::{BIG_COST, CostModel, CostRequest, PlanFlags, PlanKind, WhereCost, WherePlan};
use crate::stats::estimate_log;
use crate::term::{OperatorMask, TermFlags};
use crate::trace::PlanEvent;

/// What a virtual table agreed to do, and which WHERE terms its constraints
/// came from.
#[derive(Debug, Clone)]
pub struct VirtualPlan {
    pub info: IndexInfo,
    /// Clause index of the term behind each entry of `info.constraints`.
    pub term_offsets: Vec<usize>,
}

fn constraint_op(op: OperatorMask) -> Option<ConstraintOp> {
    Some(match op {
        OperatorMask::EQ => ConstraintOp::Eq,
        OperatorMask::GT => ConstraintOp::Gt,
        OperatorMask::LE => ConstraintOp::Le,
        OperatorMask::LT => ConstraintOp::Lt,
        OperatorMask::GE => ConstraintOp::Ge,
        OperatorMask::MATCH => ConstraintOp::Match,
        _ => return None,
    })
}

/// Ask the table's advisor how it would answer the request.
///
/// The constraint list is rebuilt on every call, so `usable` always
/// reflects the tables ready at this join position.
#[allow(clippy::cast_precision_loss)]
pub(crate) fn best_virtual_index(
    model: &mut CostModel<'_, '_>,
    req: &CostRequest<'_, '_>,
) -> Result<WhereCost> {
    let item = req.item;
    let table = &item.table;
    let TableKind::Virtual(advisor) = &table.kind else {
        return Err(PlanError::internal(format!(
            "table {} is not virtual",
            table.name
        )));
    };
    let cursor = item.cursor;

    let mut constraints = Vec::new();
    let mut term_offsets = Vec::new();
    for (i, term) in req.terms.iter().enumerate() {
        let Some((c, column)) = term.left_column() else {
            continue;
        };
        if c != cursor || term.has(TermFlags::VNULL) {
            continue;
        }
        let Some(op) = constraint_op(term.op) else {
            continue;
        };
        constraints.push(IndexConstraint {
            column,
            op,
            usable: term.prereq_right & req.not_ready == 0,
        });
        term_offsets.push(i);
    }

    // The ORDER BY is only offered when the table alone can satisfy it.
    let order_by = req
        .order_by
        .and_then(|terms| {
            terms
                .iter()
                .map(|t| match &t.expr {
                    Expr::Column(c) if c.cursor == cursor => Some(IndexOrderBy {
                        column: c.column,
                        desc: t.desc,
                    }),
                    _ => None,
                })
                .collect::<Option<Vec<_>>>()
        })
        .unwrap_or_default();
    let order_by_offered = !order_by.is_empty();

    let mut info = IndexInfo::new(constraints, order_by);
    advisor.best_index(&mut info).map_err(|err| match err {
        err @ PlanError::VirtualTableAdvisory { .. } => err,
        other => PlanError::vtab(table.name.clone(), other.to_string()),
    })?;

    let mut used = 0;
    for ((constraint, usage), &t) in info
        .constraints
        .iter()
        .zip(&info.constraint_usage)
        .zip(&term_offsets)
    {
        if usage.argv_index <= 0 {
            continue;
        }
        if !constraint.usable {
            return Err(PlanError::vtab(
                table.name.clone(),
                format!("table {}: xBestIndex returned an invalid plan", table.name),
            ));
        }
        used |= req.terms[t].prereq_right;
    }

    let consumed = order_by_offered && info.order_by_consumed;
    let mut cost = info.estimated_cost;
    if req.order_by.is_some() && !consumed {
        cost += estimate_log(cost) * cost;
    }
    let cost = cost.min(BIG_COST / 2.0);
    let mut flags = PlanFlags::VIRTUALTABLE;
    if consumed {
        flags |= PlanFlags::ORDERBY;
    }
    let n_row = info.estimated_rows.max(1) as f64;

    debug!(
        target: "whereplan.cost",
        table = %table.name,
        idx_num = info.idx_num,
        cost,
        rows = n_row,
        "cost.virtual"
    );
    model.events.emit(|| PlanEvent::Candidate {
        table: table.name.clone(),
        index: info.idx_str.clone(),
        n_eq: 0,
        rows: n_row,
        cost,
        not_ready: req.not_ready,
    });

    let mut best = WhereCost {
        plan: WherePlan {
            kind: PlanKind::Virtual(Box::new(VirtualPlan { info, term_offsets })),
            flags,
            n_eq: 0,
            n_row,
            eq_ops: OperatorMask::empty(),
        },
        cost,
        used,
    };
    model.best_or_clause_index(req, &mut best)?;
    Ok(best)
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;

    use whereplan_ast::vtab::VirtualTableAdvisor;
    use whereplan_ast::{BinaryOp, ColumnDescriptor, FromItem, OrderingTerm, TableDescriptor};
    use whereplan_types::{CollationRegistry, TypeAffinity};

    use super::*;
    use crate::analyze::{AnalyzeContext, analyze_all, split_expr};
    use crate::bitmask::{ALL_TABLES, MaskSet};
    use crate::config::PlannerConfig;
    use crate::term::WhereClause;
    use crate::trace::EventHook;

    /// Takes every usable equality and claims the requested order.
    struct EqAdvisor;

    impl VirtualTableAdvisor for EqAdvisor {
        fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
            let mut argv = 0;
            for (c, u) in info.constraints.iter().zip(info.constraint_usage.iter_mut()) {
                if c.usable && c.op == ConstraintOp::Eq {
                    argv += 1;
                    u.argv_index = argv;
                    u.omit = true;
                }
            }
            info.idx_num = argv;
            info.idx_str = Some("eq".to_owned());
            info.order_by_consumed = true;
            info.estimated_cost = if argv > 0 { 10.0 } else { 1000.0 };
            info.estimated_rows = if argv > 0 { 1 } else { 1000 };
            Ok(())
        }
    }

    /// Uses every constraint whether usable or not.
    struct GreedyAdvisor;

    impl VirtualTableAdvisor for GreedyAdvisor {
        fn best_index(&self, info: &mut IndexInfo) -> Result<()> {
            for (i, u) in info.constraint_usage.iter_mut().enumerate() {
                u.argv_index = i32::try_from(i + 1).unwrap_or(i32::MAX);
            }
            Ok(())
        }
    }

    struct FailingAdvisor;

    impl VirtualTableAdvisor for FailingAdvisor {
        fn best_index(&self, _info: &mut IndexInfo) -> Result<()> {
            Err(PlanError::internal("backend unavailable"))
        }
    }

    fn vtable(advisor: Arc<dyn VirtualTableAdvisor>) -> Arc<TableDescriptor> {
        let mut t = TableDescriptor::new(
            "vt",
            vec![ColumnDescriptor::new("x", TypeAffinity::Integer)],
        );
        t.kind = TableKind::Virtual(advisor);
        Arc::new(t)
    }

    fn plan(
        advisor: Arc<dyn VirtualTableAdvisor>,
        expr: &Expr,
        not_ready: u64,
        order_by: Option<&[OrderingTerm]>,
    ) -> Result<WhereCost> {
        let item = FromItem::new(vtable(advisor), 0);
        let mut masks = MaskSet::new();
        masks.create_bit(0)?;
        masks.create_bit(1)?;
        let config = PlannerConfig::default();
        let mut clause = WhereClause::new(BinaryOp::And);
        split_expr(&mut clause, Cow::Borrowed(expr), BinaryOp::And, None);
        analyze_all(
            &mut clause,
            &AnalyzeContext {
                masks: &masks,
                virtual_tables: 1,
                config: &config,
            },
        );
        let collations = CollationRegistry::with_builtins();
        let mut hook = EventHook::none();
        let mut model = CostModel {
            masks: &masks,
            config: &config,
            collations: &collations,
            query_loop: 1.0,
            and_only: false,
            events: &mut hook,
        };
        best_virtual_index(
            &mut model,
            &CostRequest {
                terms: clause.terms(),
                outer: None,
                item: &item,
                not_ready,
                not_valid: not_ready,
                order_by,
                distinct: None,
            },
        )
    }

    fn x_eq(rhs: Expr) -> Expr {
        Expr::binary(Expr::column(0, 0, TypeAffinity::Integer), BinaryOp::Eq, rhs)
    }

    #[test]
    fn test_advisor_plan_is_adopted() {
        let cost = plan(Arc::new(EqAdvisor), &x_eq(Expr::integer(3)), ALL_TABLES, None).unwrap();
        assert!(cost.plan.flags.contains(PlanFlags::VIRTUALTABLE));
        assert!((cost.cost - 10.0).abs() < f64::EPSILON);
        let PlanKind::Virtual(v) = &cost.plan.kind else {
            panic!("expected a virtual plan");
        };
        assert_eq!(v.info.idx_num, 1);
        assert_eq!(v.term_offsets, vec![0]);
    }

    #[test]
    fn test_constraint_on_unready_table_is_unusable() {
        let rhs = Expr::column(1, 0, TypeAffinity::Integer);
        let cost = plan(Arc::new(EqAdvisor), &x_eq(rhs), ALL_TABLES, None).unwrap();
        assert!((cost.cost - 1000.0).abs() < f64::EPSILON);
        assert_eq!(cost.used, 0);
    }

    #[test]
    fn test_order_consumed_sets_orderby() {
        let order = [OrderingTerm::asc(Expr::column(0, 0, TypeAffinity::Integer))];
        let cost = plan(Arc::new(EqAdvisor), &x_eq(Expr::integer(3)), ALL_TABLES, Some(&order))
            .unwrap();
        assert!(cost.plan.flags.contains(PlanFlags::ORDERBY));
    }

    #[test]
    fn test_unusable_constraint_in_plan_is_error() {
        let rhs = Expr::column(1, 0, TypeAffinity::Integer);
        let err = plan(Arc::new(GreedyAdvisor), &x_eq(rhs), ALL_TABLES, None).unwrap_err();
        assert_eq!(
            err.to_string(),
            "table vt: xBestIndex returned an invalid plan"
        );
    }

    #[test]
    fn test_advisor_error_names_table() {
        let err = plan(Arc::new(FailingAdvisor), &x_eq(Expr::integer(1)), ALL_TABLES, None)
            .unwrap_err();
        assert!(matches!(err, PlanError::VirtualTableAdvisory { ref table, .. } if table == "vt"));
    }
}
