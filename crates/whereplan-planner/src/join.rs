//! Join ordering.
//!
//! Nesting levels are filled outermost first. For each level every FROM
//! item not yet placed is costed as the next loop, and the cheapest one
//! whose plan only reads tables already placed wins.
//!
//! Each level runs up to two passes. The first ("optimal") pass costs every
//! candidate as if all other tables were already positioned. A candidate
//! whose best plan under that assumption still needs nothing from unplaced
//! tables can never get cheaper by waiting, so it is taken. Only when the
//! first pass finds nothing does the second pass pick the cheapest plan that
//! is usable right now. The search is greedy: the cost of a placement is
//! never revisited.

use tracing::debug;
use whereplan_ast::{Expr, FromItem, JoinType, OrderingTerm};
use whereplan_error::{PlanError, Result};
use whereplan_types::CursorId;
use whereplan_types::opcode::ProgramBuilder;

use crate::bitmask::{ALL_TABLES, Bitmask};
use crate::cost::{CostModel, CostRequest, PlanFlags, WhereCost, WherePlan};
use crate::term::WhereTerm;
use crate::trace::PlanEvent;

/// The plan chosen for one nesting level.
#[derive(Debug)]
pub(crate) struct PlannedLevel {
    /// Position of the FROM item in the source list.
    pub from: usize,
    pub plan: WherePlan,
    pub index_cursor: Option<CursorId>,
}

/// Loop order and the properties it guarantees.
#[derive(Debug)]
pub(crate) struct JoinPlan {
    pub levels: Vec<PlannedLevel>,
    /// Rows come out in ORDER BY order.
    pub order_satisfied: bool,
    /// Rows come out with duplicates of the DISTINCT list adjacent.
    pub distinct_ordered: bool,
    /// The single table can be updated in place while scanning.
    pub one_pass: bool,
}

pub(crate) struct JoinRequest<'r, 'a> {
    pub terms: &'r [WhereTerm<'a>],
    pub src: &'r [FromItem],
    /// Number of FROM items to place; the rest are ignored.
    pub n_tables: usize,
    pub order_by: Option<&'r [OrderingTerm]>,
    pub distinct: Option<&'r [Expr]>,
    pub one_pass_desired: bool,
    /// Cursor to open the chosen index on, when the caller fixed it.
    pub index_cursor: Option<CursorId>,
}

fn better(candidate: &WhereCost, best: &WhereCost) -> bool {
    candidate.cost < best.cost
        || (candidate.cost <= best.cost && candidate.plan.n_row < best.plan.n_row)
}

/// Choose a loop order and an access path per level.
#[allow(clippy::too_many_lines)]
pub(crate) fn plan_join(
    model: &mut CostModel<'_, '_>,
    builder: &mut ProgramBuilder,
    req: &JoinRequest<'_, '_>,
) -> Result<JoinPlan> {
    let n = req.n_tables;
    let mut not_ready: Bitmask = ALL_TABLES;
    let mut and_flags = PlanFlags::all();
    let mut order_satisfied = false;
    let mut distinct_ordered = false;
    let mut levels = Vec::with_capacity(n);
    let mut first_unplaced = 0;

    for level in 0..n {
        let mut best: Option<(usize, WhereCost)> = None;
        let mut chosen_optimal = false;
        let mut n_unconstrained = 0;
        let mut not_indexed: Bitmask = 0;
        let try_optimal = first_unplaced + 1 < n;

        for is_optimal in [true, false] {
            if (is_optimal && !try_optimal) || best.is_some() {
                continue;
            }
            let start = first_unplaced;
            for j in start..n {
                let item = &req.src[j];
                // LEFT and CROSS joins pin the item behind its left neighbour.
                let do_not_reorder = matches!(item.join_type, JoinType::Left | JoinType::Cross);
                if j != first_unplaced && do_not_reorder {
                    break;
                }
                let m = model.masks.bit_for(item.cursor);
                if m & not_ready == 0 {
                    if j == first_unplaced {
                        first_unplaced += 1;
                    }
                    continue;
                }
                let mask = if is_optimal { m } else { not_ready };
                let (order_by, distinct) = if level == 0 {
                    (req.order_by, req.distinct)
                } else {
                    (None, None)
                };
                if item.indexed_by().is_none() {
                    n_unconstrained += 1;
                }
                let cost = model.best_index(&CostRequest {
                    terms: req.terms,
                    outer: None,
                    item,
                    not_ready: mask,
                    not_valid: not_ready,
                    order_by,
                    distinct,
                })?;
                let indexed = cost.plan.flags.intersects(PlanFlags::NOT_FULLSCAN);
                if is_optimal && !indexed {
                    not_indexed |= m;
                }

                // A candidate that needs an unplaced table is unusable. A
                // full scan does not displace an indexed plan unless the
                // optimistic pass showed that no index helps this table. A
                // table with INDEXED BY must not push out unconstrained ones.
                let accept = cost.used & not_ready == 0
                    && best.as_ref().is_none_or(|(_, b)| {
                        not_indexed & m != 0
                            || !b.plan.flags.intersects(PlanFlags::NOT_FULLSCAN)
                            || indexed
                    })
                    && (n_unconstrained == 0 || item.indexed_by().is_none() || indexed)
                    && best.as_ref().is_none_or(|(_, b)| better(&cost, b));
                debug!(
                    target: "whereplan.join",
                    level,
                    table = %item.table.name,
                    optimal = is_optimal,
                    cost = cost.cost,
                    accept,
                    "join.candidate"
                );
                if accept {
                    best = Some((j, cost));
                    chosen_optimal = is_optimal;
                }
                if do_not_reorder {
                    break;
                }
            }
        }

        let Some((from, cost)) = best else {
            return Err(PlanError::internal(format!(
                "no usable plan for join level {level}"
            )));
        };
        let item = &req.src[from];
        let plan = cost.plan;
        if plan.flags.contains(PlanFlags::ORDERBY) {
            order_satisfied = true;
        }
        if plan.flags.contains(PlanFlags::DISTINCT) {
            distinct_ordered = true;
        }
        and_flags &= plan.flags;

        let index_cursor = if plan
            .flags
            .intersects(PlanFlags::INDEXED | PlanFlags::TEMP_INDEX)
        {
            Some(match req.index_cursor {
                Some(c) if !plan.flags.contains(PlanFlags::TEMP_INDEX) => c,
                _ => builder.alloc_cursor(),
            })
        } else {
            None
        };

        not_ready &= !model.masks.bit_for(item.cursor);
        if plan.n_row >= 1.0 {
            model.query_loop *= plan.n_row;
        }
        if let Some(name) = item.indexed_by() {
            if !plan.flags.intersects(PlanFlags::INDEXED) {
                return Err(PlanError::UnsatisfiableIndexOverride {
                    index: name.to_owned(),
                });
            }
        }
        debug!(
            target: "whereplan.join",
            level,
            table = %item.table.name,
            plan = %plan,
            optimal = chosen_optimal,
            rows = plan.n_row,
            "join.level_chosen"
        );
        model.events.emit(|| PlanEvent::LevelChosen {
            level,
            table: item.table.name.clone(),
            plan: plan.to_string(),
            optimal_pass: chosen_optimal,
        });
        levels.push(PlannedLevel {
            from,
            plan,
            index_cursor,
        });
    }

    if and_flags.contains(PlanFlags::UNIQUE) && req.order_by.is_some() {
        // At most one row per level: any order is every order.
        order_satisfied = true;
    }
    let one_pass = req.one_pass_desired && and_flags.contains(PlanFlags::UNIQUE);
    if one_pass {
        if let Some(first) = levels.first_mut() {
            first.plan.flags.remove(PlanFlags::IDX_ONLY);
        }
    }

    Ok(JoinPlan {
        levels,
        order_satisfied,
        distinct_ordered,
        one_pass,
    })
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;
    use std::sync::Arc;

    use whereplan_ast::{
        BinaryOp, ColumnDescriptor, IndexDescriptor, IndexHint, TableDescriptor,
    };
    use whereplan_types::{CollationRegistry, ROWID_COLUMN, TypeAffinity};

    use super::*;
    use crate::analyze::{AnalyzeContext, analyze_all, split_expr};
    use crate::bitmask::MaskSet;
    use crate::config::PlannerConfig;
    use crate::cost::PlanKind;
    use crate::term::WhereClause;
    use crate::trace::EventHook;

    fn table(name: &str, rows: u64, index_on_a: bool) -> Arc<TableDescriptor> {
        let mut t = TableDescriptor::new(
            name,
            vec![
                ColumnDescriptor::new("a", TypeAffinity::Integer),
                ColumnDescriptor::new("b", TypeAffinity::Integer),
            ],
        );
        t.row_estimate = rows;
        if index_on_a {
            let mut idx = IndexDescriptor::on_columns(&format!("{name}a"), name, &[0], false);
            idx.set_default_row_estimates(rows);
            t.indexes.push(Arc::new(idx));
        }
        Arc::new(t)
    }

    fn plan(src: &[FromItem], expr: &Expr) -> Result<JoinPlan> {
        let mut masks = MaskSet::new();
        for item in src {
            masks.create_bit(item.cursor)?;
        }
        let config = PlannerConfig::default();
        let mut clause = WhereClause::new(BinaryOp::And);
        split_expr(&mut clause, Cow::Borrowed(expr), BinaryOp::And, None);
        analyze_all(
            &mut clause,
            &AnalyzeContext {
                masks: &masks,
                virtual_tables: 0,
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
        let mut builder = ProgramBuilder::new();
        builder.reserve_cursors(8);
        plan_join(
            &mut model,
            &mut builder,
            &JoinRequest {
                terms: clause.terms(),
                src,
                n_tables: src.len(),
                order_by: None,
                distinct: None,
                one_pass_desired: false,
                index_cursor: None,
            },
        )
    }

    fn join_on_a() -> Expr {
        Expr::binary(
            Expr::column(0, 0, TypeAffinity::Integer),
            BinaryOp::Eq,
            Expr::column(1, 0, TypeAffinity::Integer),
        )
    }

    /// `left.l_col = right.r_col` between two cursors.
    fn equate(left: (CursorId, i32), right: (CursorId, i32)) -> Expr {
        Expr::binary(
            Expr::column(left.0, left.1, TypeAffinity::Integer),
            BinaryOp::Eq,
            Expr::column(right.0, right.1, TypeAffinity::Integer),
        )
    }

    /// FROM items for a ten-row `t1` and a thousand-row `t2`, in the given
    /// text order. `t1` is cursor 0 and `t2` is cursor 1 either way.
    fn t1_t2(t1_first: bool, t2_join: JoinType, t1_join: JoinType) -> [FromItem; 2] {
        let mut t1 = FromItem::new(table("t1", 10, false), 0);
        let mut t2 = FromItem::new(table("t2", 1000, false), 1);
        t1.join_type = t1_join;
        t2.join_type = t2_join;
        if t1_first { [t1, t2] } else { [t2, t1] }
    }

    #[test]
    fn test_smaller_table_outer_without_driving_index() {
        let expr = equate((0, 0), (1, 1));
        for t1_first in [true, false] {
            let src = t1_t2(t1_first, JoinType::Inner, JoinType::Inner);
            let plan = plan(&src, &expr).unwrap();
            assert_eq!(src[plan.levels[0].from].table.name, "t1", "t1_first={t1_first}");
            assert_eq!(src[plan.levels[1].from].table.name, "t2", "t1_first={t1_first}");
        }
    }

    #[test]
    fn test_cross_and_left_join_keep_larger_table_first() {
        let expr = equate((0, 0), (1, 1));
        for join in [JoinType::Cross, JoinType::Left] {
            let src = t1_t2(false, JoinType::Inner, join);
            let plan = plan(&src, &expr).unwrap();
            assert_eq!(src[plan.levels[0].from].table.name, "t2", "{join:?}");
            assert_eq!(src[plan.levels[1].from].table.name, "t1", "{join:?}");
        }
    }

    #[test]
    fn test_rowid_lookup_puts_small_table_inner() {
        let expr = equate((0, ROWID_COLUMN), (1, 1));
        for t1_first in [true, false] {
            let src = t1_t2(t1_first, JoinType::Inner, JoinType::Inner);
            let plan = plan(&src, &expr).unwrap();
            assert_eq!(src[plan.levels[0].from].table.name, "t2", "t1_first={t1_first}");
            assert!(matches!(plan.levels[0].plan.kind, PlanKind::FullScan));
            assert_eq!(src[plan.levels[1].from].table.name, "t1");
            assert!(matches!(plan.levels[1].plan.kind, PlanKind::RowidEq));
        }
    }

    #[test]
    fn test_indexed_table_goes_inner() {
        let src = [
            FromItem::new(table("big", 1_000_000, true), 0),
            FromItem::new(table("small", 100, false), 1),
        ];
        let plan = plan(&src, &join_on_a()).unwrap();
        assert_eq!(plan.levels[0].from, 1);
        assert_eq!(plan.levels[1].from, 0);
        assert!(plan.levels[1].plan.index().is_some());
        assert!(plan.levels[1].index_cursor.is_some());
    }

    #[test]
    fn test_left_join_keeps_source_order() {
        let mut right = FromItem::new(table("small", 100, false), 1);
        right.join_type = JoinType::Left;
        let src = [FromItem::new(table("big", 1_000_000, true), 0), right];
        let plan = plan(&src, &join_on_a()).unwrap();
        assert_eq!(plan.levels[0].from, 0);
        assert_eq!(plan.levels[1].from, 1);
    }

    #[test]
    fn test_unusable_indexed_by_is_error() {
        let mut item = FromItem::new(table("big", 1000, true), 0);
        item.index_hint = IndexHint::IndexedBy("biga".to_owned());
        let expr = Expr::binary(
            Expr::column(0, 1, TypeAffinity::Integer),
            BinaryOp::Eq,
            Expr::integer(1),
        );
        let err = plan(&[item], &expr).unwrap_err();
        assert_eq!(err.to_string(), "cannot use index: biga");
    }

    #[test]
    fn test_automatic_index_for_unindexed_inner_loop() {
        let src = [
            FromItem::new(table("outer_t", 1000, false), 0),
            FromItem::new(table("inner_t", 1000, false), 1),
        ];
        let plan = plan(&src, &join_on_a()).unwrap();
        assert!(matches!(plan.levels[1].plan.kind, PlanKind::TempIndex));
        assert!(plan.levels[1].index_cursor.is_some());
    }
}
