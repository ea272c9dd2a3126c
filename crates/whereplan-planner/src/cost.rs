//! Access-path costing.
//!
//! For one FROM item at one candidate join position, [`CostModel::best_index`]
//! compares a full scan, the rowid, every index, an OR-union of per-branch
//! plans and a transient automatic index, and returns the cheapest.
//!
//! Costs count row visits. A b-tree seek costs `log10(N)` visits of a table
//! of `N` rows, so the same unit covers both stepping and seeking. Sorting
//! `n` rows is charged `3 * n * log(n)`.

use std::fmt;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;
use whereplan_ast::{
    ColumnRef, Expr, FromItem, IndexDescriptor, IndexHint, InSet, JoinType, OrderingTerm,
    TableDescriptor, comparison_collation,
};
use whereplan_error::{PlanError, Result};
use whereplan_types::collation::same_collation;
use whereplan_types::{CollationRegistry, CursorId, ROWID_COLUMN, SqliteValue, TypeAffinity};

use crate::bitmask::{ALL_TABLES, Bitmask, MaskSet};
use crate::config::PlannerConfig;
use crate::stats::{
    RangeBound, estimate_equality, estimate_in_list, estimate_log, heuristic_range_divisor,
    range_divisor, value_from_expr,
};
use crate::term::{OperatorMask, TermFlags, WhereTerm, find_term_in, index_affinity_ok, operands};
use crate::trace::{EventHook, PlanEvent};
use crate::vtab::{VirtualPlan, best_virtual_index};

/// Cost reported for a plan that cannot be used.
pub const BIG_COST: f64 = 1e99;

/// Rows assumed for `IN (SELECT ...)` when nothing better is known.
const IN_SUBQUERY_ROWS: u64 = 25;

bitflags! {
    /// What an access path does, as far as code generation cares.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PlanFlags: u32 {
        /// `rowid = X` or `rowid IN (...)`.
        const ROWID_EQ = 0x0000_1000;
        /// `rowid < X` and/or `rowid > Y`.
        const ROWID_RANGE = 0x0000_2000;
        const COLUMN_EQ = 0x0001_0000;
        const COLUMN_RANGE = 0x0002_0000;
        const COLUMN_IN = 0x0004_0000;
        const COLUMN_NULL = 0x0008_0000;
        /// The range has an upper bound.
        const TOP_LIMIT = 0x0010_0000;
        /// The range has a lower bound.
        const BTM_LIMIT = 0x0020_0000;
        /// Every column needed is in the index; the table is never read.
        const IDX_ONLY = 0x0080_0000;
        /// Rows come out in ORDER BY order.
        const ORDERBY = 0x0100_0000;
        /// Scan in descending key order.
        const REVERSE = 0x0200_0000;
        /// At most one row matches.
        const UNIQUE = 0x0400_0000;
        const VIRTUALTABLE = 0x0800_0000;
        /// Union of per-branch plans of one OR term.
        const MULTI_OR = 0x1000_0000;
        /// Build and use a transient index.
        const TEMP_INDEX = 0x2000_0000;
        /// Rows come out grouped so that duplicates are adjacent.
        const DISTINCT = 0x4000_0000;

        const INDEXED = Self::COLUMN_EQ.bits()
            | Self::COLUMN_RANGE.bits()
            | Self::COLUMN_IN.bits()
            | Self::COLUMN_NULL.bits();
        const NOT_FULLSCAN = Self::ROWID_EQ.bits()
            | Self::ROWID_RANGE.bits()
            | Self::INDEXED.bits()
            | Self::MULTI_OR.bits();
        const IN_ABLE = Self::ROWID_EQ.bits() | Self::INDEXED.bits();
        const BOTH_LIMIT = Self::TOP_LIMIT.bits() | Self::BTM_LIMIT.bits();
    }
}

/// The object an access path reads.
#[derive(Debug, Clone)]
pub enum PlanKind {
    FullScan,
    RowidEq,
    RowidRange,
    Index(Arc<IndexDescriptor>),
    /// An automatic index built on first entry to the loop.
    TempIndex,
    /// Union of the per-branch plans of the OR term at this clause index.
    MultiOr { term: usize },
    Virtual(Box<VirtualPlan>),
}

/// A chosen access path for one table.
#[derive(Debug, Clone)]
pub struct WherePlan {
    pub kind: PlanKind,
    pub flags: PlanFlags,
    /// Leading index columns constrained by equality.
    pub n_eq: usize,
    /// Expected rows produced per iteration of the outer loops.
    pub n_row: f64,
    /// Operators accepted as equality on the index key.
    pub eq_ops: OperatorMask,
}

impl WherePlan {
    fn full_scan() -> Self {
        Self {
            kind: PlanKind::FullScan,
            flags: PlanFlags::empty(),
            n_eq: 0,
            n_row: 0.0,
            eq_ops: OperatorMask::empty(),
        }
    }

    /// The persistent index this plan scans, if any.
    pub fn index(&self) -> Option<&Arc<IndexDescriptor>> {
        match &self.kind {
            PlanKind::Index(idx) => Some(idx),
            _ => None,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self.kind, PlanKind::Virtual(_))
    }
}

impl fmt::Display for WherePlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PlanKind::FullScan => f.write_str("FULL SCAN"),
            PlanKind::RowidEq => f.write_str("ROWID EQ"),
            PlanKind::RowidRange => f.write_str("ROWID RANGE"),
            PlanKind::Index(idx) => write!(f, "INDEX {}", idx.name),
            PlanKind::TempIndex => f.write_str("AUTOMATIC INDEX"),
            PlanKind::MultiOr { .. } => f.write_str("MULTI-INDEX OR"),
            PlanKind::Virtual(v) => write!(
                f,
                "VIRTUAL TABLE INDEX {}:{}",
                v.info.idx_num,
                v.info.idx_str.as_deref().unwrap_or("")
            ),
        }
    }
}

/// A plan with its cost and the tables it needs to have been positioned.
#[derive(Debug, Clone)]
pub struct WhereCost {
    pub plan: WherePlan,
    pub cost: f64,
    /// Tables whose current row the plan reads.
    pub used: Bitmask,
}

impl WhereCost {
    /// Worse than anything.
    pub fn worst() -> Self {
        Self {
            plan: WherePlan::full_scan(),
            cost: BIG_COST,
            used: 0,
        }
    }
}

/// Terms of a clause enclosing the one being costed.
///
/// An OR branch is costed on its own terms, but the terms AND'ed around the
/// OR hold for it as well and may pin index columns.
#[derive(Clone, Copy)]
pub(crate) struct OuterTerms<'r, 'a> {
    pub terms: &'r [WhereTerm<'a>],
    pub outer: Option<&'r OuterTerms<'r, 'a>>,
}

/// The question asked of the cost model for one table.
#[derive(Clone, Copy)]
pub(crate) struct CostRequest<'r, 'a> {
    pub terms: &'r [WhereTerm<'a>],
    /// Enclosing clauses, searched after `terms` for index constraints.
    pub outer: Option<&'r OuterTerms<'r, 'a>>,
    pub item: &'r FromItem,
    /// Tables not yet positioned; terms referencing them cannot drive an
    /// index.
    pub not_ready: Bitmask,
    /// Tables not positioned in the real loop order, which may be a superset
    /// of `not_ready` during the optimistic pass.
    pub not_valid: Bitmask,
    pub order_by: Option<&'r [OrderingTerm]>,
    pub distinct: Option<&'r [Expr]>,
}

impl<'r, 'a> CostRequest<'r, 'a> {
    /// First term constraining `cursor.column` with one of `ops`, looking
    /// in `terms` and then in each enclosing clause.
    fn find_constraint(
        &self,
        cursor: CursorId,
        column: i32,
        ops: OperatorMask,
        index: Option<(&IndexDescriptor, TypeAffinity)>,
    ) -> Option<&'r WhereTerm<'a>> {
        let mut terms = self.terms;
        let mut outer = self.outer;
        loop {
            if let Some(t) = find_term_in(terms, cursor, column, self.not_ready, ops, index) {
                return Some(&terms[t]);
            }
            let scope = outer?;
            terms = scope.terms;
            outer = scope.outer;
        }
    }
}

/// Shared state of all costing calls of one compilation.
pub(crate) struct CostModel<'c, 's> {
    pub masks: &'c MaskSet,
    pub config: &'c PlannerConfig,
    pub collations: &'c CollationRegistry,
    /// Product of the row estimates of the levels placed so far.
    pub query_loop: f64,
    /// Compiling one branch of an OR: no nested OR-union.
    pub and_only: bool,
    pub events: &'c mut EventHook<'s>,
}

/// Result of probing one index.
struct Probe {
    flags: PlanFlags,
    n_eq: usize,
    n_row: f64,
    cost: f64,
    used: Bitmask,
}

impl CostModel<'_, '_> {
    /// Cheapest way to scan `req.item` given the request.
    pub(crate) fn best_index(&mut self, req: &CostRequest<'_, '_>) -> Result<WhereCost> {
        let best = if req.item.table.is_virtual() {
            best_virtual_index(self, req)?
        } else {
            self.best_btree_index(req)?
        };
        debug!(
            target: "whereplan.cost",
            table = %req.item.table.name,
            plan = %best.plan,
            rows = best.plan.n_row,
            cost = best.cost,
            "cost.best"
        );
        self.events.emit(|| PlanEvent::BestPlan {
            table: req.item.table.name.clone(),
            plan: best.plan.to_string(),
            rows: best.plan.n_row,
            cost: best.cost,
        });
        Ok(best)
    }

    fn best_btree_index(&mut self, req: &CostRequest<'_, '_>) -> Result<WhereCost> {
        let item = req.item;
        let table = &item.table;
        let eq_mask = if item.join_type == JoinType::Left {
            OperatorMask::EQ | OperatorMask::IN
        } else {
            OperatorMask::EQUALITY
        };

        let rowid = rowid_index(table);
        let mut probes: Vec<(&Arc<IndexDescriptor>, bool)> = Vec::new();
        match &item.index_hint {
            IndexHint::IndexedBy(name) => {
                let idx = table
                    .index_named(name)
                    .ok_or_else(|| PlanError::NoSuchIndex { name: name.clone() })?;
                probes.push((idx, false));
            }
            IndexHint::NotIndexed => probes.push((&rowid, true)),
            IndexHint::None => {
                probes.push((&rowid, true));
                probes.extend(table.indexes.iter().map(|idx| (idx, false)));
            }
        }

        let mut best = WhereCost::worst();
        for (probe, is_rowid) in probes {
            let ops = if is_rowid {
                OperatorMask::EQ | OperatorMask::IN
            } else {
                eq_mask
            };
            let p = self.probe_index(req, probe, is_rowid, ops, best.cost)?;
            self.events.emit(|| PlanEvent::Candidate {
                table: table.name.clone(),
                index: (!is_rowid).then(|| probe.name.clone()),
                n_eq: p.n_eq,
                rows: p.n_row,
                cost: p.cost,
                not_ready: req.not_ready,
            });
            if (is_rowid || !p.flags.is_empty())
                && (p.cost < best.cost || (p.cost <= best.cost && p.n_row < best.plan.n_row))
            {
                let flags = if is_rowid {
                    p.flags - PlanFlags::INDEXED
                } else {
                    p.flags - (PlanFlags::ROWID_EQ | PlanFlags::ROWID_RANGE)
                };
                let kind = if !is_rowid {
                    PlanKind::Index(Arc::clone(probe))
                } else if flags.contains(PlanFlags::ROWID_EQ) {
                    PlanKind::RowidEq
                } else if flags.contains(PlanFlags::ROWID_RANGE) {
                    PlanKind::RowidRange
                } else {
                    PlanKind::FullScan
                };
                best = WhereCost {
                    plan: WherePlan {
                        kind,
                        flags,
                        n_eq: p.n_eq,
                        n_row: p.n_row,
                        eq_ops: ops,
                    },
                    cost: p.cost,
                    used: p.used,
                };
            }
        }

        if req.order_by.is_none() && self.config.reverse_unordered_selects {
            best.plan.flags |= PlanFlags::REVERSE;
        }
        self.best_or_clause_index(req, &mut best)?;
        self.best_automatic_index(req, &mut best);
        Ok(best)
    }

    /// Cost of scanning `probe` using as many leading key columns as the
    /// WHERE terms pin down.
    #[allow(
        clippy::too_many_lines,
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    fn probe_index(
        &mut self,
        req: &CostRequest<'_, '_>,
        probe: &IndexDescriptor,
        is_rowid: bool,
        eq_ops: OperatorMask,
        best_cost: f64,
    ) -> Result<Probe> {
        let item = req.item;
        let table = &item.table;
        let cursor = item.cursor;
        let n_columns = probe.n_columns();
        let key_affinity = |col: i32| (!is_rowid).then(|| (probe, table.column_affinity(col)));

        let mut flags = PlanFlags::empty();
        let mut used: Bitmask = 0;
        let mut n_eq = 0;
        let mut in_mul: u64 = 1;
        let mut in_est = false;
        let mut first_term = None;

        // Equality prefix.
        while n_eq < n_columns {
            let column = probe.columns[n_eq].column;
            let Some(term) = req.find_constraint(cursor, column, eq_ops, key_affinity(column))
            else {
                break;
            };
            flags |= PlanFlags::COLUMN_EQ | PlanFlags::ROWID_EQ;
            if term.op.contains(OperatorMask::IN) {
                flags |= PlanFlags::COLUMN_IN;
                match &*term.expr {
                    Expr::In {
                        set: InSet::Subquery(_),
                        ..
                    } => {
                        in_mul = in_mul.saturating_mul(IN_SUBQUERY_ROWS);
                        in_est = true;
                    }
                    Expr::In {
                        set: InSet::List(items),
                        ..
                    } if !items.is_empty() => {
                        in_mul = in_mul.saturating_mul(items.len() as u64);
                    }
                    _ => {}
                }
            } else if term.op.contains(OperatorMask::ISNULL) {
                flags |= PlanFlags::COLUMN_NULL;
            }
            if n_eq == 0 && self.config.use_histograms && !probe.samples.is_empty() {
                first_term = Some(term);
            }
            used |= term.prereq_right;
            n_eq += 1;
        }

        // Range on the next key column.
        let mut range_div = 1.0;
        let mut n_bound = 0;
        if n_eq == n_columns
            && probe.unique
            && !flags.intersects(PlanFlags::COLUMN_IN | PlanFlags::COLUMN_NULL)
        {
            flags |= PlanFlags::UNIQUE;
        } else if !probe.unordered {
            let column = probe.columns.get(n_eq).map_or(ROWID_COLUMN, |c| c.column);
            let top = req.find_constraint(
                cursor,
                column,
                OperatorMask::LT | OperatorMask::LE,
                key_affinity(column),
            );
            let btm = req.find_constraint(
                cursor,
                column,
                OperatorMask::GT | OperatorMask::GE,
                key_affinity(column),
            );
            if top.is_some() || btm.is_some() {
                let affinity =
                    table.column_affinity(probe.columns.first().map_or(ROWID_COLUMN, |c| c.column));
                let bound = |term: &WhereTerm<'_>, inclusive_op: OperatorMask| {
                    RangeBound {
                        value: term
                            .right_operand()
                            .and_then(|r| value_from_expr(r, affinity)),
                        inclusive: term.op.contains(inclusive_op),
                        vnull: term.has(TermFlags::VNULL),
                    }
                };
                let lower = btm.map(|t| bound(t, OperatorMask::GE));
                let upper = top.map(|t| bound(t, OperatorMask::LE));
                range_div = if self.config.use_histograms {
                    range_divisor(
                        probe,
                        n_eq,
                        affinity,
                        lower.as_ref(),
                        upper.as_ref(),
                        self.collations,
                    )?
                } else {
                    heuristic_range_divisor(lower.as_ref(), upper.as_ref())
                };
                if let Some(term) = top {
                    n_bound += 1;
                    flags |= PlanFlags::TOP_LIMIT;
                    used |= term.prereq_right;
                }
                if let Some(term) = btm {
                    n_bound += 1;
                    flags |= PlanFlags::BTM_LIMIT;
                    used |= term.prereq_right;
                }
                flags |= PlanFlags::COLUMN_RANGE | PlanFlags::ROWID_RANGE;
            }
        }

        let mut sort = req.order_by.is_some();
        if let Some(order_by) = req.order_by {
            if let Some(rev) =
                sorting_index(self.masks, probe, is_rowid, table, cursor, order_by, n_eq, flags)
            {
                sort = false;
                flags |= PlanFlags::ROWID_RANGE | PlanFlags::COLUMN_RANGE | PlanFlags::ORDERBY;
                if rev {
                    flags |= PlanFlags::REVERSE;
                }
            }
        }

        let mut dist = req.distinct.is_some();
        if let Some(distinct) = req.distinct {
            if !is_rowid
                && !flags.contains(PlanFlags::COLUMN_IN)
                && distinct_index(req.terms, probe, cursor, distinct, n_eq)
            {
                dist = false;
                flags |= PlanFlags::ROWID_RANGE | PlanFlags::COLUMN_RANGE | PlanFlags::DISTINCT;
            }
        }

        let mut lookup = false;
        if !is_rowid && !flags.is_empty() {
            let mut needed = item.columns_used;
            for c in &probe.columns {
                if (0..63).contains(&c.column) {
                    needed &= !(1u64 << c.column);
                }
            }
            if needed == 0 {
                flags |= PlanFlags::IDX_ONLY;
            } else {
                lookup = true;
            }
        }

        let total = probe.row_estimates.first().copied().unwrap_or(0);
        let per_key = probe.row_estimates.get(n_eq).copied().unwrap_or(1).max(1);
        let mut n_row = per_key.saturating_mul(in_mul) as f64;
        if in_est && n_row * 2.0 > total as f64 {
            n_row = (total / 2) as f64;
            in_mul = (n_row / per_key as f64) as u64;
        }

        // A histogram refines an equality or IN on the first key column.
        if n_row > 1.0 && n_eq == 1 && per_key > 1 {
            if let Some(term) = first_term {
                let affinity = table.column_affinity(probe.columns[0].column);
                if term.op.intersects(OperatorMask::EQ | OperatorMask::ISNULL) {
                    let value = if term.op.contains(OperatorMask::ISNULL) {
                        Some(SqliteValue::Null)
                    } else {
                        term.right_operand()
                            .and_then(|r| value_from_expr(r, affinity))
                    };
                    if let Some(value) = value {
                        n_row = estimate_equality(probe, &value, self.collations)? as f64;
                    }
                } else if !in_est {
                    if let Expr::In {
                        set: InSet::List(items),
                        ..
                    } = &*term.expr
                    {
                        let values: Vec<_> = items
                            .iter()
                            .map(|e| value_from_expr(e, affinity))
                            .collect();
                        if let Some(n) = estimate_in_list(probe, &values, self.collations)? {
                            n_row = n as f64;
                        }
                    }
                }
            }
        }

        n_row = (n_row / range_div).max(1.0);

        let mut cost = if flags.intersects(PlanFlags::NOT_FULLSCAN) {
            let log_n = estimate_log(total as f64);
            let seeks = in_mul as f64;
            if lookup {
                n_row + (seeks + n_row) * log_n
            } else {
                n_row + seeks * log_n
            }
        } else {
            total as f64 * 4.0
        };
        if sort {
            cost += n_row * estimate_log(n_row) * 3.0;
        }
        if dist {
            cost += n_row * estimate_log(n_row) * 3.0;
        }

        // Terms the access path does not consume still filter its output.
        if n_row > 2.0 && cost <= best_cost {
            let this_table = self.masks.bit_for(cursor);
            let mut skip_eq = n_eq;
            let mut skip_range = n_bound;
            for term in req.terms {
                if n_row <= 2.0 {
                    break;
                }
                if term.has(TermFlags::VIRTUAL) || term.prereq_all & req.not_valid != this_table {
                    continue;
                }
                if term.op.intersects(OperatorMask::EQUALITY) {
                    if skip_eq > 0 {
                        skip_eq -= 1;
                    } else {
                        n_row /= 10.0;
                    }
                } else if term.op.intersects(OperatorMask::RANGE) {
                    if skip_range > 0 {
                        skip_range -= 1;
                    } else {
                        n_row /= 3.0;
                    }
                } else if term.op != OperatorMask::NOOP {
                    n_row /= 2.0;
                }
            }
            n_row = n_row.max(2.0);
        }

        debug!(
            target: "whereplan.cost",
            table = %table.name,
            index = if is_rowid { "ipk" } else { probe.name.as_str() },
            n_eq,
            rows = n_row,
            cost,
            flags = flags.bits(),
            "cost.probe"
        );
        Ok(Probe {
            flags,
            n_eq,
            n_row,
            cost,
            used,
        })
    }

    /// Replace `best` with the union of per-branch plans of an OR term when
    /// that is cheaper.
    pub(crate) fn best_or_clause_index(
        &mut self,
        req: &CostRequest<'_, '_>,
        best: &mut WhereCost,
    ) -> Result<()> {
        if req.item.index_hint != IndexHint::None || self.and_only {
            return Ok(());
        }
        let cursor = req.item.cursor;
        let this_table = self.masks.bit_for(cursor);
        for (idx, term) in req.terms.iter().enumerate() {
            let Some(or_info) = term.or_info() else {
                continue;
            };
            if (term.prereq_all & !this_table) & req.not_ready != 0
                || or_info.indexable & this_table == 0
            {
                continue;
            }
            let around = OuterTerms {
                terms: req.terms,
                outer: req.outer,
            };
            let mut total = 0.0;
            let mut n_row = 0.0;
            let mut used = 0;
            for branch in or_info.clause.terms() {
                let sub = if let Some(and) = branch.and_info() {
                    self.best_index(&CostRequest {
                        terms: and.clause.terms(),
                        outer: Some(&around),
                        order_by: None,
                        distinct: None,
                        ..*req
                    })?
                } else if branch.left_column().is_some_and(|(c, _)| c == cursor) {
                    self.best_index(&CostRequest {
                        terms: std::slice::from_ref(branch),
                        outer: Some(&around),
                        order_by: None,
                        distinct: None,
                        ..*req
                    })?
                } else {
                    continue;
                };
                total += sub.cost;
                n_row += sub.plan.n_row;
                used |= sub.used;
                if total >= best.cost {
                    break;
                }
            }
            if req.order_by.is_some() {
                total += n_row * estimate_log(n_row) * 2.0;
            }
            debug!(
                target: "whereplan.cost",
                table = %req.item.table.name,
                term = idx,
                cost = total,
                rows = n_row,
                "cost.or_union"
            );
            if total < best.cost {
                *best = WhereCost {
                    plan: WherePlan {
                        kind: PlanKind::MultiOr { term: idx },
                        flags: PlanFlags::MULTI_OR,
                        n_eq: 0,
                        n_row,
                        eq_ops: OperatorMask::empty(),
                    },
                    cost: total,
                    used,
                };
            }
        }
        Ok(())
    }

    /// Replace a full scan of an inner loop with a transient index when one
    /// of the terms can drive it.
    #[allow(clippy::cast_precision_loss)]
    fn best_automatic_index(&mut self, req: &CostRequest<'_, '_>, best: &mut WhereCost) {
        let item = req.item;
        if self.query_loop <= 1.0
            || !self.config.automatic_index
            || best.plan.flags.intersects(PlanFlags::NOT_FULLSCAN)
            || item.index_hint == IndexHint::NotIndexed
            || item.correlated
        {
            return;
        }
        let n_table = item.table.row_estimate as f64;
        let log_n = estimate_log(n_table);
        let cost = 2.0 * log_n * (n_table / self.query_loop + 1.0);
        if cost >= best.cost {
            return;
        }
        let Some(term) = req
            .terms
            .iter()
            .find(|t| term_can_drive_index(t, item, req.not_ready))
        else {
            return;
        };
        debug!(
            target: "whereplan.cost",
            table = %item.table.name,
            cost,
            "cost.automatic_index"
        );
        *best = WhereCost {
            plan: WherePlan {
                kind: PlanKind::TempIndex,
                flags: PlanFlags::TEMP_INDEX,
                n_eq: 0,
                n_row: log_n + 1.0,
                eq_ops: OperatorMask::EQ,
            },
            cost,
            used: term.prereq_right,
        };
    }
}

/// The rowid viewed as a unique single-column index.
fn rowid_index(table: &TableDescriptor) -> Arc<IndexDescriptor> {
    let mut idx = IndexDescriptor::on_columns("", &table.name, &[ROWID_COLUMN], true);
    idx.row_estimates = vec![table.row_estimate, 1];
    Arc::new(idx)
}

/// Whether `term` can be a key column of an automatic index on `item`.
pub(crate) fn term_can_drive_index(
    term: &WhereTerm<'_>,
    item: &FromItem,
    not_ready: Bitmask,
) -> bool {
    let Some((cursor, column)) = term.left_column() else {
        return false;
    };
    cursor == item.cursor
        && column >= 0
        && term.op == OperatorMask::EQ
        && term.prereq_right & not_ready == 0
        && index_affinity_ok(&term.expr, item.table.column_affinity(column))
}

// ---------------------------------------------------------------------------
// Order and distinctness
// ---------------------------------------------------------------------------

/// The column an ORDER BY or DISTINCT expression reads, looking through
/// `COLLATE`.
pub(crate) fn column_of(expr: &Expr) -> Option<&ColumnRef> {
    match expr {
        Expr::Column(c) => Some(c),
        Expr::Collate { expr, .. } => column_of(expr),
        _ => None,
    }
}

fn references_other_tables(masks: &MaskSet, list: &[OrderingTerm], cursor: CursorId) -> bool {
    let others = !masks.bit_for(cursor);
    list.iter().any(|t| masks.expr_usage(&t.expr) & others != 0)
}

/// Whether walking `probe` after its `n_eq` equality columns yields rows in
/// `order_by` order. `Some(true)` means the walk has to run backwards.
#[allow(clippy::too_many_arguments)]
fn sorting_index(
    masks: &MaskSet,
    probe: &IndexDescriptor,
    is_rowid: bool,
    table: &TableDescriptor,
    cursor: CursorId,
    order_by: &[OrderingTerm],
    n_eq: usize,
    flags: PlanFlags,
) -> Option<bool> {
    if order_by.is_empty() || flags.contains(PlanFlags::COLUMN_IN) || probe.unordered {
        return None;
    }
    let n_terms = order_by.len();
    let n_columns = probe.n_columns();
    let mut sort_desc = false;
    let mut i = 0;
    let mut j = 0;
    while j < n_terms && i <= n_columns {
        let term = &order_by[j];
        let Some(col) = column_of(&term.expr) else {
            break;
        };
        if col.cursor != cursor {
            break;
        }
        let expr_coll = term.expr.collation().map(|(name, _)| name);
        let (index_column, index_desc, index_coll) = if !is_rowid && i < n_columns {
            let c = &probe.columns[i];
            (c.column, c.descending, c.collation.as_deref())
        } else {
            (ROWID_COLUMN, false, expr_coll)
        };
        if col.column != index_column || !same_collation(expr_coll, index_coll) {
            if i < n_eq {
                // Equality-pinned columns may be skipped.
                i += 1;
                continue;
            } else if i == n_columns {
                break;
            }
            return None;
        }
        let term_desc = index_desc ^ term.desc;
        if i > n_eq {
            if term_desc != sort_desc {
                return None;
            }
        } else {
            sort_desc = term_desc;
        }
        j += 1;
        if index_column < 0 && !references_other_tables(masks, &order_by[j..], cursor) {
            // Nothing sorts below a rowid.
            j = n_terms;
        }
        i += 1;
    }
    if j >= n_terms {
        return Some(sort_desc);
    }
    if probe.unique
        && i == n_columns
        && !flags.contains(PlanFlags::COLUMN_NULL)
        && !references_other_tables(masks, &order_by[j..], cursor)
    {
        // A unique key with no NULLs leaves nothing for later terms to order.
        let not_null = probe.columns[n_eq.min(n_columns)..].iter().all(|c| {
            usize::try_from(c.column)
                .ok()
                .and_then(|k| table.columns.get(k))
                .is_some_and(|d| d.not_null)
        });
        if not_null {
            return Some(sort_desc);
        }
    }
    None
}

/// Position in `list` of the expression reading key column `i` of `index`
/// with the key's collation.
pub(crate) fn find_index_col(
    list: &[Expr],
    cursor: CursorId,
    index: &IndexDescriptor,
    i: usize,
) -> Option<usize> {
    let key = &index.columns[i];
    list.iter().position(|e| {
        column_of(e).is_some_and(|c| c.cursor == cursor && c.column == key.column)
            && same_collation(e.collation().map(|(n, _)| n), key.collation.as_deref())
    })
}

/// Whether walking `probe` after its `n_eq` equality columns yields rows
/// with equal `distinct` values next to one another.
fn distinct_index(
    terms: &[WhereTerm<'_>],
    probe: &IndexDescriptor,
    cursor: CursorId,
    distinct: &[Expr],
    n_eq: usize,
) -> bool {
    if distinct.len() >= 64 {
        return false;
    }
    let mut pending: u64 = 0;
    for (i, expr) in distinct.iter().enumerate() {
        let Some(col) = column_of(expr) else {
            return false;
        };
        if let Some(t) = find_term_in(
            terms,
            col.cursor,
            col.column,
            ALL_TABLES,
            OperatorMask::EQ,
            None,
        ) {
            // Pinned by an equality with the same collation: constant.
            let (left, right) = operands(&terms[t].expr);
            let coll = match right {
                crate::term::Operand::Expr(r) => comparison_collation(left, r),
                _ => left.collation().map(|(n, _)| n),
            };
            if same_collation(coll, expr.collation().map(|(n, _)| n)) {
                continue;
            }
        }
        if col.cursor != cursor {
            return false;
        }
        pending |= 1 << i;
    }
    let mut i = n_eq;
    while pending != 0 && i < probe.n_columns() {
        let Some(pos) = find_index_col(distinct, cursor, probe, i) else {
            break;
        };
        pending &= !(1u64 << pos);
        i += 1;
    }
    pending == 0
}

#[cfg(test)]
mod tests {
    use std::borrow::Cow;

    use whereplan_ast::{BinaryOp, ColumnDescriptor};

    use super::*;
    use crate::analyze::{AnalyzeContext, analyze_all, split_expr};
    use crate::term::WhereClause;

    fn table(rows: u64) -> Arc<TableDescriptor> {
        let mut t = TableDescriptor::new(
            "t1",
            vec![
                ColumnDescriptor::new("a", TypeAffinity::Integer),
                ColumnDescriptor::new("b", TypeAffinity::Integer),
                ColumnDescriptor::new("c", TypeAffinity::Text),
            ],
        );
        t.row_estimate = rows;
        let mut ab = IndexDescriptor::on_columns("t1ab", "t1", &[0, 1], false);
        ab.set_default_row_estimates(rows);
        t.indexes.push(Arc::new(ab));
        Arc::new(t)
    }

    fn col(c: i32) -> Expr {
        Expr::column(0, c, TypeAffinity::Integer)
    }

    fn clause_for<'a>(expr: &'a Expr, masks: &MaskSet, config: &PlannerConfig) -> WhereClause<'a> {
        let mut clause = WhereClause::new(BinaryOp::And);
        split_expr(&mut clause, Cow::Borrowed(expr), BinaryOp::And, None);
        let ctx = AnalyzeContext {
            masks,
            virtual_tables: 0,
            config,
        };
        analyze_all(&mut clause, &ctx);
        clause
    }

    fn best(
        expr: &Expr,
        item: &FromItem,
        order_by: Option<&[OrderingTerm]>,
        config: &PlannerConfig,
    ) -> Result<WhereCost> {
        let mut masks = MaskSet::new();
        masks.create_bit(item.cursor)?;
        let clause = clause_for(expr, &masks, config);
        let collations = CollationRegistry::with_builtins();
        let mut hook = EventHook::none();
        let mut model = CostModel {
            masks: &masks,
            config,
            collations: &collations,
            query_loop: 1.0,
            and_only: false,
            events: &mut hook,
        };
        model.best_index(&CostRequest {
            terms: clause.terms(),
            outer: None,
            item,
            not_ready: ALL_TABLES,
            not_valid: ALL_TABLES,
            order_by,
            distinct: None,
        })
    }

    #[test]
    fn test_equality_on_index_prefix_beats_scan() {
        let item = FromItem::new(table(1_000_000), 0);
        let expr = Expr::binary(col(0), BinaryOp::Eq, Expr::integer(5));
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(best.plan.flags.contains(PlanFlags::COLUMN_EQ));
        assert_eq!(best.plan.n_eq, 1);
        assert_eq!(best.plan.index().map(|i| i.name.as_str()), Some("t1ab"));
        assert!(best.cost < 4_000_000.0);
    }

    #[test]
    fn test_rowid_equality_is_unique() {
        let item = FromItem::new(table(1000), 0);
        let expr = Expr::binary(col(ROWID_COLUMN), BinaryOp::Eq, Expr::integer(7));
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(matches!(best.plan.kind, PlanKind::RowidEq));
        assert!(best.plan.flags.contains(PlanFlags::UNIQUE));
        assert!((best.plan.n_row - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_no_usable_term_is_full_scan_at_four_per_row() {
        let item = FromItem::new(table(500), 0);
        let expr = Expr::binary(col(2), BinaryOp::Ne, Expr::text("x"));
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(matches!(best.plan.kind, PlanKind::FullScan));
        assert!((best.cost - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_order_by_rowid_needs_no_sort() {
        let item = FromItem::new(table(1000), 0);
        let expr = Expr::binary(col(2), BinaryOp::Ne, Expr::text("x"));
        let order = [OrderingTerm::desc(col(ROWID_COLUMN))];
        let best = best(&expr, &item, Some(&order), &PlannerConfig::default()).unwrap();
        assert!(best.plan.flags.contains(PlanFlags::ORDERBY));
        assert!(best.plan.flags.contains(PlanFlags::REVERSE));
    }

    #[test]
    fn test_indexed_by_unknown_index_is_error() {
        let mut item = FromItem::new(table(1000), 0);
        item.index_hint = IndexHint::IndexedBy("nope".to_owned());
        let expr = Expr::binary(col(0), BinaryOp::Eq, Expr::integer(1));
        let err = best(&expr, &item, None, &PlannerConfig::default()).unwrap_err();
        assert!(matches!(err, PlanError::NoSuchIndex { .. }));
    }

    #[test]
    fn test_reverse_unordered_sets_reverse_flag() {
        let item = FromItem::new(table(1000), 0);
        let expr = Expr::binary(col(2), BinaryOp::Ne, Expr::text("x"));
        let config = PlannerConfig {
            reverse_unordered_selects: true,
            ..PlannerConfig::default()
        };
        let best = best(&expr, &item, None, &config).unwrap();
        assert!(best.plan.flags.contains(PlanFlags::REVERSE));
    }

    #[test]
    fn test_or_of_indexed_columns_becomes_multi_or() {
        let mut t = (*table(1_000_000)).clone();
        let mut c = IndexDescriptor::on_columns("t1c", "t1", &[2], false);
        c.set_default_row_estimates(1_000_000);
        t.indexes.push(Arc::new(c));
        let item = FromItem::new(Arc::new(t), 0);
        let expr = Expr::binary(
            Expr::binary(col(0), BinaryOp::Eq, Expr::integer(1)),
            BinaryOp::Or,
            Expr::binary(
                Expr::column(0, 2, TypeAffinity::Text),
                BinaryOp::Eq,
                Expr::text("x"),
            ),
        );
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(matches!(best.plan.kind, PlanKind::MultiOr { .. }));
        assert!(best.plan.flags.contains(PlanFlags::MULTI_OR));
    }

    /// `t1` with indexes on `(a, b)` and `(a, c)`, each narrowing
    /// `1000000 10 1`.
    fn table_ab_ac() -> Arc<TableDescriptor> {
        let mut t = (*table(1_000_000)).clone();
        let mut ac = IndexDescriptor::on_columns("t1ac", "t1", &[0, 2], false);
        ac.row_estimates = vec![1_000_000, 10, 1];
        t.indexes.push(Arc::new(ac));
        Arc::make_mut(&mut t.indexes[0]).row_estimates = vec![1_000_000, 10, 1];
        Arc::new(t)
    }

    /// An item whose body reads every column, so no index covers it.
    fn reads_all(table: Arc<TableDescriptor>) -> FromItem {
        let mut item = FromItem::new(table, 0);
        for c in 0..3 {
            item.use_column(c);
        }
        item
    }

    fn a_and_b_or_c() -> Expr {
        Expr::binary(
            Expr::binary(col(0), BinaryOp::Eq, Expr::integer(1)),
            BinaryOp::And,
            Expr::binary(
                Expr::binary(col(1), BinaryOp::Eq, Expr::integer(2)),
                BinaryOp::Or,
                Expr::binary(
                    Expr::column(0, 2, TypeAffinity::Text),
                    BinaryOp::Eq,
                    Expr::text("x"),
                ),
            ),
        )
    }

    #[test]
    fn test_or_branches_use_enclosing_equality() {
        let item = reads_all(table_ab_ac());
        let expr = a_and_b_or_c();
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(matches!(best.plan.kind, PlanKind::MultiOr { .. }));
        // Each branch seeks both key columns of its index and finds one row.
        assert!((best.plan.n_row - 2.0).abs() < 1e-9, "{}", best.plan.n_row);
    }

    #[test]
    fn test_or_union_sorting_penalty() {
        let item = reads_all(table_ab_ac());
        let expr = a_and_b_or_c();
        let config = PlannerConfig::default();
        let unordered = best(&expr, &item, None, &config).unwrap();
        let order = [OrderingTerm::asc(Expr::column(0, 2, TypeAffinity::Text))];
        let ordered = best(&expr, &item, Some(&order), &config).unwrap();
        assert!(matches!(unordered.plan.kind, PlanKind::MultiOr { .. }));
        assert!(matches!(ordered.plan.kind, PlanKind::MultiOr { .. }));
        let n = ordered.plan.n_row;
        let penalty = n * estimate_log(n) * 2.0;
        assert!((ordered.cost - unordered.cost - penalty).abs() < 1e-9);
    }

    #[test]
    fn test_two_column_equality_uses_whole_prefix() {
        let mut t = (*table(1000)).clone();
        Arc::make_mut(&mut t.indexes[0]).row_estimates = vec![1000, 10, 1];
        let item = FromItem::new(Arc::new(t), 0);
        let expr = Expr::binary(
            Expr::binary(col(0), BinaryOp::Eq, Expr::integer(5)),
            BinaryOp::And,
            Expr::binary(col(1), BinaryOp::Eq, Expr::integer(7)),
        );
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert_eq!(best.plan.index().map(|i| i.name.as_str()), Some("t1ab"));
        assert_eq!(best.plan.n_eq, 2);
        assert!((best.plan.n_row - 1.0).abs() < 1e-9, "{}", best.plan.n_row);
    }

    #[test]
    fn test_gap_in_index_prefix_stops_equality() {
        let mut t = (*table(1000)).clone();
        Arc::make_mut(&mut t.indexes[0]).row_estimates = vec![1000, 10, 1];
        let item = FromItem::new(Arc::new(t), 0);
        let expr = Expr::binary(
            Expr::binary(col(0), BinaryOp::Eq, Expr::integer(5)),
            BinaryOp::And,
            Expr::binary(
                Expr::column(0, 2, TypeAffinity::Text),
                BinaryOp::Eq,
                Expr::text("7"),
            ),
        );
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert_eq!(best.plan.index().map(|i| i.name.as_str()), Some("t1ab"));
        assert_eq!(best.plan.n_eq, 1);
        // Ten rows per key on `a`; the residual `c` test cuts that to the floor.
        assert!((best.plan.n_row - 2.0).abs() < 1e-9, "{}", best.plan.n_row);
    }

    #[test]
    fn test_covering_index_wins_at_equal_rows() {
        let mut t = (*table(1000)).clone();
        let mut ac = IndexDescriptor::on_columns("t1ac", "t1", &[0, 2], false);
        ac.set_default_row_estimates(1000);
        // Listed first so that only cost can make (a, b) win.
        t.indexes.insert(0, Arc::new(ac));
        let mut item = FromItem::new(Arc::new(t), 0);
        item.use_column(0);
        item.use_column(1);
        let expr = Expr::binary(col(0), BinaryOp::Eq, Expr::integer(5));
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert_eq!(best.plan.index().map(|i| i.name.as_str()), Some("t1ab"));
        assert!(best.plan.flags.contains(PlanFlags::IDX_ONLY));
    }

    #[test]
    fn test_covering_index_sets_idx_only() {
        let mut item = FromItem::new(table(1000), 0);
        item.use_column(0);
        item.use_column(1);
        let expr = Expr::binary(col(0), BinaryOp::Eq, Expr::integer(1));
        let best = best(&expr, &item, None, &PlannerConfig::default()).unwrap();
        assert!(best.plan.flags.contains(PlanFlags::IDX_ONLY));
    }
}
