//! WHERE-clause planning and scan code generation.
//!
//! [`where_begin`] decomposes a WHERE clause into terms, picks a nesting
//! order for the FROM items and an access path for each, and emits the loop
//! headers. The caller then emits its per-row code and finishes with
//! [`WhereInfo::end`], which emits the loop footers.
//!
//! ```text
//! where_begin ──▶ split + analyze terms
//!             ──▶ plan_join (best_index per candidate)
//!             ──▶ open cursors, build automatic indexes
//!             ──▶ one loop header per level
//! caller body
//! WhereInfo::end ──▶ loop footers, LEFT JOIN null rows, covering rewrite
//! ```

pub mod analyze;
pub mod bitmask;
mod closer;
mod codegen;
pub mod config;
pub mod cost;
pub mod explain;
pub mod exprcode;
mod join;
pub mod stats;
pub mod term;
pub mod trace;
pub mod vtab;

use std::borrow::Cow;
use std::sync::Arc;

use bitflags::bitflags;
use tracing::debug;
use whereplan_ast::{BinaryOp, Expr, FromItem, IndexDescriptor, OrderingTerm};
use whereplan_error::{PlanError, Result};
use whereplan_types::opcode::{Label, Opcode, ProgramBuilder};
use whereplan_types::{CollationRegistry, CursorId, ROWID_COLUMN};

pub use bitmask::{ALL_TABLES, Bitmask, MAX_TABLES, MaskSet};
pub use config::{PlannerConfig, set_global_automatic_index, set_global_reverse_scan};
pub use cost::{BIG_COST, PlanFlags, PlanKind, WhereCost, WherePlan};
pub use explain::{ScanLine, WherePlanSummary};
pub use exprcode::SubqueryCoder;
pub use stats::{StatsLoad, StatsStore, load_analysis};
pub use term::{OperatorMask, TermFlags, WhereClause, WhereTerm};
pub use trace::{PlanEvent, PlanEventSink, RecordingSink};

use crate::analyze::{AnalyzeContext, analyze_all, split_expr};
use crate::cost::CostModel;
use crate::exprcode::{ColumnRead, ExprCoder};
use crate::join::{JoinRequest, plan_join};
use crate::term::find_term_in;
use crate::trace::EventHook;

bitflags! {
    /// Caller requests that shape how [`where_begin`] plans and codes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct WhereFlags: u16 {
        /// The ORDER BY is a single `min()` argument; skip leading NULLs.
        const ORDERBY_MIN = 0x0001;
        /// The caller wants to modify rows while scanning a single table.
        const ONEPASS_DESIRED = 0x0004;
        /// Rows matching several OR branches may be produced more than once.
        const DUPLICATES_OK = 0x0008;
        /// Cursors are opened and closed by the caller.
        const OMIT_OPEN_CLOSE = 0x0010;
        /// Always position the table cursor, even under a covering index.
        const FORCE_TABLE = 0x0020;
        /// Plan the first FROM item only.
        const ONETABLE_ONLY = 0x0040;
        /// Do not consider OR-union plans.
        const AND_ONLY = 0x0080;
    }
}

/// How the loop nest treats a requested DISTINCT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistinctMode {
    /// The caller must remove duplicates itself.
    #[default]
    None,
    /// A unique index guarantees every row is distinct already.
    Unique,
    /// Duplicate rows come out next to each other.
    Ordered,
}

// ---------------------------------------------------------------------------
// Compilation context
// ---------------------------------------------------------------------------

/// Shared state for one statement compilation.
///
/// Owns nothing: the program, the collation registry, the event sink and
/// the subquery coder all belong to the caller and are borrowed for `'c`.
pub struct WhereContext<'c> {
    builder: &'c mut ProgramBuilder,
    collations: &'c CollationRegistry,
    config: PlannerConfig,
    events: EventHook<'c>,
    subqueries: Option<&'c mut dyn SubqueryCoder>,
    /// Estimated iterations of all loops enclosing the current one.
    query_loop: f64,
}

impl<'c> WhereContext<'c> {
    /// A context using the process-wide configuration as of now.
    pub fn new(builder: &'c mut ProgramBuilder, collations: &'c CollationRegistry) -> Self {
        Self {
            builder,
            collations,
            config: PlannerConfig::snapshot(),
            events: EventHook::none(),
            subqueries: None,
            query_loop: 1.0,
        }
    }

    #[must_use]
    pub fn with_config(mut self, config: PlannerConfig) -> Self {
        self.config = config;
        self
    }

    /// Report planning decisions to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: &'c mut dyn PlanEventSink) -> Self {
        self.events = EventHook::new(Some(sink));
        self
    }

    /// Compile subqueries found in WHERE clauses with `coder`.
    #[must_use]
    pub fn with_subqueries(mut self, coder: &'c mut dyn SubqueryCoder) -> Self {
        self.subqueries = Some(coder);
        self
    }

    pub fn builder(&mut self) -> &mut ProgramBuilder {
        &mut *self.builder
    }

    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Estimated number of times the innermost open loop runs.
    pub fn query_loop(&self) -> f64 {
        self.query_loop
    }
}

// ---------------------------------------------------------------------------
// Loop levels
// ---------------------------------------------------------------------------

/// Instruction that advances a loop, emitted by the closer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LoopStep {
    pub opcode: Opcode,
    pub p1: i32,
    pub p2: i32,
}

/// An `IN` operator driving an index or rowid lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct InLoop {
    /// Ephemeral cursor holding the right-hand side values.
    pub cursor: CursorId,
    /// Address of the instruction reading the current value; the `Rewind`
    /// is right before it and the NULL check right after.
    pub top_addr: usize,
}

/// One nested loop of the generated code.
#[derive(Debug)]
pub struct WhereLevel {
    from: usize,
    table_cursor: CursorId,
    index_cursor: Option<CursorId>,
    plan: WherePlan,
    /// The transient index built for a `TEMP_INDEX` plan.
    auto_index: Option<Arc<IndexDescriptor>>,
    /// Index shared by every branch of a `MULTI_OR` plan.
    covering: Option<Arc<IndexDescriptor>>,
    /// Register set to 1 once the right side of a LEFT JOIN matched.
    left_join_flag: Option<i32>,
    brk: Label,
    cont: Label,
    /// Jump here for the next candidate row; differs from `brk` when IN
    /// loops wrap the lookup.
    nxt: Label,
    /// Address of the instruction recording a LEFT JOIN match.
    first_addr: usize,
    step: Option<LoopStep>,
    in_loops: Vec<InLoop>,
    /// EXPLAIN text of each OR branch scan.
    or_branches: Vec<String>,
}

impl WhereLevel {
    fn new(
        from: usize,
        table_cursor: CursorId,
        plan: WherePlan,
        index_cursor: Option<CursorId>,
        brk: Label,
        cont: Label,
    ) -> Self {
        Self {
            from,
            table_cursor,
            index_cursor,
            plan,
            auto_index: None,
            covering: None,
            left_join_flag: None,
            brk,
            cont,
            nxt: brk,
            first_addr: 0,
            step: None,
            in_loops: Vec::new(),
            or_branches: Vec::new(),
        }
    }

    /// Position of the scanned item in the FROM list.
    pub fn from(&self) -> usize {
        self.from
    }

    pub fn table_cursor(&self) -> CursorId {
        self.table_cursor
    }

    pub fn index_cursor(&self) -> Option<CursorId> {
        self.index_cursor
    }

    pub fn plan(&self) -> &WherePlan {
        &self.plan
    }

    pub fn left_join_flag(&self) -> Option<i32> {
        self.left_join_flag
    }

    /// The index the loop walks: a persistent one, the automatic one, or
    /// the one shared by every OR branch.
    pub fn scan_index(&self) -> Option<&Arc<IndexDescriptor>> {
        self.plan
            .index()
            .or(self.auto_index.as_ref())
            .or(self.covering.as_ref())
    }
}

// ---------------------------------------------------------------------------
// WhereInfo
// ---------------------------------------------------------------------------

/// The loop nest opened by [`where_begin`].
///
/// Must be finished with [`WhereInfo::end`] once the caller has emitted its
/// per-row code.
#[derive(Debug)]
pub struct WhereInfo<'a> {
    src: &'a [FromItem],
    clause: WhereClause<'a>,
    masks: MaskSet,
    flags: WhereFlags,
    levels: Vec<WhereLevel>,
    break_label: Label,
    continue_label: Label,
    /// Table reads emitted inside the loop nest, for the covering rewrite.
    reads: Vec<ColumnRead>,
    order_requested: bool,
    order_satisfied: bool,
    distinct_requested: bool,
    distinct: DistinctMode,
    one_pass: bool,
    untested_terms: bool,
    saved_query_loop: f64,
}

impl<'a> WhereInfo<'a> {
    /// Whether rows come out in the requested ORDER BY order.
    pub fn is_ordered(&self) -> bool {
        self.order_satisfied
    }

    /// Whether the caller can skip its own duplicate elimination.
    pub fn is_distinct(&self) -> bool {
        self.distinct != DistinctMode::None
    }

    pub fn distinct_mode(&self) -> DistinctMode {
        self.distinct
    }

    /// Whether the single row visited per lookup may be modified in place.
    pub fn one_pass(&self) -> bool {
        self.one_pass
    }

    /// Whether some term reads a table outside this loop nest and so was
    /// never tested.
    pub fn untested_terms(&self) -> bool {
        self.untested_terms
    }

    /// Jump target that moves on to the next row.
    pub fn continue_label(&self) -> Label {
        self.continue_label
    }

    /// Jump target that leaves the whole loop nest.
    pub fn break_label(&self) -> Label {
        self.break_label
    }

    pub fn levels(&self) -> &[WhereLevel] {
        &self.levels
    }

    /// The decomposed WHERE clause.
    pub fn clause(&self) -> &WhereClause<'a> {
        &self.clause
    }

    /// Read `cursor.column` into `target` for the row the loop is on.
    ///
    /// Reads emitted this way are redirected to a covering index when the
    /// loop is closed.
    pub fn code_column(
        &mut self,
        ctx: &mut WhereContext<'_>,
        cursor: CursorId,
        column: i32,
        target: i32,
    ) {
        ExprCoder::new(ctx, &mut self.reads).column(cursor, column, target);
    }

    /// Read the rowid of `cursor` into `target`.
    pub fn code_rowid(&mut self, ctx: &mut WhereContext<'_>, cursor: CursorId, target: i32) {
        self.code_column(ctx, cursor, ROWID_COLUMN, target);
    }

    /// Evaluate `expr` into `target` for the current row.
    pub fn code_expr(
        &mut self,
        ctx: &mut WhereContext<'_>,
        expr: &Expr,
        target: i32,
    ) -> Result<i32> {
        ExprCoder::new(ctx, &mut self.reads).code(expr, target)
    }

    /// EXPLAIN QUERY PLAN description of the loop nest.
    pub fn plan_summary(&self) -> WherePlanSummary {
        explain::summarize(self)
    }
}

// ---------------------------------------------------------------------------
// where_begin / where_end
// ---------------------------------------------------------------------------

/// Plan `where_expr` over `src` and emit the loop headers.
///
/// `order_by` and `distinct` describe what the caller would like the loops
/// to deliver; [`WhereInfo::is_ordered`] and [`WhereInfo::distinct_mode`]
/// report what they actually deliver.
pub fn where_begin<'a>(
    ctx: &mut WhereContext<'_>,
    src: &'a [FromItem],
    where_expr: Option<&'a Expr>,
    order_by: Option<&[OrderingTerm]>,
    distinct: Option<&[Expr]>,
    flags: WhereFlags,
) -> Result<WhereInfo<'a>> {
    begin(ctx, src, where_expr, order_by, distinct, flags, None)
}

/// Close the loops opened by [`where_begin`].
pub fn where_end(ctx: &mut WhereContext<'_>, info: WhereInfo<'_>) -> Result<()> {
    info.end(ctx)
}

/// Plan and open a loop nest. `cov_cursor` is the cursor an OR branch must
/// open its index on, so that all branches share one.
#[allow(clippy::too_many_lines)]
pub(crate) fn begin<'a>(
    ctx: &mut WhereContext<'_>,
    src: &'a [FromItem],
    where_expr: Option<&'a Expr>,
    order_by: Option<&[OrderingTerm]>,
    distinct: Option<&[Expr]>,
    flags: WhereFlags,
    cov_cursor: Option<CursorId>,
) -> Result<WhereInfo<'a>> {
    // Orderings wider than a bitmask are left to the caller's sorter.
    let order_by = order_by.filter(|ob| ob.len() < 64);
    if src.len() > MAX_TABLES {
        return Err(PlanError::TooManyTables { limit: MAX_TABLES });
    }
    let n_tables = if flags.contains(WhereFlags::ONETABLE_ONLY) {
        src.len().min(1)
    } else {
        src.len()
    };

    let max_cursor = src.iter().map(|item| item.cursor).max().unwrap_or(-1);
    ctx.builder.reserve_cursors(max_cursor + 1);
    let break_label = ctx.builder.emit_label();
    let saved_query_loop = ctx.query_loop;

    let mut masks = MaskSet::new();
    for item in src {
        masks.create_bit(item.cursor)?;
    }

    // A WHERE clause that reads no table is tested once, up front.
    let mut reads = Vec::new();
    let mut clause = WhereClause::new(BinaryOp::And);
    match where_expr {
        Some(expr) if src.is_empty() || expr.is_constant() => {
            ExprCoder::new(ctx, &mut reads).if_false(expr, break_label, true)?;
        }
        Some(expr) => split_expr(&mut clause, Cow::Borrowed(expr), BinaryOp::And, None),
        None => {}
    }
    if !flags.contains(WhereFlags::ONETABLE_ONLY) {
        for item in src {
            if let Some(on) = &item.on_clause {
                split_expr(&mut clause, Cow::Borrowed(on), BinaryOp::And, Some(item.cursor));
            }
        }
    }
    let virtual_tables = src
        .iter()
        .filter(|item| item.table.is_virtual())
        .fold(0, |m, item| m | masks.bit_for(item.cursor));
    analyze_all(
        &mut clause,
        &AnalyzeContext {
            masks: &masks,
            virtual_tables,
            config: &ctx.config,
        },
    );
    if ctx.events.enabled() {
        for (index, term) in clause.terms().iter().enumerate() {
            ctx.events.emit(|| PlanEvent::TermAnalyzed {
                index,
                expr: term.expr.to_string(),
                operator: term.op.bits(),
                prereq_right: term.prereq_right,
                prereq_all: term.prereq_all,
                synthetic: term.has(TermFlags::VIRTUAL),
            });
        }
    }
    debug!(
        target: "whereplan.planner",
        tables = src.len(),
        terms = clause.len(),
        "where.analyzed"
    );

    let mut distinct_mode = DistinctMode::None;
    let distinct_requested = distinct.is_some();
    let distinct = match distinct {
        Some(list) if distinct_is_redundant(src, &clause, list) => {
            distinct_mode = DistinctMode::Unique;
            None
        }
        other => other,
    };

    let join = {
        let mut model = CostModel {
            masks: &masks,
            config: &ctx.config,
            collations: ctx.collations,
            query_loop: ctx.query_loop,
            and_only: flags.contains(WhereFlags::AND_ONLY),
            events: &mut ctx.events,
        };
        let join = plan_join(
            &mut model,
            ctx.builder,
            &JoinRequest {
                terms: clause.terms(),
                src,
                n_tables,
                order_by,
                distinct,
                one_pass_desired: flags.contains(WhereFlags::ONEPASS_DESIRED),
                index_cursor: cov_cursor,
            },
        )?;
        ctx.query_loop = model.query_loop;
        join
    };
    if join.distinct_ordered && distinct.is_some() {
        distinct_mode = DistinctMode::Ordered;
    }

    let mut levels = Vec::with_capacity(join.levels.len());
    for planned in join.levels {
        let brk = ctx.builder.emit_label();
        let cont = ctx.builder.emit_label();
        levels.push(WhereLevel::new(
            planned.from,
            src[planned.from].cursor,
            planned.plan,
            planned.index_cursor,
            brk,
            cont,
        ));
    }

    let mut info = WhereInfo {
        src,
        clause,
        masks,
        flags,
        levels,
        break_label,
        continue_label: break_label,
        reads,
        order_requested: order_by.is_some(),
        order_satisfied: join.order_satisfied,
        distinct_requested,
        distinct: distinct_mode,
        one_pass: join.one_pass,
        untested_terms: false,
        saved_query_loop,
    };

    info.open_cursors(ctx)?;
    let mut not_ready = ALL_TABLES;
    for i in 0..info.levels.len() {
        not_ready = info.code_level(ctx, i, not_ready)?;
        info.continue_label = info.levels[i].cont;
    }
    info.untested_terms = info.clause.untested().next().is_some();

    debug!(
        target: "whereplan.planner",
        levels = info.levels.len(),
        ordered = info.order_satisfied,
        one_pass = info.one_pass,
        untested = info.untested_terms,
        "where.begin"
    );
    Ok(info)
}

/// Whether a single-table DISTINCT can never see duplicates.
///
/// True when the list contains the rowid, or when every column of some
/// UNIQUE index is either fixed by an equality term or appears in the list
/// with the index's collation and is declared NOT NULL.
fn distinct_is_redundant(src: &[FromItem], clause: &WhereClause<'_>, list: &[Expr]) -> bool {
    let [item] = src else {
        return false;
    };
    let base = item.cursor;
    let table = &item.table;
    if list
        .iter()
        .any(|e| matches!(e, Expr::Column(c) if c.cursor == base && c.is_rowid()))
    {
        return true;
    }
    table.indexes.iter().filter(|idx| idx.unique).any(|idx| {
        idx.columns.iter().enumerate().all(|(i, ic)| {
            let fixed = find_term_in(
                clause.terms(),
                base,
                ic.column,
                ALL_TABLES,
                OperatorMask::EQ,
                Some((&**idx, table.column_affinity(ic.column))),
            )
            .is_some();
            fixed
                || (cost::find_index_col(list, base, idx, i).is_some()
                    && usize::try_from(ic.column)
                        .ok()
                        .and_then(|c| table.columns.get(c))
                        .is_some_and(|c| c.not_null))
        })
    })
}
