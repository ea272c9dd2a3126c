//! Loop headers.
//!
//! Each level gets one of six headers, chosen by its plan flags:
//!
//! | plan          | header                                             |
//! |---------------|----------------------------------------------------|
//! | VIRTUALTABLE  | `VFilter` with constraint arguments, `VNext` step   |
//! | ROWID_EQ      | `MustBeInt` + `NotExists`, no step                 |
//! | ROWID_RANGE   | `Seek*`/`Rewind`, rowid bound test, `Next`/`Prev`  |
//! | INDEXED       | index seek, `IdxGe`/`IdxLt` bound, deferred `Seek` |
//! | MULTI_OR      | one sub-scan per branch feeding a `Gosub` body     |
//! | full scan     | `Rewind`/`Last`, `Next`/`Prev`                     |
//!
//! After the header every term that only reads positioned tables becomes a
//! residual test jumping to the level's continue label.

use std::sync::Arc;

use tracing::debug;
use whereplan_ast::{
    BinaryOp, Expr, FromItem, IndexColumn, IndexDescriptor, JoinType, TableDescriptor, TableKind,
    comparison_collation,
};
use whereplan_error::{PlanError, Result};
use whereplan_types::opcode::{JUMP_IF_NULL, Label, Opcode, P4};
use whereplan_types::{ROWID_COLUMN, TypeAffinity};

use crate::bitmask::{ALL_TABLES, Bitmask};
use crate::cost::{PlanFlags, PlanKind, term_can_drive_index};
use crate::exprcode::{ExprCoder, needs_no_affinity_change};
use crate::term::{Operand, OperatorMask, TermFlags, compare_affinity, operands};
use crate::trace::PlanEvent;
use crate::{InLoop, LoopStep, WhereContext, WhereFlags, WhereInfo, begin, explain};

/// Bit standing for every column numbered 63 and above.
const HIGH_COLUMNS: u64 = 1 << 63;

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn column_bit(column: i32) -> u64 {
    1 << u32::try_from(column).unwrap_or(0).min(63)
}

/// Affinity of each key column followed by INTEGER for the rowid.
fn index_affinities(index: &IndexDescriptor, table: &TableDescriptor) -> Vec<TypeAffinity> {
    index
        .columns
        .iter()
        .map(|c| table.column_affinity(c.column))
        .chain(std::iter::once(TypeAffinity::Integer))
        .collect()
}

/// Drop the affinity of a key register when converting the operand would
/// not change how it compares.
fn relax_affinity(rhs: &Expr, affinity: &mut TypeAffinity) {
    if compare_affinity(rhs, Some(*affinity)) == TypeAffinity::Blob
        || needs_no_affinity_change(rhs, *affinity)
    {
        *affinity = TypeAffinity::Blob;
    }
}

/// `P3` of a table open: one past the highest column read, or 0 for all.
fn columns_needed(item: &FromItem) -> i32 {
    if item.table.columns.len() >= 64 {
        return 0;
    }
    to_i32((64 - item.columns_used.leading_zeros()) as usize)
}

fn missing_operand() -> PlanError {
    PlanError::internal("constraint term has no right-hand operand")
}

impl WhereInfo<'_> {
    // -----------------------------------------------------------------------
    // Cursor opening
    // -----------------------------------------------------------------------

    /// Open the table and index cursors every level reads, building
    /// automatic indexes on the way.
    pub(crate) fn open_cursors(&mut self, ctx: &mut WhereContext<'_>) -> Result<()> {
        let src = self.src;
        let mut not_ready = ALL_TABLES;
        for i in 0..self.levels.len() {
            let level = &self.levels[i];
            let item = &src[level.from];
            let table = &item.table;
            let flags = level.plan.flags;
            match &table.kind {
                TableKind::View => {}
                TableKind::Virtual(_) => {
                    ctx.builder.emit_op(
                        Opcode::VOpen,
                        item.cursor,
                        0,
                        0,
                        P4::Table(table.name.clone()),
                        0,
                    );
                }
                TableKind::Ordinary => {
                    if !flags.contains(PlanFlags::IDX_ONLY)
                        && !self.flags.contains(WhereFlags::OMIT_OPEN_CLOSE)
                    {
                        let (opcode, width) = if self.one_pass {
                            (Opcode::OpenWrite, 0)
                        } else {
                            (Opcode::OpenRead, columns_needed(item))
                        };
                        ctx.builder.emit_op(
                            opcode,
                            item.cursor,
                            table.root_page,
                            width,
                            P4::Table(table.name.clone()),
                            0,
                        );
                    }
                }
            }
            if flags.contains(PlanFlags::TEMP_INDEX) {
                self.build_automatic_index(ctx, i, not_ready)?;
            } else if flags.intersects(PlanFlags::INDEXED) {
                if let (Some(index), Some(cursor)) = (level.plan.index(), level.index_cursor) {
                    ctx.builder.emit_op(
                        Opcode::OpenRead,
                        cursor,
                        index.root_page,
                        0,
                        P4::Index(index.name.clone()),
                        0,
                    );
                }
            }
            not_ready &= !self.masks.bit_for(item.cursor);
        }
        Ok(())
    }

    /// Emit code that fills a transient covering index for level `i` on the
    /// first pass only, and switch the level's plan over to it.
    fn build_automatic_index(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        not_ready: Bitmask,
    ) -> Result<()> {
        let src = self.src;
        let item = &src[self.levels[i].from];
        let table = &item.table;
        let Some(idx_cursor) = self.levels[i].index_cursor else {
            return Err(PlanError::internal(format!(
                "automatic index on {} has no cursor",
                table.name
            )));
        };

        let mut key_mask = 0;
        let mut columns = Vec::new();
        for term in self.clause.terms() {
            if !term_can_drive_index(term, item, not_ready) {
                continue;
            }
            let Some((_, column)) = term.left_column() else {
                continue;
            };
            let bit = column_bit(column);
            if key_mask & bit != 0 {
                continue;
            }
            key_mask |= bit;
            let collation = match operands(&term.expr) {
                (left, Operand::Expr(right)) => comparison_collation(left, right),
                _ => None,
            };
            columns.push(IndexColumn {
                column,
                collation: collation.map(str::to_owned),
                descending: false,
            });
        }
        let n_key = columns.len();

        // Every other column the statement reads rides along, so the table
        // is never consulted through this index.
        let extra = item.columns_used & (!key_mask | HIGH_COLUMNS);
        let n_table = table.columns.len();
        let plain = (0..n_table.min(63)).filter(|c| extra & (1 << c) != 0);
        let high = if item.columns_used & HIGH_COLUMNS == 0 {
            63..63
        } else {
            63..n_table.max(63)
        };
        columns.extend(plain.chain(high).map(|c| IndexColumn {
            column: to_i32(c),
            collation: None,
            descending: false,
        }));

        let mut index = IndexDescriptor::new("auto-index", &table.name, columns, false);
        index.set_default_row_estimates(table.row_estimate);
        let affinities: String = index_affinities(&index, table)
            .iter()
            .map(|a| a.code())
            .collect();
        let n = index.columns.len();

        let b = &mut *ctx.builder;
        let once = b.emit3(Opcode::Once, 0, 0, 0);
        b.emit_op(
            Opcode::OpenAutoindex,
            idx_cursor,
            to_i32(n + 1),
            0,
            P4::Index(index.name.clone()),
            0,
        );
        let top = b.emit3(Opcode::Rewind, item.cursor, 0, 0);
        let base = b.alloc_regs(to_i32(n + 1));
        for (j, col) in index.columns.iter().enumerate() {
            b.emit3(Opcode::Column, item.cursor, col.column, base + to_i32(j));
        }
        b.emit3(Opcode::Rowid, item.cursor, base + to_i32(n), 0);
        let record = b.alloc_reg();
        b.emit_op(
            Opcode::MakeRecord,
            base,
            to_i32(n + 1),
            record,
            P4::Affinity(affinities),
            0,
        );
        b.emit3(Opcode::IdxInsert, idx_cursor, record, 0);
        b.emit3(Opcode::Next, item.cursor, to_i32(top + 1), 0);
        b.jump_here(top);
        b.jump_here(once);

        debug!(
            target: "whereplan.codegen",
            table = %table.name,
            key_columns = n_key,
            columns = n,
            "codegen.auto_index"
        );
        let level = &mut self.levels[i];
        level.plan.n_eq = n_key;
        level.plan.flags |= PlanFlags::COLUMN_EQ | PlanFlags::IDX_ONLY;
        level.plan.eq_ops = OperatorMask::EQ;
        level.auto_index = Some(Arc::new(index));
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Loop headers
    // -----------------------------------------------------------------------

    /// Emit the header of level `i` and the residual tests that become
    /// decidable inside it. Returns the tables still not positioned.
    pub(crate) fn code_level(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        not_ready: Bitmask,
    ) -> Result<Bitmask> {
        let src = self.src;
        let from = self.levels[i].from;
        let item = &src[from];
        let flags = self.levels[i].plan.flags;
        let first_addr = ctx.builder.current_addr();

        if from > 0 && item.join_type == JoinType::Left {
            let reg = ctx.builder.alloc_reg();
            ctx.builder.emit3(Opcode::Integer, 0, reg, 0);
            self.levels[i].left_join_flag = Some(reg);
        }

        if flags.contains(PlanFlags::VIRTUALTABLE) {
            self.code_virtual_scan(ctx, i)?;
        } else if flags.contains(PlanFlags::ROWID_EQ) {
            self.code_rowid_lookup(ctx, i, not_ready)?;
        } else if flags.contains(PlanFlags::ROWID_RANGE) {
            self.code_rowid_range(ctx, i, not_ready)?;
        } else if flags.intersects(PlanFlags::COLUMN_RANGE | PlanFlags::COLUMN_EQ) {
            self.code_index_scan(ctx, i, not_ready)?;
        } else if flags.contains(PlanFlags::MULTI_OR) {
            self.code_or_union(ctx, i)?;
        } else {
            self.code_full_scan(ctx, i);
        }

        let not_ready = not_ready & !self.masks.bit_for(item.cursor);
        let cont = self.levels[i].cont;
        let left_join_flag = self.levels[i].left_join_flag;
        self.code_residual_terms(ctx, not_ready, cont, left_join_flag.is_some())?;

        // Past this point the right table matched; WHERE terms held back so
        // they also see the NULL row are tested now.
        if let Some(reg) = left_join_flag {
            self.levels[i].first_addr = ctx.builder.current_addr();
            ctx.builder.emit3(Opcode::Integer, 1, reg, 0);
            self.code_residual_terms(ctx, not_ready, cont, false)?;
        }

        let last_addr = ctx.builder.current_addr();
        debug!(
            target: "whereplan.codegen",
            level = i,
            table = %item.table.name,
            plan = %self.levels[i].plan,
            first_addr,
            last_addr,
            "codegen.level"
        );
        ctx.events.emit(|| PlanEvent::LevelCoded {
            level: i,
            first_addr,
            last_addr,
        });
        Ok(not_ready)
    }

    /// Test every term not yet coded whose tables are all positioned. With
    /// `only_from_join` set, WHERE terms wait for the LEFT JOIN match.
    fn code_residual_terms(
        &mut self,
        ctx: &mut WhereContext<'_>,
        not_ready: Bitmask,
        dest: Label,
        only_from_join: bool,
    ) -> Result<()> {
        for t in 0..self.clause.len() {
            let term = self.clause.term(t);
            if term.has(TermFlags::VIRTUAL)
                || term.has(TermFlags::CODED)
                || term.prereq_all & not_ready != 0
                || (only_from_join && !term.is_from_join())
            {
                continue;
            }
            ExprCoder::new(ctx, &mut self.reads).if_false(&term.expr, dest, true)?;
            term.set(TermFlags::CODED);
        }
        Ok(())
    }

    fn code_virtual_scan(&mut self, ctx: &mut WhereContext<'_>, i: usize) -> Result<()> {
        let level = &self.levels[i];
        let PlanKind::Virtual(vplan) = &level.plan.kind else {
            return Err(PlanError::internal("virtual scan without a virtual plan"));
        };
        let cursor = level.table_cursor;
        let brk = level.brk;
        let left_join = level.left_join_flag.is_some();
        let info = &vplan.info;
        let n = info.constraints.len();
        let reg = ctx.builder.alloc_regs(to_i32(n + 2));

        // Arguments go out in argv order and stop at the first gap.
        let mut argc = 0;
        {
            let mut coder = ExprCoder::new(ctx, &mut self.reads);
            for j in 1..=n {
                let Some(k) = info
                    .constraint_usage
                    .iter()
                    .position(|u| usize::try_from(u.argv_index) == Ok(j))
                else {
                    break;
                };
                let term = self.clause.term(vplan.term_offsets[k]);
                let rhs = term.right_operand().ok_or_else(missing_operand)?;
                coder.code(rhs, reg + 1 + to_i32(j))?;
                argc = j;
            }
        }

        let b = &mut *ctx.builder;
        b.emit3(Opcode::Integer, info.idx_num, reg, 0);
        b.emit3(Opcode::Integer, to_i32(argc), reg + 1, 0);
        b.emit_jump_to_label(
            Opcode::VFilter,
            cursor,
            reg,
            brk,
            P4::VtabPlan(info.idx_str.clone().unwrap_or_default()),
            0,
        );
        for (usage, &t) in info.constraint_usage.iter().zip(&vplan.term_offsets) {
            if usage.omit {
                self.clause.disable_term(t, left_join);
            }
        }
        let top = to_i32(b.current_addr());
        self.levels[i].step = Some(LoopStep {
            opcode: Opcode::VNext,
            p1: cursor,
            p2: top,
        });
        Ok(())
    }

    fn code_rowid_lookup(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        not_ready: Bitmask,
    ) -> Result<()> {
        let cursor = self.levels[i].table_cursor;
        let t = self
            .clause
            .find_term(
                cursor,
                ROWID_COLUMN,
                not_ready,
                OperatorMask::EQ | OperatorMask::IN,
                None,
            )
            .ok_or_else(|| PlanError::internal("rowid lookup without a rowid term"))?;
        let target = ctx.builder.alloc_reg();
        let reg = self.code_equality_term(ctx, i, t, target)?;
        let nxt = self.levels[i].nxt;
        ctx.builder
            .emit_jump_to_label(Opcode::MustBeInt, reg, 0, nxt, P4::None, 0);
        ctx.builder
            .emit_jump_to_label(Opcode::NotExists, cursor, reg, nxt, P4::None, 0);
        Ok(())
    }

    fn code_rowid_range(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        not_ready: Bitmask,
    ) -> Result<()> {
        let level = &self.levels[i];
        let cursor = level.table_cursor;
        let brk = level.brk;
        let rev = level.plan.flags.contains(PlanFlags::REVERSE);
        let left_join = level.left_join_flag.is_some();
        let lower = OperatorMask::GT | OperatorMask::GE;
        let upper = OperatorMask::LT | OperatorMask::LE;
        let mut start = self
            .clause
            .find_term(cursor, ROWID_COLUMN, not_ready, lower, None);
        let mut end = self
            .clause
            .find_term(cursor, ROWID_COLUMN, not_ready, upper, None);
        if rev {
            std::mem::swap(&mut start, &mut end);
        }

        if let Some(t) = start {
            let term = self.clause.term(t);
            let rhs = term.right_operand().ok_or_else(missing_operand)?;
            let seek = match term.op {
                OperatorMask::GT => Opcode::SeekGt,
                OperatorMask::LE => Opcode::SeekLe,
                OperatorMask::LT => Opcode::SeekLt,
                _ => Opcode::SeekGe,
            };
            let mut coder = ExprCoder::new(ctx, &mut self.reads);
            let r = coder.code_temp(rhs)?;
            coder
                .builder()
                .emit_jump_to_label(seek, cursor, r, brk, P4::None, 0);
            self.clause.disable_term(t, left_join);
        } else {
            let first = if rev { Opcode::Last } else { Opcode::Rewind };
            ctx.builder
                .emit_jump_to_label(first, cursor, 0, brk, P4::None, 0);
        }

        let mut bound_test = None;
        if let Some(t) = end {
            let term = self.clause.term(t);
            let rhs = term.right_operand().ok_or_else(missing_operand)?;
            let reg = ctx.builder.alloc_reg();
            ExprCoder::new(ctx, &mut self.reads).code(rhs, reg)?;
            let strict = term.op.intersects(OperatorMask::LT | OperatorMask::GT);
            let test = match (strict, rev) {
                (true, false) => Opcode::Ge,
                (true, true) => Opcode::Le,
                (false, false) => Opcode::Gt,
                (false, true) => Opcode::Lt,
            };
            bound_test = Some((test, reg));
            self.clause.disable_term(t, left_join);
        }

        let top = to_i32(ctx.builder.current_addr());
        self.levels[i].step = Some(LoopStep {
            opcode: if rev { Opcode::Prev } else { Opcode::Next },
            p1: cursor,
            p2: top,
        });
        if let Some((test, end_reg)) = bound_test {
            let rowid = ctx.builder.alloc_reg();
            ExprCoder::new(ctx, &mut self.reads).column(cursor, ROWID_COLUMN, rowid);
            ctx.builder.emit_jump_to_label(
                test,
                end_reg,
                rowid,
                brk,
                P4::None,
                u16::from(TypeAffinity::Numeric as u8) | JUMP_IF_NULL,
            );
        }
        Ok(())
    }

    #[allow(clippy::too_many_lines)]
    fn code_index_scan(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        not_ready: Bitmask,
    ) -> Result<()> {
        let src = self.src;
        let level = &self.levels[i];
        let Some(index) = level.scan_index().cloned() else {
            return Err(PlanError::internal("index scan without an index"));
        };
        let Some(idx_cursor) = level.index_cursor else {
            return Err(PlanError::internal(format!(
                "index {} has no cursor",
                index.name
            )));
        };
        let table = &src[level.from].table;
        let cursor = level.table_cursor;
        let flags = level.plan.flags;
        let n_eq = level.plan.n_eq;
        let cont = level.cont;
        let left_join = level.left_join_flag.is_some();
        let rev = flags.contains(PlanFlags::REVERSE);
        let omit_table =
            flags.contains(PlanFlags::IDX_ONLY) && !self.flags.contains(WhereFlags::FORCE_TABLE);
        let n_columns = index.columns.len();
        let range_column = index.columns.get(n_eq).map_or(ROWID_COLUMN, |c| c.column);
        let key = Some((&*index, table.column_affinity(range_column)));

        // A min() query stepping to the first row must skip NULL keys.
        let is_min_query = self.flags.contains(WhereFlags::ORDERBY_MIN)
            && flags.contains(PlanFlags::ORDERBY)
            && n_columns > n_eq;
        let mut extra_regs = usize::from(is_min_query);
        let mut range_end = None;
        let mut range_start = None;
        if flags.contains(PlanFlags::TOP_LIMIT) {
            range_end = self.clause.find_term(
                cursor,
                range_column,
                not_ready,
                OperatorMask::LT | OperatorMask::LE,
                key,
            );
            extra_regs = 1;
        }
        if flags.contains(PlanFlags::BTM_LIMIT) {
            range_start = self.clause.find_term(
                cursor,
                range_column,
                not_ready,
                OperatorMask::GT | OperatorMask::GE,
                key,
            );
            extra_regs = 1;
        }

        let (base, mut start_aff) =
            self.code_all_equality_terms(ctx, i, &index, not_ready, extra_regs)?;
        let mut end_aff = start_aff.clone();
        let nxt = self.levels[i].nxt;

        // Walking against the key order turns the upper bound into the
        // starting point.
        let key_ascending = index.columns.get(n_eq).map(|c| !c.descending);
        if key_ascending.is_some_and(|asc| asc == rev) || (rev && n_eq == n_columns) {
            std::mem::swap(&mut range_start, &mut range_end);
        }

        let inclusive = |t: Option<usize>| {
            t.is_none_or(|t| {
                self.clause
                    .term(t)
                    .op
                    .intersects(OperatorMask::LE | OperatorMask::GE)
            })
        };
        let mut start_eq = inclusive(range_start);
        let end_eq = inclusive(range_end);
        let mut start_constraints = range_start.is_some() || n_eq > 0;
        let key_reg = base + to_i32(n_eq);

        let mut n_constraint = n_eq;
        if let Some(t) = range_start {
            let term = self.clause.term(t);
            let rhs = term.right_operand().ok_or_else(missing_operand)?;
            let mut coder = ExprCoder::new(ctx, &mut self.reads);
            coder.code(rhs, key_reg)?;
            if !term.has(TermFlags::VNULL) {
                coder.is_null_jump(rhs, key_reg, nxt);
            }
            if let Some(a) = start_aff.get_mut(n_eq) {
                relax_affinity(rhs, a);
            }
            n_constraint += 1;
        } else if is_min_query {
            ctx.builder.emit3(Opcode::Null, 0, key_reg, 0);
            n_constraint += 1;
            start_eq = false;
            start_constraints = true;
        }
        ExprCoder::new(ctx, &mut self.reads).apply_affinity(base, &start_aff[..n_constraint]);
        let seek = match (start_constraints, start_eq, rev) {
            (false, _, false) => Opcode::Rewind,
            (false, _, true) => Opcode::Last,
            (true, false, false) => Opcode::SeekGt,
            (true, false, true) => Opcode::SeekLt,
            (true, true, false) => Opcode::SeekGe,
            (true, true, true) => Opcode::SeekLe,
        };
        ctx.builder.emit_jump_to_label(
            seek,
            idx_cursor,
            base,
            nxt,
            P4::Int(to_i32(n_constraint)),
            0,
        );

        let mut n_constraint = n_eq;
        if let Some(t) = range_end {
            let term = self.clause.term(t);
            let rhs = term.right_operand().ok_or_else(missing_operand)?;
            let mut coder = ExprCoder::new(ctx, &mut self.reads);
            coder.code(rhs, key_reg)?;
            if !term.has(TermFlags::VNULL) {
                coder.is_null_jump(rhs, key_reg, nxt);
            }
            if let Some(a) = end_aff.get_mut(n_eq) {
                relax_affinity(rhs, a);
            }
            coder.apply_affinity(base, &end_aff[..=n_eq]);
            n_constraint += 1;
        }

        let top = to_i32(ctx.builder.current_addr());
        if range_end.is_some() || n_eq > 0 {
            let past_end = if rev { Opcode::IdxLt } else { Opcode::IdxGe };
            ctx.builder.emit_jump_to_label(
                past_end,
                idx_cursor,
                base,
                nxt,
                P4::Int(to_i32(n_constraint)),
                u16::from(end_eq != rev),
            );
        }

        // A range never matches a NULL key.
        if flags.intersects(PlanFlags::BOTH_LIMIT) {
            let r = ctx.builder.alloc_reg();
            ctx.builder
                .emit3(Opcode::Column, idx_cursor, to_i32(n_eq), r);
            ctx.builder
                .emit_jump_to_label(Opcode::IsNull, r, 0, cont, P4::None, 0);
        }

        for t in [range_start, range_end].into_iter().flatten() {
            self.clause.disable_term(t, left_join);
        }
        if !omit_table {
            let rowid = ctx.builder.alloc_reg();
            ctx.builder.emit3(Opcode::IdxRowid, idx_cursor, rowid, 0);
            ctx.builder.emit3(Opcode::Seek, cursor, rowid, 0);
        }

        self.levels[i].step = (!flags.contains(PlanFlags::UNIQUE)).then_some(LoopStep {
            opcode: if rev { Opcode::Prev } else { Opcode::Next },
            p1: idx_cursor,
            p2: top,
        });
        Ok(())
    }

    /// Evaluate the `n_eq` equality constraints of level `i` into
    /// consecutive registers, leaving `extra` more for range bounds.
    ///
    /// Returns the first register and the affinities to apply to the key.
    fn code_all_equality_terms(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        index: &IndexDescriptor,
        not_ready: Bitmask,
        extra: usize,
    ) -> Result<(i32, Vec<TypeAffinity>)> {
        let src = self.src;
        let level = &self.levels[i];
        let table = &src[level.from].table;
        let cursor = level.table_cursor;
        let n_eq = level.plan.n_eq;
        let eq_ops = level.plan.eq_ops;
        let brk = level.brk;

        let base = ctx.builder.alloc_regs(to_i32(n_eq + extra));
        let mut affinities = index_affinities(index, table);
        for j in 0..n_eq {
            let column = index.columns[j].column;
            let key = Some((index, table.column_affinity(column)));
            let Some(t) = self
                .clause
                .find_term(cursor, column, not_ready, eq_ops, key)
            else {
                break;
            };
            let target = base + to_i32(j);
            self.code_equality_term(ctx, i, t, target)?;
            let term = self.clause.term(t);
            if term.op.intersects(OperatorMask::ISNULL | OperatorMask::IN) {
                continue;
            }
            if let Some(rhs) = term.right_operand() {
                ExprCoder::new(ctx, &mut self.reads).is_null_jump(rhs, target, brk);
                relax_affinity(rhs, &mut affinities[j]);
            }
        }
        Ok((base, affinities))
    }

    /// Load the value an `==`, `IS NULL` or `IN` term fixes into `target`.
    ///
    /// An IN term opens a loop over its values; the first one on a level
    /// gives the level a fresh "next" label so the closer can step the IN
    /// cursors before giving up on the level.
    fn code_equality_term(
        &mut self,
        ctx: &mut WhereContext<'_>,
        i: usize,
        t: usize,
        target: i32,
    ) -> Result<i32> {
        let left_join = self.levels[i].left_join_flag.is_some();
        let term = self.clause.term(t);
        if term.op == OperatorMask::ISNULL {
            ctx.builder.emit3(Opcode::Null, 0, target, 0);
        } else if term.op == OperatorMask::IN {
            let in_cursor = ExprCoder::new(ctx, &mut self.reads).in_table(&term.expr)?;
            let b = &mut *ctx.builder;
            b.emit3(Opcode::Rewind, in_cursor, 0, 0);
            let level = &mut self.levels[i];
            if level.in_loops.is_empty() {
                level.nxt = b.emit_label();
            }
            let top_addr = b.emit3(Opcode::Column, in_cursor, 0, target);
            b.emit3(Opcode::IsNull, target, 0, 0);
            level.in_loops.push(InLoop {
                cursor: in_cursor,
                top_addr,
            });
        } else {
            let rhs = term.right_operand().ok_or_else(missing_operand)?;
            ExprCoder::new(ctx, &mut self.reads).code(rhs, target)?;
        }
        self.clause.disable_term(t, left_join);
        Ok(target)
    }

    /// Run one single-table sub-scan per OR branch, skipping rows an earlier
    /// branch already produced, and send each row through a shared body.
    #[allow(clippy::too_many_lines)]
    fn code_or_union(&mut self, ctx: &mut WhereContext<'_>, i: usize) -> Result<()> {
        let src = self.src;
        let level = &self.levels[i];
        let PlanKind::MultiOr { term: or_term } = level.plan.kind else {
            return Err(PlanError::internal("OR union without an OR term"));
        };
        let item = &src[level.from];
        let cursor = item.cursor;
        let brk = level.brk;
        let left_join = level.left_join_flag.is_some();

        let b = &mut *ctx.builder;
        let cov_cursor = b.alloc_cursor();
        let reg_return = b.alloc_reg();
        let rowset = if self.flags.contains(WhereFlags::DUPLICATES_OK) {
            None
        } else {
            let set = b.alloc_reg();
            let rowid = b.alloc_reg();
            b.emit3(Opcode::Null, 0, set, 0);
            Some((set, rowid))
        };
        // Points past the loop once patched, so a jump into the body from a
        // LEFT JOIN null row returns to the right place.
        let ret_init = b.emit3(Opcode::Integer, 0, reg_return, 0);
        let body = b.emit_label();

        // Sub-scans see this table first, then the tables still unplaced.
        let sub_src: Vec<FromItem> = std::iter::once(item.clone())
            .chain(self.levels[i + 1..].iter().map(|l| src[l.from].clone()))
            .collect();
        let shared = if self.clause.len() > 1 {
            self.shared_conjuncts(or_term)
        } else {
            None
        };

        let or_info = self
            .clause
            .term(or_term)
            .or_info()
            .ok_or_else(|| PlanError::internal("MULTI_OR plan on a non-OR term"))?;
        let n_branches = or_info.clause.len();
        let sub_flags = WhereFlags::OMIT_OPEN_CLOSE
            | WhereFlags::AND_ONLY
            | WhereFlags::FORCE_TABLE
            | WhereFlags::ONETABLE_ONLY;
        let mut covering: Option<Arc<IndexDescriptor>> = None;
        let mut untested = false;
        let mut branch_lines = Vec::with_capacity(n_branches);

        for (ii, branch) in or_info.clause.terms().iter().enumerate() {
            if branch.left_column().map(|(c, _)| c) != Some(cursor) && branch.and_info().is_none()
            {
                continue;
            }
            let branch_expr = match &shared {
                Some(rest) => Expr::binary((*branch.expr).clone(), BinaryOp::And, rest.clone()),
                None => (*branch.expr).clone(),
            };
            let mut sub = begin(
                ctx,
                &sub_src,
                Some(&branch_expr),
                None,
                None,
                sub_flags,
                Some(cov_cursor),
            )?;
            let Some(sub_level) = sub.levels.first() else {
                return Err(PlanError::internal("OR branch planned no loop"));
            };
            branch_lines.push(explain::describe_level(
                &sub_src,
                sub_level,
                WhereFlags::empty(),
            ));
            let sub_flags_chosen = sub_level.plan.flags;
            covering = match sub_level.plan.index() {
                Some(idx)
                    if sub_flags_chosen.intersects(PlanFlags::INDEXED)
                        && !sub_flags_chosen.contains(PlanFlags::TEMP_INDEX)
                        && (ii == 0 || covering.as_ref().is_some_and(|c| Arc::ptr_eq(c, idx))) =>
                {
                    Some(Arc::clone(idx))
                }
                _ => None,
            };

            if let Some((set, rowid)) = rowset {
                sub.code_rowid(ctx, cursor, rowid);
                let here = ctx.builder.current_addr();
                let set_index = if ii + 1 == n_branches { -1 } else { to_i32(ii) };
                ctx.builder.emit_op(
                    Opcode::RowSetTest,
                    set,
                    to_i32(here + 2),
                    rowid,
                    P4::Int(set_index),
                    0,
                );
            }
            ctx.builder
                .emit_jump_to_label(Opcode::Gosub, reg_return, 0, body, P4::None, 0);
            untested |= sub.untested_terms;
            sub.end(ctx)?;
        }

        let b = &mut *ctx.builder;
        let past_loop = to_i32(b.current_addr());
        if let Some(op) = b.op_at_mut(ret_init) {
            op.p1 = past_loop;
        }
        b.emit_goto(brk);
        b.resolve_label(body);

        debug!(
            target: "whereplan.codegen",
            table = %item.table.name,
            branches = branch_lines.len(),
            covering = covering.as_ref().map(|c| c.name.as_str()),
            untested,
            "codegen.or_union"
        );
        let level = &mut self.levels[i];
        level.or_branches = branch_lines;
        if covering.is_some() {
            level.index_cursor = Some(cov_cursor);
        }
        level.covering = covering;
        level.step = Some(LoopStep {
            opcode: Opcode::Return,
            p1: reg_return,
            p2: 0,
        });
        // A branch that could not test everything leaves the OR term itself
        // as a residual test.
        if !untested {
            self.clause.disable_term(or_term, left_join);
        }
        Ok(())
    }

    /// Conjunction of the top-level terms, other than `skip`, that each OR
    /// branch scan can use as well.
    fn shared_conjuncts(&self, skip: usize) -> Option<Expr> {
        self.clause
            .terms()
            .iter()
            .enumerate()
            .filter(|&(t, term)| {
                t != skip
                    && !term.is_from_join()
                    && !term.has(TermFlags::VIRTUAL)
                    && !term.has(TermFlags::ORINFO)
                    && !term.op.is_empty()
            })
            .map(|(_, term)| (*term.expr).clone())
            .reduce(|acc, e| Expr::binary(acc, BinaryOp::And, e))
    }

    fn code_full_scan(&mut self, ctx: &mut WhereContext<'_>, i: usize) {
        let level = &mut self.levels[i];
        let rev = level.plan.flags.contains(PlanFlags::REVERSE);
        let (first, step) = if rev {
            (Opcode::Last, Opcode::Prev)
        } else {
            (Opcode::Rewind, Opcode::Next)
        };
        let addr = ctx.builder.emit_jump_to_label(
            first,
            level.table_cursor,
            0,
            level.brk,
            P4::None,
            0,
        );
        level.step = Some(LoopStep {
            opcode: step,
            p1: level.table_cursor,
            p2: to_i32(addr + 1),
        });
    }
}
