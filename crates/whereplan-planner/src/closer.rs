//! Loop trailers.
//!
//! Levels are closed innermost first: the continue label, the step
//! instruction, the IN-operator loops, the break label and, for a LEFT JOIN,
//! the pass that feeds a NULL row to the inner loops when nothing matched.
//! Cursors are closed afterwards, and every column read that a covering
//! index can answer is redirected to the index cursor.

use tracing::debug;
use whereplan_ast::TableKind;
use whereplan_error::Result;
use whereplan_types::ROWID_COLUMN;
use whereplan_types::opcode::{Opcode, P4};

use crate::cost::PlanFlags;
use crate::{WhereContext, WhereFlags, WhereInfo};

fn to_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

impl WhereInfo<'_> {
    /// Emit the end of the loop nest opened by [`crate::where_begin`].
    pub fn end(self, ctx: &mut WhereContext<'_>) -> Result<()> {
        let b = &mut *ctx.builder;
        for level in self.levels.iter().rev() {
            b.resolve_label(level.cont);
            if let Some(step) = &level.step {
                b.emit3(step.opcode, step.p1, step.p2, 0);
            }
            if !level.in_loops.is_empty() {
                b.resolve_label(level.nxt);
                for in_loop in level.in_loops.iter().rev() {
                    b.jump_here(in_loop.top_addr + 1);
                    b.emit3(Opcode::Next, in_loop.cursor, to_i32(in_loop.top_addr), 0);
                    b.jump_here(in_loop.top_addr - 1);
                }
            }
            b.resolve_label(level.brk);

            // No row matched on the right: run the inner loops once more
            // against a NULL row.
            if let Some(flag) = level.left_join_flag {
                let skip = b.emit3(Opcode::If, flag, 0, 0);
                if !level.plan.flags.contains(PlanFlags::IDX_ONLY) {
                    b.emit3(Opcode::NullRow, level.table_cursor, 0, 0);
                }
                if let Some(cursor) = level.index_cursor {
                    b.emit3(Opcode::NullRow, cursor, 0, 0);
                }
                let first = to_i32(level.first_addr);
                match &level.step {
                    Some(step) if step.opcode == Opcode::Return => {
                        b.emit3(Opcode::Gosub, step.p1, first, 0);
                    }
                    _ => {
                        b.emit3(Opcode::Goto, 0, first, 0);
                    }
                }
                b.jump_here(skip);
            }
        }
        b.resolve_label(self.break_label);

        let mut rewritten = 0;
        for level in &self.levels {
            let item = &self.src[level.from];
            let flags = level.plan.flags;
            if !self.flags.contains(WhereFlags::OMIT_OPEN_CLOSE)
                && !matches!(item.table.kind, TableKind::View)
            {
                if !self.one_pass && !flags.contains(PlanFlags::IDX_ONLY) {
                    b.emit3(Opcode::Close, level.table_cursor, 0, 0);
                }
                if flags.intersects(PlanFlags::INDEXED) && !flags.contains(PlanFlags::TEMP_INDEX) {
                    if let Some(cursor) = level.index_cursor {
                        b.emit3(Opcode::Close, cursor, 0, 0);
                    }
                }
            }

            // Reads of the table become reads of the covering index
            // positioned on the same row.
            if !flags.contains(PlanFlags::IDX_ONLY) && level.covering.is_none() {
                continue;
            }
            let (Some(index), Some(idx_cursor)) = (level.scan_index(), level.index_cursor) else {
                continue;
            };
            for read in self.reads.iter().filter(|r| r.cursor == level.table_cursor) {
                let Some(op) = b.op_at_mut(read.addr) else {
                    continue;
                };
                if read.column == ROWID_COLUMN {
                    op.opcode = Opcode::IdxRowid;
                    op.p1 = idx_cursor;
                    rewritten += 1;
                } else if let Some(pos) = index.position_of(read.column) {
                    op.p1 = idx_cursor;
                    op.p2 = to_i32(pos);
                    op.p4 = P4::None;
                    rewritten += 1;
                }
            }
        }

        ctx.query_loop = self.saved_query_loop;
        debug!(
            target: "whereplan.closer",
            levels = self.levels.len(),
            rewritten,
            "where.end"
        );
        Ok(())
    }
}
