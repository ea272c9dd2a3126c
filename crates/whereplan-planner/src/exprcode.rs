//! Expression coding for residual tests and constraint operands.
//!
//! Residual WHERE terms compile into conditional jumps; the right-hand sides
//! of index constraints compile into registers. Every table column read is
//! logged so the loop closer can later point it at a covering index.

use whereplan_ast::{BinaryOp, Expr, InSet, Select, UnaryOp, comparison_collation};
use whereplan_error::{PlanError, Result};
use whereplan_types::opcode::{JUMP_IF_NULL, Label, Opcode, P4, ProgramBuilder};
use whereplan_types::{CursorId, ROWID_COLUMN, SqliteValue, TypeAffinity};

use crate::WhereContext;
use crate::term::{compare_affinity, comparison_affinity};

/// Compiles subqueries on behalf of the planner.
///
/// The planner never looks inside a `SELECT`; a host that allows subqueries
/// in WHERE clauses installs one of these on the [`WhereContext`].
pub trait SubqueryCoder {
    /// Evaluate the scalar subquery `select` into register `target`.
    fn code_scalar(&mut self, builder: &mut ProgramBuilder, select: &Select, target: i32)
    -> Result<()>;

    /// Store 1 in `target` when `select` yields a row and 0 otherwise.
    fn code_exists(&mut self, builder: &mut ProgramBuilder, select: &Select, target: i32)
    -> Result<()>;

    /// Materialize the single result column of `select` into an ephemeral
    /// index and return the cursor it is open on.
    fn code_in_table(&mut self, builder: &mut ProgramBuilder, select: &Select)
    -> Result<CursorId>;
}

/// A `Column` or `Rowid` instruction reading a table cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ColumnRead {
    pub addr: usize,
    pub cursor: CursorId,
    pub column: i32,
}

pub(crate) struct ExprCoder<'x, 'c> {
    ctx: &'x mut WhereContext<'c>,
    reads: &'x mut Vec<ColumnRead>,
}

fn comparison_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        _ => Opcode::Ge,
    }
}

/// The comparison that is true exactly when `op` is false (NULLs aside).
fn negated(op: BinaryOp) -> BinaryOp {
    match op {
        BinaryOp::Eq => BinaryOp::Ne,
        BinaryOp::Ne => BinaryOp::Eq,
        BinaryOp::Lt => BinaryOp::Ge,
        BinaryOp::Ge => BinaryOp::Lt,
        BinaryOp::Le => BinaryOp::Gt,
        BinaryOp::Gt => BinaryOp::Le,
        other => other,
    }
}

fn arithmetic_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Subtract => Opcode::Subtract,
        BinaryOp::Multiply => Opcode::Multiply,
        BinaryOp::Divide => Opcode::Divide,
        _ => Opcode::Concat,
    }
}

fn between_as_and(expr: &Expr, low: &Expr, high: &Expr) -> Expr {
    Expr::binary(
        Expr::binary(expr.clone(), BinaryOp::Ge, low.clone()),
        BinaryOp::And,
        Expr::binary(expr.clone(), BinaryOp::Le, high.clone()),
    )
}

/// Whether `expr` may evaluate to NULL.
fn can_be_null(expr: &Expr) -> bool {
    match expr {
        Expr::Literal(v) => v.is_null(),
        Expr::UnaryOp {
            op: UnaryOp::Negate,
            expr,
        } => !matches!(
            **expr,
            Expr::Literal(SqliteValue::Integer(_) | SqliteValue::Float(_))
        ),
        _ => true,
    }
}

/// Whether applying `affinity` to the value of `expr` is a no-op.
pub(crate) fn needs_no_affinity_change(expr: &Expr, affinity: TypeAffinity) -> bool {
    if affinity == TypeAffinity::Blob {
        return true;
    }
    let expr = match expr {
        Expr::UnaryOp {
            op: UnaryOp::Negate,
            expr,
        } => &**expr,
        other => other,
    };
    let numeric_int = matches!(affinity, TypeAffinity::Integer | TypeAffinity::Numeric);
    match expr {
        Expr::Literal(SqliteValue::Integer(_)) => numeric_int,
        Expr::Literal(SqliteValue::Float(_)) => {
            matches!(affinity, TypeAffinity::Real | TypeAffinity::Numeric)
        }
        Expr::Literal(SqliteValue::Text(_)) => affinity == TypeAffinity::Text,
        Expr::Literal(SqliteValue::Blob(_)) => true,
        Expr::Column(c) => c.column == ROWID_COLUMN && numeric_int,
        _ => false,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn reg_offset(n: usize) -> i32 {
    n as i32
}

impl<'x, 'c> ExprCoder<'x, 'c> {
    pub(crate) fn new(ctx: &'x mut WhereContext<'c>, reads: &'x mut Vec<ColumnRead>) -> Self {
        Self { ctx, reads }
    }

    pub(crate) fn builder(&mut self) -> &mut ProgramBuilder {
        &mut *self.ctx.builder
    }

    fn subqueries(
        &mut self,
    ) -> Result<(&mut ProgramBuilder, &mut (dyn SubqueryCoder + 'c))> {
        let ctx = &mut *self.ctx;
        match ctx.subqueries.as_deref_mut() {
            Some(coder) => Ok((&mut *ctx.builder, coder)),
            None => Err(PlanError::not_implemented(
                "subqueries in a WHERE clause without a SubqueryCoder",
            )),
        }
    }

    /// Read `cursor.column` (the rowid for [`ROWID_COLUMN`]) into `target`.
    pub(crate) fn column(&mut self, cursor: CursorId, column: i32, target: i32) {
        let addr = if column == ROWID_COLUMN {
            self.builder().emit3(Opcode::Rowid, cursor, target, 0)
        } else {
            self.builder().emit3(Opcode::Column, cursor, column, target)
        };
        self.reads.push(ColumnRead {
            addr,
            cursor,
            column,
        });
    }

    fn literal(&mut self, value: &SqliteValue, target: i32) {
        let b = self.builder();
        match value {
            SqliteValue::Null => {
                b.emit3(Opcode::Null, 0, target, target);
            }
            SqliteValue::Integer(i) => match i32::try_from(*i) {
                Ok(small) => {
                    b.emit3(Opcode::Integer, small, target, 0);
                }
                Err(_) => {
                    b.emit_op(Opcode::Int64, 0, target, 0, P4::Int64(*i), 0);
                }
            },
            SqliteValue::Float(f) => {
                b.emit_op(Opcode::Real, 0, target, 0, P4::Real(*f), 0);
            }
            SqliteValue::Text(s) => {
                b.emit_op(Opcode::String8, 0, target, 0, P4::Str(s.clone()), 0);
            }
            SqliteValue::Blob(bytes) => {
                b.emit_op(
                    Opcode::Blob,
                    reg_offset(bytes.len()),
                    target,
                    0,
                    P4::Blob(bytes.clone()),
                    0,
                );
            }
        }
    }

    /// Evaluate `expr` into a fresh register.
    pub(crate) fn code_temp(&mut self, expr: &Expr) -> Result<i32> {
        let target = self.builder().alloc_reg();
        self.code(expr, target)
    }

    /// Evaluate `expr` into `target` and return `target`.
    pub(crate) fn code(&mut self, expr: &Expr, target: i32) -> Result<i32> {
        match expr {
            Expr::Literal(value) => self.literal(value, target),
            Expr::Variable { index, .. } => {
                self.builder().emit3(Opcode::Variable, *index, target, 0);
            }
            Expr::Column(c) => self.column(c.cursor, c.column, target),
            Expr::Collate { expr, .. } => return self.code(expr, target),
            Expr::BinaryOp { left, op, right } => match op {
                BinaryOp::And | BinaryOp::Or => {
                    let l = self.code_temp(left)?;
                    let r = self.code_temp(right)?;
                    let opcode = if *op == BinaryOp::And {
                        Opcode::And
                    } else {
                        Opcode::Or
                    };
                    self.builder().emit3(opcode, l, r, target);
                }
                op if op.is_comparison() => self.comparison_value(left, *op, right, target)?,
                op => {
                    let l = self.code_temp(left)?;
                    let r = self.code_temp(right)?;
                    self.builder().emit3(arithmetic_opcode(*op), r, l, target);
                }
            },
            Expr::UnaryOp {
                op: UnaryOp::Not,
                expr,
            } => {
                let r = self.code_temp(expr)?;
                self.builder().emit3(Opcode::Not, r, target, 0);
            }
            Expr::UnaryOp {
                op: UnaryOp::Negate,
                expr,
            } => match &**expr {
                Expr::Literal(SqliteValue::Integer(i)) if i.checked_neg().is_some() => {
                    self.literal(&SqliteValue::Integer(-i), target);
                }
                Expr::Literal(SqliteValue::Float(f)) => {
                    self.literal(&SqliteValue::Float(-f), target);
                }
                inner => {
                    let zero = self.builder().alloc_reg();
                    self.builder().emit3(Opcode::Integer, 0, zero, 0);
                    let r = self.code_temp(inner)?;
                    self.builder().emit3(Opcode::Subtract, r, zero, target);
                }
            },
            Expr::Between {
                expr,
                low,
                high,
                not,
            } => {
                self.code(&between_as_and(expr, low, high), target)?;
                if *not {
                    self.builder().emit3(Opcode::Not, target, target, 0);
                }
            }
            Expr::In { not, .. } => {
                self.in_value(expr, target)?;
                if *not {
                    self.builder().emit3(Opcode::Not, target, target, 0);
                }
            }
            Expr::IsNull { expr, not } => {
                let r = self.code_temp(expr)?;
                let b = self.builder();
                let done = b.emit_label();
                b.emit3(Opcode::Integer, 1, target, 0);
                let opcode = if *not { Opcode::NotNull } else { Opcode::IsNull };
                b.emit_jump_to_label(opcode, r, 0, done, P4::None, 0);
                b.emit3(Opcode::Integer, 0, target, 0);
                b.resolve_label(done);
            }
            Expr::Like {
                expr,
                pattern,
                escape,
                op,
                not,
            } => {
                let mut args = vec![&**pattern, &**expr];
                if let Some(escape) = escape {
                    args.push(&**escape);
                }
                self.function(op.function_name(), &args, target)?;
                if *not {
                    self.builder().emit3(Opcode::Not, target, target, 0);
                }
            }
            Expr::FunctionCall { name, args } => {
                let args: Vec<&Expr> = args.iter().collect();
                self.function(name, &args, target)?;
            }
            Expr::Exists { subquery, not } => {
                let (b, coder) = self.subqueries()?;
                coder.code_exists(b, subquery, target)?;
                if *not {
                    self.builder().emit3(Opcode::Not, target, target, 0);
                }
            }
            Expr::Subquery(select) => {
                let (b, coder) = self.subqueries()?;
                coder.code_scalar(b, select, target)?;
            }
        }
        Ok(target)
    }

    fn function(&mut self, name: &str, args: &[&Expr], target: i32) -> Result<()> {
        let n = u16::try_from(args.len())
            .map_err(|_| PlanError::internal(format!("too many arguments to {name}()")))?;
        let base = self.builder().alloc_regs(i32::from(n));
        for (i, arg) in (0..).zip(args) {
            self.code(arg, base + i)?;
        }
        self.builder().emit_op(
            Opcode::Function,
            0,
            base,
            target,
            P4::FuncName(name.to_owned()),
            n,
        );
        Ok(())
    }

    /// 1, 0 or NULL for `left op right`.
    fn comparison_value(
        &mut self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        target: i32,
    ) -> Result<()> {
        let l = self.code_temp(left)?;
        let r = self.code_temp(right)?;
        let (p4, p5) = comparison_operands(left, right, false);
        let b = self.builder();
        let done = b.emit_label();
        b.emit3(Opcode::Null, 0, target, target);
        b.emit_jump_to_label(Opcode::IsNull, l, 0, done, P4::None, 0);
        b.emit_jump_to_label(Opcode::IsNull, r, 0, done, P4::None, 0);
        b.emit3(Opcode::Integer, 1, target, 0);
        b.emit_jump_to_label(comparison_opcode(op), r, l, done, p4, p5);
        b.emit3(Opcode::Integer, 0, target, 0);
        b.resolve_label(done);
        Ok(())
    }

    /// 1, 0 or NULL for `lhs IN (...)`, ignoring `NOT`.
    fn in_value(&mut self, expr: &Expr, target: i32) -> Result<()> {
        let Expr::In { expr: lhs, .. } = expr else {
            return Err(PlanError::internal("in_value on a non-IN expression"));
        };
        let r = self.code_temp(lhs)?;
        let cursor = self.in_table(expr)?;
        let affinity = comparison_affinity(expr);
        let b = self.builder();
        let done = b.emit_label();
        let record = b.alloc_reg();
        b.emit3(Opcode::Null, 0, target, target);
        b.emit_jump_to_label(Opcode::IsNull, r, 0, done, P4::None, 0);
        b.emit_op(
            Opcode::MakeRecord,
            r,
            1,
            record,
            P4::Affinity(affinity.code().to_string()),
            0,
        );
        b.emit3(Opcode::Integer, 1, target, 0);
        b.emit_jump_to_label(Opcode::Found, cursor, record, done, P4::None, 0);
        b.emit3(Opcode::Integer, 0, target, 0);
        b.resolve_label(done);
        Ok(())
    }

    /// Fill an ephemeral index with the right-hand side of the IN
    /// expression `expr` and return its cursor.
    ///
    /// A constant list is only materialized on the first pass.
    pub(crate) fn in_table(&mut self, expr: &Expr) -> Result<CursorId> {
        let Expr::In { set, .. } = expr else {
            return Err(PlanError::internal("in_table on a non-IN expression"));
        };
        let items = match set {
            InSet::Subquery(select) => {
                let (b, coder) = self.subqueries()?;
                return coder.code_in_table(b, select);
            }
            InSet::List(items) => items,
        };
        let affinity = comparison_affinity(expr);
        let b = self.builder();
        let once = items
            .iter()
            .all(Expr::is_constant)
            .then(|| b.emit3(Opcode::Once, 0, 0, 0));
        let cursor = b.alloc_cursor();
        b.emit3(Opcode::OpenEphemeral, cursor, 1, 0);
        let value = b.alloc_reg();
        let record = b.alloc_reg();
        for item in items {
            self.code(item, value)?;
            let b = self.builder();
            b.emit_op(
                Opcode::MakeRecord,
                value,
                1,
                record,
                P4::Affinity(affinity.code().to_string()),
                0,
            );
            b.emit3(Opcode::IdxInsert, cursor, record, 0);
        }
        if let Some(addr) = once {
            self.builder().jump_here(addr);
        }
        Ok(cursor)
    }

    fn compare_jump(
        &mut self,
        left: &Expr,
        op: BinaryOp,
        right: &Expr,
        dest: Label,
        jump_if_null: bool,
    ) -> Result<()> {
        let l = self.code_temp(left)?;
        let r = self.code_temp(right)?;
        let (p4, p5) = comparison_operands(left, right, jump_if_null);
        self.builder()
            .emit_jump_to_label(comparison_opcode(op), r, l, dest, p4, p5);
        Ok(())
    }

    /// Jump to `dest` when `expr` is false, and also when it is NULL if
    /// `jump_if_null` is set. Fall through otherwise.
    pub(crate) fn if_false(&mut self, expr: &Expr, dest: Label, jump_if_null: bool) -> Result<()> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => {
                self.if_false(left, dest, jump_if_null)?;
                self.if_false(right, dest, jump_if_null)
            }
            Expr::BinaryOp {
                left,
                op: BinaryOp::Or,
                right,
            } => {
                let skip = self.builder().emit_label();
                self.if_true(left, skip, !jump_if_null)?;
                self.if_false(right, dest, jump_if_null)?;
                self.builder().resolve_label(skip);
                Ok(())
            }
            Expr::UnaryOp {
                op: UnaryOp::Not,
                expr,
            } => self.if_true(expr, dest, jump_if_null),
            Expr::BinaryOp { left, op, right } if op.is_comparison() => {
                self.compare_jump(left, negated(*op), right, dest, jump_if_null)
            }
            Expr::IsNull { expr, not } => {
                let r = self.code_temp(expr)?;
                let opcode = if *not { Opcode::IsNull } else { Opcode::NotNull };
                self.builder()
                    .emit_jump_to_label(opcode, r, 0, dest, P4::None, 0);
                Ok(())
            }
            Expr::Between {
                expr,
                low,
                high,
                not: false,
            } => self.if_false(&between_as_and(expr, low, high), dest, jump_if_null),
            _ => {
                let r = self.code_temp(expr)?;
                self.builder().emit_jump_to_label(
                    Opcode::IfNot,
                    r,
                    i32::from(jump_if_null),
                    dest,
                    P4::None,
                    0,
                );
                Ok(())
            }
        }
    }

    /// Jump to `dest` when `expr` is true, and also when it is NULL if
    /// `jump_if_null` is set. Fall through otherwise.
    pub(crate) fn if_true(&mut self, expr: &Expr, dest: Label, jump_if_null: bool) -> Result<()> {
        match expr {
            Expr::BinaryOp {
                left,
                op: BinaryOp::And,
                right,
            } => {
                let skip = self.builder().emit_label();
                self.if_false(left, skip, !jump_if_null)?;
                self.if_true(right, dest, jump_if_null)?;
                self.builder().resolve_label(skip);
                Ok(())
            }
            Expr::BinaryOp {
                left,
                op: BinaryOp::Or,
                right,
            } => {
                self.if_true(left, dest, jump_if_null)?;
                self.if_true(right, dest, jump_if_null)
            }
            Expr::UnaryOp {
                op: UnaryOp::Not,
                expr,
            } => self.if_false(expr, dest, jump_if_null),
            Expr::BinaryOp { left, op, right } if op.is_comparison() => {
                self.compare_jump(left, *op, right, dest, jump_if_null)
            }
            Expr::IsNull { expr, not } => {
                let r = self.code_temp(expr)?;
                let opcode = if *not { Opcode::NotNull } else { Opcode::IsNull };
                self.builder()
                    .emit_jump_to_label(opcode, r, 0, dest, P4::None, 0);
                Ok(())
            }
            Expr::Between {
                expr,
                low,
                high,
                not: false,
            } => self.if_true(&between_as_and(expr, low, high), dest, jump_if_null),
            _ => {
                let r = self.code_temp(expr)?;
                self.builder().emit_jump_to_label(
                    Opcode::If,
                    r,
                    i32::from(jump_if_null),
                    dest,
                    P4::None,
                    0,
                );
                Ok(())
            }
        }
    }

    /// Jump to `dest` if register `reg`, holding the value of `expr`, is
    /// NULL. Nothing is emitted when `expr` cannot be NULL.
    pub(crate) fn is_null_jump(&mut self, expr: &Expr, reg: i32, dest: Label) {
        if can_be_null(expr) {
            self.builder()
                .emit_jump_to_label(Opcode::IsNull, reg, 0, dest, P4::None, 0);
        }
    }

    /// Apply `affinities` to the registers starting at `base`. Leading and
    /// trailing no-op entries are dropped; nothing is emitted if all are.
    pub(crate) fn apply_affinity(&mut self, base: i32, affinities: &[TypeAffinity]) {
        let Some(start) = affinities.iter().position(|a| *a != TypeAffinity::Blob) else {
            return;
        };
        let end = affinities
            .iter()
            .rposition(|a| *a != TypeAffinity::Blob)
            .unwrap_or(start);
        let span = &affinities[start..=end];
        let codes: String = span.iter().map(|a| a.code()).collect();
        self.builder().emit_op(
            Opcode::Affinity,
            base + reg_offset(start),
            reg_offset(span.len()),
            0,
            P4::Affinity(codes),
            0,
        );
    }
}

/// P4 (collation) and P5 (affinity and NULL handling) of a comparison.
fn comparison_operands(left: &Expr, right: &Expr, jump_if_null: bool) -> (P4, u16) {
    let affinity = compare_affinity(right, left.affinity());
    let p4 = comparison_collation(left, right).map_or(P4::None, |c| P4::Collation(c.to_owned()));
    let mut p5 = u16::from(affinity as u8);
    if jump_if_null {
        p5 |= JUMP_IF_NULL;
    }
    (p4, p5)
}

#[cfg(test)]
mod tests {
    use whereplan_types::CollationRegistry;

    use super::*;

    fn col(c: i32) -> Expr {
        Expr::column(0, c, TypeAffinity::Integer)
    }

    #[test]
    fn test_residual_comparison_jumps_on_negation() {
        let mut builder = ProgramBuilder::new();
        let collations = CollationRegistry::with_builtins();
        let mut ctx = WhereContext::new(&mut builder, &collations);
        let mut reads = Vec::new();
        let mut coder = ExprCoder::new(&mut ctx, &mut reads);
        let dest = coder.builder().emit_label();
        let expr = Expr::binary(col(1), BinaryOp::Lt, Expr::integer(5));
        coder.if_false(&expr, dest, true).unwrap();
        coder.builder().resolve_label(dest);
        let ops = builder.ops();
        assert_eq!(ops[0].opcode, Opcode::Column);
        assert_eq!(ops[1].opcode, Opcode::Integer);
        assert_eq!(ops[2].opcode, Opcode::Ge);
        assert_ne!(ops[2].p5 & JUMP_IF_NULL, 0);
        assert_eq!(ops[2].p2, 3);
        assert_eq!(reads.len(), 1);
    }

    #[test]
    fn test_or_if_false_skips_right_branch_when_left_true() {
        let mut builder = ProgramBuilder::new();
        let collations = CollationRegistry::with_builtins();
        let mut ctx = WhereContext::new(&mut builder, &collations);
        let mut reads = Vec::new();
        let mut coder = ExprCoder::new(&mut ctx, &mut reads);
        let dest = coder.builder().emit_label();
        let expr = Expr::binary(
            Expr::binary(col(0), BinaryOp::Eq, Expr::integer(1)),
            BinaryOp::Or,
            Expr::binary(col(1), BinaryOp::Eq, Expr::integer(2)),
        );
        coder.if_false(&expr, dest, true).unwrap();
        coder.builder().resolve_label(dest);
        let ops = builder.ops();
        // Left branch jumps past the right branch when true.
        assert_eq!(ops[2].opcode, Opcode::Eq);
        assert_eq!(ops[2].p2, 6);
        assert_eq!(ops[2].p5 & JUMP_IF_NULL, 0);
        assert_eq!(ops[5].opcode, Opcode::Ne);
    }

    #[test]
    fn test_affinity_trims_noop_ends() {
        let mut builder = ProgramBuilder::new();
        let collations = CollationRegistry::with_builtins();
        let mut ctx = WhereContext::new(&mut builder, &collations);
        let mut reads = Vec::new();
        let mut coder = ExprCoder::new(&mut ctx, &mut reads);
        coder.apply_affinity(
            10,
            &[
                TypeAffinity::Blob,
                TypeAffinity::Integer,
                TypeAffinity::Blob,
                TypeAffinity::Text,
                TypeAffinity::Blob,
            ],
        );
        coder.apply_affinity(20, &[TypeAffinity::Blob, TypeAffinity::Blob]);
        let ops = builder.ops();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].p1, 11);
        assert_eq!(ops[0].p2, 3);
        assert_eq!(ops[0].p4, P4::Affinity("DAB".to_owned()));
    }

    #[test]
    fn test_constant_in_list_filled_once() {
        let mut builder = ProgramBuilder::new();
        let collations = CollationRegistry::with_builtins();
        let mut ctx = WhereContext::new(&mut builder, &collations);
        let mut reads = Vec::new();
        let mut coder = ExprCoder::new(&mut ctx, &mut reads);
        let expr = Expr::In {
            expr: Box::new(col(0)),
            set: InSet::List(vec![Expr::integer(1), Expr::integer(2)]),
            not: false,
        };
        let cursor = coder.in_table(&expr).unwrap();
        let ops = builder.ops();
        assert_eq!(ops[0].opcode, Opcode::Once);
        assert_eq!(ops[0].p2, i32::try_from(ops.len()).unwrap());
        assert_eq!(ops[1].opcode, Opcode::OpenEphemeral);
        assert_eq!(ops[1].p1, cursor);
        assert_eq!(
            ops.iter().filter(|o| o.opcode == Opcode::IdxInsert).count(),
            2
        );
    }

    #[test]
    fn test_subquery_without_coder_is_not_implemented() {
        let mut builder = ProgramBuilder::new();
        let collations = CollationRegistry::with_builtins();
        let mut ctx = WhereContext::new(&mut builder, &collations);
        let mut reads = Vec::new();
        let mut coder = ExprCoder::new(&mut ctx, &mut reads);
        let expr = Expr::Exists {
            subquery: Box::default(),
            not: false,
        };
        let err = coder.code_temp(&expr).unwrap_err();
        assert!(matches!(err, PlanError::NotImplemented(_)));
    }

    #[test]
    fn test_null_jump_skipped_for_literals() {
        assert!(!can_be_null(&Expr::integer(3)));
        assert!(!can_be_null(&Expr::UnaryOp {
            op: UnaryOp::Negate,
            expr: Box::new(Expr::integer(3)),
        }));
        assert!(can_be_null(&col(0)));
        assert!(needs_no_affinity_change(&Expr::integer(3), TypeAffinity::Integer));
        assert!(!needs_no_affinity_change(&Expr::text("3"), TypeAffinity::Integer));
    }
}
