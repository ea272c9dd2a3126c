//! Bytecode instructions emitted by the scan generator.
//!
//! The planner is a client of this instruction set; it never interprets it.
//! Opcode names follow the upstream SQLite VDBE so disassembly is familiar.

use whereplan_error::{PlanError, Result};

/// VDBE opcodes produced by WHERE-clause code generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    // === Control Flow ===
    /// Jump to address P2.
    Goto = 1,
    /// Store return address in register P1, jump to P2.
    Gosub = 2,
    /// Jump to the address stored in register P1.
    Return = 3,
    /// Fall through the first time; jump to P2 on every later pass.
    Once = 4,
    /// Jump to P2 if register P1 is true (or NULL when P3 is non-zero).
    If = 5,
    /// Jump to P2 if register P1 is false (or NULL when P3 is non-zero).
    IfNot = 6,
    /// Jump to P2 if register P1 is NULL.
    IsNull = 7,
    /// Jump to P2 if register P1 is not NULL.
    NotNull = 8,

    // === Constants and registers ===
    /// Store the 32-bit integer P1 in register P2.
    Integer = 10,
    /// Store the 64-bit integer P4 in register P2.
    Int64 = 11,
    /// Store the real P4 in register P2.
    Real = 12,
    /// Store the string P4 in register P2.
    String8 = 13,
    /// Store the blob P4 in register P2.
    Blob = 14,
    /// Store NULL in registers P2..=P3.
    Null = 15,
    /// Copy bound parameter P1 into register P2.
    Variable = 16,
    /// Coerce register P1 to an integer or jump to P2.
    MustBeInt = 19,
    /// Apply affinity string P4 to registers P1..P1+P2.
    Affinity = 20,

    // === Comparisons (jump to P2, P5 carries flags) ===
    /// Jump if P3 == P1.
    Eq = 30,
    /// Jump if P3 != P1.
    Ne = 31,
    /// Jump if P3 < P1.
    Lt = 32,
    /// Jump if P3 <= P1.
    Le = 33,
    /// Jump if P3 > P1.
    Gt = 34,
    /// Jump if P3 >= P1.
    Ge = 35,

    // === Arithmetic and logic ===
    /// P3 = P1 AND P2.
    And = 40,
    /// P3 = P1 OR P2.
    Or = 41,
    /// P2 = NOT P1.
    Not = 42,
    /// P3 = P2 + P1.
    Add = 43,
    /// P3 = P2 - P1.
    Subtract = 44,
    /// P3 = P2 * P1.
    Multiply = 45,
    /// P3 = P2 / P1.
    Divide = 46,
    /// P3 = P2 || P1.
    Concat = 47,
    /// Call function P4 with P5 arguments starting at P2, result in P3.
    Function = 48,

    // === Cursors ===
    /// Open a read/write cursor P1 on root page P2.
    OpenWrite = 59,
    /// Open a read cursor P1 on root page P2 (P4 names the table or index,
    /// P3 the number of columns needed when non-zero).
    OpenRead = 60,
    /// Open an ephemeral table or index cursor P1 with P2 columns.
    OpenEphemeral = 61,
    /// Open an automatic index cursor P1 with P2 columns.
    OpenAutoindex = 62,
    /// Close cursor P1.
    Close = 63,
    /// Position cursor P1 on a NULL row.
    NullRow = 64,
    /// Move to the first entry; jump to P2 if empty.
    Rewind = 65,
    /// Move to the last entry; jump to P2 if empty.
    Last = 66,
    /// Advance and jump to P2 if there is another row.
    Next = 67,
    /// Step backwards and jump to P2 if there is another row.
    Prev = 68,
    /// Seek to the first key >= key in P3 (P4 = key count); jump to P2 if none.
    SeekGe = 69,
    /// Seek to the first key > key.
    SeekGt = 70,
    /// Seek to the last key <= key.
    SeekLe = 71,
    /// Seek to the last key < key.
    SeekLt = 72,
    /// Jump to P2 if no row with rowid in register P3 exists.
    NotExists = 73,
    /// Deferred seek of table cursor P1 to the rowid in register P2.
    Seek = 74,
    /// Jump to P2 if index cursor P1 key is >= key (P5=1: >).
    IdxGe = 75,
    /// Jump to P2 if index cursor P1 key is < key (P5=1: <=).
    IdxLt = 76,
    /// Read column P2 of cursor P1 into register P3.
    Column = 77,
    /// Read the rowid of table cursor P1 into register P2.
    Rowid = 78,
    /// Read the rowid stored in index cursor P1 into register P2.
    IdxRowid = 79,
    /// Build a record from registers P1..P1+P2 into register P3.
    MakeRecord = 80,
    /// Insert record in register P2 into index cursor P1.
    IdxInsert = 81,
    /// Jump to P2 if record P3 is found in cursor P1.
    Found = 83,
    /// Test rowid P3 against set P1, then insert it; jump to P2 if present.
    RowSetTest = 84,

    // === Virtual tables ===
    /// Invoke xFilter on vtab cursor P1; jump to P2 if empty.
    VFilter = 90,
    /// Advance vtab cursor P1; jump to P2 if another row exists.
    VNext = 91,
    /// Open vtab cursor P1.
    VOpen = 92,

    // === Noop (always last) ===
    /// No operation.
    Noop = 127,
}

impl Opcode {
    /// The opcode name as a static string slice.
    #[allow(clippy::too_many_lines)]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Goto => "Goto",
            Self::Gosub => "Gosub",
            Self::Return => "Return",
            Self::Once => "Once",
            Self::If => "If",
            Self::IfNot => "IfNot",
            Self::IsNull => "IsNull",
            Self::NotNull => "NotNull",
            Self::Integer => "Integer",
            Self::Int64 => "Int64",
            Self::Real => "Real",
            Self::String8 => "String8",
            Self::Blob => "Blob",
            Self::Null => "Null",
            Self::Variable => "Variable",
            Self::MustBeInt => "MustBeInt",
            Self::Affinity => "Affinity",
            Self::Eq => "Eq",
            Self::Ne => "Ne",
            Self::Lt => "Lt",
            Self::Le => "Le",
            Self::Gt => "Gt",
            Self::Ge => "Ge",
            Self::And => "And",
            Self::Or => "Or",
            Self::Not => "Not",
            Self::Add => "Add",
            Self::Subtract => "Subtract",
            Self::Multiply => "Multiply",
            Self::Divide => "Divide",
            Self::Concat => "Concat",
            Self::Function => "Function",
            Self::OpenRead => "OpenRead",
            Self::OpenWrite => "OpenWrite",
            Self::OpenEphemeral => "OpenEphemeral",
            Self::OpenAutoindex => "OpenAutoindex",
            Self::Close => "Close",
            Self::NullRow => "NullRow",
            Self::Rewind => "Rewind",
            Self::Last => "Last",
            Self::Next => "Next",
            Self::Prev => "Prev",
            Self::SeekGe => "SeekGe",
            Self::SeekGt => "SeekGt",
            Self::SeekLe => "SeekLe",
            Self::SeekLt => "SeekLt",
            Self::NotExists => "NotExists",
            Self::Seek => "Seek",
            Self::IdxGe => "IdxGE",
            Self::IdxLt => "IdxLT",
            Self::Column => "Column",
            Self::Rowid => "Rowid",
            Self::IdxRowid => "IdxRowid",
            Self::MakeRecord => "MakeRecord",
            Self::IdxInsert => "IdxInsert",
            Self::Found => "Found",
            Self::RowSetTest => "RowSetTest",
            Self::VFilter => "VFilter",
            Self::VNext => "VNext",
            Self::VOpen => "VOpen",
            Self::Noop => "Noop",
        }
    }

    /// Whether P2 of this opcode is a jump target.
    pub const fn is_jump(self) -> bool {
        matches!(
            self,
            Self::Goto
                | Self::Gosub
                | Self::Once
                | Self::If
                | Self::IfNot
                | Self::IsNull
                | Self::NotNull
                | Self::MustBeInt
                | Self::Eq
                | Self::Ne
                | Self::Lt
                | Self::Le
                | Self::Gt
                | Self::Ge
                | Self::Rewind
                | Self::Last
                | Self::Next
                | Self::Prev
                | Self::SeekGe
                | Self::SeekGt
                | Self::SeekLe
                | Self::SeekLt
                | Self::NotExists
                | Self::IdxGe
                | Self::IdxLt
                | Self::Found
                | Self::RowSetTest
                | Self::VFilter
                | Self::VNext
        )
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// P5 flag on comparison opcodes: jump when either operand is NULL.
pub const JUMP_IF_NULL: u16 = 0x10;
/// P5 flag on comparison opcodes: NULL compares equal to NULL.
pub const NULL_EQ: u16 = 0x80;

/// A single VDBE instruction.
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeOp {
    /// The opcode.
    pub opcode: Opcode,
    /// First operand (typically a register number or cursor index).
    pub p1: i32,
    /// Second operand (often a jump target address).
    pub p2: i32,
    /// Third operand.
    pub p3: i32,
    /// Fourth operand.
    pub p4: P4,
    /// Fifth operand (small flags).
    pub p5: u16,
}

/// The polymorphic P4 operand of a VDBE instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum P4 {
    /// No P4 value.
    None,
    /// A 32-bit integer value.
    Int(i32),
    /// A 64-bit integer value.
    Int64(i64),
    /// A 64-bit float value.
    Real(f64),
    /// A string value.
    Str(String),
    /// A blob value.
    Blob(Vec<u8>),
    /// A collation sequence name.
    Collation(String),
    /// A function name.
    FuncName(String),
    /// A table name.
    Table(String),
    /// An index name.
    Index(String),
    /// An affinity string (one char per column).
    Affinity(String),
    /// Virtual-table `idxStr` handed to `xFilter`.
    VtabPlan(String),
}

/// An opaque handle representing a forward-reference label.
///
/// All labels referenced by an instruction must be resolved before the
/// program is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(u32);

#[derive(Debug)]
enum LabelState {
    /// Instructions whose `p2` waits for this label.
    Unresolved(Vec<usize>),
    Resolved(i32),
}

/// A VDBE bytecode program under construction.
///
/// Registers and cursors are handed out from monotonically increasing
/// counters that live as long as the statement compilation; they are never
/// reused within one builder.
#[derive(Debug)]
pub struct ProgramBuilder {
    ops: Vec<VdbeOp>,
    labels: Vec<LabelState>,
    next_reg: i32,
    next_cursor: i32,
}

impl ProgramBuilder {
    /// Create a new empty program builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ops: Vec::new(),
            labels: Vec::new(),
            next_reg: 1,
            next_cursor: 0,
        }
    }

    // ── Instruction emission ────────────────────────────────────────────

    /// Emit a single instruction and return its address.
    pub fn emit(&mut self, op: VdbeOp) -> usize {
        let addr = self.ops.len();
        self.ops.push(op);
        addr
    }

    /// Emit an instruction from parts.
    pub fn emit_op(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32, p4: P4, p5: u16) -> usize {
        self.emit(VdbeOp {
            opcode,
            p1,
            p2,
            p3,
            p4,
            p5,
        })
    }

    /// Emit an instruction with only integer operands.
    pub fn emit3(&mut self, opcode: Opcode, p1: i32, p2: i32, p3: i32) -> usize {
        self.emit_op(opcode, p1, p2, p3, P4::None, 0)
    }

    /// The address of the next instruction to be emitted.
    #[must_use]
    pub fn current_addr(&self) -> usize {
        self.ops.len()
    }

    /// Get a reference to the instruction at `addr`.
    #[must_use]
    pub fn op_at(&self, addr: usize) -> Option<&VdbeOp> {
        self.ops.get(addr)
    }

    /// Get a mutable reference to the instruction at `addr`.
    #[must_use]
    pub fn op_at_mut(&mut self, addr: usize) -> Option<&mut VdbeOp> {
        self.ops.get_mut(addr)
    }

    /// Instructions emitted so far.
    #[must_use]
    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    /// Point the `p2` of the instruction at `addr` at the next instruction.
    pub fn jump_here(&mut self, addr: usize) {
        let here = addr_i32(self.ops.len());
        if let Some(op) = self.ops.get_mut(addr) {
            op.p2 = here;
        }
    }

    // ── Label system ────────────────────────────────────────────────────

    /// Create a new label for forward-reference jumps.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn emit_label(&mut self) -> Label {
        let id = self.labels.len() as u32;
        self.labels.push(LabelState::Unresolved(Vec::new()));
        Label(id)
    }

    /// Emit a jump instruction whose p2 target is `label`.
    pub fn emit_jump_to_label(
        &mut self,
        opcode: Opcode,
        p1: i32,
        p3: i32,
        label: Label,
        p4: P4,
        p5: u16,
    ) -> usize {
        let addr = self.emit(VdbeOp {
            opcode,
            p1,
            p2: -1,
            p3,
            p4,
            p5,
        });
        match self.labels.get_mut(label.0 as usize) {
            Some(LabelState::Unresolved(refs)) => refs.push(addr),
            Some(LabelState::Resolved(target)) => self.ops[addr].p2 = *target,
            None => {}
        }
        addr
    }

    /// Emit an unconditional jump to `label`.
    pub fn emit_goto(&mut self, label: Label) -> usize {
        self.emit_jump_to_label(Opcode::Goto, 0, 0, label, P4::None, 0)
    }

    /// Resolve a label to the current address and patch all forward refs.
    pub fn resolve_label(&mut self, label: Label) {
        let addr = addr_i32(self.current_addr());
        self.resolve_label_to(label, addr);
    }

    /// Resolve a label to an explicit address.
    pub fn resolve_label_to(&mut self, label: Label, address: i32) {
        let Some(state) = self.labels.get_mut(label.0 as usize) else {
            return;
        };
        if let LabelState::Unresolved(refs) = state {
            for &ref_addr in refs.iter() {
                self.ops[ref_addr].p2 = address;
            }
        }
        *state = LabelState::Resolved(address);
    }

    // ── Register and cursor allocation ──────────────────────────────────

    /// Allocate a single register.
    pub fn alloc_reg(&mut self) -> i32 {
        let reg = self.next_reg;
        self.next_reg += 1;
        reg
    }

    /// Allocate a contiguous block of `n` registers; returns the first.
    pub fn alloc_regs(&mut self, n: i32) -> i32 {
        let first = self.next_reg;
        self.next_reg += n.max(0);
        first
    }

    /// Allocate a cursor number.
    pub fn alloc_cursor(&mut self) -> i32 {
        let cur = self.next_cursor;
        self.next_cursor += 1;
        cur
    }

    /// Ensure cursors below `n` are never handed out by `alloc_cursor`.
    pub fn reserve_cursors(&mut self, n: i32) {
        self.next_cursor = self.next_cursor.max(n);
    }

    /// Total registers allocated (high water mark).
    #[must_use]
    pub fn register_count(&self) -> i32 {
        self.next_reg - 1
    }

    // ── Finalization ────────────────────────────────────────────────────

    /// Validate all referenced labels are resolved and return the program.
    pub fn finish(self) -> Result<VdbeProgram> {
        for (i, state) in self.labels.iter().enumerate() {
            if let LabelState::Unresolved(refs) = state {
                if !refs.is_empty() {
                    return Err(PlanError::Internal(format!(
                        "unresolved label {i} referenced by {} instruction(s)",
                        refs.len()
                    )));
                }
            }
        }
        Ok(VdbeProgram {
            register_count: self.next_reg - 1,
            ops: self.ops,
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn addr_i32(addr: usize) -> i32 {
    addr as i32
}

/// A finalized VDBE bytecode program.
#[derive(Debug, Clone, PartialEq)]
pub struct VdbeProgram {
    ops: Vec<VdbeOp>,
    register_count: i32,
}

impl VdbeProgram {
    /// The instruction sequence.
    #[must_use]
    pub fn ops(&self) -> &[VdbeOp] {
        &self.ops
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the program is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Number of registers required.
    #[must_use]
    pub fn register_count(&self) -> i32 {
        self.register_count
    }

    /// Disassemble the program in SQLite's `EXPLAIN` layout.
    #[must_use]
    pub fn disassemble(&self) -> String {
        use std::fmt::Write;

        let mut out = String::with_capacity(self.ops.len() * 60);
        out.push_str("addr  opcode           p1    p2    p3    p4                 p5\n");
        out.push_str("----  ---------------  ----  ----  ----  -----------------  --\n");
        for (addr, op) in self.ops.iter().enumerate() {
            let p4_str = match &op.p4 {
                P4::None => String::new(),
                P4::Int(v) => format!("(int){v}"),
                P4::Int64(v) => format!("(i64){v}"),
                P4::Real(v) => format!("(real){v}"),
                P4::Str(s) => format!("(str){s}"),
                P4::Blob(b) => format!("(blob)[{}B]", b.len()),
                P4::Collation(c) => format!("(coll){c}"),
                P4::FuncName(f) => format!("(func){f}"),
                P4::Table(t) => format!("(tbl){t}"),
                P4::Index(i) => format!("(idx){i}"),
                P4::Affinity(a) => format!("(aff){a}"),
                P4::VtabPlan(s) => format!("(vtab){s}"),
            };
            let _ = writeln!(
                &mut out,
                "{addr:<4}  {:<15}  {:<4}  {:<4}  {:<4}  {:<17}  {:<2}",
                op.opcode.name(),
                op.p1,
                op.p2,
                op.p3,
                p4_str,
                op.p5,
            );
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_and_backward_labels() {
        let mut b = ProgramBuilder::new();
        let top = b.emit_label();
        b.resolve_label(top);
        b.emit3(Opcode::Integer, 1, 1, 0);
        let end = b.emit_label();
        let fwd = b.emit_goto(end);
        let back = b.emit_goto(top);
        b.resolve_label(end);
        let prog = b.finish().expect("labels resolved");
        assert_eq!(prog.ops()[fwd].p2, 3);
        assert_eq!(prog.ops()[back].p2, 0);
    }

    #[test]
    fn test_unresolved_label_is_error() {
        let mut b = ProgramBuilder::new();
        let l = b.emit_label();
        b.emit_goto(l);
        assert!(b.finish().is_err());
    }

    #[test]
    fn test_allocators_are_monotonic() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.alloc_reg(), 1);
        assert_eq!(b.alloc_regs(3), 2);
        assert_eq!(b.alloc_reg(), 5);
        b.reserve_cursors(4);
        assert_eq!(b.alloc_cursor(), 4);
        assert_eq!(b.alloc_cursor(), 5);
        assert_eq!(b.register_count(), 5);
    }

    #[test]
    fn test_jump_here_patches_p2() {
        let mut b = ProgramBuilder::new();
        let addr = b.emit3(Opcode::Once, 0, 0, 0);
        b.emit3(Opcode::Null, 0, 1, 1);
        b.jump_here(addr);
        assert_eq!(b.op_at(addr).map(|op| op.p2), Some(2));
        assert!(Opcode::Once.is_jump());
        assert!(!Opcode::Column.is_jump());
    }

    #[test]
    fn test_disassemble_header() {
        let mut b = ProgramBuilder::new();
        b.emit_op(Opcode::OpenRead, 0, 2, 0, P4::Table("t1".to_owned()), 0);
        let text = b.finish().expect("finish").disassemble();
        assert!(text.contains("OpenRead"));
        assert!(text.contains("(tbl)t1"));
    }
}
