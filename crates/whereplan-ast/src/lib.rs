//! Resolved expression tree consumed by the WHERE-clause planner.
//!
//! Name resolution has already happened upstream: every column reference
//! names the cursor of its FROM item and the column index within that table
//! (`-1` for the rowid), together with the column's affinity and collation.

pub mod schema;
pub mod vtab;

use std::fmt;

use whereplan_types::{CursorId, ROWID_COLUMN, SqliteValue, TypeAffinity};

pub use schema::{
    Catalog, ColumnDescriptor, FromItem, IndexColumn, IndexDescriptor, IndexHint, IndexSample,
    JoinType, Lookup, MemoryCatalog, SrcList, TableDescriptor, TableKind,
};

// ---------------------------------------------------------------------------
// Operators
// ---------------------------------------------------------------------------

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,

    // String
    Concat,

    // Comparison
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    // Logical
    And,
    Or,
}

impl BinaryOp {
    /// Whether this is one of the six comparison operators.
    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            Self::Eq | Self::Ne | Self::Lt | Self::Le | Self::Gt | Self::Ge
        )
    }

    /// The operator that yields the same result with operands swapped.
    #[must_use]
    pub const fn commuted(self) -> Self {
        match self {
            Self::Lt => Self::Gt,
            Self::Le => Self::Ge,
            Self::Gt => Self::Lt,
            Self::Ge => Self::Le,
            other => other,
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Add => "+",
            Self::Subtract => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Concat => "||",
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::And => "AND",
            Self::Or => "OR",
        })
    }
}

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    /// Unary minus (`-expr`).
    Negate,
    /// Logical NOT (`NOT expr`).
    Not,
}

/// LIKE-family pattern operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LikeOp {
    Like,
    Glob,
    Match,
    Regexp,
}

impl LikeOp {
    /// The SQL function implementing this operator.
    pub const fn function_name(self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Glob => "glob",
            Self::Match => "match",
            Self::Regexp => "regexp",
        }
    }
}

// ---------------------------------------------------------------------------
// Expressions
// ---------------------------------------------------------------------------

/// A resolved column reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRef {
    /// Cursor of the FROM item the column belongs to.
    pub cursor: CursorId,
    /// Column index within the table, or [`ROWID_COLUMN`].
    pub column: i32,
    /// Declared affinity of the column.
    pub affinity: TypeAffinity,
    /// Collating sequence, either declared on the column or attached with
    /// `COLLATE`.
    pub collation: Option<String>,
    /// Whether `collation` came from an explicit `COLLATE` clause.
    pub explicit_collation: bool,
}

impl ColumnRef {
    /// A column reference with the default collation.
    #[must_use]
    pub fn new(cursor: CursorId, column: i32, affinity: TypeAffinity) -> Self {
        Self {
            cursor,
            column,
            affinity,
            collation: None,
            explicit_collation: false,
        }
    }

    /// Whether this references the rowid.
    pub const fn is_rowid(&self) -> bool {
        self.column == ROWID_COLUMN
    }
}

/// An expression tree node.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A literal constant.
    Literal(SqliteValue),

    /// A bound parameter (`?NNN`), with its value when known at prepare time.
    Variable { index: i32, bound: Option<SqliteValue> },

    /// A column reference.
    Column(ColumnRef),

    /// A binary operation: `left op right`.
    BinaryOp {
        left: Box<Self>,
        op: BinaryOp,
        right: Box<Self>,
    },

    /// A unary operation: `op expr`.
    UnaryOp { op: UnaryOp, expr: Box<Self> },

    /// `expr COLLATE name` on a non-column operand.
    Collate { expr: Box<Self>, collation: String },

    /// `expr [NOT] BETWEEN low AND high`.
    Between {
        expr: Box<Self>,
        low: Box<Self>,
        high: Box<Self>,
        not: bool,
    },

    /// `expr [NOT] IN (...)`.
    In {
        expr: Box<Self>,
        set: InSet,
        not: bool,
    },

    /// `expr IS [NOT] NULL`.
    IsNull { expr: Box<Self>, not: bool },

    /// `expr [NOT] LIKE/GLOB/MATCH/REGEXP pattern [ESCAPE escape]`.
    Like {
        expr: Box<Self>,
        pattern: Box<Self>,
        escape: Option<Box<Self>>,
        op: LikeOp,
        not: bool,
    },

    /// A scalar function call.
    FunctionCall { name: String, args: Vec<Self> },

    /// `[NOT] EXISTS (subquery)`.
    Exists { subquery: Box<Select>, not: bool },

    /// A scalar subquery: `(SELECT ...)`.
    Subquery(Box<Select>),
}

/// Right-hand side of an `IN` operator.
#[derive(Debug, Clone, PartialEq)]
pub enum InSet {
    /// `IN (expr, expr, ...)`
    List(Vec<Expr>),
    /// `IN (SELECT ...)`
    Subquery(Box<Select>),
}

/// A (possibly compound) subquery, kept only to the depth the planner needs
/// to compute which outer tables it references.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Select {
    pub columns: Vec<Expr>,
    pub from: Vec<SelectSource>,
    pub where_clause: Option<Box<Expr>>,
    pub group_by: Vec<Expr>,
    pub having: Option<Box<Expr>>,
    pub order_by: Vec<Expr>,
    /// Left operand of a compound SELECT.
    pub prior: Option<Box<Select>>,
}

/// One FROM item of a subquery.
#[derive(Debug, Clone, PartialEq)]
pub struct SelectSource {
    pub cursor: CursorId,
    pub subquery: Option<Box<Select>>,
    pub on: Option<Expr>,
}

/// One term of an ORDER BY list handed to the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderingTerm {
    pub expr: Expr,
    pub desc: bool,
}

impl OrderingTerm {
    #[must_use]
    pub fn asc(expr: Expr) -> Self {
        Self { expr, desc: false }
    }

    #[must_use]
    pub fn desc(expr: Expr) -> Self {
        Self { expr, desc: true }
    }
}

impl Expr {
    /// Shorthand for a column reference with the default collation.
    #[must_use]
    pub fn column(cursor: CursorId, column: i32, affinity: TypeAffinity) -> Self {
        Self::Column(ColumnRef::new(cursor, column, affinity))
    }

    /// Shorthand for an integer literal.
    #[must_use]
    pub fn integer(v: i64) -> Self {
        Self::Literal(SqliteValue::Integer(v))
    }

    /// Shorthand for a text literal.
    #[must_use]
    pub fn text(s: &str) -> Self {
        Self::Literal(SqliteValue::from(s))
    }

    /// Shorthand for `left op right`.
    #[must_use]
    pub fn binary(left: Self, op: BinaryOp, right: Self) -> Self {
        Self::BinaryOp {
            left: Box::new(left),
            op,
            right: Box::new(right),
        }
    }

    /// The column reference, if this node is a plain column.
    pub fn as_column(&self) -> Option<&ColumnRef> {
        match self {
            Self::Column(c) => Some(c),
            _ => None,
        }
    }

    /// The literal or bound-parameter value, if known at prepare time.
    pub fn constant_value(&self) -> Option<&SqliteValue> {
        match self {
            Self::Literal(v) => Some(v),
            Self::Variable { bound, .. } => bound.as_ref(),
            Self::Collate { expr, .. } => expr.constant_value(),
            _ => None,
        }
    }

    /// Affinity of the expression (`sqlite3ExprAffinity`).
    pub fn affinity(&self) -> Option<TypeAffinity> {
        match self {
            Self::Column(c) => Some(c.affinity),
            Self::Collate { expr, .. } => expr.affinity(),
            Self::Subquery(sel) => sel.columns.first().and_then(Self::affinity),
            _ => None,
        }
    }

    /// Collating sequence attached to this expression, with whether it was
    /// explicit.
    pub fn collation(&self) -> Option<(&str, bool)> {
        match self {
            Self::Column(c) => c.collation.as_deref().map(|n| (n, c.explicit_collation)),
            Self::Collate { collation, .. } => Some((collation, true)),
            _ => None,
        }
    }

    /// Whether the subtree evaluates to the same value on every row of every
    /// table in the join.
    ///
    /// Column references and subqueries are never constant; deterministic
    /// functions of constants are.
    pub fn is_constant(&self) -> bool {
        match self {
            Self::Literal(_) | Self::Variable { .. } => true,
            Self::Column(_) | Self::Exists { .. } | Self::Subquery(_) => false,
            Self::BinaryOp { left, right, .. } => left.is_constant() && right.is_constant(),
            Self::UnaryOp { expr, .. }
            | Self::Collate { expr, .. }
            | Self::IsNull { expr, .. } => expr.is_constant(),
            Self::Between {
                expr, low, high, ..
            } => expr.is_constant() && low.is_constant() && high.is_constant(),
            Self::In { expr, set, .. } => {
                expr.is_constant()
                    && match set {
                        InSet::List(items) => items.iter().all(Self::is_constant),
                        InSet::Subquery(_) => false,
                    }
            }
            Self::Like {
                expr,
                pattern,
                escape,
                ..
            } => {
                expr.is_constant()
                    && pattern.is_constant()
                    && escape.as_deref().is_none_or(Self::is_constant)
            }
            Self::FunctionCall { args, .. } => args.iter().all(Self::is_constant),
        }
    }
}

/// Collating sequence used to compare `left` with `right`
/// (`sqlite3BinaryCompareCollSeq`).
///
/// An explicit `COLLATE` on the left wins, then one on the right, then the
/// left operand's declared collation, then the right's.
pub fn comparison_collation<'e>(left: &'e Expr, right: &'e Expr) -> Option<&'e str> {
    match (left.collation(), right.collation()) {
        (Some((name, true)), _) => Some(name),
        (_, Some((name, true))) => Some(name),
        (Some((name, false)), _) => Some(name),
        (None, Some((name, false))) => Some(name),
        (None, None) => None,
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(v) => write!(f, "{v}"),
            Self::Variable { index, .. } => write!(f, "?{index}"),
            Self::Column(c) if c.is_rowid() => write!(f, "{{{}}}.rowid", c.cursor),
            Self::Column(c) => write!(f, "{{{}}}.c{}", c.cursor, c.column),
            Self::BinaryOp { left, op, right } => write!(f, "({left} {op} {right})"),
            Self::UnaryOp {
                op: UnaryOp::Negate,
                expr,
            } => write!(f, "-{expr}"),
            Self::UnaryOp {
                op: UnaryOp::Not,
                expr,
            } => write!(f, "NOT {expr}"),
            Self::Collate { expr, collation } => write!(f, "{expr} COLLATE {collation}"),
            Self::Between {
                expr,
                low,
                high,
                not,
            } => {
                let not = if *not { "NOT " } else { "" };
                write!(f, "{expr} {not}BETWEEN {low} AND {high}")
            }
            Self::In { expr, set, not } => {
                let not = if *not { "NOT " } else { "" };
                match set {
                    InSet::List(items) => {
                        write!(f, "{expr} {not}IN (")?;
                        for (i, item) in items.iter().enumerate() {
                            if i > 0 {
                                f.write_str(", ")?;
                            }
                            write!(f, "{item}")?;
                        }
                        f.write_str(")")
                    }
                    InSet::Subquery(_) => write!(f, "{expr} {not}IN (SELECT ...)"),
                }
            }
            Self::IsNull { expr, not } => {
                write!(f, "{expr} IS {}NULL", if *not { "NOT " } else { "" })
            }
            Self::Like {
                expr,
                pattern,
                op,
                not,
                ..
            } => {
                let not = if *not { "NOT " } else { "" };
                write!(f, "{expr} {not}{} {pattern}", op.function_name().to_uppercase())
            }
            Self::FunctionCall { name, args } => {
                write!(f, "{name}(")?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{arg}")?;
                }
                f.write_str(")")
            }
            Self::Exists { not, .. } => {
                write!(f, "{}EXISTS (SELECT ...)", if *not { "NOT " } else { "" })
            }
            Self::Subquery(_) => f.write_str("(SELECT ...)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(cursor: CursorId, column: i32) -> Expr {
        Expr::column(cursor, column, TypeAffinity::Integer)
    }

    #[test]
    fn test_is_constant() {
        assert!(Expr::binary(Expr::integer(1), BinaryOp::Add, Expr::integer(2)).is_constant());
        assert!(!Expr::binary(col(0, 1), BinaryOp::Add, Expr::integer(2)).is_constant());
        assert!(!Expr::Subquery(Box::default()).is_constant());
        let inlist = Expr::In {
            expr: Box::new(Expr::integer(1)),
            set: InSet::List(vec![Expr::integer(1), Expr::Variable {
                index: 1,
                bound: None,
            }]),
            not: false,
        };
        assert!(inlist.is_constant());
    }

    #[test]
    fn test_comparison_collation_precedence() {
        let mut left = ColumnRef::new(0, 0, TypeAffinity::Text);
        left.collation = Some("RTRIM".to_owned());
        let mut right = ColumnRef::new(1, 0, TypeAffinity::Text);
        right.collation = Some("NOCASE".to_owned());
        right.explicit_collation = true;

        let l = Expr::Column(left);
        let r = Expr::Column(right);
        assert_eq!(comparison_collation(&l, &r), Some("NOCASE"));
        assert_eq!(comparison_collation(&l, &Expr::integer(1)), Some("RTRIM"));
        assert_eq!(comparison_collation(&Expr::integer(1), &Expr::integer(2)), None);
    }

    #[test]
    fn test_commuted_operator() {
        assert_eq!(BinaryOp::Lt.commuted(), BinaryOp::Gt);
        assert_eq!(BinaryOp::Ge.commuted(), BinaryOp::Le);
        assert_eq!(BinaryOp::Eq.commuted(), BinaryOp::Eq);
    }

    #[test]
    fn test_display() {
        let e = Expr::Between {
            expr: Box::new(col(0, 2)),
            low: Box::new(Expr::integer(3)),
            high: Box::new(Expr::integer(9)),
            not: false,
        };
        assert_eq!(e.to_string(), "{0}.c2 BETWEEN 3 AND 9");
        assert_eq!(col(1, -1).to_string(), "{1}.rowid");
    }
}
