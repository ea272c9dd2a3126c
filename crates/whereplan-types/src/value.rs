use std::cmp::Ordering;
use std::fmt;

use crate::TypeAffinity;
use crate::collation::CollationFunction;

/// A dynamically-typed SQLite value.
///
/// SQLite has five fundamental storage classes: NULL, INTEGER, REAL, TEXT,
/// and BLOB. Literal operands and histogram samples are both carried as
/// `SqliteValue`.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum SqliteValue {
    /// SQL NULL.
    Null,
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit IEEE 754 floating-point number.
    Float(f64),
    /// A UTF-8 text string.
    Text(String),
    /// A binary large object.
    Blob(Vec<u8>),
}

impl SqliteValue {
    /// Whether this is SQL NULL.
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Try to extract a text reference.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Try to extract an integer value.
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Apply numeric affinity the way a comparison against a numeric column
    /// would: well-formed numeric text becomes INTEGER or REAL.
    #[must_use]
    pub fn apply_affinity(self, affinity: TypeAffinity) -> Self {
        match (affinity.is_numeric(), &self) {
            (true, Self::Text(s)) => try_coerce_text_to_numeric(s).unwrap_or(self),
            _ => self,
        }
    }

    /// Compare two values in index order, using `coll` for TEXT against TEXT.
    ///
    /// Ordering across storage classes is NULL < numeric < TEXT < BLOB.
    pub fn compare_with(&self, other: &Self, coll: &dyn CollationFunction) -> Ordering {
        match (self, other) {
            (Self::Text(a), Self::Text(b)) => coll.compare(a.as_bytes(), b.as_bytes()),
            _ => self.partial_cmp(other).unwrap_or(Ordering::Equal),
        }
    }

    /// The sort order class (SQLite sorts NULLs first).
    const fn sort_class(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Integer(_) | Self::Float(_) => 1,
            Self::Text(_) => 2,
            Self::Blob(_) => 3,
        }
    }
}

impl fmt::Display for SqliteValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("NULL"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Text(s) => write!(f, "'{s}'"),
            Self::Blob(b) => {
                f.write_str("X'")?;
                for byte in b {
                    write!(f, "{byte:02X}")?;
                }
                f.write_str("'")
            }
        }
    }
}

impl PartialEq for SqliteValue {
    fn eq(&self, other: &Self) -> bool {
        matches!(self.partial_cmp(other), Some(Ordering::Equal))
    }
}

impl PartialOrd for SqliteValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        let class_a = self.sort_class();
        let class_b = other.sort_class();

        if class_a != class_b {
            return Some(class_a.cmp(&class_b));
        }

        match (self, other) {
            (Self::Null, Self::Null) => Some(Ordering::Equal),
            (Self::Integer(a), Self::Integer(b)) => Some(a.cmp(b)),
            (Self::Float(a), Self::Float(b)) => a.partial_cmp(b),
            (Self::Integer(a), Self::Float(b)) => Some(int_float_cmp(*a, *b)),
            (Self::Float(a), Self::Integer(b)) => Some(int_float_cmp(*b, *a).reverse()),
            (Self::Text(a), Self::Text(b)) => Some(a.cmp(b)),
            (Self::Blob(a), Self::Blob(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<i64> for SqliteValue {
    fn from(i: i64) -> Self {
        Self::Integer(i)
    }
}

impl From<&str> for SqliteValue {
    fn from(s: &str) -> Self {
        Self::Text(s.to_owned())
    }
}

/// Try to coerce a text string to INTEGER or REAL following SQLite NUMERIC
/// affinity rules.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss, clippy::float_cmp)]
fn try_coerce_text_to_numeric(s: &str) -> Option<SqliteValue> {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Some(SqliteValue::Integer(i));
    }
    let f = trimmed.parse::<f64>().ok()?;
    if !f.is_finite() {
        let lower = trimmed.to_ascii_lowercase();
        if lower.contains("inf") || lower.contains("nan") {
            return None;
        }
    }
    if (-9_223_372_036_854_775_808.0..9_223_372_036_854_775_808.0).contains(&f) {
        let i = f as i64;
        if (i as f64) == f {
            return Some(SqliteValue::Integer(i));
        }
    }
    Some(SqliteValue::Float(f))
}

/// Compare an integer with a float, preserving precision for large i64 values.
#[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
fn int_float_cmp(i: i64, r: f64) -> Ordering {
    if r.is_nan() {
        return Ordering::Greater;
    }
    if r < -9_223_372_036_854_775_808.0 {
        return Ordering::Greater;
    }
    if r >= 9_223_372_036_854_775_808.0 {
        return Ordering::Less;
    }
    let y = r as i64;
    match i.cmp(&y) {
        Ordering::Equal => (i as f64).partial_cmp(&r).unwrap_or(Ordering::Equal),
        other => other,
    }
}
