//! Shared value, affinity, collation and bytecode types for the planner.

pub mod collation;
pub mod opcode;
pub mod value;

pub use collation::{CollationFunction, CollationRegistry};
pub use value::SqliteValue;

/// Logical cursor number assigned to a FROM-clause item or index.
pub type CursorId = i32;

/// Column index that denotes the rowid (integer primary key) of a table.
pub const ROWID_COLUMN: i32 = -1;

/// SQLite type affinity, used for column type resolution.
///
/// See <https://www.sqlite.org/datatype3.html#type_affinity>.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum TypeAffinity {
    /// Column prefers integer storage. Includes INTEGER, INT, TINYINT, etc.
    Integer = b'D',
    /// Column prefers text storage. Includes TEXT, VARCHAR, CLOB.
    Text = b'B',
    /// Column has no preference. Includes BLOB or no type specified.
    Blob = b'A',
    /// Column prefers real (float) storage. Includes REAL, DOUBLE, FLOAT.
    Real = b'E',
    /// Column prefers numeric storage. Includes NUMERIC, DECIMAL, BOOLEAN,
    /// DATE, DATETIME.
    Numeric = b'C',
}

impl TypeAffinity {
    /// Determine the type affinity for a declared column type name.
    ///
    /// Uses SQLite's first-match rule (§3.1 of datatype3.html).
    pub fn from_type_name(type_name: &str) -> Self {
        let upper = type_name.to_ascii_uppercase();

        if upper.contains("INT") {
            Self::Integer
        } else if upper.contains("CHAR") || upper.contains("CLOB") || upper.contains("TEXT") {
            Self::Text
        } else if upper.is_empty() || upper.contains("BLOB") {
            Self::Blob
        } else if upper.contains("REAL") || upper.contains("FLOA") || upper.contains("DOUB") {
            Self::Real
        } else {
            Self::Numeric
        }
    }

    /// Whether values of this affinity compare numerically.
    pub const fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Real | Self::Numeric)
    }

    /// The affinity applied when comparing operands of affinity `self` and
    /// `other` (`sqlite3CompareAffinity`).
    #[must_use]
    pub const fn comparison(self, other: Self) -> Self {
        if self.is_numeric() || other.is_numeric() {
            Self::Numeric
        } else if matches!(self, Self::Blob) {
            other
        } else {
            self
        }
    }

    /// The affinity code character used in `P4::Affinity` strings.
    pub const fn code(self) -> char {
        self as u8 as char
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affinity_from_type_name() {
        assert_eq!(TypeAffinity::from_type_name("INTEGER"), TypeAffinity::Integer);
        assert_eq!(TypeAffinity::from_type_name("varchar(10)"), TypeAffinity::Text);
        assert_eq!(TypeAffinity::from_type_name(""), TypeAffinity::Blob);
        assert_eq!(TypeAffinity::from_type_name("DOUBLE"), TypeAffinity::Real);
        assert_eq!(TypeAffinity::from_type_name("DATE"), TypeAffinity::Numeric);
    }

    #[test]
    fn test_comparison_affinity() {
        assert_eq!(
            TypeAffinity::Text.comparison(TypeAffinity::Integer),
            TypeAffinity::Numeric
        );
        assert_eq!(
            TypeAffinity::Blob.comparison(TypeAffinity::Text),
            TypeAffinity::Text
        );
        assert_eq!(TypeAffinity::Text.code(), 'B');
    }
}
