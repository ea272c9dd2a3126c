use thiserror::Error;

/// Primary error type for WHERE-clause planning.
///
/// Every variant is fatal to the compilation that raised it: query
/// compilation is all-or-nothing. Missing statistics are not an error and
/// never show up here; the statistics loader reports them separately and the
/// cost model falls back to default estimates.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    // === Capacity ===
    /// More distinct tables in one join than the table bitmask can represent.
    #[error("at most {limit} tables in a join")]
    TooManyTables { limit: usize },

    /// Allocation failure during decomposition, costing or code generation.
    #[error("out of memory")]
    OutOfMemory,

    // === Planning ===
    /// An `INDEXED BY` override named an index the cost model could not use.
    #[error("cannot use index: {index}")]
    UnsatisfiableIndexOverride { index: String },

    /// A collating sequence named by an index, a term or a histogram sample
    /// is not registered.
    #[error("no such collation sequence: {name}")]
    CollationNotFound { name: String },

    /// The virtual-table index advisor failed or returned an inconsistent plan.
    #[error("{message}")]
    VirtualTableAdvisory { table: String, message: String },

    // === Catalog ===
    /// No such table.
    #[error("no such table: {name}")]
    NoSuchTable { name: String },

    /// No such index.
    #[error("no such index: {name}")]
    NoSuchIndex { name: String },

    // === Internal ===
    /// Internal logic error (bug).
    #[error("internal error: {0}")]
    Internal(String),

    /// Feature not yet implemented.
    #[error("not implemented: {0}")]
    NotImplemented(String),
}

/// SQLite primary result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// Generic error.
    Error = 1,
    /// Internal logic error.
    Internal = 2,
    /// Out of memory.
    NoMem = 7,
    /// Library used incorrectly.
    Misuse = 21,
}

impl PlanError {
    /// Map this error to a SQLite error code for compatibility.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::TooManyTables { .. }
            | Self::UnsatisfiableIndexOverride { .. }
            | Self::CollationNotFound { .. }
            | Self::VirtualTableAdvisory { .. }
            | Self::NoSuchTable { .. }
            | Self::NoSuchIndex { .. }
            | Self::NotImplemented(_) => ErrorCode::Error,
            Self::OutOfMemory => ErrorCode::NoMem,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether the user can likely fix this by rewriting the query or schema.
    pub const fn is_user_recoverable(&self) -> bool {
        matches!(
            self,
            Self::TooManyTables { .. }
                | Self::UnsatisfiableIndexOverride { .. }
                | Self::CollationNotFound { .. }
                | Self::NoSuchTable { .. }
                | Self::NoSuchIndex { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::TooManyTables { .. } => Some("Split the query or materialize part of the join"),
            Self::UnsatisfiableIndexOverride { .. } => {
                Some("Drop the INDEXED BY clause or add a constraint on the index's first column")
            }
            Self::CollationNotFound { .. } => {
                Some("Register the collating sequence before preparing the statement")
            }
            _ => None,
        }
    }

    /// The table or index name this error is about, if any.
    pub fn subject(&self) -> Option<&str> {
        match self {
            Self::UnsatisfiableIndexOverride { index } => Some(index),
            Self::VirtualTableAdvisory { table, .. } => Some(table),
            Self::NoSuchTable { name } | Self::NoSuchIndex { name } => Some(name),
            Self::CollationNotFound { name } => Some(name),
            _ => None,
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a not-implemented error.
    pub fn not_implemented(feature: impl Into<String>) -> Self {
        Self::NotImplemented(feature.into())
    }

    /// Create a virtual-table advisory error.
    ///
    /// An empty adapter message is replaced by SQLite's generic wording.
    pub fn vtab(table: impl Into<String>, message: impl Into<String>) -> Self {
        let table = table.into();
        let mut message = message.into();
        if message.is_empty() {
            message = format!("xBestIndex malfunction on table {table}");
        }
        Self::VirtualTableAdvisory { table, message }
    }

    /// Create a missing-collation error.
    pub fn collation(name: impl Into<String>) -> Self {
        Self::CollationNotFound { name: name.into() }
    }
}

/// Result type alias using `PlanError`.
pub type Result<T> = std::result::Result<T, PlanError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = PlanError::TooManyTables { limit: 63 };
        assert_eq!(err.to_string(), "at most 63 tables in a join");
        let err = PlanError::UnsatisfiableIndexOverride {
            index: "i1".to_owned(),
        };
        assert_eq!(err.to_string(), "cannot use index: i1");
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(PlanError::OutOfMemory.error_code(), ErrorCode::NoMem);
        assert_eq!(
            PlanError::collation("klingon").error_code(),
            ErrorCode::Error
        );
        assert_eq!(PlanError::internal("x").error_code(), ErrorCode::Internal);
        assert_eq!(ErrorCode::NoMem as i32, 7);
    }

    #[test]
    fn test_vtab_error_default_message() {
        let err = PlanError::vtab("ft", "");
        assert_eq!(err.to_string(), "xBestIndex malfunction on table ft");
        assert_eq!(err.subject(), Some("ft"));

        let err = PlanError::vtab("ft", "bad plan");
        assert_eq!(err.to_string(), "bad plan");
    }

    #[test]
    fn test_user_recoverable() {
        assert!(PlanError::TooManyTables { limit: 63 }.is_user_recoverable());
        assert!(!PlanError::OutOfMemory.is_user_recoverable());
        assert!(PlanError::collation("x").suggestion().is_some());
        assert!(PlanError::internal("x").suggestion().is_none());
    }
}
