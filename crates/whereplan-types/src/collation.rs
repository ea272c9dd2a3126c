//! Collating sequences used to order index keys and histogram samples.
//!
//! Collations are pure comparators. Implementations **must** be
//! deterministic, antisymmetric and transitive; the cost model relies on
//! sample order agreeing with index order.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// A collation comparator over UTF-8 byte strings.
pub trait CollationFunction: Send + Sync {
    /// Collation name (for `COLLATE name`).
    fn name(&self) -> &str;

    /// Compare two UTF-8 byte slices.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering;
}

// ── Built-in collations ──────────────────────────────────────────────────

/// BINARY collation: raw `memcmp` byte comparison.
pub struct BinaryCollation;

impl CollationFunction for BinaryCollation {
    fn name(&self) -> &str {
        "BINARY"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

/// NOCASE collation: ASCII case-insensitive comparison.
///
/// Only folds ASCII letters (`A-Z` → `a-z`). Non-ASCII bytes compare as-is.
pub struct NoCaseCollation;

impl CollationFunction for NoCaseCollation {
    fn name(&self) -> &str {
        "NOCASE"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        let l = left.iter().map(u8::to_ascii_lowercase);
        let r = right.iter().map(u8::to_ascii_lowercase);
        l.cmp(r)
    }
}

/// RTRIM collation: trailing-space-insensitive comparison.
pub struct RtrimCollation;

impl CollationFunction for RtrimCollation {
    fn name(&self) -> &str {
        "RTRIM"
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        fn trim(s: &[u8]) -> &[u8] {
            let end = s.iter().rposition(|&b| b != b' ').map_or(0, |p| p + 1);
            &s[..end]
        }
        trim(left).cmp(trim(right))
    }
}

/// Name-keyed set of collating sequences available to one compilation.
///
/// Lookup is ASCII case-insensitive, matching `COLLATE nocase` resolving to
/// `NOCASE`.
#[derive(Clone)]
pub struct CollationRegistry {
    by_name: HashMap<String, Arc<dyn CollationFunction>>,
}

impl CollationRegistry {
    /// A registry holding the three built-in collations.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut reg = Self {
            by_name: HashMap::new(),
        };
        reg.register(Arc::new(BinaryCollation));
        reg.register(Arc::new(NoCaseCollation));
        reg.register(Arc::new(RtrimCollation));
        reg
    }

    /// Register (or replace) a collation under its own name.
    pub fn register(&mut self, coll: Arc<dyn CollationFunction>) {
        self.by_name.insert(coll.name().to_ascii_uppercase(), coll);
    }

    /// Look up a collation by name.
    #[must_use]
    pub fn find(&self, name: &str) -> Option<Arc<dyn CollationFunction>> {
        self.by_name.get(&name.to_ascii_uppercase()).cloned()
    }

    /// Whether `name` resolves to a registered collation.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(&name.to_ascii_uppercase())
    }
}

impl Default for CollationRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl std::fmt::Debug for CollationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.by_name.keys().collect();
        names.sort();
        f.debug_struct("CollationRegistry")
            .field("names", &names)
            .finish()
    }
}

/// Whether two collation names denote the same sequence.
///
/// `None` stands for the default `BINARY` collation.
#[must_use]
pub fn same_collation(a: Option<&str>, b: Option<&str>) -> bool {
    a.unwrap_or("BINARY").eq_ignore_ascii_case(b.unwrap_or("BINARY"))
}
