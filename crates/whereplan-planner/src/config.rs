//! Planner configuration.
//!
//! Two settings are process-wide (`automatic_index` and the reverse-scan
//! test flag). They live in atomics so a host can flip them at any time; a
//! compilation copies them once into a [`PlannerConfig`] and never looks at
//! the globals again.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::Deserialize;

static GLOBAL_AUTOMATIC_INDEX: AtomicBool = AtomicBool::new(true);
static GLOBAL_REVERSE_SCAN: AtomicBool = AtomicBool::new(false);

/// Enable or disable automatic ephemeral indexes for future compilations.
pub fn set_global_automatic_index(enabled: bool) {
    GLOBAL_AUTOMATIC_INDEX.store(enabled, Ordering::Relaxed);
}

/// Force every unordered scan to run backwards in future compilations.
pub fn set_global_reverse_scan(enabled: bool) {
    GLOBAL_REVERSE_SCAN.store(enabled, Ordering::Relaxed);
}

/// Settings read by one WHERE-clause compilation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Consider building a transient index when no persistent one helps.
    pub automatic_index: bool,
    /// Reverse the scan direction of every level with no ORDER BY
    /// requirement (`PRAGMA reverse_unordered_selects`).
    pub reverse_unordered_selects: bool,
    /// `PRAGMA case_sensitive_like`.
    pub case_sensitive_like: bool,
    /// Last bytes of a case-insensitive LIKE prefix for which the derived
    /// range is not an exact replacement for the LIKE test.
    pub like_fold_boundary: Vec<u8>,
    /// Use histogram samples when present.
    pub use_histograms: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            automatic_index: true,
            reverse_unordered_selects: false,
            case_sensitive_like: false,
            like_fold_boundary: vec![b'@'],
            use_histograms: true,
        }
    }
}

impl PlannerConfig {
    /// Defaults overlaid with the current process-wide settings.
    #[must_use]
    pub fn snapshot() -> Self {
        Self {
            automatic_index: GLOBAL_AUTOMATIC_INDEX.load(Ordering::Relaxed),
            reverse_unordered_selects: GLOBAL_REVERSE_SCAN.load(Ordering::Relaxed),
            ..Self::default()
        }
    }

    /// Whether a case-insensitive prefix ending in `byte` needs the original
    /// LIKE test kept after the range rewrite.
    pub fn folds_inexactly(&self, byte: u8) -> bool {
        self.like_fold_boundary.contains(&byte)
    }
}
