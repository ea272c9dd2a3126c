//! Row-count estimation from index statistics.
//!
//! Two sources feed the estimates:
//! - `row_estimates` (the `sqlite_stat1` row of an index): total rows and
//!   average rows per distinct key prefix.
//! - `samples` (the `sqlite_stat3` rows): a sorted histogram of keys on the
//!   first index column, each with the number of rows equal to, less than,
//!   and distinct-less-than the sampled key.
//!
//! The loaders at the bottom of this module fill both from persisted rows.
//! A missing `sqlite_stat1` is not an error: [`load_analysis`] reports
//! [`StatsLoad::Unavailable`] and every index keeps its default estimates.

use std::cmp::Ordering;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use whereplan_ast::{Expr, IndexDescriptor, IndexSample, MemoryCatalog, TableKind, UnaryOp};
use whereplan_error::{PlanError, Result};
use whereplan_types::collation::BinaryCollation;
use whereplan_types::{CollationFunction, CollationRegistry, SqliteValue, TypeAffinity};

/// Histogram samples kept per index.
pub const STAT3_SAMPLES: usize = 24;

// ---------------------------------------------------------------------------
// Estimation
// ---------------------------------------------------------------------------

/// Position of a key relative to the index: rows strictly before it and rows
/// equal to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyStats {
    pub n_lt: u64,
    pub n_eq: u64,
}

/// A range constraint on the first column after the equality prefix.
#[derive(Debug, Clone, PartialEq)]
pub struct RangeBound {
    /// The bound, when known at prepare time.
    pub value: Option<SqliteValue>,
    /// `>=` / `<=` rather than `>` / `<`.
    pub inclusive: bool,
    /// The synthetic `col > NULL` bound derived from `IS NOT NULL`.
    pub vnull: bool,
}

/// Crude base-10 logarithm: the number of decimal digits needed for `n`,
/// at least 1.
///
/// Cost comparisons are calibrated against this step function, not the
/// real logarithm.
pub fn estimate_log(n: f64) -> f64 {
    let mut log_n = 1.0;
    let mut x = 10.0;
    while n > x {
        log_n += 1.0;
        x *= 10.0;
    }
    log_n
}

/// Value of a constant operand after applying the column's affinity.
pub fn value_from_expr(expr: &Expr, affinity: TypeAffinity) -> Option<SqliteValue> {
    let value = match expr {
        Expr::UnaryOp {
            op: UnaryOp::Negate,
            expr: inner,
        } => match inner.constant_value()? {
            SqliteValue::Integer(i) => SqliteValue::Integer(i.checked_neg()?),
            SqliteValue::Float(f) => SqliteValue::Float(-f),
            _ => return None,
        },
        other => other.constant_value()?.clone(),
    };
    Some(value.apply_affinity(affinity))
}

fn sample_collation(
    index: &IndexDescriptor,
    value: &SqliteValue,
    collations: &CollationRegistry,
) -> Result<Arc<dyn CollationFunction>> {
    if !matches!(value, SqliteValue::Text(_)) {
        return Ok(Arc::new(BinaryCollation));
    }
    let name = index
        .columns
        .first()
        .and_then(|c| c.collation.as_deref())
        .unwrap_or("BINARY");
    collations.find(name).ok_or_else(|| PlanError::CollationNotFound {
        name: name.to_owned(),
    })
}

/// Locate `value` among the histogram samples of `index`.
///
/// An exact sample hit reports that sample's counts. Between two samples
/// the less-than count is interpolated one third into the gap, or two thirds
/// when `round_up` is set, and the equal count is the index's average for
/// unsampled keys.
pub fn key_stats(
    index: &IndexDescriptor,
    value: &SqliteValue,
    round_up: bool,
    collations: &CollationRegistry,
) -> Result<KeyStats> {
    let samples = &index.samples;
    let total = index.row_estimates.first().copied().unwrap_or(0);
    let coll = sample_collation(index, value, collations)?;

    let mut is_eq = false;
    let mut i = 0;
    while i < samples.len() {
        match samples[i].value.compare_with(value, coll.as_ref()) {
            Ordering::Less => i += 1,
            Ordering::Equal => {
                is_eq = true;
                break;
            }
            Ordering::Greater => break,
        }
    }

    if is_eq {
        return Ok(KeyStats {
            n_lt: samples[i].n_lt,
            n_eq: samples[i].n_eq,
        });
    }
    let (lower, upper) = if i == 0 {
        (0, samples.first().map_or(total, |s| s.n_lt))
    } else {
        let prev = &samples[i - 1];
        let upper = samples.get(i).map_or(total, |s| s.n_lt);
        (prev.n_eq + prev.n_lt, upper)
    };
    let gap = upper.saturating_sub(lower);
    let gap = if round_up { gap * 2 / 3 } else { gap / 3 };
    Ok(KeyStats {
        n_lt: lower + gap,
        n_eq: index.avg_eq,
    })
}

/// Rows of `index` expected to equal `value` on the first column.
pub fn estimate_equality(
    index: &IndexDescriptor,
    value: &SqliteValue,
    collations: &CollationRegistry,
) -> Result<u64> {
    key_stats(index, value, false, collations).map(|k| k.n_eq)
}

/// Rows expected to match `first_column IN (values...)`.
///
/// Returns `None` when any value is unknown at prepare time. The sum is
/// capped at half the table, since overlapping lists overcount.
pub fn estimate_in_list(
    index: &IndexDescriptor,
    values: &[Option<SqliteValue>],
    collations: &CollationRegistry,
) -> Result<Option<u64>> {
    let mut total = 0u64;
    for value in values {
        let Some(value) = value else {
            return Ok(None);
        };
        total = total.saturating_add(estimate_equality(index, value, collations)?);
    }
    let cap = index.row_estimates.first().copied().unwrap_or(0) / 2;
    Ok(Some(total.min(cap.max(1))))
}

/// Factor by which a range constraint shrinks the scan.
///
/// With histogram samples and the range on the first index column the
/// divisor is `rows / rows_in_range`. Otherwise each bound divides by four,
/// except the synthetic `> NULL` bound which only skips NULLs.
#[allow(clippy::cast_precision_loss)]
pub fn range_divisor(
    index: &IndexDescriptor,
    n_eq: usize,
    affinity: TypeAffinity,
    lower: Option<&RangeBound>,
    upper: Option<&RangeBound>,
    collations: &CollationRegistry,
) -> Result<f64> {
    let total = index.row_estimates.first().copied().unwrap_or(0);
    if n_eq == 0 && !index.samples.is_empty() {
        let mut i_lower = 0;
        let mut i_upper = total;
        if let Some(bound) = lower {
            if let Some(v) = bound.value.clone() {
                let k = key_stats(index, &v.apply_affinity(affinity), false, collations)?;
                i_lower = if bound.inclusive { k.n_lt } else { k.n_lt + k.n_eq };
            }
        }
        if let Some(bound) = upper {
            if let Some(v) = bound.value.clone() {
                let k = key_stats(index, &v.apply_affinity(affinity), true, collations)?;
                i_upper = if bound.inclusive { k.n_lt + k.n_eq } else { k.n_lt };
            }
        }
        return Ok(if i_upper <= i_lower {
            total as f64
        } else {
            total as f64 / (i_upper - i_lower) as f64
        });
    }
    Ok(heuristic_range_divisor(lower, upper))
}

/// Range divisor without histogram data: each bound divides by four,
/// except the synthetic `> NULL` bound.
pub fn heuristic_range_divisor(lower: Option<&RangeBound>, upper: Option<&RangeBound>) -> f64 {
    let mut divisor = 1.0;
    if lower.is_some_and(|b| !b.vnull) {
        divisor *= 4.0;
    }
    if upper.is_some() {
        divisor *= 4.0;
    }
    divisor
}

// ---------------------------------------------------------------------------
// sqlite_stat1 / sqlite_stat3 loading
// ---------------------------------------------------------------------------

/// One row of `sqlite_stat1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat1Row {
    pub table: String,
    /// `None` for the table's own row count.
    pub index: Option<String>,
    pub stat: String,
}

/// One row of `sqlite_stat3`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stat3Row {
    pub table: String,
    pub index: String,
    pub n_eq: u64,
    pub n_lt: u64,
    pub n_dlt: u64,
    pub sample: SqliteValue,
}

/// Persisted statistics, as read from the statistics tables.
pub trait StatsStore {
    /// Rows of `sqlite_stat1`, or `None` if the table does not exist.
    fn stat1(&self) -> Option<Vec<Stat1Row>>;
    /// Rows of `sqlite_stat3`, or `None` if the table does not exist.
    fn stat3(&self) -> Option<Vec<Stat3Row>>;
}

/// A [`StatsStore`] holding rows in memory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryStats {
    pub stat1: Option<Vec<Stat1Row>>,
    pub stat3: Option<Vec<Stat3Row>>,
}

impl StatsStore for MemoryStats {
    fn stat1(&self) -> Option<Vec<Stat1Row>> {
        self.stat1.clone()
    }

    fn stat3(&self) -> Option<Vec<Stat3Row>> {
        self.stat3.clone()
    }
}

/// Outcome of [`load_analysis`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsLoad {
    /// Statistics were applied to this many indexes.
    Loaded { indexes: usize },
    /// No statistics table exists; default estimates are in effect.
    Unavailable,
}

/// Parsed `stat` column of a `sqlite_stat1` row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stat1 {
    /// Table row count followed by one average per key prefix. Shorter than
    /// `n_columns + 1` when the row has fewer values.
    pub row_estimates: Vec<u64>,
    pub unordered: bool,
}

/// Parse the `stat` text of a `sqlite_stat1` row for an index of
/// `n_columns` columns (`0` for a table row).
///
/// Parsing is lenient: a non-digit ends the current number, and only an
/// exact trailing `unordered` token sets the flag.
pub fn parse_stat1(stat: &str, n_columns: usize) -> Stat1 {
    let z = stat.as_bytes();
    let mut pos = 0;
    let mut out = Stat1 {
        row_estimates: Vec::new(),
        unordered: false,
    };
    let mut i = 0;
    while pos < z.len() && i <= n_columns {
        let mut v: u64 = 0;
        while let Some(&c) = z.get(pos).filter(|c| c.is_ascii_digit()) {
            v = v.saturating_mul(10).saturating_add(u64::from(c - b'0'));
            pos += 1;
        }
        out.row_estimates.push(v);
        if n_columns == 0 {
            break;
        }
        if z.get(pos) == Some(&b' ') {
            pos += 1;
        }
        if &z[pos..] == b"unordered" {
            out.unordered = true;
            break;
        }
        i += 1;
    }
    out
}

/// Reset every index to default estimates, then apply the persisted
/// statistics in `store`.
///
/// Rows naming unknown tables are ignored. A row naming an unknown index
/// still sets the table's row count. Internal `sqlite_` tables, views and
/// virtual tables never carry statistics. Overlapping histogram samples
/// are dropped rather than rejected.
pub fn load_analysis(catalog: &mut MemoryCatalog, store: &dyn StatsStore) -> StatsLoad {
    let names: Vec<String> = catalog.tables().map(|t| t.name.clone()).collect();
    for name in &names {
        if let Some(table) = catalog.table_mut(name) {
            let rows = table.row_estimate;
            for index in &mut table.indexes {
                let index = Arc::make_mut(index);
                index.set_default_row_estimates(rows);
                index.samples.clear();
            }
        }
    }

    let Some(stat1) = store.stat1() else {
        tracing::warn!(target: "whereplan.planner", "stats.stat1_missing");
        return StatsLoad::Unavailable;
    };

    let mut loaded = 0;
    for row in &stat1 {
        if !carries_stats(catalog, &row.table) {
            continue;
        }
        let Some(table) = catalog.table_mut(&row.table) else {
            continue;
        };
        let index = row.index.as_deref().and_then(|name| {
            table
                .indexes
                .iter()
                .position(|i| i.name.eq_ignore_ascii_case(name))
        });
        let n_columns = index.map_or(0, |i| table.indexes[i].n_columns());
        let parsed = parse_stat1(&row.stat, n_columns);
        if let Some(&rows) = parsed.row_estimates.first() {
            table.row_estimate = rows;
        }
        if row.index.is_some() && index.is_none() {
            tracing::debug!(
                target: "whereplan.planner",
                table = %row.table,
                index = row.index.as_deref().unwrap_or_default(),
                "stats.unknown_index"
            );
        }
        if let Some(i) = index {
            let idx = Arc::make_mut(&mut table.indexes[i]);
            for (slot, v) in idx.row_estimates.iter_mut().zip(&parsed.row_estimates) {
                *slot = *v;
            }
            idx.unordered = parsed.unordered;
            idx.avg_eq = idx.row_estimates.get(1).copied().unwrap_or(1);
            loaded += 1;
        }
    }

    if let Some(stat3) = store.stat3() {
        load_stat3(catalog, &stat3);
    }

    tracing::debug!(target: "whereplan.planner", indexes = loaded, "stats.loaded");
    StatsLoad::Loaded { indexes: loaded }
}

fn carries_stats(catalog: &MemoryCatalog, table: &str) -> bool {
    if table.len() >= 7 && table[..7].eq_ignore_ascii_case("sqlite_") {
        return false;
    }
    catalog
        .tables()
        .find(|t| t.name.eq_ignore_ascii_case(table))
        .is_some_and(|t| matches!(t.kind, TableKind::Ordinary))
}

fn load_stat3(catalog: &mut MemoryCatalog, rows: &[Stat3Row]) {
    let mut touched: Vec<(String, String)> = Vec::new();
    for row in rows {
        if !carries_stats(catalog, &row.table) {
            continue;
        }
        let Some(table) = catalog.table_mut(&row.table) else {
            continue;
        };
        let Some(index) = table
            .indexes
            .iter_mut()
            .find(|i| i.name.eq_ignore_ascii_case(&row.index))
        else {
            continue;
        };
        let index = Arc::make_mut(index);
        index.samples.push(IndexSample {
            value: row.sample.clone(),
            n_eq: row.n_eq,
            n_lt: row.n_lt,
            n_dlt: row.n_dlt,
        });
        let key = (row.table.to_ascii_lowercase(), index.name.clone());
        if !touched.contains(&key) {
            touched.push(key);
        }
    }

    for (table_name, index_name) in touched {
        let Some(table) = catalog.table_mut(&table_name) else {
            continue;
        };
        let Some(index) = table.indexes.iter_mut().find(|i| i.name == index_name) else {
            continue;
        };
        let index = Arc::make_mut(index);
        index.samples.sort_by_key(|s| s.n_lt);
        // A sample that starts inside the previous sample's run is dropped.
        let mut end = 0;
        let before = index.samples.len();
        index.samples.retain(|s| {
            let keep = s.n_lt >= end;
            if keep {
                end = s.n_lt + s.n_eq;
            }
            keep
        });
        if index.samples.len() < before {
            tracing::debug!(
                target: "whereplan.planner",
                table = %table_name,
                index = %index_name,
                dropped = before - index.samples.len(),
                "stats.overlapping_samples"
            );
        }
        index.samples.truncate(STAT3_SAMPLES);
        index.avg_eq = average_unsampled_eq(index);
    }
}

/// Average rows per key for keys that are not sampled.
fn average_unsampled_eq(index: &IndexDescriptor) -> u64 {
    let fallback = index.row_estimates.get(1).copied().unwrap_or(1);
    let Some((last, rest)) = index.samples.split_last() else {
        return fallback;
    };
    let avg = if last.n_dlt > 0 {
        let sum_eq: u64 = rest.iter().map(|s| s.n_eq).sum();
        last.n_lt.saturating_sub(sum_eq) / last.n_dlt
    } else {
        fallback
    };
    avg.max(1)
}

/// `sqlite_stat1` text for an index scan that saw `n_row` rows and
/// `distinct[i]` distinct values of the first `i + 1` key columns.
pub fn format_stat1(n_row: u64, distinct: &[u64], unordered: bool) -> String {
    let mut out = n_row.to_string();
    for &d in distinct {
        let avg = if d == 0 { 0 } else { (n_row + d - 1) / d };
        out.push(' ');
        out.push_str(&avg.to_string());
    }
    if unordered {
        out.push_str(" unordered");
    }
    out
}

// ---------------------------------------------------------------------------
// Sample accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct AccumSample {
    sample: SqliteValue,
    n_eq: u64,
    n_lt: u64,
    n_dlt: u64,
    periodic: bool,
    hash: u32,
}

/// Chooses which keys of an index scan become histogram samples.
///
/// Keys are pushed in index order, one call per distinct key. Every key
/// that crosses a multiple of `n_row / (max_samples / 3 + 1) + 1` rows is
/// kept as a periodic sample; the remaining slots go to the keys with the
/// most duplicates, with a pseudo-random hash breaking ties.
#[derive(Debug, Clone)]
pub struct Stat3Accumulator {
    n_periodic: u64,
    max_samples: usize,
    i_min: usize,
    prn: u32,
    samples: Vec<AccumSample>,
}

impl Stat3Accumulator {
    #[must_use]
    pub fn new(n_row: u64, max_samples: usize, seed: u32) -> Self {
        Self {
            n_periodic: n_row / (max_samples as u64 / 3 + 1) + 1,
            max_samples,
            i_min: 0,
            prn: seed,
            samples: Vec::with_capacity(max_samples),
        }
    }

    /// Offer one distinct key with its counts.
    pub fn push(&mut self, n_eq: u64, n_lt: u64, n_dlt: u64, sample: SqliteValue) {
        if n_eq == 0 || self.max_samples == 0 {
            return;
        }
        self.prn = self.prn.wrapping_mul(1_103_515_245).wrapping_add(12345);
        let h = self.prn;
        let periodic = n_lt / self.n_periodic != (n_eq + n_lt) / self.n_periodic;
        let full = self.samples.len() == self.max_samples;
        let insert = periodic
            || !full
            || self.samples.get(self.i_min).is_some_and(|min| {
                n_eq > min.n_eq || (n_eq == min.n_eq && h > min.hash)
            });
        if !insert {
            return;
        }
        if full {
            self.samples.remove(self.i_min);
        }
        self.samples.push(AccumSample {
            sample,
            n_eq,
            n_lt,
            n_dlt,
            periodic,
            hash: h,
        });
        if self.samples.len() == self.max_samples {
            self.i_min = self
                .samples
                .iter()
                .enumerate()
                .filter(|(_, s)| !s.periodic)
                .min_by(|(_, a), (_, b)| (a.n_eq, a.hash).cmp(&(b.n_eq, b.hash)))
                .map_or(0, |(i, _)| i);
        }
    }

    /// Number of samples currently held.
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// The retained samples as `sqlite_stat3` rows, in key order.
    pub fn finish(self, table: &str, index: &str) -> Vec<Stat3Row> {
        self.samples
            .into_iter()
            .map(|s| Stat3Row {
                table: table.to_owned(),
                index: index.to_owned(),
                n_eq: s.n_eq,
                n_lt: s.n_lt,
                n_dlt: s.n_dlt,
                sample: s.sample,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use whereplan_ast::{ColumnDescriptor, TableDescriptor};

    fn histogram_index() -> IndexDescriptor {
        let mut idx = IndexDescriptor::on_columns("i1", "t1", &[0], false);
        idx.row_estimates = vec![10, 2];
        idx.avg_eq = 2;
        idx.samples = vec![
            IndexSample {
                value: SqliteValue::Integer(10),
                n_eq: 2,
                n_lt: 0,
                n_dlt: 0,
            },
            IndexSample {
                value: SqliteValue::Integer(20),
                n_eq: 3,
                n_lt: 2,
                n_dlt: 1,
            },
        ];
        idx
    }

    #[test]
    fn test_estimate_log_steps() {
        assert!((estimate_log(1.0) - 1.0).abs() < f64::EPSILON);
        assert!((estimate_log(10.0) - 1.0).abs() < f64::EPSILON);
        assert!((estimate_log(11.0) - 2.0).abs() < f64::EPSILON);
        assert!((estimate_log(1_000_000.0) - 6.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_exact_sample_hit() {
        let reg = CollationRegistry::with_builtins();
        let k = key_stats(&histogram_index(), &SqliteValue::Integer(10), false, &reg)
            .expect("stats");
        assert_eq!(k, KeyStats { n_lt: 0, n_eq: 2 });
    }

    #[test]
    fn test_interpolation_between_samples() {
        let reg = CollationRegistry::with_builtins();
        let idx = histogram_index();
        let k = key_stats(&idx, &SqliteValue::Integer(15), false, &reg).expect("stats");
        assert!(k.n_lt > 0 && k.n_lt < 5);
        assert_eq!(k.n_eq, idx.avg_eq);

        let past_end = key_stats(&idx, &SqliteValue::Integer(99), true, &reg).expect("stats");
        assert_eq!(past_end.n_lt, 5 + (10 - 5) * 2 / 3);
    }

    #[test]
    fn test_missing_collation_is_an_error() {
        let reg = CollationRegistry::with_builtins();
        let mut idx = histogram_index();
        idx.columns[0].collation = Some("KLINGON".to_owned());
        idx.samples[1].value = SqliteValue::from("x");
        let err = key_stats(&idx, &SqliteValue::from("a"), false, &reg).expect_err("no coll");
        assert_eq!(err, PlanError::CollationNotFound {
            name: "KLINGON".to_owned()
        });
    }

    #[test]
    fn test_in_list_capped_at_half_table() {
        let reg = CollationRegistry::with_builtins();
        let idx = histogram_index();
        let values = vec![
            Some(SqliteValue::Integer(20)),
            Some(SqliteValue::Integer(20)),
        ];
        assert_eq!(estimate_in_list(&idx, &values, &reg).expect("est"), Some(5));
        let unknown = vec![Some(SqliteValue::Integer(1)), None];
        assert_eq!(estimate_in_list(&idx, &unknown, &reg).expect("est"), None);
    }

    #[test]
    fn test_range_divisor_without_samples() {
        let reg = CollationRegistry::with_builtins();
        let idx = IndexDescriptor::on_columns("i", "t", &[0], false);
        let bound = RangeBound {
            value: Some(SqliteValue::Integer(1)),
            inclusive: false,
            vnull: false,
        };
        let one = range_divisor(&idx, 0, TypeAffinity::Integer, Some(&bound), None, &reg)
            .expect("div");
        let two = range_divisor(&idx, 0, TypeAffinity::Integer, Some(&bound), Some(&bound), &reg)
            .expect("div");
        assert!((one - 4.0).abs() < f64::EPSILON);
        assert!((two - 16.0).abs() < f64::EPSILON);

        let vnull = RangeBound {
            value: Some(SqliteValue::Null),
            inclusive: false,
            vnull: true,
        };
        let d = range_divisor(&idx, 0, TypeAffinity::Integer, Some(&vnull), None, &reg)
            .expect("div");
        assert!((d - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_range_divisor_with_samples() {
        let reg = CollationRegistry::with_builtins();
        let idx = histogram_index();
        let lower = RangeBound {
            value: Some(SqliteValue::Integer(20)),
            inclusive: true,
            vnull: false,
        };
        let d = range_divisor(&idx, 0, TypeAffinity::Integer, Some(&lower), None, &reg)
            .expect("div");
        assert!((d - 10.0 / 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_stat1() {
        assert_eq!(parse_stat1("1000 10 1", 2), Stat1 {
            row_estimates: vec![1000, 10, 1],
            unordered: false
        });
        assert_eq!(parse_stat1("50 5 unordered", 2), Stat1 {
            row_estimates: vec![50, 5],
            unordered: true
        });
        assert_eq!(parse_stat1("77", 0).row_estimates, vec![77]);
        assert_eq!(parse_stat1("1 2 3 4 5", 1).row_estimates, vec![1, 2]);
    }

    #[test]
    fn test_format_stat1() {
        assert_eq!(format_stat1(1000, &[100, 1000], false), "1000 10 1");
        assert_eq!(format_stat1(10, &[3], true), "10 4 unordered");
    }

    fn catalog() -> MemoryCatalog {
        let mut cat = MemoryCatalog::new();
        let mut t = TableDescriptor::new("t1", vec![
            ColumnDescriptor::new("a", TypeAffinity::Integer),
            ColumnDescriptor::new("b", TypeAffinity::Integer),
        ]);
        t.indexes
            .push(Arc::new(IndexDescriptor::on_columns("i1", "t1", &[0, 1], false)));
        cat.insert(t);
        cat
    }

    #[test]
    fn test_load_without_stat1_is_unavailable() {
        let mut cat = catalog();
        let out = load_analysis(&mut cat, &MemoryStats::default());
        assert_eq!(out, StatsLoad::Unavailable);
        let t = cat.table_mut("t1").expect("table");
        assert_eq!(t.indexes[0].row_estimates, vec![1_000_000, 10, 9]);
    }

    #[test]
    fn test_load_stat1_and_stat3() {
        let mut cat = catalog();
        let store = MemoryStats {
            stat1: Some(vec![Stat1Row {
                table: "t1".to_owned(),
                index: Some("i1".to_owned()),
                stat: "1000 10 1".to_owned(),
            }]),
            stat3: Some(vec![
                Stat3Row {
                    table: "t1".to_owned(),
                    index: "i1".to_owned(),
                    n_eq: 30,
                    n_lt: 500,
                    n_dlt: 40,
                    sample: SqliteValue::Integer(50),
                },
                Stat3Row {
                    table: "t1".to_owned(),
                    index: "i1".to_owned(),
                    n_eq: 20,
                    n_lt: 100,
                    n_dlt: 9,
                    sample: SqliteValue::Integer(10),
                },
            ]),
        };
        let out = load_analysis(&mut cat, &store);
        assert_eq!(out, StatsLoad::Loaded { indexes: 1 });
        let t = cat.table_mut("t1").expect("table");
        assert_eq!(t.row_estimate, 1000);
        let idx = &t.indexes[0];
        assert_eq!(idx.row_estimates, vec![1000, 10, 1]);
        assert_eq!(idx.samples.len(), 2);
        assert_eq!(idx.samples[0].value, SqliteValue::Integer(10));
        assert_eq!(idx.avg_eq, (500 - 20) / 40);
    }

    #[test]
    fn test_unknown_index_row_still_sets_table_rows() {
        let mut cat = catalog();
        let store = MemoryStats {
            stat1: Some(vec![Stat1Row {
                table: "t1".to_owned(),
                index: Some("dropped_idx".to_owned()),
                stat: "4200 7".to_owned(),
            }]),
            stat3: None,
        };
        let out = load_analysis(&mut cat, &store);
        assert_eq!(out, StatsLoad::Loaded { indexes: 0 });
        let t = cat.table_mut("t1").expect("table");
        assert_eq!(t.row_estimate, 4200);
        assert_eq!(t.indexes[0].row_estimates, vec![1_000_000, 10, 9]);
    }

    #[test]
    fn test_overlapping_stat3_samples_are_dropped() {
        let mut cat = catalog();
        let sample = |n_eq, n_lt, n_dlt, key| Stat3Row {
            table: "t1".to_owned(),
            index: "i1".to_owned(),
            n_eq,
            n_lt,
            n_dlt,
            sample: SqliteValue::Integer(key),
        };
        let store = MemoryStats {
            stat1: Some(vec![Stat1Row {
                table: "t1".to_owned(),
                index: Some("i1".to_owned()),
                stat: "1000 10 1".to_owned(),
            }]),
            // The run of key 10 covers rows 100..150, so key 12 at 120 overlaps.
            stat3: Some(vec![
                sample(50, 100, 9, 10),
                sample(5, 120, 10, 12),
                sample(30, 500, 40, 50),
            ]),
        };
        let out = load_analysis(&mut cat, &store);
        assert_eq!(out, StatsLoad::Loaded { indexes: 1 });
        let t = cat.table_mut("t1").expect("table");
        let keys: Vec<_> = t.indexes[0].samples.iter().map(|s| s.value.clone()).collect();
        assert_eq!(keys, vec![SqliteValue::Integer(10), SqliteValue::Integer(50)]);
        assert_eq!(t.indexes[0].avg_eq, (500 - 50) / 40);
    }

    #[test]
    fn test_accumulator_keeps_heaviest_and_periodic() {
        let mut acc = Stat3Accumulator::new(100, 3, 7);
        let mut n_lt = 0;
        let mut n_dlt = 0;
        for (key, n_eq) in [(1, 1), (2, 40), (3, 1), (4, 1), (5, 50), (6, 7)] {
            acc.push(n_eq, n_lt, n_dlt, SqliteValue::Integer(key));
            n_lt += n_eq;
            n_dlt += 1;
        }
        assert_eq!(acc.len(), 3);
        let rows = acc.finish("t", "i");
        let keys: Vec<i64> = rows.iter().filter_map(|r| r.sample.as_integer()).collect();
        assert!(keys.contains(&2));
        assert!(keys.contains(&5));
        assert!(rows.windows(2).all(|w| w[0].n_lt < w[1].n_lt));
    }
}
