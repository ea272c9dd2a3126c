//! EXPLAIN QUERY PLAN text.
//!
//! One line per loop, outermost first, in the classic
//! `level|from|detail` shape:
//!
//! ```text
//! 0|0|SEARCH TABLE t1 USING INDEX i1 (a=? AND b>?) (~10 rows)
//! 1|1|SCAN TABLE t2 (~100000 rows)
//! ```
//!
//! An OR-union level contributes one line per branch instead of its own.

use std::fmt;
use std::fmt::Write as _;

use serde::Serialize;
use whereplan_ast::{FromItem, TableDescriptor};
use whereplan_types::ROWID_COLUMN;

use crate::cost::{PlanFlags, PlanKind};
use crate::{DistinctMode, WhereFlags, WhereInfo, WhereLevel};

/// One line of query plan output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanLine {
    /// Nesting depth of the loop, 0 for the outermost.
    pub level: usize,
    /// Position of the scanned item in the FROM list.
    pub from: usize,
    pub detail: String,
}

/// The loop nest of a planned WHERE clause, as EXPLAIN QUERY PLAN shows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WherePlanSummary {
    pub scans: Vec<ScanLine>,
    /// ORDER BY was requested and the loops do not deliver it.
    pub temp_order_by: bool,
    /// DISTINCT was requested and the loops do not deliver it.
    pub temp_distinct: bool,
}

impl fmt::Display for WherePlanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in &self.scans {
            writeln!(f, "{}|{}|{}", line.level, line.from, line.detail)?;
        }
        if self.temp_order_by {
            writeln!(f, "USE TEMP B-TREE FOR ORDER BY")?;
        }
        if self.temp_distinct {
            writeln!(f, "USE TEMP B-TREE FOR DISTINCT")?;
        }
        Ok(())
    }
}

pub(crate) fn summarize(info: &WhereInfo<'_>) -> WherePlanSummary {
    let mut scans = Vec::with_capacity(info.levels.len());
    for (level, lvl) in info.levels.iter().enumerate() {
        if lvl.plan.flags.contains(PlanFlags::MULTI_OR) {
            scans.extend(lvl.or_branches.iter().map(|detail| ScanLine {
                level,
                from: lvl.from,
                detail: detail.clone(),
            }));
        } else {
            scans.push(ScanLine {
                level,
                from: lvl.from,
                detail: describe_level(info.src, lvl, info.flags),
            });
        }
    }
    WherePlanSummary {
        scans,
        temp_order_by: info.order_requested && !info.order_satisfied,
        temp_distinct: info.distinct_requested && info.distinct == DistinctMode::None,
    }
}

fn column_name(table: &TableDescriptor, column: i32) -> &str {
    if column == ROWID_COLUMN {
        return "rowid";
    }
    usize::try_from(column)
        .ok()
        .and_then(|c| table.columns.get(c))
        .map_or("rowid", |c| c.name.as_str())
}

/// ` (a=? AND b>?)`: the key columns an index scan is constrained on.
fn index_range(level: &WhereLevel, table: &TableDescriptor) -> String {
    let flags = level.plan.flags;
    let n_eq = level.plan.n_eq;
    let Some(index) = level.scan_index() else {
        return String::new();
    };
    if n_eq == 0 && !flags.intersects(PlanFlags::BOTH_LIMIT) {
        return String::new();
    }
    let mut terms: Vec<String> = index.columns[..n_eq.min(index.columns.len())]
        .iter()
        .map(|c| format!("{}=?", column_name(table, c.column)))
        .collect();
    let range = index
        .columns
        .get(n_eq)
        .map_or("rowid", |c| column_name(table, c.column));
    if flags.contains(PlanFlags::BTM_LIMIT) {
        terms.push(format!("{range}>?"));
    }
    if flags.contains(PlanFlags::TOP_LIMIT) {
        terms.push(format!("{range}<?"));
    }
    format!(" ({})", terms.join(" AND "))
}

/// Detail text of one loop.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn describe_level(src: &[FromItem], level: &WhereLevel, flags: WhereFlags) -> String {
    let plan = &level.plan;
    let pf = plan.flags;
    let table = &src[level.from].table;
    let min_query = flags.contains(WhereFlags::ORDERBY_MIN);
    let search = plan.n_eq > 0 || pf.intersects(PlanFlags::BOTH_LIMIT) || min_query;

    let mut out = format!(
        "{} TABLE {}",
        if search { "SEARCH" } else { "SCAN" },
        table.name
    );
    if pf.intersects(PlanFlags::INDEXED) {
        let temp = pf.contains(PlanFlags::TEMP_INDEX);
        let _ = write!(
            out,
            " USING {}{}INDEX",
            if temp { "AUTOMATIC " } else { "" },
            if pf.contains(PlanFlags::IDX_ONLY) { "COVERING " } else { "" },
        );
        if let (false, Some(index)) = (temp, plan.index()) {
            let _ = write!(out, " {}", index.name);
        }
        out.push_str(&index_range(level, table));
    } else if pf.intersects(PlanFlags::ROWID_EQ | PlanFlags::ROWID_RANGE) {
        out.push_str(" USING INTEGER PRIMARY KEY");
        if pf.contains(PlanFlags::ROWID_EQ) {
            out.push_str(" (rowid=?)");
        } else if pf.contains(PlanFlags::BOTH_LIMIT) {
            out.push_str(" (rowid>? AND rowid<?)");
        } else if pf.contains(PlanFlags::BTM_LIMIT) {
            out.push_str(" (rowid>?)");
        } else if pf.contains(PlanFlags::TOP_LIMIT) {
            out.push_str(" (rowid<?)");
        }
    } else if let PlanKind::Virtual(v) = &plan.kind {
        let _ = write!(
            out,
            " VIRTUAL TABLE INDEX {}:{}",
            v.info.idx_num,
            v.info.idx_str.as_deref().unwrap_or("")
        );
    }
    let rows = if min_query { 1 } else { plan.n_row as i64 };
    let _ = write!(out, " (~{rows} rows)");
    out
}
