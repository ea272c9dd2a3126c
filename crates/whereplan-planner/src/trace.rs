//! Structured planner events.
//!
//! The cost model and the scan generator report what they considered and
//! what they chose through [`PlanEventSink`]. With no sink installed the
//! planner never builds an event, so the hooks cost a branch and nothing
//! else.

use serde::Serialize;

use crate::bitmask::Bitmask;

/// One observation made while planning.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PlanEvent {
    /// A term was added to a WHERE clause during decomposition.
    TermAnalyzed {
        index: usize,
        expr: String,
        operator: u16,
        prereq_right: Bitmask,
        prereq_all: Bitmask,
        synthetic: bool,
    },
    /// A candidate access path was costed.
    Candidate {
        table: String,
        index: Option<String>,
        n_eq: usize,
        rows: f64,
        cost: f64,
        not_ready: Bitmask,
    },
    /// The best plan for one table at one join position.
    BestPlan {
        table: String,
        plan: String,
        rows: f64,
        cost: f64,
    },
    /// A table was assigned to a nesting level.
    LevelChosen {
        level: usize,
        table: String,
        plan: String,
        optimal_pass: bool,
    },
    /// Statistics were missing and defaults were used.
    StatsDefaulted { table: String },
    /// Code generation for a level finished.
    LevelCoded {
        level: usize,
        first_addr: usize,
        last_addr: usize,
    },
}

/// Receiver for [`PlanEvent`]s.
pub trait PlanEventSink {
    fn record(&mut self, event: PlanEvent);
}

/// Sink that keeps every event in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    events: Vec<PlanEvent>,
}

impl RecordingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events in the order they were recorded.
    pub fn events(&self) -> &[PlanEvent] {
        &self.events
    }

    /// Number of recorded events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Render the events as JSON lines.
    pub fn to_json_lines(&self) -> serde_json::Result<String> {
        let mut out = String::new();
        for event in &self.events {
            out.push_str(&serde_json::to_string(event)?);
            out.push('\n');
        }
        Ok(out)
    }
}

impl PlanEventSink for RecordingSink {
    fn record(&mut self, event: PlanEvent) {
        self.events.push(event);
    }
}

/// Optional sink threaded through a compilation.
///
/// `emit` takes a closure so the event is only built when someone listens.
pub(crate) struct EventHook<'s> {
    sink: Option<&'s mut dyn PlanEventSink>,
}

impl<'s> EventHook<'s> {
    pub(crate) fn new(sink: Option<&'s mut dyn PlanEventSink>) -> Self {
        Self { sink }
    }

    pub(crate) fn none() -> Self {
        Self { sink: None }
    }

    pub(crate) fn enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub(crate) fn emit(&mut self, build: impl FnOnce() -> PlanEvent) {
        if let Some(sink) = self.sink.as_deref_mut() {
            sink.record(build());
        }
    }
}
