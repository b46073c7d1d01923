//! Metrics for monitoring unmerge runs.
//!
//! Counters track work done by pages (events inspected, events moved,
//! destinations opened) and the lifecycle of runs. A gauge tracks runs in
//! flight. Everything is lock-free except label registration.
//!
//! # Example
//!
//! ```rust
//! use unmerge::metrics::UnmergeMetrics;
//!
//! let metrics = UnmergeMetrics::new();
//! metrics.record_page(500, 120);
//! metrics.record_run_started();
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.events_moved, 120);
//! assert_eq!(snapshot.active_runs, 1);
//! ```

mod counters;
mod gauges;

pub use counters::{Counter, LabeledCounter};
pub use gauges::Gauge;

use crate::error::Error;
use std::fmt::Write;

/// Metrics of one unmerge worker.
#[derive(Debug)]
pub struct UnmergeMetrics {
    // Page work
    /// Pages that completed successfully.
    pub pages_processed: Counter,
    /// Events fetched from the source.
    pub events_inspected: Counter,
    /// Events routed to a destination.
    pub events_moved: Counter,
    /// Destination groups opened.
    pub destinations_created: Counter,
    /// Stream snapshots closed at the end of a run.
    pub streams_closed: Counter,
    /// Activity records written.
    pub activities_recorded: Counter,

    // Retries and failures
    /// Page attempts re-run after a retryable failure.
    pub page_retries: Counter,
    /// Failed page attempts by error kind.
    pub page_failures: LabeledCounter<1>,

    // Runs
    /// Runs accepted.
    pub runs_started: Counter,
    /// Runs that reached the terminal state.
    pub runs_completed: Counter,
    /// Runs abandoned after a fatal error or exhausted retries.
    pub runs_failed: Counter,
    /// Runs in flight.
    pub active_runs: Gauge,
}

impl UnmergeMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self {
            pages_processed: Counter::new("unmerge_pages_total", "Pages processed"),
            events_inspected: Counter::new(
                "unmerge_events_inspected_total",
                "Events fetched from source groups",
            ),
            events_moved: Counter::new(
                "unmerge_events_moved_total",
                "Events routed to destination groups",
            ),
            destinations_created: Counter::new(
                "unmerge_destinations_total",
                "Destination groups opened",
            ),
            streams_closed: Counter::new("unmerge_streams_closed_total", "Stream snapshots closed"),
            activities_recorded: Counter::new(
                "unmerge_activities_total",
                "Activity records written",
            ),
            page_retries: Counter::new("unmerge_page_retries_total", "Page attempts retried"),
            page_failures: LabeledCounter::new(
                "unmerge_page_failures_total",
                "Failed page attempts by error kind",
                ["kind"],
            ),
            runs_started: Counter::new("unmerge_runs_started_total", "Runs accepted"),
            runs_completed: Counter::new("unmerge_runs_completed_total", "Runs completed"),
            runs_failed: Counter::new("unmerge_runs_failed_total", "Runs failed"),
            active_runs: Gauge::new("unmerge_active_runs", "Runs in flight"),
        }
    }

    /// Record a successful page.
    pub fn record_page(&self, inspected: u64, moved: u64) {
        self.pages_processed.inc();
        self.events_inspected.inc_by(inspected);
        self.events_moved.inc_by(moved);
    }

    /// Record a failed page attempt.
    pub fn record_page_failure(&self, error: &Error) {
        self.page_failures.inc([error.kind()]);
    }

    pub fn record_run_started(&self) {
        self.runs_started.inc();
        self.active_runs.inc();
    }

    pub fn record_run_completed(&self) {
        self.runs_completed.inc();
        self.active_runs.dec();
    }

    pub fn record_run_failed(&self) {
        self.runs_failed.inc();
        self.active_runs.dec();
    }

    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_processed: self.pages_processed.get(),
            events_inspected: self.events_inspected.get(),
            events_moved: self.events_moved.get(),
            destinations_created: self.destinations_created.get(),
            streams_closed: self.streams_closed.get(),
            activities_recorded: self.activities_recorded.get(),
            page_retries: self.page_retries.get(),
            runs_started: self.runs_started.get(),
            runs_completed: self.runs_completed.get(),
            runs_failed: self.runs_failed.get(),
            active_runs: self.active_runs.get(),
        }
    }

    /// Prometheus text exposition.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        for counter in [
            &self.pages_processed,
            &self.events_inspected,
            &self.events_moved,
            &self.destinations_created,
            &self.streams_closed,
            &self.activities_recorded,
            &self.page_retries,
            &self.runs_started,
            &self.runs_completed,
            &self.runs_failed,
        ] {
            let _ = write!(
                out,
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n",
                name = counter.name(),
                help = counter.help(),
                value = counter.get()
            );
        }

        let failures = &self.page_failures;
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} counter\n",
            name = failures.name(),
            help = failures.help()
        );
        for ([kind], value) in failures.get_all() {
            let _ = writeln!(
                out,
                "{}{{{}=\"{kind}\"}} {value}",
                failures.name(),
                failures.label_names()[0]
            );
        }

        let gauge = &self.active_runs;
        let _ = write!(
            out,
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n",
            name = gauge.name(),
            help = gauge.help(),
            value = gauge.get()
        );
        out
    }
}

impl Default for UnmergeMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// A snapshot of unmerge metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pages_processed: u64,
    pub events_inspected: u64,
    pub events_moved: u64,
    pub destinations_created: u64,
    pub streams_closed: u64,
    pub activities_recorded: u64,
    pub page_retries: u64,
    pub runs_started: u64,
    pub runs_completed: u64,
    pub runs_failed: u64,
    pub active_runs: i64,
}

impl MetricsSnapshot {
    /// Fraction of inspected events that moved.
    pub fn move_ratio(&self) -> f64 {
        if self.events_inspected == 0 {
            0.0
        } else {
            self.events_moved as f64 / self.events_inspected as f64
        }
    }
}
