//! Collector counters.
//!
//! Lock-free atomics, read through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Global collector metrics
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    pub pages_fetched: AtomicU64,
    pub records_written: AtomicU64,
    pub records_invalidated: AtomicU64,
    pub runs_committed: AtomicU64,
    pub runs_failed: AtomicU64,
    pub runs_already_running: AtomicU64,
    pub runs_cancelled: AtomicU64,
    pub subtasks_completed: AtomicU64,
    pub subtasks_skipped: AtomicU64,
    pub subtasks_failed: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            pages_fetched: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            records_invalidated: AtomicU64::new(0),
            runs_committed: AtomicU64::new(0),
            runs_failed: AtomicU64::new(0),
            runs_already_running: AtomicU64::new(0),
            runs_cancelled: AtomicU64::new(0),
            subtasks_completed: AtomicU64::new(0),
            subtasks_skipped: AtomicU64::new(0),
            subtasks_failed: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_pages_fetched(&self) {
        self.pages_fetched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_records_written(&self, n: u64) {
        self.records_written.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_records_invalidated(&self, n: u64) {
        self.records_invalidated.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_runs_committed(&self) {
        self.runs_committed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_runs_failed(&self) {
        self.runs_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_runs_already_running(&self) {
        self.runs_already_running.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_runs_cancelled(&self) {
        self.runs_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_subtasks_completed(&self) {
        self.subtasks_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_subtasks_skipped(&self) {
        self.subtasks_skipped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_subtasks_failed(&self) {
        self.subtasks_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_fetched: self.pages_fetched.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            records_invalidated: self.records_invalidated.load(Ordering::Relaxed),
            runs_committed: self.runs_committed.load(Ordering::Relaxed),
            runs_failed: self.runs_failed.load(Ordering::Relaxed),
            runs_already_running: self.runs_already_running.load(Ordering::Relaxed),
            runs_cancelled: self.runs_cancelled.load(Ordering::Relaxed),
            subtasks_completed: self.subtasks_completed.load(Ordering::Relaxed),
            subtasks_skipped: self.subtasks_skipped.load(Ordering::Relaxed),
            subtasks_failed: self.subtasks_failed.load(Ordering::Relaxed),
        }
    }

    /// Format as Prometheus exposition format
    pub fn prometheus_format(&self) -> String {
        self.snapshot().prometheus_format()
    }
}

/// Immutable snapshot of collector metrics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub pages_fetched: u64,
    pub records_written: u64,
    pub records_invalidated: u64,
    pub runs_committed: u64,
    pub runs_failed: u64,
    pub runs_already_running: u64,
    pub runs_cancelled: u64,
    pub subtasks_completed: u64,
    pub subtasks_skipped: u64,
    pub subtasks_failed: u64,
}

impl MetricsSnapshot {
    fn counters(&self) -> [(&'static str, &'static str, u64); 10] {
        [
            ("rawflow_pages_fetched_total", "Pages fetched from upstream APIs", self.pages_fetched),
            ("rawflow_records_written_total", "Raw records appended", self.records_written),
            ("rawflow_records_invalidated_total", "Raw records invalidated by full runs", self.records_invalidated),
            ("rawflow_runs_committed_total", "Collection runs that committed a checkpoint", self.runs_committed),
            ("rawflow_runs_failed_total", "Collection runs that failed", self.runs_failed),
            ("rawflow_runs_already_running_total", "Collection runs rejected by the run guard", self.runs_already_running),
            ("rawflow_runs_cancelled_total", "Collection runs cancelled", self.runs_cancelled),
            ("rawflow_subtasks_completed_total", "Subtasks completed", self.subtasks_completed),
            ("rawflow_subtasks_skipped_total", "Subtasks skipped as disabled", self.subtasks_skipped),
            ("rawflow_subtasks_failed_total", "Subtasks failed", self.subtasks_failed),
        ]
    }

    pub fn prometheus_format(&self) -> String {
        let mut out = String::new();
        for (name, help, value) in self.counters() {
            out.push_str(&format!(
                "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n\n"
            ));
        }
        out
    }

    pub fn summary(&self) -> String {
        format!(
            "Runs: {} committed, {} failed, {} already running, {} cancelled | \
             Pages: {} | Records: {} written, {} invalidated",
            self.runs_committed,
            self.runs_failed,
            self.runs_already_running,
            self.runs_cancelled,
            self.pages_fetched,
            self.records_written,
            self.records_invalidated,
        )
    }
}
