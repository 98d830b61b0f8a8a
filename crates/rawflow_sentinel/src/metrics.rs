//! Sentinel counters.
//!
//! In-memory counters for the sentinel: bridge traffic, gate rejections and
//! control requests. Lock-free atomics, exported in Prometheus text format.

use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide counters shared by the bridge, gate and control API.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    // Bridge counters
    pub plugins_registered: AtomicU64,
    pub plugins_replaced: AtomicU64,
    pub plugins_unregistered: AtomicU64,
    pub plugins_reaped: AtomicU64,
    pub heartbeats: AtomicU64,
    pub invocations: AtomicU64,
    pub invocation_failures: AtomicU64,
    pub bootstrap_failures: AtomicU64,

    // Request counters
    pub control_requests: AtomicU64,
    pub gate_rejections: AtomicU64,
    pub protocol_errors: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            plugins_registered: AtomicU64::new(0),
            plugins_replaced: AtomicU64::new(0),
            plugins_unregistered: AtomicU64::new(0),
            plugins_reaped: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            invocations: AtomicU64::new(0),
            invocation_failures: AtomicU64::new(0),
            bootstrap_failures: AtomicU64::new(0),
            control_requests: AtomicU64::new(0),
            gate_rejections: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn inc_plugins_registered(&self) {
        self.plugins_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_plugins_replaced(&self) {
        self.plugins_replaced.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_plugins_unregistered(&self) {
        self.plugins_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_plugins_reaped(&self) {
        self.plugins_reaped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_heartbeats(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_invocations(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_invocation_failures(&self) {
        self.invocation_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_bootstrap_failures(&self) {
        self.bootstrap_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_control_requests(&self) {
        self.control_requests.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_gate_rejections(&self) {
        self.gate_rejections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            plugins_registered: self.plugins_registered.load(Ordering::Relaxed),
            plugins_replaced: self.plugins_replaced.load(Ordering::Relaxed),
            plugins_unregistered: self.plugins_unregistered.load(Ordering::Relaxed),
            plugins_reaped: self.plugins_reaped.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            invocations: self.invocations.load(Ordering::Relaxed),
            invocation_failures: self.invocation_failures.load(Ordering::Relaxed),
            bootstrap_failures: self.bootstrap_failures.load(Ordering::Relaxed),
            control_requests: self.control_requests.load(Ordering::Relaxed),
            gate_rejections: self.gate_rejections.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
        }
    }

    /// Prometheus text exposition (version 0.0.4).
    pub fn prometheus_format(&self) -> String {
        let s = self.snapshot();
        format!(
            r#"# HELP rawflow_plugins_registered_total Remote plugins registered
# TYPE rawflow_plugins_registered_total counter
rawflow_plugins_registered_total {}

# HELP rawflow_plugins_replaced_total Registrations that replaced an existing plugin
# TYPE rawflow_plugins_replaced_total counter
rawflow_plugins_replaced_total {}

# HELP rawflow_plugins_unregistered_total Remote plugins that unregistered
# TYPE rawflow_plugins_unregistered_total counter
rawflow_plugins_unregistered_total {}

# HELP rawflow_plugins_reaped_total Remote plugins removed after heartbeat timeout
# TYPE rawflow_plugins_reaped_total counter
rawflow_plugins_reaped_total {}

# HELP rawflow_heartbeats_total Plugin heartbeats received
# TYPE rawflow_heartbeats_total counter
rawflow_heartbeats_total {}

# HELP rawflow_invocations_total Remote subtask invocations sent
# TYPE rawflow_invocations_total counter
rawflow_invocations_total {}

# HELP rawflow_invocation_failures_total Remote invocations without a valid outcome
# TYPE rawflow_invocation_failures_total counter
rawflow_invocation_failures_total {}

# HELP rawflow_bootstrap_failures_total Launchers that did not acknowledge bootstrap
# TYPE rawflow_bootstrap_failures_total counter
rawflow_bootstrap_failures_total {}

# HELP rawflow_control_requests_total Control API requests received
# TYPE rawflow_control_requests_total counter
rawflow_control_requests_total {}

# HELP rawflow_gate_rejections_total Requests rejected by the migration gate
# TYPE rawflow_gate_rejections_total counter
rawflow_gate_rejections_total {}

# HELP rawflow_protocol_errors_total Malformed messages received
# TYPE rawflow_protocol_errors_total counter
rawflow_protocol_errors_total {}
"#,
            s.plugins_registered,
            s.plugins_replaced,
            s.plugins_unregistered,
            s.plugins_reaped,
            s.heartbeats,
            s.invocations,
            s.invocation_failures,
            s.bootstrap_failures,
            s.control_requests,
            s.gate_rejections,
            s.protocol_errors,
        )
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub plugins_registered: u64,
    pub plugins_replaced: u64,
    pub plugins_unregistered: u64,
    pub plugins_reaped: u64,
    pub heartbeats: u64,
    pub invocations: u64,
    pub invocation_failures: u64,
    pub bootstrap_failures: u64,
    pub control_requests: u64,
    pub gate_rejections: u64,
    pub protocol_errors: u64,
}

impl MetricsSnapshot {
    /// One-line summary for shutdown logs.
    pub fn summary(&self) -> String {
        format!(
            "Plugins: {} registered, {} replaced, {} reaped | \
             Invocations: {} sent, {} failed | \
             Control: {} requests, {} gated",
            self.plugins_registered,
            self.plugins_replaced,
            self.plugins_reaped,
            self.invocations,
            self.invocation_failures,
            self.control_requests,
            self.gate_rejections,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();
        metrics.inc_invocations();
        metrics.inc_invocations();
        metrics.inc_invocation_failures();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.invocations, 2);
        assert_eq!(snapshot.invocation_failures, 1);
        assert!(snapshot.summary().contains("2 sent, 1 failed"));
    }

    #[test]
    fn test_prometheus_format() {
        let metrics = Metrics::new();
        metrics.inc_gate_rejections();
        let output = metrics.prometheus_format();
        assert!(output.contains("rawflow_gate_rejections_total 1"));
    }
}
