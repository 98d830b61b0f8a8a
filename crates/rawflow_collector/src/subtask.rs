//! SubTask metadata and runner.

use async_trait::async_trait;
use rawflow_protocol::{
    InvokeOutcome, RemoteFailure, SubTaskDescriptor, SubTaskStatus, TaskInfo,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{error, info, info_span, Instrument, Span};

use crate::cancel::CancellationToken;
use crate::error::{CollectError, Result};
use crate::metrics::METRICS;

/// Read-only context handed to an entry point.
#[derive(Clone)]
pub struct SubTaskContext {
    pub task: Arc<TaskInfo>,
    pub subtask: String,
    pub cancel: CancellationToken,
    /// Span carrying task id, plugin and subtask; entry points log inside it
    pub span: Span,
}

impl SubTaskContext {
    pub fn options(&self) -> &serde_json::Value {
        &self.task.options
    }
}

/// A unit of pipeline work. Entry points carry their own collaborators
/// (collector, API client) and only read from the context.
#[async_trait]
pub trait SubTask: Send + Sync {
    async fn run(&self, ctx: &SubTaskContext) -> Result<()>;
}

/// Registered once per plugin at load time.
#[derive(Clone)]
pub struct SubTaskMeta {
    pub name: String,
    pub entry_point: Arc<dyn SubTask>,
    pub enabled_by_default: bool,
    pub description: String,
    pub domain_types: BTreeSet<String>,
}

impl SubTaskMeta {
    /// Enabled by default, no description or domain tags.
    pub fn new(name: impl Into<String>, entry_point: Arc<dyn SubTask>) -> Self {
        Self {
            name: name.into(),
            entry_point,
            enabled_by_default: true,
            description: String::new(),
            domain_types: BTreeSet::new(),
        }
    }

    pub fn disabled_by_default(mut self) -> Self {
        self.enabled_by_default = false;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_domain_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.domain_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Data half, as declared over the bridge.
    pub fn descriptor(&self) -> SubTaskDescriptor {
        SubTaskDescriptor {
            name: self.name.clone(),
            enabled_by_default: self.enabled_by_default,
            description: self.description.clone(),
            domain_types: self.domain_types.clone(),
        }
    }
}

impl fmt::Debug for SubTaskMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubTaskMeta")
            .field("name", &self.name)
            .field("enabled_by_default", &self.enabled_by_default)
            .field("domain_types", &self.domain_types)
            .finish_non_exhaustive()
    }
}

/// What the runner reports for every subtask it was asked to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskReport {
    pub task_id: String,
    pub plugin_name: String,
    pub subtask: String,
    pub status: SubTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
    pub duration_ms: u64,
}

impl SubTaskReport {
    /// Rebuild a report from an outcome returned over the bridge.
    pub fn from_outcome(task: &TaskInfo, subtask: &str, outcome: InvokeOutcome) -> Self {
        Self {
            task_id: task.task_id.clone(),
            plugin_name: task.plugin_name.clone(),
            subtask: subtask.to_string(),
            status: outcome.status,
            error: outcome.error,
            duration_ms: outcome.duration_ms,
        }
    }

    /// Report for a subtask that never ran because dispatch itself failed.
    pub fn dispatch_failed(task: &TaskInfo, subtask: &str, err: &CollectError) -> Self {
        Self {
            task_id: task.task_id.clone(),
            plugin_name: task.plugin_name.clone(),
            subtask: subtask.to_string(),
            status: SubTaskStatus::Failed,
            error: Some(err.to_remote()),
            duration_ms: 0,
        }
    }

    pub fn outcome(&self) -> InvokeOutcome {
        InvokeOutcome {
            status: self.status,
            error: self.error.clone(),
            duration_ms: self.duration_ms,
        }
    }
}

/// Dispatches entry points, logs start and failure, and forwards a report
/// per run to the orchestrator's channel. Never retries.
#[derive(Debug, Clone, Default)]
pub struct SubTaskRunner {
    reports: Option<mpsc::UnboundedSender<SubTaskReport>>,
}

impl SubTaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reporter(reports: mpsc::UnboundedSender<SubTaskReport>) -> Self {
        Self {
            reports: Some(reports),
        }
    }

    /// Run one subtask. Disabled subtasks are reported as skipped and their
    /// entry point is not called.
    pub async fn run(
        &self,
        task: &TaskInfo,
        meta: &SubTaskMeta,
        cancel: &CancellationToken,
    ) -> SubTaskReport {
        let start = Instant::now();
        let span = info_span!(
            "subtask",
            task_id = %task.task_id,
            plugin = %task.plugin_name,
            subtask = %meta.name
        );

        let (status, error) = if !task.is_enabled(&meta.descriptor()) {
            span.in_scope(|| info!("Subtask disabled, skipping"));
            METRICS.inc_subtasks_skipped();
            (SubTaskStatus::Skipped, None)
        } else {
            let ctx = SubTaskContext {
                task: Arc::new(task.clone()),
                subtask: meta.name.clone(),
                cancel: cancel.clone(),
                span: span.clone(),
            };
            let entry_point = Arc::clone(&meta.entry_point);
            async {
                info!("Subtask started");
                match entry_point.run(&ctx).await {
                    Ok(()) => {
                        METRICS.inc_subtasks_completed();
                        info!(elapsed_ms = start.elapsed().as_millis() as u64, "Subtask completed");
                        (SubTaskStatus::Completed, None)
                    }
                    Err(err) => {
                        METRICS.inc_subtasks_failed();
                        error!(kind = %err.kind(), error = %err, "Subtask failed");
                        (SubTaskStatus::Failed, Some(err.to_remote()))
                    }
                }
            }
            .instrument(span)
            .await
        };

        let report = SubTaskReport {
            task_id: task.task_id.clone(),
            plugin_name: task.plugin_name.clone(),
            subtask: meta.name.clone(),
            status,
            error,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        if let Some(reports) = &self.reports {
            // A closed channel only means nobody listens anymore.
            let _ = reports.send(report.clone());
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rawflow_protocol::CollectErrorKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SubTask for Counting {
        async fn run(&self, ctx: &SubTaskContext) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(ctx.subtask, "collectWorklogs");
            if self.fail {
                Err(CollectError::UpstreamUnavailable("503".into()))
            } else {
                Ok(())
            }
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn completed_subtask_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let runner = SubTaskRunner::with_reporter(tx);
        let entry = counting(false);
        let meta = SubTaskMeta::new("collectWorklogs", entry.clone());

        let report = runner
            .run(&TaskInfo::new("t-1", "tapd"), &meta, &CancellationToken::new())
            .await;

        assert_eq!(report.status, SubTaskStatus::Completed);
        assert_eq!(entry.calls.load(Ordering::SeqCst), 1);
        assert_eq!(rx.recv().await.unwrap(), report);
    }

    #[tokio::test]
    async fn disabled_subtask_is_skipped_not_failed() {
        let runner = SubTaskRunner::new();
        let entry = counting(true);
        let meta = SubTaskMeta::new("collectWorklogs", entry.clone()).disabled_by_default();

        let report = runner
            .run(&TaskInfo::new("t-1", "tapd"), &meta, &CancellationToken::new())
            .await;

        assert_eq!(report.status, SubTaskStatus::Skipped);
        assert!(report.error.is_none());
        assert_eq!(entry.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn explicit_override_enables_disabled_subtask() {
        let runner = SubTaskRunner::new();
        let entry = counting(false);
        let meta = SubTaskMeta::new("collectWorklogs", entry.clone()).disabled_by_default();
        let task = TaskInfo::new("t-1", "tapd").with_override("collectWorklogs", true);

        let report = runner.run(&task, &meta, &CancellationToken::new()).await;
        assert_eq!(report.status, SubTaskStatus::Completed);
    }

    #[tokio::test]
    async fn failure_carries_error_kind() {
        let runner = SubTaskRunner::new();
        let meta = SubTaskMeta::new("collectWorklogs", counting(true));

        let report = runner
            .run(&TaskInfo::new("t-1", "tapd"), &meta, &CancellationToken::new())
            .await;

        assert_eq!(report.status, SubTaskStatus::Failed);
        let outcome = report.outcome();
        assert_eq!(
            outcome.error.unwrap().kind,
            CollectErrorKind::UpstreamUnavailable
        );
    }
}
