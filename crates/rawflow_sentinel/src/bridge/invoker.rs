//! Outbound invocation of remote subtasks.

use rawflow_collector::{CollectError, SubTaskReport};
use rawflow_protocol::transport;
use rawflow_protocol::{InvokeOutcome, InvokeRequest, Message, OpCode, ProtocolError, TaskInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::registry::RemoteHandle;
use crate::metrics::METRICS;

/// Sends `Invoke` to a plugin endpoint and waits for `Conclude`.
///
/// Never retries: a transport failure comes back as
/// [`CollectError::BridgeUnavailable`] and the caller decides.
#[derive(Debug, Clone)]
pub struct RemoteInvoker {
    timeout: Duration,
    next_correlation: Arc<AtomicU64>,
}

impl RemoteInvoker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_correlation: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Run one remote subtask and return the plugin's outcome as-is.
    pub async fn invoke(
        &self,
        handle: &RemoteHandle,
        task: &TaskInfo,
    ) -> Result<InvokeOutcome, CollectError> {
        let correlation_id = self.next_correlation.fetch_add(1, Ordering::Relaxed);
        let request = InvokeRequest {
            subtask: handle.subtask.name.clone(),
            task: task.clone(),
        };
        let msg = Message::json(OpCode::Invoke, correlation_id, &request)
            .map_err(|e| CollectError::InvalidParams(e.to_string()))?;

        METRICS.inc_invocations();
        debug!(
            plugin = %handle.plugin_name,
            subtask = %handle.subtask.name,
            endpoint = %handle.endpoint,
            correlation_id,
            "Invoking remote subtask"
        );

        let reply =
            transport::request_expecting(&handle.endpoint, &msg, OpCode::Conclude, self.timeout)
                .await
                .map_err(|e| self.classify(handle, e))?;
        reply.decode::<InvokeOutcome>().map_err(|e| self.classify(handle, e))
    }

    /// [`invoke`](Self::invoke) folded into a runner report; failures of
    /// any kind end up in the report rather than an `Err`.
    pub async fn invoke_report(&self, handle: &RemoteHandle, task: &TaskInfo) -> SubTaskReport {
        match self.invoke(handle, task).await {
            Ok(outcome) => SubTaskReport::from_outcome(task, &handle.subtask.name, outcome),
            Err(err) => SubTaskReport::dispatch_failed(task, &handle.subtask.name, &err),
        }
    }

    fn classify(&self, handle: &RemoteHandle, err: ProtocolError) -> CollectError {
        METRICS.inc_invocation_failures();
        warn!(
            plugin = %handle.plugin_name,
            subtask = %handle.subtask.name,
            endpoint = %handle.endpoint,
            error = %err,
            "Remote invocation failed"
        );
        match err {
            // The plugin answered, but refused the call.
            ProtocolError::Rejected { code, message } => {
                CollectError::SubTaskFailed(format!("[{code}] {message}"))
            }
            other => CollectError::BridgeUnavailable(format!(
                "{} ({}): {}",
                handle.plugin_name, handle.endpoint, other
            )),
        }
    }
}
