//! Control API Client
//!
//! Async client for the sentinel Control API. Each request uses a fresh REQ
//! socket, so a timed-out request never leaves the client stuck waiting
//! for a reply that will not come.

use anyhow::{Context, Result};
use rawflow_collector::SubTaskReport;
use rawflow_db::CheckpointState;
use rawflow_protocol::TaskInfo;
use std::time::Duration;
use zeromq::{ReqSocket, Socket, SocketRecv, SocketSend, ZmqMessage};

use crate::bridge::PluginInfo;
use crate::control::{ControlRequest, ControlResponse};
use crate::gate::GateStatus;

/// Default timeout for control API requests (5 seconds)
const DEFAULT_TIMEOUT_MS: u64 = rawflow_protocol::defaults::DEFAULT_REQUEST_TIMEOUT_MS;

/// Client for the sentinel Control API
#[derive(Debug, Clone)]
pub struct ControlClient {
    addr: String,
    timeout: Duration,
}

impl ControlClient {
    /// Client for the control API at the given address
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }

    /// Use a custom timeout. Subtask runs block until the run ends, so
    /// callers triggering them usually want a longer one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Send a request and receive a response
    pub async fn request(&self, req: &ControlRequest) -> Result<ControlResponse> {
        let req_bytes = serde_json::to_vec(req).context("Failed to serialize request")?;

        let exchange = async {
            let mut socket = ReqSocket::new();
            socket
                .connect(&self.addr)
                .await
                .with_context(|| format!("Failed to connect to control API at {}", self.addr))?;
            socket
                .send(ZmqMessage::from(req_bytes))
                .await
                .context("Failed to send request")?;
            let reply = socket.recv().await.context("Failed to receive response")?;
            let frames = reply.into_vec();
            let body = frames.last().context("Empty response")?;
            serde_json::from_slice::<ControlResponse>(body).context("Failed to parse response")
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .with_context(|| {
                format!(
                    "{} timed out after {:?} (is the sentinel running at {}?)",
                    req.name(),
                    self.timeout,
                    self.addr
                )
            })?
    }

    /// Ping the control API to check if it's alive
    pub async fn ping(&self) -> Result<bool> {
        match self.request(&ControlRequest::Ping).await? {
            ControlResponse::Pong => Ok(true),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("Ping failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to Ping"),
        }
    }

    /// Confirm pending migrations; returns the applied script names
    pub async fn confirm_migration(&self) -> Result<Vec<String>> {
        match self.request(&ControlRequest::ConfirmMigration).await? {
            ControlResponse::MigrationConfirmed { applied } => Ok(applied),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("ConfirmMigration failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to ConfirmMigration"),
        }
    }

    pub async fn migration_status(&self) -> Result<GateStatus> {
        match self.request(&ControlRequest::GetMigrationStatus).await? {
            ControlResponse::MigrationStatus(status) => Ok(status),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("GetMigrationStatus failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to GetMigrationStatus"),
        }
    }

    pub async fn list_plugins(&self) -> Result<Vec<PluginInfo>> {
        match self.request(&ControlRequest::ListPlugins).await? {
            ControlResponse::Plugins(plugins) => Ok(plugins),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("ListPlugins failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to ListPlugins"),
        }
    }

    /// Run one subtask and wait for its report
    pub async fn run_subtask(
        &self,
        plugin: &str,
        subtask: &str,
        task: TaskInfo,
    ) -> Result<SubTaskReport> {
        let req = ControlRequest::RunSubTask {
            plugin: plugin.to_string(),
            subtask: subtask.to_string(),
            task,
        };
        match self.request(&req).await? {
            ControlResponse::SubTaskResult(report) => Ok(report),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("RunSubTask failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to RunSubTask"),
        }
    }

    /// Run a whole plugin; reports stop at the first failed subtask
    pub async fn run_plugin(&self, plugin: &str, task: TaskInfo) -> Result<Vec<SubTaskReport>> {
        let req = ControlRequest::RunPlugin {
            plugin: plugin.to_string(),
            task,
        };
        match self.request(&req).await? {
            ControlResponse::PluginRunResult(reports) => Ok(reports),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("RunPlugin failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to RunPlugin"),
        }
    }

    pub async fn get_checkpoint(&self, params_key: &str) -> Result<Option<CheckpointState>> {
        let req = ControlRequest::GetCheckpoint {
            params_key: params_key.to_string(),
        };
        match self.request(&req).await? {
            ControlResponse::Checkpoint(state) => Ok(state),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("GetCheckpoint failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to GetCheckpoint"),
        }
    }

    pub async fn list_checkpoints(
        &self,
        plugin_name: &str,
        connection_id: &str,
    ) -> Result<Vec<CheckpointState>> {
        let req = ControlRequest::ListCheckpoints {
            plugin_name: plugin_name.to_string(),
            connection_id: connection_id.to_string(),
        };
        match self.request(&req).await? {
            ControlResponse::Checkpoints(states) => Ok(states),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("ListCheckpoints failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to ListCheckpoints"),
        }
    }

    /// Prometheus text for sentinel and collector counters
    pub async fn metrics(&self) -> Result<String> {
        match self.request(&ControlRequest::GetMetrics).await? {
            ControlResponse::Metrics { prometheus } => Ok(prometheus),
            ControlResponse::Error { code, message, .. } => {
                anyhow::bail!("GetMetrics failed [{}]: {}", code, message)
            }
            _ => anyhow::bail!("Unexpected response to GetMetrics"),
        }
    }
}
