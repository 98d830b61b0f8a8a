//! Protocol payload types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Version of the plugin registration protocol. Registrations carrying any
/// other version are rejected by the sentinel.
pub const PLUGIN_PROTOCOL_VERSION: u32 = 1;

/// Domain tags a subtask can declare.
pub mod domain_types {
    pub const CODE: &str = "CODE";
    pub const TICKET: &str = "TICKET";
    pub const CODE_REVIEW: &str = "CODEREVIEW";
    pub const CICD: &str = "CICD";
    pub const CROSS: &str = "CROSS";
    pub const CODE_QUALITY: &str = "CODEQUALITY";
}

// ----------------------------------------------------------------------------
// Shared enums
// ----------------------------------------------------------------------------

/// Failure taxonomy for collection and dispatch.
/// This is the CANONICAL definition - collector, sentinel and plugin hosts
/// all report failures with these kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CollectErrorKind {
    /// Upstream API failed after the client exhausted its retries
    UpstreamUnavailable,
    /// Response parser rejected the payload (never retried)
    MalformedResponse,
    /// Another run for the same collection params is in flight
    AlreadyRunning,
    /// RPC transport failure towards a remote plugin
    BridgeUnavailable,
    /// A schema migration is awaiting operator confirmation
    MigrationPending,
    /// The last migration attempt failed
    MigrationFailed,
    /// The run was cancelled
    Cancelled,
    /// Checkpoint or raw storage failure
    Storage,
    /// Invalid collection params or connector configuration
    InvalidParams,
    /// A subtask entry point returned an error outside the taxonomy above
    SubTaskFailed,
}

impl CollectErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CollectErrorKind::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            CollectErrorKind::MalformedResponse => "MALFORMED_RESPONSE",
            CollectErrorKind::AlreadyRunning => "ALREADY_RUNNING",
            CollectErrorKind::BridgeUnavailable => "BRIDGE_UNAVAILABLE",
            CollectErrorKind::MigrationPending => "MIGRATION_PENDING",
            CollectErrorKind::MigrationFailed => "MIGRATION_FAILED",
            CollectErrorKind::Cancelled => "CANCELLED",
            CollectErrorKind::Storage => "STORAGE",
            CollectErrorKind::InvalidParams => "INVALID_PARAMS",
            CollectErrorKind::SubTaskFailed => "SUBTASK_FAILED",
        }
    }

    /// Whether an external scheduler may re-trigger the run.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CollectErrorKind::UpstreamUnavailable
                | CollectErrorKind::BridgeUnavailable
                | CollectErrorKind::AlreadyRunning
                | CollectErrorKind::Cancelled
        )
    }
}

impl fmt::Display for CollectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CollectErrorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "UPSTREAM_UNAVAILABLE" => Ok(CollectErrorKind::UpstreamUnavailable),
            "MALFORMED_RESPONSE" => Ok(CollectErrorKind::MalformedResponse),
            "ALREADY_RUNNING" => Ok(CollectErrorKind::AlreadyRunning),
            "BRIDGE_UNAVAILABLE" => Ok(CollectErrorKind::BridgeUnavailable),
            "MIGRATION_PENDING" => Ok(CollectErrorKind::MigrationPending),
            "MIGRATION_FAILED" => Ok(CollectErrorKind::MigrationFailed),
            "CANCELLED" => Ok(CollectErrorKind::Cancelled),
            "STORAGE" => Ok(CollectErrorKind::Storage),
            "INVALID_PARAMS" => Ok(CollectErrorKind::InvalidParams),
            "SUBTASK_FAILED" => Ok(CollectErrorKind::SubTaskFailed),
            _ => Err(format!("Invalid error kind: '{}'", s)),
        }
    }
}

/// Final status of one subtask execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubTaskStatus {
    /// Entry point returned Ok
    Completed,
    /// Subtask disabled by default or by override; entry point not called
    Skipped,
    /// Entry point returned an error
    Failed,
}

impl SubTaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubTaskStatus::Completed => "COMPLETED",
            SubTaskStatus::Skipped => "SKIPPED",
            SubTaskStatus::Failed => "FAILED",
        }
    }
}

impl fmt::Display for SubTaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ----------------------------------------------------------------------------
// Subtask metadata (data half of SubTaskMeta; the entry point stays local)
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubTaskDescriptor {
    pub name: String,
    pub enabled_by_default: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub domain_types: BTreeSet<String>,
}

/// Plugin-scoped task context. This is what crosses the bridge on invoke.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: String,
    pub plugin_name: String,
    /// Plugin-specific options (connection id, workspace id, ...)
    #[serde(default)]
    pub options: serde_json::Value,
    /// Caller-supplied lower bound for collectors
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_after: Option<DateTime<Utc>>,
    /// Explicit enable/disable per subtask name, overriding enabled_by_default
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub subtask_overrides: BTreeMap<String, bool>,
}

impl TaskInfo {
    pub fn new(task_id: impl Into<String>, plugin_name: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            plugin_name: plugin_name.into(),
            options: serde_json::Value::Object(serde_json::Map::new()),
            time_after: None,
            subtask_overrides: BTreeMap::new(),
        }
    }

    pub fn with_options(mut self, options: serde_json::Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_time_after(mut self, time_after: DateTime<Utc>) -> Self {
        self.time_after = Some(time_after);
        self
    }

    pub fn with_override(mut self, subtask: impl Into<String>, enabled: bool) -> Self {
        self.subtask_overrides.insert(subtask.into(), enabled);
        self
    }

    /// Resolve whether a subtask should run for this task.
    pub fn is_enabled(&self, descriptor: &SubTaskDescriptor) -> bool {
        self.subtask_overrides
            .get(&descriptor.name)
            .copied()
            .unwrap_or(descriptor.enabled_by_default)
    }
}

// ----------------------------------------------------------------------------
// Liveness payloads, plugin to sentinel
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRegistration {
    pub plugin_name: String,
    /// ZMQ endpoint the plugin serves invocations on
    pub endpoint: String,
    pub subtasks: Vec<SubTaskDescriptor>,
    pub protocol_version: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnregisterPayload {
    pub plugin_name: String,
    pub endpoint: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub plugin_name: String,
    pub endpoint: String,
    pub active_invocations: usize,
}

// ----------------------------------------------------------------------------
// Invoke request and Conclude outcome
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvokeRequest {
    pub subtask: String,
    pub task: TaskInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub kind: CollectErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvokeOutcome {
    pub status: SubTaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
    #[serde(default)]
    pub duration_ms: u64,
}

// ----------------------------------------------------------------------------
// Bootstrap, sentinel to launcher
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapRequest {
    /// Port of the sentinel's plugin endpoint; launchers register back to it
    pub orchestrator_port: u16,
    pub protocol_version: u32,
}

// ----------------------------------------------------------------------------
// Ack and Err replies
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AckPayload {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

impl ErrorPayload {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}
