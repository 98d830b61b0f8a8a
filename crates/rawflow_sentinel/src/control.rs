//! Operator control API.
//!
//! Lets operators and schedulers drive a running sentinel without touching
//! its database directly.
//!
//! # Protocol
//!
//! ZMQ ROUTER socket; clients connect with REQ and exchange one JSON frame:
//! a [`ControlRequest`] in, a [`ControlResponse`] out.
//!
//! Every request except `ConfirmMigration` passes the migration gate first.
//!
//! # Requests
//!
//! - `Ping` / `GetMetrics`
//! - `ConfirmMigration` / `GetMigrationStatus`
//! - `ListPlugins` / `RunSubTask` / `RunPlugin`
//! - `GetCheckpoint` / `ListCheckpoints`

use rawflow_collector::SubTaskReport;
use rawflow_db::CheckpointState;
use rawflow_protocol::TaskInfo;
use serde::{Deserialize, Serialize};

use crate::bridge::PluginInfo;
use crate::gate::{GateError, GateStatus};

pub const DEFAULT_CONTROL_ADDR: &str = rawflow_protocol::defaults::DEFAULT_CONTROL_ADDR;

/// Adjacently tagged so clients can write `{"type": "Ping"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlRequest {
    /// Liveness probe
    Ping,
    /// Apply pending migrations; the only request the gate lets through
    ConfirmMigration,
    /// Gate state, pending scripts and last error
    GetMigrationStatus,
    /// Local and remote plugins with their subtasks
    ListPlugins,
    /// Run one subtask, locally or through the bridge
    RunSubTask {
        plugin: String,
        subtask: String,
        task: TaskInfo,
    },
    /// Run every subtask of a plugin in declaration order
    RunPlugin { plugin: String, task: TaskInfo },
    /// Stored checkpoint for one params key
    GetCheckpoint { params_key: String },
    /// Checkpoints of one plugin connection
    ListCheckpoints {
        plugin_name: String,
        connection_id: String,
    },
    /// Sentinel and collector counters (Prometheus text)
    GetMetrics,
}

impl ControlRequest {
    /// Requests that must reach the sentinel while the gate is closed.
    pub fn bypasses_gate(&self) -> bool {
        matches!(self, ControlRequest::ConfirmMigration)
    }

    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Ping => "Ping",
            ControlRequest::ConfirmMigration => "ConfirmMigration",
            ControlRequest::GetMigrationStatus => "GetMigrationStatus",
            ControlRequest::ListPlugins => "ListPlugins",
            ControlRequest::RunSubTask { .. } => "RunSubTask",
            ControlRequest::RunPlugin { .. } => "RunPlugin",
            ControlRequest::GetCheckpoint { .. } => "GetCheckpoint",
            ControlRequest::ListCheckpoints { .. } => "ListCheckpoints",
            ControlRequest::GetMetrics => "GetMetrics",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ControlResponse {
    Pong,
    /// Names of the scripts applied by this confirmation (empty if none were pending)
    MigrationConfirmed { applied: Vec<String> },
    MigrationStatus(GateStatus),
    Plugins(Vec<PluginInfo>),
    SubTaskResult(SubTaskReport),
    PluginRunResult(Vec<SubTaskReport>),
    Checkpoint(Option<CheckpointState>),
    Checkpoints(Vec<CheckpointState>),
    Metrics { prometheus: String },
    Error {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<u16>,
        message: String,
    },
}

impl ControlResponse {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            status: None,
            message: message.into(),
        }
    }

    /// Precondition-failure response for a closed gate
    pub fn gate_rejection(err: &GateError) -> Self {
        Self::Error {
            code: err.code().to_string(),
            status: Some(err.status()),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::GateState;
    use rawflow_protocol::SubTaskStatus;

    #[test]
    fn test_request_serialization() {
        let req = ControlRequest::RunSubTask {
            plugin: "tapd".to_string(),
            subtask: "collectWorklogs".to_string(),
            task: TaskInfo::new("t-1", "tapd")
                .with_options(serde_json::json!({"connection_id": 1, "workspace_id": 991})),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"RunSubTask\""));
        assert!(json.contains("collectWorklogs"));

        let parsed: ControlRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlRequest::RunSubTask { plugin, task, .. } => {
                assert_eq!(plugin, "tapd");
                assert_eq!(task.options["workspace_id"], 991);
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_unit_request_wire_form() {
        let json = serde_json::to_string(&ControlRequest::ConfirmMigration).unwrap();
        assert_eq!(json, r#"{"type":"ConfirmMigration"}"#);
        let parsed: ControlRequest = serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert!(matches!(parsed, ControlRequest::Ping));
    }

    #[test]
    fn test_only_confirmation_bypasses_gate() {
        assert!(ControlRequest::ConfirmMigration.bypasses_gate());
        assert!(!ControlRequest::GetMigrationStatus.bypasses_gate());
        assert!(!ControlRequest::Ping.bypasses_gate());
    }

    #[test]
    fn test_response_serialization() {
        let resp = ControlResponse::SubTaskResult(SubTaskReport {
            task_id: "t-1".to_string(),
            plugin_name: "tapd".to_string(),
            subtask: "collectWorklogs".to_string(),
            status: SubTaskStatus::Skipped,
            error: None,
            duration_ms: 0,
        });
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("SKIPPED"));

        let parsed: ControlResponse = serde_json::from_str(&json).unwrap();
        match parsed {
            ControlResponse::SubTaskResult(report) => {
                assert_eq!(report.status, SubTaskStatus::Skipped);
            }
            other => panic!("unexpected variant: {:?}", other),
        }

        let status = ControlResponse::MigrationStatus(GateStatus {
            state: GateState::PendingConfirmation,
            pending: vec!["collector_state_time_after".to_string()],
            last_error: None,
        });
        let json = serde_json::to_string(&status).unwrap();
        assert!(json.contains("PENDING_CONFIRMATION"));
    }

    #[test]
    fn test_gate_rejection_response() {
        let resp = ControlResponse::gate_rejection(&GateError::MigrationRequired);
        match resp {
            ControlResponse::Error {
                code,
                status,
                message,
            } => {
                assert_eq!(code, "MIGRATION_REQUIRED");
                assert_eq!(status, Some(428));
                assert!(message.contains("ConfirmMigration"));
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn test_error_response() {
        let resp = ControlResponse::error("UNKNOWN_PLUGIN", "Unknown plugin 'jira'");
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("Error"));
        assert!(json.contains("UNKNOWN_PLUGIN"));
        assert!(!json.contains("status"));
    }
}
