//! Rawflow sentinel library
//!
//! The orchestrator side of rawflow: the migration gate in front of every
//! request, the remote plugin bridge, and the control API used by operators
//! and schedulers to run subtasks.

pub mod bridge;
pub mod config;
pub mod control;
pub mod control_client;
pub mod gate;
pub mod metrics;
pub mod sentinel;

pub use bridge::{Bridge, BridgeError, DispatchTable, PluginInfo, PluginLocation, RemoteInvoker};
pub use config::{Command, SentinelArgs, SentinelConfig};
pub use control::{ControlRequest, ControlResponse, DEFAULT_CONTROL_ADDR};
pub use control_client::ControlClient;
pub use gate::{GateError, GateState, GateStatus, MigrationGate, MigrationRunner};
pub use metrics::METRICS;
pub use sentinel::Sentinel;
