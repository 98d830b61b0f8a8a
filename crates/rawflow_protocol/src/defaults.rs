//! Canonical default values shared by the sentinel and plugin hosts.

pub const DEFAULT_PLUGIN_ADDR: &str = "tcp://127.0.0.1:5555";
pub const DEFAULT_CONTROL_ADDR: &str = "tcp://127.0.0.1:5556";
pub const DEFAULT_LAUNCHER_HOST: &str = "127.0.0.1";
pub const DEFAULT_DB_FILE: &str = "rawflow.sqlite3";

pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_HEARTBEAT_TIMEOUT_SECS: u64 = 90;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5_000;
/// Remote subtasks may collect for a long time; invocation replies get a wider window.
pub const DEFAULT_INVOKE_TIMEOUT_SECS: u64 = 3_600;

pub const DEFAULT_PAGE_SIZE: u32 = 100;
pub const DEFAULT_COLLECTOR_CONCURRENCY: usize = 1;

/// Operator-facing warning returned by every gated request while a schema
/// migration awaits confirmation.
pub const MIGRATION_REQUIRED_MESSAGE: &str = "
New migration scripts detected. Database migration is required to launch rawflow.
WARNING: Performing migration may wipe collected data for consistency and re-collecting data may be required.
To proceed, please send a ConfirmMigration request to the control API (or run `rawflow-sentinel confirm-migration`).
Alternatively, you may downgrade back to the previous rawflow version.
";

pub const MIGRATION_FAILED_MESSAGE: &str =
    "Database migration failed. Operator intervention is required before rawflow can serve requests.";

/// Status carried by gate rejections (HTTP 428 Precondition Required).
pub const PRECONDITION_REQUIRED_STATUS: u16 = 428;
