//! Command line and environment configuration.

use anyhow::Result;
use clap::{Parser, Subcommand};
use rawflow_protocol::defaults::{
    DEFAULT_CONTROL_ADDR, DEFAULT_DB_FILE, DEFAULT_HEARTBEAT_TIMEOUT_SECS,
    DEFAULT_INVOKE_TIMEOUT_SECS, DEFAULT_PLUGIN_ADDR, DEFAULT_REQUEST_TIMEOUT_MS,
};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "rawflow-sentinel",
    about = "Rawflow orchestrator: collection runs, remote plugins, migration gate"
)]
pub struct SentinelArgs {
    #[command(subcommand)]
    pub command: Option<Command>,

    /// Control API bind address (clients connect here)
    #[arg(
        long,
        env = "RAWFLOW_CONTROL_ADDR",
        default_value_t = DEFAULT_CONTROL_ADDR.to_string()
    )]
    pub control_addr: String,

    /// Endpoint remote plugins register with
    #[arg(
        long,
        env = "RAWFLOW_PLUGIN_ADDR",
        default_value_t = DEFAULT_PLUGIN_ADDR.to_string()
    )]
    pub plugin_addr: String,

    /// SQLite database file (default: $RAWFLOW_HOME/rawflow.sqlite3)
    #[arg(long, env = "RAWFLOW_DB")]
    pub database: Option<PathBuf>,

    /// Accept remote plugin registrations and bootstrap launchers
    #[arg(long, env = "ENABLE_REMOTE_PLUGINS")]
    pub enable_remote_plugins: bool,

    /// Comma-separated plugin launcher endpoints to bootstrap at startup
    #[arg(long, env = "RAWFLOW_PLUGIN_LAUNCHERS", value_delimiter = ',')]
    pub plugin_launchers: Vec<String>,

    /// Apply pending migrations at startup without operator confirmation
    #[arg(long, env = "FORCE_MIGRATION")]
    pub force_migration: bool,

    /// Seconds without heartbeat before a remote plugin is dropped
    #[arg(long, default_value_t = DEFAULT_HEARTBEAT_TIMEOUT_SECS)]
    pub heartbeat_timeout_secs: u64,

    /// Seconds to wait for a remote subtask to conclude
    #[arg(long, default_value_t = DEFAULT_INVOKE_TIMEOUT_SECS)]
    pub invoke_timeout_secs: u64,

    /// Debug-level logging when RUST_LOG is unset
    #[arg(short, long)]
    pub verbose: bool,
}

/// Client subcommands talk to a running sentinel through the control API.
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the sentinel (default)
    Serve,
    /// Confirm pending database migrations
    ConfirmMigration,
    /// Show migration gate status
    Status,
    /// List registered plugins
    Plugins,
}

impl SentinelArgs {
    pub fn into_config(self) -> Result<SentinelConfig> {
        let database_path = match self.database {
            Some(path) => path,
            None => rawflow_logging::rawflow_home()?.join(DEFAULT_DB_FILE),
        };
        Ok(SentinelConfig {
            control_addr: self.control_addr,
            plugin_addr: self.plugin_addr,
            database_path,
            enable_remote_plugins: self.enable_remote_plugins,
            plugin_launchers: self
                .plugin_launchers
                .into_iter()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
            force_migration: self.force_migration,
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            invoke_timeout: Duration::from_secs(self.invoke_timeout_secs),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        })
    }
}

/// Sentinel configuration
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    pub control_addr: String,
    pub plugin_addr: String,
    pub database_path: PathBuf,
    pub enable_remote_plugins: bool,
    pub plugin_launchers: Vec<String>,
    pub force_migration: bool,
    pub heartbeat_timeout: Duration,
    pub invoke_timeout: Duration,
    /// Deadline for short exchanges (bootstrap)
    pub request_timeout: Duration,
}

impl SentinelConfig {
    /// Defaults with the given database file.
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            control_addr: DEFAULT_CONTROL_ADDR.to_string(),
            plugin_addr: DEFAULT_PLUGIN_ADDR.to_string(),
            database_path: database_path.into(),
            enable_remote_plugins: false,
            plugin_launchers: Vec::new(),
            force_migration: false,
            heartbeat_timeout: Duration::from_secs(DEFAULT_HEARTBEAT_TIMEOUT_SECS),
            invoke_timeout: Duration::from_secs(DEFAULT_INVOKE_TIMEOUT_SECS),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_map_to_config() {
        let args = SentinelArgs::try_parse_from([
            "rawflow-sentinel",
            "--database",
            "/tmp/rawflow-test.sqlite3",
            "--enable-remote-plugins",
            "--plugin-launchers",
            "tcp://10.0.0.5:6000, tcp://10.0.0.6:6000",
            "--force-migration",
            "--heartbeat-timeout-secs",
            "15",
        ])
        .unwrap();
        assert_eq!(args.command, None);

        let config = args.into_config().unwrap();
        assert!(config.enable_remote_plugins);
        assert!(config.force_migration);
        assert_eq!(
            config.plugin_launchers,
            vec!["tcp://10.0.0.5:6000", "tcp://10.0.0.6:6000"]
        );
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(15));
        assert_eq!(
            config.database_path,
            PathBuf::from("/tmp/rawflow-test.sqlite3")
        );
    }

    #[test]
    fn test_subcommand_parses() {
        let args = SentinelArgs::try_parse_from([
            "rawflow-sentinel",
            "--control-addr",
            "tcp://127.0.0.1:7556",
            "confirm-migration",
        ])
        .unwrap();
        assert_eq!(args.command, Some(Command::ConfirmMigration));
        assert_eq!(args.control_addr, "tcp://127.0.0.1:7556");
    }
}
