//! Rawflow Sentinel
//!
//! Usage:
//!     rawflow-sentinel --database ~/.rawflow/rawflow.sqlite3 --enable-remote-plugins
//!     rawflow-sentinel confirm-migration
//!     rawflow-sentinel status

use anyhow::Result;
use clap::Parser;
use rawflow_logging::{init_logging, LogConfig};
use rawflow_sentinel::{Command, ControlClient, PluginLocation, Sentinel, SentinelArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let args = SentinelArgs::parse();

    init_logging(LogConfig {
        app_name: "rawflow-sentinel",
        verbose: args.verbose,
    })?;

    match args.command.clone() {
        None | Some(Command::Serve) => serve(args).await,
        Some(Command::ConfirmMigration) => {
            let client = ControlClient::new(&args.control_addr);
            let applied = client.confirm_migration().await?;
            if applied.is_empty() {
                println!("No pending migrations.");
            } else {
                println!("Applied {} migration(s):", applied.len());
                for name in applied {
                    println!("  {}", name);
                }
            }
            Ok(())
        }
        Some(Command::Status) => {
            let client = ControlClient::new(&args.control_addr);
            let status = client.migration_status().await?;
            println!("Gate: {}", status.state.as_str());
            for name in &status.pending {
                println!("  pending: {}", name);
            }
            if let Some(err) = status.last_error {
                println!("  last error: {}", err);
            }
            Ok(())
        }
        Some(Command::Plugins) => {
            let client = ControlClient::new(&args.control_addr);
            for plugin in client.list_plugins().await? {
                let location = match plugin.location {
                    PluginLocation::Local => "local".to_string(),
                    PluginLocation::Remote => plugin.endpoint.clone().unwrap_or_default(),
                };
                println!("{} ({})", plugin.name, location);
                for subtask in plugin.subtasks {
                    let flag = if subtask.enabled_by_default { "" } else { " [disabled]" };
                    println!("  - {}{}", subtask.name, flag);
                }
            }
            Ok(())
        }
    }
}

async fn serve(args: SentinelArgs) -> Result<()> {
    let config = args.into_config()?;

    tracing::info!("Starting rawflow sentinel");
    tracing::info!("  Control: {}", config.control_addr);
    tracing::info!("  Database: {}", config.database_path.display());
    if config.enable_remote_plugins {
        tracing::info!("  Plugins: {}", config.plugin_addr);
    }

    // Plugins compiled into this binary would be passed here; the stock
    // binary serves remote plugins only.
    let sentinel = Sentinel::bind(config, Vec::new()).await?;

    let shutdown = sentinel.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    sentinel.run().await
}
