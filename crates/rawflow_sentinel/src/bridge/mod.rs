//! Remote Plugin Bridge
//!
//! Lets plugin logic run in a separate process. Inbound, plugins register
//! their subtasks into the [`DispatchTable`]; outbound, the sentinel invokes
//! them through [`RemoteInvoker`] and bootstraps launchers at startup.

pub mod bootstrap;
pub mod invoker;
pub mod registry;

pub use bootstrap::{bootstrap_launcher, spawn_bootstrap};
pub use invoker::RemoteInvoker;
pub use registry::{
    BridgeError, Dispatch, DispatchTable, PluginInfo, PluginLocation, PluginTarget, Registration,
    RemoteHandle,
};

use rawflow_collector::{CollectError, PluginDefinition};
use rawflow_protocol::{PluginRegistration, SubTaskStatus, TaskInfo};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::metrics::METRICS;

/// Dispatch table plus invoker, shared by all request handlers.
pub struct Bridge {
    table: RwLock<DispatchTable>,
    invoker: RemoteInvoker,
}

impl Bridge {
    pub fn new(
        local_plugins: Vec<PluginDefinition>,
        invoke_timeout: Duration,
    ) -> Result<Self, BridgeError> {
        Ok(Self {
            table: RwLock::new(DispatchTable::new(local_plugins)?),
            invoker: RemoteInvoker::new(invoke_timeout),
        })
    }

    pub async fn register(&self, reg: PluginRegistration) -> Result<Registration, BridgeError> {
        let plugin = reg.plugin_name.clone();
        let endpoint = reg.endpoint.clone();
        let subtasks = reg.subtasks.len();
        let result = self.table.write().await.register(reg);
        match &result {
            Ok(Registration::New) => {
                METRICS.inc_plugins_registered();
                info!(plugin = %plugin, endpoint = %endpoint, subtasks, "Remote plugin registered");
            }
            Ok(Registration::Replaced { previous_endpoint }) => {
                METRICS.inc_plugins_replaced();
                info!(
                    plugin = %plugin,
                    endpoint = %endpoint,
                    previous = %previous_endpoint,
                    subtasks,
                    "Remote plugin re-registered, previous entries replaced"
                );
            }
            Err(err) => {
                warn!(plugin = %plugin, endpoint = %endpoint, error = %err, "Registration rejected");
            }
        }
        result
    }

    pub async fn unregister(&self, plugin_name: &str, endpoint: &str) -> bool {
        let removed = self.table.write().await.unregister(plugin_name, endpoint);
        if removed {
            METRICS.inc_plugins_unregistered();
            info!(plugin = %plugin_name, endpoint = %endpoint, "Remote plugin unregistered");
        }
        removed
    }

    pub async fn heartbeat(&self, plugin_name: &str, endpoint: &str) -> bool {
        METRICS.inc_heartbeats();
        self.table
            .write()
            .await
            .heartbeat(plugin_name, endpoint, Instant::now())
    }

    pub async fn reap_stale(&self, timeout: Duration) -> Vec<String> {
        let reaped = self.table.write().await.reap_stale(Instant::now(), timeout);
        for plugin in &reaped {
            METRICS.inc_plugins_reaped();
            warn!(plugin = %plugin, "Removing stale remote plugin: heartbeat timed out");
        }
        reaped
    }

    pub async fn plugins(&self) -> Vec<PluginInfo> {
        self.table.read().await.plugins()
    }

    pub async fn resolve(&self, plugin_name: &str, subtask: &str) -> Result<Dispatch, BridgeError> {
        self.table.read().await.resolve(plugin_name, subtask)
    }

    pub async fn resolve_plugin(&self, plugin_name: &str) -> Result<PluginTarget, BridgeError> {
        self.table.read().await.resolve_plugin(plugin_name)
    }

    pub fn invoker(&self) -> &RemoteInvoker {
        &self.invoker
    }

    /// Invoke a remote subtask by name. A remote failure is rebuilt into
    /// the error the plugin reported; transport failures are
    /// [`CollectError::BridgeUnavailable`].
    pub async fn invoke(
        &self,
        plugin_name: &str,
        subtask: &str,
        task: &TaskInfo,
    ) -> Result<(), CollectError> {
        let handle = match self.resolve(plugin_name, subtask).await {
            Ok(Dispatch::Remote(handle)) => handle,
            Ok(Dispatch::Local(_)) => {
                return Err(CollectError::InvalidParams(format!(
                    "plugin '{plugin_name}' runs in-process"
                )))
            }
            Err(err) => return Err(CollectError::InvalidParams(err.to_string())),
        };
        let outcome = self.invoker.invoke(&handle, task).await?;
        match (outcome.status, outcome.error) {
            (SubTaskStatus::Failed, Some(failure)) => Err(CollectError::from_remote(failure)),
            (SubTaskStatus::Failed, None) => Err(CollectError::SubTaskFailed(format!(
                "{plugin_name}/{subtask} failed without details"
            ))),
            _ => Ok(()),
        }
    }
}
