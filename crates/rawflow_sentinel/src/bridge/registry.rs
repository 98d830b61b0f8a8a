//! Dispatch table: which subtask runs where.

use chrono::{DateTime, Utc};
use rawflow_collector::{validate_names, DefinitionError, PluginDefinition, SubTaskMeta};
use rawflow_protocol::{PluginRegistration, SubTaskDescriptor, PLUGIN_PROTOCOL_VERSION};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Unsupported plugin protocol version {got} (sentinel speaks {expected})")]
    UnsupportedProtocol { expected: u32, got: u32 },

    #[error("Invalid registration: {0}")]
    InvalidRegistration(#[from] DefinitionError),

    #[error("Plugin name '{0}' belongs to an in-process plugin")]
    NameTaken(String),

    #[error("Remote plugin endpoint must not be empty")]
    MissingEndpoint,

    #[error("Unknown plugin '{0}'")]
    UnknownPlugin(String),

    #[error("Plugin '{plugin}' has no subtask '{subtask}'")]
    UnknownSubTask { plugin: String, subtask: String },
}

impl BridgeError {
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::UnsupportedProtocol { .. } => "UNSUPPORTED_PROTOCOL",
            BridgeError::InvalidRegistration(_) | BridgeError::MissingEndpoint => {
                "INVALID_REGISTRATION"
            }
            BridgeError::NameTaken(_) => "NAME_TAKEN",
            BridgeError::UnknownPlugin(_) => "UNKNOWN_PLUGIN",
            BridgeError::UnknownSubTask { .. } => "UNKNOWN_SUBTASK",
        }
    }
}

/// RPC target for one remote subtask.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteHandle {
    pub plugin_name: String,
    pub endpoint: String,
    pub subtask: SubTaskDescriptor,
}

/// Where a resolved subtask runs.
#[derive(Debug, Clone)]
pub enum Dispatch {
    Local(SubTaskMeta),
    Remote(RemoteHandle),
}

/// Resolved plugin, used for whole-plugin runs.
#[derive(Debug, Clone)]
pub enum PluginTarget {
    Local(Arc<PluginDefinition>),
    Remote(Vec<RemoteHandle>),
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    New,
    /// Same name registered again (plugin restart); prior entries are gone
    Replaced { previous_endpoint: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PluginLocation {
    Local,
    Remote,
}

/// Plugin listing for the control API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub location: PluginLocation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub subtasks: Vec<SubTaskDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registered_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct RemotePlugin {
    endpoint: String,
    subtasks: Vec<SubTaskDescriptor>,
    registered_at: DateTime<Utc>,
    last_seen: Instant,
}

impl RemotePlugin {
    fn handle(&self, plugin_name: &str, subtask: &SubTaskDescriptor) -> RemoteHandle {
        RemoteHandle {
            plugin_name: plugin_name.to_string(),
            endpoint: self.endpoint.clone(),
            subtask: subtask.clone(),
        }
    }
}

/// In-process plugins are fixed at startup; remote ones come and go.
#[derive(Debug, Default)]
pub struct DispatchTable {
    local: HashMap<String, Arc<PluginDefinition>>,
    remote: HashMap<String, RemotePlugin>,
}

impl DispatchTable {
    pub fn new(local_plugins: Vec<PluginDefinition>) -> Result<Self, BridgeError> {
        let mut local = HashMap::new();
        for plugin in local_plugins {
            plugin.validate()?;
            if local.contains_key(&plugin.name) {
                return Err(BridgeError::NameTaken(plugin.name));
            }
            local.insert(plugin.name.clone(), Arc::new(plugin));
        }
        Ok(Self {
            local,
            remote: HashMap::new(),
        })
    }

    /// Install entries for every declared subtask, replacing any previous
    /// registration under the same name.
    pub fn register(&mut self, reg: PluginRegistration) -> Result<Registration, BridgeError> {
        if reg.protocol_version != PLUGIN_PROTOCOL_VERSION {
            return Err(BridgeError::UnsupportedProtocol {
                expected: PLUGIN_PROTOCOL_VERSION,
                got: reg.protocol_version,
            });
        }
        validate_names(&reg.plugin_name, reg.subtasks.iter().map(|s| s.name.as_str()))?;
        if reg.endpoint.trim().is_empty() {
            return Err(BridgeError::MissingEndpoint);
        }
        if self.local.contains_key(&reg.plugin_name) {
            return Err(BridgeError::NameTaken(reg.plugin_name));
        }

        let entry = RemotePlugin {
            endpoint: reg.endpoint,
            subtasks: reg.subtasks,
            registered_at: Utc::now(),
            last_seen: Instant::now(),
        };
        Ok(match self.remote.insert(reg.plugin_name, entry) {
            Some(previous) => Registration::Replaced {
                previous_endpoint: previous.endpoint,
            },
            None => Registration::New,
        })
    }

    /// Remove a remote plugin. Ignored when the endpoint no longer matches,
    /// so a late unregister from a dead process cannot evict its successor.
    pub fn unregister(&mut self, plugin_name: &str, endpoint: &str) -> bool {
        match self.remote.get(plugin_name) {
            Some(entry) if entry.endpoint == endpoint => {
                self.remote.remove(plugin_name);
                true
            }
            _ => false,
        }
    }

    /// Refresh liveness. False when the plugin is not (or no longer)
    /// registered at that endpoint.
    pub fn heartbeat(&mut self, plugin_name: &str, endpoint: &str, now: Instant) -> bool {
        match self.remote.get_mut(plugin_name) {
            Some(entry) if entry.endpoint == endpoint => {
                entry.last_seen = now;
                true
            }
            _ => false,
        }
    }

    /// Drop remote plugins silent for longer than `timeout`.
    pub fn reap_stale(&mut self, now: Instant, timeout: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .remote
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &stale {
            self.remote.remove(name);
        }
        stale
    }

    pub fn resolve(&self, plugin_name: &str, subtask: &str) -> Result<Dispatch, BridgeError> {
        let unknown_subtask = || BridgeError::UnknownSubTask {
            plugin: plugin_name.to_string(),
            subtask: subtask.to_string(),
        };

        if let Some(plugin) = self.local.get(plugin_name) {
            return plugin
                .subtask(subtask)
                .cloned()
                .map(Dispatch::Local)
                .ok_or_else(unknown_subtask);
        }
        let remote = self
            .remote
            .get(plugin_name)
            .ok_or_else(|| BridgeError::UnknownPlugin(plugin_name.to_string()))?;
        remote
            .subtasks
            .iter()
            .find(|s| s.name == subtask)
            .map(|s| Dispatch::Remote(remote.handle(plugin_name, s)))
            .ok_or_else(unknown_subtask)
    }

    pub fn resolve_plugin(&self, plugin_name: &str) -> Result<PluginTarget, BridgeError> {
        if let Some(plugin) = self.local.get(plugin_name) {
            return Ok(PluginTarget::Local(Arc::clone(plugin)));
        }
        let remote = self
            .remote
            .get(plugin_name)
            .ok_or_else(|| BridgeError::UnknownPlugin(plugin_name.to_string()))?;
        Ok(PluginTarget::Remote(
            remote
                .subtasks
                .iter()
                .map(|s| remote.handle(plugin_name, s))
                .collect(),
        ))
    }

    /// All plugins, sorted by name.
    pub fn plugins(&self) -> Vec<PluginInfo> {
        let mut plugins: Vec<PluginInfo> = self
            .local
            .values()
            .map(|p| PluginInfo {
                name: p.name.clone(),
                location: PluginLocation::Local,
                endpoint: None,
                subtasks: p.descriptors(),
                registered_at: None,
            })
            .chain(self.remote.iter().map(|(name, p)| PluginInfo {
                name: name.clone(),
                location: PluginLocation::Remote,
                endpoint: Some(p.endpoint.clone()),
                subtasks: p.subtasks.clone(),
                registered_at: Some(p.registered_at),
            }))
            .collect();
        plugins.sort_by(|a, b| a.name.cmp(&b.name));
        plugins
    }

    pub fn remote_count(&self) -> usize {
        self.remote.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use rawflow_collector::{SubTask, SubTaskContext};

    struct Noop;

    #[async_trait]
    impl SubTask for Noop {
        async fn run(&self, _ctx: &SubTaskContext) -> rawflow_collector::Result<()> {
            Ok(())
        }
    }

    fn descriptor(name: &str) -> SubTaskDescriptor {
        SubTaskDescriptor {
            name: name.to_string(),
            enabled_by_default: true,
            description: String::new(),
            domain_types: Default::default(),
        }
    }

    fn registration(name: &str, endpoint: &str, subtasks: &[&str]) -> PluginRegistration {
        PluginRegistration {
            plugin_name: name.to_string(),
            endpoint: endpoint.to_string(),
            subtasks: subtasks.iter().map(|s| descriptor(s)).collect(),
            protocol_version: PLUGIN_PROTOCOL_VERSION,
        }
    }

    fn table() -> DispatchTable {
        DispatchTable::new(vec![PluginDefinition::new("gitlab")
            .with_subtask(SubTaskMeta::new("collectCommits", Arc::new(Noop)))])
        .unwrap()
    }

    #[test]
    fn test_reregistration_replaces_entries() {
        let mut table = table();
        let first = table
            .register(registration("tapd", "tcp://127.0.0.1:7001", &["collectBugs", "collectStories"]))
            .unwrap();
        assert_eq!(first, Registration::New);

        let second = table
            .register(registration("tapd", "tcp://127.0.0.1:7002", &["collectBugs"]))
            .unwrap();
        assert_eq!(
            second,
            Registration::Replaced {
                previous_endpoint: "tcp://127.0.0.1:7001".to_string()
            }
        );

        match table.resolve("tapd", "collectBugs").unwrap() {
            Dispatch::Remote(handle) => assert_eq!(handle.endpoint, "tcp://127.0.0.1:7002"),
            Dispatch::Local(_) => panic!("expected remote dispatch"),
        }
        assert!(matches!(
            table.resolve("tapd", "collectStories"),
            Err(BridgeError::UnknownSubTask { .. })
        ));
        assert_eq!(table.remote_count(), 1);
    }

    #[test]
    fn test_protocol_version_checked() {
        let mut table = table();
        let mut reg = registration("tapd", "tcp://127.0.0.1:7001", &["collectBugs"]);
        reg.protocol_version = PLUGIN_PROTOCOL_VERSION + 1;
        let err = table.register(reg).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_PROTOCOL");
        assert_eq!(table.remote_count(), 0);
    }

    #[test]
    fn test_name_rules() {
        let mut table = table();
        let err = table
            .register(registration("gitlab", "tcp://127.0.0.1:7001", &["collectCommits"]))
            .unwrap_err();
        assert_eq!(err, BridgeError::NameTaken("gitlab".to_string()));

        let err = table
            .register(registration("tapd", "tcp://127.0.0.1:7001", &["a", "a"]))
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_REGISTRATION");

        let err = table
            .register(registration("tapd", "", &["a"]))
            .unwrap_err();
        assert_eq!(err, BridgeError::MissingEndpoint);
    }

    #[test]
    fn test_unregister_ignores_stale_endpoint() {
        let mut table = table();
        table
            .register(registration("tapd", "tcp://127.0.0.1:7001", &["collectBugs"]))
            .unwrap();
        table
            .register(registration("tapd", "tcp://127.0.0.1:7002", &["collectBugs"]))
            .unwrap();

        assert!(!table.unregister("tapd", "tcp://127.0.0.1:7001"));
        assert!(table.resolve_plugin("tapd").is_ok());
        assert!(table.unregister("tapd", "tcp://127.0.0.1:7002"));
        assert!(matches!(
            table.resolve_plugin("tapd"),
            Err(BridgeError::UnknownPlugin(_))
        ));
    }

    #[test]
    fn test_reap_stale_plugins() {
        let mut table = table();
        table
            .register(registration("tapd", "tcp://127.0.0.1:7001", &["collectBugs"]))
            .unwrap();
        table
            .register(registration("jira", "tcp://127.0.0.1:7003", &["collectIssues"]))
            .unwrap();

        let later = Instant::now() + Duration::from_secs(60);
        assert!(table.heartbeat("jira", "tcp://127.0.0.1:7003", later));
        assert!(!table.heartbeat("jira", "tcp://127.0.0.1:9999", later));

        let reaped = table.reap_stale(later + Duration::from_secs(40), Duration::from_secs(90));
        assert_eq!(reaped, vec!["tapd".to_string()]);
        assert!(table.resolve_plugin("jira").is_ok());
        assert!(!table.heartbeat("tapd", "tcp://127.0.0.1:7001", later));
    }

    #[test]
    fn test_local_plugins_resolve_and_list() {
        let mut table = table();
        table
            .register(registration("tapd", "tcp://127.0.0.1:7001", &["collectBugs"]))
            .unwrap();

        assert!(matches!(
            table.resolve("gitlab", "collectCommits").unwrap(),
            Dispatch::Local(_)
        ));
        let plugins = table.plugins();
        let names: Vec<_> = plugins.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["gitlab", "tapd"]);
        assert_eq!(plugins[1].location, PluginLocation::Remote);
        assert_eq!(plugins[1].endpoint.as_deref(), Some("tcp://127.0.0.1:7001"));
    }
}
