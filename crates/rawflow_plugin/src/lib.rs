//! Out-of-process plugins for the rawflow sentinel.
//!
//! [`PluginHost`] serves one [`PluginDefinition`](rawflow_collector::PluginDefinition)
//! over the plugin protocol and keeps it registered with a sentinel.
//! [`PluginLauncher`] waits for a sentinel's `Bootstrap` and starts hosts
//! for every plugin it carries.

pub mod host;
pub mod launcher;

pub use host::{PluginHost, PluginHostConfig, PluginHostHandle};
pub use launcher::{LauncherConfig, LauncherHandle, PluginLauncher};
