//! Plugin definitions: a named, ordered set of subtasks.

use rawflow_protocol::{SubTaskDescriptor, SubTaskStatus, TaskInfo};
use std::collections::HashSet;
use thiserror::Error;

use crate::cancel::CancellationToken;
use crate::subtask::{SubTaskMeta, SubTaskReport, SubTaskRunner};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DefinitionError {
    #[error("plugin name must not be empty")]
    EmptyPluginName,
    #[error("plugin '{0}' declares a subtask with an empty name")]
    EmptySubTaskName(String),
    #[error("plugin '{plugin}' declares subtask '{subtask}' more than once")]
    DuplicateSubTask { plugin: String, subtask: String },
}

/// Check the naming rules shared by local plugins and remote registrations.
pub fn validate_names<'a>(
    plugin: &str,
    subtasks: impl IntoIterator<Item = &'a str>,
) -> Result<(), DefinitionError> {
    if plugin.trim().is_empty() {
        return Err(DefinitionError::EmptyPluginName);
    }
    let mut seen = HashSet::new();
    for name in subtasks {
        if name.trim().is_empty() {
            return Err(DefinitionError::EmptySubTaskName(plugin.to_string()));
        }
        if !seen.insert(name) {
            return Err(DefinitionError::DuplicateSubTask {
                plugin: plugin.to_string(),
                subtask: name.to_string(),
            });
        }
    }
    Ok(())
}

/// An in-process plugin.
#[derive(Debug, Clone)]
pub struct PluginDefinition {
    pub name: String,
    /// Declaration order is execution order for whole-plugin runs
    pub subtasks: Vec<SubTaskMeta>,
}

impl PluginDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subtasks: Vec::new(),
        }
    }

    pub fn with_subtask(mut self, meta: SubTaskMeta) -> Self {
        self.subtasks.push(meta);
        self
    }

    pub fn validate(&self) -> Result<(), DefinitionError> {
        validate_names(&self.name, self.subtasks.iter().map(|s| s.name.as_str()))
    }

    pub fn subtask(&self, name: &str) -> Option<&SubTaskMeta> {
        self.subtasks.iter().find(|s| s.name == name)
    }

    pub fn descriptors(&self) -> Vec<SubTaskDescriptor> {
        self.subtasks.iter().map(SubTaskMeta::descriptor).collect()
    }

    /// Run every subtask in order, stopping after the first failure.
    pub async fn run_all(
        &self,
        runner: &SubTaskRunner,
        task: &TaskInfo,
        cancel: &CancellationToken,
    ) -> Vec<SubTaskReport> {
        let mut reports = Vec::with_capacity(self.subtasks.len());
        for meta in &self.subtasks {
            let report = runner.run(task, meta, cancel).await;
            let failed = report.status == SubTaskStatus::Failed;
            reports.push(report);
            if failed {
                break;
            }
        }
        reports
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CollectError, Result};
    use crate::subtask::{SubTask, SubTaskContext};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct Fixed(bool);

    #[async_trait]
    impl SubTask for Fixed {
        async fn run(&self, _ctx: &SubTaskContext) -> Result<()> {
            if self.0 {
                Ok(())
            } else {
                Err(CollectError::SubTaskFailed("boom".into()))
            }
        }
    }

    #[test]
    fn duplicate_names_rejected() {
        let plugin = PluginDefinition::new("tapd")
            .with_subtask(SubTaskMeta::new("a", Arc::new(Fixed(true))))
            .with_subtask(SubTaskMeta::new("a", Arc::new(Fixed(true))));
        assert!(matches!(
            plugin.validate(),
            Err(DefinitionError::DuplicateSubTask { .. })
        ));
        assert!(matches!(
            validate_names("", ["a"]),
            Err(DefinitionError::EmptyPluginName)
        ));
        assert!(matches!(
            validate_names("tapd", [" "]),
            Err(DefinitionError::EmptySubTaskName(_))
        ));
    }

    #[tokio::test]
    async fn run_all_stops_at_first_failure() {
        let plugin = PluginDefinition::new("tapd")
            .with_subtask(SubTaskMeta::new("first", Arc::new(Fixed(true))))
            .with_subtask(SubTaskMeta::new("off", Arc::new(Fixed(false))).disabled_by_default())
            .with_subtask(SubTaskMeta::new("broken", Arc::new(Fixed(false))))
            .with_subtask(SubTaskMeta::new("never", Arc::new(Fixed(true))));

        let reports = plugin
            .run_all(
                &SubTaskRunner::new(),
                &TaskInfo::new("t", "tapd"),
                &CancellationToken::new(),
            )
            .await;

        let statuses: Vec<_> = reports.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![
                SubTaskStatus::Completed,
                SubTaskStatus::Skipped,
                SubTaskStatus::Failed
            ]
        );
    }
}
