//! Subtask entry point backed by a [`StatefulCollector`].

use async_trait::async_trait;
use chrono_tz::Tz;
use std::sync::Arc;
use tracing::info;

use crate::api_client::ApiClient;
use crate::collector::StatefulCollector;
use crate::connector::Connector;
use crate::error::Result;
use crate::params::CollectionParams;
use crate::subtask::{SubTask, SubTaskContext};

/// Collects one raw table per invocation.
///
/// Params come from the task options (`connection_id` plus whatever the
/// connector filters on) and the task's `time_after` is handed through
/// unchanged, so the collector alone decides between a full and an
/// incremental run.
pub struct CollectSubTask {
    collector: Arc<StatefulCollector>,
    table: String,
    zone: Tz,
    connector: Arc<dyn Connector>,
    api: Arc<dyn ApiClient>,
}

impl CollectSubTask {
    pub fn new(
        collector: Arc<StatefulCollector>,
        table: impl Into<String>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ApiClient>,
    ) -> Self {
        Self {
            collector,
            table: table.into(),
            zone: Tz::UTC,
            connector,
            api,
        }
    }

    /// Zone the connector's upstream compares dates in.
    pub fn in_zone(mut self, zone: Tz) -> Self {
        self.zone = zone;
        self
    }
}

#[async_trait]
impl SubTask for CollectSubTask {
    async fn run(&self, ctx: &SubTaskContext) -> Result<()> {
        let params = CollectionParams::from_task(&ctx.task, &self.table, self.zone)?;
        let summary = self
            .collector
            .collect(
                &params,
                ctx.task.time_after,
                Arc::clone(&self.connector),
                Arc::clone(&self.api),
                &ctx.cancel,
            )
            .await?;

        info!(
            table = %self.table,
            incremental = summary.incremental,
            pages = summary.pages_fetched,
            records = summary.records_written,
            "Raw table collected"
        );
        Ok(())
    }
}
