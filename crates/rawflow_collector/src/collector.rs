//! Stateful incremental collector.
//!
//! One run:
//! 1. claims the params key (fail fast if another run holds it)
//! 2. loads the checkpoint and decides full vs incremental, once
//! 3. full runs invalidate the live records of the params key
//! 4. page workers pull page numbers from one shared counter until a page
//!    parses to zero records, an error occurs, or the run is cancelled
//! 5. commits a new checkpoint only if every worker finished cleanly

use chrono::{DateTime, SubsecRound, Utc};
use chrono_tz::Tz;
use rawflow_db::NewRawRecord;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api_client::ApiClient;
use crate::cancel::CancellationToken;
use crate::checkpoint::{CheckpointState, CheckpointStore};
use crate::clock::{Clock, SystemClock};
use crate::connector::{Connector, PageCursor, QueryContext};
use crate::error::{CollectError, Result};
use crate::metrics::METRICS;
use crate::params::CollectionParams;
use crate::run_guard::RunRegistry;
use crate::sink::RawRecordSink;

/// Mode decision for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub incremental: bool,
    /// Lower bound handed to the query builder
    pub lower_bound: Option<DateTime<Utc>>,
    /// Caller-supplied `time_after`
    pub time_after: Option<DateTime<Utc>>,
    /// `time_after` recorded in the checkpoint if this run commits
    pub recorded_time_after: Option<DateTime<Utc>>,
}

impl RunPlan {
    /// Incremental if a checkpoint exists and the caller does not ask for an
    /// earlier `time_after` than the checkpointed dataset was collected from.
    pub fn decide(checkpoint: Option<&CheckpointState>, time_after: Option<DateTime<Utc>>) -> Self {
        match checkpoint {
            Some(cp) if !widens(cp.time_after, time_after) => RunPlan {
                incremental: true,
                lower_bound: Some(cp.latest_success_start),
                time_after,
                recorded_time_after: cp.time_after,
            },
            _ => RunPlan {
                incremental: false,
                lower_bound: time_after,
                time_after,
                recorded_time_after: time_after,
            },
        }
    }

    pub fn query_context(&self, page: PageCursor, zone: Tz) -> QueryContext {
        QueryContext {
            page,
            incremental: self.incremental,
            lower_bound: self.lower_bound.map(|t| t.with_timezone(&zone)),
            time_after: self.time_after.map(|t| t.with_timezone(&zone)),
        }
    }
}

/// A checkpoint without a recorded `time_after` covers all history, so only
/// a strictly earlier request against a recorded bound widens the window.
fn widens(recorded: Option<DateTime<Utc>>, requested: Option<DateTime<Utc>>) -> bool {
    matches!((recorded, requested), (Some(recorded), Some(requested)) if requested < recorded)
}

/// Result of a committed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectSummary {
    pub params_key: String,
    pub incremental: bool,
    pub lower_bound: Option<DateTime<Utc>>,
    /// Pages fetched, the terminal empty page included
    pub pages_fetched: u32,
    pub records_written: u64,
    pub records_invalidated: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

pub struct StatefulCollector {
    checkpoints: Arc<dyn CheckpointStore>,
    sink: Arc<dyn RawRecordSink>,
    runs: RunRegistry,
    clock: Arc<dyn Clock>,
    concurrency: usize,
}

impl StatefulCollector {
    pub fn new(checkpoints: Arc<dyn CheckpointStore>, sink: Arc<dyn RawRecordSink>) -> Self {
        Self {
            checkpoints,
            sink,
            runs: RunRegistry::global(),
            clock: Arc::new(SystemClock),
            concurrency: rawflow_protocol::defaults::DEFAULT_COLLECTOR_CONCURRENCY,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Number of page workers per run (at least 1).
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Replace the process-wide run registry, e.g. to isolate tests.
    pub fn with_run_registry(mut self, runs: RunRegistry) -> Self {
        self.runs = runs;
        self
    }

    pub fn runs(&self) -> &RunRegistry {
        &self.runs
    }

    /// Collect everything the connector yields for `params`.
    ///
    /// On any error the checkpoint is left exactly as it was.
    pub async fn collect(
        &self,
        params: &CollectionParams,
        time_after: Option<DateTime<Utc>>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ApiClient>,
        cancel: &CancellationToken,
    ) -> Result<CollectSummary> {
        params.validate()?;
        let params_key = params.params_key();

        let _guard = match self.runs.try_acquire(&params_key) {
            Ok(guard) => guard,
            Err(err) => {
                METRICS.inc_runs_already_running();
                warn!(
                    plugin = %params.plugin_name,
                    table = %params.table,
                    params_key = %params_key,
                    "Collection already running, rejecting"
                );
                return Err(err);
            }
        };

        let result = self
            .run(params, &params_key, time_after, connector, api, cancel)
            .await;

        match &result {
            Ok(_) => METRICS.inc_runs_committed(),
            Err(CollectError::Cancelled) => {
                METRICS.inc_runs_cancelled();
                warn!(params_key = %params_key, table = %params.table, "Collection cancelled");
            }
            Err(err) => {
                METRICS.inc_runs_failed();
                warn!(
                    params_key = %params_key,
                    table = %params.table,
                    kind = %err.kind(),
                    error = %err,
                    "Collection failed, checkpoint untouched"
                );
            }
        }
        result
    }

    async fn run(
        &self,
        params: &CollectionParams,
        params_key: &str,
        time_after: Option<DateTime<Utc>>,
        connector: Arc<dyn Connector>,
        api: Arc<dyn ApiClient>,
        cancel: &CancellationToken,
    ) -> Result<CollectSummary> {
        let started_at = millis(self.clock.now());
        let checkpoint = self.checkpoints.load(params_key).await?;
        let plan = RunPlan::decide(checkpoint.as_ref(), time_after);

        info!(
            plugin = %params.plugin_name,
            connection = %params.connection_id,
            table = %params.table,
            options = %params.options_hash(),
            incremental = plan.incremental,
            lower_bound = ?plan.lower_bound,
            "Collection mode decided"
        );

        self.sink.prepare(&params.table).await?;
        let records_invalidated = if plan.incremental {
            0
        } else {
            let hidden = self.sink.invalidate(&params.table, params_key).await?;
            METRICS.add_records_invalidated(hidden);
            hidden
        };

        let params_json = params.canonical_json();
        let job = Arc::new(PageJob {
            table: params.table.clone(),
            params_key: params_key.to_string(),
            params_json: params_json.clone(),
            zone: params.zone,
            page_size: connector.page_size(),
            plan: plan.clone(),
            connector,
            api,
            sink: Arc::clone(&self.sink),
            cancel: cancel.clone(),
            next_page: AtomicU32::new(1),
            stop: AtomicBool::new(false),
            pages_fetched: AtomicU32::new(0),
            records_written: AtomicU64::new(0),
        });

        let mut workers = JoinSet::new();
        for _ in 0..self.concurrency {
            let job = Arc::clone(&job);
            workers.spawn(async move { job.work().await });
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let outcome = joined.unwrap_or_else(|e| {
                Err(CollectError::SubTaskFailed(format!("page worker panicked: {}", e)))
            });
            if let Err(err) = outcome {
                job.stop.store(true, Ordering::SeqCst);
                first_error.get_or_insert(err);
            }
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if cancel.is_cancelled() {
            return Err(CollectError::Cancelled);
        }

        let finished_at = millis(self.clock.now());
        let state = CheckpointState {
            params_key: params_key.to_string(),
            plugin_name: params.plugin_name.clone(),
            connection_id: params.connection_id.clone(),
            table: params.table.clone(),
            params: params_json,
            latest_success_start: started_at,
            latest_success_end: finished_at,
            time_after: plan.recorded_time_after,
            created_at: checkpoint.map(|cp| cp.created_at).unwrap_or(finished_at),
            updated_at: finished_at,
        };
        self.checkpoints.commit(state).await?;

        let summary = CollectSummary {
            params_key: params_key.to_string(),
            incremental: plan.incremental,
            lower_bound: plan.lower_bound,
            pages_fetched: job.pages_fetched.load(Ordering::SeqCst),
            records_written: job.records_written.load(Ordering::SeqCst),
            records_invalidated,
            started_at,
            finished_at,
        };
        info!(
            params_key = %params_key,
            table = %params.table,
            pages = summary.pages_fetched,
            records = summary.records_written,
            latest_success_start = %started_at,
            "Collection committed"
        );
        Ok(summary)
    }
}

/// Checkpoints persist epoch milliseconds; keep summaries in the same precision.
fn millis(at: DateTime<Utc>) -> DateTime<Utc> {
    at.trunc_subsecs(3)
}

/// State shared by the page workers of one run.
struct PageJob {
    table: String,
    params_key: String,
    params_json: String,
    zone: Tz,
    page_size: u32,
    plan: RunPlan,
    connector: Arc<dyn Connector>,
    api: Arc<dyn ApiClient>,
    sink: Arc<dyn RawRecordSink>,
    cancel: CancellationToken,
    next_page: AtomicU32,
    stop: AtomicBool,
    pages_fetched: AtomicU32,
    records_written: AtomicU64,
}

impl PageJob {
    async fn work(&self) -> Result<()> {
        let result = self.pages().await;
        if result.is_err() {
            self.stop.store(true, Ordering::SeqCst);
        }
        result
    }

    async fn pages(&self) -> Result<()> {
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(CollectError::Cancelled);
            }

            let page_number = self.next_page.fetch_add(1, Ordering::SeqCst);
            let cursor = PageCursor {
                page_number,
                page_size: self.page_size,
            };
            let query = self
                .connector
                .build_query(&self.plan.query_context(cursor, self.zone));

            let response = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(CollectError::Cancelled),
                fetched = self.api.fetch(self.connector.url_template(), &query) => {
                    fetched.map_err(|e| CollectError::UpstreamUnavailable(e.to_string()))?
                }
            };
            self.pages_fetched.fetch_add(1, Ordering::SeqCst);
            METRICS.inc_pages_fetched();

            let records = self
                .connector
                .parse_response(&response)
                .map_err(|e| CollectError::MalformedResponse {
                    page: page_number,
                    message: e.0,
                })?;

            if records.is_empty() {
                debug!(table = %self.table, page = page_number, "Terminal page reached");
                self.stop.store(true, Ordering::SeqCst);
                return Ok(());
            }

            let batch = records
                .into_iter()
                .map(|data| NewRawRecord {
                    data,
                    url: response.url.clone(),
                    input: None,
                })
                .collect();
            let ids = self
                .sink
                .append(&self.table, &self.params_key, &self.params_json, batch)
                .await?;

            self.records_written
                .fetch_add(ids.len() as u64, Ordering::SeqCst);
            METRICS.add_records_written(ids.len() as u64);
            debug!(table = %self.table, page = page_number, records = ids.len(), "Page stored");
        }
    }
}
