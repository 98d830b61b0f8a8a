//! Per-connector hooks: query builder and response parser.

use chrono::DateTime;
use chrono_tz::Tz;
use thiserror::Error;

use crate::api_client::{ApiResponse, QueryParams};

/// Position within one run. Page numbers start at 1 and only go up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCursor {
    pub page_number: u32,
    pub page_size: u32,
}

/// Everything a query builder may depend on.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryContext {
    pub page: PageCursor,
    /// Decided once per run, before the first page
    pub incremental: bool,
    /// Incremental: checkpoint start. Full: caller `time_after`. In the params zone.
    pub lower_bound: Option<DateTime<Tz>>,
    /// Caller-supplied `time_after`, in the params zone
    pub time_after: Option<DateTime<Tz>>,
}

/// A response the connector cannot make sense of. Never retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl ParseError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Connector capability used by the collector.
///
/// Both hooks must be pure: same input, same output, no external effects.
pub trait Connector: Send + Sync {
    /// URL template handed to the [`ApiClient`](crate::ApiClient).
    fn url_template(&self) -> &str;

    /// Page size for every page of a run.
    fn page_size(&self) -> u32 {
        rawflow_protocol::defaults::DEFAULT_PAGE_SIZE
    }

    fn build_query(&self, ctx: &QueryContext) -> QueryParams;

    /// Split a response into opaque records. An empty result ends the run.
    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Vec<u8>>, ParseError>;
}
