#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rawflow_collector::{
    ApiClient, ApiError, ApiResponse, Connector, ManualClock, ParseError, QueryContext,
    QueryParams,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const TABLE: &str = "tapd_api_worklogs";

pub fn at(y: i32, m: u32, d: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
}

/// Worklog-style connector: `modified > <date>` filter, ascending by creation.
pub struct WorklogConnector;

impl Connector for WorklogConnector {
    fn url_template(&self) -> &str {
        "timesheets"
    }

    fn page_size(&self) -> u32 {
        2
    }

    fn build_query(&self, ctx: &QueryContext) -> QueryParams {
        let mut query = QueryParams::new();
        query.insert("page".into(), ctx.page.page_number.to_string());
        query.insert("limit".into(), ctx.page.page_size.to_string());
        query.insert("order".into(), "created asc".into());
        if let Some(lower) = ctx.lower_bound {
            query.insert("modified".into(), format!(">{}", lower.format("%Y-%m-%d")));
        }
        query
    }

    fn parse_response(&self, response: &ApiResponse) -> Result<Vec<Vec<u8>>, ParseError> {
        let items: Vec<serde_json::Value> = serde_json::from_slice(&response.body)
            .map_err(|e| ParseError::new(format!("expected a JSON array: {}", e)))?;
        Ok(items.iter().map(|item| item.to_string().into_bytes()).collect())
    }
}

enum Page {
    Body(String),
    Fail,
    Hang,
    /// Blocks until `release` is notified, then serves an empty page
    Hold,
}

/// Upstream that serves scripted pages by page number; pages past the
/// script return an empty array.
#[derive(Default)]
pub struct ScriptedApi {
    pages: Mutex<HashMap<u32, Page>>,
    calls: AtomicUsize,
    queries: Mutex<Vec<QueryParams>>,
    /// Moved forward one minute per fetch
    clock: Option<Arc<ManualClock>>,
    pub entered: Notify,
    pub release: Notify,
}

impl ScriptedApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pages 1..=n, each holding `per_page` records.
    pub fn with_pages(n: u32, per_page: u32) -> Self {
        let api = Self::new();
        for page in 1..=n {
            let items: Vec<_> = (0..per_page)
                .map(|i| serde_json::json!({ "id": page * 100 + i }))
                .collect();
            api.set_body(page, serde_json::Value::Array(items).to_string());
        }
        api
    }

    pub fn ticking(mut self, clock: Arc<ManualClock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn set_body(&self, page: u32, body: impl Into<String>) {
        self.pages.lock().unwrap().insert(page, Page::Body(body.into()));
    }

    pub fn fail_page(&self, page: u32) {
        self.pages.lock().unwrap().insert(page, Page::Fail);
    }

    pub fn hang_page(&self, page: u32) {
        self.pages.lock().unwrap().insert(page, Page::Hang);
    }

    pub fn hold_page(&self, page: u32) {
        self.pages.lock().unwrap().insert(page, Page::Hold);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> Vec<QueryParams> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl ApiClient for ScriptedApi {
    async fn fetch(&self, url_template: &str, query: &QueryParams) -> Result<ApiResponse, ApiError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(clock) = &self.clock {
            clock.advance(chrono::Duration::minutes(1));
        }
        self.queries.lock().unwrap().push(query.clone());
        let page: u32 = query["page"].parse().unwrap();
        let url = format!("{}?page={}", url_template, page);

        let held = matches!(self.pages.lock().unwrap().get(&page), Some(Page::Hold));
        if held {
            self.entered.notify_one();
            self.release.notified().await;
        }

        let body = match self.pages.lock().unwrap().get(&page) {
            Some(Page::Body(body)) => Ok(body.clone()),
            Some(Page::Hold) => Ok("[]".to_string()),
            Some(Page::Fail) => Err(ApiError::RetriesExhausted {
                url: url.clone(),
                attempts: 3,
                message: "503 Service Unavailable".into(),
            }),
            Some(Page::Hang) => Err(ApiError::Rejected {
                url: url.clone(),
                status: 0,
                message: "hang".into(),
            }),
            None => Ok("[]".to_string()),
        };

        if matches!(&body, Err(ApiError::Rejected { status: 0, .. })) {
            self.entered.notify_one();
            std::future::pending::<()>().await;
        }

        body.map(|body| ApiResponse {
            status: 200,
            url,
            body: body.into_bytes(),
        })
    }
}
