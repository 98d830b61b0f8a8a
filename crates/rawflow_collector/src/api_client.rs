//! Upstream API seam.
//!
//! Transport, auth, retry/backoff and rate limiting all live behind
//! [`ApiClient`]; an [`ApiError`] means the client has already given up.

use async_trait::async_trait;
use std::collections::BTreeMap;
use thiserror::Error;

/// Query parameters built by a connector. Sorted so that identical inputs
/// produce identical requests.
pub type QueryParams = BTreeMap<String, String>;

/// One upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    pub status: u16,
    /// Resolved request URL
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("request to {url} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        message: String,
    },

    #[error("request to {url} rejected with status {status}: {message}")]
    Rejected {
        url: String,
        status: u16,
        message: String,
    },
}

#[async_trait]
pub trait ApiClient: Send + Sync {
    /// Perform one request against `url_template` with `query`.
    async fn fetch(&self, url_template: &str, query: &QueryParams) -> Result<ApiResponse, ApiError>;
}
