//! Persisted entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last successful collection window for one params key.
///
/// Written once per successful run and never partially updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub params_key: String,
    pub plugin_name: String,
    pub connection_id: String,
    pub table: String,
    /// Canonical JSON of the collection params, kept for operators
    pub params: String,
    /// Start instant of the last successful run; the next incremental lower bound
    pub latest_success_start: DateTime<Utc>,
    pub latest_success_end: DateTime<Utc>,
    /// Caller lower bound the committing run was started with (None = all history)
    pub time_after: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record about to be appended to a raw table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRawRecord {
    pub data: Vec<u8>,
    /// Request URL the record was fetched from
    pub url: String,
    /// Optional input row that produced the request (for detail collectors)
    pub input: Option<String>,
}

/// A stored raw record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecordRow {
    pub id: i64,
    pub params_key: String,
    pub params: String,
    pub data: Vec<u8>,
    pub url: String,
    pub input: Option<String>,
    pub collected_at: DateTime<Utc>,
}

/// One applied migration, as recorded in the history table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedMigration {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}
