//! Raw record sink seam.

use async_trait::async_trait;
use rawflow_db::{NewRawRecord, RawflowDb};
use rawflow_protocol::naming::validate_raw_table_name;
use std::sync::Mutex;

use crate::error::{CollectError, Result};

/// Append-only store of opaque records, keyed by (table, params key).
///
/// Appends from concurrent page workers must be safe; no ordering between
/// pages is required.
#[async_trait]
pub trait RawRecordSink: Send + Sync {
    /// Make sure the table can accept records.
    async fn prepare(&self, table: &str) -> Result<()>;

    /// Logically delete the live records of a params key. Returns how many were hidden.
    async fn invalidate(&self, table: &str, params_key: &str) -> Result<u64>;

    /// Append one page worth of records. Returns the assigned ids.
    async fn append(
        &self,
        table: &str,
        params_key: &str,
        params: &str,
        records: Vec<NewRawRecord>,
    ) -> Result<Vec<i64>>;
}

#[async_trait]
impl RawRecordSink for RawflowDb {
    async fn prepare(&self, table: &str) -> Result<()> {
        self.ensure_raw_table(table).await?;
        Ok(())
    }

    async fn invalidate(&self, table: &str, params_key: &str) -> Result<u64> {
        Ok(self.raw_invalidate(table, params_key).await?)
    }

    async fn append(
        &self,
        table: &str,
        params_key: &str,
        params: &str,
        records: Vec<NewRawRecord>,
    ) -> Result<Vec<i64>> {
        Ok(self
            .raw_insert_batch(table, params_key, params, &records)
            .await?)
    }
}

/// One record held by [`MemoryRawSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryRecord {
    pub id: i64,
    pub table: String,
    pub params_key: String,
    pub data: Vec<u8>,
    pub invalidated: bool,
}

/// In-process sink for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryRawSink {
    records: Mutex<Vec<MemoryRecord>>,
}

impl MemoryRawSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Payloads of the live records of a params key, in id order.
    pub fn live(&self, table: &str, params_key: &str) -> Vec<Vec<u8>> {
        self.lock()
            .iter()
            .filter(|r| r.table == table && r.params_key == params_key && !r.invalidated)
            .map(|r| r.data.clone())
            .collect()
    }

    /// Number of stored records, invalidated ones included.
    pub fn stored(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<MemoryRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl RawRecordSink for MemoryRawSink {
    async fn prepare(&self, table: &str) -> Result<()> {
        validate_raw_table_name(table).map_err(|e| CollectError::InvalidParams(e.to_string()))
    }

    async fn invalidate(&self, table: &str, params_key: &str) -> Result<u64> {
        let mut hidden = 0;
        for record in self.lock().iter_mut() {
            if record.table == table && record.params_key == params_key && !record.invalidated {
                record.invalidated = true;
                hidden += 1;
            }
        }
        Ok(hidden)
    }

    async fn append(
        &self,
        table: &str,
        params_key: &str,
        _params: &str,
        records: Vec<NewRawRecord>,
    ) -> Result<Vec<i64>> {
        let mut stored = self.lock();
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let id = stored.len() as i64 + 1;
            stored.push(MemoryRecord {
                id,
                table: table.to_string(),
                params_key: params_key.to_string(),
                data: record.data,
                invalidated: false,
            });
            ids.push(id);
        }
        Ok(ids)
    }
}
