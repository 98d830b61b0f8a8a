//! Raw record tables.
//!
//! Rows are append-only. A full re-collection marks the live rows of its
//! params key as invalidated before writing, so readers of live rows see
//! exactly one generation per params key.

use crate::error::Result;
use crate::types::{NewRawRecord, RawRecordRow};
use crate::RawflowDb;
use rawflow_protocol::naming::physical_raw_table;
use sqlx::Row;
use tracing::debug;

impl RawflowDb {
    /// Create the physical table for a raw table name if missing.
    pub async fn ensure_raw_table(&self, table: &str) -> Result<String> {
        let physical = physical_raw_table(table)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {physical} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                params_key TEXT NOT NULL,
                params TEXT NOT NULL,
                data BLOB NOT NULL,
                url TEXT NOT NULL,
                input TEXT,
                collected_at INTEGER NOT NULL,
                invalidated INTEGER NOT NULL DEFAULT 0
            )"#
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS idx{physical}_params ON {physical}(params_key, invalidated)"
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(
            "INSERT OR IGNORE INTO _rawflow_raw_tables (name, physical_name, created_at) VALUES (?, ?, ?)",
        )
        .bind(table)
        .bind(&physical)
        .bind(Self::now_millis())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(physical)
    }

    /// Raw tables created so far.
    pub async fn raw_tables(&self) -> Result<Vec<String>> {
        Ok(
            sqlx::query_scalar("SELECT name FROM _rawflow_raw_tables ORDER BY name")
                .fetch_all(&self.pool)
                .await?,
        )
    }

    /// Append a batch of records in one transaction. Returns the assigned ids.
    pub async fn raw_insert_batch(
        &self,
        table: &str,
        params_key: &str,
        params: &str,
        records: &[NewRawRecord],
    ) -> Result<Vec<i64>> {
        let physical = physical_raw_table(table)?;
        let sql = format!(
            "INSERT INTO {physical} (params_key, params, data, url, input, collected_at) VALUES (?, ?, ?, ?, ?, ?)"
        );
        let collected_at = Self::now_millis();

        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let result = sqlx::query(&sql)
                .bind(params_key)
                .bind(params)
                .bind(&record.data)
                .bind(&record.url)
                .bind(&record.input)
                .bind(collected_at)
                .execute(&mut *tx)
                .await?;
            ids.push(result.last_insert_rowid());
        }
        tx.commit().await?;

        debug!(table, params_key, count = ids.len(), "Raw records appended");
        Ok(ids)
    }

    /// Logically delete the live rows of a params key. Returns the number of rows invalidated.
    pub async fn raw_invalidate(&self, table: &str, params_key: &str) -> Result<u64> {
        let physical = physical_raw_table(table)?;
        let result = sqlx::query(&format!(
            "UPDATE {physical} SET invalidated = 1 WHERE params_key = ? AND invalidated = 0"
        ))
        .bind(params_key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Live (non-invalidated) rows of a params key, in id order.
    pub async fn raw_list_live(&self, table: &str, params_key: &str) -> Result<Vec<RawRecordRow>> {
        let physical = physical_raw_table(table)?;
        let rows = sqlx::query(&format!(
            r#"SELECT id, params_key, params, data, url, input, collected_at
               FROM {physical}
               WHERE params_key = ? AND invalidated = 0
               ORDER BY id ASC"#
        ))
        .bind(params_key)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| RawRecordRow {
                id: row.get("id"),
                params_key: row.get("params_key"),
                params: row.get("params"),
                data: row.get("data"),
                url: row.get("url"),
                input: row.get("input"),
                collected_at: Self::millis_to_datetime(row.get("collected_at")),
            })
            .collect())
    }

    /// Total stored rows of a params key, invalidated ones included.
    pub async fn raw_count_all(&self, table: &str, params_key: &str) -> Result<u64> {
        let physical = physical_raw_table(table)?;
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {physical} WHERE params_key = ?"
        ))
        .bind(params_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DbError;

    const TABLE: &str = "tapd_api_worklogs";

    fn record(body: &str) -> NewRawRecord {
        NewRawRecord {
            data: body.as_bytes().to_vec(),
            url: "timesheets".to_string(),
            input: None,
        }
    }

    async fn db_with_table() -> RawflowDb {
        let db = RawflowDb::open_in_memory().await.unwrap();
        db.apply_pending_migrations().await.unwrap();
        db.ensure_raw_table(TABLE).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_invalid_table_name_rejected() {
        let db = RawflowDb::open_in_memory().await.unwrap();
        db.apply_pending_migrations().await.unwrap();
        let err = db.ensure_raw_table("worklogs; DROP TABLE x").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidTable(_)));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_and_registered() {
        let db = db_with_table().await;
        assert_eq!(db.ensure_raw_table(TABLE).await.unwrap(), "_raw_tapd_api_worklogs");
        assert_eq!(db.raw_tables().await.unwrap(), vec![TABLE.to_string()]);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let db = db_with_table().await;
        let first = db.raw_insert_batch(TABLE, "k", "{}", &[record("a"), record("b")]).await.unwrap();
        let second = db.raw_insert_batch(TABLE, "k", "{}", &[record("c")]).await.unwrap();
        assert!(first[0] < first[1]);
        assert!(first[1] < second[0]);
    }

    #[tokio::test]
    async fn test_invalidate_hides_rows_but_keeps_them() {
        let db = db_with_table().await;
        db.raw_insert_batch(TABLE, "k", "{}", &[record("a"), record("b")]).await.unwrap();
        db.raw_insert_batch(TABLE, "other", "{}", &[record("z")]).await.unwrap();

        assert_eq!(db.raw_invalidate(TABLE, "k").await.unwrap(), 2);
        db.raw_insert_batch(TABLE, "k", "{}", &[record("c")]).await.unwrap();

        let live = db.raw_list_live(TABLE, "k").await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].data, b"c".to_vec());
        assert_eq!(db.raw_count_all(TABLE, "k").await.unwrap(), 3);
        assert_eq!(db.raw_list_live(TABLE, "other").await.unwrap().len(), 1);
    }
}
