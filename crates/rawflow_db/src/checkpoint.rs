//! Collector checkpoint rows.

use crate::error::Result;
use crate::types::CheckpointState;
use crate::RawflowDb;
use sqlx::Row;

impl RawflowDb {
    /// Load the checkpoint for a params key.
    pub async fn checkpoint_load(&self, params_key: &str) -> Result<Option<CheckpointState>> {
        let row = sqlx::query(
            r#"
            SELECT params_key, plugin_name, connection_id, table_name, params,
                   latest_success_start, latest_success_end, time_after,
                   created_at, updated_at
            FROM _rawflow_collector_state
            WHERE params_key = ?
            "#,
        )
        .bind(params_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| CheckpointState {
            params_key: row.get("params_key"),
            plugin_name: row.get("plugin_name"),
            connection_id: row.get("connection_id"),
            table: row.get("table_name"),
            params: row.get("params"),
            latest_success_start: Self::millis_to_datetime(row.get("latest_success_start")),
            latest_success_end: Self::millis_to_datetime(row.get("latest_success_end")),
            time_after: row
                .get::<Option<i64>, _>("time_after")
                .map(Self::millis_to_datetime),
            created_at: Self::millis_to_datetime(row.get("created_at")),
            updated_at: Self::millis_to_datetime(row.get("updated_at")),
        }))
    }

    /// Insert or replace the checkpoint for `state.params_key` in one statement.
    ///
    /// The original `created_at` survives replacement.
    pub async fn checkpoint_commit(&self, state: &CheckpointState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO _rawflow_collector_state (
                params_key, plugin_name, connection_id, table_name, params,
                latest_success_start, latest_success_end, time_after,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(params_key) DO UPDATE SET
                plugin_name = excluded.plugin_name,
                connection_id = excluded.connection_id,
                table_name = excluded.table_name,
                params = excluded.params,
                latest_success_start = excluded.latest_success_start,
                latest_success_end = excluded.latest_success_end,
                time_after = excluded.time_after,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&state.params_key)
        .bind(&state.plugin_name)
        .bind(&state.connection_id)
        .bind(&state.table)
        .bind(&state.params)
        .bind(state.latest_success_start.timestamp_millis())
        .bind(state.latest_success_end.timestamp_millis())
        .bind(state.time_after.map(|t| t.timestamp_millis()))
        .bind(state.created_at.timestamp_millis())
        .bind(state.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Checkpoints of one plugin connection, most recently updated first.
    pub async fn checkpoint_list(
        &self,
        plugin_name: &str,
        connection_id: &str,
    ) -> Result<Vec<CheckpointState>> {
        let keys: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT params_key FROM _rawflow_collector_state
            WHERE plugin_name = ? AND connection_id = ?
            ORDER BY updated_at DESC
            "#,
        )
        .bind(plugin_name)
        .bind(connection_id)
        .fetch_all(&self.pool)
        .await?;

        let mut states = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(state) = self.checkpoint_load(&key).await? {
                states.push(state);
            }
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn state(key: &str, start_day: u32) -> CheckpointState {
        let start = Utc.with_ymd_and_hms(2024, 3, start_day, 0, 0, 0).unwrap();
        CheckpointState {
            params_key: key.to_string(),
            plugin_name: "tapd".to_string(),
            connection_id: "1".to_string(),
            table: "tapd_api_worklogs".to_string(),
            params: r#"{"workspace_id":42}"#.to_string(),
            latest_success_start: start,
            latest_success_end: start + chrono::Duration::minutes(5),
            time_after: None,
            created_at: start,
            updated_at: start,
        }
    }

    async fn migrated_db() -> RawflowDb {
        let db = RawflowDb::open_in_memory().await.unwrap();
        db.apply_pending_migrations().await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_load_missing_returns_none() {
        let db = migrated_db().await;
        assert!(db.checkpoint_load("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_then_load() {
        let db = migrated_db().await;
        let mut s = state("k1", 10);
        s.time_after = Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        db.checkpoint_commit(&s).await.unwrap();

        assert_eq!(db.checkpoint_load("k1").await.unwrap(), Some(s));
    }

    #[tokio::test]
    async fn test_recommit_keeps_created_at() {
        let db = migrated_db().await;
        let first = state("k1", 10);
        db.checkpoint_commit(&first).await.unwrap();

        let mut second = state("k1", 11);
        second.created_at = second.latest_success_start;
        db.checkpoint_commit(&second).await.unwrap();

        let loaded = db.checkpoint_load("k1").await.unwrap().unwrap();
        assert_eq!(loaded.latest_success_start, second.latest_success_start);
        assert_eq!(loaded.created_at, first.created_at);
    }

    #[tokio::test]
    async fn test_list_by_connection() {
        let db = migrated_db().await;
        db.checkpoint_commit(&state("k1", 10)).await.unwrap();
        db.checkpoint_commit(&state("k2", 12)).await.unwrap();

        let listed = db.checkpoint_list("tapd", "1").await.unwrap();
        let keys: Vec<_> = listed.iter().map(|s| s.params_key.as_str()).collect();
        assert_eq!(keys, vec!["k2", "k1"]);
        assert!(db.checkpoint_list("tapd", "2").await.unwrap().is_empty());
    }
}
