//! Bootstrap schema. Everything beyond the migration history lives in
//! [`crate::migrations`].

use crate::error::Result;
use crate::RawflowDb;

pub(crate) const HISTORY_TABLE: &str = "_rawflow_migration_history";

impl RawflowDb {
    pub(crate) async fn ensure_schema(&self) -> Result<()> {
        // journal_mode=WAL is a no-op on :memory: databases
        sqlx::query("PRAGMA journal_mode=WAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA synchronous=NORMAL")
            .execute(&self.pool)
            .await?;
        sqlx::query("PRAGMA busy_timeout=5000")
            .execute(&self.pool)
            .await?;

        sqlx::query(&format!(
            r#"CREATE TABLE IF NOT EXISTS {HISTORY_TABLE} (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at INTEGER NOT NULL
            )"#
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Whether any migration has ever been applied.
    ///
    /// `false` means a fresh database, which is migrated without
    /// confirmation since there is no data to lose.
    pub async fn has_migration_history(&self) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {HISTORY_TABLE}"))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}
