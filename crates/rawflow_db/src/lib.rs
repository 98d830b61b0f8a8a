//! Storage layer for rawflow.
//!
//! One SQLite database holds three kinds of tables:
//! - `_rawflow_migration_history`: bootstrap table, created on open
//! - collector state (checkpoints), created by migration scripts
//! - raw tables (`_raw_<source>_api_<entity>`), created on demand by collectors
//!
//! # Usage
//!
//! ```rust,ignore
//! use rawflow_db::{RawflowDb, Result};
//!
//! let db = RawflowDb::open("~/.rawflow/rawflow.sqlite3").await?;
//! if !db.has_migration_history().await? {
//!     db.apply_pending_migrations().await?;
//! }
//! let checkpoint = db.checkpoint_load("3f1c...").await?;
//! ```

mod checkpoint;
mod error;
pub mod migrations;
mod raw;
mod schema;
mod types;

pub use error::{DbError, Result};
pub use migrations::{Migration, MIGRATIONS};
pub use types::*;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Handle to the rawflow database. Cheap to clone.
#[derive(Clone)]
pub struct RawflowDb {
    pool: SqlitePool,
}

impl RawflowDb {
    /// Open (creating if needed) the database file, parent directories
    /// included.
    ///
    /// Only the migration history table is created here. Everything else
    /// comes from migration scripts, which the caller applies (or gates).
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir)?,
            _ => {}
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        info!(path = %path.display(), "Storage ready");
        Ok(db)
    }

    /// Open a private in-memory database (tests, dry runs).
    ///
    /// Pinned to a single connection that never expires, since every
    /// SQLite connection to `:memory:` is its own database.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Wait for pooled connections to close (flushes the WAL).
    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamps are stored as epoch milliseconds.
impl RawflowDb {
    pub(crate) fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    pub(crate) fn millis_to_datetime(millis: i64) -> chrono::DateTime<chrono::Utc> {
        chrono::DateTime::from_timestamp_millis(millis).unwrap_or_else(chrono::Utc::now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_creates_missing_directories() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("state").join("rawflow.sqlite3");

        let db = RawflowDb::open(&file).await.unwrap();
        assert!(file.exists());
        assert!(!db.has_migration_history().await.unwrap());

        db.close().await;
    }

    #[tokio::test]
    async fn millis_convert_back_exactly() {
        let millis = 1_710_028_800_000;
        assert_eq!(RawflowDb::millis_to_datetime(millis).timestamp_millis(), millis);
    }
}
