//! Versioned migration scripts.
//!
//! Scripts are applied in version order, each in its own transaction
//! together with its history row, so a failed script leaves no trace.
//! Applying is idempotent: scripts already present in the history table
//! are skipped.

use crate::error::{DbError, Result};
use crate::schema::HISTORY_TABLE;
use crate::types::AppliedMigration;
use crate::RawflowDb;
use sqlx::Row;
use tracing::info;

/// One migration script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Migration {
    pub version: i64,
    pub name: &'static str,
    /// Statements executed in order inside one transaction
    pub statements: &'static [&'static str],
}

/// All migrations known to this build, ordered by version.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 20240105000001,
        name: "create_collector_state",
        statements: &[
            r#"CREATE TABLE _rawflow_collector_state (
                params_key TEXT PRIMARY KEY,
                plugin_name TEXT NOT NULL,
                connection_id TEXT NOT NULL,
                table_name TEXT NOT NULL,
                params TEXT NOT NULL,
                latest_success_start INTEGER NOT NULL,
                latest_success_end INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )"#,
            "CREATE INDEX idx_collector_state_plugin ON _rawflow_collector_state(plugin_name, connection_id)",
        ],
    },
    Migration {
        version: 20240212000001,
        name: "collector_state_time_after",
        statements: &["ALTER TABLE _rawflow_collector_state ADD COLUMN time_after INTEGER"],
    },
    Migration {
        version: 20240318000001,
        name: "create_raw_table_registry",
        statements: &[r#"CREATE TABLE _rawflow_raw_tables (
                name TEXT PRIMARY KEY,
                physical_name TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )"#],
    },
];

impl RawflowDb {
    /// Migrations recorded in the history table, oldest first.
    pub async fn applied_migrations(&self) -> Result<Vec<AppliedMigration>> {
        let rows = sqlx::query(&format!(
            "SELECT version, name, applied_at FROM {HISTORY_TABLE} ORDER BY version ASC"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| AppliedMigration {
                version: row.get("version"),
                name: row.get("name"),
                applied_at: Self::millis_to_datetime(row.get("applied_at")),
            })
            .collect())
    }

    /// Scripts of [`MIGRATIONS`] not yet applied.
    pub async fn pending_migrations(&self) -> Result<Vec<Migration>> {
        self.pending_migrations_in(MIGRATIONS).await
    }

    /// Scripts of `available` not yet applied, in version order.
    pub async fn pending_migrations_in(&self, available: &[Migration]) -> Result<Vec<Migration>> {
        let applied: Vec<i64> = self
            .applied_migrations()
            .await?
            .into_iter()
            .map(|m| m.version)
            .collect();

        let mut pending: Vec<Migration> = available
            .iter()
            .filter(|m| !applied.contains(&m.version))
            .copied()
            .collect();
        pending.sort_by_key(|m| m.version);
        Ok(pending)
    }

    /// Apply every pending script of [`MIGRATIONS`]. Returns the applied scripts.
    pub async fn apply_pending_migrations(&self) -> Result<Vec<Migration>> {
        self.apply_migrations(MIGRATIONS).await
    }

    /// Apply every pending script of `available`.
    ///
    /// Stops at the first failing script; earlier scripts stay applied.
    pub async fn apply_migrations(&self, available: &[Migration]) -> Result<Vec<Migration>> {
        let pending = self.pending_migrations_in(available).await?;
        let mut applied = Vec::with_capacity(pending.len());

        for migration in pending {
            self.apply_one(&migration).await?;
            info!(
                version = migration.version,
                name = migration.name,
                "Migration applied"
            );
            applied.push(migration);
        }

        Ok(applied)
    }

    async fn apply_one(&self, migration: &Migration) -> Result<()> {
        let failed = |source| DbError::Migration {
            version: migration.version,
            name: migration.name,
            source,
        };

        let mut tx = self.pool.begin().await?;

        for statement in migration.statements {
            sqlx::query(statement)
                .execute(&mut *tx)
                .await
                .map_err(failed)?;
        }

        sqlx::query(&format!(
            "INSERT INTO {HISTORY_TABLE} (version, name, applied_at) VALUES (?, ?, ?)"
        ))
        .bind(migration.version)
        .bind(migration.name)
        .bind(Self::now_millis())
        .execute(&mut *tx)
        .await
        .map_err(failed)?;

        tx.commit().await?;
        Ok(())
    }
}
