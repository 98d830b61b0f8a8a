//! Storage errors.

use rawflow_protocol::naming::InvalidTableName;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Creating the database directory failed
    #[error("Database path: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    InvalidTable(#[from] InvalidTableName),

    /// A migration script failed; its transaction was rolled back
    #[error("Migration {version} ({name}) failed: {source}")]
    Migration {
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },
}
