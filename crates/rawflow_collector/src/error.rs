//! Collection error taxonomy.

use rawflow_db::DbError;
use rawflow_protocol::{CollectErrorKind, RemoteFailure};
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CollectError>;

/// Every failure a collection run or subtask can end with.
///
/// The variant decides retry policy (see [`CollectErrorKind::is_retryable`]);
/// none of them are retried inside the collector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollectError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Malformed response on page {page}: {message}")]
    MalformedResponse { page: u32, message: String },

    #[error("A run is already in progress for params {0}")]
    AlreadyRunning(String),

    #[error("Bridge unavailable: {0}")]
    BridgeUnavailable(String),

    #[error("Database migration pending confirmation")]
    MigrationPending,

    #[error("Database migration failed: {0}")]
    MigrationFailed(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid params: {0}")]
    InvalidParams(String),

    #[error("Subtask failed: {0}")]
    SubTaskFailed(String),
}

impl CollectError {
    pub fn kind(&self) -> CollectErrorKind {
        match self {
            CollectError::UpstreamUnavailable(_) => CollectErrorKind::UpstreamUnavailable,
            CollectError::MalformedResponse { .. } => CollectErrorKind::MalformedResponse,
            CollectError::AlreadyRunning(_) => CollectErrorKind::AlreadyRunning,
            CollectError::BridgeUnavailable(_) => CollectErrorKind::BridgeUnavailable,
            CollectError::MigrationPending => CollectErrorKind::MigrationPending,
            CollectError::MigrationFailed(_) => CollectErrorKind::MigrationFailed,
            CollectError::Cancelled => CollectErrorKind::Cancelled,
            CollectError::Storage(_) => CollectErrorKind::Storage,
            CollectError::InvalidParams(_) => CollectErrorKind::InvalidParams,
            CollectError::SubTaskFailed(_) => CollectErrorKind::SubTaskFailed,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }

    /// Wire form, sent back over the bridge in an invoke outcome.
    pub fn to_remote(&self) -> RemoteFailure {
        RemoteFailure {
            kind: self.kind(),
            message: self.to_string(),
        }
    }

    /// Rebuild an error reported by a remote plugin. The kind survives the
    /// trip; details are folded into the message.
    pub fn from_remote(failure: RemoteFailure) -> Self {
        let message = failure.message;
        match failure.kind {
            CollectErrorKind::UpstreamUnavailable => CollectError::UpstreamUnavailable(message),
            CollectErrorKind::MalformedResponse => CollectError::MalformedResponse { page: 0, message },
            CollectErrorKind::AlreadyRunning => CollectError::AlreadyRunning(message),
            CollectErrorKind::BridgeUnavailable => CollectError::BridgeUnavailable(message),
            CollectErrorKind::MigrationPending => CollectError::MigrationPending,
            CollectErrorKind::MigrationFailed => CollectError::MigrationFailed(message),
            CollectErrorKind::Cancelled => CollectError::Cancelled,
            CollectErrorKind::Storage => CollectError::Storage(message),
            CollectErrorKind::InvalidParams => CollectError::InvalidParams(message),
            CollectErrorKind::SubTaskFailed => CollectError::SubTaskFailed(message),
        }
    }
}

impl From<DbError> for CollectError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::InvalidTable(invalid) => CollectError::InvalidParams(invalid.to_string()),
            other => CollectError::Storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_roundtrip_keeps_kind() {
        let err = CollectError::MalformedResponse {
            page: 3,
            message: "expected array".into(),
        };
        let remote = err.to_remote();
        assert_eq!(remote.kind, CollectErrorKind::MalformedResponse);
        assert!(remote.message.contains("page 3"));

        let back = CollectError::from_remote(remote);
        assert_eq!(back.kind(), CollectErrorKind::MalformedResponse);
        assert!(!back.is_retryable());
    }

    #[test]
    fn invalid_table_maps_to_invalid_params() {
        let db_err = DbError::from(
            rawflow_protocol::naming::validate_raw_table_name("Bad").unwrap_err(),
        );
        assert_eq!(CollectError::from(db_err).kind(), CollectErrorKind::InvalidParams);
    }
}
