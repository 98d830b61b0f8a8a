//! Migration Gate
//!
//! Process-wide filter in front of every inbound request. When migration
//! scripts are pending at startup, traffic is refused until an operator
//! confirms the migration.
//!
//! ```text
//! Clear -> PendingConfirmation -> Executing -> Clear
//!                                          \-> Failed (terminal)
//! ```

use async_trait::async_trait;
use rawflow_collector::CollectError;
use rawflow_db::{DbError, RawflowDb};
use rawflow_protocol::defaults::{
    MIGRATION_FAILED_MESSAGE, MIGRATION_REQUIRED_MESSAGE, PRECONDITION_REQUIRED_STATUS,
};
use rawflow_protocol::CollectErrorKind;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    Clear,
    PendingConfirmation,
    Executing,
    Failed,
}

impl GateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateState::Clear => "CLEAR",
            GateState::PendingConfirmation => "PENDING_CONFIRMATION",
            GateState::Executing => "EXECUTING",
            GateState::Failed => "FAILED",
        }
    }
}

/// Read-only view of the gate for operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateStatus {
    pub state: GateState,
    /// Names of scripts not yet applied
    pub pending: Vec<String>,
    pub last_error: Option<String>,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GateError {
    /// Scripts are pending (or being applied); only confirmation passes.
    #[error("{}", MIGRATION_REQUIRED_MESSAGE.trim())]
    MigrationRequired,

    /// A migration attempt failed; the gate stays closed.
    #[error("{}: {0}", MIGRATION_FAILED_MESSAGE)]
    MigrationFailed(String),

    #[error("Failed to inspect migrations: {0}")]
    Inspect(String),
}

impl GateError {
    pub fn code(&self) -> &'static str {
        match self {
            GateError::MigrationRequired => "MIGRATION_REQUIRED",
            GateError::MigrationFailed(_) => "MIGRATION_FAILED",
            GateError::Inspect(_) => "MIGRATION_INSPECT_FAILED",
        }
    }

    /// Precondition-failure status carried by every gate rejection.
    pub fn status(&self) -> u16 {
        PRECONDITION_REQUIRED_STATUS
    }

    pub fn kind(&self) -> CollectErrorKind {
        match self {
            GateError::MigrationRequired => CollectErrorKind::MigrationPending,
            GateError::MigrationFailed(_) | GateError::Inspect(_) => {
                CollectErrorKind::MigrationFailed
            }
        }
    }
}

impl From<GateError> for CollectError {
    fn from(err: GateError) -> Self {
        match err {
            GateError::MigrationRequired => CollectError::MigrationPending,
            GateError::MigrationFailed(message) | GateError::Inspect(message) => {
                CollectError::MigrationFailed(message)
            }
        }
    }
}

/// Storage side of the gate. Implemented by [`RawflowDb`]; tests plug in
/// scripted runners.
#[async_trait]
pub trait MigrationRunner: Send + Sync {
    /// True when no script has ever been applied.
    async fn is_fresh(&self) -> Result<bool, DbError>;

    /// Names of scripts not yet applied, in order.
    async fn pending(&self) -> Result<Vec<String>, DbError>;

    /// Apply every pending script, returning the applied names.
    async fn apply(&self) -> Result<Vec<String>, DbError>;
}

#[async_trait]
impl MigrationRunner for RawflowDb {
    async fn is_fresh(&self) -> Result<bool, DbError> {
        Ok(!self.has_migration_history().await?)
    }

    async fn pending(&self) -> Result<Vec<String>, DbError> {
        Ok(self
            .pending_migrations()
            .await?
            .into_iter()
            .map(|m| m.name.to_string())
            .collect())
    }

    async fn apply(&self) -> Result<Vec<String>, DbError> {
        Ok(self
            .apply_pending_migrations()
            .await?
            .into_iter()
            .map(|m| m.name.to_string())
            .collect())
    }
}

#[derive(Debug)]
struct GateInner {
    state: GateState,
    pending: Vec<String>,
    last_error: Option<String>,
}

/// The single gate instance of a sentinel process.
pub struct MigrationGate {
    inner: RwLock<GateInner>,
    /// Serializes confirmations; checks only take the read lock
    confirm_lock: Mutex<()>,
    runner: Arc<dyn MigrationRunner>,
}

impl MigrationGate {
    /// Inspect storage and decide the starting state.
    ///
    /// A fresh database, or `force`, applies pending scripts right away.
    /// Otherwise pending scripts leave the gate awaiting confirmation.
    pub async fn initialize(
        runner: Arc<dyn MigrationRunner>,
        force: bool,
    ) -> Result<Self, GateError> {
        let pending = runner
            .pending()
            .await
            .map_err(|e| GateError::Inspect(e.to_string()))?;

        let gate = Self {
            inner: RwLock::new(GateInner {
                state: GateState::Clear,
                pending: pending.clone(),
                last_error: None,
            }),
            confirm_lock: Mutex::new(()),
            runner,
        };

        if pending.is_empty() {
            info!("Database schema up to date");
            return Ok(gate);
        }

        let fresh = gate
            .runner
            .is_fresh()
            .await
            .map_err(|e| GateError::Inspect(e.to_string()))?;

        if fresh || force {
            info!(
                fresh,
                force,
                scripts = pending.len(),
                "Applying migrations without confirmation"
            );
            gate.inner.write().await.state = GateState::Executing;
            // A failure here leaves the gate Failed; the process keeps
            // serving so the operator can read the status.
            let _ = gate.execute().await;
        } else {
            warn!(
                scripts = ?pending,
                "Pending migrations detected, waiting for operator confirmation"
            );
            gate.inner.write().await.state = GateState::PendingConfirmation;
        }

        Ok(gate)
    }

    /// Admit or reject one request.
    pub async fn check(&self) -> Result<(), GateError> {
        let inner = self.inner.read().await;
        match inner.state {
            GateState::Clear => Ok(()),
            GateState::PendingConfirmation | GateState::Executing => {
                Err(GateError::MigrationRequired)
            }
            GateState::Failed => Err(GateError::MigrationFailed(
                inner.last_error.clone().unwrap_or_default(),
            )),
        }
    }

    /// Operator confirmation. Idempotent: returns immediately with no
    /// applied scripts when nothing is pending.
    pub async fn confirm(&self) -> Result<Vec<String>, GateError> {
        let _confirming = self.confirm_lock.lock().await;
        {
            let mut inner = self.inner.write().await;
            match inner.state {
                GateState::Clear => return Ok(Vec::new()),
                GateState::Failed => {
                    return Err(GateError::MigrationFailed(
                        inner.last_error.clone().unwrap_or_default(),
                    ))
                }
                GateState::PendingConfirmation | GateState::Executing => {
                    inner.state = GateState::Executing;
                }
            }
        }
        info!("Migration confirmed by operator");
        self.execute().await
    }

    pub async fn status(&self) -> GateStatus {
        let inner = self.inner.read().await;
        GateStatus {
            state: inner.state,
            pending: inner.pending.clone(),
            last_error: inner.last_error.clone(),
        }
    }

    pub async fn state(&self) -> GateState {
        self.inner.read().await.state
    }

    /// Apply scripts synchronously; the gate must already be `Executing`.
    async fn execute(&self) -> Result<Vec<String>, GateError> {
        match self.runner.apply().await {
            Ok(applied) => {
                let mut inner = self.inner.write().await;
                inner.state = GateState::Clear;
                inner.pending.clear();
                info!(applied = ?applied, "Migrations applied, gate clear");
                Ok(applied)
            }
            Err(err) => {
                let message = err.to_string();
                let mut inner = self.inner.write().await;
                inner.state = GateState::Failed;
                inner.last_error = Some(message.clone());
                error!(error = %message, "Migration failed, gate closed");
                Err(GateError::MigrationFailed(message))
            }
        }
    }
}
