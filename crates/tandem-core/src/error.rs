use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TandemError {
    #[error("not initialized: run 'tandem init' in {}", .0.display())]
    NotInitialized(PathBuf),

    #[error("repository not registered: {}", .0.display())]
    NotRegistered(PathBuf),

    #[error("corrupt record at {}: {reason}", .path.display())]
    CorruptRecord { path: PathBuf, reason: String },

    #[error("runtime has shut down")]
    RuntimeStopped,

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TandemError>;

// ---------------------------------------------------------------------------
// Lock errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("lock held by {holder} until {}", .expires_at.format("%Y-%m-%d %H:%M:%S UTC"))]
    AlreadyHeld {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("lock {lock_id} is not the current lock (held by {holder})")]
    NotHolder { lock_id: String, holder: String },

    #[error("lock {lock_id} expired at {}", .expires_at.format("%Y-%m-%d %H:%M:%S UTC"))]
    Expired {
        lock_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("no lock is held")]
    NotFound,
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

/// Failure classes reported by a VCS engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineErrorKind {
    Timeout,
    Network,
    Auth,
    Conflict,
    NotFound,
    Corrupt,
    Other,
}

impl std::fmt::Display for EngineErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineErrorKind::Timeout => "timeout",
            EngineErrorKind::Network => "network",
            EngineErrorKind::Auth => "auth",
            EngineErrorKind::Conflict => "conflict",
            EngineErrorKind::NotFound => "not_found",
            EngineErrorKind::Corrupt => "corrupt",
            EngineErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct EngineError {
    pub kind: EngineErrorKind,
    pub message: String,
}

impl EngineError {
    pub fn new(kind: EngineErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Network, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Timeout, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(EngineErrorKind::Auth, message)
    }
}

// ---------------------------------------------------------------------------
// Resilience errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResilienceError {
    #[error("gave up after {attempts} attempt(s): {last}")]
    RetriesExhausted { attempts: u32, last: EngineError },

    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen { endpoint: String },

    #[error("queued for later delivery as {id}: {reason}")]
    Queued { id: Uuid, reason: String },

    #[error("fatal engine error: {0}")]
    Fatal(EngineError),

    #[error("cancelled")]
    Cancelled,
}

// ---------------------------------------------------------------------------
// Orchestrator errors
// ---------------------------------------------------------------------------

/// Commit failures. An unchanged working tree is not an error; it is reported
/// as `CommitOutcome::NothingToCommit`.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum OrchestratorError {
    #[error("engine failure: {0}")]
    EngineFailure(EngineError),

    #[error("superseded by a newer commit request")]
    Cancelled,

    #[error("commit queued offline as {id}: {reason}")]
    Queued { id: Uuid, reason: String },

    #[error("remote unavailable: {0}")]
    Unavailable(ResilienceError),
}

impl From<ResilienceError> for OrchestratorError {
    fn from(err: ResilienceError) -> Self {
        match err {
            ResilienceError::Fatal(e) => OrchestratorError::EngineFailure(e),
            ResilienceError::Cancelled => OrchestratorError::Cancelled,
            ResilienceError::Queued { id, reason } => OrchestratorError::Queued { id, reason },
            other => OrchestratorError::Unavailable(other),
        }
    }
}
