//! Error types for the herald-lifecycle crate.

use thiserror::Error;

use crate::phase::ShutdownPhase;

#[derive(Debug, Error)]
pub enum ShutdownError {
    /// Registration attempted after shutdown was requested.
    #[error("shutdown already in progress")]
    ShutdownInProgress,

    #[error("name already registered: {0}")]
    DuplicateName(String),

    /// Tasks can only be bound to phases that run tasks.
    #[error("phase {0} does not run tasks")]
    InvalidPhase(ShutdownPhase),

    #[error("no tracked unit named {0}")]
    UnknownUnit(String),

    /// The worker thread for a task could not be started. Fatal for the
    /// graceful sequence: the manager falls back to the force path.
    #[error("failed to spawn shutdown worker for {name}: {reason}")]
    WorkerSpawn { name: String, reason: String },

    #[error("task {name} failed: {reason}")]
    TaskFailed { name: String, reason: String },

    #[error("task {name} panicked")]
    TaskPanicked { name: String },

    #[error("task {name} exceeded {timeout_ms}ms and was abandoned")]
    TaskTimedOut { name: String, timeout_ms: u64 },

    #[error("failed to install signal handler: {0}")]
    SignalInstall(String),
}

pub type Result<T> = std::result::Result<T, ShutdownError>;
