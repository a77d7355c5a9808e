use thiserror::Error;

/// Errors that can occur within the scheduler subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The recurrence rule text could not be parsed or uses unsupported parts.
    #[error("Invalid recurrence rule: {0}")]
    InvalidRule(String),

    /// The next occurrence could not be found within the lookup's scan
    /// limit. Says nothing about whether the rule is exhausted.
    #[error("Recurrence lookup gave up after scanning {periods} periods")]
    ScanLimit { periods: u64 },

    /// No schedule with the given ID exists in the store.
    #[error("Schedule not found: {id}")]
    ScheduleNotFound { id: String },

    /// `params` could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a [`crate::JobExecutor`].
#[derive(Debug, Error)]
pub enum JobError {
    /// The job ran and reported failure.
    #[error("Job failed: {0}")]
    Failed(String),

    /// The job process could not be started or waited on.
    #[error("Failed to start job: {0}")]
    Spawn(#[from] std::io::Error),

    /// The job could not be handed to the external queue.
    #[error("Queue error: {0}")]
    Queue(String),

    /// The job was killed before it finished (e.g. during shutdown).
    #[error("Job interrupted: {0}")]
    Interrupted(String),

    /// The executor declined to start the job, so the occurrence was never
    /// attempted.
    #[error("Job not started: {0}")]
    Refused(String),
}
