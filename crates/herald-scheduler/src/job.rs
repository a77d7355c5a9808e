//! The job-execution interface consumed by the runner.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;

/// Status reported by an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// The job ran to completion in-process.
    Success,
    /// The job was handed to an external queue.
    Queued,
    /// The job ran but reported a failure of its own.
    Failed,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Success => "success",
            JobStatus::Queued => "queued",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Structured result of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub status: JobStatus,
    /// Executor-specific details (queue position, job output, ...).
    #[serde(default)]
    pub detail: Value,
}

impl JobOutcome {
    pub fn success() -> Self {
        Self {
            status: JobStatus::Success,
            detail: Value::Null,
        }
    }

    pub fn with_status(status: JobStatus, detail: Value) -> Self {
        Self { status, detail }
    }
}

/// Runs the payload of a due schedule.
///
/// Called synchronously by the runner; the schedule is only advanced after
/// this returns. Bounding the run time is the executor's business.
pub trait JobExecutor: Send + Sync {
    fn execute(
        &self,
        params: &Value,
        job_id: &str,
        send_notification: bool,
    ) -> Result<JobOutcome, JobError>;
}

impl<F> JobExecutor for F
where
    F: Fn(&Value, &str, bool) -> Result<JobOutcome, JobError> + Send + Sync,
{
    fn execute(
        &self,
        params: &Value,
        job_id: &str,
        send_notification: bool,
    ) -> Result<JobOutcome, JobError> {
        self(params, job_id, send_notification)
    }
}
