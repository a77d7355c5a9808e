use chrono::{DateTime, Duration, Timelike, Utc};
use herald_core::time::parse_persisted_timestamp;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A persisted recurring-job definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// UUID v4 string, primary key.
    pub id: String,
    /// Opaque payload handed verbatim to the job executor.
    pub params: Value,
    /// RFC 5545 recurrence rule text.
    pub recurrence_rule: String,
    /// ISO-8601 UTC timestamp of the next occurrence, as stored.
    pub next_run: String,
    /// ISO-8601 UTC timestamp of creation, as stored.
    pub created_at: String,
    /// Disabled schedules are never selected.
    pub enabled: bool,
    /// Test schedules get the short execution window and may expire.
    pub is_test: bool,
    /// After this instant a test schedule is disabled regardless of `next_run`.
    pub expires_at: Option<String>,
}

impl Schedule {
    pub fn next_run_utc(&self) -> DateTime<Utc> {
        parse_persisted_timestamp(&self.next_run)
    }

    pub fn created_at_utc(&self) -> DateTime<Utc> {
        parse_persisted_timestamp(&self.created_at)
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at.as_deref().map(parse_persisted_timestamp)
    }

    /// Stand-in for `DTSTART` when the rule text has none: creation time
    /// truncated to the minute.
    pub fn recurrence_anchor(&self) -> DateTime<Utc> {
        let created = self.created_at_utc();
        created
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(created)
    }

    /// Maximum lateness before a due occurrence counts as expired.
    pub fn execution_window(&self, windows: &ExecutionWindows) -> Duration {
        if self.is_test {
            windows.test
        } else {
            windows.regular
        }
    }
}

/// Input for creating a schedule.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewSchedule {
    pub params: Value,
    pub recurrence_rule: String,
    #[serde(default)]
    pub is_test: bool,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    /// First due time. Computed from the rule when absent.
    #[serde(default)]
    pub next_run: Option<DateTime<Utc>>,
}

/// Execution windows per schedule class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionWindows {
    pub test: Duration,
    pub regular: Duration,
}

impl Default for ExecutionWindows {
    fn default() -> Self {
        Self {
            test: Duration::minutes(10),
            regular: Duration::minutes(30),
        }
    }
}

/// Outcome of comparing a schedule's `next_run` to the current instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Due and within its execution window.
    Ready,
    /// Not due yet.
    Future,
    /// Due, but later than its execution window allows.
    Expired { late_by: Duration },
}

/// Per-cycle counters returned by [`crate::ScheduleRunner::run_cycle_at`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    /// Executor returned successfully.
    pub dispatched: usize,
    /// Executor returned an error; the schedule still advanced.
    pub failed: usize,
    /// Skipped for being outside the execution window.
    pub expired: usize,
    /// Set to `enabled = false` this cycle (exhausted, expired test, or past expiry).
    pub disabled: usize,
    /// Returned by the due query but not actionable (not yet due, advanced
    /// by another runner first, next occurrence unknown, or refused by the
    /// executor).
    pub skipped: usize,
}
