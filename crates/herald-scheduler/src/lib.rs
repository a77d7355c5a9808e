//! `herald-scheduler`: recurring jobs driven by RFC 5545 rules over SQLite.
//!
//! # Overview
//!
//! Schedules are persisted to a SQLite `schedules` table. Each call to
//! [`runner::ScheduleRunner::run_once`] selects enabled schedules whose
//! `next_run` has arrived, classifies them against their execution window,
//! runs the READY ones through a [`job::JobExecutor`] and then advances or
//! disables every schedule it touched.
//!
//! # Readiness
//!
//! | Class     | Condition                               | Action                          |
//! |-----------|-----------------------------------------|---------------------------------|
//! | `Ready`   | due, lateness within window             | execute, then advance           |
//! | `Future`  | `next_run` still ahead (legacy rows)    | leave untouched                 |
//! | `Expired` | lateness beyond window (10 / 30 min)    | test: disable; regular: advance |

pub mod db;
pub mod error;
pub mod job;
pub mod memory;
pub mod rrule;
pub mod runner;
pub mod store;
pub mod types;

pub use error::{JobError, Result, SchedulerError};
pub use job::{JobExecutor, JobOutcome, JobStatus};
pub use memory::MemoryScheduleStore;
pub use rrule::RecurrenceRule;
pub use runner::{RunnerOptions, ScheduleRunner};
pub use store::{ScheduleStore, SqliteScheduleStore};
pub use types::{CycleReport, ExecutionWindows, NewSchedule, Readiness, Schedule};
