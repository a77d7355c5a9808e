//! Phased shutdown for long-running herald processes.
//!
//! [`ShutdownManager`] walks a fixed sequence of phases, each with its own
//! budget:
//!
//! | Phase | Default budget | Extra work after tasks |
//! |-------|----------------|------------------------|
//! | `STOPPING_NEW_WORK` | 5s | |
//! | `WAITING_FOR_TASKS` | 10s | drain tracked units until the deadline |
//! | `CLEANING_RESOURCES` | 5s | |
//! | `FORCE_TERMINATING` | 2s | terminate, then kill, leftover subprocesses |
//!
//! Tasks run in ascending priority on their own worker thread with a timeout.
//! A failing or overrunning task is logged and the phase moves on.

pub mod error;
pub mod manager;
pub mod phase;
pub mod signals;
pub mod task;
pub mod unit;

pub use error::{Result, ShutdownError};
pub use manager::{ExitHook, ShutdownManager, ShutdownStatus, FORCED_EXIT_CODE};
pub use phase::{PhaseBudgets, ShutdownOptions, ShutdownPhase};
pub use signals::{platform_default, SignalKind, SignalSource};
pub use task::{ShutdownTask, TaskReport, DEFAULT_PRIORITY, DEFAULT_TASK_TIMEOUT};
pub use unit::{SharedChild, UnitKind, UnitOfWork, UnitReport};
