use std::{fmt, time::Duration};

use serde::Serialize;

use crate::phase::ShutdownPhase;

pub const DEFAULT_PRIORITY: u32 = 50;
pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Cleanup work run once during its phase. An `Err` carries the reason.
pub type TaskCallback = Box<dyn FnOnce() -> Result<(), String> + Send + 'static>;

/// A named cleanup callback bound to a shutdown phase.
///
/// Lower `priority` runs first within a phase. The callback is consumed the
/// first time the task runs, so a task is never re-entered.
pub struct ShutdownTask {
    pub name: String,
    pub phase: ShutdownPhase,
    pub priority: u32,
    pub timeout: Duration,
    pub completed: bool,
    pub error: Option<String>,
    callback: Option<TaskCallback>,
}

impl ShutdownTask {
    pub fn new<F, E>(name: impl Into<String>, phase: ShutdownPhase, callback: F) -> Self
    where
        F: FnOnce() -> Result<(), E> + Send + 'static,
        E: fmt::Display,
    {
        Self {
            name: name.into(),
            phase,
            priority: DEFAULT_PRIORITY,
            timeout: DEFAULT_TASK_TIMEOUT,
            completed: false,
            error: None,
            callback: Some(Box::new(move || callback().map_err(|e| e.to_string()))),
        }
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn take_callback(&mut self) -> Option<TaskCallback> {
        self.callback.take()
    }

    pub(crate) fn report(&self) -> TaskReport {
        TaskReport {
            name: self.name.clone(),
            phase: self.phase,
            priority: self.priority,
            timeout_ms: self.timeout.as_millis() as u64,
            completed: self.completed,
            error: self.error.clone(),
        }
    }
}

impl fmt::Debug for ShutdownTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownTask")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("priority", &self.priority)
            .field("timeout", &self.timeout)
            .field("completed", &self.completed)
            .field("error", &self.error)
            .field("pending", &self.callback.is_some())
            .finish()
    }
}

/// Snapshot of a task for status reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskReport {
    pub name: String,
    pub phase: ShutdownPhase,
    pub priority: u32,
    pub timeout_ms: u64,
    pub completed: bool,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_and_builders() {
        let task = ShutdownTask::new("flush", ShutdownPhase::CleaningResources, || {
            Ok::<_, String>(())
        });
        assert_eq!(task.priority, DEFAULT_PRIORITY);
        assert_eq!(task.timeout, DEFAULT_TASK_TIMEOUT);

        let task = task.priority(10).timeout(Duration::from_millis(250));
        assert_eq!(task.priority, 10);
        assert_eq!(task.report().timeout_ms, 250);
    }

    #[test]
    fn callback_is_taken_once() {
        let mut task = ShutdownTask::new("once", ShutdownPhase::StoppingNewWork, || {
            Err::<(), _>("boom")
        });
        let cb = task.take_callback().unwrap();
        assert_eq!(cb(), Err("boom".to_string()));
        assert!(task.take_callback().is_none());
    }
}
