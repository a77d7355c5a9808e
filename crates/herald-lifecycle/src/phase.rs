use std::{fmt, time::Duration};

use herald_core::config::ShutdownConfig;
use serde::Serialize;

/// Stages of the shutdown state machine. Transitions only move forward, in
/// declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShutdownPhase {
    #[default]
    Starting,
    StoppingNewWork,
    WaitingForTasks,
    CleaningResources,
    ForceTerminating,
    Completed,
}

impl ShutdownPhase {
    /// Phases that carry tasks and a budget, in execution order.
    pub const SEQUENCE: [ShutdownPhase; 4] = [
        ShutdownPhase::StoppingNewWork,
        ShutdownPhase::WaitingForTasks,
        ShutdownPhase::CleaningResources,
        ShutdownPhase::ForceTerminating,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "STARTING",
            Self::StoppingNewWork => "STOPPING_NEW_WORK",
            Self::WaitingForTasks => "WAITING_FOR_TASKS",
            Self::CleaningResources => "CLEANING_RESOURCES",
            Self::ForceTerminating => "FORCE_TERMINATING",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timeout budget for each non-initial phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseBudgets {
    pub stopping_new_work: Duration,
    pub waiting_for_tasks: Duration,
    pub cleaning_resources: Duration,
    pub force_terminating: Duration,
}

impl PhaseBudgets {
    pub fn budget(&self, phase: ShutdownPhase) -> Duration {
        match phase {
            ShutdownPhase::StoppingNewWork => self.stopping_new_work,
            ShutdownPhase::WaitingForTasks => self.waiting_for_tasks,
            ShutdownPhase::CleaningResources => self.cleaning_resources,
            ShutdownPhase::ForceTerminating => self.force_terminating,
            ShutdownPhase::Starting | ShutdownPhase::Completed => Duration::ZERO,
        }
    }

    /// Upper bound on a graceful sequence.
    pub fn total(&self) -> Duration {
        ShutdownPhase::SEQUENCE
            .iter()
            .map(|p| self.budget(*p))
            .sum()
    }
}

impl Default for PhaseBudgets {
    fn default() -> Self {
        Self {
            stopping_new_work: Duration::from_secs(5),
            waiting_for_tasks: Duration::from_secs(10),
            cleaning_resources: Duration::from_secs(5),
            force_terminating: Duration::from_secs(2),
        }
    }
}

/// Tunables for [`crate::ShutdownManager`].
#[derive(Debug, Clone, Copy)]
pub struct ShutdownOptions {
    pub budgets: PhaseBudgets,
    /// A second signal within this window of the first exits immediately.
    pub repeat_signal_window: Duration,
    /// Wait between terminate and kill for tracked subprocesses.
    pub process_grace: Duration,
    /// Poll interval while draining tracked units.
    pub unit_poll: Duration,
}

impl Default for ShutdownOptions {
    fn default() -> Self {
        Self {
            budgets: PhaseBudgets::default(),
            repeat_signal_window: Duration::from_secs(3),
            process_grace: Duration::from_millis(500),
            unit_poll: Duration::from_millis(100),
        }
    }
}

impl From<&ShutdownConfig> for ShutdownOptions {
    fn from(cfg: &ShutdownConfig) -> Self {
        Self {
            budgets: PhaseBudgets {
                stopping_new_work: Duration::from_secs(cfg.stopping_new_work_secs),
                waiting_for_tasks: Duration::from_secs(cfg.waiting_for_tasks_secs),
                cleaning_resources: Duration::from_secs(cfg.cleaning_resources_secs),
                force_terminating: Duration::from_secs(cfg.force_terminating_secs),
            },
            repeat_signal_window: Duration::from_secs(cfg.repeat_signal_window_secs),
            process_grace: Duration::from_millis(cfg.process_grace_ms),
            ..Self::default()
        }
    }
}
