//! The schedule runner as a tracked background thread.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use herald_lifecycle::{ShutdownManager, ShutdownPhase, ShutdownTask, UnitOfWork};
use herald_scheduler::ScheduleRunner;

pub const RUNNER_UNIT: &str = "schedule-runner";

/// Start `runner` on its own thread, polling every `interval`.
///
/// A `STOPPING_NEW_WORK` task raises the stop flag, so no cycle starts once
/// shutdown begins; the thread is tracked so `WAITING_FOR_TASKS` waits for
/// the cycle in progress.
pub fn spawn_runner(
    runner: ScheduleRunner,
    interval: Duration,
    shutdown: &Arc<ShutdownManager>,
) -> anyhow::Result<()> {
    let stop = Arc::new(AtomicBool::new(false));

    let flag = stop.clone();
    shutdown.register_task(
        ShutdownTask::new("runner-stop", ShutdownPhase::StoppingNewWork, move || {
            flag.store(true, Ordering::SeqCst);
            Ok::<_, String>(())
        })
        .priority(10),
    )?;

    let handle = thread::Builder::new()
        .name("herald-runner".to_string())
        .spawn(move || runner.run_forever(interval, &stop))?;
    shutdown.register_unit_of_work(RUNNER_UNIT, UnitOfWork::Thread(handle))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use herald_lifecycle::{PhaseBudgets, ShutdownOptions};
    use herald_scheduler::{JobError, JobOutcome, MemoryScheduleStore};
    use serde_json::Value;

    #[test]
    fn runner_stops_and_is_drained_during_shutdown() {
        let shutdown = Arc::new(ShutdownManager::with_exit_hook(
            ShutdownOptions {
                budgets: PhaseBudgets {
                    waiting_for_tasks: Duration::from_secs(2),
                    ..PhaseBudgets::default()
                },
                ..ShutdownOptions::default()
            },
            Arc::new(|_| {}),
        ));
        let runner = ScheduleRunner::new(
            Arc::new(MemoryScheduleStore::new()),
            Arc::new(|_: &Value, _: &str, _: bool| Ok::<_, JobError>(JobOutcome::success())),
        );
        spawn_runner(runner, Duration::from_secs(3600), &shutdown).unwrap();
        assert_eq!(shutdown.get_status().units[0].name, RUNNER_UNIT);

        assert!(shutdown.shutdown(false));
        let status = shutdown.get_status();
        assert!(status.abandoned_units.is_empty());
        assert!(status.tasks.iter().all(|t| t.completed));
    }
}
