//! Phase-based shutdown coordinator.
//!
//! One [`ShutdownManager`] is built by the composition root and handed to
//! every collaborator that registers cleanup work. All registry mutation and
//! snapshot reads go through one reentrant mutex; the requested and completed
//! flags are atomics so hot paths (request middleware, runner loops) can poll
//! them without locking.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, RecvTimeoutError},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex, ReentrantMutex};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    error::{Result, ShutdownError},
    phase::{ShutdownOptions, ShutdownPhase},
    signals::SignalKind,
    task::{ShutdownTask, TaskCallback, TaskReport},
    unit::{self, UnitOfWork, UnitReport},
};

/// Exit status used when a repeated signal bypasses the graceful sequence.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Called with an exit status when the process must stop immediately.
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Default)]
struct Registry {
    phase: ShutdownPhase,
    tasks: Vec<ShutdownTask>,
    units: BTreeMap<String, UnitOfWork>,
    abandoned: Vec<String>,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
    forced: bool,
}

#[derive(Default)]
struct SignalState {
    count: u32,
    first_at: Option<Instant>,
}

/// Point-in-time view of the manager, served over HTTP.
#[derive(Debug, Clone, Serialize)]
pub struct ShutdownStatus {
    pub phase: ShutdownPhase,
    pub requested: bool,
    pub completed: bool,
    pub forced: bool,
    pub signal_count: u32,
    pub pending_tasks: usize,
    pub tasks: Vec<TaskReport>,
    pub units: Vec<UnitReport>,
    pub abandoned_units: Vec<String>,
    pub elapsed_ms: Option<u64>,
}

pub struct ShutdownManager {
    state: ReentrantMutex<RefCell<Registry>>,
    requested: AtomicBool,
    completed: AtomicBool,
    signals: Mutex<SignalState>,
    done: Mutex<bool>,
    done_cv: Condvar,
    options: ShutdownOptions,
    exit_hook: ExitHook,
}

impl ShutdownManager {
    pub fn new(options: ShutdownOptions) -> Self {
        Self::with_exit_hook(options, Arc::new(|code| std::process::exit(code)))
    }

    /// Build a manager whose immediate exits go through `exit_hook` instead
    /// of `std::process::exit`.
    pub fn with_exit_hook(options: ShutdownOptions, exit_hook: ExitHook) -> Self {
        Self {
            state: ReentrantMutex::new(RefCell::new(Registry::default())),
            requested: AtomicBool::new(false),
            completed: AtomicBool::new(false),
            signals: Mutex::new(SignalState::default()),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
            options,
            exit_hook,
        }
    }

    pub fn options(&self) -> &ShutdownOptions {
        &self.options
    }

    /// Closures passed here must not call back into the manager.
    fn with_state<R>(&self, f: impl FnOnce(&mut Registry) -> R) -> R {
        let guard = self.state.lock();
        let mut registry = guard.borrow_mut();
        f(&mut registry)
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    pub fn register_task(&self, task: ShutdownTask) -> Result<()> {
        if !ShutdownPhase::SEQUENCE.contains(&task.phase) {
            return Err(ShutdownError::InvalidPhase(task.phase));
        }
        self.with_state(|r| {
            if self.requested.load(Ordering::Acquire) {
                warn!(task = %task.name, "task registration rejected, shutdown in progress");
                return Err(ShutdownError::ShutdownInProgress);
            }
            if r.tasks.iter().any(|t| t.name == task.name) {
                return Err(ShutdownError::DuplicateName(task.name));
            }
            debug!(
                task = %task.name,
                phase = %task.phase,
                priority = task.priority,
                "shutdown task registered"
            );
            r.tasks.push(task);
            Ok(())
        })
    }

    pub fn register_unit_of_work(&self, name: impl Into<String>, unit: UnitOfWork) -> Result<()> {
        let name = name.into();
        self.with_state(|r| {
            if self.requested.load(Ordering::Acquire) {
                return Err(ShutdownError::ShutdownInProgress);
            }
            if r.units.contains_key(&name) {
                return Err(ShutdownError::DuplicateName(name));
            }
            debug!(unit = %name, kind = ?unit.kind(), "tracking unit of work");
            r.units.insert(name, unit);
            Ok(())
        })
    }

    /// Stop tracking a unit that finished normally. Once shutdown has begun
    /// the manager owns every tracked unit and this is rejected.
    pub fn unregister_unit_of_work(&self, name: &str) -> Result<UnitOfWork> {
        self.with_state(|r| {
            if self.requested.load(Ordering::Acquire) {
                return Err(ShutdownError::ShutdownInProgress);
            }
            r.units
                .remove(name)
                .ok_or_else(|| ShutdownError::UnknownUnit(name.to_string()))
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_shutdown_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ShutdownPhase {
        self.with_state(|r| r.phase)
    }

    pub fn get_status(&self) -> ShutdownStatus {
        let signal_count = self.signals.lock().count;
        self.with_state(|r| ShutdownStatus {
            phase: r.phase,
            requested: self.is_shutdown_requested(),
            completed: self.is_shutdown_completed(),
            forced: r.forced,
            signal_count,
            pending_tasks: r.tasks.iter().filter(|t| !t.completed && t.error.is_none()).count(),
            tasks: r.tasks.iter().map(ShutdownTask::report).collect(),
            units: r
                .units
                .iter()
                .map(|(name, unit)| UnitReport {
                    name: name.clone(),
                    kind: unit.kind(),
                    pid: unit.pid(),
                })
                .collect(),
            abandoned_units: r.abandoned.clone(),
            elapsed_ms: r.elapsed.map(|d| d.as_millis() as u64),
        })
    }

    /// Block until the sequence reaches COMPLETED, or `timeout` passes.
    /// Returns whether it completed.
    pub fn wait_for_completion(&self, timeout: Option<Duration>) -> bool {
        let mut done = self.done.lock();
        match timeout {
            None => {
                while !*done {
                    self.done_cv.wait(&mut done);
                }
                true
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !*done {
                    if self.done_cv.wait_until(&mut done, deadline).timed_out() {
                        return *done;
                    }
                }
                true
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown sequence
    // -----------------------------------------------------------------------

    /// Drive the shutdown sequence. Only the first call does any work; later
    /// calls return at once.
    ///
    /// Returns `false` when the sequence ended on the force path (requested
    /// with `force`, or escalated after a fatal phase error), `true`
    /// otherwise.
    pub fn shutdown(&self, force: bool) -> bool {
        let first = self.with_state(|r| {
            if self.requested.swap(true, Ordering::AcqRel) {
                return false;
            }
            r.started_at = Some(Instant::now());
            true
        });
        if !first {
            debug!("shutdown already requested");
            return self.with_state(|r| !r.forced);
        }

        info!(force, "shutdown started");
        let outcome = if force {
            Err("forced by caller".to_string())
        } else {
            self.run_graceful().map_err(|e| e.to_string())
        };
        if let Err(reason) = outcome {
            self.force_terminate(&reason);
        }
        self.finish()
    }

    fn run_graceful(&self) -> Result<()> {
        for phase in ShutdownPhase::SEQUENCE {
            self.run_phase(phase)?;
        }
        Ok(())
    }

    fn run_phase(&self, phase: ShutdownPhase) -> Result<()> {
        let started = Instant::now();
        let budget = self.options.budgets.budget(phase);
        let deadline = started + budget;

        let order = self.with_state(|r| {
            r.phase = phase;
            let mut order: Vec<(u32, usize)> = r
                .tasks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.phase == phase)
                .map(|(i, t)| (t.priority, i))
                .collect();
            // ties keep registration order
            order.sort();
            order.into_iter().map(|(_, i)| i).collect::<Vec<_>>()
        });
        info!(
            phase = %phase,
            tasks = order.len(),
            budget_ms = budget.as_millis() as u64,
            "entering shutdown phase"
        );

        for index in order {
            let (name, timeout, callback) = self.with_state(|r| {
                let task = &mut r.tasks[index];
                (task.name.clone(), task.timeout, task.take_callback())
            });
            let Some(callback) = callback else { continue };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                warn!(phase = %phase, task = %name, "phase budget exhausted, task skipped");
                self.record(index, Err("skipped: phase budget exhausted".to_string()));
                continue;
            }

            match run_task(&name, callback, timeout.min(remaining)) {
                Ok(()) => {
                    debug!(phase = %phase, task = %name, "shutdown task completed");
                    self.record(index, Ok(()));
                }
                Err(e @ ShutdownError::WorkerSpawn { .. }) => {
                    self.record(index, Err(e.to_string()));
                    return Err(e);
                }
                Err(e) => {
                    warn!(phase = %phase, task = %name, "{e}");
                    self.record(index, Err(e.to_string()));
                }
            }
        }

        match phase {
            ShutdownPhase::WaitingForTasks => self.drain_units(deadline),
            ShutdownPhase::ForceTerminating => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                self.terminate_units(self.options.process_grace.min(remaining));
            }
            _ => {}
        }

        let elapsed = started.elapsed();
        if elapsed > budget {
            warn!(
                phase = %phase,
                elapsed_ms = elapsed.as_millis() as u64,
                "shutdown phase overran its budget"
            );
        }
        Ok(())
    }

    fn record(&self, index: usize, outcome: std::result::Result<(), String>) {
        self.with_state(|r| {
            let task = &mut r.tasks[index];
            match outcome {
                Ok(()) => task.completed = true,
                Err(reason) => task.error = Some(reason),
            }
        });
    }

    /// Poll tracked units until all finish or `deadline` passes. Units still
    /// running at the deadline are logged as abandoned and left tracked.
    fn drain_units(&self, deadline: Instant) {
        loop {
            let running: Vec<String> = self.with_state(|r| {
                r.units.retain(|name, unit| {
                    let finished = unit.is_finished();
                    if finished {
                        debug!(unit = %name, "tracked unit finished");
                    }
                    !finished
                });
                r.units.keys().cloned().collect()
            });
            if running.is_empty() {
                info!("all tracked units finished");
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(units = ?running, "tracked units still running at deadline, abandoning");
                self.with_state(|r| r.abandoned.extend(running));
                return;
            }
            thread::sleep(self.options.unit_poll.min(deadline - now));
        }
    }

    fn terminate_units(&self, grace: Duration) {
        let units: Vec<(String, UnitOfWork)> =
            self.with_state(|r| std::mem::take(&mut r.units).into_iter().collect());
        if units.is_empty() {
            return;
        }
        let abandoned = unit::terminate_all(units, grace);
        self.with_state(|r| {
            for name in abandoned {
                if !r.abandoned.contains(&name) {
                    r.abandoned.push(name);
                }
            }
        });
    }

    fn force_terminate(&self, reason: &str) {
        error!(reason, "shutdown escalated to force termination");
        self.with_state(|r| {
            r.phase = ShutdownPhase::ForceTerminating;
            r.forced = true;
        });
        self.terminate_units(self.options.process_grace);
    }

    fn finish(&self) -> bool {
        let (elapsed, forced) = self.with_state(|r| {
            r.phase = ShutdownPhase::Completed;
            r.elapsed = r.started_at.map(|s| s.elapsed());
            (r.elapsed, r.forced)
        });
        self.completed.store(true, Ordering::Release);
        *self.done.lock() = true;
        self.done_cv.notify_all();
        info!(
            elapsed_ms = elapsed.map(|d| d.as_millis() as u64),
            forced,
            "shutdown completed"
        );
        !forced
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    /// Entry point for every termination signal source.
    ///
    /// The first signal starts the graceful sequence on its own thread. A
    /// second signal inside the repeat window, or any signal after the
    /// sequence completed, calls the exit hook immediately.
    pub fn handle_signal(self: &Arc<Self>, signal: SignalKind) {
        let now = Instant::now();
        let (count, exit_now) = {
            let mut s = self.signals.lock();
            s.count += 1;
            let first = *s.first_at.get_or_insert(now);
            let repeated =
                s.count > 1 && now.duration_since(first) <= self.options.repeat_signal_window;
            (s.count, repeated || self.is_shutdown_completed())
        };

        if exit_now {
            warn!(%signal, count, "termination signal repeated, exiting immediately");
            (self.exit_hook)(FORCED_EXIT_CODE);
            return;
        }
        if count > 1 {
            info!(%signal, "shutdown already in progress, signal ignored");
            return;
        }

        info!(%signal, "termination signal received, starting shutdown");
        let manager = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("herald-shutdown".to_string())
            .spawn(move || {
                manager.shutdown(false);
            });
        if let Err(e) = spawned {
            error!("cannot spawn shutdown thread: {e}");
            self.shutdown(true);
        }
    }
}

/// Run `callback` on its own thread and wait at most `limit` for it.
/// A task that overruns is left running detached.
fn run_task(name: &str, callback: TaskCallback, limit: Duration) -> Result<()> {
    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name(format!("shutdown-{name}"))
        .spawn(move || {
            let outcome = panic::catch_unwind(AssertUnwindSafe(callback));
            let _ = tx.send(outcome);
        })
        .map_err(|e| ShutdownError::WorkerSpawn {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

    match rx.recv_timeout(limit) {
        Ok(Ok(Ok(()))) => Ok(()),
        Ok(Ok(Err(reason))) => Err(ShutdownError::TaskFailed {
            name: name.to_string(),
            reason,
        }),
        Ok(Err(_)) | Err(RecvTimeoutError::Disconnected) => Err(ShutdownError::TaskPanicked {
            name: name.to_string(),
        }),
        Err(RecvTimeoutError::Timeout) => Err(ShutdownError::TaskTimedOut {
            name: name.to_string(),
            timeout_ms: limit.as_millis() as u64,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseBudgets;

    fn quick() -> ShutdownManager {
        let budget = Duration::from_millis(300);
        ShutdownManager::with_exit_hook(
            ShutdownOptions {
                budgets: PhaseBudgets {
                    stopping_new_work: budget,
                    waiting_for_tasks: budget,
                    cleaning_resources: budget,
                    force_terminating: budget,
                },
                unit_poll: Duration::from_millis(10),
                ..ShutdownOptions::default()
            },
            Arc::new(|_| {}),
        )
    }

    #[test]
    fn run_task_reports_each_outcome() {
        let ok: TaskCallback = Box::new(|| Ok(()));
        assert!(run_task("ok", ok, Duration::from_secs(1)).is_ok());

        let failing: TaskCallback = Box::new(|| Err("nope".to_string()));
        assert!(matches!(
            run_task("err", failing, Duration::from_secs(1)),
            Err(ShutdownError::TaskFailed { reason, .. }) if reason == "nope"
        ));

        let panicking: TaskCallback = Box::new(|| panic!("boom"));
        assert!(matches!(
            run_task("panic", panicking, Duration::from_secs(1)),
            Err(ShutdownError::TaskPanicked { .. })
        ));

        let slow: TaskCallback = Box::new(|| {
            thread::sleep(Duration::from_secs(2));
            Ok(())
        });
        assert!(matches!(
            run_task("slow", slow, Duration::from_millis(50)),
            Err(ShutdownError::TaskTimedOut { timeout_ms: 50, .. })
        ));
    }

    #[test]
    fn status_is_readable_while_lock_is_held() {
        let manager = quick();
        let guard = manager.state.lock();
        // same thread re-enters the reentrant mutex
        let status = manager.get_status();
        drop(guard);
        assert_eq!(status.phase, ShutdownPhase::Starting);
        assert!(!status.requested);
    }

    #[test]
    fn phase_moves_to_completed() {
        let manager = quick();
        assert_eq!(manager.phase(), ShutdownPhase::Starting);
        assert!(manager.shutdown(false));
        assert_eq!(manager.phase(), ShutdownPhase::Completed);
        assert!(manager.get_status().elapsed_ms.is_some());
    }

    #[test]
    fn starting_and_completed_do_not_take_tasks() {
        let manager = quick();
        let task = ShutdownTask::new("x", ShutdownPhase::Completed, || Ok::<_, String>(()));
        assert!(matches!(
            manager.register_task(task),
            Err(ShutdownError::InvalidPhase(ShutdownPhase::Completed))
        ));
    }
}
