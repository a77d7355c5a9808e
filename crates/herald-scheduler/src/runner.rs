use std::{
    ops::ControlFlow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};

use chrono::{DateTime, Duration, Utc};
use herald_core::{
    config::RunnerConfig,
    time::{now_utc, to_persisted},
};
use tracing::{debug, error, info, warn};

use crate::{
    error::{JobError, Result},
    job::JobExecutor,
    rrule::RecurrenceRule,
    store::ScheduleStore,
    types::{CycleReport, ExecutionWindows, Readiness, Schedule},
};

/// How often `run_forever` checks its stop flag while sleeping.
const STOP_POLL: std::time::Duration = std::time::Duration::from_millis(200);

/// Knobs for [`ScheduleRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunnerOptions {
    pub windows: ExecutionWindows,
    /// Forwarded to the executor for every job.
    pub send_notification: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            windows: ExecutionWindows::default(),
            send_notification: true,
        }
    }
}

impl From<&RunnerConfig> for RunnerOptions {
    fn from(cfg: &RunnerConfig) -> Self {
        Self {
            windows: ExecutionWindows {
                test: Duration::seconds(cfg.test_window_secs as i64),
                regular: Duration::seconds(cfg.regular_window_secs as i64),
            },
            send_notification: cfg.send_notification,
        }
    }
}

/// Classify `schedule` against `now` and its execution window.
pub fn classify(schedule: &Schedule, now: DateTime<Utc>, windows: &ExecutionWindows) -> Readiness {
    let due_at = schedule.next_run_utc();
    if due_at > now {
        return Readiness::Future;
    }
    let late_by = now - due_at;
    if late_by > schedule.execution_window(windows) {
        Readiness::Expired { late_by }
    } else {
        Readiness::Ready
    }
}

/// Identifier handed to the executor; unique per schedule occurrence.
pub fn job_identifier(schedule: &Schedule, due_at: DateTime<Utc>) -> String {
    format!("schedule-{}-{}", schedule.id, due_at.format("%Y%m%dT%H%M%SZ"))
}

/// Polls a [`ScheduleStore`] and dispatches due schedules, one cycle per call.
///
/// A cycle holds the store's cycle guard from the due query until the last
/// write, so runners sharing a store never interleave. Within a cycle READY
/// schedules run in ascending `next_run` order and each is advanced only
/// after its executor call has returned.
pub struct ScheduleRunner {
    store: Arc<dyn ScheduleStore>,
    executor: Arc<dyn JobExecutor>,
    options: RunnerOptions,
}

impl ScheduleRunner {
    pub fn new(store: Arc<dyn ScheduleStore>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            store,
            executor,
            options: RunnerOptions::default(),
        }
    }

    pub fn with_options(mut self, options: RunnerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn store(&self) -> &Arc<dyn ScheduleStore> {
        &self.store
    }

    /// Run one cycle now. Returns the number of successful dispatches.
    pub fn run_once(&self) -> Result<usize> {
        self.run_once_at(now_utc())
    }

    pub fn run_once_at(&self, now: DateTime<Utc>) -> Result<usize> {
        Ok(self.run_cycle_at(now)?.dispatched)
    }

    /// Run one cycle as of `now` and report what happened.
    ///
    /// Only the due query can fail the cycle; executor and per-schedule write
    /// failures are logged and the cycle moves on.
    pub fn run_cycle_at(&self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _cycle = self.store.begin_cycle();
        let now_str = to_persisted(now);
        let mut report = CycleReport::default();

        match self.store.disable_expired_tests(&now_str) {
            Ok(0) => {}
            Ok(n) => {
                info!(count = n, "test schedules past expires_at disabled");
                report.disabled += n;
            }
            Err(e) => error!("expiry sweep failed: {e}"),
        }

        let mut due = self.store.due(&now_str)?;
        // Legacy rows may not sort lexically; order by the parsed instant.
        due.sort_by_key(|s| s.next_run_utc());

        for schedule in due {
            if self.process(&schedule, now, &mut report).is_break() {
                break;
            }
        }

        debug!(?report, "cycle finished");
        Ok(report)
    }

    /// Run cycles every `interval` until `stop` is set.
    pub fn run_forever(&self, interval: std::time::Duration, stop: &AtomicBool) {
        info!(interval_secs = interval.as_secs(), "schedule runner started");
        while !stop.load(Ordering::SeqCst) {
            match self.run_once() {
                Ok(0) => debug!("no schedules dispatched"),
                Ok(n) => info!(dispatched = n, "cycle complete"),
                Err(e) => error!("schedule cycle failed: {e}"),
            }

            let deadline = Instant::now() + interval;
            while !stop.load(Ordering::SeqCst) {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                std::thread::sleep(STOP_POLL.min(deadline - now));
            }
        }
        info!("schedule runner stopped");
    }

    /// Handle one due schedule. Breaks when the executor refuses new work,
    /// which ends the cycle with the remaining schedules untouched.
    fn process(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        report: &mut CycleReport,
    ) -> ControlFlow<()> {
        let rule = match RecurrenceRule::parse(&schedule.recurrence_rule) {
            Ok(rule) => rule,
            Err(e) => {
                error!(schedule_id = %schedule.id, "unusable recurrence rule, disabling: {e}");
                self.disable(schedule, report);
                return ControlFlow::Continue(());
            }
        };

        let readiness = classify(schedule, now, &self.options.windows);
        match readiness {
            Readiness::Future => {
                debug!(schedule_id = %schedule.id, next_run = %schedule.next_run, "not due yet");
                report.skipped += 1;
                return ControlFlow::Continue(());
            }
            Readiness::Expired { late_by } if schedule.is_test => {
                report.expired += 1;
                warn!(
                    schedule_id = %schedule.id,
                    late_secs = late_by.num_seconds(),
                    "test schedule missed its window, disabling"
                );
                self.disable(schedule, report);
                return ControlFlow::Continue(());
            }
            _ => {}
        }

        // Resolved before dispatch: a schedule whose next occurrence cannot
        // be computed is neither run nor moved.
        let next = match rule.next_after(schedule.recurrence_anchor(), now) {
            Ok(next) => next,
            Err(e) => {
                error!(schedule_id = %schedule.id, "next occurrence unknown, schedule left as is: {e}");
                report.skipped += 1;
                return ControlFlow::Continue(());
            }
        };

        if let Readiness::Expired { late_by } = readiness {
            report.expired += 1;
            warn!(
                schedule_id = %schedule.id,
                late_secs = late_by.num_seconds(),
                "schedule missed its window, skipping to next occurrence"
            );
            self.settle(schedule, next, report);
            return ControlFlow::Continue(());
        }

        let job_id = job_identifier(schedule, schedule.next_run_utc());
        info!(schedule_id = %schedule.id, %job_id, is_test = schedule.is_test, "executing schedule");
        match self
            .executor
            .execute(&schedule.params, &job_id, self.options.send_notification)
        {
            Ok(outcome) => {
                info!(schedule_id = %schedule.id, %job_id, status = %outcome.status, "job dispatched");
                report.dispatched += 1;
            }
            Err(JobError::Refused(reason)) => {
                warn!(schedule_id = %schedule.id, %job_id, "job not started, ending cycle: {reason}");
                report.skipped += 1;
                return ControlFlow::Break(());
            }
            Err(e) => {
                error!(schedule_id = %schedule.id, %job_id, "job execution failed: {e}");
                report.failed += 1;
            }
        }
        self.settle(schedule, next, report);
        ControlFlow::Continue(())
    }

    /// Advance to `next`, or disable when the rule has no further occurrence.
    fn settle(&self, schedule: &Schedule, next: Option<DateTime<Utc>>, report: &mut CycleReport) {
        let Some(next) = next else {
            info!(schedule_id = %schedule.id, "recurrence exhausted, disabling");
            self.disable(schedule, report);
            return;
        };
        let next_str = to_persisted(next);
        match self.store.advance(&schedule.id, &schedule.next_run, &next_str) {
            Ok(true) => debug!(schedule_id = %schedule.id, next_run = %next_str, "schedule advanced"),
            Ok(false) => {
                warn!(schedule_id = %schedule.id, "schedule changed underneath this cycle, not advanced");
                report.skipped += 1;
            }
            Err(e) => error!(schedule_id = %schedule.id, "failed to advance schedule: {e}"),
        }
    }

    fn disable(&self, schedule: &Schedule, report: &mut CycleReport) {
        match self.store.disable(&schedule.id, &schedule.next_run) {
            Ok(true) => report.disabled += 1,
            Ok(false) => {
                warn!(schedule_id = %schedule.id, "schedule changed underneath this cycle, not disabled");
                report.skipped += 1;
            }
            Err(e) => error!(schedule_id = %schedule.id, "failed to disable schedule: {e}"),
        }
    }
}
