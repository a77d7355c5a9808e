use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};

use crate::{
    error::{Result, SchedulerError},
    store::{prepare_insert, ScheduleStore},
    types::{NewSchedule, Schedule},
};

/// Process-local store with the same semantics as the SQLite one.
///
/// Used by tests and by callers that keep schedules in memory only.
#[derive(Default)]
pub struct MemoryScheduleStore {
    schedules: Mutex<HashMap<String, Schedule>>,
    cycle: Mutex<()>,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully formed record as-is, e.g. to seed legacy timestamp formats.
    pub fn put(&self, schedule: Schedule) {
        self.schedules.lock().insert(schedule.id.clone(), schedule);
    }
}

impl ScheduleStore for MemoryScheduleStore {
    fn begin_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock()
    }

    fn insert_at(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
        let schedule = prepare_insert(new, now)?;
        self.put(schedule.clone());
        Ok(schedule)
    }

    fn get(&self, id: &str) -> Result<Schedule> {
        self.schedules
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    fn list(&self) -> Result<Vec<Schedule>> {
        let mut all: Vec<Schedule> = self.schedules.lock().values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(all)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.schedules
            .lock()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let mut map = self.schedules.lock();
        let s = map
            .get_mut(id)
            .ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?;
        s.enabled = enabled;
        Ok(())
    }

    fn due(&self, now: &str) -> Result<Vec<Schedule>> {
        let mut due: Vec<Schedule> = self
            .schedules
            .lock()
            .values()
            .filter(|s| s.enabled && s.next_run.as_str() <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.next_run.cmp(&b.next_run).then_with(|| a.id.cmp(&b.id)));
        Ok(due)
    }

    fn advance(&self, id: &str, expected: &str, next_run: &str) -> Result<bool> {
        let mut map = self.schedules.lock();
        match map.get_mut(id) {
            Some(s) if s.enabled && s.next_run == expected => {
                s.next_run = next_run.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn disable(&self, id: &str, expected: &str) -> Result<bool> {
        let mut map = self.schedules.lock();
        match map.get_mut(id) {
            Some(s) if s.enabled && s.next_run == expected => {
                s.enabled = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn disable_expired_tests(&self, now: &str) -> Result<usize> {
        let mut n = 0;
        for s in self.schedules.lock().values_mut() {
            let past_expiry = s.expires_at.as_deref().is_some_and(|at| at <= now);
            if s.enabled && s.is_test && past_expiry {
                s.enabled = false;
                n += 1;
            }
        }
        Ok(n)
    }
}
