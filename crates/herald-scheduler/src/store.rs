//! Schedule persistence.
//!
//! [`ScheduleStore`] is the only synchronization point between runners: a
//! cycle holds [`ScheduleStore::begin_cycle`] for its whole duration, and
//! every write made on behalf of a due occurrence is a compare-and-set on the
//! `next_run` value the runner read.

use std::path::Path;

use chrono::{DateTime, Timelike, Utc};
use herald_core::time::to_persisted;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension, Row};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    db::init_db,
    error::{Result, SchedulerError},
    rrule::RecurrenceRule,
    types::{NewSchedule, Schedule},
};

/// Storage interface for schedules.
pub trait ScheduleStore: Send + Sync {
    /// Exclusive guard held by a runner for one whole cycle.
    fn begin_cycle(&self) -> MutexGuard<'_, ()>;

    /// Create an enabled schedule. `next_run` defaults to the rule's first
    /// occurrence after now.
    fn insert(&self, new: NewSchedule) -> Result<Schedule> {
        self.insert_at(new, Utc::now())
    }

    /// [`ScheduleStore::insert`] with an explicit creation instant.
    fn insert_at(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule>;

    fn get(&self, id: &str) -> Result<Schedule>;

    /// All schedules ordered by creation time.
    fn list(&self) -> Result<Vec<Schedule>>;

    fn delete(&self, id: &str) -> Result<()>;

    /// Unconditional enable/disable, for the management API.
    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()>;

    /// Enabled schedules with `next_run <= now`, ascending by `next_run`.
    /// `now` must be in the canonical persisted form.
    fn due(&self, now: &str) -> Result<Vec<Schedule>>;

    /// Move `next_run` from `expected` to `next_run`. Returns `false` when the
    /// row no longer holds `expected` (another runner got there first).
    fn advance(&self, id: &str, expected: &str, next_run: &str) -> Result<bool>;

    /// Disable the schedule if it still holds `expected` as `next_run`.
    fn disable(&self, id: &str, expected: &str) -> Result<bool>;

    /// Disable every enabled test schedule whose `expires_at <= now`.
    fn disable_expired_tests(&self, now: &str) -> Result<usize>;
}

/// Build the full record for an insert.
pub(crate) fn prepare_insert(new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
    let rule = RecurrenceRule::parse(&new.recurrence_rule)?;
    let anchor = now
        .with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now);
    let next_run = match new.next_run {
        Some(at) => at,
        None => rule.next_after(anchor, now)?.ok_or_else(|| {
            SchedulerError::InvalidRule("rule has no future occurrences".to_string())
        })?,
    };
    Ok(Schedule {
        id: Uuid::new_v4().to_string(),
        params: new.params,
        recurrence_rule: new.recurrence_rule,
        next_run: to_persisted(next_run),
        created_at: to_persisted(now),
        enabled: true,
        is_test: new.is_test,
        expires_at: new.expires_at.map(to_persisted),
    })
}

const COLUMNS: &str =
    "id, params, recurrence_rule, next_run, created_at, enabled, is_test, expires_at";

/// SQLite-backed store. One connection, serialized behind a mutex.
pub struct SqliteScheduleStore {
    conn: Mutex<Connection>,
    cycle: Mutex<()>,
}

impl SqliteScheduleStore {
    /// Wrap `conn`, initialising the schema if needed.
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cycle: Mutex::new(()),
        })
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::new(conn)
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(Connection::open_in_memory()?)
    }

    fn raw_rows(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<RawRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(sql)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<rusqlite::Result<_>>()?;
        Ok(rows)
    }
}

/// Row as stored, before `params` is decoded.
struct RawRow {
    id: String,
    params: String,
    recurrence_rule: String,
    next_run: String,
    created_at: String,
    enabled: bool,
    is_test: bool,
    expires_at: Option<String>,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            params: row.get(1)?,
            recurrence_rule: row.get(2)?,
            next_run: row.get(3)?,
            created_at: row.get(4)?,
            enabled: row.get(5)?,
            is_test: row.get(6)?,
            expires_at: row.get(7)?,
        })
    }

    fn into_schedule(self) -> Result<Schedule> {
        let params = serde_json::from_str(&self.params)?;
        Ok(Schedule {
            id: self.id,
            params,
            recurrence_rule: self.recurrence_rule,
            next_run: self.next_run,
            created_at: self.created_at,
            enabled: self.enabled,
            is_test: self.is_test,
            expires_at: self.expires_at,
        })
    }
}

impl ScheduleStore for SqliteScheduleStore {
    fn begin_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock()
    }

    fn insert_at(&self, new: NewSchedule, now: DateTime<Utc>) -> Result<Schedule> {
        let schedule = prepare_insert(new, now)?;
        let params = serde_json::to_string(&schedule.params)?;
        self.conn.lock().execute(
            "INSERT INTO schedules
             (id, params, recurrence_rule, next_run, created_at, enabled, is_test, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 1, ?6, ?7)",
            rusqlite::params![
                schedule.id,
                params,
                schedule.recurrence_rule,
                schedule.next_run,
                schedule.created_at,
                schedule.is_test,
                schedule.expires_at,
            ],
        )?;
        info!(schedule_id = %schedule.id, next_run = %schedule.next_run, "schedule added");
        Ok(schedule)
    }

    fn get(&self, id: &str) -> Result<Schedule> {
        let raw = {
            let conn = self.conn.lock();
            conn.query_row(
                &format!("SELECT {COLUMNS} FROM schedules WHERE id = ?1"),
                [id],
                RawRow::from_row,
            )
            .optional()?
        };
        raw.ok_or_else(|| SchedulerError::ScheduleNotFound { id: id.to_string() })?
            .into_schedule()
    }

    /// Rows whose `params` cannot be decoded are logged and left out.
    fn list(&self) -> Result<Vec<Schedule>> {
        let rows = self.raw_rows(
            &format!("SELECT {COLUMNS} FROM schedules ORDER BY created_at, id"),
            [],
        )?;
        Ok(rows
            .into_iter()
            .filter_map(|raw| {
                let id = raw.id.clone();
                raw.into_schedule()
                    .map_err(|e| warn!(schedule_id = %id, "unreadable schedule row: {e}"))
                    .ok()
            })
            .collect())
    }

    fn delete(&self, id: &str) -> Result<()> {
        let n = self
            .conn
            .lock()
            .execute("DELETE FROM schedules WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        info!(schedule_id = %id, "schedule removed");
        Ok(())
    }

    fn set_enabled(&self, id: &str, enabled: bool) -> Result<()> {
        let n = self.conn.lock().execute(
            "UPDATE schedules SET enabled = ?1 WHERE id = ?2",
            rusqlite::params![enabled, id],
        )?;
        if n == 0 {
            return Err(SchedulerError::ScheduleNotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Due rows whose `params` cannot be decoded are disabled, so they are
    /// reported once instead of on every cycle.
    fn due(&self, now: &str) -> Result<Vec<Schedule>> {
        let rows = self.raw_rows(
            &format!(
                "SELECT {COLUMNS} FROM schedules
                 WHERE enabled = 1 AND next_run <= ?1
                 ORDER BY next_run, id"
            ),
            [now],
        )?;
        let mut due = Vec::with_capacity(rows.len());
        for raw in rows {
            let id = raw.id.clone();
            match raw.into_schedule() {
                Ok(schedule) => due.push(schedule),
                Err(e) => {
                    error!(schedule_id = %id, "unreadable params, disabling schedule: {e}");
                    self.conn
                        .lock()
                        .execute("UPDATE schedules SET enabled = 0 WHERE id = ?1", [&id])?;
                }
            }
        }
        Ok(due)
    }

    fn advance(&self, id: &str, expected: &str, next_run: &str) -> Result<bool> {
        let n = self.conn.lock().execute(
            "UPDATE schedules SET next_run = ?1
             WHERE id = ?2 AND next_run = ?3 AND enabled = 1",
            rusqlite::params![next_run, id, expected],
        )?;
        Ok(n == 1)
    }

    fn disable(&self, id: &str, expected: &str) -> Result<bool> {
        let n = self.conn.lock().execute(
            "UPDATE schedules SET enabled = 0
             WHERE id = ?1 AND next_run = ?2 AND enabled = 1",
            rusqlite::params![id, expected],
        )?;
        Ok(n == 1)
    }

    fn disable_expired_tests(&self, now: &str) -> Result<usize> {
        let n = self.conn.lock().execute(
            "UPDATE schedules SET enabled = 0
             WHERE enabled = 1 AND is_test = 1
               AND expires_at IS NOT NULL AND expires_at <= ?1",
            [now],
        )?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_daily(next_run: &str) -> NewSchedule {
        NewSchedule {
            params: json!({"topic": "rust"}),
            recurrence_rule: "FREQ=DAILY;BYHOUR=6;BYMINUTE=0".to_string(),
            next_run: Some(herald_core::time::to_utc(next_run).unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn insert_computes_next_run_when_absent() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let s = store
            .insert(NewSchedule {
                params: json!({}),
                recurrence_rule: "FREQ=HOURLY".to_string(),
                ..Default::default()
            })
            .unwrap();
        assert!(s.enabled);
        assert!(s.next_run_utc() > s.created_at_utc());
        assert!(s.next_run.ends_with('Z'));
    }

    #[test]
    fn insert_rejects_bad_rule() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let err = store
            .insert(NewSchedule {
                params: json!({}),
                recurrence_rule: "EVERY TUESDAY".to_string(),
                ..Default::default()
            })
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidRule(_)));
    }

    #[test]
    fn due_filters_and_orders() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let late = store.insert(new_daily("2025-08-13T06:00:00Z")).unwrap();
        let early = store.insert(new_daily("2025-08-13T05:00:00Z")).unwrap();
        let future = store.insert(new_daily("2025-08-14T06:00:00Z")).unwrap();
        let off = store.insert(new_daily("2025-08-13T04:00:00Z")).unwrap();
        store.set_enabled(&off.id, false).unwrap();

        let due = store.due("2025-08-13T07:00:00Z").unwrap();
        let ids: Vec<_> = due.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec![early.id.as_str(), late.id.as_str()]);
        assert!(!ids.contains(&future.id.as_str()));
        assert_eq!(due[0].params, json!({"topic": "rust"}));
    }

    #[test]
    fn advance_is_compare_and_set() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let s = store.insert(new_daily("2025-08-13T06:00:00Z")).unwrap();

        assert!(store
            .advance(&s.id, "2025-08-13T06:00:00Z", "2025-08-14T06:00:00Z")
            .unwrap());
        // second writer with the stale value loses
        assert!(!store
            .advance(&s.id, "2025-08-13T06:00:00Z", "2025-08-14T06:00:00Z")
            .unwrap());
        assert!(!store.disable(&s.id, "2025-08-13T06:00:00Z").unwrap());
        assert_eq!(store.get(&s.id).unwrap().next_run, "2025-08-14T06:00:00Z");
    }

    #[test]
    fn expired_test_schedules_are_disabled() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let mut new = new_daily("2025-08-20T06:00:00Z");
        new.is_test = true;
        new.expires_at = Some(herald_core::time::to_utc("2025-08-13T00:00:00Z").unwrap());
        let test = store.insert(new).unwrap();
        let regular = store.insert(new_daily("2025-08-20T06:00:00Z")).unwrap();

        assert_eq!(store.disable_expired_tests("2025-08-13T07:00:00Z").unwrap(), 1);
        assert!(!store.get(&test.id).unwrap().enabled);
        assert!(store.get(&regular.id).unwrap().enabled);
    }

    #[test]
    fn unreadable_params_are_disabled_once() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        let good = store.insert(new_daily("2025-08-13T06:00:00Z")).unwrap();
        let bad = store.insert(new_daily("2025-08-13T05:00:00Z")).unwrap();
        store
            .conn
            .lock()
            .execute(
                "UPDATE schedules SET params = '{not json' WHERE id = ?1",
                [&bad.id],
            )
            .unwrap();

        let due = store.due("2025-08-13T07:00:00Z").unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, good.id);
        assert!(matches!(
            store.get(&bad.id),
            Err(SchedulerError::Serialization(_))
        ));
        let enabled: bool = store
            .conn
            .lock()
            .query_row("SELECT enabled FROM schedules WHERE id = ?1", [&bad.id], |r| r.get(0))
            .unwrap();
        assert!(!enabled);
        // listing still works around the bad row
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.due("2025-08-13T07:00:00Z").unwrap().len(), 1);
    }

    #[test]
    fn delete_missing_is_not_found() {
        let store = SqliteScheduleStore::in_memory().unwrap();
        assert!(matches!(
            store.delete("nope"),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
        assert!(matches!(
            store.get("nope"),
            Err(SchedulerError::ScheduleNotFound { .. })
        ));
    }

    #[test]
    fn on_disk_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("herald.db");
        let id = {
            let store = SqliteScheduleStore::open(&path).unwrap();
            store.insert(new_daily("2025-08-13T06:00:00Z")).unwrap().id
        };
        let store = SqliteScheduleStore::open(&path).unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.get(&id).unwrap().next_run, "2025-08-13T06:00:00Z");
    }
}
