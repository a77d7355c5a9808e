// End-to-end cycles against an on-disk SQLite store.

use std::sync::Arc;

use chrono::{Duration, TimeZone, Utc};
use herald_scheduler::{
    JobError, JobExecutor, JobOutcome, NewSchedule, ScheduleRunner, ScheduleStore,
    SqliteScheduleStore,
};
use parking_lot::Mutex;
use serde_json::{json, Value};

fn store() -> (tempfile::TempDir, Arc<SqliteScheduleStore>) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteScheduleStore::open(dir.path().join("herald.db")).unwrap();
    (dir, Arc::new(store))
}

fn counting_executor(count: Arc<Mutex<Vec<(String, bool)>>>) -> Arc<dyn JobExecutor> {
    Arc::new(move |_: &Value, job_id: &str, notify: bool| {
        count.lock().push((job_id.to_string(), notify));
        Ok::<_, JobError>(JobOutcome::success())
    })
}

#[test]
fn daily_schedule_two_minutes_late_runs_once_and_moves_to_tomorrow() {
    let (_dir, store) = store();
    let now = Utc.with_ymd_and_hms(2025, 8, 13, 15, 52, 0).unwrap();
    let created = Utc.with_ymd_and_hms(2025, 8, 1, 9, 30, 0).unwrap();
    let schedule = store
        .insert_at(
            NewSchedule {
                params: json!({"topics": ["ai", "rust"]}),
                recurrence_rule: "FREQ=DAILY;BYHOUR=15;BYMINUTE=50".to_string(),
                next_run: Some(now - Duration::minutes(2)),
                ..Default::default()
            },
            created,
        )
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let runner = ScheduleRunner::new(store.clone(), counting_executor(calls.clone()));

    assert_eq!(runner.run_once_at(now).unwrap(), 1);
    let after = store.get(&schedule.id).unwrap();
    assert_eq!(after.next_run, "2025-08-14T15:50:00Z");
    assert!(after.enabled);

    let calls = calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(
        calls[0].0,
        format!("schedule-{}-20250813T155000Z", schedule.id)
    );
    assert!(calls[0].1);

    // same instant again: nothing left to do
    drop(calls);
    assert_eq!(runner.run_once_at(now).unwrap(), 0);
}

#[test]
fn next_run_strictly_increases_across_cycles() {
    let (_dir, store) = store();
    let start = Utc.with_ymd_and_hms(2025, 8, 13, 6, 0, 0).unwrap();
    let schedule = store
        .insert(NewSchedule {
            params: json!({}),
            recurrence_rule: "DTSTART:20250813T060000Z\nRRULE:FREQ=HOURLY".to_string(),
            next_run: Some(start),
            ..Default::default()
        })
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let runner = ScheduleRunner::new(store.clone(), counting_executor(calls.clone()));

    let mut previous = store.get(&schedule.id).unwrap().next_run_utc();
    for hour in 0..5 {
        let now = start + Duration::hours(hour) + Duration::minutes(1);
        assert_eq!(runner.run_once_at(now).unwrap(), 1);
        let next = store.get(&schedule.id).unwrap().next_run_utc();
        assert!(next > previous);
        assert!(next > now);
        previous = next;
    }
    assert_eq!(calls.lock().len(), 5);
}

#[test]
fn test_schedule_past_expiry_is_disabled_even_when_not_due() {
    let (_dir, store) = store();
    let now = Utc.with_ymd_and_hms(2025, 8, 13, 12, 0, 0).unwrap();
    let schedule = store
        .insert(NewSchedule {
            params: json!({}),
            recurrence_rule: "FREQ=DAILY".to_string(),
            is_test: true,
            expires_at: Some(now - Duration::minutes(1)),
            next_run: Some(now + Duration::hours(6)),
        })
        .unwrap();

    let calls = Arc::new(Mutex::new(Vec::new()));
    let runner = ScheduleRunner::new(store.clone(), counting_executor(calls.clone()));
    let report = runner.run_cycle_at(now).unwrap();

    assert_eq!(report.disabled, 1);
    assert_eq!(report.dispatched, 0);
    assert!(!store.get(&schedule.id).unwrap().enabled);
}
