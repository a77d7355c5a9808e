//! Tracked units of work: threads and subprocesses the manager waits for.

use std::{
    process::Child,
    sync::Arc,
    thread::JoinHandle,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

/// Subprocess handle shared between its owner and the manager.
pub type SharedChild = Arc<Mutex<Child>>;

pub enum UnitOfWork {
    /// Threads cannot be stopped from outside; on the force path they are
    /// only dropped from tracking.
    Thread(JoinHandle<()>),
    Process(SharedChild),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    Thread,
    Process,
}

/// Status row for a tracked unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitReport {
    pub name: String,
    pub kind: UnitKind,
    pub pid: Option<u32>,
}

impl UnitOfWork {
    pub fn kind(&self) -> UnitKind {
        match self {
            Self::Thread(_) => UnitKind::Thread,
            Self::Process(_) => UnitKind::Process,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        match self {
            Self::Thread(_) => None,
            Self::Process(child) => Some(child.lock().id()),
        }
    }

    /// A process whose status can no longer be read counts as finished.
    pub fn is_finished(&self) -> bool {
        match self {
            Self::Thread(handle) => handle.is_finished(),
            Self::Process(child) => match child.lock().try_wait() {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    debug!("try_wait failed, treating process as gone: {e}");
                    true
                }
            },
        }
    }

    /// Ask a subprocess to exit (SIGTERM on unix, hard kill elsewhere).
    pub fn terminate(&self) {
        let Self::Process(child) = self else { return };
        let mut child = child.lock();
        #[cfg(unix)]
        {
            let pid = child.id();
            // Safety: pid belongs to a child we spawned and have not reaped.
            let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
            if rc != 0 {
                debug!(pid, "SIGTERM not delivered, process likely exited");
            }
        }
        #[cfg(not(unix))]
        {
            let _ = child.kill();
        }
        let _ = child.try_wait();
    }

    /// Kill a subprocess and reap it. No-op for threads.
    pub fn kill(&self) {
        let Self::Process(child) = self else { return };
        let mut child = child.lock();
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.kill() {
            warn!(pid = child.id(), "kill failed: {e}");
        }
        let _ = child.wait();
    }
}

/// Terminate every subprocess, give them `grace` to exit, then kill the rest.
/// Threads are dropped. Returns the names of units that had to be killed or
/// abandoned.
pub(crate) fn terminate_all(units: Vec<(String, UnitOfWork)>, grace: Duration) -> Vec<String> {
    let mut abandoned = Vec::new();
    let mut processes = Vec::new();
    for (name, unit) in units {
        match unit {
            UnitOfWork::Thread(handle) => {
                if !handle.is_finished() {
                    warn!(unit = %name, "abandoning tracked thread");
                    abandoned.push(name);
                }
            }
            process @ UnitOfWork::Process(_) => {
                if !process.is_finished() {
                    debug!(unit = %name, pid = ?process.pid(), "terminating subprocess");
                    process.terminate();
                    processes.push((name, process));
                }
            }
        }
    }

    let deadline = Instant::now() + grace;
    while !processes.is_empty() && Instant::now() < deadline {
        processes.retain(|(_, p)| !p.is_finished());
        if !processes.is_empty() {
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    for (name, process) in processes {
        if process.is_finished() {
            continue;
        }
        warn!(unit = %name, pid = ?process.pid(), "subprocess ignored terminate, killing");
        process.kill();
        abandoned.push(name);
    }
    abandoned
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::process::Command;

    fn sleeper(secs: &str) -> SharedChild {
        Arc::new(Mutex::new(Command::new("sleep").arg(secs).spawn().unwrap()))
    }

    #[test]
    fn thread_unit_reports_finished() {
        let unit = UnitOfWork::Thread(std::thread::spawn(|| {}));
        let deadline = Instant::now() + Duration::from_secs(2);
        while !unit.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(unit.is_finished());
        assert_eq!(unit.kind(), UnitKind::Thread);
        assert_eq!(unit.pid(), None);
    }

    #[test]
    fn terminate_stops_a_sleeping_process() {
        let child = sleeper("30");
        let unit = UnitOfWork::Process(child.clone());
        assert!(!unit.is_finished());
        let abandoned = terminate_all(vec![("sleep".into(), unit)], Duration::from_secs(2));
        assert!(abandoned.is_empty());
        assert!(child.lock().try_wait().unwrap().is_some());
    }

    #[test]
    fn kill_is_safe_after_exit() {
        let child = sleeper("0");
        let unit = UnitOfWork::Process(child);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !unit.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        unit.kill();
        assert!(unit.is_finished());
    }
}
