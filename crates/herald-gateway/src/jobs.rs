//! Job executors handed to the schedule runner.
//!
//! The digest pipeline itself lives outside this process. A due schedule is
//! either run as a configured command (`runner.command`) or pushed onto a
//! Redis list (`runner.queue_url`) for an external worker.

use std::{
    io::{Read, Write},
    process::{Command, Stdio},
    sync::Arc,
    thread,
    time::Duration,
};

use herald_core::{config::RunnerConfig, time};
use herald_lifecycle::{SharedChild, ShutdownManager, UnitOfWork};
use herald_scheduler::{JobError, JobExecutor, JobOutcome, JobStatus};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(20);

/// Pick the executor for this process: queue when a URL is configured,
/// otherwise the configured command.
pub fn build_executor(
    config: &RunnerConfig,
    shutdown: Arc<ShutdownManager>,
) -> anyhow::Result<Arc<dyn JobExecutor>> {
    if let Some(url) = config.queue_url.as_deref() {
        info!(key = %config.queue_key, "jobs are pushed to a redis queue");
        return Ok(Arc::new(QueueExecutor::connect(url, &config.queue_key)?));
    }
    match config.command.as_ref() {
        Some(argv) if !argv.is_empty() => {
            info!(command = ?argv, "jobs run as a subprocess");
            Ok(Arc::new(CommandExecutor::new(argv.clone(), shutdown)))
        }
        _ => anyhow::bail!(
            "no job executor configured: set runner.command or runner.queue_url (--queue-url)"
        ),
    }
}

fn job_payload(params: &Value, job_id: &str, send_notification: bool) -> Value {
    json!({
        "job_id": job_id,
        "params": params,
        "send_notification": send_notification,
        "dispatched_at": time::to_persisted(time::now_utc()),
    })
}

/// Runs a command per job with the job payload as JSON on stdin.
///
/// The child is tracked by the shutdown manager for as long as it runs, so a
/// shutdown waits for it and, if needed, terminates it. Stdout is returned
/// as the outcome detail, parsed as JSON when possible.
pub struct CommandExecutor {
    argv: Vec<String>,
    shutdown: Arc<ShutdownManager>,
}

impl CommandExecutor {
    pub fn new(argv: Vec<String>, shutdown: Arc<ShutdownManager>) -> Self {
        Self { argv, shutdown }
    }
}

impl JobExecutor for CommandExecutor {
    fn execute(
        &self,
        params: &Value,
        job_id: &str,
        send_notification: bool,
    ) -> Result<JobOutcome, JobError> {
        if self.shutdown.is_shutdown_requested() {
            return Err(JobError::Refused("shutdown in progress".to_string()));
        }
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| JobError::Failed("empty command".to_string()))?;
        let payload = serde_json::to_vec(&job_payload(params, job_id, send_notification))
            .map_err(|e| JobError::Failed(e.to_string()))?;

        let mut child = Command::new(program)
            .args(args)
            .env("HERALD_JOB_ID", job_id)
            .env(
                "HERALD_SEND_NOTIFICATION",
                if send_notification { "1" } else { "0" },
            )
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        debug!(job_id, pid = child.id(), "job subprocess started");
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        // Tracked before any pipe I/O, so a child that never drains its
        // stdin is still visible to the shutdown sequence.
        let child: SharedChild = Arc::new(Mutex::new(child));
        if let Err(e) = self
            .shutdown
            .register_unit_of_work(job_id, UnitOfWork::Process(child.clone()))
        {
            UnitOfWork::Process(child).kill();
            return Err(JobError::Refused(e.to_string()));
        }
        let _tracked = TrackedJob {
            shutdown: &self.shutdown,
            job_id,
        };

        if let Some(mut stdin) = stdin {
            let id = job_id.to_string();
            let writer = thread::Builder::new()
                .name(format!("{job_id}-stdin"))
                .spawn(move || {
                    if let Err(e) = stdin.write_all(&payload) {
                        warn!(job_id = %id, "could not write job payload: {e}");
                    }
                });
            if let Err(e) = writer {
                UnitOfWork::Process(child).kill();
                return Err(e.into());
            }
        }

        let mut output = String::new();
        if let Some(mut stdout) = stdout {
            if let Err(e) = stdout.read_to_string(&mut output) {
                UnitOfWork::Process(child).kill();
                return Err(JobError::Failed(format!("reading job output: {e}")));
            }
        }

        let status = loop {
            // lock is released between polls so the manager can signal the child
            if let Some(status) = child.lock().try_wait()? {
                break status;
            }
            thread::sleep(EXIT_POLL);
        };

        if !status.success() {
            return match status.code() {
                Some(code) => Err(JobError::Failed(format!("exited with status {code}"))),
                None => Err(JobError::Interrupted(format!("terminated by signal ({status})"))),
            };
        }

        let detail = match serde_json::from_str::<Value>(output.trim()) {
            Ok(v) => v,
            Err(_) if output.trim().is_empty() => Value::Null,
            Err(_) => json!({ "stdout": output }),
        };
        Ok(JobOutcome::with_status(JobStatus::Success, detail))
    }
}

/// Stops tracking a job's subprocess on every return path.
struct TrackedJob<'a> {
    shutdown: &'a ShutdownManager,
    job_id: &'a str,
}

impl Drop for TrackedJob<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown.unregister_unit_of_work(self.job_id) {
            debug!(job_id = self.job_id, "job unit left to the shutdown manager: {e}");
        }
    }
}

/// Pushes each job onto a Redis list for an external worker.
pub struct QueueExecutor {
    client: redis::Client,
    key: String,
}

impl QueueExecutor {
    pub fn connect(url: &str, key: &str) -> Result<Self, JobError> {
        let client = redis::Client::open(url).map_err(|e| JobError::Queue(e.to_string()))?;
        Ok(Self {
            client,
            key: key.to_string(),
        })
    }
}

impl JobExecutor for QueueExecutor {
    fn execute(
        &self,
        params: &Value,
        job_id: &str,
        send_notification: bool,
    ) -> Result<JobOutcome, JobError> {
        let mut conn = self
            .client
            .get_connection()
            .map_err(|e| JobError::Queue(e.to_string()))?;
        let payload = job_payload(params, job_id, send_notification).to_string();
        let depth: i64 = redis::Commands::lpush(&mut conn, &self.key, payload)
            .map_err(|e| JobError::Queue(e.to_string()))?;
        debug!(job_id, queue = %self.key, depth, "job queued");
        Ok(JobOutcome::with_status(
            JobStatus::Queued,
            json!({ "queue": self.key, "depth": depth }),
        ))
    }
}
