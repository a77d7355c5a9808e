use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 8740;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_QUEUE_KEY: &str = "herald:jobs";
/// Lateness allowed for test schedules before they count as expired.
pub const TEST_WINDOW_SECS: u64 = 10 * 60;
/// Lateness allowed for production schedules before they count as expired.
pub const REGULAR_WINDOW_SECS: u64 = 30 * 60;

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub runner: RunnerConfig,
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Value of the `Retry-After` header sent while the server drains.
    #[serde(default = "default_retry_after_secs")]
    pub retry_after_secs: u64,
    /// How long the drain task waits for in-flight requests.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
    /// Grace period between asking the server to stop and forcing exit.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            retry_after_secs: default_retry_after_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Schedule runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Seconds between cycles in continuous mode.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Forwarded to every job as `send_notification`.
    #[serde(default = "bool_true")]
    pub send_notification: bool,
    /// Redis URL. When set, jobs are pushed onto `queue_key` instead of run
    /// in-process.
    #[serde(default)]
    pub queue_url: Option<String>,
    #[serde(default = "default_queue_key")]
    pub queue_key: String,
    /// argv of the command run for each job when no queue is configured.
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default = "default_test_window_secs")]
    pub test_window_secs: u64,
    #[serde(default = "default_regular_window_secs")]
    pub regular_window_secs: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            send_notification: true,
            queue_url: None,
            queue_key: default_queue_key(),
            command: None,
            test_window_secs: default_test_window_secs(),
            regular_window_secs: default_regular_window_secs(),
        }
    }
}

/// Per-phase budgets for the shutdown sequence, plus signal handling knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    #[serde(default = "default_stopping_new_work_secs")]
    pub stopping_new_work_secs: u64,
    #[serde(default = "default_waiting_for_tasks_secs")]
    pub waiting_for_tasks_secs: u64,
    #[serde(default = "default_cleaning_resources_secs")]
    pub cleaning_resources_secs: u64,
    #[serde(default = "default_force_terminating_secs")]
    pub force_terminating_secs: u64,
    /// A second signal inside this window exits the process immediately.
    #[serde(default = "default_repeat_signal_window_secs")]
    pub repeat_signal_window_secs: u64,
    /// Wait between SIGTERM and SIGKILL for tracked subprocesses.
    #[serde(default = "default_process_grace_ms")]
    pub process_grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            stopping_new_work_secs: default_stopping_new_work_secs(),
            waiting_for_tasks_secs: default_waiting_for_tasks_secs(),
            cleaning_resources_secs: default_cleaning_resources_secs(),
            force_terminating_secs: default_force_terminating_secs(),
            repeat_signal_window_secs: default_repeat_signal_window_secs(),
            process_grace_ms: default_process_grace_ms(),
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_retry_after_secs() -> u64 {
    30
}
fn default_drain_timeout_secs() -> u64 {
    8
}
fn default_stop_grace_secs() -> u64 {
    2
}
fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_queue_key() -> String {
    DEFAULT_QUEUE_KEY.to_string()
}
fn default_test_window_secs() -> u64 {
    TEST_WINDOW_SECS
}
fn default_regular_window_secs() -> u64 {
    REGULAR_WINDOW_SECS
}
fn default_stopping_new_work_secs() -> u64 {
    5
}
fn default_waiting_for_tasks_secs() -> u64 {
    10
}
fn default_cleaning_resources_secs() -> u64 {
    5
}
fn default_force_terminating_secs() -> u64 {
    2
}
fn default_repeat_signal_window_secs() -> u64 {
    3
}
fn default_process_grace_ms() -> u64 {
    500
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. `HERALD_CONFIG`
    ///   3. ~/.herald/herald.toml
    ///
    /// A missing file is not an error; every field has a default. Nested keys
    /// are separated by a double underscore, e.g. `HERALD_RUNNER__QUEUE_URL`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("HERALD_CONFIG").ok())
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::from(Serialized::defaults(HeraldConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = HeraldConfig::load(Some("/nonexistent/herald.toml")).unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.runner.test_window_secs, 600);
        assert_eq!(cfg.runner.regular_window_secs, 1800);
        assert_eq!(cfg.shutdown.stopping_new_work_secs, 5);
        assert_eq!(cfg.shutdown.waiting_for_tasks_secs, 10);
        assert_eq!(cfg.shutdown.cleaning_resources_secs, 5);
        assert_eq!(cfg.shutdown.force_terminating_secs, 2);
        assert!(cfg.runner.queue_url.is_none());
    }

    #[test]
    fn toml_sections_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[runner]
poll_interval_secs = 15
command = ["newsletter-job", "--verbose"]

[shutdown]
waiting_for_tasks_secs = 20
"#
        )
        .unwrap();

        let cfg = HeraldConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.runner.poll_interval_secs, 15);
        assert_eq!(
            cfg.runner.command.as_deref(),
            Some(&["newsletter-job".to_string(), "--verbose".to_string()][..])
        );
        assert_eq!(cfg.shutdown.waiting_for_tasks_secs, 20);
        // untouched keys in a present section keep their defaults
        assert_eq!(cfg.shutdown.force_terminating_secs, 2);
        assert_eq!(cfg.gateway.bind, DEFAULT_BIND);
    }
}
