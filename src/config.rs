use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Result, RuntimeError};

/// Where runs, leases and events are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueBackend {
    /// Process-local tables. Exclusivity holds only between workers of one process.
    Memory,
    /// SQLite database file shared by every worker process on the host.
    Sqlite(PathBuf),
}

impl FromStr for QueueBackend {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "memory" => Ok(QueueBackend::Memory),
            other => match other.strip_prefix("sqlite:") {
                Some(path) if !path.is_empty() => Ok(QueueBackend::Sqlite(PathBuf::from(path))),
                _ => Err(RuntimeError::Config(format!(
                    "unknown queue backend '{}', expected 'memory' or 'sqlite:<path>'",
                    other
                ))),
            },
        }
    }
}

/// How live events reach subscribers once replay is done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventBusBackend {
    /// In-process broadcast fan-out. Observers must share the process with the producer.
    Local,
    /// Re-read the store on an interval. Works for observers in other processes.
    Polling,
}

impl FromStr for EventBusBackend {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "local" => Ok(EventBusBackend::Local),
            "polling" => Ok(EventBusBackend::Polling),
            other => Err(RuntimeError::Config(format!(
                "unknown event bus backend '{}', expected 'local' or 'polling'",
                other
            ))),
        }
    }
}

/// Process-wide runtime settings, fixed after startup.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub queue_backend: QueueBackend,
    pub event_bus_backend: EventBusBackend,
    /// How long a claim stays valid without a heartbeat
    pub lease_ttl: Duration,
    /// Wall-clock budget for a single attempt
    pub run_timeout: Duration,
    /// Attempts a new run gets unless the caller overrides it
    pub max_attempts: u32,
    /// Lease renewal period, must stay well under `lease_ttl`
    pub heartbeat_interval: Duration,
    /// How often a running attempt re-reads its cancel flag from the store
    pub cancel_check_interval: Duration,
    /// Time an executor gets to exit after cancellation or timeout before it is torn down
    pub cancel_grace: Duration,
    pub sweep_interval: Duration,
    /// Live-phase poll period for the polling event bus
    pub event_poll_interval: Duration,
    pub retry_backoff_base: f64,
    pub retry_backoff_max: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::with_lease_ttl(Duration::from_secs(30))
    }
}

impl RuntimeConfig {
    /// Defaults with heartbeat and sweep periods derived from the given TTL.
    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            queue_backend: QueueBackend::Memory,
            event_bus_backend: EventBusBackend::Local,
            lease_ttl,
            run_timeout: Duration::from_secs(900),
            max_attempts: 3,
            heartbeat_interval: lease_ttl / 3,
            cancel_check_interval: Duration::from_secs(1),
            cancel_grace: Duration::from_secs(10),
            sweep_interval: lease_ttl / 2,
            event_poll_interval: Duration::from_millis(500),
            retry_backoff_base: 2.0,
            retry_backoff_max: Duration::from_secs(300),
        }
    }

    /// Reject settings that would break lease or retry guarantees.
    pub fn validate(&self) -> Result<()> {
        if self.lease_ttl.is_zero() {
            return Err(RuntimeError::Config("lease TTL must be positive".into()));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.lease_ttl {
            return Err(RuntimeError::Config(format!(
                "heartbeat interval {:?} must be positive and below the lease TTL {:?}",
                self.heartbeat_interval, self.lease_ttl
            )));
        }
        if self.run_timeout.is_zero() {
            return Err(RuntimeError::Config("run timeout must be positive".into()));
        }
        if self.max_attempts == 0 {
            return Err(RuntimeError::Config("max attempts must be at least 1".into()));
        }
        if self.cancel_check_interval.is_zero()
            || self.sweep_interval.is_zero()
            || self.event_poll_interval.is_zero()
        {
            return Err(RuntimeError::Config(
                "cancel check, sweep and event poll intervals must be positive".into(),
            ));
        }
        if !self.retry_backoff_base.is_finite() || self.retry_backoff_base < 0.0 {
            return Err(RuntimeError::Config(format!(
                "retry backoff base must be a non-negative number, got {}",
                self.retry_backoff_base
            )));
        }
        Ok(())
    }

    /// Delay before a transiently failed attempt becomes claimable again.
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let raw = self.retry_backoff_base.powi(attempt.min(i32::MAX as u32) as i32);
        let max = self.retry_backoff_max.as_secs_f64();
        Duration::from_secs_f64(raw.min(max).max(0.0))
    }
}

/// Settings for one worker process (or the parent of several).
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Prefix for lease owner identities; the pid and a random suffix are appended
    pub worker_id: String,
    pub processes: usize,
    /// Concurrent runs per process
    pub concurrency: usize,
    /// Agent keys this worker claims. Empty means every key.
    pub agent_keys: Vec<String>,
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight runs before tearing them down
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: "worker".to_string(),
            processes: 1,
            concurrency: 10,
            agent_keys: Vec::new(),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_agent_keys(mut self, agent_keys: Vec<String>) -> Self {
        self.agent_keys = agent_keys;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.processes == 0 || self.concurrency == 0 {
            return Err(RuntimeError::Config(
                "processes and concurrency must be at least 1".into(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(RuntimeError::Config("poll interval must be positive".into()));
        }
        Ok(())
    }
}

/// Settings for the built-in `shell` agent.
///
/// Without an image, commands run as `sh -c` on the worker host. With one, each
/// command runs in a throwaway Docker container with dropped capabilities and a
/// read-only root filesystem.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    pub image: Option<String>,
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            image: None,
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

impl ShellConfig {
    pub fn sandboxed(image: impl Into<String>) -> Self {
        Self {
            image: Some(image.into()),
            ..Default::default()
        }
    }
}

/// Split a comma-separated agent key allowlist, dropping blanks.
pub fn parse_agent_keys(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}
