use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RuntimeError;

/// Attempts a run gets when the caller does not say otherwise.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::TimedOut => "timed_out",
        }
    }

    /// Terminal statuses are absorbing: nothing transitions out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled | RunStatus::TimedOut
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            "timed_out" => Ok(RunStatus::TimedOut),
            other => Err(RuntimeError::Store(format!("unknown run status '{}'", other))),
        }
    }
}

/// Failure reason recorded on a run and echoed in its terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: String,
    pub message: String,
    pub retriable: bool,
}

impl RunError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>, retriable: bool) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            retriable,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("TransientExecutionError", message, true)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new("PermanentExecutionError", message, false)
    }

    pub fn max_retries_exceeded(attempts: u32, last: Option<&RunError>) -> Self {
        let message = match last {
            Some(last) => format!("gave up after {} attempts: {}", attempts, last.message),
            None => format!("gave up after {} attempts", attempts),
        };
        Self::new("MaxRetriesExceeded", message, false)
    }

    pub fn lease_expired(worker_id: &str) -> Self {
        Self::new(
            "LeaseExpired",
            format!("lease held by {} expired without renewal", worker_id),
            true,
        )
    }

    pub fn timed_out(timeout: std::time::Duration) -> Self {
        Self::new(
            "TimeoutExceeded",
            format!("run exceeded {}s timeout", timeout.as_secs_f64()),
            false,
        )
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new("CancellationRequested", reason, false)
    }
}

/// Input to `Store::create_run`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewRun {
    pub agent_key: String,
    pub input: Value,
    pub conversation_id: Option<Uuid>,
    pub max_attempts: Option<u32>,
    pub idempotency_key: Option<String>,
}

impl NewRun {
    pub fn new(agent_key: impl Into<String>, input: Value) -> Self {
        Self {
            agent_key: agent_key.into(),
            input,
            ..Default::default()
        }
    }

    /// Build the canonical `{"messages": [...]}` input from plain user messages.
    pub fn from_messages(agent_key: impl Into<String>, messages: &[&str]) -> Self {
        let messages: Vec<Value> = messages
            .iter()
            .map(|content| serde_json::json!({ "role": "user", "content": content }))
            .collect();
        Self::new(agent_key, serde_json::json!({ "messages": messages }))
    }

    pub fn in_conversation(mut self, conversation_id: Uuid) -> Self {
        self.conversation_id = Some(conversation_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub agent_key: String,
    pub conversation_id: Option<Uuid>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<RunError>,
    pub status: RunStatus,
    pub attempt: u32,
    pub max_attempts: u32,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    pub cancel_requested_at: Option<DateTime<Utc>>,
    /// Earliest instant the run may be claimed; pushed forward by retry backoff
    pub available_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(new: NewRun) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            agent_key: new.agent_key,
            conversation_id: new.conversation_id,
            input: new.input,
            output: None,
            error: None,
            status: RunStatus::Queued,
            attempt: 0,
            max_attempts: new.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS).max(1),
            lease_owner: None,
            lease_expires_at: None,
            idempotency_key: new.idempotency_key,
            cancel_requested_at: None,
            available_at: now,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remain(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Whether a worker restricted to `agent_keys` may claim this run at `now`.
    pub fn is_claimable(&self, agent_keys: &[String], now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Queued
            && self.available_at <= now
            && (agent_keys.is_empty() || agent_keys.iter().any(|k| *k == self.agent_key))
    }

    /// Fencing check: `worker_id` owns this exact attempt and nobody has reclaimed it.
    ///
    /// An expired lease that the sweeper has not reached yet still passes; claims only
    /// take queued runs, so no second holder can exist until the sweep happens.
    pub fn is_held_by(&self, worker_id: &str, attempt: u32) -> bool {
        self.status == RunStatus::Running
            && self.attempt == attempt
            && self.lease_owner.as_deref() == Some(worker_id)
    }

    /// Whether the lease is running and past its expiry at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == RunStatus::Running && self.lease_expires_at.is_some_and(|at| at <= now)
    }

    /// The input `messages` array, or an empty slice when absent.
    pub fn messages(&self) -> &[Value] {
        self.input
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

/// Organizational grouping of runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub agent_key: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(agent_key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            agent_key: agent_key.into(),
            title: title.into(),
            created_at: Utc::now(),
        }
    }
}

/// Executor state saved mid-run, kept across attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub run_id: Uuid,
    pub seq: u64,
    pub state: Value,
    pub created_at: DateTime<Utc>,
}
