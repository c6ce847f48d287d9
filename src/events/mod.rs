//! Per-run, append-only event log and its live fan-out.
//!
//! Every event is persisted by the store before any subscriber sees it. The store
//! assigns `seq` (1, 2, 3, ... with no gaps) and the [`EventBus`] delivers a replay of
//! persisted events followed by live ones, deduplicated by `seq`.

pub mod bus;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RuntimeError;

pub use bus::{EventBus, EventStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "run.started")]
    RunStarted,
    #[serde(rename = "run.succeeded")]
    RunSucceeded,
    #[serde(rename = "run.failed")]
    RunFailed,
    #[serde(rename = "run.cancelled")]
    RunCancelled,
    #[serde(rename = "run.timed_out")]
    RunTimedOut,
    #[serde(rename = "tool.call")]
    ToolCall,
    #[serde(rename = "tool.result")]
    ToolResult,
    #[serde(rename = "assistant.message")]
    AssistantMessage,
    #[serde(rename = "step.completed")]
    StepCompleted,
    #[serde(rename = "checkpoint")]
    Checkpoint,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::RunStarted => "run.started",
            EventType::RunSucceeded => "run.succeeded",
            EventType::RunFailed => "run.failed",
            EventType::RunCancelled => "run.cancelled",
            EventType::RunTimedOut => "run.timed_out",
            EventType::ToolCall => "tool.call",
            EventType::ToolResult => "tool.result",
            EventType::AssistantMessage => "assistant.message",
            EventType::StepCompleted => "step.completed",
            EventType::Checkpoint => "checkpoint",
        }
    }

    /// Terminal events close a run's stream; exactly one is written per run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventType::RunSucceeded
                | EventType::RunFailed
                | EventType::RunCancelled
                | EventType::RunTimedOut
        )
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = RuntimeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "run.started" => Ok(EventType::RunStarted),
            "run.succeeded" => Ok(EventType::RunSucceeded),
            "run.failed" => Ok(EventType::RunFailed),
            "run.cancelled" => Ok(EventType::RunCancelled),
            "run.timed_out" => Ok(EventType::RunTimedOut),
            "tool.call" => Ok(EventType::ToolCall),
            "tool.result" => Ok(EventType::ToolResult),
            "assistant.message" => Ok(EventType::AssistantMessage),
            "step.completed" => Ok(EventType::StepCompleted),
            "checkpoint" => Ok(EventType::Checkpoint),
            other => Err(RuntimeError::Store(format!("unknown event type '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub run_id: Uuid,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
