use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use crate::error::RuntimeError;
use crate::events::{EventBus, EventType};
use crate::run::Run;
use crate::store::Lease;

/// How an executor attempt failed.
///
/// `Transient` is retried while attempts remain; everything else ends the run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("permanent failure: {0}")]
    Permanent(String),

    #[error("lease lost")]
    LeaseLost,

    #[error("cancellation requested")]
    Cancelled,

    #[error("run timed out")]
    TimedOut,
}

impl From<RuntimeError> for ExecutionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::LeaseLost(_) => ExecutionError::LeaseLost,
            other => ExecutionError::Transient(other.to_string()),
        }
    }
}

/// Why the supervisor stopped an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    TimedOut,
    LeaseLost,
    Shutdown,
}

impl StopReason {
    pub fn as_error(self) -> ExecutionError {
        match self {
            StopReason::Cancelled | StopReason::Shutdown => ExecutionError::Cancelled,
            StopReason::TimedOut => ExecutionError::TimedOut,
            StopReason::LeaseLost => ExecutionError::LeaseLost,
        }
    }
}

/// Executes one attempt of a run for a single agent key.
///
/// Implementations receive a [`RunContext`] and return the run's output. Calls that
/// go through the context (`emit`, `checkpoint`) are safe points: once the attempt is
/// cancelled, timed out or its lease is lost they fail instead of writing.
#[async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError>;
}

/// Supervisor side of an attempt's cancellation.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    token: CancellationToken,
    reason: Arc<OnceLock<StopReason>>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop the attempt. The first reason wins; returns the one in effect.
    pub fn stop(&self, reason: StopReason) -> StopReason {
        let effective = *self.reason.get_or_init(|| reason);
        self.token.cancel();
        effective
    }

    pub fn reason(&self) -> Option<StopReason> {
        self.reason.get().copied()
    }
}

/// What an executor sees of the run it is working on.
#[derive(Clone)]
pub struct RunContext {
    run: Arc<Run>,
    lease: Lease,
    bus: EventBus,
    stop: StopHandle,
}

impl RunContext {
    pub fn new(run: Run, lease: Lease, bus: EventBus, stop: StopHandle) -> Self {
        Self {
            run: Arc::new(run),
            lease,
            bus,
            stop,
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn agent_key(&self) -> &str {
        &self.run.agent_key
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        self.run.conversation_id
    }

    /// 1-based attempt number.
    pub fn attempt(&self) -> u32 {
        self.lease.attempt
    }

    pub fn input(&self) -> &Value {
        &self.run.input
    }

    pub fn messages(&self) -> &[Value] {
        self.run.messages()
    }

    pub fn is_cancelled(&self) -> bool {
        self.stop.token.is_cancelled()
    }

    /// Resolves once the attempt must stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.stop.token.cancelled()
    }

    /// Cooperative safe point: `Err` once the attempt has been stopped.
    pub fn check(&self) -> Result<(), ExecutionError> {
        if self.is_cancelled() {
            return Err(self
                .stop
                .reason()
                .map(StopReason::as_error)
                .unwrap_or(ExecutionError::Cancelled));
        }
        Ok(())
    }

    /// Append a progress event to the run's log. Returns its `seq`.
    pub async fn emit(&self, event_type: EventType, payload: Value) -> Result<u64, ExecutionError> {
        self.check()?;
        if event_type.is_terminal() {
            return Err(ExecutionError::Permanent(format!(
                "executors cannot emit {}",
                event_type
            )));
        }
        let event = self.bus.emit(&self.lease, event_type, payload).await?;
        Ok(event.seq)
    }

    /// Persist resumable state and announce it with a `checkpoint` event.
    pub async fn checkpoint(&self, state: Value) -> Result<u64, ExecutionError> {
        self.check()?;
        let checkpoint = self.bus.store().save_checkpoint(&self.lease, state).await?;
        self.emit(EventType::Checkpoint, json!({ "checkpoint_seq": checkpoint.seq }))
            .await?;
        Ok(checkpoint.seq)
    }

    /// State saved by the latest checkpoint of any attempt of this run.
    pub async fn state(&self) -> Result<Option<Value>, ExecutionError> {
        Ok(self
            .bus
            .store()
            .latest_checkpoint(self.run.id)
            .await?
            .map(|checkpoint| checkpoint.state))
    }
}

/// Agent key to executor mapping, fixed once the worker starts.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("agent_keys", &self.agent_keys())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, agent_key: impl Into<String>, executor: impl Executor) -> Self {
        self.executors.insert(agent_key.into(), Arc::new(executor));
        self
    }

    pub fn get(&self, agent_key: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(agent_key).cloned()
    }

    pub fn contains(&self, agent_key: &str) -> bool {
        self.executors.contains_key(agent_key)
    }

    /// Registered keys, sorted.
    pub fn agent_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.executors.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}
