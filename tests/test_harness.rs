//! Test harness for queue, worker and event stream integration tests.
//!
//! Provides short-interval runtimes, scripted executors and worker handles.
#![allow(dead_code)]

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use agentq::config::{EventBusBackend, RuntimeConfig, WorkerConfig};
use agentq::events::{Event, EventStream, EventType};
use agentq::run::{Checkpoint, Conversation, NewRun, Run};
use agentq::store::{
    CancelOutcome, Finalized, Lease, MemoryStore, Outcome, Reclaimed, Renewal, SqliteStore, Store,
};
use agentq::worker::{Dispatcher, ExecutionError, Executor, ExecutorRegistry, RunContext};
use agentq::Runtime;

/// Runtime settings with intervals short enough for tests
pub fn fast_config(lease_ttl: Duration) -> RuntimeConfig {
    let mut config = RuntimeConfig::with_lease_ttl(lease_ttl);
    config.heartbeat_interval = lease_ttl / 4;
    config.cancel_check_interval = Duration::from_millis(50);
    config.cancel_grace = Duration::from_millis(200);
    config.sweep_interval = Duration::from_millis(100);
    config.event_poll_interval = Duration::from_millis(50);
    config.run_timeout = Duration::from_secs(10);
    // immediate retries
    config.retry_backoff_base = 0.0;
    config
}

pub fn memory_runtime(config: RuntimeConfig) -> Runtime {
    Runtime::new(Arc::new(MemoryStore::new()), config).unwrap()
}

pub fn sqlite_runtime(path: &Path, config: RuntimeConfig) -> Runtime {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(path).unwrap());
    Runtime::new(store, config).unwrap()
}

/// Same store and settings as `runtime`, but with the polling bus and no shared
/// in-process state, as another OS process would see it.
pub fn observer_of(runtime: &Runtime) -> Runtime {
    let mut config = runtime.config().clone();
    config.event_bus_backend = EventBusBackend::Polling;
    Runtime::new(runtime.store().clone(), config).unwrap()
}

pub fn worker_config(prefix: &str) -> WorkerConfig {
    WorkerConfig::new(prefix)
        .with_concurrency(4)
        .with_poll_interval(Duration::from_millis(20))
        .with_shutdown_grace(Duration::from_secs(2))
}

/// Handle to a dispatcher running in the background
pub struct TestWorker {
    pub worker_id: String,
    shutdown: CancellationToken,
    handle: JoinHandle<agentq::Result<()>>,
}

impl TestWorker {
    pub fn spawn(runtime: &Runtime, executors: ExecutorRegistry, config: WorkerConfig) -> Self {
        let dispatcher = Dispatcher::new(runtime, executors, config).unwrap();
        let worker_id = dispatcher.worker_id().to_string();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { dispatcher.run(token).await });
        Self {
            worker_id,
            shutdown,
            handle,
        }
    }

    /// Graceful shutdown; waits for the drain to finish
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }

    /// Simulated crash: the dispatcher and its supervisors stop without finalizing
    pub fn kill(self) {
        self.handle.abort();
    }
}

/// Poll `check` until it yields a value or `timeout` elapses
pub async fn wait_for<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = check().await {
            return Some(value);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until the run satisfies `predicate`
pub async fn wait_for_run<P>(runtime: &Runtime, run_id: Uuid, timeout: Duration, predicate: P) -> Run
where
    P: Fn(&Run) -> bool,
{
    let predicate = &predicate;
    let found = wait_for(timeout, || async move {
        let run = runtime.get_run(run_id).await.ok()?;
        predicate(&run).then_some(run)
    })
    .await;
    match found {
        Some(run) => run,
        None => panic!(
            "run {} did not reach the expected state in {:?}: {:?}",
            run_id,
            timeout,
            runtime.get_run(run_id).await
        ),
    }
}

pub async fn wait_for_terminal(runtime: &Runtime, run_id: Uuid, timeout: Duration) -> Run {
    wait_for_run(runtime, run_id, timeout, Run::is_terminal).await
}

/// Drain a stream to its end
pub async fn collect_events(mut stream: EventStream, timeout: Duration) -> Vec<Event> {
    tokio::time::timeout(timeout, async {
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event.unwrap());
        }
        events
    })
    .await
    .expect("event stream did not end in time")
}

pub fn seqs(events: &[Event]) -> Vec<u64> {
    events.iter().map(|e| e.seq).collect()
}

pub fn terminal_count(events: &[Event]) -> usize {
    events.iter().filter(|e| e.is_terminal()).count()
}

// =============================================================================
// Fault injection
// =============================================================================

/// In-memory store whose finalizes and renewals can be made to misbehave
pub struct FaultyStore {
    inner: MemoryStore,
    failing_finalizes: AtomicU32,
    frozen_renewals: AtomicBool,
    finalize_calls: AtomicU32,
}

impl FaultyStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            failing_finalizes: AtomicU32::new(0),
            frozen_renewals: AtomicBool::new(false),
            finalize_calls: AtomicU32::new(0),
        }
    }

    /// The next `n` finalizes fail as a busy database would
    pub fn fail_next_finalizes(&self, n: u32) {
        self.failing_finalizes.store(n, Ordering::SeqCst);
    }

    /// While frozen, renewals report success without touching the lease, so it
    /// expires under its holder
    pub fn freeze_renewals(&self, frozen: bool) {
        self.frozen_renewals.store(frozen, Ordering::SeqCst);
    }

    pub fn finalize_calls(&self) -> u32 {
        self.finalize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn create_run(&self, new: NewRun) -> agentq::Result<Run> {
        self.inner.create_run(new).await
    }

    async fn get_run(&self, run_id: Uuid) -> agentq::Result<Option<Run>> {
        self.inner.get_run(run_id).await
    }

    async fn list_runs(&self, conversation_id: Option<Uuid>) -> agentq::Result<Vec<Run>> {
        self.inner.list_runs(conversation_id).await
    }

    async fn create_conversation(&self, conversation: Conversation) -> agentq::Result<Conversation> {
        self.inner.create_conversation(conversation).await
    }

    async fn get_conversation(&self, conversation_id: Uuid) -> agentq::Result<Option<Conversation>> {
        self.inner.get_conversation(conversation_id).await
    }

    async fn try_claim_next(
        &self,
        agent_keys: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> agentq::Result<Option<Run>> {
        self.inner.try_claim_next(agent_keys, worker_id, lease_ttl).await
    }

    async fn renew_lease(&self, lease: &Lease, lease_ttl: Duration) -> agentq::Result<Renewal> {
        if self.frozen_renewals.load(Ordering::SeqCst) {
            return Ok(Renewal::Renewed {
                expires_at: lease.expires_at,
                cancel_requested: false,
            });
        }
        self.inner.renew_lease(lease, lease_ttl).await
    }

    async fn finalize(&self, lease: &Lease, outcome: Outcome) -> agentq::Result<Finalized> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_finalizes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(agentq::RuntimeError::Store("database is locked".into()));
        }
        self.inner.finalize(lease, outcome).await
    }

    async fn request_cancel(&self, run_id: Uuid) -> agentq::Result<CancelOutcome> {
        self.inner.request_cancel(run_id).await
    }

    async fn reclaim_expired_leases(&self) -> agentq::Result<Vec<Reclaimed>> {
        self.inner.reclaim_expired_leases().await
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
        fence: Option<&Lease>,
    ) -> agentq::Result<Event> {
        self.inner.append_event(run_id, event_type, payload, fence).await
    }

    async fn read_events(&self, run_id: Uuid, since_seq: u64) -> agentq::Result<Vec<Event>> {
        self.inner.read_events(run_id, since_seq).await
    }

    async fn save_checkpoint(&self, lease: &Lease, state: Value) -> agentq::Result<Checkpoint> {
        self.inner.save_checkpoint(lease, state).await
    }

    async fn latest_checkpoint(&self, run_id: Uuid) -> agentq::Result<Option<Checkpoint>> {
        self.inner.latest_checkpoint(run_id).await
    }
}

// =============================================================================
// Scripted executors
// =============================================================================

/// Emits `steps` step events, then succeeds with `{"steps": n}`
pub struct StepExecutor {
    pub steps: u32,
    pub delay: Duration,
}

impl StepExecutor {
    pub fn new(steps: u32) -> Self {
        Self {
            steps,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(steps: u32, delay: Duration) -> Self {
        Self { steps, delay }
    }
}

#[async_trait]
impl Executor for StepExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        for step in 1..=self.steps {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            ctx.emit(EventType::StepCompleted, json!({ "step": step })).await?;
        }
        Ok(json!({ "steps": self.steps }))
    }
}

/// Fails every call, transiently or permanently, counting attempts
#[derive(Clone)]
pub struct FailingExecutor {
    pub transient: bool,
    pub calls: Arc<AtomicU32>,
}

impl FailingExecutor {
    pub fn transient() -> Self {
        Self {
            transient: true,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn permanent() -> Self {
        Self {
            transient: false,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for FailingExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let message = format!("attempt {} failed", ctx.attempt());
        if self.transient {
            Err(ExecutionError::Transient(message))
        } else {
            Err(ExecutionError::Permanent(message))
        }
    }
}

/// Succeeds once `attempt` reaches `succeed_on`, failing transiently before that
pub struct FlakyExecutor {
    pub succeed_on: u32,
}

#[async_trait]
impl Executor for FlakyExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        if ctx.attempt() < self.succeed_on {
            return Err(ExecutionError::Transient("not yet".into()));
        }
        Ok(json!({ "attempt": ctx.attempt() }))
    }
}

/// Blocks until stopped. With `honor_cancel` it returns at the next safe point;
/// otherwise it ignores cancellation entirely.
pub struct HangingExecutor {
    pub honor_cancel: bool,
    pub started: Arc<Notify>,
}

impl HangingExecutor {
    pub fn new(honor_cancel: bool) -> Self {
        Self {
            honor_cancel,
            started: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Executor for HangingExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        self.started.notify_one();
        if self.honor_cancel {
            ctx.cancelled().await;
            ctx.check()?;
        }
        std::future::pending::<()>().await;
        Ok(Value::Null)
    }
}

/// Emits `before` steps, waits for `release`, then emits `after` more
pub struct GatedExecutor {
    pub before: u32,
    pub after: u32,
    pub release: Arc<Notify>,
}

impl GatedExecutor {
    pub fn new(before: u32, after: u32) -> Self {
        Self {
            before,
            after,
            release: Arc::new(Notify::new()),
        }
    }
}

#[async_trait]
impl Executor for GatedExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        for step in 1..=self.before {
            ctx.emit(EventType::StepCompleted, json!({ "step": step })).await?;
        }
        self.release.notified().await;
        for step in 1..=self.after {
            ctx.emit(EventType::StepCompleted, json!({ "step": self.before + step }))
                .await?;
        }
        Ok(json!({ "steps": self.before + self.after }))
    }
}

/// Records which worker executed which attempt of which run
#[derive(Clone, Default)]
pub struct RecordingExecutor {
    pub executions: Arc<Mutex<Vec<(Uuid, u32)>>>,
    pub delay: Duration,
}

impl RecordingExecutor {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            executions: Arc::default(),
            delay,
        }
    }

    pub fn executions(&self) -> Vec<(Uuid, u32)> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, ctx: RunContext) -> Result<Value, ExecutionError> {
        self.executions
            .lock()
            .unwrap()
            .push((ctx.run_id(), ctx.attempt()));
        tokio::time::sleep(self.delay).await;
        Ok(json!({ "attempt": ctx.attempt() }))
    }
}
