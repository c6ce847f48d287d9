use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::{AbortHandle, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{RuntimeConfig, WorkerConfig};
use crate::error::{Result, RuntimeError};
use crate::events::EventType;
use crate::lease::{Claim, LeaseManager};
use crate::run::RunError;
use crate::runtime::Runtime;
use crate::store::{Lease, Outcome};
use crate::worker::executor::{ExecutionError, ExecutorRegistry, RunContext, StopHandle, StopReason};
use crate::worker::heartbeat::{CancelRegistry, Heartbeat, Signal};

const SIGNAL_BUFFER: usize = 4;
const FINALIZE_ATTEMPTS: u32 = 8;
const FINALIZE_RETRY_BASE: Duration = Duration::from_millis(50);
const FINALIZE_RETRY_MAX: Duration = Duration::from_secs(2);

/// Claims runs and executes them on a bounded pool of slots.
///
/// Each claimed run gets a supervisor task that owns the executor, the heartbeat and
/// the timeout, and finalizes the attempt through the lease manager.
pub struct Dispatcher {
    inner: Arc<Supervisor>,
}

struct Supervisor {
    worker_id: String,
    agent_keys: Vec<String>,
    worker: WorkerConfig,
    config: RuntimeConfig,
    leases: LeaseManager,
    executors: ExecutorRegistry,
    cancels: CancelRegistry,
}

/// Aborts a task when dropped, so an aborted supervisor takes its children with it.
struct TaskGuard(AbortHandle);

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Ending {
    Finished(std::result::Result<std::result::Result<Value, ExecutionError>, JoinError>),
    Stopped(StopReason),
}

impl Dispatcher {
    /// Build a dispatcher over `runtime` that only claims runs it has executors for.
    pub fn new(runtime: &Runtime, executors: ExecutorRegistry, worker: WorkerConfig) -> Result<Self> {
        worker.validate()?;
        if executors.is_empty() {
            return Err(RuntimeError::Config("worker has no executors registered".into()));
        }

        let agent_keys = if worker.agent_keys.is_empty() {
            executors.agent_keys()
        } else {
            if let Some(missing) = worker.agent_keys.iter().find(|k| !executors.contains(k)) {
                return Err(RuntimeError::UnknownAgent(missing.clone()));
            }
            worker.agent_keys.clone()
        };

        let worker_id = format!(
            "{}-{}-{}",
            worker.worker_id,
            std::process::id(),
            &Uuid::new_v4().simple().to_string()[..8]
        );

        Ok(Self {
            inner: Arc::new(Supervisor {
                worker_id,
                agent_keys,
                worker,
                config: runtime.config().clone(),
                leases: runtime.leases().clone(),
                executors,
                cancels: runtime.cancels().clone(),
            }),
        })
    }

    /// Lease owner identity of this dispatcher.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn agent_keys(&self) -> &[String] {
        &self.inner.agent_keys
    }

    /// Dispatch until `shutdown` fires, then drain.
    ///
    /// Draining stops claiming and waits up to the shutdown grace for in-flight runs.
    /// Runs still going after that are abandoned without finalizing; their leases
    /// expire and the sweeper requeues them.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let inner = &self.inner;
        tracing::info!(
            worker_id = %inner.worker_id,
            concurrency = inner.worker.concurrency,
            agent_keys = ?inner.agent_keys,
            "Worker started"
        );

        let slots = Arc::new(Semaphore::new(inner.worker.concurrency));
        let force = CancellationToken::new();
        let mut in_flight: JoinSet<()> = JoinSet::new();
        let sweeper = tokio::spawn(
            inner
                .leases
                .clone()
                .run_sweeper(inner.config.sweep_interval, shutdown.child_token()),
        );
        let _sweeper_guard = TaskGuard(sweeper.abort_handle());

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                inner.log_join(joined);
            }

            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            match inner.leases.acquire(&inner.worker_id, &inner.agent_keys).await {
                Ok(Some(claim)) => {
                    let supervisor = inner.clone();
                    let force = force.clone();
                    in_flight.spawn(async move {
                        supervisor.supervise(claim, force).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(worker_id = %inner.worker_id, error = %e, "Failed to claim run");
                }
            }
            drop(permit);

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(inner.worker.poll_interval) => {}
            }
        }

        tracing::info!(worker_id = %inner.worker_id, in_flight = in_flight.len(), "Worker draining");
        let drained = tokio::time::timeout(inner.worker.shutdown_grace, async {
            while let Some(joined) = in_flight.join_next().await {
                inner.log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                worker_id = %inner.worker_id,
                in_flight = in_flight.len(),
                "Shutdown grace elapsed, abandoning in-flight runs"
            );
            force.cancel();
            while let Some(joined) = in_flight.join_next().await {
                inner.log_join(joined);
            }
        }

        if let Err(e) = sweeper.await {
            tracing::warn!(error = %e, "Lease sweeper task failed");
        }
        tracing::info!(worker_id = %inner.worker_id, "Worker stopped");
        Ok(())
    }
}

impl Supervisor {
    /// Drive one claimed attempt to its end.
    async fn supervise(self: Arc<Self>, claim: Claim, force: CancellationToken) {
        let Claim { lease, run } = claim;
        let run_id = run.id;

        let Some(executor) = self.executors.get(&run.agent_key) else {
            let error = RunError::new(
                "UnknownAgent",
                format!("no executor registered for agent key '{}'", run.agent_key),
                false,
            );
            self.finish(&lease, Outcome::Failed(error), None).await;
            return;
        };

        let started = json!({
            "agent_key": run.agent_key,
            "attempt": lease.attempt,
            "worker_id": lease.worker_id,
        });
        if let Err(e) = self.leases.bus().emit(&lease, EventType::RunStarted, started).await {
            tracing::warn!(run_id = %run_id, error = %e, "Failed to record run start");
            if matches!(e, RuntimeError::LeaseLost(_)) {
                return;
            }
        }

        let (signal_tx, mut signals) = mpsc::channel(SIGNAL_BUFFER);
        self.cancels.register(run_id, signal_tx.clone());
        let heartbeat = tokio::spawn(
            Heartbeat::new(
                self.leases.clone(),
                self.config.heartbeat_interval,
                self.config.cancel_check_interval,
            )
            .run(lease.clone(), signal_tx),
        );
        let _heartbeat_guard = TaskGuard(heartbeat.abort_handle());

        let stop = StopHandle::new();
        let ctx = RunContext::new(run, lease.clone(), self.leases.bus().clone(), stop.clone());
        let mut task = tokio::spawn(async move { executor.execute(ctx).await });
        let _task_guard = TaskGuard(task.abort_handle());

        let deadline = tokio::time::sleep(self.config.run_timeout);
        tokio::pin!(deadline);

        let ending = tokio::select! {
            joined = &mut task => Ending::Finished(joined),
            _ = &mut deadline => Ending::Stopped(StopReason::TimedOut),
            signal = signals.recv() => match signal {
                Some(Signal::CancelRequested) => Ending::Stopped(StopReason::Cancelled),
                Some(Signal::LeaseLost) | None => Ending::Stopped(StopReason::LeaseLost),
            },
            _ = force.cancelled() => Ending::Stopped(StopReason::Shutdown),
        };

        let outcome = match ending {
            Ending::Finished(joined) => self.outcome_of(run_id, lease.attempt, joined),
            Ending::Stopped(reason) => {
                let reason = stop.stop(reason);
                tracing::info!(run_id = %run_id, reason = ?reason, "Stopping executor");
                match reason {
                    StopReason::Cancelled | StopReason::TimedOut => {
                        self.await_grace(run_id, &mut task).await;
                        Some(if reason == StopReason::Cancelled {
                            Outcome::Cancelled(RunError::cancelled("cancellation requested"))
                        } else {
                            Outcome::TimedOut(RunError::timed_out(self.config.run_timeout))
                        })
                    }
                    StopReason::LeaseLost | StopReason::Shutdown => {
                        task.abort();
                        None
                    }
                }
            }
        };

        // the heartbeat keeps the lease until the outcome is recorded
        match outcome {
            Some(outcome) => self.finish(&lease, outcome, Some(&mut signals)).await,
            None => tracing::warn!(run_id = %run_id, attempt = lease.attempt, "Attempt abandoned without finalizing"),
        }
        heartbeat.abort();
        self.cancels.remove(&run_id);
    }

    /// Give a stopped executor the cancel grace to return, then tear it down.
    async fn await_grace(
        &self,
        run_id: Uuid,
        task: &mut tokio::task::JoinHandle<std::result::Result<Value, ExecutionError>>,
    ) {
        let grace = self.config.cancel_grace;
        if tokio::time::timeout(grace, &mut *task).await.is_err() {
            tracing::warn!(
                run_id = %run_id,
                grace_ms = grace.as_millis() as u64,
                "Executor ignored cancellation, aborting"
            );
            task.abort();
        }
    }

    fn outcome_of(
        &self,
        run_id: Uuid,
        attempt: u32,
        joined: std::result::Result<std::result::Result<Value, ExecutionError>, JoinError>,
    ) -> Option<Outcome> {
        match joined {
            Ok(Ok(output)) => Some(Outcome::Succeeded { output }),
            Ok(Err(ExecutionError::Transient(message))) => Some(Outcome::Retry {
                error: RunError::transient(message),
                backoff: self.backoff(attempt),
            }),
            Ok(Err(ExecutionError::Permanent(message))) => {
                Some(Outcome::Failed(RunError::permanent(message)))
            }
            Ok(Err(ExecutionError::Cancelled)) => {
                Some(Outcome::Cancelled(RunError::cancelled("executor stopped on cancellation")))
            }
            Ok(Err(ExecutionError::TimedOut)) => {
                Some(Outcome::TimedOut(RunError::timed_out(self.config.run_timeout)))
            }
            Ok(Err(ExecutionError::LeaseLost)) => None,
            Err(e) if e.is_panic() => {
                tracing::error!(run_id = %run_id, "Executor panicked");
                Some(Outcome::Failed(RunError::new(
                    "ExecutorPanicked",
                    "executor panicked",
                    false,
                )))
            }
            Err(_) => None,
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config.retry_backoff(attempt)
    }

    /// Record `outcome`, retrying store failures while the lease is still ours.
    ///
    /// Gives up on `LeaseLost`, on a lost-lease signal from the heartbeat, or once the
    /// retries run out; the sweeper then owns the run.
    async fn finish(
        &self,
        lease: &Lease,
        outcome: Outcome,
        mut signals: Option<&mut mpsc::Receiver<Signal>>,
    ) {
        let mut delay = FINALIZE_RETRY_BASE;
        for attempt in 1..=FINALIZE_ATTEMPTS {
            let err = match self.leases.release(lease, outcome.clone()).await {
                Ok(_) => return,
                Err(RuntimeError::LeaseLost(run_id)) => {
                    tracing::warn!(run_id = %run_id, attempt = lease.attempt, "Lease lost before finalizing, result discarded");
                    return;
                }
                Err(e) => e,
            };
            if attempt == FINALIZE_ATTEMPTS {
                tracing::error!(run_id = %lease.run_id, error = %err, "Failed to finalize run, leaving it to the sweeper");
                return;
            }
            tracing::warn!(
                run_id = %lease.run_id,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "Failed to finalize run, retrying"
            );

            let lost = match signals.as_deref_mut() {
                Some(signals) => wait_for_retry(delay, signals).await,
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if lost {
                tracing::warn!(run_id = %lease.run_id, attempt = lease.attempt, "Lease lost while finalizing, result discarded");
                return;
            }
            delay = (delay * 2).min(FINALIZE_RETRY_MAX);
        }
    }

    fn log_join(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined {
            tracing::error!(worker_id = %self.worker_id, error = %e, "Run supervisor task failed");
        }
    }
}

/// Sleep `delay`, returning early with `true` if the heartbeat reports the lease lost.
async fn wait_for_retry(delay: Duration, signals: &mut mpsc::Receiver<Signal>) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            _ = &mut sleep => return false,
            signal = signals.recv() => match signal {
                Some(Signal::CancelRequested) => {}
                Some(Signal::LeaseLost) | None => return true,
            },
        }
    }
}
