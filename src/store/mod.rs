//! Durable record keeping for runs, leases, events and checkpoints.
//!
//! The [`Store`] trait is the only place runs change status. Every backend must make
//! `try_claim_next` atomic: under concurrent callers an eligible run is handed to at
//! most one of them. Backends share the mutation rules below so that a run loaded from
//! any of them moves through the same state machine.
//!
//! - [`MemoryStore`]: tables behind one async lock, exclusivity within a process
//! - [`SqliteStore`]: one database file, `BEGIN IMMEDIATE` claims, exclusivity across
//!   processes

pub mod memory;
pub mod sqlite;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::error::{Result, RuntimeError};
use crate::events::{Event, EventType};
use crate::run::{Checkpoint, Conversation, NewRun, Run, RunError, RunStatus, Transition, Trigger};

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Exclusive, time-bounded claim on one attempt of one run.
///
/// `(worker_id, attempt)` is the fencing token: every lease-scoped store call checks it,
/// so a holder whose lease was reclaimed can no longer renew, emit or finalize.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub run_id: Uuid,
    pub worker_id: String,
    pub attempt: u32,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn for_run(run: &Run) -> Option<Self> {
        Some(Self {
            run_id: run.id,
            worker_id: run.lease_owner.clone()?,
            attempt: run.attempt,
            expires_at: run.lease_expires_at?,
        })
    }
}

/// Result of a heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Renewal {
    Renewed {
        expires_at: DateTime<Utc>,
        cancel_requested: bool,
    },
    Lost,
}

/// How an attempt ended, as reported by the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { output: Value },
    /// Permanent failure, never retried
    Failed(RunError),
    /// Transient failure; requeued after `backoff` if attempts remain
    Retry { error: RunError, backoff: Duration },
    Cancelled(RunError),
    TimedOut(RunError),
}

impl Outcome {
    fn trigger(&self, run: &Run) -> Trigger {
        match self {
            Outcome::Succeeded { .. } => Trigger::ExecutorSucceeded,
            Outcome::Failed(_) => Trigger::PermanentError,
            Outcome::Retry { .. } => Trigger::TransientError {
                attempts_remain: run.attempts_remain(),
            },
            Outcome::Cancelled(_) => Trigger::CancelHonored,
            Outcome::TimedOut(_) => Trigger::TimeoutExceeded,
        }
    }
}

/// What `finalize` did to the run.
#[derive(Debug, Clone, PartialEq)]
pub enum Finalized {
    /// Terminal status reached; `event` is the run's single terminal event
    Terminal { run: Run, event: Event },
    /// Transient failure with attempts left; the run is claimable again
    Requeued { run: Run },
}

/// One expired lease handled by `reclaim_expired_leases`.
#[derive(Debug, Clone, PartialEq)]
pub enum Reclaimed {
    Requeued { run_id: Uuid, attempt: u32 },
    Terminal { run: Run, event: Event },
}

impl Reclaimed {
    pub fn run_id(&self) -> Uuid {
        match self {
            Reclaimed::Requeued { run_id, .. } => *run_id,
            Reclaimed::Terminal { run, .. } => run.id,
        }
    }
}

/// What a cancellation request did.
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// The run had already finished; nothing changed
    AlreadyTerminal(Run),
    /// The run was still queued and is now cancelled
    Cancelled { run: Run, event: Event },
    /// The run is executing; the holder will observe the flag
    Requested(Run),
}

#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Insert a queued run. A repeated idempotency key returns the existing run.
    async fn create_run(&self, new: NewRun) -> Result<Run>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<Run>>;

    /// Runs in creation order, optionally restricted to one conversation.
    async fn list_runs(&self, conversation_id: Option<Uuid>) -> Result<Vec<Run>>;

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;

    async fn get_conversation(&self, conversation_id: Uuid) -> Result<Option<Conversation>>;

    /// Atomically claim the oldest claimable run for `worker_id`.
    ///
    /// Returns `None` when nothing is eligible. The returned run is `running`, owned
    /// by `worker_id`, with `attempt` incremented.
    async fn try_claim_next(
        &self,
        agent_keys: &[String],
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<Run>>;

    /// Extend a lease. `Renewal::Lost` when the fencing token no longer matches.
    async fn renew_lease(&self, lease: &Lease, lease_ttl: Duration) -> Result<Renewal>;

    /// Record the end of an attempt and release its lease.
    ///
    /// Fails with `LeaseLost` when the lease was reclaimed. A terminal outcome writes
    /// the terminal event in the same atomic step as the status change.
    async fn finalize(&self, lease: &Lease, outcome: Outcome) -> Result<Finalized>;

    /// Request cancellation. Queued runs are cancelled on the spot.
    async fn request_cancel(&self, run_id: Uuid) -> Result<CancelOutcome>;

    /// Reset every running run whose lease is past expiry. Each expired lease yields
    /// exactly one entry; a lease reclaimed concurrently is skipped.
    async fn reclaim_expired_leases(&self) -> Result<Vec<Reclaimed>>;

    /// Append a non-terminal event and assign its `seq`.
    ///
    /// With `fence`, the append fails with `LeaseLost` unless the lease is still held.
    async fn append_event(
        &self,
        run_id: Uuid,
        event_type: EventType,
        payload: Value,
        fence: Option<&Lease>,
    ) -> Result<Event>;

    /// Persisted events with `seq > since_seq`, in order.
    async fn read_events(&self, run_id: Uuid, since_seq: u64) -> Result<Vec<Event>>;

    async fn save_checkpoint(&self, lease: &Lease, state: Value) -> Result<Checkpoint>;

    async fn latest_checkpoint(&self, run_id: Uuid) -> Result<Option<Checkpoint>>;
}

pub(crate) fn ttl_delta(ttl: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(ttl)
        .map_err(|e| RuntimeError::Internal(format!("duration out of range: {}", e)))
}

/// Mark `run` claimed by `worker_id`.
pub(crate) fn apply_claim(
    run: &mut Run,
    worker_id: &str,
    lease_ttl: Duration,
    now: DateTime<Utc>,
) -> Result<Transition> {
    let transition = run.status.next(Trigger::LeaseAcquired)?;
    run.status = transition.to;
    run.attempt += 1;
    run.lease_owner = Some(worker_id.to_string());
    run.lease_expires_at = Some(now + ttl_delta(lease_ttl)?);
    run.started_at.get_or_insert(now);
    run.updated_at = now;
    Ok(transition)
}

/// Apply an attempt outcome. Returns the transition and, when terminal, the payload for
/// the terminal event.
pub(crate) fn apply_outcome(
    run: &mut Run,
    lease: &Lease,
    outcome: Outcome,
    now: DateTime<Utc>,
) -> Result<(Transition, Option<Value>)> {
    if !run.is_held_by(&lease.worker_id, lease.attempt) {
        return Err(RuntimeError::LeaseLost(run.id));
    }
    // A pending cancel wins over a retry.
    let outcome = match outcome {
        Outcome::Retry { .. } if run.cancel_requested_at.is_some() => {
            Outcome::Cancelled(RunError::cancelled("cancellation requested"))
        }
        other => other,
    };
    let transition = run.status.next(outcome.trigger(run))?;

    match outcome {
        Outcome::Succeeded { output } => {
            run.output = Some(output);
            run.error = None;
        }
        Outcome::Retry { error, .. } if transition.retries_exhausted => {
            run.error = Some(RunError::max_retries_exceeded(run.attempt, Some(&error)));
        }
        Outcome::Retry { error, backoff } => {
            run.available_at = now + ttl_delta(backoff)?;
            run.error = Some(error);
        }
        Outcome::Failed(error) | Outcome::Cancelled(error) | Outcome::TimedOut(error) => {
            run.error = Some(error);
        }
    }

    Ok(finish_transition(run, transition, now))
}

/// Apply lease expiry to a run the sweeper found past its deadline.
pub(crate) fn apply_reclaim(run: &mut Run, now: DateTime<Utc>) -> Result<(Transition, Option<Value>)> {
    let previous_owner = run.lease_owner.clone().unwrap_or_default();
    let transition = run.status.next(Trigger::LeaseExpired {
        attempts_remain: run.attempts_remain(),
        cancel_requested: run.cancel_requested_at.is_some(),
    })?;

    let expired = RunError::lease_expired(&previous_owner);
    run.error = Some(if transition.retries_exhausted {
        RunError::max_retries_exceeded(run.attempt, Some(&expired))
    } else if transition.to == RunStatus::Cancelled {
        RunError::cancelled("cancelled while the lease holder was unresponsive")
    } else {
        expired
    });

    Ok(finish_transition(run, transition, now))
}

/// Cancel a run nobody holds.
pub(crate) fn apply_queued_cancel(run: &mut Run, now: DateTime<Utc>) -> Result<(Transition, Option<Value>)> {
    let transition = run.status.next(Trigger::CancelWhileQueued)?;
    run.cancel_requested_at.get_or_insert(now);
    run.error = Some(RunError::cancelled("cancelled before a worker claimed it"));
    Ok(finish_transition(run, transition, now))
}

fn finish_transition(
    run: &mut Run,
    transition: Transition,
    now: DateTime<Utc>,
) -> (Transition, Option<Value>) {
    run.status = transition.to;
    run.lease_owner = None;
    run.lease_expires_at = None;
    run.updated_at = now;

    if transition.to.is_terminal() {
        run.finished_at = Some(now);
        (transition, Some(terminal_payload(run)))
    } else {
        (transition, None)
    }
}

/// Payload of the single terminal event.
pub(crate) fn terminal_payload(run: &Run) -> Value {
    let mut payload = json!({
        "status": run.status.as_str(),
        "attempt": run.attempt,
    });
    if let Some(output) = &run.output {
        payload["output"] = output.clone();
    }
    if let Some(error) = &run.error {
        payload["error"] = json!(error);
    }
    payload
}

/// Checks shared by all backends before a non-terminal append.
pub(crate) fn check_append(run: &Run, event_type: EventType, fence: Option<&Lease>) -> Result<()> {
    if event_type.is_terminal() {
        return Err(RuntimeError::Internal(format!(
            "{} is written by finalization, not appended",
            event_type
        )));
    }
    match fence {
        Some(lease) if !run.is_held_by(&lease.worker_id, lease.attempt) => {
            Err(RuntimeError::LeaseLost(run.id))
        }
        None if run.is_terminal() => Err(RuntimeError::InvalidTransition {
            from: run.status,
            to: run.status,
        }),
        _ => Ok(()),
    }
}
