//! Worker-facing leases over the store's atomic claim.
//!
//! - [`LeaseManager::acquire`] claims the oldest eligible run
//! - [`LeaseManager::heartbeat`] extends a held lease and reports pending cancellation
//! - [`LeaseManager::release`] finalizes an attempt and publishes its terminal event
//! - [`LeaseManager::sweep`] reclaims leases whose holder stopped heartbeating

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, RuntimeError};
use crate::events::EventBus;
use crate::run::Run;
use crate::store::{Finalized, Lease, Outcome, Reclaimed, Renewal, Store};

/// A granted lease together with the run it covers.
#[derive(Debug, Clone)]
pub struct Claim {
    pub lease: Lease,
    pub run: Run,
}

#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    bus: EventBus,
    lease_ttl: Duration,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, bus: EventBus, lease_ttl: Duration) -> Self {
        Self {
            store,
            bus,
            lease_ttl,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Claim one eligible run for `worker_id`.
    ///
    /// `Ok(None)` means the queue has nothing for this worker right now; poll again.
    pub async fn acquire(&self, worker_id: &str, agent_keys: &[String]) -> Result<Option<Claim>> {
        let Some(run) = self
            .store
            .try_claim_next(agent_keys, worker_id, self.lease_ttl)
            .await?
        else {
            return Ok(None);
        };

        let lease = Lease::for_run(&run).ok_or_else(|| {
            RuntimeError::Store(format!("claimed run {} carries no lease", run.id))
        })?;
        tracing::info!(
            run_id = %run.id,
            worker_id,
            agent_key = %run.agent_key,
            attempt = run.attempt,
            max_attempts = run.max_attempts,
            "Lease acquired"
        );
        Ok(Some(Claim { lease, run }))
    }

    /// Extend `lease`. Returns whether cancellation has been requested for the run.
    ///
    /// Fails with `LeaseLost` when the run was reclaimed or claimed by someone else.
    pub async fn heartbeat(&self, lease: &mut Lease) -> Result<bool> {
        match self.store.renew_lease(lease, self.lease_ttl).await? {
            Renewal::Renewed {
                expires_at,
                cancel_requested,
            } => {
                lease.expires_at = expires_at;
                tracing::debug!(run_id = %lease.run_id, worker_id = %lease.worker_id, %expires_at, "Lease renewed");
                Ok(cancel_requested)
            }
            Renewal::Lost => {
                tracing::warn!(run_id = %lease.run_id, worker_id = %lease.worker_id, attempt = lease.attempt, "Lease lost");
                Err(RuntimeError::LeaseLost(lease.run_id))
            }
        }
    }

    /// Finalize the attempt covered by `lease` and publish the terminal event, if any.
    pub async fn release(&self, lease: &Lease, outcome: Outcome) -> Result<Finalized> {
        let finalized = self.store.finalize(lease, outcome).await?;
        match &finalized {
            Finalized::Terminal { run, event } => {
                tracing::info!(
                    run_id = %run.id,
                    worker_id = %lease.worker_id,
                    status = %run.status,
                    attempt = run.attempt,
                    "Run finished"
                );
                self.bus.announce(event);
            }
            Finalized::Requeued { run } => {
                tracing::info!(
                    run_id = %run.id,
                    worker_id = %lease.worker_id,
                    attempt = run.attempt,
                    max_attempts = run.max_attempts,
                    available_at = %run.available_at,
                    "Run requeued for retry"
                );
            }
        }
        Ok(finalized)
    }

    /// Reclaim every expired lease once.
    pub async fn sweep(&self) -> Result<Vec<Reclaimed>> {
        let reclaimed = self.store.reclaim_expired_leases().await?;
        for entry in &reclaimed {
            match entry {
                Reclaimed::Requeued { run_id, attempt } => {
                    tracing::warn!(run_id = %run_id, attempt, "Expired lease reclaimed, run requeued");
                }
                Reclaimed::Terminal { run, event } => {
                    tracing::warn!(run_id = %run.id, status = %run.status, attempt = run.attempt, "Expired lease reclaimed, run finished");
                    self.bus.announce(event);
                }
            }
        }
        Ok(reclaimed)
    }

    /// Sweep every `interval` until `shutdown` fires.
    pub async fn run_sweeper(self, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, at = %Utc::now(), "Lease sweep failed");
                    }
                }
            }
        }
        tracing::debug!("Lease sweeper stopped");
    }
}
