use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::lease::LeaseManager;
use crate::store::Lease;

/// Notice sent to an attempt's supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Ownership is gone or could not be confirmed; stop without finalizing.
    LeaseLost,
    CancelRequested,
}

/// Signal senders of the attempts running in this process, by run.
///
/// Lets a cancel issued in-process reach the supervisor without waiting for the next
/// cancel-flag poll.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    senders: Arc<Mutex<HashMap<Uuid, mpsc::Sender<Signal>>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, run_id: Uuid, tx: mpsc::Sender<Signal>) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(run_id, tx);
        }
    }

    pub fn remove(&self, run_id: &Uuid) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(run_id);
        }
    }

    /// Tell the local supervisor of `run_id`, if any, to cancel. Returns whether one
    /// was found.
    pub fn cancel(&self, run_id: &Uuid) -> bool {
        let sender = match self.senders.lock() {
            Ok(senders) => senders.get(run_id).cloned(),
            Err(_) => None,
        };
        match sender {
            Some(tx) => tx.try_send(Signal::CancelRequested).is_ok(),
            None => false,
        }
    }
}

/// Keeps one attempt's lease alive and watches its cancel flag.
pub struct Heartbeat {
    leases: LeaseManager,
    interval: Duration,
    cancel_check_interval: Duration,
}

impl Heartbeat {
    pub fn new(leases: LeaseManager, interval: Duration, cancel_check_interval: Duration) -> Self {
        Self {
            leases,
            interval,
            cancel_check_interval,
        }
    }

    /// Renew until the lease is lost or the receiver goes away.
    ///
    /// Any renewal failure counts as a lost lease: once ownership cannot be confirmed
    /// the attempt must stop.
    pub async fn run(self, mut lease: Lease, tx: mpsc::Sender<Signal>) {
        let mut renew = tokio::time::interval(self.interval);
        renew.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut check = tokio::time::interval(self.cancel_check_interval);
        check.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // both fire immediately; the claim itself just set the lease and flag
        renew.tick().await;
        check.tick().await;

        let store = self.leases.store().clone();
        let run_id = lease.run_id;
        let worker_id = lease.worker_id.clone();
        let mut cancel_sent = false;

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                _ = renew.tick() => match self.leases.heartbeat(&mut lease).await {
                    Ok(cancel_requested) => {
                        if cancel_requested && !cancel_sent {
                            cancel_sent = tx.send(Signal::CancelRequested).await.is_ok();
                        }
                    }
                    Err(e) => {
                        tracing::warn!(run_id = %run_id, worker_id = %worker_id, error = %e, "Heartbeat failed");
                        let _ = tx.send(Signal::LeaseLost).await;
                        break;
                    }
                },
                _ = check.tick(), if !cancel_sent => match store.get_run(run_id).await {
                    Ok(Some(run)) if run.cancel_requested_at.is_some() => {
                        tracing::debug!(run_id = %run_id, "Cancel flag observed");
                        cancel_sent = tx.send(Signal::CancelRequested).await.is_ok();
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::debug!(run_id = %run_id, error = %e, "Cancel flag check failed");
                    }
                },
            }
        }
    }
}
