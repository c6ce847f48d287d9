//! Run status transitions.
//!
//! ```text
//! queued --lease acquired--> running --success--------------> succeeded
//!    ^                         |  \---permanent error-------> failed
//!    |                         |  \---cancel honored--------> cancelled
//!    |                         |  \---timeout---------------> timed_out
//!    +--lease expired or ------+  \---retries exhausted-----> failed
//!       transient error, attempts remain
//! ```
//!
//! Stores consult [`RunStatus::next`] for every mutation so that no backend can move a
//! run out of a terminal status or skip `running`.

use crate::error::{Result, RuntimeError};
use crate::events::EventType;
use crate::run::RunStatus;

/// What happened to a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    LeaseAcquired,
    ExecutorSucceeded,
    PermanentError,
    TransientError { attempts_remain: bool },
    CancelHonored,
    /// Cancellation of a run nobody has claimed yet
    CancelWhileQueued,
    TimeoutExceeded,
    LeaseExpired {
        attempts_remain: bool,
        cancel_requested: bool,
    },
}

/// Result of applying a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: RunStatus,
    pub to: RunStatus,
    /// Set when a retryable failure was turned terminal because attempts ran out
    pub retries_exhausted: bool,
}

impl Transition {
    /// The event that must accompany this transition, if it is terminal.
    pub fn terminal_event(&self) -> Option<EventType> {
        match self.to {
            RunStatus::Succeeded => Some(EventType::RunSucceeded),
            RunStatus::Failed => Some(EventType::RunFailed),
            RunStatus::Cancelled => Some(EventType::RunCancelled),
            RunStatus::TimedOut => Some(EventType::RunTimedOut),
            RunStatus::Queued | RunStatus::Running => None,
        }
    }
}

impl RunStatus {
    /// Apply `trigger`, or fail with `InvalidTransition` when it does not apply.
    pub fn next(self, trigger: Trigger) -> Result<Transition> {
        use RunStatus::*;

        let (to, retries_exhausted) = match (self, trigger) {
            (Queued, Trigger::LeaseAcquired) => (Running, false),
            (Queued, Trigger::CancelWhileQueued) => (Cancelled, false),
            (Running, Trigger::ExecutorSucceeded) => (Succeeded, false),
            (Running, Trigger::PermanentError) => (Failed, false),
            (Running, Trigger::TransientError { attempts_remain }) => {
                if attempts_remain {
                    (Queued, false)
                } else {
                    (Failed, true)
                }
            }
            (Running, Trigger::CancelHonored) => (Cancelled, false),
            (Running, Trigger::TimeoutExceeded) => (TimedOut, false),
            (
                Running,
                Trigger::LeaseExpired {
                    attempts_remain,
                    cancel_requested,
                },
            ) => {
                if cancel_requested {
                    (Cancelled, false)
                } else if attempts_remain {
                    (Queued, false)
                } else {
                    (Failed, true)
                }
            }
            (from, trigger) => {
                return Err(RuntimeError::InvalidTransition {
                    from,
                    to: Self::intended(trigger),
                })
            }
        };

        Ok(Transition {
            from: self,
            to,
            retries_exhausted,
        })
    }

    /// Best-effort target for error reporting on a rejected trigger.
    fn intended(trigger: Trigger) -> RunStatus {
        match trigger {
            Trigger::LeaseAcquired => RunStatus::Running,
            Trigger::ExecutorSucceeded => RunStatus::Succeeded,
            Trigger::PermanentError | Trigger::TransientError { .. } => RunStatus::Failed,
            Trigger::CancelHonored | Trigger::CancelWhileQueued => RunStatus::Cancelled,
            Trigger::TimeoutExceeded => RunStatus::TimedOut,
            Trigger::LeaseExpired { .. } => RunStatus::Queued,
        }
    }
}
