//! Worker side of the queue: claiming runs and executing them.
//!
//! # Components
//!
//! - [`Dispatcher`]: polls for work and runs up to `concurrency` attempts at once
//! - [`Executor`]: per-agent-key execution contract, looked up in an [`ExecutorRegistry`]
//! - [`heartbeat`]: lease renewal and cancel-flag watching for one attempt
//! - [`builtin`]: the `echo` and `shell` agents
//!
//! # Attempt Flow
//!
//! 1. The dispatcher claims a run through the lease manager and records `run.started`
//! 2. The executor runs in its own task while the heartbeat keeps the lease alive
//! 3. Cancellation, timeout or a lost lease stops the executor cooperatively, then
//!    forcibly after the grace period
//! 4. The outcome is finalized under the lease, writing the terminal event

pub mod builtin;
pub mod dispatcher;
pub mod executor;
pub mod heartbeat;

pub use builtin::{EchoExecutor, ShellExecutor};
pub use dispatcher::Dispatcher;
pub use executor::{ExecutionError, Executor, ExecutorRegistry, RunContext, StopHandle, StopReason};
pub use heartbeat::{CancelRegistry, Heartbeat, Signal};
