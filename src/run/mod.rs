pub mod model;
pub mod state;

pub use model::{Checkpoint, Conversation, NewRun, Run, RunError, RunStatus, DEFAULT_MAX_ATTEMPTS};
pub use state::{Transition, Trigger};
