use thiserror::Error;
use uuid::Uuid;

use crate::run::RunStatus;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Run not found: {0}")]
    RunNotFound(Uuid),

    #[error("Conversation not found: {0}")]
    ConversationNotFound(Uuid),

    #[error("No executor registered for agent key: {0}")]
    UnknownAgent(String),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("Lease lost on run {0}")]
    LeaseLost(Uuid),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Run queue at capacity")]
    QueueFull,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
