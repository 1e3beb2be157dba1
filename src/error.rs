//! Error types for gateway-events.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("database error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Failure reported by a non-SQL store backend.
    #[error("event store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("handler already registered for task type: {0}")]
    HandlerAlreadyRegistered(String),

    #[error("task queue at capacity ({max_concurrent} concurrent tasks)")]
    QueueFull { max_concurrent: usize },

    #[error("task queue is not running")]
    QueueStopped,

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
