use thiserror::Error;

use crate::job::JobState;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job already exists: {0}")]
    Conflict(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job {id} is not in the dead-letter queue (state: {state})")]
    NotInDlq { id: String, state: JobState },

    #[error("Job {id} is not {expected} (state: {actual})")]
    IllegalTransition {
        id: String,
        expected: JobState,
        actual: JobState,
    },

    #[error("Unknown config key: {0}")]
    UnknownConfigKey(String),

    #[error("Invalid value for {key}: {reason}")]
    InvalidConfigValue { key: String, reason: String },

    #[error("Invalid job spec: {0}")]
    InvalidJobSpec(String),

    #[error("Invalid state filter: {0} (expected pending, processing, completed or dead)")]
    InvalidStateFilter(String),

    #[error("{count} worker(s) failed to register within {timeout_secs}s")]
    WorkerStartTimeout { count: usize, timeout_secs: u64 },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QueueError>;
