use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DispatchError {
    /// Misuse of the task queue or a failed worker: stale state, duplicate
    /// results, or an error raised while a drone executed its batch.
    #[error("Drone task queue error: {0}")]
    TaskQueue(String),

    #[error("Transport error on {hostname}: {message}")]
    Transport { hostname: String, message: String },

    #[error("Protocol error from {hostname}: {message}")]
    Protocol { hostname: String, message: String },

    #[error("Drone not found: {0}")]
    DroneNotFound(String),

    #[error("Invalid call {method}: {message}")]
    InvalidCall { method: String, message: String },

    #[error("Invalid job directory: {0}")]
    InvalidJobDirectory(PathBuf),

    #[error("Completion service error: {0}")]
    CompletionService(String),

    #[error("Offload error: {0}")]
    Offload(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
