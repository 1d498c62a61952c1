use std::path::PathBuf;

use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Job already queued: {0}")]
    DuplicateJob(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job is running: {0}")]
    JobRunning(Uuid),

    #[error("Queue is locked by another scheduler: {}", .0.display())]
    AlreadyLocked(PathBuf),

    #[error("Invalid job file name: {0}")]
    InvalidFileName(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure raised by a task handler while a job runs.
///
/// These never reach the control loop; the executor turns them into a
/// retry-counter increment.
#[derive(Error, Debug)]
pub enum TaskError {
    #[error("No handler registered for task {0:?}")]
    UnknownTask(String),

    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Failed(String),
}

impl From<serde_json::Error> for TaskError {
    fn from(e: serde_json::Error) -> Self {
        TaskError::InvalidArgs(e.to_string())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(e: std::io::Error) -> Self {
        TaskError::Failed(e.to_string())
    }
}
