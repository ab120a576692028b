//! Error types for the task engine.
//!
//! The taxonomy mirrors how failures surface: push-time validation errors are
//! returned synchronously and never create a task, runtime errors finalize the
//! owning task as `Errored` and are reported only through its callback, and
//! queue contract violations are programming defects caught by assertions.

use thiserror::Error;

use crate::task::TaskId;

/// Synchronous validation failure at push time.
///
/// When a push operation returns one of these, no task was created and no
/// callback will ever fire for the request.
#[derive(Debug, Error)]
pub enum PushError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("source file not found: {0}")]
    SourceNotFound(String),

    #[error("malformed URL '{url}': {reason}")]
    MalformedUrl { url: String, reason: String },

    #[error("target directory does not exist: {0}")]
    TargetDirMissing(String),

    #[error("engine is shut down")]
    ShutDown,
}

/// Failure detected by a task handler mid-execution.
///
/// Local to the task: the task finalizes as `Errored` with this message and
/// the process keeps running.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Build a `Failed` error from anything displayable.
    pub fn msg(msg: impl std::fmt::Display) -> Self {
        TaskError::Failed(msg.to_string())
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(err: anyhow::Error) -> Self {
        TaskError::Failed(format!("{err:#}"))
    }
}

/// Queue contract violation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("task {0} not found in queue")]
    NotFound(TaskId),

    #[error("task {0} is not in a terminal state")]
    NotTerminal(TaskId),
}

/// Engine construction failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("failed to spawn worker thread: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}
