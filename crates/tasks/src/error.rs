//! Task-level error type.

use thiserror::Error;

/// Errors returned by a task's `execute` method.
///
/// The executor uses the variant to decide retry behaviour:
/// - `Retryable`: the attempt is retried while the task has tries left.
/// - `Fatal`: the task fails immediately, remaining tries are forfeited.
/// - `Skipped`: the task ends as skipped and downstream tasks are skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// Transient failure; the executor should re-try the task.
    #[error("retryable task error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal task error: {0}")]
    Fatal(String),

    /// The task asked to be skipped.
    #[error("task skipped: {0}")]
    Skipped(String),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
