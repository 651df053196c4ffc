//! Engine-level error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced by the pipeline engine (loading, validation, execution).
///
/// A task failing is *not* an engine error: it is reported through the
/// run's final state.
#[derive(Debug, Error)]
pub enum EngineError {
    // ------ Definition errors ------

    #[error("cannot read pipeline definition {path}: {source}")]
    ReadDefinition {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    /// A cron expression could not be parsed.
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron {
        expression: String,
        reason: String,
    },

    // ------ Validation errors ------

    /// The pipeline has no tasks at all.
    #[error("pipeline '{0}' has no tasks")]
    EmptyPipeline(String),

    /// A task has an empty ID.
    #[error("task IDs must not be empty")]
    EmptyTaskId,

    /// Two or more tasks share the same ID.
    #[error("duplicate task ID: '{0}'")]
    DuplicateTaskId(String),

    /// An edge references a task ID that doesn't exist in the pipeline.
    #[error("edge references unknown task '{task_id}' ({side} side)")]
    UnknownTaskReference {
        task_id: String,
        side: &'static str,
    },

    /// Topological sort detected a cycle.
    #[error("pipeline graph contains a cycle")]
    CycleDetected,

    // ------ Execution errors ------

    /// No implementation was registered for a task.
    #[error("no implementation registered for task '{0}'")]
    TaskNotRegistered(String),

    /// The requested task does not exist in the pipeline.
    #[error("pipeline has no task '{0}'")]
    UnknownTask(String),

    /// A run with the same run ID already exists.
    #[error("run '{run_id}' already exists for pipeline '{pipeline_id}'")]
    DuplicateRun {
        pipeline_id: String,
        run_id: String,
    },

    /// The scheduler was asked to drive a pipeline without a schedule.
    #[error("pipeline '{0}' has no schedule")]
    Unscheduled(String),

    /// Persistence error from the db crate.
    #[error("database error: {0}")]
    Database(#[from] db::DbError),
}
