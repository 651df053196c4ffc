//! Pipeline execution engine.
//!
//! `PipelineExecutor` is the central orchestrator:
//! 1. Validates the DAG and produces a topological ordering.
//! 2. Opens a run row for the requested data interval.
//! 3. Iterates through tasks in order, dispatching each via `ExecutableTask`.
//! 4. Persists every attempt via the `db` crate.
//! 5. Retries `TaskError::Retryable` after the task's retry delay (up to
//!    `retries` extra attempts) and fails `TaskError::Fatal` immediately.
//! 6. Stops executing after the first failed task; everything downstream is
//!    recorded as `upstream_failed`, everything else as `skipped`.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use db::repository::task_instances::{self, AttemptOutcome};
use db::repository::runs;
use db::{DbError, DbPool, NewRun, RunState, RunType, TaskState};
use tasks::{ExecutableTask, TaskContext, TaskError};

use crate::dag::validate_dag;
use crate::models::{Pipeline, TaskDefinition};
use crate::planner::{manual_run_id, scheduled_run_id, DataInterval};
use crate::registry::TaskRegistry;
use crate::EngineError;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Tuning knobs for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound for any retry delay, whatever the pipeline asks for.
    pub max_retry_delay: Duration,
    /// Store each successful attempt's JSON output in the run history.
    pub record_output: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retry_delay: Duration::from_secs(24 * 60 * 60),
            record_output: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Requests and reports
// ---------------------------------------------------------------------------

/// What to run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub run_id: String,
    pub run_type: RunType,
    pub interval: DataInterval,
}

impl RunRequest {
    /// The run the scheduler fires for `interval`.
    pub fn scheduled(interval: DataInterval) -> Self {
        Self {
            run_id: scheduled_run_id(interval.start),
            run_type: RunType::Scheduled,
            interval,
        }
    }

    /// An operator-triggered run; its interval collapses to the logical date.
    pub fn manual(logical_date: DateTime<Utc>) -> Self {
        Self {
            run_id: manual_run_id(logical_date),
            run_type: RunType::Manual,
            interval: DataInterval { start: logical_date, end: logical_date },
        }
    }
}

/// Final outcome of one task within a run.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub task_id: String,
    pub state: TaskState,
    /// Attempts made; `0` for tasks that never ran.
    pub tries: u32,
    pub error: Option<String>,
    pub output: Option<Value>,
}

/// The result of running a full pipeline.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Primary key of the `pipeline_runs` row created for this run.
    pub run_pk: Uuid,
    pub run_id: String,
    pub state: RunState,
    /// One entry per task, in execution order.
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.state == RunState::Success
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.task_id == task_id)
    }
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

/// Runs pipelines one task at a time and records the history.
#[derive(Clone)]
pub struct PipelineExecutor {
    pool: DbPool,
    config: ExecutorConfig,
}

impl PipelineExecutor {
    /// Create a new executor.
    pub fn new(pool: DbPool, config: ExecutorConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Run the pipeline for the requested interval.
    ///
    /// A failing task does not make this return `Err`: the run is recorded
    /// and reported as [`RunState::Failed`].
    ///
    /// # Errors
    /// Returns `EngineError` for validation failures, missing task
    /// implementations, duplicate run IDs, or database problems.
    #[instrument(skip_all, fields(pipeline_id = %pipeline.id, run_id = %request.run_id))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        registry: &TaskRegistry,
        request: RunRequest,
    ) -> Result<RunReport, EngineError> {
        // ------------------------------------------------------------------
        // Validate, topologically sort, and resolve implementations.
        // ------------------------------------------------------------------
        let order = validate_dag(pipeline)?;
        let mut plan: Vec<(&TaskDefinition, &dyn ExecutableTask)> = Vec::with_capacity(order.len());
        for task_id in &order {
            let def = pipeline
                .task(task_id)
                .ok_or_else(|| EngineError::UnknownTask(task_id.clone()))?;
            let task = registry
                .get(task_id)
                .ok_or_else(|| EngineError::TaskNotRegistered(task_id.clone()))?;
            plan.push((def, task.as_ref()));
        }

        info!("DAG validated, executing {} tasks in order: {:?}", order.len(), order);

        // ------------------------------------------------------------------
        // Open the run row.
        // ------------------------------------------------------------------
        let duplicate = || EngineError::DuplicateRun {
            pipeline_id: pipeline.id.clone(),
            run_id: request.run_id.clone(),
        };
        if runs::get_run(&self.pool, &pipeline.id, &request.run_id).await?.is_some() {
            return Err(duplicate());
        }

        let run = runs::create_run(
            &self.pool,
            &NewRun {
                pipeline_id: pipeline.id.clone(),
                run_id: request.run_id.clone(),
                run_type: request.run_type,
                logical_date: request.interval.logical_date(),
                data_interval_start: request.interval.start,
                data_interval_end: request.interval.end,
            },
        )
        .await
        .map_err(|e| match e {
            DbError::Conflict(_) => duplicate(),
            other => other.into(),
        })?;

        let reports = match self.execute_tasks(pipeline, plan, run.id, &request).await {
            Ok(reports) => reports,
            Err(e) => {
                error!("run {} aborted: {}", run.run_id, e);
                if let Err(close_err) = runs::finish_run(&self.pool, run.id, RunState::Failed).await {
                    warn!("could not mark run {} as failed: {}", run.run_id, close_err);
                }
                return Err(e);
            }
        };

        // ------------------------------------------------------------------
        // Close the run.
        // ------------------------------------------------------------------
        let state = if reports
            .iter()
            .any(|r| matches!(r.state, TaskState::Failed | TaskState::UpstreamFailed))
        {
            RunState::Failed
        } else {
            RunState::Success
        };

        runs::finish_run(&self.pool, run.id, state).await?;

        match state {
            RunState::Success => info!("pipeline '{}' run {} succeeded", pipeline.id, run.run_id),
            _ => error!("pipeline '{}' run {} failed", pipeline.id, run.run_id),
        }

        Ok(RunReport {
            run_pk: run.id,
            run_id: run.run_id,
            state,
            tasks: reports,
        })
    }

    /// Execute one task once, outside of any run, without recording history.
    ///
    /// The outer `Result` reports engine problems (unknown task, missing
    /// implementation); the inner one is the task's own outcome.
    #[instrument(skip(self, pipeline, registry), fields(pipeline_id = %pipeline.id))]
    pub async fn test_task(
        &self,
        pipeline: &Pipeline,
        registry: &TaskRegistry,
        task_id: &str,
        logical_date: DateTime<Utc>,
    ) -> Result<Result<Value, TaskError>, EngineError> {
        let def = pipeline
            .task(task_id)
            .ok_or_else(|| EngineError::UnknownTask(task_id.to_owned()))?;
        let task = registry
            .get(task_id)
            .ok_or_else(|| EngineError::TaskNotRegistered(task_id.to_owned()))?;

        let ctx = TaskContext {
            pipeline_id: pipeline.id.clone(),
            task_id: def.id.clone(),
            run_id: format!("test__{}", logical_date.to_rfc3339()),
            logical_date,
            data_interval_start: logical_date,
            data_interval_end: logical_date,
            try_number: 1,
            max_tries: 1,
        };

        Ok(task.execute(&ctx).await)
    }

    // -----------------------------------------------------------------------
    // Internal: walk the plan, one task at a time.
    // -----------------------------------------------------------------------

    async fn execute_tasks(
        &self,
        pipeline: &Pipeline,
        plan: Vec<(&TaskDefinition, &dyn ExecutableTask)>,
        run_pk: Uuid,
        request: &RunRequest,
    ) -> Result<Vec<TaskReport>, EngineError> {
        let mut states: HashMap<&str, TaskState> = HashMap::new();
        let mut reports: Vec<TaskReport> = Vec::with_capacity(plan.len());
        let mut halted_by: Option<&str> = None;

        for (def, task) in plan {
            let upstream: Vec<TaskState> = pipeline
                .upstream_of(&def.id)
                .into_iter()
                .filter_map(|id| states.get(id).copied())
                .collect();

            let blocked = if upstream
                .iter()
                .any(|s| matches!(s, TaskState::Failed | TaskState::UpstreamFailed))
            {
                Some((TaskState::UpstreamFailed, "an upstream task failed".to_owned()))
            } else if let Some(failed) = halted_by {
                Some((TaskState::Skipped, format!("run halted after '{failed}' failed")))
            } else if upstream.contains(&TaskState::Skipped) {
                Some((TaskState::Skipped, "an upstream task was skipped".to_owned()))
            } else {
                None
            };

            let report = match blocked {
                Some((state, reason)) => {
                    info!(task_id = %def.id, state = %state, "not running task: {reason}");
                    task_instances::record_task_state(&self.pool, run_pk, &def.id, state, Some(reason.as_str()))
                        .await?;
                    TaskReport {
                        task_id: def.id.clone(),
                        state,
                        tries: 0,
                        error: Some(reason),
                        output: None,
                    }
                }
                None => {
                    self.execute_with_retry(pipeline, def, task, run_pk, request)
                        .await?
                }
            };

            if report.state == TaskState::Failed && halted_by.is_none() {
                halted_by = Some(def.id.as_str());
            }
            states.insert(def.id.as_str(), report.state);
            reports.push(report);
        }

        Ok(reports)
    }

    // -----------------------------------------------------------------------
    // Internal: execute a single task with retry logic.
    // -----------------------------------------------------------------------

    async fn execute_with_retry(
        &self,
        pipeline: &Pipeline,
        def: &TaskDefinition,
        task: &dyn ExecutableTask,
        run_pk: Uuid,
        request: &RunRequest,
    ) -> Result<TaskReport, EngineError> {
        let policy = pipeline.retry_policy_for(def);
        let max_tries = policy.max_tries();
        let mut try_number = 0u32;

        loop {
            try_number += 1;

            let ctx = TaskContext {
                pipeline_id: pipeline.id.clone(),
                task_id: def.id.clone(),
                run_id: request.run_id.clone(),
                logical_date: request.interval.logical_date(),
                data_interval_start: request.interval.start,
                data_interval_end: request.interval.end,
                try_number,
                max_tries,
            };

            let attempt =
                task_instances::start_task_attempt(&self.pool, run_pk, &def.id, try_number).await?;
            info!(task_id = %def.id, "starting attempt {}/{}", try_number, max_tries);

            let span = info_span!("task", task_id = %def.id, try_number);
            let result = task.execute(&ctx).instrument(span).await;

            let report = match result {
                Ok(output) => {
                    info!(task_id = %def.id, "task succeeded on attempt {}", try_number);
                    task_report(def, TaskState::Success, try_number, None, Some(output))
                }

                Err(TaskError::Skipped(msg)) => {
                    info!(task_id = %def.id, "task skipped: {}", msg);
                    task_report(def, TaskState::Skipped, try_number, Some(msg), None)
                }

                Err(TaskError::Fatal(msg)) => {
                    error!(task_id = %def.id, "task failed fatally: {}", msg);
                    task_report(def, TaskState::Failed, try_number, Some(msg), None)
                }

                Err(TaskError::Retryable(msg)) if try_number < max_tries => {
                    let delay = policy.delay_for(try_number).min(self.config.max_retry_delay);
                    warn!(
                        task_id = %def.id,
                        "retryable error (attempt {}/{}), retrying in {:?}: {}",
                        try_number, max_tries, delay, msg
                    );
                    self.close_attempt(attempt.id, TaskState::UpForRetry, None, Some(msg)).await?;
                    tokio::time::sleep(delay).await;
                    continue;
                }

                Err(TaskError::Retryable(msg)) => {
                    error!(task_id = %def.id, "task failed after {} attempt(s): {}", try_number, msg);
                    task_report(def, TaskState::Failed, try_number, Some(msg), None)
                }
            };

            self.close_attempt(attempt.id, report.state, report.output.as_ref(), report.error.clone())
                .await?;
            return Ok(report);
        }
    }

    async fn close_attempt(
        &self,
        attempt_id: Uuid,
        state: TaskState,
        output: Option<&Value>,
        error: Option<String>,
    ) -> Result<(), EngineError> {
        let outcome = AttemptOutcome {
            state,
            exit_code: output.and_then(|o| o.get("exit_code")).and_then(Value::as_i64),
            output: output
                .filter(|_| self.config.record_output)
                .and_then(|o| serde_json::to_string(o).ok()),
            error,
        };
        task_instances::finish_task_attempt(&self.pool, attempt_id, &outcome).await?;
        Ok(())
    }
}

fn task_report(
    def: &TaskDefinition,
    state: TaskState,
    tries: u32,
    error: Option<String>,
    output: Option<Value>,
) -> TaskReport {
    TaskReport {
        task_id: def.id.clone(),
        state,
        tries,
        error,
        output,
    }
}
