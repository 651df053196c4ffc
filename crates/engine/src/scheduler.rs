//! The cron trigger: keeps a scheduled pipeline running until shut down.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, instrument, warn};

use db::repository::runs;

use crate::dag::validate_dag;
use crate::executor::{PipelineExecutor, RunRequest};
use crate::models::Pipeline;
use crate::planner::next_data_interval;
use crate::registry::TaskRegistry;
use crate::EngineError;

/// Longest single sleep; the plan is recomputed after each one so clock
/// jumps and suspends are noticed.
const MAX_SLEEP: Duration = Duration::from_secs(300);

/// Pause before re-planning after a run could not be carried out.
const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// How a scheduler loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerExit {
    /// The shutdown future resolved.
    Shutdown,
    /// The schedule has no further intervals (e.g. `end_date` passed).
    Exhausted,
}

/// Drives one pipeline on its cron schedule, one run at a time.
pub struct Scheduler {
    executor: PipelineExecutor,
    pipeline: Pipeline,
    registry: TaskRegistry,
    error_backoff: Duration,
}

impl Scheduler {
    /// # Errors
    /// [`EngineError::Unscheduled`] if the pipeline has no schedule, or any
    /// DAG validation error.
    pub fn new(
        executor: PipelineExecutor,
        pipeline: Pipeline,
        registry: TaskRegistry,
    ) -> Result<Self, EngineError> {
        if pipeline.schedule.is_none() {
            return Err(EngineError::Unscheduled(pipeline.id.clone()));
        }
        validate_dag(&pipeline)?;
        Ok(Self {
            executor,
            pipeline,
            registry,
            error_backoff: DEFAULT_ERROR_BACKOFF,
        })
    }

    /// How long to wait after a run or a history lookup fails with an
    /// engine error before planning again.
    pub fn with_error_backoff(mut self, backoff: Duration) -> Self {
        self.error_backoff = backoff;
        self
    }

    /// Run scheduled intervals as they come due until `shutdown` resolves
    /// or the schedule is exhausted.
    ///
    /// A run still in flight when `shutdown` resolves is abandoned; its row
    /// is marked failed the next time a scheduler starts. Engine errors from
    /// a single run are logged and the loop carries on after a backoff.
    ///
    /// # Errors
    /// Only if abandoned runs cannot be cleaned up on start.
    #[instrument(skip_all, fields(pipeline_id = %self.pipeline.id))]
    pub async fn run_until<F>(&self, shutdown: F) -> Result<SchedulerExit, EngineError>
    where
        F: Future<Output = ()>,
    {
        let pool = self.executor.pool();
        let pipeline_id = self.pipeline.id.as_str();

        let orphaned = runs::fail_orphaned_runs(pool, pipeline_id).await?;
        if orphaned > 0 {
            warn!("marked {} abandoned run(s) as failed", orphaned);
        }

        info!(
            schedule = %self.pipeline.schedule.as_ref().map(|s| s.expression()).unwrap_or_default(),
            catchup = self.pipeline.catchup,
            "scheduler started"
        );

        tokio::pin!(shutdown);

        loop {
            let last = match runs::latest_scheduled_run(pool, pipeline_id).await {
                Ok(row) => row.map(|r| r.logical_date),
                Err(e) => {
                    error!("cannot read run history: {e}; retrying in {:?}", self.error_backoff);
                    if interrupted(self.error_backoff, shutdown.as_mut()).await {
                        info!("shutdown requested, scheduler stopping");
                        return Ok(SchedulerExit::Shutdown);
                    }
                    continue;
                }
            };

            let Some(interval) = next_data_interval(&self.pipeline, last, Utc::now()) else {
                info!("schedule exhausted, no further runs");
                return Ok(SchedulerExit::Exhausted);
            };

            let wait = (interval.end - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            if !wait.is_zero() {
                info!(
                    logical_date = %interval.start,
                    fires_at = %interval.end,
                    "next run in {:?}",
                    wait
                );
                if interrupted(wait.min(MAX_SLEEP), shutdown.as_mut()).await {
                    info!("shutdown requested, scheduler stopping");
                    return Ok(SchedulerExit::Shutdown);
                }
                continue;
            }

            let request = RunRequest::scheduled(interval);
            let result = tokio::select! {
                result = self.executor.run(&self.pipeline, &self.registry, request) => result,
                _ = &mut shutdown => {
                    warn!("shutdown requested, abandoning the run in progress");
                    return Ok(SchedulerExit::Shutdown);
                }
            };

            match result {
                Ok(report) if report.succeeded() => {
                    info!(run_id = %report.run_id, "scheduled run succeeded")
                }
                Ok(report) => {
                    error!(run_id = %report.run_id, "scheduled run failed")
                }
                Err(e) => {
                    error!(
                        logical_date = %interval.start,
                        "scheduled run could not be carried out: {e}; retrying in {:?}",
                        self.error_backoff
                    );
                    if interrupted(self.error_backoff, shutdown.as_mut()).await {
                        info!("shutdown requested, scheduler stopping");
                        return Ok(SchedulerExit::Shutdown);
                    }
                }
            }
        }
    }
}

/// Sleep for `duration`; `true` if `shutdown` resolved first.
async fn interrupted<F>(duration: Duration, shutdown: Pin<&mut F>) -> bool
where
    F: Future<Output = ()>,
{
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = shutdown => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone};
    use serde_json::json;

    use db::{NewRun, RunType};
    use tasks::mock::MockTask;

    use crate::cron::CronSchedule;
    use crate::executor::ExecutorConfig;
    use crate::models::TaskDefinition;

    fn utc(y: i32, mo: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, 0, 0, 0).unwrap()
    }

    async fn executor() -> PipelineExecutor {
        let pool = db::pool::in_memory().await.unwrap();
        PipelineExecutor::new(pool, ExecutorConfig::default())
    }

    fn daily(catchup: bool) -> Pipeline {
        let mut p = Pipeline::chain("nightly", vec![TaskDefinition::new("only", "true")]);
        p.schedule = Some(CronSchedule::parse("0 0 * * *").unwrap());
        p.start_date = utc(2025, 1, 1);
        p.catchup = catchup;
        p
    }

    fn registry(task: &Arc<MockTask>) -> TaskRegistry {
        let mut registry = TaskRegistry::new();
        registry.register("only", Arc::clone(task) as Arc<dyn tasks::ExecutableTask>);
        registry
    }

    #[tokio::test]
    async fn unscheduled_pipeline_is_rejected() {
        let mut pipeline = daily(false);
        pipeline.schedule = None;
        let err = Scheduler::new(executor().await, pipeline, TaskRegistry::new())
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::Unscheduled(ref id) if id == "nightly"));
    }

    #[tokio::test]
    async fn catchup_replays_every_interval_until_end_date() {
        let exec = executor().await;
        let mut pipeline = daily(true);
        pipeline.end_date = Some(utc(2025, 1, 3));
        let task = Arc::new(MockTask::returning("only", json!({})));

        let scheduler = Scheduler::new(exec.clone(), pipeline, registry(&task)).unwrap();
        let exit = scheduler.run_until(std::future::pending()).await.unwrap();

        assert_eq!(exit, SchedulerExit::Exhausted);
        assert_eq!(task.call_count(), 3);

        let mut ids: Vec<_> = runs::list_runs(exec.pool(), "nightly", 10)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.run_id)
            .collect();
        ids.sort();
        assert_eq!(
            ids,
            [
                "scheduled__2025-01-01T00:00:00+00:00",
                "scheduled__2025-01-02T00:00:00+00:00",
                "scheduled__2025-01-03T00:00:00+00:00",
            ]
        );
    }

    #[tokio::test]
    async fn without_catchup_only_the_latest_interval_runs() {
        let exec = executor().await;
        let task = Arc::new(MockTask::returning("only", json!({})));

        let scheduler = Scheduler::new(exec.clone(), daily(false), registry(&task)).unwrap();
        let exit = scheduler
            .run_until(tokio::time::sleep(Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(exit, SchedulerExit::Shutdown);
        assert_eq!(task.call_count(), 1);

        let rows = runs::list_runs(exec.pool(), "nightly", 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].state, "success");
        assert!(rows[0].logical_date > utc(2025, 1, 1));
    }

    #[tokio::test]
    async fn engine_errors_do_not_stop_the_scheduler() {
        let exec = executor().await;
        let mut pipeline = daily(true);
        pipeline.end_date = Some(utc(2025, 1, 2));
        let mut registry = TaskRegistry::new();
        registry.register(
            "only",
            Arc::new(crate::executor_tests::DropsAttemptTable { pool: exec.pool().clone() }),
        );

        let scheduler = Scheduler::new(exec.clone(), pipeline, registry)
            .unwrap()
            .with_error_backoff(Duration::from_millis(10));
        let exit = scheduler.run_until(std::future::pending()).await.unwrap();

        assert_eq!(exit, SchedulerExit::Exhausted);
        let rows = runs::list_runs(exec.pool(), "nightly", 10).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.state == "failed"));
    }

    #[tokio::test]
    async fn error_backoff_is_interrupted_by_shutdown() {
        let exec = executor().await;
        let mut registry = TaskRegistry::new();
        registry.register(
            "only",
            Arc::new(crate::executor_tests::DropsAttemptTable { pool: exec.pool().clone() }),
        );

        let scheduler = Scheduler::new(exec.clone(), daily(false), registry)
            .unwrap()
            .with_error_backoff(Duration::from_secs(3600));
        let exit = tokio::time::timeout(
            Duration::from_secs(5),
            scheduler.run_until(tokio::time::sleep(Duration::from_millis(300))),
        )
        .await
        .expect("shutdown should cut the backoff short")
        .unwrap();

        assert_eq!(exit, SchedulerExit::Shutdown);
    }

    #[tokio::test]
    async fn abandoned_runs_are_failed_on_start() {
        let exec = executor().await;
        let orphan = runs::create_run(
            exec.pool(),
            &NewRun {
                pipeline_id: "nightly".into(),
                run_id: "scheduled__2025-01-01T00:00:00+00:00".into(),
                run_type: RunType::Scheduled,
                logical_date: utc(2025, 1, 1),
                data_interval_start: utc(2025, 1, 1),
                data_interval_end: utc(2025, 1, 2),
            },
        )
        .await
        .unwrap();

        let mut pipeline = daily(true);
        pipeline.end_date = Some(utc(2025, 1, 1));
        let task = Arc::new(MockTask::returning("only", json!({})));

        let scheduler = Scheduler::new(exec.clone(), pipeline, registry(&task)).unwrap();
        let exit = scheduler.run_until(std::future::pending()).await.unwrap();

        assert_eq!(exit, SchedulerExit::Exhausted);
        assert_eq!(task.call_count(), 0);
        let stored = runs::get_run(exec.pool(), "nightly", &orphan.run_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.state, "failed");
    }
}
