//! `pipeline-runner` CLI entry-point.
//!
//! Available sub-commands:
//! - `validate`: check a pipeline definition and show its execution order.
//! - `next`: list upcoming fire times.
//! - `run`: trigger a manual run now.
//! - `schedule`: run the pipeline on its cron schedule until Ctrl-C.
//! - `history`: show recent runs and their task states.
//! - `test-task`: execute a single task once, recording nothing.
//! - `migrate`: run pending database migrations.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, SubsecRound, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use db::repository::{runs, task_instances};
use db::{DbPool, RunState};
use engine::{
    validate_dag, ExecutorConfig, Pipeline, PipelineExecutor, RunRequest, Scheduler,
    SchedulerExit, TaskRegistry,
};

#[derive(Parser)]
#[command(
    name = "pipeline-runner",
    about = "Cron-scheduled runner for sequential shell pipelines",
    version
)]
struct Cli {
    /// Run-history database.
    #[arg(long, global = true, env = "DATABASE_URL", default_value = "sqlite://pipeline-runner.db")]
    database_url: String,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a pipeline definition JSON file.
    Validate {
        /// Path to the pipeline JSON file.
        path: PathBuf,
    },
    /// Show the next fire times of a pipeline's schedule.
    Next {
        path: PathBuf,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
    /// Trigger a manual run immediately.
    Run {
        path: PathBuf,
        /// Logical date of the run (RFC 3339). Defaults to now.
        #[arg(long)]
        logical_date: Option<DateTime<Utc>>,
    },
    /// Run the pipeline on its schedule until interrupted.
    Schedule { path: PathBuf },
    /// Show recent runs of a pipeline.
    History {
        pipeline_id: String,
        #[arg(long, default_value_t = 10)]
        limit: u32,
    },
    /// Execute one task once without recording any state.
    TestTask {
        path: PathBuf,
        task_id: String,
        /// Logical date exposed to the task (RFC 3339). Defaults to now.
        #[arg(long)]
        logical_date: Option<DateTime<Utc>>,
    },
    /// Run pending database migrations.
    Migrate,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Validate { path } => {
            let pipeline = load_pipeline(&path)?;
            let order = validate_dag(&pipeline)
                .with_context(|| format!("pipeline '{}' is invalid", pipeline.id))?;

            println!("Pipeline '{}' is valid (owner: {}).", pipeline.id, pipeline.owner());
            println!("Execution order: {}", order.join(" >> "));
            match &pipeline.schedule {
                Some(schedule) => {
                    println!("Schedule: {schedule} (catchup: {})", pipeline.catchup);
                    for at in schedule.upcoming(Utc::now().max(pipeline.start_date), 3) {
                        println!("  next: {}", at.to_rfc3339());
                    }
                }
                None => println!("Schedule: none (manual runs only)"),
            }
        }

        Command::Next { path, count } => {
            let pipeline = load_pipeline(&path)?;
            let Some(schedule) = &pipeline.schedule else {
                bail!("pipeline '{}' has no schedule", pipeline.id);
            };
            for at in schedule.upcoming(Utc::now().max(pipeline.start_date), count) {
                println!("{}", at.to_rfc3339());
            }
        }

        Command::Run { path, logical_date } => {
            let pipeline = load_pipeline(&path)?;
            let pool = connect(&cli.database_url).await?;
            let executor = PipelineExecutor::new(pool, ExecutorConfig::default());
            let registry = TaskRegistry::from_pipeline(&pipeline);
            let logical_date = logical_date.unwrap_or_else(|| Utc::now().trunc_subsecs(0));

            let request = RunRequest::manual(logical_date);
            let run_id = request.run_id.clone();

            // Tasks run in their own process groups, so Ctrl-C has to be
            // relayed by dropping the run.
            let report = tokio::select! {
                report = executor.run(&pipeline, &registry, request) => {
                    report.with_context(|| format!("could not run pipeline '{}'", pipeline.id))?
                }
                _ = shutdown_signal() => {
                    warn!("interrupted, run {run_id} abandoned");
                    close_interrupted_run(executor.pool(), &pipeline.id, &run_id).await?;
                    return Ok(ExitCode::from(130));
                }
            };

            println!("Run {}: {}", report.run_id, report.state);
            for task in &report.tasks {
                match &task.error {
                    Some(error) => println!("  {:<24} {:<16} tries={} {}", task.task_id, task.state, task.tries, error),
                    None => println!("  {:<24} {:<16} tries={}", task.task_id, task.state, task.tries),
                }
            }
            if !report.succeeded() {
                return Ok(ExitCode::FAILURE);
            }
        }

        Command::Schedule { path } => {
            let pipeline = load_pipeline(&path)?;
            let pool = connect(&cli.database_url).await?;
            let registry = TaskRegistry::from_pipeline(&pipeline);
            let executor = PipelineExecutor::new(pool, ExecutorConfig::default());
            let scheduler = Scheduler::new(executor, pipeline, registry)?;

            match scheduler.run_until(shutdown_signal()).await? {
                SchedulerExit::Shutdown => info!("scheduler stopped"),
                SchedulerExit::Exhausted => info!("pipeline end_date reached, nothing left to schedule"),
            }
        }

        Command::History { pipeline_id, limit } => {
            let pool = connect(&cli.database_url).await?;
            print_history(&pool, &pipeline_id, limit).await?;
        }

        Command::TestTask { path, task_id, logical_date } => {
            let pipeline = load_pipeline(&path)?;
            // Nothing is recorded, so no database file is touched.
            let pool = db::pool::in_memory().await.context("cannot open scratch database")?;
            let executor = PipelineExecutor::new(pool, ExecutorConfig::default());
            let registry = TaskRegistry::from_pipeline(&pipeline);
            let logical_date = logical_date.unwrap_or_else(|| Utc::now().trunc_subsecs(0));

            let outcome = tokio::select! {
                outcome = executor.test_task(&pipeline, &registry, &task_id, logical_date) => outcome?,
                _ = shutdown_signal() => {
                    warn!("interrupted, task '{task_id}' abandoned");
                    return Ok(ExitCode::from(130));
                }
            };

            match outcome {
                Ok(output) => println!("{}", serde_json::to_string_pretty(&output)?),
                Err(e) => {
                    eprintln!("Task '{task_id}' did not succeed: {e}");
                    return Ok(ExitCode::FAILURE);
                }
            }
        }

        Command::Migrate => {
            info!("Running migrations against {}", cli.database_url);
            let pool = db::pool::create_pool(&cli.database_url, 2)
                .await
                .context("failed to connect to database")?;
            db::pool::run_migrations(&pool).await.context("migration failed")?;
            info!("Migrations applied successfully");
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn load_pipeline(path: &Path) -> Result<Pipeline> {
    Pipeline::from_path(path).with_context(|| format!("cannot load pipeline from {}", path.display()))
}

/// Open the history database and bring its schema up to date.
async fn connect(database_url: &str) -> Result<DbPool> {
    let pool = db::pool::create_pool(database_url, 5)
        .await
        .with_context(|| format!("failed to connect to {database_url}"))?;
    db::pool::run_migrations(&pool).await.context("migration failed")?;
    Ok(pool)
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl-C"),
        Err(e) => {
            warn!("cannot listen for Ctrl-C ({e}); the scheduler will run until killed");
            std::future::pending::<()>().await;
        }
    }
}

/// Mark a manual run dropped mid-flight as failed.
async fn close_interrupted_run(pool: &DbPool, pipeline_id: &str, run_id: &str) -> Result<()> {
    if let Some(run) = runs::get_run(pool, pipeline_id, run_id).await? {
        if run.state == RunState::Running.as_str() {
            runs::finish_run(pool, run.id, RunState::Failed).await?;
        }
    }
    Ok(())
}

async fn print_history(pool: &DbPool, pipeline_id: &str, limit: u32) -> Result<()> {
    let rows = runs::list_runs(pool, pipeline_id, limit).await?;
    if rows.is_empty() {
        println!("No runs recorded for '{pipeline_id}'.");
        return Ok(());
    }

    for run in rows {
        let finished = run
            .finished_at
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "-".into());
        println!(
            "{}  {:<9} {:<8} started={} finished={}",
            run.run_id,
            run.run_type,
            run.state,
            run.started_at.to_rfc3339(),
            finished
        );

        for attempt in task_instances::list_task_instances(pool, run.id).await? {
            let detail = attempt.error.as_deref().unwrap_or("");
            println!(
                "    {:<24} try={} {:<16} {}",
                attempt.task_id, attempt.try_number, attempt.state, detail
            );
        }
    }
    Ok(())
}
