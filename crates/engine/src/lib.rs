//! `engine` crate: pipeline models, DAG validation, cron scheduling, and the execution engine.

pub mod models;
pub mod error;
pub mod dag;
pub mod cron;
pub mod planner;
pub mod registry;
pub mod executor;
pub mod scheduler;

pub use models::{Pipeline, TaskDefinition, Edge, DefaultArgs, RetryPolicy};
pub use error::EngineError;
pub use dag::validate_dag;
pub use cron::CronSchedule;
pub use planner::{next_data_interval, DataInterval};
pub use registry::TaskRegistry;
pub use executor::{ExecutorConfig, PipelineExecutor, RunReport, RunRequest, TaskReport};
pub use scheduler::{Scheduler, SchedulerExit};
